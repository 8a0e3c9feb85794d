//! HTTP/JSON gateway to the remote service.
//!
//! Every remote operation is `POST {url}/api/{method}` with a JSON array of
//! positional arguments; the response body is the JSON-encoded result. Blob
//! payloads are streamed to `POST {url}/blobs` beforehand, which answers
//! `{"url": ...}`. Rejections come back as non-2xx responses whose body (or
//! its `error` field) is the service's message, passed through verbatim so
//! that validation markers survive.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream;
use reqwest::{header, Body, Client as HttpClient, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Identity, Reel, ReelId, RemoteService, UserProfile, UserRole};
use crate::blob::ExternalBlob;
use crate::config::GatewayConfig;

const MIN_CHUNK_BYTES: usize = 1024;

#[derive(Debug, Deserialize)]
struct BlobUploadResponse {
    url: String,
}

pub struct GatewayClient {
    http: HttpClient,
    base_url: String,
    auth_token: Option<String>,
    chunk_bytes: usize,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            chunk_bytes: config.upload_chunk_bytes.max(MIN_CHUNK_BYTES),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, method: &str, args: Value) -> Result<Response> {
        let url = format!("{}/api/{}", self.base_url, method);
        tracing::trace!(method, "gateway call");

        let resp = self
            .authorize(self.http.post(&url).json(&args))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", method))?;

        Self::check(resp).await
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, args: Value) -> Result<R> {
        self.send(method, args)
            .await?
            .json::<R>()
            .await
            .with_context(|| format!("Failed to decode {} response", method))
    }

    /// Call an operation whose result carries no data.
    async fn call_unit(&self, method: &str, args: Value) -> Result<()> {
        self.send(method, args).await.map(|_| ())
    }

    /// Turn a non-2xx response into an error carrying the service's message.
    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);

        if message.trim().is_empty() {
            Err(anyhow!("Remote call failed with status: {}", status))
        } else {
            Err(anyhow!(message))
        }
    }

    /// Host `blob` if it is still local bytes, reporting progress per chunk.
    async fn ensure_hosted(&self, blob: &ExternalBlob) -> Result<ExternalBlob> {
        let Some(bytes) = blob.pending_bytes() else {
            return Ok(blob.clone());
        };

        let total = bytes.len();
        let chunks: Vec<Vec<u8>> = bytes.chunks(self.chunk_bytes).map(<[u8]>::to_vec).collect();
        blob.report_progress(0);

        let reporter = blob.clone();
        let mut sent = 0usize;
        let body = stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len();
            // Hold 100 back until the server has acknowledged the blob.
            let percentage = (sent * 100 / total.max(1)).min(99) as u8;
            reporter.report_progress(percentage);
            Ok::<_, std::io::Error>(chunk)
        }));

        let mut request = self
            .http
            .post(format!("{}/blobs", self.base_url))
            .header(header::CONTENT_LENGTH, total)
            .body(Body::wrap_stream(body));
        if let Some(content_type) = blob.content_type() {
            request = request.header(header::CONTENT_TYPE, content_type);
        }

        let resp = self
            .authorize(request)
            .send()
            .await
            .context("Blob upload failed")?;
        let uploaded: BlobUploadResponse = Self::check(resp)
            .await?
            .json()
            .await
            .context("Failed to decode blob upload response")?;

        blob.report_progress(100);
        tracing::debug!(url = %uploaded.url, bytes = total, "blob uploaded");
        Ok(blob.hosted_at(uploaded.url))
    }
}

#[async_trait]
impl RemoteService for GatewayClient {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>> {
        self.call("getCallerUserProfile", json!([])).await
    }

    async fn save_caller_user_profile(&self, mut profile: UserProfile) -> Result<()> {
        if let Some(picture) = profile.profile_picture.take() {
            profile.profile_picture = Some(self.ensure_hosted(&picture).await?);
        }
        let profile = serde_json::to_value(&profile).context("Failed to encode profile")?;
        self.call_unit("saveCallerUserProfile", json!([profile])).await
    }

    async fn get_user_profile(&self, user: &Identity) -> Result<Option<UserProfile>> {
        self.call("getUserProfile", json!([user])).await
    }

    async fn upload_reel(&self, video: ExternalBlob, description: &str) -> Result<ReelId> {
        let video = self.ensure_hosted(&video).await?;
        let video = serde_json::to_value(&video).context("Failed to encode video reference")?;
        self.call("uploadReel", json!([video, description])).await
    }

    async fn get_all_reels(&self) -> Result<Vec<Reel>> {
        self.call("getAllReels", json!([])).await
    }

    async fn get_feed(&self) -> Result<Vec<Reel>> {
        self.call("getFeed", json!([])).await
    }

    async fn get_reels_by_uploader(&self, uploader: &Identity) -> Result<Vec<Reel>> {
        self.call("getReelsByUploader", json!([uploader])).await
    }

    async fn get_reel(&self, id: ReelId) -> Result<Reel> {
        self.call("getReel", json!([id])).await
    }

    async fn follow_user(&self, user: &Identity) -> Result<()> {
        self.call_unit("followUser", json!([user])).await
    }

    async fn unfollow_user(&self, user: &Identity) -> Result<()> {
        self.call_unit("unfollowUser", json!([user])).await
    }

    async fn get_followers(&self, user: &Identity) -> Result<Vec<Identity>> {
        self.call("getFollowers", json!([user])).await
    }

    async fn get_following(&self, user: &Identity) -> Result<Vec<Identity>> {
        self.call("getFollowing", json!([user])).await
    }

    async fn get_follower_count(&self, user: &Identity) -> Result<u64> {
        self.call("getFollowerCount", json!([user])).await
    }

    async fn get_following_count(&self, user: &Identity) -> Result<u64> {
        self.call("getFollowingCount", json!([user])).await
    }

    async fn get_caller_user_role(&self) -> Result<UserRole> {
        self.call("getCallerUserRole", json!([])).await
    }

    async fn is_caller_admin(&self) -> Result<bool> {
        self.call("isCallerAdmin", json!([])).await
    }

    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()> {
        self.call_unit("assignCallerUserRole", json!([user, role])).await
    }
}
