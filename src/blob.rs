//! References to remotely hosted blobs (videos, profile pictures).
//!
//! A blob is either already hosted (a stable URL usable for playback and
//! display) or a local byte buffer that the gateway uploads before the
//! operation that references it. Upload progress is threaded to the caller
//! as a 0-100 percentage; the transport itself lives in the gateway.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone)]
enum BlobSource {
    Url(String),
    Bytes(Arc<Vec<u8>>),
}

#[derive(Clone)]
pub struct ExternalBlob {
    source: BlobSource,
    content_type: Option<String>,
    progress: Option<ProgressReporter>,
}

impl ExternalBlob {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source: BlobSource::Url(url.into()),
            content_type: None,
            progress: None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            source: BlobSource::Bytes(Arc::new(bytes)),
            content_type: None,
            progress: None,
        }
    }

    /// MIME type of the payload, e.g. `video/mp4`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Register a callback invoked with the upload percentage (0-100).
    pub fn with_upload_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.progress = Some(ProgressReporter::new(Arc::new(on_progress)));
        self
    }

    /// Stable URL, once hosted.
    pub fn direct_url(&self) -> Option<&str> {
        match &self.source {
            BlobSource::Url(url) => Some(url),
            BlobSource::Bytes(_) => None,
        }
    }

    /// Local payload still waiting to be uploaded.
    pub fn pending_bytes(&self) -> Option<&[u8]> {
        match &self.source {
            BlobSource::Url(_) => None,
            BlobSource::Bytes(bytes) => Some(bytes),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self.source, BlobSource::Url(_))
    }

    /// Forward an upload percentage to the registered callback.
    ///
    /// Values are clamped to 100 and never reported twice or out of order.
    pub(crate) fn report_progress(&self, percentage: u8) {
        if let Some(progress) = &self.progress {
            progress.report(percentage.min(100));
        }
    }

    /// The hosted form of this blob, keeping its content type.
    pub(crate) fn hosted_at(&self, url: String) -> Self {
        Self {
            source: BlobSource::Url(url),
            content_type: self.content_type.clone(),
            progress: None,
        }
    }
}

impl PartialEq for ExternalBlob {
    fn eq(&self, other: &Self) -> bool {
        match (&self.source, &other.source) {
            (BlobSource::Url(a), BlobSource::Url(b)) => a == b,
            (BlobSource::Bytes(a), BlobSource::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ExternalBlob {}

impl fmt::Debug for ExternalBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            BlobSource::Url(url) => f.debug_tuple("ExternalBlob::Url").field(url).finish(),
            BlobSource::Bytes(bytes) => f
                .debug_struct("ExternalBlob::Bytes")
                .field("len", &bytes.len())
                .field("content_type", &self.content_type)
                .finish(),
        }
    }
}

// On the wire a blob is its URL; local bytes must be uploaded first.
impl Serialize for ExternalBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.source {
            BlobSource::Url(url) => serializer.serialize_str(url),
            BlobSource::Bytes(_) => Err(serde::ser::Error::custom(
                "blob bytes must be uploaded before the blob is referenced",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for ExternalBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        Ok(ExternalBlob::from_url(url))
    }
}

#[derive(Clone)]
struct ProgressReporter {
    callback: ProgressCallback,
    last: Arc<Mutex<Option<u8>>>,
}

impl ProgressReporter {
    fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            last: Arc::new(Mutex::new(None)),
        }
    }

    fn report(&self, percentage: u8) {
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*last, Some(prev) if prev >= percentage) {
                return;
            }
            *last = Some(percentage);
        }
        (self.callback)(percentage);
    }
}
