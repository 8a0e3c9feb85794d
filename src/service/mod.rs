pub mod gateway;

#[cfg(test)]
pub(crate) mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blob::ExternalBlob;

/// An authenticated principal, in its canonical textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Surrounding whitespace is not part of a principal.
    pub fn new(text: impl AsRef<str>) -> Self {
        Identity(text.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let identity = Identity::new(s);
        if identity.0.is_empty() {
            return Err(anyhow::anyhow!("Empty principal"));
        }
        Ok(identity)
    }
}

pub type ReelId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    pub bio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<ExternalBlob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reel {
    pub id: ReelId,
    pub video: ExternalBlob,
    pub description: String,
    pub uploader: Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
    Guest,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
            UserRole::Guest => write!(f, "guest"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            "guest" => Ok(UserRole::Guest),
            _ => Err(anyhow::anyhow!("Unknown user role: {}", s)),
        }
    }
}

/// The remote social-graph and content service.
///
/// Pull-only: every read is a query, every write is fire-and-forget with no
/// change notification. Callers own cache coherence. Rejected content comes
/// back as an error whose message carries a validation marker.
#[async_trait]
pub trait RemoteService: Send + Sync {
    // === Profiles ===

    /// Profile of the authenticated caller; `None` until one is saved.
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>>;

    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()>;

    async fn get_user_profile(&self, user: &Identity) -> Result<Option<UserProfile>>;

    // === Reels ===

    async fn upload_reel(&self, video: ExternalBlob, description: &str) -> Result<ReelId>;

    async fn get_all_reels(&self) -> Result<Vec<Reel>>;

    /// Reels personalized for the caller.
    async fn get_feed(&self) -> Result<Vec<Reel>>;

    async fn get_reels_by_uploader(&self, uploader: &Identity) -> Result<Vec<Reel>>;

    async fn get_reel(&self, id: ReelId) -> Result<Reel>;

    // === Social graph ===

    async fn follow_user(&self, user: &Identity) -> Result<()>;

    async fn unfollow_user(&self, user: &Identity) -> Result<()>;

    async fn get_followers(&self, user: &Identity) -> Result<Vec<Identity>>;

    async fn get_following(&self, user: &Identity) -> Result<Vec<Identity>>;

    async fn get_follower_count(&self, user: &Identity) -> Result<u64>;

    async fn get_following_count(&self, user: &Identity) -> Result<u64>;

    // === Roles ===

    async fn get_caller_user_role(&self) -> Result<UserRole>;

    async fn is_caller_admin(&self) -> Result<bool>;

    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()>;
}

pub use gateway::GatewayClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_trimmed() {
        assert_eq!(Identity::new("  aaaaa-aa \n"), Identity::new("aaaaa-aa"));
        assert!("   ".parse::<Identity>().is_err());
    }

    #[test]
    fn test_user_role_parsing() {
        assert_eq!("Admin".parse::<UserRole>().unwrap(), UserRole::Admin);
        assert_eq!("guest".parse::<UserRole>().unwrap(), UserRole::Guest);
        assert!("root".parse::<UserRole>().is_err());
        assert_eq!(UserRole::User.to_string(), "user");
    }

    #[test]
    fn test_profile_wire_shape() {
        let profile = UserProfile {
            username: "ana".to_string(),
            bio: "hi".to_string(),
            profile_picture: Some(ExternalBlob::from_url("https://blobs.example/p/1")),
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["profilePicture"], "https://blobs.example/p/1");

        let bare: UserProfile =
            serde_json::from_str(r#"{"username":"bo","bio":""}"#).unwrap();
        assert!(bare.profile_picture.is_none());
    }
}
