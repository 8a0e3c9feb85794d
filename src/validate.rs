//! Input checks applied before a write leaves the client.

use crate::blob::ExternalBlob;
use crate::error::ServiceError;
use crate::service::UserProfile;

/// Normalize a profile for saving: trims text fields, requires a username.
pub fn profile(mut profile: UserProfile) -> Result<UserProfile, ServiceError> {
    profile.username = profile.username.trim().to_string();
    profile.bio = profile.bio.trim().to_string();

    if profile.username.is_empty() {
        return Err(ServiceError::Validation("Username is required".to_string()));
    }
    if let Some(content_type) = profile.profile_picture.as_ref().and_then(ExternalBlob::content_type) {
        if !content_type.starts_with("image/") {
            return Err(ServiceError::Validation(format!(
                "Profile picture must be an image, got {}",
                content_type
            )));
        }
    }
    Ok(profile)
}

/// Normalize a reel upload, returning the trimmed description.
pub fn reel_upload(video: &ExternalBlob, description: &str) -> Result<String, ServiceError> {
    if let Some(content_type) = video.content_type() {
        if !content_type.starts_with("video/") {
            return Err(ServiceError::Validation(format!(
                "Please select a valid video file, got {}",
                content_type
            )));
        }
    }
    Ok(description.trim().to_string())
}
