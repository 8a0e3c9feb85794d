use thiserror::Error;

/// Substrings the remote service uses when it rejects submitted content.
const VALIDATION_MARKERS: &[&str] = &["profanity", "inappropriate"];

/// Failure of a remote call, classified for presentation.
///
/// Stored on errored cache entries and shared between readers of the same
/// in-flight fetch, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The call could not complete (network, session not ready, server fault).
    #[error("{0}")]
    Transport(String),

    /// The service rejected the submitted content.
    #[error("{0}")]
    Validation(String),
}

/// Where the UI should surface a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisplay {
    /// Next to the offending field; the user is expected to fix and resubmit.
    Inline(String),
    /// Transient, generic notification.
    Notification(String),
}

impl ServiceError {
    /// Classify a raw message by looking for a validation marker.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if VALIDATION_MARKERS.iter().any(|m| lowered.contains(m)) {
            ServiceError::Validation(message)
        } else {
            ServiceError::Transport(message)
        }
    }

    /// Classify an error coming back from the remote boundary.
    ///
    /// Context added by transport code wraps the service's message, so the
    /// whole chain is inspected.
    pub fn from_remote(err: &anyhow::Error) -> Self {
        let message = err
            .chain()
            .map(|cause| cause.to_string())
            .collect::<Vec<_>>()
            .join(": ");
        Self::classify(message)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ServiceError::Validation(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Transport(m) | ServiceError::Validation(m) => m,
        }
    }

    pub fn display(&self) -> ErrorDisplay {
        match self {
            ServiceError::Validation(m) => ErrorDisplay::Inline(m.clone()),
            ServiceError::Transport(m) => ErrorDisplay::Notification(m.clone()),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::from_remote(&err)
    }
}
