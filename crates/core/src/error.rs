//! User-facing error taxonomy.
//!
//! Every user action (submit, start, stop) resolves to at most one
//! `ActionError`, whose [`ActionError::user_message`] is the single line shown
//! on the error banner.

use thiserror::Error;

use crate::api::ApiError;
use crate::upload::MediaKind;

/// Input rejected before anything is sent to the service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Please select {} file.", .kind.with_article())]
    NoFileSelected { kind: MediaKind },

    #[error("The selected file '{0}' is empty.")]
    EmptyFile(String),

    #[error("File type not supported for {kind}: {file_name}")]
    UnsupportedType { file_name: String, kind: MediaKind },

    #[error("Confidence threshold must be between 0 and 1, got {0}")]
    ConfidenceOutOfRange(f32),
}

/// Check a confidence threshold chosen by the user.
pub fn validate_confidence(confidence: f32) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ValidationError::ConfidenceOutOfRange(confidence))
    }
}

/// Errors surfaced by orchestrator actions.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Rejected locally, never sent to the service.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request did not complete.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered `success: false`.
    #[error("{message}")]
    Server { message: String },

    /// The video job reported `failed` (or its status check failed).
    #[error("job failed: {message}")]
    JobFailure { message: String },

    /// The channel dropped while a session was live.
    #[error("stream channel disconnected")]
    StreamDisconnect,

    /// The action conflicts with work already in progress.
    #[error("busy: {0}")]
    Busy(String),

    /// A newer submission replaced this one before it started polling.
    #[error("superseded by a newer submission")]
    Superseded,
}

impl ActionError {
    /// The single line shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            ActionError::Validation(e) => e.to_string(),
            ActionError::Network(_) => {
                "Request failed. Check the connection to the service and try again.".to_string()
            }
            ActionError::Server { message } => message.clone(),
            ActionError::JobFailure { message } => message.clone(),
            ActionError::StreamDisconnect => {
                "Connection lost. Start the stream again to continue.".to_string()
            }
            ActionError::Busy(what) => what.clone(),
            ActionError::Superseded => "Superseded by a newer submission.".to_string(),
        }
    }

    /// Whether the failure happened before anything reached the service.
    pub fn is_validation(&self) -> bool {
        matches!(self, ActionError::Validation(_))
    }
}

impl From<ApiError> for ActionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Server { message, .. } => ActionError::Server { message },
            other => ActionError::Network(other.to_string()),
        }
    }
}
