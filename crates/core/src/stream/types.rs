//! Types for the live stream orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::Detection;

/// Errors opening or speaking the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One server-pushed frame update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Session the frame belongs to. Older services omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Base64 JPEG, possibly with a data-URL prefix.
    pub frame: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Server time in seconds since the epoch. Not displayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// Payload of an `error` event: a bare string or `{code, message}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Message(String),
    Detailed {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Message(message) => message,
            ErrorPayload::Detailed { message, .. } => message,
        }
    }
}

/// Inbound channel event, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The namespace was joined.
    Connected,
    Frame(FrameEvent),
    /// The service reported an error on the channel.
    Error(String),
    /// The channel is gone. No further events follow.
    Disconnected(String),
}

/// The server-side session this client owns.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub stream_id: String,
    /// Fixed for the lifetime of the session.
    pub confidence_threshold: f32,
    pub started_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(stream_id: impl Into<String>, confidence_threshold: f32) -> Self {
        Self {
            stream_id: stream_id.into(),
            confidence_threshold,
            started_at: Utc::now(),
        }
    }
}

/// Lifecycle of the stream session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Start request in flight.
    Starting { confidence_threshold: f32 },
    Live(StreamSession),
    /// Stop request in flight. `was_live` restores the live surface if it fails.
    Stopping {
        session: StreamSession,
        was_live: bool,
    },
    /// The channel dropped. The server session, if any, was never stopped.
    Disconnected { orphan: Option<StreamSession> },
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Live(_))
    }

    /// The session ID a stop would be addressed to.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            SessionState::Live(session) | SessionState::Stopping { session, .. } => {
                Some(&session.stream_id)
            }
            SessionState::Disconnected {
                orphan: Some(session),
            } => Some(&session.stream_id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting { .. } => "starting",
            SessionState::Live(_) => "live",
            SessionState::Stopping { .. } => "stopping",
            SessionState::Disconnected { .. } => "disconnected",
        }
    }
}
