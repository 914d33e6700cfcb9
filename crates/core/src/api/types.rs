//! Wire types of the media-analysis service.

use serde::{Deserialize, Serialize};

use super::ApiError;

/// Response envelope shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    /// Successful envelope carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed envelope carrying a message.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: Some(code.to_string()),
                message: message.into(),
            }),
        }
    }

    /// Unwrap the payload, turning `success: false` into [`ApiError::Server`].
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(self.into_server_error());
        }
        self.data
            .ok_or_else(|| ApiError::Decode("response is missing 'data'".to_string()))
    }

    /// Check the `success` flag only; the payload (if any) is ignored.
    pub fn into_ack(self) -> Result<(), ApiError> {
        if self.success {
            Ok(())
        } else {
            Err(self.into_server_error())
        }
    }

    fn into_server_error(self) -> ApiError {
        match self.error {
            Some(body) => ApiError::Server {
                code: body.code,
                message: body.message,
            },
            None => ApiError::Server {
                code: None,
                message: "Unknown error".to_string(),
            },
        }
    }
}

/// Error body of a failed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Result of `POST /api/v1/detect/image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetection {
    pub processed_image_url: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Seconds spent by the service.
    pub processing_time: f64,
}

/// Result of `POST /api/v1/detect/video`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTaskAccepted {
    pub task_id: String,
}

/// Status of a video job as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted but not started. The service reports this as "pending".
    #[serde(alias = "pending")]
    Queued,
    Processing,
    Completed,
    Failed,
    /// Any status this client does not know.
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Returns the string representation for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Result of `GET /api/v1/detect/video/status/{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStatus {
    pub status: JobStatus,
    /// Percentage in [0, 100].
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<VideoResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoStatus {
    pub fn processing(progress: f64) -> Self {
        Self {
            status: JobStatus::Processing,
            progress,
            result: None,
            error: None,
        }
    }

    pub fn completed(result: VideoResult) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: 100.0,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: 0.0,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a completed video job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResult {
    /// Seconds spent by the service.
    pub processing_time: f64,
    pub frames_processed: u64,
    /// Reference to the processed artifact, usually a path on the service.
    pub output_video_url: String,
}

/// Result of `POST /api/v1/stream/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStarted {
    pub stream_id: String,
}

/// Result of `GET /api/v1/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}
