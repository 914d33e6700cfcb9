use async_trait::async_trait;

use crate::upload::PendingUpload;

use super::{
    ApiError, Beacon, HealthStatus, ImageDetection, StreamStarted, VideoStatus, VideoTaskAccepted,
};

/// The media-analysis service as seen by the orchestrators.
///
/// `HttpMediaService` talks to a real service; `testing::MockMediaService`
/// scripts responses for tests.
#[async_trait]
pub trait MediaService: Send + Sync {
    /// `GET /api/v1/health`
    async fn health(&self) -> Result<HealthStatus, ApiError>;

    /// `POST /api/v1/cleanup` - release temporary server-side resources.
    async fn cleanup(&self) -> Result<(), ApiError>;

    /// `POST /api/v1/detect/image`
    async fn detect_image(
        &self,
        upload: &PendingUpload,
        confidence: f32,
    ) -> Result<ImageDetection, ApiError>;

    /// `POST /api/v1/detect/video`
    async fn submit_video(
        &self,
        upload: &PendingUpload,
        confidence: f32,
        save_output: bool,
    ) -> Result<VideoTaskAccepted, ApiError>;

    /// `GET /api/v1/detect/video/status/{task_id}`
    async fn video_status(&self, task_id: &str) -> Result<VideoStatus, ApiError>;

    /// `POST /api/v1/stream/start`
    async fn start_stream(&self, confidence: f32) -> Result<StreamStarted, ApiError>;

    /// `POST /api/v1/stream/stop/{stream_id}`
    async fn stop_stream(&self, stream_id: &str) -> Result<(), ApiError>;

    /// Download a processed artifact by the reference the service returned.
    async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, ApiError>;

    /// Queue a fire-and-forget request.
    ///
    /// Never blocks and never reports the outcome of the request itself.
    /// Returns `false` when the beacon could not be queued, in which case the
    /// caller may fall back to [`super::dispatch_detached`].
    fn send_beacon(&self, beacon: Beacon) -> bool;
}
