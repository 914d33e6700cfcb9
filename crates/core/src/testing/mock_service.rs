//! Mock media-analysis service for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{
    ApiError, Beacon, HealthStatus, ImageDetection, MediaService, StreamStarted, VideoStatus,
    VideoTaskAccepted,
};
use crate::upload::PendingUpload;

/// A recorded service call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Health,
    Cleanup,
    DetectImage { file_name: String, confidence: f32 },
    SubmitVideo {
        file_name: String,
        confidence: f32,
        save_output: bool,
    },
    VideoStatus { task_id: String },
    StartStream { confidence: f32 },
    StopStream { stream_id: String },
    FetchArtifact { reference: String },
}

type CallMatcher = Box<dyn Fn(&RecordedCall) -> bool + Send>;

struct MockState {
    calls: Vec<RecordedCall>,
    beacons: Vec<Beacon>,
    /// Fails the next call of any kind.
    next_error: Option<ApiError>,
    /// Fails the next call matching the predicate.
    targeted_errors: Vec<(CallMatcher, ApiError)>,
    statuses: VecDeque<Result<VideoStatus, ApiError>>,
    last_status: Option<VideoStatus>,
    image_result: ImageDetection,
    artifact: Vec<u8>,
    beacons_enabled: bool,
    call_delay: Option<Duration>,
    status_delay: Option<Duration>,
    /// Uploads the service holds until the next cleanup.
    pending_uploads: usize,
    task_counter: u32,
    stream_counter: u32,
}

/// Mock implementation of the MediaService trait.
///
/// Provides controllable behavior for testing:
/// - Record every call (and every beacon) for assertions
/// - Script the sequence of video status responses
/// - Inject errors for the next call, or the next call of a given kind
/// - Delay responses to exercise races
///
/// # Example
///
/// ```rust,ignore
/// let service = MockMediaService::new();
/// service.push_statuses(vec![
///     Ok(VideoStatus::processing(42.0)),
///     Ok(VideoStatus::completed(fixtures::video_result())),
/// ]);
///
/// let accepted = service.submit_video(&upload, 0.5, true).await?;
/// assert_eq!(accepted.task_id, "task-1");
/// ```
#[derive(Clone)]
pub struct MockMediaService {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockMediaService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaService {
    /// Create a new mock service.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                beacons: Vec::new(),
                next_error: None,
                targeted_errors: Vec::new(),
                statuses: VecDeque::new(),
                last_status: None,
                image_result: super::fixtures::image_detection(),
                artifact: b"artifact".to_vec(),
                beacons_enabled: true,
                call_delay: None,
                status_delay: None,
                pending_uploads: 0,
                task_counter: 0,
                stream_counter: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Count recorded calls matching a predicate.
    pub fn call_count(&self, matches: impl Fn(&RecordedCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| matches(c)).count()
    }

    /// Clear recorded calls and beacons.
    pub fn clear_recorded(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.beacons.clear();
    }

    /// Get all beacons handed to the service.
    pub fn beacons(&self) -> Vec<Beacon> {
        self.state().beacons.clone()
    }

    /// Refuse beacons, forcing callers onto the detached fallback.
    pub fn set_beacons_enabled(&self, enabled: bool) {
        self.state().beacons_enabled = enabled;
    }

    /// Set an error for the next call.
    pub fn set_next_error(&self, error: ApiError) {
        self.state().next_error = Some(error);
    }

    /// Set an error for the next call matching `matches`.
    pub fn fail_next(
        &self,
        matches: impl Fn(&RecordedCall) -> bool + Send + 'static,
        error: ApiError,
    ) {
        self.state()
            .targeted_errors
            .push((Box::new(matches), error));
    }

    /// Set the image detection result.
    pub fn set_image_result(&self, result: ImageDetection) {
        self.state().image_result = result;
    }

    /// Set the bytes returned for any artifact.
    pub fn set_artifact(&self, bytes: Vec<u8>) {
        self.state().artifact = bytes;
    }

    /// Queue video status responses, consumed one per status call.
    ///
    /// Once the queue is empty the last successful status is repeated.
    pub fn push_statuses(&self, statuses: Vec<Result<VideoStatus, ApiError>>) {
        self.state().statuses.extend(statuses);
    }

    /// Delay every call by `delay`.
    pub fn set_call_delay(&self, delay: Duration) {
        self.state().call_delay = Some(delay);
    }

    /// Delay status calls by `delay`.
    pub fn set_status_delay(&self, delay: Duration) {
        self.state().status_delay = Some(delay);
    }

    /// Uploads not yet released by a cleanup.
    pub fn pending_cleanups(&self) -> usize {
        self.state().pending_uploads
    }

    /// Record a call and decide whether it fails.
    async fn begin(&self, call: RecordedCall) -> Result<(), ApiError> {
        let (delay, error) = {
            let mut state = self.state();
            let delay = match call {
                RecordedCall::VideoStatus { .. } => state.status_delay.or(state.call_delay),
                _ => state.call_delay,
            };
            let error = match state.next_error.take() {
                Some(error) => Some(error),
                None => state
                    .targeted_errors
                    .iter()
                    .position(|(matches, _)| matches(&call))
                    .map(|i| state.targeted_errors.remove(i).1),
            };
            state.calls.push(call);
            (delay, error)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MediaService for MockMediaService {
    async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.begin(RecordedCall::Health).await?;
        Ok(HealthStatus {
            status: "healthy".to_string(),
        })
    }

    async fn cleanup(&self) -> Result<(), ApiError> {
        self.begin(RecordedCall::Cleanup).await?;
        self.state().pending_uploads = 0;
        Ok(())
    }

    async fn detect_image(
        &self,
        upload: &PendingUpload,
        confidence: f32,
    ) -> Result<ImageDetection, ApiError> {
        self.begin(RecordedCall::DetectImage {
            file_name: upload.file_name().to_string(),
            confidence,
        })
        .await?;
        let mut state = self.state();
        state.pending_uploads += 1;
        Ok(state.image_result.clone())
    }

    async fn submit_video(
        &self,
        upload: &PendingUpload,
        confidence: f32,
        save_output: bool,
    ) -> Result<VideoTaskAccepted, ApiError> {
        self.begin(RecordedCall::SubmitVideo {
            file_name: upload.file_name().to_string(),
            confidence,
            save_output,
        })
        .await?;
        let mut state = self.state();
        state.pending_uploads += 1;
        state.task_counter += 1;
        Ok(VideoTaskAccepted {
            task_id: format!("task-{}", state.task_counter),
        })
    }

    async fn video_status(&self, task_id: &str) -> Result<VideoStatus, ApiError> {
        self.begin(RecordedCall::VideoStatus {
            task_id: task_id.to_string(),
        })
        .await?;
        let mut state = self.state();
        match state.statuses.pop_front() {
            Some(Ok(status)) => {
                state.last_status = Some(status.clone());
                Ok(status)
            }
            Some(Err(e)) => Err(e),
            None => Ok(state
                .last_status
                .clone()
                .unwrap_or_else(|| VideoStatus::processing(0.0))),
        }
    }

    async fn start_stream(&self, confidence: f32) -> Result<StreamStarted, ApiError> {
        self.begin(RecordedCall::StartStream { confidence }).await?;
        let mut state = self.state();
        state.stream_counter += 1;
        Ok(StreamStarted {
            stream_id: format!("stream-{}", state.stream_counter),
        })
    }

    async fn stop_stream(&self, stream_id: &str) -> Result<(), ApiError> {
        self.begin(RecordedCall::StopStream {
            stream_id: stream_id.to_string(),
        })
        .await
    }

    async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, ApiError> {
        self.begin(RecordedCall::FetchArtifact {
            reference: reference.to_string(),
        })
        .await?;
        Ok(self.state().artifact.clone())
    }

    fn send_beacon(&self, beacon: Beacon) -> bool {
        let mut state = self.state();
        if !state.beacons_enabled {
            return false;
        }
        state.beacons.push(beacon);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_status_script_repeats_last_success() {
        let service = MockMediaService::new();
        service.push_statuses(vec![
            Ok(VideoStatus::processing(10.0)),
            Err(ApiError::Timeout),
        ]);

        assert_eq!(service.video_status("t").await.unwrap().progress, 10.0);
        assert!(service.video_status("t").await.is_err());
        assert_eq!(service.video_status("t").await.unwrap().progress, 10.0);
    }

    #[tokio::test]
    async fn test_error_injection() {
        let service = MockMediaService::new();
        service.set_next_error(ApiError::Timeout);

        assert!(service.health().await.is_err());
        assert!(service.health().await.is_ok());
        assert_eq!(service.calls(), vec![RecordedCall::Health, RecordedCall::Health]);
    }

    #[tokio::test]
    async fn test_targeted_error_skips_other_calls() {
        let service = MockMediaService::new();
        service.fail_next(
            |c| matches!(c, RecordedCall::StopStream { .. }),
            ApiError::Timeout,
        );

        assert!(service.cleanup().await.is_ok());
        assert!(service.stop_stream("s").await.is_err());
        assert!(service.stop_stream("s").await.is_ok());
    }

    #[tokio::test]
    async fn test_generated_ids() {
        let service = MockMediaService::new();
        let upload = fixtures::video_upload("a.mp4");

        let first = service.submit_video(&upload, 0.5, true).await.unwrap();
        let second = service.submit_video(&upload, 0.5, true).await.unwrap();
        assert_eq!(first.task_id, "task-1");
        assert_eq!(second.task_id, "task-2");
        assert_eq!(service.pending_cleanups(), 2);

        service.cleanup().await.unwrap();
        assert_eq!(service.pending_cleanups(), 0);
    }
}
