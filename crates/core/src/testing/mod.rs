//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the service and channel
//! traits, so the orchestrators can be exercised without a running service.
//!
//! # Example
//!
//! ```rust,ignore
//! use lookout_core::testing::{fixtures, MockChannelConnector, MockMediaService};
//!
//! let service = Arc::new(MockMediaService::new());
//! let connector = Arc::new(MockChannelConnector::new());
//! let stream = StreamOrchestrator::new(service.clone(), connector.clone());
//!
//! stream.start(0.5).await?;
//! connector.emit(ChannelEvent::Frame(fixtures::frame(Some("stream-1"), "AAAA", 2, Some(24.0))));
//! ```

mod mock_channel;
mod mock_service;

pub use mock_channel::MockChannelConnector;
pub use mock_service::{MockMediaService, RecordedCall};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::api::{Detection, ImageDetection, VideoResult};
    use crate::stream::FrameEvent;
    use crate::upload::PendingUpload;

    /// PNG signature followed by filler bytes.
    const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];

    /// Create a small image upload.
    pub fn image_upload(file_name: &str) -> PendingUpload {
        PendingUpload::from_bytes(file_name, PNG_BYTES.to_vec())
    }

    /// Create a small video upload.
    pub fn video_upload(file_name: &str) -> PendingUpload {
        PendingUpload::from_bytes(file_name, vec![0u8; 2048])
    }

    /// Create a detection.
    pub fn detection(class_name: &str, confidence: f64) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            confidence,
        }
    }

    /// Create an image result with two detections.
    pub fn image_detection() -> ImageDetection {
        ImageDetection {
            processed_image_url: "/static/results/result_street.jpg".to_string(),
            detections: vec![detection("person", 0.9312), detection("car", 0.75)],
            processing_time: 0.1234,
        }
    }

    /// Create a completed video result.
    pub fn video_result() -> VideoResult {
        VideoResult {
            processing_time: 12.5,
            frames_processed: 300,
            output_video_url: "/x.mp4".to_string(),
        }
    }

    /// Create a frame event with `objects` detections.
    pub fn frame(stream_id: Option<&str>, frame: &str, objects: usize, fps: Option<f64>) -> FrameEvent {
        FrameEvent {
            stream_id: stream_id.map(str::to_string),
            frame: frame.to_string(),
            detections: (0..objects).map(|_| detection("person", 0.8)).collect(),
            fps,
            timestamp: None,
        }
    }
}
