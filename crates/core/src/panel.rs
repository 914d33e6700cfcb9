//! Observable view models ("panels") of the three orchestrators.
//!
//! Each orchestrator owns a `tokio::sync::watch` sender of its panel and
//! mutates it as its state machine advances. Front ends subscribe and render
//! whatever the latest value is; intermediate values may be skipped.

use crate::api::{Detection, ImageDetection, VideoResult};
use crate::upload::PendingUpload;

/// Preview of the selected file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePreview {
    pub file_name: String,
    pub size_label: String,
}

impl From<&PendingUpload> for FilePreview {
    fn from(upload: &PendingUpload) -> Self {
        Self {
            file_name: upload.file_name().to_string(),
            size_label: upload.size_label(),
        }
    }
}

/// Input controls of an upload form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormState {
    /// File picker and confidence control accept input.
    pub controls_enabled: bool,
    /// Submit is enabled only while a file is selected and nothing is running.
    pub submit_enabled: bool,
    /// A submission is in progress.
    pub busy: bool,
    pub preview: Option<FilePreview>,
}

impl Default for FormState {
    fn default() -> Self {
        Self {
            controls_enabled: true,
            submit_enabled: false,
            busy: false,
            preview: None,
        }
    }
}

impl FormState {
    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
        self.controls_enabled = !busy;
        self.submit_enabled = !busy && self.preview.is_some();
    }

    pub(crate) fn set_preview(&mut self, preview: Option<FilePreview>) {
        self.preview = preview;
        self.submit_enabled = !self.busy && self.preview.is_some();
    }
}

/// Progress indicator of a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressView {
    /// Percentage in [0, 100].
    pub percent: f64,
    pub status_text: String,
}

impl ProgressView {
    pub fn initializing() -> Self {
        Self {
            percent: 0.0,
            status_text: "Initializing...".to_string(),
        }
    }

    /// Rounded percentage for display.
    pub fn percent_label(&self) -> String {
        format!("{}", self.percent.round() as u32)
    }
}

/// The one surface of a form that is visible at a time.
///
/// Progress, result and error banner are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Surface<R> {
    #[default]
    Hidden,
    Progress(ProgressView),
    Result(R),
    Error(String),
}

impl<R> Surface<R> {
    pub fn result(&self) -> Option<&R> {
        match self {
            Surface::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Surface::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<&ProgressView> {
        match self {
            Surface::Progress(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Surface::Hidden)
    }
}

/// One line of the detection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionLine {
    pub class_name: String,
    /// Confidence as a percentage with one decimal, e.g. "93.1%".
    pub confidence_label: String,
}

impl From<&Detection> for DetectionLine {
    fn from(detection: &Detection) -> Self {
        Self {
            class_name: detection.class_name.clone(),
            confidence_label: format!("{:.1}%", detection.confidence * 100.0),
        }
    }
}

/// Rendered result of an image submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResultView {
    pub processed_image_url: String,
    pub detections: Vec<DetectionLine>,
    /// Seconds with three decimals.
    pub processing_time: String,
}

impl From<&ImageDetection> for ImageResultView {
    fn from(result: &ImageDetection) -> Self {
        Self {
            processed_image_url: result.processed_image_url.clone(),
            detections: result.detections.iter().map(DetectionLine::from).collect(),
            processing_time: format!("{:.3}", result.processing_time),
        }
    }
}

/// Rendered result of a completed video job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoResultView {
    /// Seconds with two decimals.
    pub processing_time: String,
    pub frames_processed: String,
    pub download_url: String,
    /// Suggested local name for the artifact.
    pub download_name: String,
}

impl VideoResultView {
    pub fn new(result: &VideoResult, original_name: Option<&str>) -> Self {
        let download_name = match original_name {
            Some(name) => format!("processed_{}", name),
            None => result
                .output_video_url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("processed_video")
                .to_string(),
        };
        Self {
            processing_time: format!("{:.2}", result.processing_time),
            frames_processed: result.frames_processed.to_string(),
            download_url: result.output_video_url.clone(),
            download_name,
        }
    }
}

/// Image form panel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImagePanel {
    pub form: FormState,
    pub surface: Surface<ImageResultView>,
}

/// Video form panel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoPanel {
    pub form: FormState,
    pub surface: Surface<VideoResultView>,
}

/// Live stream panel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPanel {
    /// The output surface is shown and the stop affordance replaces start.
    pub live: bool,
    /// Encoded payload of the most recent frame.
    pub frame: Option<String>,
    /// FPS with one decimal, "0" when unknown.
    pub fps_label: String,
    pub object_count: usize,
    pub error: Option<String>,
}

impl Default for StreamPanel {
    fn default() -> Self {
        Self {
            live: false,
            frame: None,
            fps_label: "0".to_string(),
            object_count: 0,
            error: None,
        }
    }
}

impl StreamPanel {
    pub fn start_visible(&self) -> bool {
        !self.live
    }

    pub fn stop_visible(&self) -> bool {
        self.live
    }

    /// Hide the output surface and zero the counters.
    pub(crate) fn reset_output(&mut self) {
        self.live = false;
        self.frame = None;
        self.fps_label = "0".to_string();
        self.object_count = 0;
    }
}

/// Format an optional FPS value for display.
pub fn fps_label(fps: Option<f64>) -> String {
    match fps {
        Some(fps) if fps > 0.0 => format!("{:.1}", fps),
        _ => "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_disabled_until_file_selected() {
        let mut form = FormState::default();
        assert!(!form.submit_enabled);

        form.set_preview(Some(FilePreview {
            file_name: "a.png".to_string(),
            size_label: "1 KB".to_string(),
        }));
        assert!(form.submit_enabled);

        form.set_busy(true);
        assert!(!form.submit_enabled);
        assert!(!form.controls_enabled);

        form.set_busy(false);
        assert!(form.submit_enabled);
        assert!(form.controls_enabled);
    }

    #[test]
    fn test_detection_line_formatting() {
        let line = DetectionLine::from(&Detection {
            class_name: "person".to_string(),
            confidence: 0.9312,
        });
        assert_eq!(line.confidence_label, "93.1%");
    }

    #[test]
    fn test_video_result_view_formatting() {
        let result = VideoResult {
            processing_time: 12.5,
            frames_processed: 300,
            output_video_url: "/static/results/result_video_1.mp4".to_string(),
        };
        let view = VideoResultView::new(&result, Some("clip.mp4"));
        assert_eq!(view.processing_time, "12.50");
        assert_eq!(view.frames_processed, "300");
        assert_eq!(view.download_name, "processed_clip.mp4");

        let view = VideoResultView::new(&result, None);
        assert_eq!(view.download_name, "result_video_1.mp4");
    }

    #[test]
    fn test_fps_label() {
        assert_eq!(fps_label(None), "0");
        assert_eq!(fps_label(Some(0.0)), "0");
        assert_eq!(fps_label(Some(29.97)), "30.0");
    }

    #[test]
    fn test_surface_accessors() {
        let surface: Surface<ImageResultView> = Surface::Error("boom".to_string());
        assert_eq!(surface.error(), Some("boom"));
        assert!(surface.result().is_none());
        assert!(surface.progress().is_none());
    }
}
