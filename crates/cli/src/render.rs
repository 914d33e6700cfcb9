//! Terminal rendering of orchestrator panels.

use lookout_core::api::HealthStatus;
use lookout_core::panel::{ImageResultView, StreamPanel, VideoPanel, VideoResultView};

/// Render an image result as a block of lines.
pub fn image_result(view: &ImageResultView) -> String {
    let mut out = format!(
        "Processed image: {}\nProcessing time: {}s\n",
        view.processed_image_url, view.processing_time
    );
    if view.detections.is_empty() {
        out.push_str("No objects detected");
        return out;
    }

    out.push_str(&format!("Detections ({}):", view.detections.len()));
    let width = view
        .detections
        .iter()
        .map(|d| d.class_name.len())
        .max()
        .unwrap_or(0);
    for line in &view.detections {
        out.push_str(&format!(
            "\n  {:<width$}  {:>6}",
            line.class_name,
            line.confidence_label,
            width = width
        ));
    }
    out
}

/// Render a completed video job.
pub fn video_result(view: &VideoResultView) -> String {
    format!(
        "Processing time: {}s\nFrames processed: {}\nOutput: {}",
        view.processing_time, view.frames_processed, view.download_url
    )
}

/// One status line of a live stream.
pub fn stream_status(panel: &StreamPanel) -> String {
    format!("fps {} | objects {}", panel.fps_label, panel.object_count)
}

pub fn health(status: &HealthStatus) -> String {
    format!("Service is {}", status.status)
}

/// Prints each distinct progress line of a video job once.
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    last: Option<String>,
}

impl ProgressPrinter {
    /// The line to print for `panel`, or `None` if nothing visible changed.
    pub fn update(&mut self, panel: &VideoPanel) -> Option<String> {
        let progress = panel.surface.progress()?;
        let line = format!(
            "[{:>3}%] {}",
            progress.percent_label(),
            progress.status_text
        );
        if self.last.as_deref() == Some(line.as_str()) {
            return None;
        }
        self.last = Some(line.clone());
        Some(line)
    }
}

/// Local file name for an artifact reference: its last path segment,
/// or `fallback` when the reference has none.
pub fn artifact_file_name(reference: &str, fallback: &str) -> String {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::panel::{DetectionLine, ProgressView, Surface};

    fn progress_panel(percent: f64, status_text: &str) -> VideoPanel {
        VideoPanel {
            surface: Surface::Progress(ProgressView {
                percent,
                status_text: status_text.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_image_result_lists_detections() {
        let view = ImageResultView {
            processed_image_url: "/static/results/result_a.jpg".to_string(),
            detections: vec![
                DetectionLine {
                    class_name: "person".to_string(),
                    confidence_label: "93.1%".to_string(),
                },
                DetectionLine {
                    class_name: "car".to_string(),
                    confidence_label: "75.0%".to_string(),
                },
            ],
            processing_time: "0.123".to_string(),
        };

        let text = image_result(&view);

        assert!(text.contains("Processing time: 0.123s"));
        assert!(text.contains("Detections (2):"));
        assert!(text.contains("\n  person   93.1%"));
        assert!(text.contains("\n  car      75.0%"));
    }

    #[test]
    fn test_image_result_without_detections() {
        let view = ImageResultView {
            processed_image_url: "/x.jpg".to_string(),
            detections: Vec::new(),
            processing_time: "0.010".to_string(),
        };

        assert!(image_result(&view).ends_with("No objects detected"));
    }

    #[test]
    fn test_progress_printer_skips_repeats() {
        let mut printer = ProgressPrinter::default();

        assert_eq!(
            printer.update(&progress_panel(0.0, "Initializing...")),
            Some("[  0%] Initializing...".to_string())
        );
        assert_eq!(printer.update(&progress_panel(0.2, "Initializing...")), None);
        assert_eq!(
            printer.update(&progress_panel(42.4, "Processing video...")),
            Some("[ 42%] Processing video...".to_string())
        );
        assert_eq!(printer.update(&VideoPanel::default()), None);
    }

    #[test]
    fn test_stream_status() {
        let panel = StreamPanel {
            live: true,
            fps_label: "24.0".to_string(),
            object_count: 3,
            ..Default::default()
        };
        assert_eq!(stream_status(&panel), "fps 24.0 | objects 3");
    }

    #[test]
    fn test_artifact_file_name() {
        assert_eq!(
            artifact_file_name("/static/results/result_a.jpg", "x"),
            "result_a.jpg"
        );
        assert_eq!(
            artifact_file_name("http://host/static/b.mp4?token=1", "x"),
            "b.mp4"
        );
        assert_eq!(artifact_file_name("http://host/", "fallback"), "fallback");
    }
}
