//! Image submission orchestrator.
//!
//! One request/response cycle per submission: clear the previous result,
//! lock the form, release server resources, post the image, then render
//! either the detections or a single error line. The form is unlocked on
//! every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::MediaService;
use crate::cleanup::CleanupProtocol;
use crate::error::{validate_confidence, ActionError, ValidationError};
use crate::metrics::IMAGE_SUBMISSIONS;
use crate::panel::{FilePreview, ImagePanel, ImageResultView, Surface};
use crate::upload::{MediaKind, PendingUpload};

/// Drives image submissions for one form.
pub struct ImageOrchestrator {
    service: Arc<dyn MediaService>,
    cleanup: CleanupProtocol,
    upload: Mutex<Option<Arc<PendingUpload>>>,
    busy: AtomicBool,
    panel: watch::Sender<ImagePanel>,
}

/// Holds the form locked; unlocks it when dropped.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    panel: &'a watch::Sender<ImagePanel>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.panel.send_modify(|p| p.form.set_busy(false));
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl ImageOrchestrator {
    pub fn new(service: Arc<dyn MediaService>, cleanup: CleanupProtocol) -> Self {
        let (panel, _) = watch::channel(ImagePanel::default());
        Self {
            service,
            cleanup,
            upload: Mutex::new(None),
            busy: AtomicBool::new(false),
            panel,
        }
    }

    /// Subscribe to panel updates.
    pub fn subscribe(&self) -> watch::Receiver<ImagePanel> {
        self.panel.subscribe()
    }

    /// Current panel state.
    pub fn panel(&self) -> ImagePanel {
        self.panel.borrow().clone()
    }

    /// Replace the selected file.
    ///
    /// Resources of the previous upload are released (awaited) before the new
    /// selection is accepted. `None` clears the selection.
    pub async fn select(&self, upload: Option<PendingUpload>) {
        self.cleanup.release().await;

        let preview = upload.as_ref().map(FilePreview::from);
        if let Some(p) = &preview {
            debug!("Selected image {} ({})", p.file_name, p.size_label);
        }
        if let Ok(mut slot) = self.upload.lock() {
            *slot = upload.map(Arc::new);
        }
        self.panel.send_modify(|p| p.form.set_preview(preview));
    }

    fn selected(&self) -> Option<Arc<PendingUpload>> {
        self.upload.lock().ok().and_then(|slot| slot.clone())
    }

    fn lock_form(&self) -> Result<BusyGuard<'_>, ActionError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ActionError::Busy(
                "An image is already being processed.".to_string(),
            ));
        }
        Ok(BusyGuard {
            busy: &self.busy,
            panel: &self.panel,
        })
    }

    /// Submit the selected image with `confidence`.
    pub async fn submit(&self, confidence: f32) -> Result<ImageResultView, ActionError> {
        let _guard = self.lock_form()?;

        self.panel.send_modify(|p| {
            p.surface = Surface::Hidden;
            p.form.set_busy(true);
        });

        let result = self.run(confidence).await;

        match &result {
            Ok(view) => {
                IMAGE_SUBMISSIONS.with_label_values(&["ok"]).inc();
                self.panel
                    .send_modify(|p| p.surface = Surface::Result(view.clone()));
            }
            Err(e) => {
                let label = if e.is_validation() { "rejected" } else { "failed" };
                IMAGE_SUBMISSIONS.with_label_values(&[label]).inc();
                let message = e.user_message();
                self.panel
                    .send_modify(|p| p.surface = Surface::Error(message));
            }
        }
        result
    }

    async fn run(&self, confidence: f32) -> Result<ImageResultView, ActionError> {
        let upload = self.selected().ok_or(ValidationError::NoFileSelected {
            kind: MediaKind::Image,
        })?;
        validate_confidence(confidence)?;
        upload.validate(MediaKind::Image)?;

        self.cleanup.release().await;

        info!(
            "Detecting objects in {} at confidence {}",
            upload.file_name(),
            confidence
        );
        let detection = self
            .service
            .detect_image(&upload, confidence)
            .await
            .map_err(|e| {
                warn!("Image detection failed: {}", e);
                ActionError::from(e)
            })?;

        debug!(
            "{} detections in {:.3}s",
            detection.detections.len(),
            detection.processing_time
        );
        Ok(ImageResultView::from(&detection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::testing::{fixtures, MockMediaService, RecordedCall};

    fn orchestrator(service: &Arc<MockMediaService>) -> ImageOrchestrator {
        let service: Arc<dyn MediaService> = service.clone();
        ImageOrchestrator::new(service.clone(), CleanupProtocol::new(service))
    }

    #[tokio::test]
    async fn test_submit_without_file_makes_no_request() {
        let service = Arc::new(MockMediaService::new());
        let images = orchestrator(&service);

        let err = images.submit(0.5).await.unwrap_err();

        assert!(matches!(
            err,
            ActionError::Validation(ValidationError::NoFileSelected { .. })
        ));
        assert!(service.calls().is_empty());
        let panel = images.panel();
        assert_eq!(panel.surface.error(), Some("Please select an image file."));
        assert!(panel.form.controls_enabled);
    }

    #[tokio::test]
    async fn test_select_releases_previous_resources() {
        let service = Arc::new(MockMediaService::new());
        let images = orchestrator(&service);

        images.select(Some(fixtures::image_upload("a.png"))).await;
        images.select(Some(fixtures::image_upload("b.png"))).await;

        assert_eq!(
            service.calls(),
            vec![RecordedCall::Cleanup, RecordedCall::Cleanup]
        );
        let panel = images.panel();
        assert!(panel.form.submit_enabled);
        assert_eq!(panel.form.preview.unwrap().file_name, "b.png");

        images.select(None).await;
        assert!(!images.panel().form.submit_enabled);
    }

    #[tokio::test]
    async fn test_submit_renders_detections() {
        let service = Arc::new(MockMediaService::new());
        service.set_image_result(fixtures::image_detection());
        let images = orchestrator(&service);
        images.select(Some(fixtures::image_upload("street.jpg"))).await;

        let view = images.submit(0.25).await.unwrap();

        assert_eq!(view.processing_time, "0.123");
        assert_eq!(view.detections.len(), 2);
        assert_eq!(view.detections[0].confidence_label, "93.1%");

        let calls = service.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], RecordedCall::Cleanup);
        assert_eq!(
            calls[2],
            RecordedCall::DetectImage {
                file_name: "street.jpg".to_string(),
                confidence: 0.25
            }
        );

        let panel = images.panel();
        assert_eq!(panel.surface.result(), Some(&view));
        assert!(panel.form.controls_enabled);
        assert!(!panel.form.busy);
    }

    #[tokio::test]
    async fn test_server_error_is_shown_verbatim() {
        let service = Arc::new(MockMediaService::new());
        let images = orchestrator(&service);
        images.select(Some(fixtures::image_upload("a.png"))).await;
        service.fail_next(
            |c| matches!(c, RecordedCall::DetectImage { .. }),
            ApiError::Server {
                code: Some("detection_error".to_string()),
                message: "Model not loaded".to_string(),
            },
        );

        let err = images.submit(0.5).await.unwrap_err();

        assert_eq!(err.user_message(), "Model not loaded");
        let panel = images.panel();
        assert_eq!(panel.surface.error(), Some("Model not loaded"));
        assert!(panel.surface.result().is_none());
        assert!(panel.form.controls_enabled);
    }

    #[tokio::test]
    async fn test_network_error_clears_previous_result() {
        let service = Arc::new(MockMediaService::new());
        let images = orchestrator(&service);
        images.select(Some(fixtures::image_upload("a.png"))).await;
        images.submit(0.5).await.unwrap();

        service.fail_next(
            |c| matches!(c, RecordedCall::DetectImage { .. }),
            ApiError::ConnectionFailed("refused".to_string()),
        );
        let err = images.submit(0.5).await.unwrap_err();

        assert!(matches!(err, ActionError::Network(_)));
        let panel = images.panel();
        assert!(panel.surface.result().is_none());
        assert!(panel.surface.error().is_some());
    }

    #[tokio::test]
    async fn test_unsupported_type_never_reaches_service() {
        let service = Arc::new(MockMediaService::new());
        let images = orchestrator(&service);
        images
            .select(Some(PendingUpload::from_bytes("notes.txt", vec![1, 2, 3])))
            .await;

        let err = images.submit(0.5).await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(
            service.call_count(|c| matches!(c, RecordedCall::DetectImage { .. })),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submit_is_busy() {
        let service = Arc::new(MockMediaService::new());
        service.set_call_delay(std::time::Duration::from_millis(100));
        let images = Arc::new(orchestrator(&service));
        images.select(Some(fixtures::image_upload("a.png"))).await;

        let first = {
            let images = images.clone();
            tokio::spawn(async move { images.submit(0.5).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(images.panel().form.busy);

        let second = images.submit(0.5).await;
        assert!(matches!(second, Err(ActionError::Busy(_))));

        assert!(first.await.unwrap().is_ok());
        assert!(!images.panel().form.busy);
    }
}
