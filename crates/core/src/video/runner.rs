//! Video job orchestrator implementation.
//!
//! Drives one job at a time through `idle -> submitting -> polling ->
//! {completed, failed}`. A new submission cancels the previous poll loop
//! before anything else happens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::MediaService;
use crate::cleanup::CleanupProtocol;
use crate::config::VideoConfig;
use crate::error::{validate_confidence, ActionError, ValidationError};
use crate::metrics::VIDEO_JOBS;
use crate::panel::{FilePreview, ProgressView, Surface, VideoPanel};
use crate::upload::{MediaKind, PendingUpload};

use super::poller::{run_poll_loop, PollContext};
use super::types::{JobGuard, JobPhase};

/// The poll loop currently owned by the orchestrator.
struct ActiveJob {
    task_id: String,
    guard: Arc<JobGuard>,
    cancel_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives video jobs for one form.
pub struct VideoOrchestrator {
    service: Arc<dyn MediaService>,
    cleanup: CleanupProtocol,
    config: VideoConfig,
    upload: Mutex<Option<Arc<PendingUpload>>>,
    panel: Arc<watch::Sender<VideoPanel>>,
    phase: Arc<watch::Sender<JobPhase>>,
    /// Bumped by every submission; a submission that is no longer the latest
    /// when its upload returns is superseded.
    generation: AtomicU64,
    active: Mutex<Option<ActiveJob>>,
    /// Guard of the submission in flight, before it has a poll loop.
    submitting: Mutex<Option<Arc<JobGuard>>>,
}

impl VideoOrchestrator {
    pub fn new(service: Arc<dyn MediaService>, cleanup: CleanupProtocol, config: VideoConfig) -> Self {
        let (panel, _) = watch::channel(VideoPanel::default());
        let (phase, _) = watch::channel(JobPhase::Idle);
        Self {
            service,
            cleanup,
            config,
            upload: Mutex::new(None),
            panel: Arc::new(panel),
            phase: Arc::new(phase),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            submitting: Mutex::new(None),
        }
    }

    /// Subscribe to panel updates.
    pub fn subscribe(&self) -> watch::Receiver<VideoPanel> {
        self.panel.subscribe()
    }

    /// Subscribe to job phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<JobPhase> {
        self.phase.subscribe()
    }

    /// Current panel state.
    pub fn panel(&self) -> VideoPanel {
        self.panel.borrow().clone()
    }

    /// Current job phase.
    pub fn phase(&self) -> JobPhase {
        self.phase.borrow().clone()
    }

    /// Whether a poll loop is currently running.
    pub fn is_polling(&self) -> bool {
        self.active
            .lock()
            .map(|a| a.as_ref().is_some_and(|job| !job.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Replace the selected file.
    ///
    /// Resources of the previous upload are released (awaited) before the new
    /// selection is accepted. `None` clears the selection.
    pub async fn select(&self, upload: Option<PendingUpload>) {
        self.cleanup.release().await;

        let preview = upload.as_ref().map(FilePreview::from);
        if let Ok(mut slot) = self.upload.lock() {
            *slot = upload.map(Arc::new);
        }
        self.panel.send_modify(|p| p.form.set_preview(preview));
    }

    fn selected(&self) -> Option<Arc<PendingUpload>> {
        self.upload.lock().ok().and_then(|slot| slot.clone())
    }

    /// Submit the selected video and start polling its status.
    ///
    /// Returns the task ID once the service accepted the job. The result is
    /// delivered through the panel (and [`Self::wait_for_terminal`]).
    pub async fn submit(&self, confidence: f32) -> Result<String, ActionError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.quiesce().await;

        let guard = Arc::new(JobGuard::new());
        if let Ok(mut slot) = self.submitting.lock() {
            *slot = Some(guard.clone());
        }

        let upload = match self.check_input(confidence) {
            Ok(upload) => upload,
            Err(e) => {
                VIDEO_JOBS.with_label_values(&["rejected"]).inc();
                self.show_submit_error(&guard, None, &e);
                return Err(e);
            }
        };

        guard.publish(&self.panel, |p| {
            p.surface = Surface::Progress(ProgressView::initializing());
            p.form.set_busy(true);
        });
        guard.publish(&self.phase, |phase| *phase = JobPhase::Submitting);

        self.cleanup.release().await;
        if guard.is_cancelled() {
            return Err(ActionError::Superseded);
        }

        info!(
            "Submitting video {} at confidence {}",
            upload.file_name(),
            confidence
        );
        let accepted = self
            .service
            .submit_video(&upload, confidence, self.config.save_output)
            .await;

        if guard.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation {
            debug!("Submission of {} superseded", upload.file_name());
            return Err(ActionError::Superseded);
        }

        let task_id = match accepted {
            Ok(accepted) => accepted.task_id,
            Err(e) => {
                warn!("Video submission failed: {}", e);
                VIDEO_JOBS.with_label_values(&["rejected"]).inc();
                let err = ActionError::from(e);
                self.show_submit_error(&guard, None, &err);
                return Err(err);
            }
        };

        if !self.start_polling(task_id.clone(), upload.file_name().to_string(), guard) {
            debug!("Task {} cancelled before polling started", task_id);
            return Err(ActionError::Superseded);
        }
        VIDEO_JOBS.with_label_values(&["submitted"]).inc();
        info!("Video accepted as task {}", task_id);
        Ok(task_id)
    }

    fn check_input(&self, confidence: f32) -> Result<Arc<PendingUpload>, ActionError> {
        let upload = self.selected().ok_or(ValidationError::NoFileSelected {
            kind: MediaKind::Video,
        })?;
        validate_confidence(confidence)?;
        upload.validate(MediaKind::Video)?;
        Ok(upload)
    }

    fn show_submit_error(&self, guard: &JobGuard, task_id: Option<String>, err: &ActionError) {
        if !guard.finish() {
            return;
        }
        let message = err.user_message();
        guard.publish(&self.panel, |p| {
            p.surface = Surface::Error(message.clone());
            p.form.set_busy(false);
        });
        guard.publish(&self.phase, |phase| {
            *phase = JobPhase::Failed { task_id, message };
        });
    }

    /// Install the poll loop for an accepted job.
    ///
    /// Returns false, without polling, if the job was cancelled meanwhile.
    fn start_polling(&self, task_id: String, file_name: String, guard: Arc<JobGuard>) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        // Cancellers take `submitting` before `active`, so a cancel that
        // missed the slot below is visible here.
        if guard.is_cancelled() {
            return false;
        }

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        guard.publish(&self.phase, |phase| {
            *phase = JobPhase::Polling {
                task_id: task_id.clone(),
            };
        });

        let ctx = PollContext {
            service: Arc::clone(&self.service),
            task_id: task_id.clone(),
            file_name,
            guard: guard.clone(),
            panel: Arc::clone(&self.panel),
            phase: Arc::clone(&self.phase),
            period: Duration::from_millis(self.config.poll_interval_ms),
            max_missed_polls: self.config.max_missed_polls,
        };
        let handle = tokio::spawn(run_poll_loop(ctx, cancel_rx));

        *active = Some(ActiveJob {
            task_id,
            guard: guard.clone(),
            cancel_tx,
            handle,
        });
        drop(active);

        if let Ok(mut slot) = self.submitting.lock() {
            if slot.as_ref().is_some_and(|g| Arc::ptr_eq(g, &guard)) {
                *slot = None;
            }
        }
        true
    }

    /// Stop the current job, if any, and wait for its poll loop to exit.
    async fn quiesce(&self) {
        let pending = self.submitting.lock().ok().and_then(|mut s| s.take());
        if let Some(guard) = pending {
            guard.cancel();
        }

        let Some(job) = self.active.lock().ok().and_then(|mut a| a.take()) else {
            return;
        };
        if !job.guard.is_terminal() {
            debug!("Cancelling poll loop of task {}", job.task_id);
            VIDEO_JOBS.with_label_values(&["cancelled"]).inc();
        }
        job.guard.cancel();
        // The loop may have exited already; nobody left to receive is fine.
        let _ = job.cancel_tx.send(());
        if let Err(e) = job.handle.await {
            warn!("Poll loop of task {} ended abnormally: {}", job.task_id, e);
        }
    }

    /// Cancel the current job and reset the form.
    pub async fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.quiesce().await;
        self.panel.send_modify(|p| {
            if p.surface.progress().is_some() {
                p.surface = Surface::Hidden;
            }
            p.form.set_busy(false);
        });
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == JobPhase::Idle {
                return false;
            }
            *phase = JobPhase::Idle;
            true
        });
    }

    /// Stop polling without touching the panel. Used on exit.
    pub fn abort(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(guard) = self.submitting.lock().ok().and_then(|mut s| s.take()) {
            guard.cancel();
        }
        if let Some(job) = self.active.lock().ok().and_then(|mut a| a.take()) {
            job.guard.cancel();
            let _ = job.cancel_tx.send(());
            job.handle.abort();
        }
    }

    /// Wait until the current job reaches a terminal phase.
    ///
    /// Returns `None` if the orchestrator goes away or the job is cancelled.
    pub async fn wait_for_terminal(&self) -> Option<JobPhase> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|p| p.is_terminal() || *p == JobPhase::Idle)
            .await
            .ok()?
            .clone();
        phase.is_terminal().then_some(phase)
    }
}

impl Drop for VideoOrchestrator {
    fn drop(&mut self) {
        self.abort();
    }
}
