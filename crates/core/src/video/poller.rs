//! The status poll loop of one video job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, JobStatus, MediaService, VideoResult, VideoStatus};
use crate::error::ActionError;
use crate::metrics::{VIDEO_JOBS, VIDEO_JOB_DURATION, VIDEO_POLLS};
use crate::panel::{ProgressView, Surface, VideoPanel, VideoResultView};

use super::types::{JobGuard, JobPhase};

const STATUS_PROCESSING: &str = "Processing video...";
const STATUS_QUEUED: &str = "Initializing...";
const DEFAULT_FAILURE: &str = "Processing failed";
const MISSING_RESULT: &str = "Processing completed without a result";

/// Everything one poll loop needs. Owned by the spawned task.
pub(crate) struct PollContext {
    pub service: Arc<dyn MediaService>,
    pub task_id: String,
    /// Name of the uploaded file, for the suggested download name.
    pub file_name: String,
    pub guard: Arc<JobGuard>,
    pub panel: Arc<watch::Sender<VideoPanel>>,
    pub phase: Arc<watch::Sender<JobPhase>>,
    pub period: Duration,
    pub max_missed_polls: u32,
}

enum Tick {
    Continue,
    Stop,
}

/// Poll until the job is terminal or the loop is cancelled.
///
/// Ticks are strictly sequential: the next status request is issued only
/// after the previous one was handled. The guard is checked at the start of
/// every tick and again once the request returns.
pub(crate) async fn run_poll_loop(ctx: PollContext, mut cancel_rx: broadcast::Receiver<()>) {
    let started = Instant::now();
    let mut ticker = interval_at(started + ctx.period, ctx.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut progress = 0.0_f64;
    let mut missed = 0u32;

    debug!("Polling task {} every {:?}", ctx.task_id, ctx.period);

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("Poll loop for task {} cancelled", ctx.task_id);
                break;
            }
            _ = ticker.tick() => {
                if ctx.guard.is_done() {
                    break;
                }

                let response = tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!("Poll loop for task {} cancelled mid-request", ctx.task_id);
                        break;
                    }
                    response = ctx.service.video_status(&ctx.task_id) => response,
                };

                // A late response for a job that ended meanwhile is dropped.
                if ctx.guard.is_done() {
                    break;
                }

                match handle_response(&ctx, response, &mut progress, &mut missed, started) {
                    Tick::Continue => {}
                    Tick::Stop => break,
                }
            }
        }
    }

    debug!("Poll loop for task {} stopped", ctx.task_id);
}

fn handle_response(
    ctx: &PollContext,
    response: Result<VideoStatus, ApiError>,
    progress: &mut f64,
    missed: &mut u32,
    started: Instant,
) -> Tick {
    let status = match response {
        Ok(status) => status,
        Err(e) => {
            VIDEO_POLLS.with_label_values(&["error"]).inc();
            *missed += 1;
            if *missed > ctx.max_missed_polls {
                warn!("Status check for task {} failed: {}", ctx.task_id, e);
                let message = ActionError::from(e).user_message();
                fail(ctx, message, started);
                return Tick::Stop;
            }
            warn!(
                "Status check for task {} failed ({}/{} tolerated): {}",
                ctx.task_id, missed, ctx.max_missed_polls, e
            );
            return Tick::Continue;
        }
    };
    *missed = 0;

    match status.status {
        JobStatus::Queued => {
            VIDEO_POLLS.with_label_values(&["ok"]).inc();
            show_progress(ctx, *progress, STATUS_QUEUED);
            Tick::Continue
        }
        JobStatus::Processing => {
            VIDEO_POLLS.with_label_values(&["ok"]).inc();
            // Progress never moves backwards while processing.
            *progress = progress.max(status.progress.clamp(0.0, 100.0));
            show_progress(ctx, *progress, STATUS_PROCESSING);
            Tick::Continue
        }
        JobStatus::Completed => {
            VIDEO_POLLS.with_label_values(&["ok"]).inc();
            match status.result {
                Some(result) => complete(ctx, result, started),
                None => fail(ctx, MISSING_RESULT.to_string(), started),
            }
            Tick::Stop
        }
        JobStatus::Failed => {
            VIDEO_POLLS.with_label_values(&["ok"]).inc();
            let message = status
                .error
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE.to_string());
            fail(ctx, message, started);
            Tick::Stop
        }
        JobStatus::Unknown => {
            VIDEO_POLLS.with_label_values(&["unknown"]).inc();
            warn!(
                "Task {} reported an unknown status, skipping tick",
                ctx.task_id
            );
            Tick::Continue
        }
    }
}

fn show_progress(ctx: &PollContext, percent: f64, text: &str) {
    ctx.guard.publish(&ctx.panel, |p| {
        p.surface = Surface::Progress(ProgressView {
            percent,
            status_text: text.to_string(),
        });
    });
}

fn complete(ctx: &PollContext, result: VideoResult, started: Instant) {
    if !ctx.guard.finish() {
        return;
    }
    info!(
        "Task {} completed: {} frames in {:.2}s",
        ctx.task_id, result.frames_processed, result.processing_time
    );
    VIDEO_JOBS.with_label_values(&["completed"]).inc();
    VIDEO_JOB_DURATION
        .with_label_values(&["completed"])
        .observe(started.elapsed().as_secs_f64());

    let view = VideoResultView::new(&result, Some(&ctx.file_name));
    ctx.guard.publish(&ctx.panel, |p| {
        p.surface = Surface::Result(view);
        p.form.set_busy(false);
    });
    ctx.guard.publish(&ctx.phase, |phase| {
        *phase = JobPhase::Completed {
            task_id: ctx.task_id.clone(),
            result,
        };
    });
}

fn fail(ctx: &PollContext, message: String, started: Instant) {
    if !ctx.guard.finish() {
        return;
    }
    warn!("Task {} failed: {}", ctx.task_id, message);
    VIDEO_JOBS.with_label_values(&["failed"]).inc();
    VIDEO_JOB_DURATION
        .with_label_values(&["failed"])
        .observe(started.elapsed().as_secs_f64());

    ctx.guard.publish(&ctx.panel, |p| {
        p.surface = Surface::Error(message.clone());
        p.form.set_busy(false);
    });
    ctx.guard.publish(&ctx.phase, |phase| {
        *phase = JobPhase::Failed {
            task_id: Some(ctx.task_id.clone()),
            message,
        };
    });
}
