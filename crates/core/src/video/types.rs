//! Types for the video job orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::api::VideoResult;
use crate::error::ActionError;

/// Lifecycle of the current video job.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobPhase {
    /// No job, or the last one was cancelled.
    #[default]
    Idle,
    /// Cleanup and upload in flight.
    Submitting,
    /// The service accepted the job and the poll loop is running.
    Polling { task_id: String },
    Completed {
        task_id: String,
        result: VideoResult,
    },
    /// `task_id` is absent when the submission itself failed.
    Failed {
        task_id: Option<String>,
        message: String,
    },
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed { .. } | JobPhase::Failed { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            JobPhase::Polling { task_id } | JobPhase::Completed { task_id, .. } => Some(task_id),
            JobPhase::Failed { task_id, .. } => task_id.as_deref(),
            JobPhase::Idle | JobPhase::Submitting => None,
        }
    }

    /// The failure of a failed job.
    pub fn error(&self) -> Option<ActionError> {
        match self {
            JobPhase::Failed { message, .. } => Some(ActionError::JobFailure {
                message: message.clone(),
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Submitting => "submitting",
            JobPhase::Polling { .. } => "polling",
            JobPhase::Completed { .. } => "completed",
            JobPhase::Failed { .. } => "failed",
        }
    }
}

/// Sticky terminal/cancelled flags shared by one job's poll loop and its owner.
///
/// Once either flag is set the loop schedules no more work, and nothing it
/// was already doing may reach the panel.
#[derive(Debug, Default)]
pub struct JobGuard {
    terminal: AtomicBool,
    cancelled: AtomicBool,
}

impl JobGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single terminal transition. Returns false if the job is
    /// already terminal or was cancelled.
    pub fn finish(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.terminal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// No further ticks should run.
    pub fn is_done(&self) -> bool {
        self.is_terminal() || self.is_cancelled()
    }

    /// Modify a watched value unless the job was cancelled.
    ///
    /// The check runs under the channel's write lock, so a writer that
    /// cancels this job and then publishes always lands last.
    pub(crate) fn publish<T>(&self, tx: &watch::Sender<T>, modify: impl FnOnce(&mut T)) -> bool {
        tx.send_if_modified(|value| {
            if self.is_cancelled() {
                return false;
            }
            modify(value);
            true
        })
    }
}
