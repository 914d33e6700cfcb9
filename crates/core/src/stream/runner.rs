//! Live stream session orchestrator implementation.
//!
//! Owns at most one server-side session and one event channel. Session
//! transitions happen under a single state lock, which is never held across
//! an await; frame events are applied under the same lock so a frame can
//! never revive a session that was stopped or lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{send_or_detach, Beacon, MediaService};
use crate::error::{validate_confidence, ActionError};
use crate::metrics::{STREAM_FRAMES, STREAM_LIVE, STREAM_SESSIONS};
use crate::panel::{fps_label, StreamPanel};

use super::channel::{ChannelCloser, ChannelConnector};
use super::types::{ChannelEvent, FrameEvent, SessionState, StreamSession};

const START_FAILED: &str = "Failed to start stream: ";
const STOP_FAILED: &str = "Failed to stop stream: ";

/// The event channel currently owned by the orchestrator.
struct ChannelHandle {
    generation: u64,
    closer: ChannelCloser,
    task: JoinHandle<()>,
}

struct Inner {
    service: Arc<dyn MediaService>,
    connector: Arc<dyn ChannelConnector>,
    state: Mutex<SessionState>,
    panel: watch::Sender<StreamPanel>,
    channel: Mutex<Option<ChannelHandle>>,
    /// Bumped per opened channel; events of older channels are ignored.
    channel_generation: AtomicU64,
    /// Bumped by unload; a start begun before it must not go live.
    epoch: AtomicU64,
}

/// Drives the live stream session of one client.
pub struct StreamOrchestrator {
    inner: Arc<Inner>,
}

impl StreamOrchestrator {
    pub fn new(service: Arc<dyn MediaService>, connector: Arc<dyn ChannelConnector>) -> Self {
        let (panel, _) = watch::channel(StreamPanel::default());
        Self {
            inner: Arc::new(Inner {
                service,
                connector,
                state: Mutex::new(SessionState::Idle),
                panel,
                channel: Mutex::new(None),
                channel_generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to panel updates.
    pub fn subscribe(&self) -> watch::Receiver<StreamPanel> {
        self.inner.panel.subscribe()
    }

    /// Current panel state.
    pub fn panel(&self) -> StreamPanel {
        self.inner.panel.borrow().clone()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<StreamSession> {
        match self.state() {
            SessionState::Live(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Whether an event channel is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .channel
            .lock()
            .map(|c| c.as_ref().is_some_and(|h| !h.task.is_finished()))
            .unwrap_or(false)
    }

    /// Start a session at `confidence`.
    ///
    /// A start while a session is starting, live or stopping is rejected with
    /// [`ActionError::Busy`] and changes nothing.
    pub async fn start(&self, confidence: f32) -> Result<StreamSession, ActionError> {
        validate_confidence(confidence)?;

        let (orphan, epoch) = {
            let mut state = self.inner.lock_state();
            let orphan = match &*state {
                SessionState::Idle => None,
                SessionState::Disconnected { orphan } => orphan.clone(),
                SessionState::Starting { .. }
                | SessionState::Live(_)
                | SessionState::Stopping { .. } => {
                    debug!("Ignoring start, session is {}", state.as_str());
                    return Err(ActionError::Busy("A stream is already active.".to_string()));
                }
            };
            *state = SessionState::Starting {
                confidence_threshold: confidence,
            };
            (orphan, self.inner.epoch.load(Ordering::SeqCst))
        };
        self.inner.panel.send_modify(|p| p.error = None);

        // The server still holds the session that was live when the channel dropped.
        if let Some(orphan) = orphan {
            info!("Releasing orphaned stream {}", orphan.stream_id);
            send_or_detach(
                &self.inner.service,
                Beacon::StopStream {
                    stream_id: orphan.stream_id,
                },
            );
        }

        let opened = match self.ensure_channel().await {
            Ok(opened) => opened,
            Err(e) => return Err(self.inner.start_failed(e)),
        };
        if let Some(err) = self.inner.abandoned(epoch) {
            warn!("Stream start abandoned while the channel was opening");
            if let Some(generation) = opened {
                self.inner.close_channel_if(generation);
            }
            return Err(err);
        }

        let started = match self.inner.service.start_stream(confidence).await {
            Ok(started) => started,
            Err(e) => {
                warn!("Stream start failed: {}", e);
                return Err(self.inner.start_failed(ActionError::from(e)));
            }
        };

        let session = StreamSession::new(started.stream_id, confidence);
        let mut state = self.inner.lock_state();
        if let Some(err) = Inner::abandoned_in(&state, &self.inner.epoch, epoch) {
            // Lost the channel or unloaded while the request was in flight.
            drop(state);
            warn!(
                "Stream {} started after the session was abandoned, releasing it",
                session.stream_id
            );
            send_or_detach(
                &self.inner.service,
                Beacon::StopStream {
                    stream_id: session.stream_id,
                },
            );
            return Err(err);
        }

        info!(
            "Stream {} live at confidence {}",
            session.stream_id, confidence
        );
        *state = SessionState::Live(session.clone());
        self.inner.panel.send_modify(|p| {
            p.reset_output();
            p.live = true;
            p.error = None;
        });
        STREAM_SESSIONS.with_label_values(&["started"]).inc();
        STREAM_LIVE.set(1);
        Ok(session)
    }

    /// Stop the current session.
    ///
    /// Without a session this is a no-op. If the stop request fails, the
    /// session ID is kept so the stop can be retried.
    pub async fn stop(&self) -> Result<(), ActionError> {
        let session = {
            let mut state = self.inner.lock_state();
            let (session, was_live) = match &*state {
                SessionState::Live(session) => (session.clone(), true),
                SessionState::Disconnected {
                    orphan: Some(session),
                } => (session.clone(), false),
                SessionState::Starting { .. } | SessionState::Stopping { .. } => {
                    return Err(ActionError::Busy(format!(
                        "The stream is {}.",
                        state.as_str()
                    )));
                }
                SessionState::Idle | SessionState::Disconnected { orphan: None } => {
                    debug!("No stream to stop");
                    return Ok(());
                }
            };
            *state = SessionState::Stopping {
                session: session.clone(),
                was_live,
            };
            session
        };

        info!("Stopping stream {}", session.stream_id);
        let result = self.inner.service.stop_stream(&session.stream_id).await;

        let mut state = self.inner.lock_state();
        let SessionState::Stopping { was_live, .. } = &*state else {
            // Unloaded meanwhile; the exit path already released the session.
            return result.map_err(ActionError::from);
        };
        let was_live = *was_live;

        match result {
            Ok(()) => {
                *state = SessionState::Idle;
                self.inner.panel.send_modify(|p| {
                    p.reset_output();
                    p.error = None;
                });
                STREAM_SESSIONS.with_label_values(&["stopped"]).inc();
                STREAM_LIVE.set(0);
                info!("Stream {} stopped", session.stream_id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop stream {}: {}", session.stream_id, e);
                let err = ActionError::from(e);
                *state = if was_live {
                    SessionState::Live(session)
                } else {
                    SessionState::Disconnected {
                        orphan: Some(session),
                    }
                };
                let message = format!("{}{}", STOP_FAILED, err.user_message());
                self.inner.panel.send_modify(|p| p.error = Some(message));
                STREAM_SESSIONS.with_label_values(&["stop_failed"]).inc();
                Err(err)
            }
        }
    }

    /// Page-exit teardown: release the session without waiting and close
    /// the channel. Never blocks.
    pub fn unload(&self) {
        let stream_id = {
            let mut state = self.inner.lock_state();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            let id = state.stream_id().map(str::to_string);
            *state = SessionState::Idle;
            id
        };

        if let Some(stream_id) = stream_id {
            info!("Releasing stream {} on exit", stream_id);
            send_or_detach(&self.inner.service, Beacon::StopStream { stream_id });
        }

        self.inner.close_channel();
        self.inner.panel.send_modify(|p| p.reset_output());
        STREAM_LIVE.set(0);
    }

    /// Open the event channel unless one is already open.
    ///
    /// Returns the generation of the channel it opened, if any.
    async fn ensure_channel(&self) -> Result<Option<u64>, ActionError> {
        if self.is_connected() {
            return Ok(None);
        }

        let mut connection = self.inner.connector.connect().await.map_err(|e| {
            warn!("Failed to open stream channel: {}", e);
            ActionError::Network(e.to_string())
        })?;

        let generation = self.inner.channel_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let closer = connection.closer();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            while let Some(event) = connection.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(generation, event);
            }
            debug!("Channel {} event loop ended", generation);
        });

        let previous = self.inner.channel.lock().ok().and_then(|mut slot| {
            slot.replace(ChannelHandle {
                generation,
                closer,
                task,
            })
        });
        if let Some(previous) = previous {
            previous.closer.close();
        }
        Ok(Some(generation))
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.inner.close_channel();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        // State is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_generation(&self) -> u64 {
        self.channel_generation.load(Ordering::SeqCst)
    }

    fn close_channel(&self) {
        if let Some(handle) = self.channel.lock().ok().and_then(|mut c| c.take()) {
            debug!("Closing channel {}", handle.generation);
            handle.closer.close();
        }
    }

    fn close_channel_if(&self, generation: u64) {
        let handle = self.channel.lock().ok().and_then(|mut slot| {
            if slot.as_ref().is_some_and(|h| h.generation == generation) {
                slot.take()
            } else {
                None
            }
        });
        if let Some(handle) = handle {
            debug!("Closing channel {}", handle.generation);
            handle.closer.close();
        }
    }

    /// Why a start begun at `epoch` no longer owns the session, if it doesn't.
    fn abandoned(&self, epoch: u64) -> Option<ActionError> {
        let state = self.lock_state();
        Self::abandoned_in(&state, &self.epoch, epoch)
    }

    fn abandoned_in(state: &SessionState, current: &AtomicU64, epoch: u64) -> Option<ActionError> {
        match state {
            SessionState::Starting { .. } if current.load(Ordering::SeqCst) == epoch => None,
            SessionState::Disconnected { .. } => Some(ActionError::StreamDisconnect),
            _ => Some(ActionError::Superseded),
        }
    }

    fn start_failed(&self, err: ActionError) -> ActionError {
        let mut state = self.lock_state();
        if matches!(*state, SessionState::Starting { .. }) {
            *state = SessionState::Idle;
        }
        drop(state);

        let message = format!("{}{}", START_FAILED, err.user_message());
        self.panel.send_modify(|p| p.error = Some(message));
        STREAM_SESSIONS.with_label_values(&["start_failed"]).inc();
        err
    }

    fn handle_event(&self, generation: u64, event: ChannelEvent) {
        if generation != self.current_generation() {
            debug!("Ignoring event from stale channel {}", generation);
            return;
        }

        match event {
            ChannelEvent::Connected => debug!("Stream channel connected"),
            ChannelEvent::Frame(frame) => self.apply_frame(frame),
            ChannelEvent::Error(message) => {
                warn!("Stream error: {}", message);
                self.panel.send_modify(|p| p.error = Some(message));
            }
            ChannelEvent::Disconnected(reason) => self.apply_disconnect(generation, reason),
        }
    }

    fn apply_frame(&self, frame: FrameEvent) {
        STREAM_FRAMES.with_label_values(&["received"]).inc();

        let state = self.lock_state();
        let SessionState::Live(session) = &*state else {
            STREAM_FRAMES.with_label_values(&["ignored"]).inc();
            return;
        };
        if let Some(id) = &frame.stream_id {
            if *id != session.stream_id {
                STREAM_FRAMES.with_label_values(&["ignored"]).inc();
                return;
            }
        }

        self.panel.send_modify(|p| {
            p.object_count = frame.detections.len();
            p.fps_label = fps_label(frame.fps);
            p.frame = Some(frame.frame);
        });
        STREAM_FRAMES.with_label_values(&["rendered"]).inc();
    }

    fn apply_disconnect(&self, generation: u64, reason: String) {
        if let Ok(mut slot) = self.channel.lock() {
            if slot.as_ref().is_some_and(|h| h.generation == generation) {
                slot.take();
            }
        }

        let mut state = self.lock_state();
        match std::mem::take(&mut *state) {
            SessionState::Live(session) => {
                warn!(
                    "Channel lost while stream {} was live: {}",
                    session.stream_id, reason
                );
                *state = SessionState::Disconnected {
                    orphan: Some(session),
                };
                let message = ActionError::StreamDisconnect.user_message();
                self.panel.send_modify(|p| {
                    p.reset_output();
                    p.error = Some(message);
                });
                STREAM_SESSIONS.with_label_values(&["disconnected"]).inc();
                STREAM_LIVE.set(0);
            }
            SessionState::Starting { .. } => {
                warn!("Channel lost while starting: {}", reason);
                *state = SessionState::Disconnected { orphan: None };
                let message = ActionError::StreamDisconnect.user_message();
                self.panel.send_modify(|p| p.error = Some(message));
            }
            SessionState::Stopping { session, .. } => {
                debug!("Channel lost while stopping: {}", reason);
                // A failed stop can no longer go back to live.
                *state = SessionState::Stopping {
                    session,
                    was_live: false,
                };
            }
            other => {
                debug!("Channel lost: {}", reason);
                *state = other;
            }
        }
    }
}
