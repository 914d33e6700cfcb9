//! Fire-and-forget delivery for exit-time requests.
//!
//! A beacon is handed to a background dispatcher through an unbounded channel
//! and the caller returns immediately. Nobody waits for, or observes, the
//! response: if the process goes away first, the request is simply lost.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::BEACONS_TOTAL;

use super::MediaService;

/// A request that is sent without waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Beacon {
    /// `POST /api/v1/cleanup`
    Cleanup,
    /// `POST /api/v1/stream/stop/{stream_id}`
    StopStream { stream_id: String },
}

impl Beacon {
    /// Path of the request, relative to the service base URL.
    pub fn path(&self) -> String {
        match self {
            Beacon::Cleanup => "/api/v1/cleanup".to_string(),
            Beacon::StopStream { stream_id } => {
                format!("/api/v1/stream/stop/{}", urlencoding::encode(stream_id))
            }
        }
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Beacon::Cleanup => f.write_str("cleanup"),
            Beacon::StopStream { stream_id } => write!(f, "stop stream {}", stream_id),
        }
    }
}

/// Envelope wrapping a beacon with metadata
#[derive(Debug, Clone)]
pub struct BeaconEnvelope {
    pub queued_at: DateTime<Utc>,
    pub beacon: Beacon,
}

/// Handle for queueing beacons.
///
/// Cheaply cloneable. Beacons are sent through a channel and posted by the
/// dispatcher task.
#[derive(Clone)]
pub struct BeaconHandle {
    tx: mpsc::UnboundedSender<BeaconEnvelope>,
}

impl BeaconHandle {
    /// Create a new beacon handle from a channel sender
    pub fn new(tx: mpsc::UnboundedSender<BeaconEnvelope>) -> Self {
        Self { tx }
    }

    /// Queue a beacon without blocking.
    ///
    /// Returns true if the beacon was queued, false if the dispatcher is gone.
    pub fn queue(&self, beacon: Beacon) -> bool {
        let envelope = BeaconEnvelope {
            queued_at: Utc::now(),
            beacon,
        };
        match self.tx.send(envelope) {
            Ok(()) => {
                BEACONS_TOTAL.with_label_values(&["queued"]).inc();
                true
            }
            Err(e) => {
                warn!("Failed to queue beacon {}: dispatcher closed", e.0.beacon);
                false
            }
        }
    }
}

/// Spawn a dispatcher that posts queued beacons with `client`.
///
/// Each beacon is posted on its own task so a slow request never delays the
/// next one. Returns `None` outside a Tokio runtime.
pub fn spawn_beacon_dispatcher(client: reqwest::Client, base_url: String) -> Option<BeaconHandle> {
    let handle = Handle::try_current().ok()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<BeaconEnvelope>();

    handle.spawn(async move {
        debug!("Beacon dispatcher started");
        while let Some(envelope) = rx.recv().await {
            let client = client.clone();
            let url = format!("{}{}", base_url, envelope.beacon.path());
            tokio::spawn(async move {
                match client.post(&url).send().await {
                    Ok(response) => debug!(
                        "Beacon {} delivered ({}) after {}ms",
                        envelope.beacon,
                        response.status(),
                        (Utc::now() - envelope.queued_at).num_milliseconds()
                    ),
                    Err(e) => debug!("Beacon {} not delivered: {}", envelope.beacon, e),
                }
            });
        }
        debug!("Beacon dispatcher stopped");
    });

    Some(BeaconHandle::new(tx))
}

/// Send a beacon's request on a detached task, without awaiting it.
///
/// Fallback for when [`MediaService::send_beacon`] refuses a beacon.
/// Returns false if there is no runtime to run the request on.
pub fn dispatch_detached(service: Arc<dyn MediaService>, beacon: Beacon) -> bool {
    let Ok(handle) = Handle::try_current() else {
        warn!("No async runtime available, dropping {}", beacon);
        BEACONS_TOTAL.with_label_values(&["dropped"]).inc();
        return false;
    };

    BEACONS_TOTAL.with_label_values(&["detached"]).inc();
    handle.spawn(async move {
        let result = match &beacon {
            Beacon::Cleanup => service.cleanup().await,
            Beacon::StopStream { stream_id } => service.stop_stream(stream_id).await,
        };
        if let Err(e) = result {
            debug!("Detached {} failed: {}", beacon, e);
        }
    });
    true
}

/// Deliver a beacon, falling back to a detached request if it is refused.
pub fn send_or_detach(service: &Arc<dyn MediaService>, beacon: Beacon) -> bool {
    if service.send_beacon(beacon.clone()) {
        return true;
    }
    debug!("Beacon {} refused, falling back to detached request", beacon);
    dispatch_detached(Arc::clone(service), beacon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_paths() {
        assert_eq!(Beacon::Cleanup.path(), "/api/v1/cleanup");
        assert_eq!(
            Beacon::StopStream {
                stream_id: "abc".to_string()
            }
            .path(),
            "/api/v1/stream/stop/abc"
        );
        assert_eq!(
            Beacon::StopStream {
                stream_id: "a b/c".to_string()
            }
            .path(),
            "/api/v1/stream/stop/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn test_queue_delivers_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = BeaconHandle::new(tx);

        assert!(handle.queue(Beacon::Cleanup));

        let envelope = rx.recv().await.expect("Should receive beacon");
        assert_eq!(envelope.beacon, Beacon::Cleanup);
    }

    #[test]
    fn test_queue_after_dispatcher_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BeaconHandle::new(tx);
        drop(rx);

        assert!(!handle.queue(Beacon::Cleanup));
    }

    #[test]
    fn test_dispatcher_needs_runtime() {
        assert!(spawn_beacon_dispatcher(reqwest::Client::new(), "http://localhost".into()).is_none());
    }
}
