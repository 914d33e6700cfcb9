//! Resource cleanup protocol.
//!
//! One idempotent "release my temporary server-side resources" call, used in
//! two ways: awaited before new work starts, and as a beacon on exit. Neither
//! form ever reports failure to its caller.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{send_or_detach, Beacon, MediaService};
use crate::metrics::CLEANUP_REQUESTS;

/// Shared cleanup entry point for all orchestrators of one client.
#[derive(Clone)]
pub struct CleanupProtocol {
    service: Arc<dyn MediaService>,
}

impl CleanupProtocol {
    pub fn new(service: Arc<dyn MediaService>) -> Self {
        Self { service }
    }

    /// Release resources and wait for the service to answer.
    ///
    /// Failures are logged and swallowed.
    pub async fn release(&self) {
        match self.service.cleanup().await {
            Ok(()) => {
                debug!("Cleanup completed");
                CLEANUP_REQUESTS.with_label_values(&["awaited", "ok"]).inc();
            }
            Err(e) => {
                warn!("Cleanup failed: {}", e);
                CLEANUP_REQUESTS
                    .with_label_values(&["awaited", "error"])
                    .inc();
            }
        }
    }

    /// Release resources without waiting, for exit paths.
    pub fn release_on_exit(&self) {
        let sent = send_or_detach(&self.service, Beacon::Cleanup);
        let result = if sent { "sent" } else { "dropped" };
        CLEANUP_REQUESTS.with_label_values(&["beacon", result]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::testing::{MockMediaService, RecordedCall};

    #[tokio::test]
    async fn test_release_twice_is_same_as_once() {
        let service = Arc::new(MockMediaService::new());
        let cleanup = CleanupProtocol::new(service.clone());

        cleanup.release().await;
        let after_one = service.calls();
        cleanup.release().await;
        let after_two = service.calls();

        assert_eq!(after_one, vec![RecordedCall::Cleanup]);
        assert_eq!(after_two, vec![RecordedCall::Cleanup, RecordedCall::Cleanup]);
        assert_eq!(service.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn test_release_swallows_errors() {
        let service = Arc::new(MockMediaService::new());
        service.set_next_error(ApiError::Timeout);
        let cleanup = CleanupProtocol::new(service.clone());

        // Must not panic or propagate.
        cleanup.release().await;
        assert_eq!(service.call_count(|c| matches!(c, RecordedCall::Cleanup)), 1);
    }

    #[tokio::test]
    async fn test_release_on_exit_uses_beacon() {
        let service = Arc::new(MockMediaService::new());
        let cleanup = CleanupProtocol::new(service.clone());

        cleanup.release_on_exit();

        assert_eq!(service.beacons(), vec![Beacon::Cleanup]);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_release_on_exit_falls_back_when_beacon_refused() {
        let service = Arc::new(MockMediaService::new());
        service.set_beacons_enabled(false);
        let cleanup = CleanupProtocol::new(service.clone());

        cleanup.release_on_exit();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(service.beacons().is_empty());
        assert_eq!(service.call_count(|c| matches!(c, RecordedCall::Cleanup)), 1);
    }
}
