//! The dashboard: one set of orchestrators sharing one service client.
//!
//! A dashboard is torn down as a whole. [`Dashboard::unload`] is the
//! page-exit path: it stops the poll loop, releases the live session and
//! server-side uploads without waiting for any response, and runs at most
//! once (dropping the dashboard runs it too).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::api::{ApiError, HealthStatus, HttpMediaService, MediaService};
use crate::cleanup::CleanupProtocol;
use crate::config::Config;
use crate::error::ActionError;
use crate::image::ImageOrchestrator;
use crate::stream::{ChannelConnector, ChannelError, SocketIoConnector, StreamOrchestrator};
use crate::video::VideoOrchestrator;

/// Errors building a dashboard from configuration.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("service client: {0}")]
    Service(#[from] ApiError),

    #[error("stream channel: {0}")]
    Channel(#[from] ChannelError),
}

pub struct Dashboard {
    service: Arc<dyn MediaService>,
    cleanup: CleanupProtocol,
    image: ImageOrchestrator,
    video: VideoOrchestrator,
    stream: StreamOrchestrator,
    unloaded: AtomicBool,
}

impl Dashboard {
    /// Build a dashboard talking to the configured service.
    ///
    /// Must be called inside a Tokio runtime, otherwise exit-time beacons
    /// fall back to detached requests.
    pub fn new(config: &Config) -> Result<Self, DashboardError> {
        let service: Arc<dyn MediaService> = Arc::new(HttpMediaService::new(&config.service)?);
        let connector: Arc<dyn ChannelConnector> =
            Arc::new(SocketIoConnector::new(&config.service, &config.stream)?);
        Ok(Self::with_parts(service, connector, config))
    }

    /// Build a dashboard from explicit collaborators.
    pub fn with_parts(
        service: Arc<dyn MediaService>,
        connector: Arc<dyn ChannelConnector>,
        config: &Config,
    ) -> Self {
        let cleanup = CleanupProtocol::new(Arc::clone(&service));
        Self {
            image: ImageOrchestrator::new(Arc::clone(&service), cleanup.clone()),
            video: VideoOrchestrator::new(
                Arc::clone(&service),
                cleanup.clone(),
                config.video.clone(),
            ),
            stream: StreamOrchestrator::new(Arc::clone(&service), connector),
            service,
            cleanup,
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn image(&self) -> &ImageOrchestrator {
        &self.image
    }

    pub fn video(&self) -> &VideoOrchestrator {
        &self.video
    }

    pub fn stream(&self) -> &StreamOrchestrator {
        &self.stream
    }

    pub fn cleanup(&self) -> &CleanupProtocol {
        &self.cleanup
    }

    /// Ask the service whether it is up.
    pub async fn health(&self) -> Result<HealthStatus, ActionError> {
        self.service.health().await.map_err(ActionError::from)
    }

    /// Download a processed artifact by the reference in a result.
    pub async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, ActionError> {
        self.service
            .fetch_artifact(reference)
            .await
            .map_err(ActionError::from)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    /// Page-exit teardown. Never blocks; only the first call does anything.
    pub fn unload(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Unloading dashboard");
        self.video.abort();
        self.stream.unload();
        self.cleanup.release_on_exit();
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.unload();
    }
}
