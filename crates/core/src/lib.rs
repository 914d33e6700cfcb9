pub mod api;
pub mod cleanup;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod image;
pub mod metrics;
pub mod panel;
pub mod stream;
pub mod testing;
pub mod upload;
pub mod video;

pub use api::{ApiError, HttpMediaService, MediaService};
pub use cleanup::CleanupProtocol;
pub use config::{
    load_config, load_config_from_str, load_default_config, validate_config, Config, ConfigError,
};
pub use dashboard::{Dashboard, DashboardError};
pub use error::{ActionError, ValidationError};
pub use image::ImageOrchestrator;
pub use panel::{ImagePanel, StreamPanel, Surface, VideoPanel};
pub use stream::{ChannelConnector, SessionState, SocketIoConnector, StreamOrchestrator};
pub use upload::{MediaKind, PendingUpload};
pub use video::{JobPhase, VideoOrchestrator};
