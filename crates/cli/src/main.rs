mod commands;
mod render;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lookout_core::{load_config, load_default_config, metrics, validate_config, Config, Dashboard};

use commands::Action;

/// Config file looked up in the working directory when none is given.
const DEFAULT_CONFIG_FILE: &str = "lookout.toml";

#[derive(Parser)]
#[command(name = "lookout", version)]
#[command(about = "Drive a remote media-analysis service from the terminal", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Print metrics in Prometheus text format before exiting
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect objects in an image
    Image {
        file: PathBuf,

        /// Confidence threshold (0.0-1.0)
        #[arg(long)]
        confidence: Option<f32>,

        /// Directory to save the processed image to
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Submit a video and follow its progress
    Video {
        file: PathBuf,

        /// Confidence threshold (0.0-1.0)
        #[arg(long)]
        confidence: Option<f32>,

        /// Directory to save the processed video to
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Run a live detection stream
    Stream {
        /// Confidence threshold (0.0-1.0)
        #[arg(long)]
        confidence: Option<f32>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,

        /// Write the last rendered frame to this file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Check that the service is up
    Health,
}

impl Command {
    fn into_action(self, config: &Config) -> Action {
        let default_confidence = config.detection.default_confidence;
        match self {
            Command::Image {
                file,
                confidence,
                download,
            } => Action::Image {
                file,
                confidence: confidence.unwrap_or(default_confidence),
                download,
            },
            Command::Video {
                file,
                confidence,
                download,
            } => Action::Video {
                file,
                confidence: confidence.unwrap_or(default_confidence),
                download,
            },
            Command::Stream {
                confidence,
                duration,
                snapshot,
            } => Action::Stream {
                confidence: confidence.unwrap_or(default_confidence),
                duration: duration.map(Duration::from_secs),
                snapshot,
            },
            Command::Health => Action::Health,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the rendered panels.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = resolve_config(cli.config.as_deref())?;
    validate_config(&config).context("Configuration validation failed")?;
    info!("Using service at {}", config.service.base_url);

    let dashboard = Dashboard::new(&config).context("Failed to set up the dashboard")?;

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = interrupt_tx.send(true);
    });

    let action = cli.command.into_action(&config);
    let outcome = commands::execute(&dashboard, &config, action, interrupt_rx).await;

    // Leaving is a page exit: release whatever the service still holds.
    dashboard.unload();
    tokio::time::sleep(Duration::from_millis(config.exit.grace_ms)).await;

    if cli.metrics {
        print!("{}", metrics::gather_text());
    }
    outcome
}

/// Load the named config file, or the default one if it exists, or defaults.
fn resolve_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                info!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                return load_default_config().context("Failed to load configuration");
            }
            default
        }
    };

    info!("Loading configuration from {:?}", path);
    load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_confidence_defaults_to_config() {
        let mut config = Config::default();
        config.detection.default_confidence = 0.35;

        let cli = Cli::parse_from(["lookout", "image", "street.jpg"]);
        assert_eq!(
            cli.command.into_action(&config),
            Action::Image {
                file: PathBuf::from("street.jpg"),
                confidence: 0.35,
                download: None,
            }
        );

        let cli = Cli::parse_from(["lookout", "stream", "--confidence", "0.8", "--duration", "5"]);
        assert_eq!(
            cli.command.into_action(&config),
            Action::Stream {
                confidence: 0.8,
                duration: Some(Duration::from_secs(5)),
                snapshot: None,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["lookout", "health", "--metrics", "--config", "x.toml"]);
        assert!(cli.metrics);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_resolve_named_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nbase_url = \"http://detector.local:8000\"").unwrap();

        let config = resolve_config(Some(file.path())).unwrap();
        assert_eq!(config.service.base_url, "http://detector.local:8000");
    }

    #[test]
    fn test_resolve_missing_named_config_fails() {
        assert!(resolve_config(Some(Path::new("/nonexistent/lookout.toml"))).is_err());
    }
}
