//! Subcommand implementations.
//!
//! Each command drives one orchestrator of the dashboard and prints its
//! panel as it changes. Exit-time teardown is left to the caller.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use lookout_core::{ActionError, Config, Dashboard, JobPhase, PendingUpload};

use crate::render::{self, ProgressPrinter};

/// What the user asked for, resolved against the configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Image {
        file: PathBuf,
        confidence: f32,
        download: Option<PathBuf>,
    },
    Video {
        file: PathBuf,
        confidence: f32,
        download: Option<PathBuf>,
    },
    Stream {
        confidence: f32,
        duration: Option<Duration>,
        snapshot: Option<PathBuf>,
    },
    Health,
}

/// Run `action` until it finishes or the process is interrupted.
pub async fn execute(
    dashboard: &Dashboard,
    config: &Config,
    action: Action,
    interrupted: watch::Receiver<bool>,
) -> Result<()> {
    debug!("Running {:?} against {}", action, config.service.base_url);
    match action {
        Action::Image {
            file,
            confidence,
            download,
        } => {
            until_interrupted(
                interrupted,
                image(dashboard, &file, confidence, download.as_deref()),
            )
            .await
        }
        Action::Video {
            file,
            confidence,
            download,
        } => {
            until_interrupted(
                interrupted,
                video(dashboard, &file, confidence, download.as_deref()),
            )
            .await
        }
        Action::Stream {
            confidence,
            duration,
            snapshot,
        } => stream(dashboard, confidence, duration, snapshot.as_deref(), interrupted).await,
        Action::Health => until_interrupted(interrupted, health(dashboard)).await,
    }
}

async fn until_interrupted(
    mut interrupted: watch::Receiver<bool>,
    work: impl Future<Output = Result<()>>,
) -> Result<()> {
    tokio::select! {
        result = work => result,
        _ = interrupted.wait_for(|i| *i) => {
            info!("Interrupted");
            Ok(())
        }
    }
}

/// Turn an orchestrator failure into the line shown to the user.
fn banner(err: ActionError) -> anyhow::Error {
    anyhow!(err.user_message())
}

async fn read_upload(file: &Path) -> Result<PendingUpload> {
    PendingUpload::from_path(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))
}

async fn image(
    dashboard: &Dashboard,
    file: &Path,
    confidence: f32,
    download: Option<&Path>,
) -> Result<()> {
    let image = dashboard.image();
    image.select(Some(read_upload(file).await?)).await;

    println!("Detecting objects in {}...", file.display());
    let view = image.submit(confidence).await.map_err(banner)?;
    println!("{}", render::image_result(&view));

    if let Some(dir) = download {
        let name = render::artifact_file_name(&view.processed_image_url, "processed_image");
        let path = save_artifact(dashboard, &view.processed_image_url, dir, &name).await?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn video(
    dashboard: &Dashboard,
    file: &Path,
    confidence: f32,
    download: Option<&Path>,
) -> Result<()> {
    let video = dashboard.video();
    video.select(Some(read_upload(file).await?)).await;

    let mut panel_rx = video.subscribe();
    let task_id = video.submit(confidence).await.map_err(banner)?;
    println!("Submitted {} as task {}", file.display(), task_id);

    let mut printer = ProgressPrinter::default();
    if let Some(line) = printer.update(&panel_rx.borrow_and_update()) {
        println!("{}", line);
    }

    let outcome = loop {
        tokio::select! {
            phase = video.wait_for_terminal() => break phase,
            changed = panel_rx.changed() => {
                if changed.is_err() {
                    break None;
                }
                if let Some(line) = printer.update(&panel_rx.borrow_and_update()) {
                    println!("{}", line);
                }
            }
        }
    };

    match outcome {
        Some(JobPhase::Completed { .. }) => {}
        Some(failed) => {
            if let Some(err) = failed.error() {
                return Err(banner(err));
            }
            bail!("Video job ended as {}", failed.as_str());
        }
        None => bail!("Video job was cancelled"),
    }

    let Some(view) = video.panel().surface.result().cloned() else {
        bail!("Video job completed without a result");
    };
    println!("{}", render::video_result(&view));

    if let Some(dir) = download {
        let path = save_artifact(dashboard, &view.download_url, dir, &view.download_name).await?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn stream(
    dashboard: &Dashboard,
    confidence: f32,
    duration: Option<Duration>,
    snapshot: Option<&Path>,
    mut interrupted: watch::Receiver<bool>,
) -> Result<()> {
    let stream = dashboard.stream();
    let session = stream.start(confidence).await.map_err(banner)?;
    println!(
        "Stream {} live at confidence {}",
        session.stream_id, session.confidence_threshold
    );

    let mut panel_rx = stream.subscribe();
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut last_frame: Option<String> = None;
    let mut last_status = String::new();
    let mut last_error: Option<String> = None;

    let lost = loop {
        tokio::select! {
            _ = &mut deadline => break None,
            _ = interrupted.wait_for(|i| *i) => {
                info!("Interrupted, stopping stream");
                break None;
            }
            changed = panel_rx.changed() => {
                if changed.is_err() {
                    break Some("Stream orchestrator went away".to_string());
                }
                let panel = panel_rx.borrow_and_update().clone();

                if panel.error != last_error {
                    if let Some(error) = &panel.error {
                        eprintln!("Error: {}", error);
                    }
                    last_error = panel.error.clone();
                }
                if !panel.live {
                    break Some(
                        panel
                            .error
                            .unwrap_or_else(|| "Stream ended".to_string()),
                    );
                }
                if panel.frame.is_some() {
                    last_frame = panel.frame.clone();
                }
                let status = render::stream_status(&panel);
                if status != last_status {
                    println!("{}", status);
                    last_status = status;
                }
            }
        }
    };

    if let (Some(path), Some(frame)) = (snapshot, &last_frame) {
        write_snapshot(path, frame).await?;
        println!("Saved snapshot {}", path.display());
    }

    if let Some(reason) = lost {
        bail!(reason);
    }

    stream.stop().await.map_err(banner)?;
    println!("Stream {} stopped", session.stream_id);
    Ok(())
}

async fn health(dashboard: &Dashboard) -> Result<()> {
    let status = dashboard.health().await.map_err(banner)?;
    println!("{}", render::health(&status));
    Ok(())
}

async fn save_artifact(
    dashboard: &Dashboard,
    reference: &str,
    dir: &Path,
    name: &str,
) -> Result<PathBuf> {
    let bytes = dashboard.fetch_artifact(reference).await.map_err(banner)?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Downloaded {} ({} bytes)", reference, bytes.len());
    Ok(path)
}

/// Decode a frame payload: base64, optionally behind a data-URL prefix.
pub fn decode_frame(payload: &str) -> Result<Vec<u8>> {
    let data = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    STANDARD
        .decode(data.trim())
        .context("Frame is not valid base64")
}

async fn write_snapshot(path: &Path, frame: &str) -> Result<()> {
    let bytes = match decode_frame(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Not writing snapshot: {:#}", e);
            return Ok(());
        }
    };
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
