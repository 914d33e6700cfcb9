//! Prometheus metrics for the client.
//!
//! This module provides metrics for:
//! - Cleanup protocol and beacons
//! - Image submissions and video jobs (submissions, polls, durations)
//! - Live stream sessions and the event channel

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Registry holding every metric of this crate.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    for metric in all_metrics() {
        if let Err(e) = registry.register(metric) {
            warn!("Failed to register metric: {}", e);
        }
    }
    registry
});

// =============================================================================
// Cleanup
// =============================================================================

/// Cleanup requests by mode and result.
pub static CLEANUP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_cleanup_requests_total", "Total cleanup requests"),
        &["mode", "result"], // mode: "awaited", "beacon"
    )
    .unwrap()
});

/// Fire-and-forget requests by outcome.
pub static BEACONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_beacons_total", "Total beacons handed off"),
        &["result"], // "queued", "detached", "dropped"
    )
    .unwrap()
});

// =============================================================================
// Image & Video
// =============================================================================

/// Image submissions by result.
pub static IMAGE_SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_image_submissions_total", "Total image submissions"),
        &["result"], // "ok", "rejected", "failed"
    )
    .unwrap()
});

/// Video jobs by lifecycle event.
pub static VIDEO_JOBS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_video_jobs_total", "Total video job events"),
        &["event"], // "submitted", "completed", "failed", "cancelled", "rejected"
    )
    .unwrap()
});

/// Status polls by result.
pub static VIDEO_POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_video_polls_total", "Total video status polls"),
        &["result"], // "ok", "unknown", "error"
    )
    .unwrap()
});

/// Video job duration from acceptance to terminal state.
pub static VIDEO_JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "lookout_video_job_duration_seconds",
            "Duration of video jobs from acceptance to terminal state",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Live Stream
// =============================================================================

/// Stream session events.
pub static STREAM_SESSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_stream_sessions_total", "Total stream session events"),
        &["event"], // "started", "start_failed", "stopped", "stop_failed", "disconnected"
    )
    .unwrap()
});

/// Frames by what happened to them.
pub static STREAM_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lookout_stream_frames_total", "Total stream frames"),
        &["result"], // "received", "rendered", "ignored"
    )
    .unwrap()
});

/// Event channel connection attempts.
pub static CHANNEL_CONNECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "lookout_channel_connections_total",
            "Total event channel connection attempts",
        ),
        &["result"], // "ok", "failed", "closed"
    )
    .unwrap()
});

/// Whether a stream session is live (1) or not (0).
pub static STREAM_LIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("lookout_stream_live", "Whether a stream session is live").unwrap()
});

/// Get all metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Cleanup
        Box::new(CLEANUP_REQUESTS.clone()),
        Box::new(BEACONS_TOTAL.clone()),
        // Image & video
        Box::new(IMAGE_SUBMISSIONS.clone()),
        Box::new(VIDEO_JOBS.clone()),
        Box::new(VIDEO_POLLS.clone()),
        Box::new(VIDEO_JOB_DURATION.clone()),
        // Stream
        Box::new(STREAM_SESSIONS.clone()),
        Box::new(STREAM_FRAMES.clone()),
        Box::new(CHANNEL_CONNECTIONS.clone()),
        Box::new(STREAM_LIVE.clone()),
    ]
}

/// Encode all metrics as Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
