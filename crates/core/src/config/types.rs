use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub exit: ExitConfig,
}

/// Media-analysis service endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Base URL of the service (e.g., "http://127.0.0.1:5000")
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u32,
    /// Engine.IO endpoint path, relative to the base URL
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Socket.IO namespace carrying frame events
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            socket_path: default_socket_path(),
            namespace: default_namespace(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_request_timeout() -> u32 {
    30
}

fn default_socket_path() -> String {
    "socket.io".to_string()
}

fn default_namespace() -> String {
    "/stream".to_string()
}

/// Detection parameters shared by all three modes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Confidence threshold used when none is given (0.0-1.0)
    #[serde(default = "default_confidence")]
    pub default_confidence: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            default_confidence: default_confidence(),
        }
    }
}

fn default_confidence() -> f32 {
    0.5
}

/// Video job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    /// How often to poll the job status (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Ask the service to keep the processed video.
    #[serde(default = "default_save_output")]
    pub save_output: bool,

    /// Consecutive status-check errors tolerated before the job is failed.
    /// 0 means the first failing status check fails the job.
    #[serde(default)]
    pub max_missed_polls: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            save_output: default_save_output(),
            max_missed_polls: 0,
        }
    }
}

fn default_poll_interval() -> u64 {
    2000 // 2 seconds
}

fn default_save_output() -> bool {
    true
}

/// Live stream configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Timeout for opening the channel, including the namespace handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u32,

    /// Capacity of the inbound queue for error and disconnect events.
    /// Frames are not queued: only the latest one is kept.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_connect_timeout() -> u32 {
    10
}

fn default_event_buffer() -> usize {
    16
}

/// Exit-time behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExitConfig {
    /// Time given to queued beacons before the process exits (milliseconds).
    #[serde(default = "default_grace")]
    pub grace_ms: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace(),
        }
    }
}

fn default_grace() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.service.base_url, "http://127.0.0.1:5000");
        assert_eq!(config.service.request_timeout_secs, 30);
        assert_eq!(config.service.namespace, "/stream");
        assert_eq!(config.detection.default_confidence, 0.5);
        assert_eq!(config.video.poll_interval_ms, 2000);
        assert!(config.video.save_output);
        assert_eq!(config.video.max_missed_polls, 0);
        assert_eq!(config.stream.connect_timeout_secs, 10);
        assert_eq!(config.exit.grace_ms, 500);
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let toml = r#"
[service]
base_url = "http://detector.local:8000"

[video]
poll_interval_ms = 500
save_output = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.service.base_url, "http://detector.local:8000");
        assert_eq!(config.service.socket_path, "socket.io");
        assert_eq!(config.video.poll_interval_ms, 500);
        assert!(!config.video.save_output);
        assert_eq!(config.detection.default_confidence, 0.5);
    }

    #[test]
    fn test_deserialize_full_config() {
        let toml = r#"
[service]
base_url = "https://vision.example.com"
request_timeout_secs = 5
socket_path = "ws"
namespace = "/live"

[detection]
default_confidence = 0.35

[video]
poll_interval_ms = 1000
save_output = true
max_missed_polls = 3

[stream]
connect_timeout_secs = 2
event_buffer = 4

[exit]
grace_ms = 100
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.service.request_timeout_secs, 5);
        assert_eq!(config.service.socket_path, "ws");
        assert_eq!(config.service.namespace, "/live");
        assert_eq!(config.detection.default_confidence, 0.35);
        assert_eq!(config.video.max_missed_polls, 3);
        assert_eq!(config.stream.event_buffer, 4);
        assert_eq!(config.exit.grace_ms, 100);
    }
}
