use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("duplicate camera id: {0}")]
    DuplicateCamera(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub url: String,
}

fn default_preroll_segments() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_preroll_segments")]
    pub preroll_segments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            preroll_segments: default_preroll_segments(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_segment_secs() -> u64 {
    6
}

fn default_restart_backoff_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    3900
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

fn default_stall_secs() -> u64 {
    150
}

fn default_event_record_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Live segment length; the single value every ffmpeg invocation shares.
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u64,
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default = "default_stall_secs")]
    pub stall_secs: u64,
    #[serde(default = "default_event_record_secs")]
    pub event_record_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            segment_secs: default_segment_secs(),
            restart_backoff_secs: default_restart_backoff_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_secs: default_retention_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            stall_secs: default_stall_secs(),
            event_record_secs: default_event_record_secs(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }

        let mut seen = std::collections::HashSet::new();
        for cam in &config.cameras {
            if !seen.insert(cam.id.as_str()) {
                return Err(ConfigError::DuplicateCamera(cam.id.clone()));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse(
            r#"
            [[cameras]]
            id = "cam1"
            name = "Front Door"
            url = "rtsp://10.0.0.5/stream"
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.preroll_segments, 10);
        assert_eq!(config.recorder.segment_secs, 6);
        assert_eq!(config.recorder.restart_backoff_secs, 10);
        assert_eq!(config.recorder.stall_secs, 150);
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.cameras.len(), 1);
    }

    #[test]
    fn test_no_cameras() {
        assert!(matches!(
            Config::parse("[http]\nport = 9000\n"),
            Err(ConfigError::NoCameras)
        ));
    }

    #[test]
    fn test_duplicate_camera_id() {
        let result = Config::parse(
            r#"
            [[cameras]]
            id = "cam1"
            name = "A"
            url = "rtsp://a"

            [[cameras]]
            id = "cam1"
            name = "B"
            url = "rtsp://b"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateCamera(id)) if id == "cam1"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse(
            r#"
            [buffer]
            preroll_segments = 20

            [recorder]
            segment_secs = 4
            event_record_secs = 60

            [[cameras]]
            id = "cam1"
            name = "Yard"
            url = "rtsp://10.0.0.6/stream"
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.preroll_segments, 20);
        assert_eq!(config.recorder.segment_secs, 4);
        assert_eq!(config.recorder.event_record_secs, 60);
    }
}
