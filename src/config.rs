use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::errors::{Result, SentinelError};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
    pub admin_token: Option<String>,  // Bearer token required for mutating endpoints
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,     // Capacity of the real-time event broadcast channel
}

fn default_event_buffer() -> usize { 1024 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allow_origin: Some("*".to_string()),
            admin_token: None,
            event_buffer_size: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "data/sentinel.db".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub base_url: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,  // Per-stream ceiling of outstanding detector calls
    pub confidence_threshold: Option<f32>,
}

fn default_detector_timeout_ms() -> u64 { 5_000 }
fn default_max_in_flight() -> usize { 5 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_ms: default_detector_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            confidence_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub ffmpeg_path: String,
    pub rtsp_transport: String,
    pub jpeg_quality: u8,               // -q:v (2-31, lower is better)
    pub scratch_directory: String,      // Per-stream working directories live below this
    pub chunk_read_size: Option<usize>,
    // Full argument list override; "{url}" and "{fps}" are substituted
    pub command: Option<Vec<String>>,
    pub log_stderr: Option<String>,     // "file", "console" or unset to discard
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            rtsp_transport: "tcp".to_string(),
            jpeg_quality: 5,
            scratch_directory: "data/scratch".to_string(),
            chunk_read_size: None,
            command: None,
            log_stderr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub start_attempts: u32,
    pub start_backoff_ms: u64,
    pub max_jobs: usize,  // Finished jobs kept for status queries
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            stale_after_secs: 30,
            start_attempts: 3,
            start_backoff_ms: 2_000,
            max_jobs: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_size: usize,
    pub persist_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window_size: 100, persist_interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub frame_storage_root: String,
    pub detection_retention: String,  // e.g. "7d", "12h"
    pub cleanup_interval_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            frame_storage_root: "data/frames".to_string(),
            detection_retention: "7d".to_string(),
            cleanup_interval_hours: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        config.validate()?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.detector.base_url)?;
        if self.detector.max_in_flight == 0 {
            return Err(SentinelError::config("detector.max_in_flight must be at least 1"));
        }
        if self.metrics.window_size == 0 {
            return Err(SentinelError::config("metrics.window_size must be at least 1"));
        }
        if self.lifecycle.start_attempts == 0 {
            return Err(SentinelError::config("lifecycle.start_attempts must be at least 1"));
        }
        if self.lifecycle.heartbeat_interval_secs == 0 {
            return Err(SentinelError::config("lifecycle.heartbeat_interval_secs must be at least 1"));
        }
        crate::utils::parse_duration(&self.storage.detection_retention)?;
        if let Some(mqtt) = self.mqtt.as_ref().filter(|m| m.enabled) {
            if mqtt.client_id.trim().is_empty() {
                return Err(SentinelError::config("mqtt.client_id must not be empty"));
            }
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.storage.frame_storage_root, &self.ingestion.scratch_directory] {
            if !Path::new(dir).exists() {
                fs::create_dir_all(dir)?;
                info!("Created directory '{}'", dir);
            }
        }
        Ok(())
    }
}
