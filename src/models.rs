use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SentinelError};

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl StreamStatus {
    /// Edges of the stream lifecycle. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: StreamStatus) -> bool {
        use StreamStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Starting | StreamStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Stopped => "STOPPED",
            StreamStatus::Starting => "STARTING",
            StreamStatus::Running => "RUNNING",
            StreamStatus::Stopping => "STOPPING",
            StreamStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamStatus {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STOPPED" => Ok(StreamStatus::Stopped),
            "STARTING" => Ok(StreamStatus::Starting),
            "RUNNING" => Ok(StreamStatus::Running),
            "STOPPING" => Ok(StreamStatus::Stopping),
            "ERROR" => Ok(StreamStatus::Error),
            other => Err(SentinelError::validation(format!("Unknown stream status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub fps: u32,
    pub detection_enabled: bool,
    pub status: StreamStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub avg_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    /// Minimum spacing between forwarded frames, rounded up to the next
    /// nanosecond so the gate never runs faster than `fps`.
    pub fn frame_interval(&self) -> std::time::Duration {
        let fps = self.fps.clamp(MIN_FPS, MAX_FPS) as u64;
        std::time::Duration::from_nanos(1_000_000_000u64.div_ceil(fps))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStream {
    pub name: String,
    pub source_url: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_detection_enabled")]
    pub detection_enabled: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

fn default_fps() -> u32 { 5 }
fn default_detection_enabled() -> bool { true }

impl NewStream {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SentinelError::validation("Stream name is required"));
        }
        validate_source_url(&self.source_url)?;
        validate_fps(self.fps)
    }
}

/// Partial update of a stream's operator-editable fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUpdate {
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub fps: Option<u32>,
    pub detection_enabled: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StreamUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(SentinelError::validation("Stream name must not be empty"));
            }
        }
        if let Some(url) = &self.source_url {
            validate_source_url(url)?;
        }
        if let Some(fps) = self.fps {
            validate_fps(fps)?;
        }
        Ok(())
    }

    /// True when applying this update to `stream` changes how the decoder must be run.
    pub fn requires_restart(&self, stream: &Stream) -> bool {
        self.source_url.as_ref().is_some_and(|u| *u != stream.source_url)
            || self.fps.is_some_and(|f| f != stream.fps)
    }

    pub fn apply_to(&self, stream: &mut Stream) {
        if let Some(name) = &self.name {
            stream.name = name.clone();
        }
        if let Some(url) = &self.source_url {
            stream.source_url = url.clone();
        }
        if let Some(fps) = self.fps {
            stream.fps = fps;
        }
        if let Some(enabled) = self.detection_enabled {
            stream.detection_enabled = enabled;
        }
        if self.latitude.is_some() {
            stream.latitude = self.latitude;
        }
        if self.longitude.is_some() {
            stream.longitude = self.longitude;
        }
    }
}

fn validate_fps(fps: u32) -> Result<()> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(SentinelError::validation(format!(
            "Frame rate must be between {} and {}, got {}", MIN_FPS, MAX_FPS, fps
        )));
    }
    Ok(())
}

fn validate_source_url(source_url: &str) -> Result<()> {
    let url = url::Url::parse(source_url)
        .map_err(|e| SentinelError::validation(format!("Invalid source URL '{}': {}", source_url, e)))?;
    if url.host_str().is_none() && url.scheme() != "file" {
        return Err(SentinelError::validation(format!("Source URL '{}' has no host", source_url)));
    }
    Ok(())
}

/// One decoded JPEG image pulled from a stream's decoder.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: String,
    pub captured_at: DateTime<Utc>,
    pub received_at: tokio::time::Instant,
    pub data: Bytes,
}

impl Frame {
    pub fn new(stream_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            stream_id: stream_id.into(),
            captured_at: Utc::now(),
            received_at: tokio::time::Instant::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectionType {
    Fire,
    Smoke,
    Hotspot,
    Other,
}

impl DetectionType {
    pub fn from_label(label: &str) -> Self {
        let label = label.to_ascii_lowercase();
        if label.contains("fire") || label.contains("flame") {
            DetectionType::Fire
        } else if label.contains("smoke") {
            DetectionType::Smoke
        } else if label.contains("hotspot") || label.contains("hot_spot") || label.contains("heat") {
            DetectionType::Hotspot
        } else {
            DetectionType::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionType::Fire => "fire",
            DetectionType::Smoke => "smoke",
            DetectionType::Hotspot => "hotspot",
            DetectionType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "fire" => DetectionType::Fire,
            "smoke" => DetectionType::Smoke,
            "hotspot" => DetectionType::Hotspot,
            _ => DetectionType::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: i64,
    pub stream_id: String,
    pub captured_at: DateTime<Utc>,
    pub detection_type: DetectionType,
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub image_path: String,
    pub metadata: serde_json::Value,
}

/// A detection ready to be inserted; the database assigns the id.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub stream_id: String,
    pub captured_at: DateTime<Utc>,
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub image_path: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionQuery {
    pub stream_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// Point-in-time health of a stream as reported to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    pub stream_id: String,
    pub status: StreamStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub decoder_active: bool,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub avg_latency_ms: Option<f64>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use StreamStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));
        assert!(Error.can_transition_to(Starting));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [StreamStatus::Stopped, StreamStatus::Starting, StreamStatus::Running,
                       StreamStatus::Stopping, StreamStatus::Error] {
            assert_eq!(status.as_str().parse::<StreamStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<StreamStatus>().is_err());
    }

    #[test]
    fn test_new_stream_validation() {
        let mut new = NewStream {
            name: "North ridge".to_string(),
            source_url: "rtsp://10.0.0.5:554/live".to_string(),
            fps: 5,
            detection_enabled: true,
            latitude: None,
            longitude: None,
        };
        assert!(new.validate().is_ok());

        new.fps = 31;
        assert!(new.validate().is_err());
        new.fps = 0;
        assert!(new.validate().is_err());

        new.fps = 5;
        new.source_url = "not-a-url".to_string();
        assert!(new.validate().is_err());
    }

    #[test]
    fn test_update_requires_restart_only_for_decoder_fields() {
        let now = Utc::now();
        let stream = Stream {
            id: "s1".to_string(),
            name: "cam".to_string(),
            source_url: "rtsp://cam/1".to_string(),
            fps: 5,
            detection_enabled: true,
            status: StreamStatus::Running,
            last_heartbeat_at: None,
            last_frame_at: None,
            avg_latency_ms: None,
            last_error: None,
            latitude: None,
            longitude: None,
            created_at: now,
            updated_at: now,
        };

        let rename = StreamUpdate { name: Some("renamed".to_string()), ..Default::default() };
        assert!(!rename.requires_restart(&stream));

        let same_fps = StreamUpdate { fps: Some(5), ..Default::default() };
        assert!(!same_fps.requires_restart(&stream));

        let new_url = StreamUpdate { source_url: Some("rtsp://cam/2".to_string()), ..Default::default() };
        assert!(new_url.requires_restart(&stream));

        let new_fps = StreamUpdate { fps: Some(10), ..Default::default() };
        assert!(new_fps.requires_restart(&stream));
    }

    #[test]
    fn test_detection_type_from_label() {
        assert_eq!(DetectionType::from_label("Fire"), DetectionType::Fire);
        assert_eq!(DetectionType::from_label("smoke"), DetectionType::Smoke);
        assert_eq!(DetectionType::from_label("hotspot"), DetectionType::Hotspot);
        assert_eq!(DetectionType::from_label("person"), DetectionType::Other);
    }

    #[test]
    fn test_frame_interval_from_fps() {
        let now = Utc::now();
        let mut stream = Stream {
            id: "s".to_string(), name: "n".to_string(), source_url: "rtsp://h/x".to_string(),
            fps: 5, detection_enabled: true, status: StreamStatus::Stopped,
            last_heartbeat_at: None, last_frame_at: None, avg_latency_ms: None, last_error: None,
            latitude: None, longitude: None, created_at: now, updated_at: now,
        };
        assert_eq!(stream.frame_interval(), std::time::Duration::from_millis(200));
        stream.fps = 30;
        assert_eq!(stream.frame_interval(), std::time::Duration::from_nanos(33_333_334));
        assert!(stream.frame_interval() * 30 >= std::time::Duration::from_secs(1));
        stream.fps = 7;
        assert!(stream.frame_interval() * 7 >= std::time::Duration::from_secs(1));
    }
}
