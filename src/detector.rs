use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::errors::{Result, SentinelError};
use crate::models::BoundingBox;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectorBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<&DetectorBox> for BoundingBox {
    fn from(b: &DetectorBox) -> Self {
        BoundingBox {
            x: b.x.round() as i64,
            y: b.y.round() as i64,
            width: b.width.round() as i64,
            height: b.height.round() as i64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub label: String,
    pub confidence: f64,
    pub bounding_box: DetectorBox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorResponse {
    #[serde(default)]
    pub detections: Vec<DetectionResult>,
    #[serde(default)]
    pub inference_time: f64,  // seconds
    #[serde(default)]
    pub model_info: serde_json::Value,
    pub stream_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool { true }

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorHealth {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    pub version: Option<String>,
}

/// The external inference service.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, stream_id: &str, image: Bytes) -> Result<DetectorResponse>;
    async fn health(&self) -> Result<DetectorHealth>;
}

/// Talks to the detector over HTTP: `POST /detect` with a multipart `file`.
pub struct HttpDetector {
    base_url: String,
    confidence_threshold: Option<f32>,
    client: reqwest::Client,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            confidence_threshold: config.confidence_threshold,
            client,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, stream_id: &str, image: Bytes) -> Result<DetectorResponse> {
        let size = image.len();
        let part = Part::stream(reqwest::Body::from(image))
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let mut form = Form::new()
            .part("file", part)
            .text("streamId", stream_id.to_string());
        if let Some(threshold) = self.confidence_threshold {
            form = form.text("confidenceThreshold", threshold.to_string());
        }

        let response = self.client
            .post(format!("{}/detect", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SentinelError::detector(format!(
                "Detector returned {} for stream '{}': {}", status, stream_id, body
            )));
        }

        let parsed: DetectorResponse = response.json().await?;
        debug!(
            stream_id = %stream_id,
            bytes = size,
            detections = parsed.detections.len(),
            inference_time = parsed.inference_time,
            "detector response"
        );
        Ok(parsed)
    }

    async fn health(&self) -> Result<DetectorHealth> {
        let response = self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SentinelError::detector(format!("Detector health check returned {}", status)));
        }
        Ok(response.json().await?)
    }
}
