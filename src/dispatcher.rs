use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, warn};

use crate::config::DetectorConfig;
use crate::database::DatabaseProvider;
use crate::detector::{Detector, DetectorResponse};
use crate::events::{EventBus, StreamEvent};
use crate::metrics::MetricsAggregator;
use crate::models::{BoundingBox, Detection, DetectionType, Frame, NewDetection, Stream};
use crate::storage::FrameStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    UnknownStream,
    Disabled,
    /// Backpressure: too many detector calls already outstanding.
    Dropped,
    Completed { detections: usize },
}

/// Holds one in-flight slot; released on drop whatever the call outcome.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct DetectionDispatcher {
    database: Arc<dyn DatabaseProvider>,
    detector: Arc<dyn Detector>,
    storage: FrameStorage,
    events: EventBus,
    metrics: Arc<MetricsAggregator>,
    in_flight: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    max_in_flight: usize,
    timeout: Duration,
}

impl DetectionDispatcher {
    pub fn new(
        config: &DetectorConfig,
        database: Arc<dyn DatabaseProvider>,
        detector: Arc<dyn Detector>,
        storage: FrameStorage,
        events: EventBus,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            database,
            detector,
            storage,
            events,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: config.max_in_flight,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Outstanding detector calls for a stream.
    pub fn in_flight(&self, stream_id: &str) -> usize {
        self.in_flight
            .lock()
            .ok()
            .and_then(|map| map.get(stream_id).map(|c| c.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    pub fn forget_stream(&self, stream_id: &str) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(stream_id);
        }
    }

    fn try_acquire(&self, stream_id: &str) -> Option<InFlightGuard> {
        let counter = {
            let mut map = self.in_flight.lock().ok()?;
            map.entry(stream_id.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };
        let max = self.max_in_flight;
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| InFlightGuard { counter })
    }

    /// Run one frame through the detector. Never fails; every problem is
    /// logged and degrades to fewer (or zero) detections.
    pub async fn process_frame(&self, frame: Frame) -> DispatchOutcome {
        let stream = match self.database.get_stream(&frame.stream_id).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                debug!("Frame for unknown stream '{}' ignored", frame.stream_id);
                return DispatchOutcome::UnknownStream;
            }
            Err(e) => {
                error!("Failed to look up stream '{}': {}", frame.stream_id, e);
                return DispatchOutcome::UnknownStream;
            }
        };

        if !stream.detection_enabled {
            return DispatchOutcome::Disabled;
        }

        let Some(_slot) = self.try_acquire(&stream.id) else {
            warn!(
                stream_id = %stream.id,
                max_in_flight = self.max_in_flight,
                "detector busy, frame dropped"
            );
            return DispatchOutcome::Dropped;
        };

        let result = tokio::time::timeout(
            self.timeout,
            self.detector.detect(&stream.id, frame.data.clone()),
        ).await;

        // Timeouts and errors are samples too.
        let latency_ms = frame.received_at.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record(&stream.id, latency_ms, frame.captured_at).await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(stream_id = %stream.id, error = %e, "detector call failed");
                return DispatchOutcome::Completed { detections: 0 };
            }
            Err(_) => {
                warn!(stream_id = %stream.id, timeout_ms = self.timeout.as_millis() as u64, "detector call timed out");
                return DispatchOutcome::Completed { detections: 0 };
            }
        };

        if response.detections.is_empty() {
            return DispatchOutcome::Completed { detections: 0 };
        }

        let saved = self.persist_detections(&stream, &frame, &response).await;
        DispatchOutcome::Completed { detections: saved }
    }

    async fn persist_detections(&self, stream: &Stream, frame: &Frame, response: &DetectorResponse) -> usize {
        let image_path = match self.storage.save_frame(&stream.id, frame.captured_at, &frame.data).await {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to store frame for stream '{}', abandoning {} detection(s): {}",
                       stream.id, response.detections.len(), e);
                return 0;
            }
        };

        let metadata = frame_metadata(stream, frame, response);
        let mut saved = 0;

        for result in &response.detections {
            let new_detection = NewDetection {
                stream_id: stream.id.clone(),
                captured_at: frame.captured_at,
                label: result.label.clone(),
                confidence: result.confidence,
                bounding_box: BoundingBox::from(&result.bounding_box),
                image_path: image_path.clone(),
                metadata: metadata.clone(),
            };

            match self.database.insert_detection(&new_detection).await {
                Ok(id) => {
                    saved += 1;
                    self.events.publish(StreamEvent::Detection {
                        stream_id: stream.id.clone(),
                        detection: Detection {
                            id,
                            stream_id: new_detection.stream_id,
                            captured_at: new_detection.captured_at,
                            detection_type: DetectionType::from_label(&new_detection.label),
                            label: new_detection.label,
                            confidence: new_detection.confidence,
                            bounding_box: new_detection.bounding_box,
                            image_path: new_detection.image_path,
                            metadata: new_detection.metadata,
                        },
                    });
                }
                Err(e) => error!("Failed to save '{}' detection for stream '{}': {}", result.label, stream.id, e),
            }
        }

        debug!(stream_id = %stream.id, saved, path = %image_path, "detections persisted");
        saved
    }
}

fn frame_metadata(stream: &Stream, frame: &Frame, response: &DetectorResponse) -> serde_json::Value {
    let mut metadata = json!({
        "inferenceTime": response.inference_time,
        "frameBytes": frame.data.len(),
    });
    if let Ok((width, height)) = image::ImageReader::with_format(Cursor::new(frame.data.as_ref()), image::ImageFormat::Jpeg)
        .into_dimensions()
    {
        metadata["frameWidth"] = json!(width);
        metadata["frameHeight"] = json!(height);
    }
    if let (Some(lat), Some(lon)) = (stream.latitude, stream.longitude) {
        metadata["geo"] = json!({ "latitude": lat, "longitude": lon });
    }
    metadata
}
