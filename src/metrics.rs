use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::database::DatabaseProvider;

/// Fixed-size window of the most recent latency samples.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: VecDeque::with_capacity(capacity), capacity, sum: 0.0 }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub avg_latency_ms: Option<f64>,
    pub samples: usize,
    pub frames_processed: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct StreamMetrics {
    window: LatencyWindow,
    frames_processed: u64,
    last_frame_at: Option<DateTime<Utc>>,
    last_persist: Option<Instant>,
}

impl StreamMetrics {
    fn new(window_size: usize) -> Self {
        Self {
            window: LatencyWindow::new(window_size),
            frames_processed: 0,
            last_frame_at: None,
            last_persist: None,
        }
    }

    fn should_persist(&mut self, now: Instant, interval: Duration) -> bool {
        match self.last_persist {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last_persist = Some(now);
                true
            }
        }
    }
}

/// Rolling per-stream latency averages, written to the stream record at
/// most once per persist interval.
pub struct MetricsAggregator {
    streams: Mutex<HashMap<String, StreamMetrics>>,
    database: Arc<dyn DatabaseProvider>,
    config: MetricsConfig,
}

impl MetricsAggregator {
    pub fn new(database: Arc<dyn DatabaseProvider>, config: MetricsConfig) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            database,
            config,
        }
    }

    /// Record one processed frame. Returns true when the average was persisted.
    pub async fn record(&self, stream_id: &str, latency_ms: f64, frame_at: DateTime<Utc>) -> bool {
        let interval = Duration::from_millis(self.config.persist_interval_ms);
        let to_persist = {
            let mut streams = self.streams.lock().await;
            let metrics = streams
                .entry(stream_id.to_string())
                .or_insert_with(|| StreamMetrics::new(self.config.window_size));
            metrics.window.push(latency_ms);
            metrics.frames_processed += 1;
            metrics.last_frame_at = Some(frame_at);

            if metrics.should_persist(Instant::now(), interval) {
                metrics.window.average()
            } else {
                None
            }
        };

        let Some(avg) = to_persist else {
            return false;
        };
        match self.database.update_stream_metrics(stream_id, avg, frame_at).await {
            Ok(()) => {
                debug!("Persisted metrics for stream '{}': avg latency {:.1}ms", stream_id, avg);
                true
            }
            Err(e) => {
                warn!("Failed to persist metrics for stream '{}': {}", stream_id, e);
                false
            }
        }
    }

    pub async fn snapshot(&self, stream_id: &str) -> Option<MetricsSnapshot> {
        let streams = self.streams.lock().await;
        streams.get(stream_id).map(|m| MetricsSnapshot {
            avg_latency_ms: m.window.average(),
            samples: m.window.len(),
            frames_processed: m.frames_processed,
            last_frame_at: m.last_frame_at,
        })
    }

    pub async fn reset(&self, stream_id: &str) {
        self.streams.lock().await.remove(stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;
    use crate::models::NewStream;

    #[test]
    fn test_window_keeps_latest_samples() {
        let mut window = LatencyWindow::new(100);
        assert_eq!(window.average(), None);
        for i in 1..=150 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 100);
        // Samples 51..=150 remain.
        assert_eq!(window.average(), Some(100.5));
    }

    #[test]
    fn test_persist_throttle() {
        let mut metrics = StreamMetrics::new(10);
        let base = Instant::now();
        let interval = Duration::from_millis(500);
        assert!(metrics.should_persist(base, interval));
        assert!(!metrics.should_persist(base + Duration::from_millis(100), interval));
        assert!(!metrics.should_persist(base + Duration::from_millis(499), interval));
        assert!(metrics.should_persist(base + Duration::from_millis(500), interval));
    }

    async fn setup(persist_interval_ms: u64) -> (Arc<SqliteDatabase>, MetricsAggregator, String) {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        db.initialize().await.unwrap();
        let stream = db.create_stream(&NewStream {
            name: "cam".to_string(),
            source_url: "rtsp://10.0.0.9/live".to_string(),
            fps: 5,
            detection_enabled: true,
            latitude: None,
            longitude: None,
        }).await.unwrap();
        let aggregator = MetricsAggregator::new(
            db.clone(),
            MetricsConfig { window_size: 100, persist_interval_ms },
        );
        (db, aggregator, stream.id)
    }

    #[tokio::test]
    async fn test_record_persists_at_most_once_per_interval() {
        let (db, aggregator, id) = setup(60_000).await;

        assert!(aggregator.record(&id, 100.0, Utc::now()).await);
        assert!(!aggregator.record(&id, 300.0, Utc::now()).await);
        assert!(!aggregator.record(&id, 500.0, Utc::now()).await);

        let stored = db.get_stream(&id).await.unwrap().unwrap();
        assert_eq!(stored.avg_latency_ms, Some(100.0));
        assert!(stored.last_frame_at.is_some());

        let snapshot = aggregator.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.avg_latency_ms, Some(300.0));
        assert_eq!(snapshot.frames_processed, 3);
    }

    #[tokio::test]
    async fn test_record_persists_rolling_average() {
        let (db, aggregator, id) = setup(0).await;

        aggregator.record(&id, 100.0, Utc::now()).await;
        aggregator.record(&id, 200.0, Utc::now()).await;

        let stored = db.get_stream(&id).await.unwrap().unwrap();
        assert_eq!(stored.avg_latency_ms, Some(150.0));

        aggregator.reset(&id).await;
        assert!(aggregator.snapshot(&id).await.is_none());
    }
}
