use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    BoundingBox, Detection, DetectionQuery, DetectionType, NewDetection, NewStream, Stream,
    StreamStatus,
};

const TABLE_STREAMS: &str = "streams";
const TABLE_DETECTIONS: &str = "detections";

#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn create_stream(&self, new_stream: &NewStream) -> Result<Stream>;

    async fn get_stream(&self, stream_id: &str) -> Result<Option<Stream>>;

    async fn list_streams(&self) -> Result<Vec<Stream>>;

    /// Persist the operator-editable fields of `stream` (name, url, fps, flags, location).
    async fn save_stream_config(&self, stream: &Stream) -> Result<()>;

    async fn delete_stream(&self, stream_id: &str) -> Result<bool>;

    async fn set_stream_status(
        &self,
        stream_id: &str,
        status: StreamStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    async fn update_heartbeat(&self, stream_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn update_stream_metrics(
        &self,
        stream_id: &str,
        avg_latency_ms: f64,
        last_frame_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Move every stream left in a transient or running state back to STOPPED.
    async fn reset_active_streams(&self) -> Result<u64>;

    async fn insert_detection(&self, detection: &NewDetection) -> Result<i64>;

    async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<Detection>>;

    async fn count_detections(&self, stream_id: &str) -> Result<i64>;

    async fn delete_old_detections(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePool::connect(&database_url).await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }
}

fn stream_from_row(row: &SqliteRow) -> Result<Stream> {
    let status: String = row.try_get("status")?;
    Ok(Stream {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_url: row.try_get("source_url")?,
        fps: row.try_get::<i64, _>("fps")? as u32,
        detection_enabled: row.try_get("detection_enabled")?,
        status: status.parse()?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        last_frame_at: row.try_get("last_frame_at")?,
        avg_latency_ms: row.try_get("avg_latency_ms")?,
        last_error: row.try_get("last_error")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn detection_from_row(row: &SqliteRow) -> Result<Detection> {
    let detection_type: String = row.try_get("detection_type")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Detection {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        captured_at: row.try_get("captured_at")?,
        detection_type: DetectionType::parse(&detection_type),
        label: row.try_get("label")?,
        confidence: row.try_get("confidence")?,
        bounding_box: BoundingBox {
            x: row.try_get("bbox_x")?,
            y: row.try_get("bbox_y")?,
            width: row.try_get("bbox_width")?,
            height: row.try_get("bbox_height")?,
        },
        image_path: row.try_get("image_path")?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

#[async_trait]
impl DatabaseProvider for SqliteDatabase {
    async fn initialize(&self) -> Result<()> {
        let create_streams_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_url TEXT NOT NULL,
                fps INTEGER NOT NULL,
                detection_enabled BOOLEAN NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'STOPPED',
                last_heartbeat_at TIMESTAMP,
                last_frame_at TIMESTAMP,
                avg_latency_ms REAL,
                last_error TEXT,
                latitude REAL,
                longitude REAL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
            TABLE_STREAMS
        );
        sqlx::query(&create_streams_query)
            .execute(&self.pool)
            .await?;

        let create_detections_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                captured_at TIMESTAMP NOT NULL,
                detection_type TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence REAL NOT NULL,
                bbox_x INTEGER NOT NULL,
                bbox_y INTEGER NOT NULL,
                bbox_width INTEGER NOT NULL,
                bbox_height INTEGER NOT NULL,
                image_path TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                FOREIGN KEY (stream_id) REFERENCES {}(id) ON DELETE CASCADE
            )
            "#,
            TABLE_DETECTIONS, TABLE_STREAMS
        );
        sqlx::query(&create_detections_query)
            .execute(&self.pool)
            .await?;

        let idx_stream_captured = format!(
            "CREATE INDEX IF NOT EXISTS idx_detections_stream_captured ON {}(stream_id, captured_at)",
            TABLE_DETECTIONS
        );
        sqlx::query(&idx_stream_captured)
            .execute(&self.pool)
            .await?;

        let idx_captured = format!(
            "CREATE INDEX IF NOT EXISTS idx_detections_captured ON {}(captured_at)",
            TABLE_DETECTIONS
        );
        sqlx::query(&idx_captured)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_stream(&self, new_stream: &NewStream) -> Result<Stream> {
        let now = Utc::now();
        let stream = Stream {
            id: Uuid::new_v4().to_string(),
            name: new_stream.name.trim().to_string(),
            source_url: new_stream.source_url.clone(),
            fps: new_stream.fps,
            detection_enabled: new_stream.detection_enabled,
            status: StreamStatus::Stopped,
            last_heartbeat_at: None,
            last_frame_at: None,
            avg_latency_ms: None,
            last_error: None,
            latitude: new_stream.latitude,
            longitude: new_stream.longitude,
            created_at: now,
            updated_at: now,
        };

        let query = format!(
            r#"
            INSERT INTO {} (id, name, source_url, fps, detection_enabled, status,
                            latitude, longitude, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            TABLE_STREAMS
        );
        sqlx::query(&query)
            .bind(&stream.id)
            .bind(&stream.name)
            .bind(&stream.source_url)
            .bind(stream.fps as i64)
            .bind(stream.detection_enabled)
            .bind(stream.status.as_str())
            .bind(stream.latitude)
            .bind(stream.longitude)
            .bind(stream.created_at)
            .bind(stream.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(stream)
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Option<Stream>> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_STREAMS);
        let row = sqlx::query(&query)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(stream_from_row).transpose()
    }

    async fn list_streams(&self) -> Result<Vec<Stream>> {
        let query = format!("SELECT * FROM {} ORDER BY created_at ASC", TABLE_STREAMS);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(stream_from_row).collect()
    }

    async fn save_stream_config(&self, stream: &Stream) -> Result<()> {
        let query = format!(
            r#"
            UPDATE {} SET name = ?, source_url = ?, fps = ?, detection_enabled = ?,
                          latitude = ?, longitude = ?, updated_at = ?
            WHERE id = ?
            "#,
            TABLE_STREAMS
        );
        sqlx::query(&query)
            .bind(&stream.name)
            .bind(&stream.source_url)
            .bind(stream.fps as i64)
            .bind(stream.detection_enabled)
            .bind(stream.latitude)
            .bind(stream.longitude)
            .bind(Utc::now())
            .bind(&stream.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<bool> {
        let delete_detections = format!("DELETE FROM {} WHERE stream_id = ?", TABLE_DETECTIONS);
        sqlx::query(&delete_detections)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        let query = format!("DELETE FROM {} WHERE id = ?", TABLE_STREAMS);
        let result = sqlx::query(&query)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_stream_status(
        &self,
        stream_id: &str,
        status: StreamStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        // The error text is only replaced when entering ERROR; a fresh start clears it.
        let query = format!(
            r#"
            UPDATE {} SET status = ?,
                last_error = CASE WHEN ? = 'ERROR' THEN ?
                                  WHEN ? = 'STARTING' THEN NULL
                                  ELSE last_error END,
                updated_at = ?
            WHERE id = ?
            "#,
            TABLE_STREAMS
        );
        sqlx::query(&query)
            .bind(status.as_str())
            .bind(status.as_str())
            .bind(last_error)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_heartbeat(&self, stream_id: &str, at: DateTime<Utc>) -> Result<()> {
        let query = format!("UPDATE {} SET last_heartbeat_at = ? WHERE id = ?", TABLE_STREAMS);
        sqlx::query(&query)
            .bind(at)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_stream_metrics(
        &self,
        stream_id: &str,
        avg_latency_ms: f64,
        last_frame_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "UPDATE {} SET avg_latency_ms = ?, last_frame_at = ? WHERE id = ?",
            TABLE_STREAMS
        );
        sqlx::query(&query)
            .bind(avg_latency_ms)
            .bind(last_frame_at)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reset_active_streams(&self) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET status = 'STOPPED', updated_at = ? WHERE status IN ('STARTING', 'RUNNING', 'STOPPING')",
            TABLE_STREAMS
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_detection(&self, detection: &NewDetection) -> Result<i64> {
        let query = format!(
            r#"
            INSERT INTO {} (stream_id, captured_at, detection_type, label, confidence,
                            bbox_x, bbox_y, bbox_width, bbox_height, image_path, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            TABLE_DETECTIONS
        );
        let result = sqlx::query(&query)
            .bind(&detection.stream_id)
            .bind(detection.captured_at)
            .bind(DetectionType::from_label(&detection.label).as_str())
            .bind(&detection.label)
            .bind(detection.confidence)
            .bind(detection.bounding_box.x)
            .bind(detection.bounding_box.y)
            .bind(detection.bounding_box.width)
            .bind(detection.bounding_box.height)
            .bind(&detection.image_path)
            .bind(detection.metadata.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_detections(&self, query: &DetectionQuery) -> Result<Vec<Detection>> {
        let start_time = std::time::Instant::now();

        let mut conditions = vec!["stream_id = ?"];
        if query.from.is_some() {
            conditions.push("captured_at >= ?");
        }
        if query.to.is_some() {
            conditions.push("captured_at <= ?");
        }

        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY captured_at DESC, id DESC LIMIT ?",
            TABLE_DETECTIONS,
            conditions.join(" AND ")
        );

        let mut query_builder = sqlx::query(&sql).bind(&query.stream_id);
        if let Some(from) = query.from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = query.to {
            query_builder = query_builder.bind(to);
        }
        query_builder = query_builder.bind(query.limit);

        let rows = query_builder.fetch_all(&self.pool).await?;

        tracing::debug!(
            "list_detections for stream '{}' completed in {:.3}ms, returned {} rows",
            query.stream_id,
            start_time.elapsed().as_secs_f64() * 1000.0,
            rows.len()
        );

        rows.iter().map(detection_from_row).collect()
    }

    async fn count_detections(&self, stream_id: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) AS n FROM {} WHERE stream_id = ?", TABLE_DETECTIONS);
        let row = sqlx::query(&query)
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("n")?)
    }

    async fn delete_old_detections(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let query = format!("DELETE FROM {} WHERE captured_at < ?", TABLE_DETECTIONS);
        let result = sqlx::query(&query)
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> SqliteDatabase {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn new_stream() -> NewStream {
        NewStream {
            name: "Ridge cam".to_string(),
            source_url: "rtsp://10.0.0.5/live".to_string(),
            fps: 5,
            detection_enabled: true,
            latitude: Some(45.1),
            longitude: Some(7.6),
        }
    }

    fn detection(stream_id: &str, captured_at: DateTime<Utc>, label: &str) -> NewDetection {
        NewDetection {
            stream_id: stream_id.to_string(),
            captured_at,
            label: label.to_string(),
            confidence: 0.87,
            bounding_box: BoundingBox { x: 10, y: 20, width: 30, height: 40 },
            image_path: format!("frames/{}/{}.jpg", stream_id, captured_at.timestamp_millis()),
            metadata: serde_json::json!({ "frameWidth": 640 }),
        }
    }

    #[tokio::test]
    async fn test_stream_crud_and_status() {
        let db = test_db().await;
        let created = db.create_stream(&new_stream()).await.unwrap();
        assert_eq!(created.status, StreamStatus::Stopped);

        let fetched = db.get_stream(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Ridge cam");
        assert_eq!(fetched.latitude, Some(45.1));

        db.set_stream_status(&created.id, StreamStatus::Error, Some("decoder exited")).await.unwrap();
        let errored = db.get_stream(&created.id).await.unwrap().unwrap();
        assert_eq!(errored.status, StreamStatus::Error);
        assert_eq!(errored.last_error.as_deref(), Some("decoder exited"));

        db.set_stream_status(&created.id, StreamStatus::Starting, None).await.unwrap();
        let restarted = db.get_stream(&created.id).await.unwrap().unwrap();
        assert_eq!(restarted.last_error, None);

        let mut edited = restarted.clone();
        edited.fps = 12;
        db.save_stream_config(&edited).await.unwrap();
        assert_eq!(db.get_stream(&created.id).await.unwrap().unwrap().fps, 12);

        assert_eq!(db.list_streams().await.unwrap().len(), 1);
        assert!(db.delete_stream(&created.id).await.unwrap());
        assert!(db.get_stream(&created.id).await.unwrap().is_none());
        assert!(!db.delete_stream(&created.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_active_streams() {
        let db = test_db().await;
        let a = db.create_stream(&new_stream()).await.unwrap();
        let b = db.create_stream(&new_stream()).await.unwrap();
        db.set_stream_status(&a.id, StreamStatus::Running, None).await.unwrap();
        db.set_stream_status(&b.id, StreamStatus::Error, Some("boom")).await.unwrap();

        assert_eq!(db.reset_active_streams().await.unwrap(), 1);
        assert_eq!(db.get_stream(&a.id).await.unwrap().unwrap().status, StreamStatus::Stopped);
        assert_eq!(db.get_stream(&b.id).await.unwrap().unwrap().status, StreamStatus::Error);
    }

    #[tokio::test]
    async fn test_detections_are_time_ordered_and_filtered() {
        let db = test_db().await;
        let stream = db.create_stream(&new_stream()).await.unwrap();
        let base = Utc::now() - Duration::minutes(10);

        for (offset, label) in [(0, "smoke"), (2, "fire"), (4, "person")] {
            db.insert_detection(&detection(&stream.id, base + Duration::minutes(offset), label))
                .await
                .unwrap();
        }

        let all = db.list_detections(&DetectionQuery {
            stream_id: stream.id.clone(),
            limit: 10,
            ..Default::default()
        }).await.unwrap();
        let labels: Vec<_> = all.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "fire", "smoke"]);
        assert_eq!(all[1].detection_type, DetectionType::Fire);
        assert_eq!(all[0].metadata["frameWidth"], 640);

        let windowed = db.list_detections(&DetectionQuery {
            stream_id: stream.id.clone(),
            from: Some(base + Duration::minutes(1)),
            to: Some(base + Duration::minutes(3)),
            limit: 10,
        }).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].label, "fire");

        let removed = db.delete_old_detections(base + Duration::minutes(3)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.count_detections(&stream.id).await.unwrap(), 1);
    }
}
