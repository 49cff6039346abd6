use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::utils::epoch_millis;

/// Frames that produced detections, kept on disk as
/// `{root}/{stream_id}/{epoch_ms}.jpg`.
#[derive(Debug, Clone)]
pub struct FrameStorage {
    root: PathBuf,
}

impl FrameStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn frame_path(&self, stream_id: &str, captured_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(stream_id)
            .join(format!("{}.jpg", epoch_millis(captured_at)))
    }

    /// Write the frame and return the path stored with its detections.
    pub async fn save_frame(&self, stream_id: &str, captured_at: DateTime<Utc>, data: &[u8]) -> Result<String> {
        let path = self.frame_path(stream_id, captured_at);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!("Saved {} byte frame to {}", data.len(), path.display());
        Ok(path.to_string_lossy().to_string())
    }

    pub async fn remove_stream(&self, stream_id: &str) {
        let dir = self.root.join(stream_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Removed stored frames for stream '{}'", stream_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove frames directory {:?}: {}", dir, e),
        }
    }

    /// Delete stored frames captured before `cutoff`. Returns how many were removed.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> u64 {
        let cutoff_ms = epoch_millis(cutoff);
        let mut streams = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read frame storage root {:?}: {}", self.root, e);
                return 0;
            }
        };

        let mut removed = 0u64;
        while let Ok(Some(stream_dir)) = streams.next_entry().await {
            let Ok(mut frames) = tokio::fs::read_dir(stream_dir.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = frames.next_entry().await {
                let path = entry.path();
                let captured_ms = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<i64>().ok());
                match captured_ms {
                    Some(ms) if ms < cutoff_ms => {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Failed to remove old frame {:?}: {}", path, e);
                        } else {
                            removed += 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        if removed > 0 {
            info!("Frame cleanup removed {} files older than {}", removed, cutoff);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_frame_layout() {
        let dir = TempDir::new().unwrap();
        let storage = FrameStorage::new(dir.path());
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();

        let path = storage.save_frame("s1", at, &[0xFF, 0xD8, 0xFF, 0xD9]).await.unwrap();
        assert!(path.ends_with("s1/1700000000123.jpg"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);

        storage.remove_stream("s1").await;
        assert!(!dir.path().join("s1").exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_frames() {
        let dir = TempDir::new().unwrap();
        let storage = FrameStorage::new(dir.path());
        let now = Utc::now();

        let old = storage.save_frame("s1", now - Duration::days(10), b"old").await.unwrap();
        let recent = storage.save_frame("s1", now, b"new").await.unwrap();

        assert_eq!(storage.prune_older_than(now - Duration::days(7)).await, 1);
        assert!(!std::path::Path::new(&old).exists());
        assert!(std::path::Path::new(&recent).exists());
    }
}
