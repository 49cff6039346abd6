use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::IngestionConfig;
use crate::errors::{Result, SentinelError};
use crate::models::{Frame, Stream};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const DEFAULT_CHUNK_SIZE: usize = 8192;
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;
const STOP_WAIT: Duration = Duration::from_secs(5);

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Reported when a decoder ends without being asked to.
#[derive(Debug, Clone)]
pub struct DecoderExit {
    pub stream_id: String,
    /// Decoder instance that ended; a newer start gets a new generation.
    pub generation: u64,
    pub reason: String,
}

/// Source of frames for a stream. The lifecycle coordinator only talks to
/// ingestion through this trait.
#[async_trait]
pub trait FrameIngestor: Send + Sync {
    async fn start_stream(&self, stream: &Stream, on_frame: FrameCallback) -> Result<()>;
    async fn stop_stream(&self, stream_id: &str);
    /// Generation of the decoder currently tracked for the stream.
    async fn decoder_generation(&self, stream_id: &str) -> Option<u64>;
    async fn stop_all(&self);

    async fn is_stream_active(&self, stream_id: &str) -> bool {
        self.decoder_generation(stream_id).await.is_some()
    }
}

/// Splits a continuous MJPEG byte stream into complete JPEG images.
#[derive(Debug, Default)]
pub struct MjpegExtractor {
    buffer: Vec<u8>,
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < 2 || from > haystack.len() - 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

impl MjpegExtractor {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(128 * 1024) }
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, JPEG_SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of a marker.
                let keep_last = self.buffer.last() == Some(&0xFF);
                self.buffer.clear();
                if keep_last {
                    self.buffer.push(0xFF);
                }
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            let Some(end) = find_marker(&self.buffer, JPEG_EOI, 2) else {
                if self.buffer.len() > MAX_PENDING_BYTES {
                    warn!("Discarding {} bytes without JPEG end marker", self.buffer.len());
                    self.buffer.clear();
                }
                break;
            };

            let frame_end = end + 2;
            frames.push(Bytes::copy_from_slice(&self.buffer[..frame_end]));
            self.buffer.drain(..frame_end);
        }

        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Lets at most one frame through per interval; the rest are dropped.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    last_open: Option<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_open: None }
    }

    pub fn try_pass(&mut self, now: Instant) -> bool {
        match self.last_open {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_open = Some(now);
                true
            }
        }
    }
}

/// Read `reader` to EOF, forwarding rate-gated frames to `deliver`.
/// Returns the number of frames forwarded.
pub async fn pump_frames<R, F>(
    stream_id: &str,
    mut reader: R,
    frame_interval: Duration,
    chunk_size: usize,
    mut deliver: F,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame),
{
    let mut extractor = MjpegExtractor::new();
    let mut gate = RateGate::new(frame_interval);
    let mut chunk = vec![0u8; chunk_size.max(2)];
    let mut forwarded = 0u64;
    let mut dropped = 0u64;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            debug!("Decoder output for stream '{}' reached EOF ({} forwarded, {} dropped)",
                   stream_id, forwarded, dropped);
            return Ok(forwarded);
        }

        for data in extractor.push(&chunk[..n]) {
            if gate.try_pass(Instant::now()) {
                forwarded += 1;
                if forwarded % 100 == 0 {
                    debug!("Forwarded {} frames for stream '{}'", forwarded, stream_id);
                }
                deliver(Frame::new(stream_id, data));
            } else {
                dropped += 1;
            }
        }
    }
}

/// Arguments for the decoder process of `stream`.
pub fn decoder_args(config: &IngestionConfig, stream: &Stream) -> Vec<String> {
    let fps = stream.fps.to_string();

    if let Some(command) = &config.command {
        return command
            .iter()
            .map(|arg| arg.replace("{url}", &stream.source_url).replace("{fps}", &fps))
            .collect();
    }

    let mut args: Vec<String> = [
        "-hide_banner", "-loglevel", "error",
        "-fflags", "+nobuffer+discardcorrupt",   // No input buffering, drop corrupt packets
        "-flags", "low_delay",
        "-probesize", "32",
        "-analyzeduration", "0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if stream.source_url.starts_with("rtsp") {
        args.push("-rtsp_transport".to_string());
        args.push(config.rtsp_transport.clone());
    }

    args.extend([
        "-i".to_string(), stream.source_url.clone(),
        "-an".to_string(),
        "-vf".to_string(), format!("fps={}", fps),
        "-f".to_string(), "image2pipe".to_string(),
        "-vcodec".to_string(), "mjpeg".to_string(),
        "-q:v".to_string(), config.jpeg_quality.to_string(),
        "-flush_packets".to_string(), "1".to_string(),
        "-".to_string(),
    ]);
    args
}

struct ActiveDecoder {
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    scratch_dir: PathBuf,
}

struct ControllerInner {
    config: IngestionConfig,
    processes: RwLock<HashMap<String, ActiveDecoder>>,
    exit_tx: mpsc::UnboundedSender<DecoderExit>,
    next_generation: AtomicU64,
}

/// Owns one decoder subprocess per active stream.
#[derive(Clone)]
pub struct IngestionController {
    inner: Arc<ControllerInner>,
}

impl IngestionController {
    pub fn new(config: IngestionConfig) -> (Self, mpsc::UnboundedReceiver<DecoderExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let controller = Self {
            inner: Arc::new(ControllerInner {
                config,
                processes: RwLock::new(HashMap::new()),
                exit_tx,
                next_generation: AtomicU64::new(1),
            }),
        };
        (controller, exit_rx)
    }

    pub async fn active_streams(&self) -> Vec<String> {
        self.inner.processes.read().await.keys().cloned().collect()
    }

    fn spawn_decoder(&self, stream: &Stream, scratch_dir: &PathBuf) -> Result<Child> {
        let config = &self.inner.config;
        let args = decoder_args(config, stream);
        debug!("Decoder command for stream '{}': {} {}", stream.id, config.ffmpeg_path, args.join(" "));

        let stderr = match config.log_stderr.as_deref() {
            Some("file") => {
                let log_path = scratch_dir.join("decoder.log");
                Stdio::from(std::fs::File::create(&log_path)?)
            }
            Some("console") => Stdio::piped(),
            _ => Stdio::null(),
        };

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SentinelError::ingestion(format!(
                "Failed to spawn decoder '{}' for stream '{}': {}", config.ffmpeg_path, stream.id, e
            )))?;

        if let Some(stderr) = child.stderr.take() {
            let stream_id = stream.id.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[decoder {}] {}", stream_id, line);
                }
            });
        }

        Ok(child)
    }

    /// Remove the decoder entry only if it still belongs to `generation`.
    async fn release_generation(&self, stream_id: &str, generation: u64) -> Option<ActiveDecoder> {
        let mut processes = self.inner.processes.write().await;
        if processes.get(stream_id).map(|d| d.generation) != Some(generation) {
            return None;
        }
        processes.remove(stream_id)
    }

    async fn supervise(
        self,
        stream_id: String,
        generation: u64,
        frame_interval: Duration,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        on_frame: FrameCallback,
    ) {
        let Some(stdout) = child.stdout.take() else {
            error!("Decoder for stream '{}' has no stdout", stream_id);
            return;
        };
        let chunk_size = self.inner.config.chunk_read_size.unwrap_or(DEFAULT_CHUNK_SIZE);

        let pump_stream_id = stream_id.clone();
        let pump = async move {
            pump_frames(&pump_stream_id, stdout, frame_interval, chunk_size, |frame| on_frame(frame)).await
        };

        let reason = tokio::select! {
            _ = &mut kill_rx => {
                // Stop requested: the requester owns cleanup.
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill decoder for stream '{}': {}", stream_id, e);
                }
                return;
            }
            result = pump => match result {
                Ok(frames) => format!("decoder output ended after {} frames", frames),
                Err(e) => format!("failed reading decoder output: {}", e),
            },
        };

        let exit = match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => format!("{} ({})", reason, status),
            Ok(Err(e)) => format!("{} (wait failed: {})", reason, e),
            Err(_) => {
                let _ = child.kill().await;
                format!("{} (killed after output closed)", reason)
            }
        };
        warn!("Decoder for stream '{}' ended unexpectedly: {}", stream_id, exit);

        if let Some(decoder) = self.release_generation(&stream_id, generation).await {
            remove_scratch_dir(&stream_id, &decoder.scratch_dir).await;
            let _ = self.inner.exit_tx.send(DecoderExit { stream_id, generation, reason: exit });
        }
    }
}

async fn remove_scratch_dir(stream_id: &str, dir: &PathBuf) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed scratch directory {} for stream '{}'", dir.display(), stream_id),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch directory {} for stream '{}': {}", dir.display(), stream_id, e),
    }
}

#[async_trait]
impl FrameIngestor for IngestionController {
    async fn start_stream(&self, stream: &Stream, on_frame: FrameCallback) -> Result<()> {
        let mut processes = self.inner.processes.write().await;
        if processes.contains_key(&stream.id) {
            info!("Decoder for stream '{}' is already running, not starting another", stream.id);
            return Ok(());
        }

        let scratch_dir = PathBuf::from(&self.inner.config.scratch_directory).join(&stream.id);
        let spawned = match tokio::fs::create_dir_all(&scratch_dir).await {
            Ok(()) => self.spawn_decoder(stream, &scratch_dir),
            Err(e) => Err(e.into()),
        };
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_scratch_dir(&stream.id, &scratch_dir).await;
                return Err(e);
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        info!("Decoder started for stream '{}' (pid {:?}, {} fps, url {})",
              stream.id, child.id(), stream.fps, stream.source_url);

        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().supervise(
            stream.id.clone(),
            generation,
            stream.frame_interval(),
            child,
            kill_rx,
            on_frame,
        ));

        processes.insert(stream.id.clone(), ActiveDecoder {
            generation,
            kill_tx: Some(kill_tx),
            task,
            scratch_dir,
        });
        Ok(())
    }

    async fn stop_stream(&self, stream_id: &str) {
        let decoder = {
            self.inner.processes.write().await.remove(stream_id)
        };

        let Some(mut decoder) = decoder else {
            debug!("No decoder tracked for stream '{}'", stream_id);
            return;
        };

        if let Some(kill_tx) = decoder.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if tokio::time::timeout(STOP_WAIT, &mut decoder.task).await.is_err() {
            warn!("Decoder task for stream '{}' did not finish in {:?}, aborting", stream_id, STOP_WAIT);
            decoder.task.abort();
        }
        remove_scratch_dir(stream_id, &decoder.scratch_dir).await;
        info!("Decoder stopped for stream '{}'", stream_id);
    }

    async fn decoder_generation(&self, stream_id: &str) -> Option<u64> {
        self.inner.processes.read().await.get(stream_id).map(|d| d.generation)
    }

    async fn stop_all(&self) {
        let ids = self.active_streams().await;
        info!("Stopping {} decoder(s)", ids.len());
        join_all(ids.iter().map(|id| self.stop_stream(id))).await;
    }
}
