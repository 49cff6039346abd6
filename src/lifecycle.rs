use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionHandler, ActionJob, ActionQueue, ActionTicket, RetryPolicy, StreamAction};
use crate::config::LifecycleConfig;
use crate::database::DatabaseProvider;
use crate::dispatcher::DetectionDispatcher;
use crate::events::{EventBus, StreamEvent};
use crate::ingestion::{DecoderExit, FrameCallback, FrameIngestor};
use crate::metrics::MetricsAggregator;
use crate::models::{Frame, Stream, StreamHealth, StreamStatus, StreamUpdate};
use crate::storage::FrameStorage;
use crate::errors::{Result, SentinelError};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    AlreadyRunning,
    AlreadyStopped,
    #[serde(rename_all = "camelCase")]
    Queued { job_id: String },
}

/// Collaborators the coordinator drives.
pub struct LifecycleDeps {
    pub database: Arc<dyn DatabaseProvider>,
    pub ingestor: Arc<dyn FrameIngestor>,
    pub dispatcher: Arc<DetectionDispatcher>,
    pub metrics: Arc<MetricsAggregator>,
    pub storage: FrameStorage,
    pub events: EventBus,
}

/// Executes lifecycle actions. Only ever called from the action queue, so
/// at most one action per stream runs at a time.
struct LifecycleCore {
    deps: LifecycleDeps,
    config: LifecycleConfig,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Streams whose running update job chose to restart the decoder.
    restarts: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct StreamLifecycle {
    core: Arc<LifecycleCore>,
    queue: Arc<ActionQueue>,
}

impl StreamLifecycle {
    pub fn new(deps: LifecycleDeps, config: LifecycleConfig) -> Self {
        let retry = RetryPolicy {
            attempts: config.start_attempts,
            initial_backoff: Duration::from_millis(config.start_backoff_ms),
        };
        let max_jobs = config.max_jobs;
        let core = Arc::new(LifecycleCore {
            deps,
            config,
            heartbeats: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashSet::new()),
        });
        let queue = Arc::new(ActionQueue::new(core.clone(), retry, max_jobs));
        Self { core, queue }
    }

    async fn load(&self, stream_id: &str) -> Result<Stream> {
        self.core.load(stream_id).await
    }

    pub async fn start(&self, stream_id: &str) -> Result<ActionOutcome> {
        let stream = self.load(stream_id).await?;
        if stream.status == StreamStatus::Running {
            info!("[{}] Start requested but stream is already running", stream_id);
            return Ok(ActionOutcome::AlreadyRunning);
        }
        let ticket = self.queue.enqueue(stream_id, StreamAction::Start).await;
        Ok(ActionOutcome::Queued { job_id: ticket.job_id })
    }

    pub async fn stop(&self, stream_id: &str) -> Result<ActionOutcome> {
        let stream = self.load(stream_id).await?;
        if stream.status == StreamStatus::Stopped {
            info!("[{}] Stop requested but stream is already stopped", stream_id);
            return Ok(ActionOutcome::AlreadyStopped);
        }
        let ticket = self.queue.enqueue(stream_id, StreamAction::Stop).await;
        Ok(ActionOutcome::Queued { job_id: ticket.job_id })
    }

    /// Apply a config change and wait for it to land. Source or frame rate
    /// changes on a stream that is running when the job executes stop and
    /// restart its decoder; anything else applies in place.
    pub async fn update_stream(&self, stream_id: &str, update: StreamUpdate) -> Result<Stream> {
        update.validate()?;
        self.load(stream_id).await?;

        let ticket = self.queue.enqueue(stream_id, StreamAction::Update(update)).await;
        let job = wait_for(ticket).await?;
        let restarted = self.core.set_restart(stream_id, false);
        match job.error_message {
            // The change was saved; the stream is left in ERROR.
            Some(message) if restarted => {
                warn!("[{}] Configuration applied but restart failed: {}", stream_id, message);
            }
            Some(message) => return Err(SentinelError::lifecycle(message)),
            None => {}
        }
        self.load(stream_id).await
    }

    /// Stop the stream if needed, then remove it and its stored frames.
    pub async fn delete_stream(&self, stream_id: &str) -> Result<()> {
        self.load(stream_id).await?;
        let ticket = self.queue.enqueue(stream_id, StreamAction::Delete).await;
        let job = wait_for(ticket).await?;
        self.queue.retire(stream_id);
        match job.error_message {
            Some(message) => Err(SentinelError::lifecycle(message)),
            None => Ok(()),
        }
    }

    pub async fn job(&self, job_id: &str) -> Option<ActionJob> {
        self.queue.get_job(job_id).await
    }

    pub async fn jobs(&self, stream_id: Option<&str>) -> Vec<ActionJob> {
        self.queue.list_jobs(stream_id).await
    }

    pub async fn health(&self, stream_id: &str) -> Result<StreamHealth> {
        let stream = self.load(stream_id).await?;
        let stale_after = ChronoDuration::seconds(self.core.config.stale_after_secs as i64);
        let stale = stream.status == StreamStatus::Running
            && stream
                .last_heartbeat_at
                .map_or(true, |at| Utc::now() - at > stale_after);

        Ok(StreamHealth {
            decoder_active: self.core.deps.ingestor.is_stream_active(stream_id).await,
            stream_id: stream.id,
            status: stream.status,
            last_heartbeat_at: stream.last_heartbeat_at,
            stale,
            last_frame_at: stream.last_frame_at,
            avg_latency_ms: stream.avg_latency_ms,
            last_error: stream.last_error,
        })
    }

    /// Turn decoder failures into ERROR transitions.
    pub fn watch_decoder_exits(&self, mut exits: mpsc::UnboundedReceiver<DecoderExit>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                warn!("[{}] Decoder failure reported: {}", exit.stream_id, exit.reason);
                let action = StreamAction::Fail { generation: exit.generation, reason: exit.reason };
                queue.enqueue(&exit.stream_id, action).await;
            }
            debug!("Decoder exit channel closed");
        })
    }

    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = match self.core.heartbeats.lock() {
            Ok(mut heartbeats) => heartbeats.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (stream_id, handle) in handles {
            debug!("[{}] Cancelling heartbeat", stream_id);
            handle.abort();
        }
        self.core.deps.ingestor.stop_all().await;
    }
}

async fn wait_for(ticket: ActionTicket) -> Result<ActionJob> {
    let job_id = ticket.job_id.clone();
    ticket
        .wait()
        .await
        .ok_or_else(|| SentinelError::lifecycle(format!("Job {} was abandoned", job_id)))
}

impl LifecycleCore {
    async fn load(&self, stream_id: &str) -> Result<Stream> {
        self.deps
            .database
            .get_stream(stream_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("Stream '{}' not found", stream_id)))
    }

    async fn transition(&self, stream: &mut Stream, next: StreamStatus, error: Option<String>) -> Result<()> {
        if !stream.status.can_transition_to(next) {
            return Err(SentinelError::lifecycle(format!(
                "Stream '{}' cannot go from {} to {}", stream.id, stream.status, next
            )));
        }
        self.deps.database.set_stream_status(&stream.id, next, error.as_deref()).await?;
        info!("[{}] {} -> {}", stream.id, stream.status, next);
        stream.status = next;
        self.deps.events.publish_status(&stream.id, next, error);
        Ok(())
    }

    /// Record ERROR, or log when even that is impossible.
    async fn fail(&self, stream: &mut Stream, reason: String) {
        if let Err(e) = self.transition(stream, StreamStatus::Error, Some(reason)).await {
            error!("[{}] Failed to record ERROR state: {}", stream.id, e);
        }
    }

    fn frame_callback(&self) -> FrameCallback {
        let dispatcher = self.deps.dispatcher.clone();
        Arc::new(move |frame: Frame| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.process_frame(frame).await;
            });
        })
    }

    async fn handle_start(&self, stream_id: &str) -> Result<()> {
        let mut stream = self.load(stream_id).await?;
        if stream.status == StreamStatus::Running {
            debug!("[{}] Already running when start job ran", stream_id);
            return Ok(());
        }

        self.transition(&mut stream, StreamStatus::Starting, None).await?;

        if let Err(e) = self.deps.ingestor.start_stream(&stream, self.frame_callback()).await {
            self.fail(&mut stream, e.to_string()).await;
            return Err(e);
        }

        let attached = async {
            self.deps.database.update_heartbeat(&stream.id, Utc::now()).await?;
            self.transition(&mut stream, StreamStatus::Running, None).await
        }
        .await;
        if let Err(e) = attached {
            self.deps.ingestor.stop_stream(stream_id).await;
            self.fail(&mut stream, e.to_string()).await;
            return Err(e);
        }

        self.start_heartbeat(stream_id);
        Ok(())
    }

    async fn handle_stop(&self, stream_id: &str) -> Result<()> {
        let mut stream = self.load(stream_id).await?;
        if stream.status == StreamStatus::Stopped {
            debug!("[{}] Already stopped when stop job ran", stream_id);
            return Ok(());
        }

        if stream.status != StreamStatus::Stopping {
            if let Err(e) = self.transition(&mut stream, StreamStatus::Stopping, None).await {
                warn!("[{}] Could not record STOPPING: {}", stream_id, e);
                stream.status = StreamStatus::Stopping;
            }
        }

        self.cancel_heartbeat(stream_id);
        self.deps.ingestor.stop_stream(stream_id).await;

        if let Err(e) = self.transition(&mut stream, StreamStatus::Stopped, None).await {
            warn!("[{}] Could not record STOPPED: {}", stream_id, e);
        }
        Ok(())
    }

    async fn apply_update(&self, stream_id: &str, update: &StreamUpdate) -> Result<Stream> {
        let mut stream = self.load(stream_id).await?;
        update.apply_to(&mut stream);
        stream.updated_at = Utc::now();
        self.deps.database.save_stream_config(&stream).await?;
        info!("[{}] Configuration updated", stream_id);
        Ok(stream)
    }

    async fn handle_restart(&self, stream_id: &str, update: &StreamUpdate) -> Result<()> {
        self.handle_stop(stream_id).await?;
        self.apply_update(stream_id, update).await?;
        self.handle_start(stream_id).await
    }

    /// Returns whether the flag was set before.
    fn set_restart(&self, stream_id: &str, restart: bool) -> bool {
        match self.restarts.lock() {
            Ok(mut restarts) if restart => !restarts.insert(stream_id.to_string()),
            Ok(mut restarts) => restarts.remove(stream_id),
            Err(_) => false,
        }
    }

    fn restart_pending(&self, stream_id: &str) -> bool {
        self.restarts.lock().map_or(false, |r| r.contains(stream_id))
    }

    /// The first attempt decides from the state at execution time. Retries
    /// keep that decision, since a failed restart leaves the stream in ERROR
    /// with the change already saved.
    async fn handle_update(&self, stream_id: &str, update: &StreamUpdate, attempt: u32) -> Result<()> {
        let restart = if attempt <= 1 {
            let stream = self.load(stream_id).await?;
            let restart = stream.status.is_active() && update.requires_restart(&stream);
            self.set_restart(stream_id, restart);
            restart
        } else {
            self.restart_pending(stream_id)
        };

        if !restart {
            return self.apply_update(stream_id, update).await.map(|_| ());
        }
        self.handle_restart(stream_id, update).await?;
        self.set_restart(stream_id, false);
        Ok(())
    }

    async fn handle_delete(&self, stream_id: &str) -> Result<()> {
        self.handle_stop(stream_id).await?;
        self.deps.database.delete_stream(stream_id).await?;
        self.deps.storage.remove_stream(stream_id).await;
        self.deps.metrics.reset(stream_id).await;
        self.deps.dispatcher.forget_stream(stream_id);
        info!("[{}] Stream deleted", stream_id);
        Ok(())
    }

    async fn handle_failure(&self, stream_id: &str, generation: u64, reason: &str) -> Result<()> {
        if let Some(current) = self.deps.ingestor.decoder_generation(stream_id).await {
            if current != generation {
                debug!("[{}] Ignoring exit of replaced decoder {} (current {})", stream_id, generation, current);
                return Ok(());
            }
        }
        let mut stream = self.load(stream_id).await?;
        if !stream.status.is_active() {
            debug!("[{}] Ignoring decoder failure in state {}", stream_id, stream.status);
            return Ok(());
        }
        self.cancel_heartbeat(stream_id);
        // The controller already dropped the process; make sure nothing lingers.
        self.deps.ingestor.stop_stream(stream_id).await;
        self.fail(&mut stream, reason.to_string()).await;
        Ok(())
    }

    fn start_heartbeat(&self, stream_id: &str) {
        let database = self.deps.database.clone();
        let events = self.deps.events.clone();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs);
        let id = stream_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = database.update_heartbeat(&id, now).await {
                    warn!("[{}] Failed to record heartbeat: {}", id, e);
                    continue;
                }
                events.publish(StreamEvent::Heartbeat { stream_id: id.clone(), timestamp: now });
            }
        });

        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            if let Some(previous) = heartbeats.insert(stream_id.to_string(), handle) {
                previous.abort();
            }
        }
    }

    fn cancel_heartbeat(&self, stream_id: &str) {
        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            if let Some(handle) = heartbeats.remove(stream_id) {
                handle.abort();
                debug!("[{}] Heartbeat cancelled", stream_id);
            }
        }
    }
}

#[async_trait]
impl ActionHandler for LifecycleCore {
    async fn handle(&self, stream_id: &str, action: &StreamAction, attempt: u32) -> Result<()> {
        match action {
            StreamAction::Start => self.handle_start(stream_id).await,
            StreamAction::Stop => self.handle_stop(stream_id).await,
            StreamAction::Update(update) => self.handle_update(stream_id, update, attempt).await,
            StreamAction::Delete => self.handle_delete(stream_id).await,
            StreamAction::Fail { generation, reason } => self.handle_failure(stream_id, *generation, reason).await,
        }
    }
}
