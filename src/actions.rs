use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::StreamUpdate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Lifecycle work submitted for one stream.
#[derive(Debug, Clone)]
pub enum StreamAction {
    Start,
    Stop,
    /// Apply a config change. Whether the decoder restarts is decided when
    /// the job runs, not when it is queued.
    Update(StreamUpdate),
    Delete,
    /// A decoder instance died on its own.
    Fail { generation: u64, reason: String },
}

impl StreamAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamAction::Start => "start",
            StreamAction::Stop => "stop",
            StreamAction::Update(_) => "update",
            StreamAction::Delete => "delete",
            StreamAction::Fail { .. } => "fail",
        }
    }

    fn is_retried(&self) -> bool {
        matches!(self, StreamAction::Start | StreamAction::Update(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionJob {
    pub job_id: String,
    pub stream_id: String,
    pub action: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ActionJob {
    fn new(stream_id: &str, action: &StreamAction, max_attempts: u32) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            action: action.kind().to_string(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `attempt` is 1 on the first run of a job and grows with each retry.
    async fn handle(&self, stream_id: &str, action: &StreamAction, attempt: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// A submitted job. `wait` resolves with the final job record.
pub struct ActionTicket {
    pub job_id: String,
    done: oneshot::Receiver<ActionJob>,
}

impl ActionTicket {
    pub async fn wait(self) -> Option<ActionJob> {
        self.done.await.ok()
    }
}

struct QueuedAction {
    job_id: String,
    action: StreamAction,
    done: oneshot::Sender<ActionJob>,
}

type JobList = Arc<RwLock<VecDeque<ActionJob>>>;

/// Runs lifecycle actions one at a time per stream. Streams each get their
/// own worker so they never wait on each other.
pub struct ActionQueue {
    handler: Arc<dyn ActionHandler>,
    retry: RetryPolicy,
    jobs: JobList,
    max_jobs: usize,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<QueuedAction>>>,
}

impl ActionQueue {
    pub fn new(handler: Arc<dyn ActionHandler>, retry: RetryPolicy, max_jobs: usize) -> Self {
        Self {
            handler,
            retry,
            jobs: Arc::new(RwLock::new(VecDeque::new())),
            max_jobs: max_jobs.max(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn enqueue(&self, stream_id: &str, action: StreamAction) -> ActionTicket {
        let max_attempts = if action.is_retried() { self.retry.attempts.max(1) } else { 1 };
        let job = ActionJob::new(stream_id, &action, max_attempts);
        let job_id = job.job_id.clone();

        {
            let mut jobs = self.jobs.write().await;
            jobs.push_back(job);
            while jobs.len() > self.max_jobs {
                if let Some(old) = jobs.pop_front() {
                    debug!("Dropped job record {} ({})", old.job_id, old.action);
                }
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let mut queued = QueuedAction { job_id: job_id.clone(), action, done: done_tx };
        info!("[{}] Queued {} job {}", stream_id, queued.action.kind(), job_id);

        // A worker whose receiver is gone is replaced once.
        for _ in 0..2 {
            let sender = self.worker(stream_id);
            match sender.send(queued) {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    queued = returned;
                    self.retire(stream_id);
                }
            }
        }

        ActionTicket { job_id, done: done_rx }
    }

    fn worker(&self, stream_id: &str) -> mpsc::UnboundedSender<QueuedAction> {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        workers
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(
                    stream_id.to_string(),
                    rx,
                    self.handler.clone(),
                    self.jobs.clone(),
                    self.retry,
                ));
                tx
            })
            .clone()
    }

    /// Forget the worker for a stream; it exits after draining what it holds.
    pub fn retire(&self, stream_id: &str) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(stream_id);
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Option<ActionJob> {
        let jobs = self.jobs.read().await;
        jobs.iter().find(|j| j.job_id == job_id).cloned()
    }

    pub async fn list_jobs(&self, stream_id: Option<&str>) -> Vec<ActionJob> {
        let jobs = self.jobs.read().await;
        jobs.iter()
            .filter(|j| stream_id.map_or(true, |id| j.stream_id == id))
            .cloned()
            .collect()
    }
}

async fn update_job<F>(jobs: &JobList, job_id: &str, update_fn: F) -> Option<ActionJob>
where
    F: FnOnce(&mut ActionJob),
{
    let mut jobs = jobs.write().await;
    jobs.iter_mut().find(|j| j.job_id == job_id).map(|job| {
        update_fn(job);
        job.clone()
    })
}

async fn run_worker(
    stream_id: String,
    mut rx: mpsc::UnboundedReceiver<QueuedAction>,
    handler: Arc<dyn ActionHandler>,
    jobs: JobList,
    retry: RetryPolicy,
) {
    debug!("[{}] Action worker started", stream_id);
    while let Some(queued) = rx.recv().await {
        let job = execute(&stream_id, &queued, handler.as_ref(), &jobs, retry).await;
        let _ = queued.done.send(job);
    }
    debug!("[{}] Action worker stopped", stream_id);
}

async fn execute(
    stream_id: &str,
    queued: &QueuedAction,
    handler: &dyn ActionHandler,
    jobs: &JobList,
    retry: RetryPolicy,
) -> ActionJob {
    let kind = queued.action.kind();
    let max_attempts = if queued.action.is_retried() { retry.attempts.max(1) } else { 1 };
    let mut attempt = 0;

    let outcome: std::result::Result<(), String> = loop {
        attempt += 1;
        update_job(jobs, &queued.job_id, |job| {
            job.status = JobStatus::Running;
            job.attempts = attempt;
            job.started_at.get_or_insert_with(Utc::now);
        }).await;

        match handler.handle(stream_id, &queued.action, attempt).await {
            Ok(()) => {
                info!("[{}] {} job {} completed", stream_id, kind, queued.job_id);
                break Ok(());
            }
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let delay = retry.backoff(attempt);
                warn!("[{}] {} job {} attempt {}/{} failed: {}; retrying in {:?}",
                      stream_id, kind, queued.job_id, attempt, max_attempts, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("[{}] {} job {} failed after {} attempt(s): {}",
                       stream_id, kind, queued.job_id, attempt, e);
                break Err(e.to_string());
            }
        }
    };

    let finish = |job: &mut ActionJob| {
        job.completed_at = Some(Utc::now());
        match &outcome {
            Ok(()) => job.status = JobStatus::Completed,
            Err(message) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
            }
        }
    };

    match update_job(jobs, &queued.job_id, finish).await {
        Some(job) => job,
        None => {
            // Record already trimmed; report what we know.
            let mut job = ActionJob::new(stream_id, &queued.action, max_attempts);
            job.job_id = queued.job_id.clone();
            job.attempts = attempt;
            finish(&mut job);
            job
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SentinelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records overlap and fails the first `fail_first` calls.
    struct RecordingHandler {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_overlap: AtomicUsize,
        fail_first: usize,
        order: Mutex<Vec<String>>,
        attempts: Mutex<Vec<u32>>,
    }

    impl RecordingHandler {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_overlap: AtomicUsize::new(0),
                fail_first,
                order: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        async fn handle(&self, stream_id: &str, action: &StreamAction, attempt: u32) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.attempts.lock().unwrap().push(attempt);
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_overlap.fetch_max(now_running, Ordering::SeqCst);
            self.order.lock().unwrap().push(format!("{}:{}", stream_id, action.kind()));
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(SentinelError::ingestion("decoder refused to start"));
            }
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { attempts: 3, initial_backoff: Duration::from_millis(2_000) }
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = policy();
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_actions_for_one_stream_run_in_order() {
        let handler = RecordingHandler::new(0);
        let queue = ActionQueue::new(handler.clone(), policy(), 100);

        let first = queue.enqueue("s1", StreamAction::Start).await;
        let second = queue.enqueue("s1", StreamAction::Stop).await;
        let third = queue.enqueue("s1", StreamAction::Start).await;

        for ticket in [first, second, third] {
            assert_eq!(ticket.wait().await.unwrap().status, JobStatus::Completed);
        }
        assert_eq!(handler.max_overlap.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.order.lock().unwrap(), vec!["s1:start", "s1:stop", "s1:start"]);
    }

    #[tokio::test]
    async fn test_different_streams_run_concurrently() {
        let handler = RecordingHandler::new(0);
        let queue = ActionQueue::new(handler.clone(), policy(), 100);

        let a = queue.enqueue("a", StreamAction::Start).await;
        let b = queue.enqueue("b", StreamAction::Start).await;
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(handler.max_overlap.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_retried_with_backoff() {
        let handler = RecordingHandler::new(2);
        let queue = ActionQueue::new(handler.clone(), policy(), 100);

        let started = tokio::time::Instant::now();
        let job = queue.enqueue("s1", StreamAction::Start).await.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(*handler.attempts.lock().unwrap(), vec![1, 2, 3]);
        // Two backoffs: 2s then 4s.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_attempted_once() {
        let handler = RecordingHandler::new(5);
        let queue = ActionQueue::new(handler.clone(), policy(), 100);

        let job = queue.enqueue("s1", StreamAction::Stop).await.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().contains("decoder refused"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_records_are_bounded() {
        let handler = RecordingHandler::new(0);
        let queue = ActionQueue::new(handler, policy(), 2);

        let mut last = None;
        for _ in 0..4 {
            last = Some(queue.enqueue("s1", StreamAction::Stop).await);
        }
        let last = last.unwrap();
        let last_id = last.job_id.clone();
        last.wait().await.unwrap();

        let jobs = queue.list_jobs(Some("s1")).await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(queue.get_job(&last_id).await.unwrap().status, JobStatus::Completed);
    }
}
