//! The queue facade: job creation, querying by state, worker
//! registration, promotion control, and the activity feed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobState};
use crate::promoter::Promoter;
use crate::store::redis::RedisStore;
use crate::store::Store;
use crate::worker::{Handler, Worker};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Store connection URL.
    pub url: String,
    /// Namespace prefix for every key.
    pub prefix: String,
    /// How often the promoter checks for due delayed jobs.
    pub promote_interval: Duration,
    /// How many delayed entries one promotion sweep examines.
    pub promote_batch: usize,
    /// How long an idle worker loop waits before polling again.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            prefix: "q".to_owned(),
            promote_interval: Duration::from_millis(5_000),
            promote_batch: 20,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// What job handles and background tasks share: the store connection
/// set and the event bus, both owned by the queue instance.
pub(crate) struct QueueCore {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) bus: EventBus,
    pub(crate) config: Config,
}

pub struct Queue {
    core: Arc<QueueCore>,
    promoter: Mutex<Option<Promoter>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_cancel: CancellationToken,
}

impl Queue {
    /// Connects to the store named by `config.url`.
    pub async fn connect(config: Config) -> Result<Queue> {
        let store = RedisStore::connect(&config.url, &config.prefix).await?;
        Ok(Queue::with_store(Arc::new(store), config))
    }

    /// Builds a queue over any store implementation. `config.url` is
    /// ignored here; the store is already connected.
    pub fn with_store(store: Arc<dyn Store>, config: Config) -> Queue {
        let bus = EventBus::new(store.clone());
        Queue {
            core: Arc::new(QueueCore { store, bus, config }),
            promoter: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            worker_cancel: CancellationToken::new(),
        }
    }

    /// A new, unsaved job bound to this queue.
    pub fn create_job(&self, kind: impl Into<String>, data: Value) -> Job {
        Job::new(self.core.clone(), kind.into(), data)
    }

    /// Fetches an existing job by id.
    pub async fn job(&self, id: u64) -> Result<Job> {
        Job::get(&self.core, id).await
    }

    /// Starts `concurrency` worker loops for `kind`, each claiming one
    /// job at a time and running `handler` on it. Worker-level errors
    /// (store failures inside the loop) surface on the activity feed,
    /// distinct from per-job failures.
    pub fn process<H: Handler>(
        &self,
        kind: &str,
        concurrency: usize,
        handler: H,
    ) {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let mut workers = self.workers.lock();
        for _ in 0..concurrency.max(1) {
            workers.push(Worker::spawn(
                self.core.clone(),
                kind.to_owned(),
                handler.clone(),
                self.worker_cancel.clone(),
            ));
        }
    }

    /// Job ids currently in `state`, in claim order.
    pub async fn state(&self, state: JobState) -> Result<Vec<u64>> {
        Ok(self.core.store.state_ids(state).await?)
    }

    /// How many jobs are currently in `state`.
    pub async fn card(&self, state: JobState) -> Result<u64> {
        Ok(self.core.store.card(state).await?)
    }

    pub async fn inactive_count(&self) -> Result<u64> {
        self.card(JobState::Inactive).await
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.card(JobState::Active).await
    }

    pub async fn delayed_count(&self) -> Result<u64> {
        self.card(JobState::Delayed).await
    }

    pub async fn complete_count(&self) -> Result<u64> {
        self.card(JobState::Complete).await
    }

    pub async fn failed_count(&self) -> Result<u64> {
        self.card(JobState::Failed).await
    }

    /// Job kinds ever enqueued under this prefix.
    pub async fn kinds(&self) -> Result<Vec<String>> {
        Ok(self.core.store.kinds().await?)
    }

    /// Cumulative milliseconds of handler execution time across every
    /// completed job, in any process.
    pub async fn work_time(&self) -> Result<u64> {
        Ok(self.core.store.work_time().await?)
    }

    /// Removes a job by id; `NotFound` when it does not exist.
    pub async fn remove_job(&self, id: u64) -> Result<()> {
        let mut job = self.job(id).await?;
        job.remove().await
    }

    /// Starts the delayed-job promoter, checking every `every` (the
    /// configured interval when `None`). Starting twice is a no-op.
    pub fn promote(&self, every: Option<Duration>) {
        let mut promoter = self.promoter.lock();
        if promoter.is_some() {
            return;
        }
        let every = every.unwrap_or(self.core.config.promote_interval);
        *promoter = Some(Promoter::start(self.core.clone(), every));
    }

    /// Stops the promoter, cancelling future ticks.
    pub fn stop_promotion(&self) {
        if let Some(promoter) = self.promoter.lock().take() {
            promoter.stop();
        }
    }

    /// Subscribes to queue-wide activity: every relayed job event plus
    /// loop-level errors.
    pub async fn activity(&self) -> Result<broadcast::Receiver<QueueEvent>> {
        Ok(self.core.bus.activity().await?)
    }

    /// Graceful teardown: stop promotion, let in-flight handlers finish,
    /// stop the event relay, and drop every tracked handle.
    pub async fn shutdown(&self) {
        self.stop_promotion();
        self.worker_cancel.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker task ended abnormally");
            }
        }
        self.core.bus.shutdown();
    }
}
