//! Periodic promotion of due delayed jobs into the runnable set.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::queue::QueueCore;
use crate::util::now_ms;

/// The running promotion task for one queue instance. Dropping the
/// handle without `stop` leaves the task running until the queue shuts
/// down.
pub(crate) struct Promoter {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Promoter {
    pub(crate) fn start(core: Arc<QueueCore>, every: Duration) -> Promoter {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(core, every, cancel.clone()));
        Promoter { handle, cancel }
    }

    /// Cancels future ticks. A promotion already committed by the
    /// current tick stays committed.
    pub(crate) fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[instrument(name = "promoter", skip_all)]
async fn run(core: Arc<QueueCore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(every_ms = every.as_millis() as u64, "promoter started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }
        if let Err(error) = sweep(&core).await {
            warn!(%error, "promotion sweep failed");
            core.bus.error(error);
        }
    }
    debug!("promoter stopped");
}

/// One pass over the earliest-due delayed jobs.
async fn sweep(core: &Arc<QueueCore>) -> Result<()> {
    let batch = core.store.delayed_batch(core.config.promote_batch).await?;
    let now = now_ms();
    for (id, due) in batch {
        if due > now {
            // Due-time ordered: everything after this is also not due.
            break;
        }
        match Job::get(core, id).await {
            Ok(mut job) => {
                // Losing the transition race to another promoter is a
                // no-op; only the winner emits the promotion event.
                if job.promote().await? {
                    debug!(id, "promoted job");
                }
            },
            // Already removed or promoted by someone else.
            Err(Error::NotFound(_)) => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use serde_json::json;

    use crate::job::JobState;
    use crate::queue::{Config, Queue};
    use crate::store::memory::MemoryStore;

    fn queue() -> Queue {
        Queue::with_store(
            Arc::new(MemoryStore::default()),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn test_promotes_once_due() {
        let queue = queue();
        let mut job = queue.create_job("email", json!({}));
        job.delay_ms(150);
        job.save().await.unwrap();
        let id = job.id().unwrap();
        assert_eq!(job.state(), JobState::Delayed);

        queue.promote(Some(Duration::from_millis(25)));

        // Not due yet: several ticks pass without touching it.
        tokio::time::sleep(Duration::from_millis(75)).await;
        assert_eq!(
            queue.job(id).await.unwrap().state(),
            JobState::Delayed
        );

        // Due: picked up within roughly one interval.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if queue.job(id).await.unwrap().state() == JobState::Inactive {
                break;
            }
            assert!(Instant::now() < deadline, "job never promoted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.card(JobState::Delayed).await.unwrap(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let queue = queue();
        queue.promote(Some(Duration::from_millis(20)));
        // Second start is a no-op, not a second timer.
        queue.promote(Some(Duration::from_millis(20)));
        queue.stop_promotion();
        // Stop twice is fine too.
        queue.stop_promotion();

        // With promotion stopped, a due job stays delayed.
        let mut job = queue.create_job("email", json!({}));
        job.delay_ms(10);
        job.save().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            queue.job(job.id().unwrap()).await.unwrap().state(),
            JobState::Delayed
        );
        queue.shutdown().await;
    }
}
