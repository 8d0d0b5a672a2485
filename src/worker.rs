//! Worker loops: claim the best runnable job of one kind, run the user
//! handler, settle the outcome. Each loop handles one job at a time;
//! `Queue::process` starts as many loops as the requested concurrency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, HandlerError, Result};
use crate::job::Job;
use crate::queue::QueueCore;

/// How long a loop backs off after a store error, before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// User job logic. The handle passed in is already claimed; report
/// progress through it and return `Ok` to complete the job or `Err` to
/// fail the attempt.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn perform(&self, job: &mut Job) -> std::result::Result<(), HandlerError>;
}

pub(crate) struct Worker {
    core: Arc<QueueCore>,
    kind: String,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn spawn(
        core: Arc<QueueCore>,
        kind: String,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let worker = Worker {
            core,
            kind,
            handler,
            cancel,
        };
        tokio::spawn(worker.run())
    }

    #[instrument(name = "worker", fields(kind = %self.kind), skip_all)]
    async fn run(self) {
        debug!("worker loop started");
        loop {
            // Waiting for work is the only place shutdown is observed:
            // an in-flight handler always runs to completion.
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.next_job() => next,
            };

            match next {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    let idle = tokio::select! {
                        _ = self.cancel.cancelled() => false,
                        _ = tokio::time::sleep(
                            self.core.config.poll_interval,
                        ) => true,
                    };
                    if !idle {
                        break;
                    }
                },
                Err(error) => {
                    // A failed store round-trip mid-loop is reported,
                    // never fatal to the loop.
                    warn!(%error, "worker store operation failed");
                    self.core.bus.error(error);
                    let retry = tokio::select! {
                        _ = self.cancel.cancelled() => false,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => true,
                    };
                    if !retry {
                        break;
                    }
                },
            }
        }
        debug!("worker loop stopped");
    }

    /// Claims the next runnable job of this kind. A lost claim race or
    /// a job removed between peek and claim just moves on to the next
    /// candidate.
    async fn next_job(&self) -> Result<Option<Job>> {
        loop {
            let Some(id) = self.core.store.first_inactive(&self.kind).await?
            else {
                return Ok(None);
            };
            let mut job = match Job::get(&self.core, id).await {
                Ok(job) => job,
                Err(Error::NotFound(_)) => continue,
                Err(error) => return Err(error),
            };
            match job.claim().await {
                Ok(()) => return Ok(Some(job)),
                Err(Error::NotFound(_)) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    async fn execute(&self, job: Job) {
        let Some(id) = job.id() else { return };
        debug!(id, "processing job");
        let started = Instant::now();

        // The handler runs in its own task so a panic is contained at
        // the loop boundary instead of taking the loop down.
        let handler = self.handler.clone();
        let attempt = tokio::spawn(async move {
            let mut job = job;
            let outcome = handler.perform(&mut job).await;
            (job, outcome)
        });

        match attempt.await {
            Ok((mut job, Ok(()))) => {
                let elapsed = started.elapsed().as_millis() as u64;
                if let Err(error) = job.complete(elapsed).await {
                    warn!(id, %error, "failed to record completion");
                    self.core.bus.error(error);
                    return;
                }
                if let Err(error) = self.core.store.add_work_time(elapsed).await
                {
                    warn!(id, %error, "failed to record work time");
                    self.core.bus.error(Error::Store(error));
                }
            },
            Ok((mut job, Err(failure))) => {
                debug!(id, error = %failure, "handler reported failure");
                if let Err(error) = job.fail(failure.to_string()).await {
                    warn!(id, %error, "failed to record failure");
                    self.core.bus.error(error);
                }
            },
            Err(join_error) => {
                // The job handle died with the panicked task; fail the
                // attempt through a fresh one.
                warn!(id, %join_error, "handler panicked");
                match Job::get(&self.core, id).await {
                    Ok(mut job) => {
                        if let Err(error) = job.fail("handler panicked").await {
                            warn!(id, %error, "failed to record panic");
                            self.core.bus.error(error);
                        }
                    },
                    Err(error) => self.core.bus.error(error),
                }
            },
        }
    }
}
