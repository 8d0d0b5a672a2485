//! The job entity and its state machine.
//!
//! A `Job` value is a handle: the canonical state always lives in the
//! store, and the in-memory copy is advisory. Handles are refreshed by
//! the event relay (`updates`) or by re-fetching through the queue.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::{Emitter, JobEvent};
use crate::queue::QueueCore;
use crate::store::{claim_score, due_score, JobPatch, JobRecord};
use crate::util::now_ms;

/// Every state a job can be in. A job id is a member of exactly one
/// state collection at any instant.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JobState {
    /// Runnable: waiting to be claimed by a worker.
    Inactive,
    /// Claimed by exactly one worker, which will complete or fail it.
    Active,
    /// Not yet due; promoted to inactive once `created_at + delay`
    /// passes.
    Delayed,
    Complete,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Inactive,
        JobState::Active,
        JobState::Delayed,
        JobState::Complete,
        JobState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Complete and failed jobs only ever leave via `remove`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "complete" => Ok(JobState::Complete),
            "failed" => Ok(JobState::Failed),
            _ => Err(()),
        }
    }
}

// This impl is used to render states in YAML stats output.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Named priority levels. Raw integers work too: lower runs first, ties
/// broken by id (creation order).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    Low,
    Normal,
    Medium,
    High,
    Critical,
}

impl From<Priority> for i32 {
    fn from(p: Priority) -> i32 {
        match p {
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::Medium => -5,
            Priority::High => -10,
            Priority::Critical => -15,
        }
    }
}

/// A handle on one job, bound to the queue that created or fetched it.
pub struct Job {
    core: Arc<QueueCore>,
    emitter: Arc<Emitter<JobEvent>>,
    id: Option<u64>,
    kind: String,
    data: Value,
    priority: i32,
    progress: u8,
    state: JobState,
    attempts_remaining: u32,
    max_attempts: u32,
    backoff: Option<u64>,
    created_at: u64,
    updated_at: u64,
    delay: u64,
    duration: Option<u64>,
    error: Option<String>,
}

impl Job {
    pub(crate) fn new(core: Arc<QueueCore>, kind: String, data: Value) -> Job {
        Job {
            core,
            emitter: Arc::new(Emitter::new()),
            id: None,
            kind,
            data,
            priority: 0,
            progress: 0,
            state: JobState::Inactive,
            attempts_remaining: 1,
            max_attempts: 1,
            backoff: None,
            created_at: 0,
            updated_at: 0,
            delay: 0,
            duration: None,
            error: None,
        }
    }

    /// Fetches an existing job by id.
    pub(crate) async fn get(core: &Arc<QueueCore>, id: u64) -> Result<Job> {
        let rec = core.store.read(id).await?.ok_or(Error::NotFound(id))?;
        Ok(Job::from_record(core.clone(), rec))
    }

    pub(crate) fn from_record(core: Arc<QueueCore>, rec: JobRecord) -> Job {
        Job {
            core,
            emitter: Arc::new(Emitter::new()),
            id: Some(rec.id),
            kind: rec.kind,
            data: rec.data,
            priority: rec.priority,
            progress: rec.progress,
            state: rec.state,
            attempts_remaining: rec.attempts_remaining,
            max_attempts: rec.max_attempts,
            backoff: rec.backoff,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            delay: rec.delay,
            duration: rec.duration,
            error: rec.error,
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Sets the priority; lower values run first.
    pub fn priority(&mut self, priority: impl Into<i32>) -> &mut Job {
        self.priority = priority.into();
        self
    }

    /// Sets the retry budget: total attempts allowed before the job is
    /// failed for good.
    pub fn attempts(&mut self, max: u32) -> &mut Job {
        self.max_attempts = max.max(1);
        self
    }

    /// Delays the first run by `ms` from creation.
    pub fn delay_ms(&mut self, ms: u64) -> &mut Job {
        self.delay = ms;
        self
    }

    /// On a failed attempt with retries left, re-enter `delayed` for
    /// `ms` instead of going straight back to `inactive`.
    pub fn backoff(&mut self, ms: u64) -> &mut Job {
        self.backoff = Some(ms);
        self
    }

    fn record(&self, id: u64) -> JobRecord {
        JobRecord {
            id,
            kind: self.kind.clone(),
            data: self.data.clone(),
            priority: self.priority,
            progress: self.progress,
            state: self.state,
            attempts_remaining: self.attempts_remaining,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            created_at: self.created_at,
            updated_at: self.updated_at,
            delay: self.delay,
            duration: self.duration,
            error: self.error.clone(),
        }
    }

    /// Persists the job. The first save assigns the id and enqueues it:
    /// into `delayed` when a delay is set, else into `inactive`. Later
    /// saves only patch the hash.
    pub async fn save(&mut self) -> Result<()> {
        match self.id {
            None => {
                let id = self.core.store.next_id().await?;
                let now = now_ms();
                self.id = Some(id);
                self.created_at = now;
                self.updated_at = now;
                self.attempts_remaining = self.max_attempts;
                self.state = if self.delay > 0 {
                    JobState::Delayed
                } else {
                    JobState::Inactive
                };

                self.core.store.insert(&self.record(id)).await?;
                self.core.bus.track(id, self.emitter.clone()).await?;
                self.publish(JobEvent::Enqueue).await?;
                debug!(id, kind = %self.kind, state = %self.state, "saved job");
            },
            Some(id) => {
                self.updated_at = now_ms();
                let patch = JobPatch {
                    data: Some(self.data.clone()),
                    priority: Some(self.priority),
                    updated_at: Some(self.updated_at),
                    ..JobPatch::default()
                };
                if !self.core.store.update(id, &patch).await? {
                    return Err(Error::NotFound(id));
                }
            },
        }
        Ok(())
    }

    /// Claims the job for a worker: inactive → active, atomically. Fails
    /// with `NotFound` when another claimer won; callers retry with the
    /// next candidate.
    pub async fn claim(&mut self) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        self.apply(
            id,
            JobState::Inactive,
            JobState::Active,
            claim_score(self.priority, id),
            JobPatch::default(),
            None,
        )
        .await
    }

    /// Marks the job done: active → complete, recording the handler's
    /// elapsed time.
    pub async fn complete(&mut self, duration_ms: u64) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        let patch = JobPatch {
            duration: Some(duration_ms),
            ..JobPatch::default()
        };
        self.apply(
            id,
            JobState::Active,
            JobState::Complete,
            claim_score(self.priority, id),
            patch,
            Some(JobEvent::Complete),
        )
        .await?;
        self.duration = Some(duration_ms);
        Ok(())
    }

    /// Records a failed attempt. With attempts left the job re-enters
    /// `inactive` (or `delayed` when a backoff is set); the last attempt
    /// pins it in `failed`.
    pub async fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        let error = error.into();
        let remaining = self.attempts_remaining.saturating_sub(1);

        let (to, score, delay) = if remaining == 0 {
            (JobState::Failed, claim_score(self.priority, id), None)
        } else if let Some(backoff) = self.backoff {
            // Keep the promoter's single due-time formula: shift `delay`
            // so that created_at + delay lands at now + backoff.
            let delay = now_ms().saturating_sub(self.created_at) + backoff;
            (JobState::Delayed, due_score(self.created_at, delay), Some(delay))
        } else {
            (JobState::Inactive, claim_score(self.priority, id), None)
        };

        let patch = JobPatch {
            attempts_remaining: Some(remaining),
            delay,
            error: Some(error.clone()),
            ..JobPatch::default()
        };
        self.apply(id, JobState::Active, to, score, patch, None).await?;
        self.attempts_remaining = remaining;
        if let Some(delay) = delay {
            self.delay = delay;
        }
        self.error = Some(error.clone());
        self.publish(JobEvent::Failed(error)).await
    }

    /// Pushes the job back to `delayed`, due `ms` from now. Terminal
    /// jobs never transition again.
    pub async fn delay(&mut self, ms: u64) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        if self.state.is_terminal() {
            return Err(Error::TerminalState {
                id,
                state: self.state,
            });
        }
        let delay = now_ms().saturating_sub(self.created_at) + ms;
        let patch = JobPatch {
            delay: Some(delay),
            ..JobPatch::default()
        };
        self.apply(
            id,
            self.state,
            JobState::Delayed,
            due_score(self.created_at, delay),
            patch,
            Some(JobEvent::Delay),
        )
        .await?;
        self.delay = delay;
        Ok(())
    }

    /// Reports progress in percent, clamped to 100. Never moves the job
    /// between state collections.
    pub async fn progress(&mut self, pct: u8) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        let pct = pct.min(100);
        let patch = JobPatch {
            progress: Some(pct),
            updated_at: Some(now_ms()),
            ..JobPatch::default()
        };
        if !self.core.store.update(id, &patch).await? {
            return Err(Error::NotFound(id));
        }
        self.progress = pct;
        self.publish(JobEvent::Progress(pct)).await
    }

    /// Deletes the job from the store entirely.
    pub async fn remove(&mut self) -> Result<()> {
        let id = self.id.ok_or(Error::Unsaved)?;
        if !self.core.store.remove(id, &self.kind).await? {
            return Err(Error::NotFound(id));
        }
        self.publish(JobEvent::Remove).await
    }

    /// Promotes a due delayed job: delayed → inactive. Returns whether
    /// this caller won the transition; a lost race is a no-op, since a
    /// promoter on another process got there first.
    pub(crate) async fn promote(&mut self) -> Result<bool> {
        let id = self.id.ok_or(Error::Unsaved)?;
        let won = self
            .core
            .store
            .transition(
                id,
                &self.kind,
                JobState::Delayed,
                JobState::Inactive,
                claim_score(self.priority, id),
                &JobPatch {
                    updated_at: Some(now_ms()),
                    ..JobPatch::default()
                },
            )
            .await?;
        if won {
            self.state = JobState::Inactive;
            self.publish(JobEvent::Promotion).await?;
        }
        Ok(won)
    }

    /// Subscribes this handle to live updates relayed from other
    /// processes. Tracking ends when a terminal event arrives.
    pub async fn updates(&self) -> Result<broadcast::Receiver<JobEvent>> {
        let id = self.id.ok_or(Error::Unsaved)?;
        self.core.bus.track(id, self.emitter.clone()).await?;
        Ok(self.emitter.subscribe())
    }

    /// One atomic transition plus local bookkeeping and the event that
    /// announces it.
    async fn apply(
        &mut self,
        id: u64,
        from: JobState,
        to: JobState,
        score: f64,
        mut patch: JobPatch,
        event: Option<JobEvent>,
    ) -> Result<()> {
        patch.updated_at = Some(now_ms());
        let won = self
            .core
            .store
            .transition(id, &self.kind, from, to, score, &patch)
            .await?;
        if !won {
            return Err(Error::NotFound(id));
        }
        self.state = to;
        patch.apply_local(self);
        if let Some(event) = event {
            self.publish(event).await?;
        }
        Ok(())
    }

    async fn publish(&self, event: JobEvent) -> Result<()> {
        if let Some(id) = self.id {
            self.core.bus.publish(id, &event).await?;
        }
        Ok(())
    }
}

impl JobPatch {
    fn apply_local(&self, job: &mut Job) {
        if let Some(updated_at) = self.updated_at {
            job.updated_at = updated_at;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
    }
}
