//! The store operation contract: everything the queue needs from the
//! shared key-value store, expressed as atomic operations.
//!
//! The contract matters more than the backend. Every state transition is
//! a single indivisible step on the store side, because transitions are
//! the only cross-process safety mechanism: two workers racing to claim
//! a job, or two promoters racing on the same due job, are decided by
//! whichever `transition` call removes the id from the source set first.
//! A partially applied transition (removed from one set, never added to
//! the next) must not be observable under any interleaving.
//!
//! Keys, all under a configurable prefix (default `q`):
//!
//! * `<p>:ids` — id counter.
//! * `<p>:job:<id>` — per-job hash.
//! * `<p>:jobs:<state>` — sorted set of ids per state.
//! * `<p>:jobs:<kind>:<state>` — per-kind mirror, so a worker can claim
//!   the best inactive job of one kind without scanning.
//! * `<p>:job:types` — set of known kind names.
//! * `<p>:stats:work-time` — cumulative handler milliseconds.
//! * `<p>:events` — pub/sub channel of JSON event envelopes.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::job::JobState;

/// Span reserved for the id component of a runnable-set score. Scores
/// order by `(priority, id)`: lower priority value first, then FIFO.
const ID_SPAN: f64 = (1u64 << 40) as f64;

/// Score for the inactive/active/complete/failed sets.
pub(crate) fn claim_score(priority: i32, id: u64) -> f64 {
    priority as f64 * ID_SPAN + id as f64
}

/// Score for the delayed set: the due time in ms.
pub(crate) fn due_score(created_at: u64, delay: u64) -> f64 {
    (created_at + delay) as f64
}

/// Membership score for a freshly inserted record.
pub(crate) fn entry_score(rec: &JobRecord) -> f64 {
    match rec.state {
        JobState::Delayed => due_score(rec.created_at, rec.delay),
        _ => claim_score(rec.priority, rec.id),
    }
}

/// Key naming, shared by every backend.
#[derive(Clone, Debug)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }

    pub(crate) fn ids(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    pub(crate) fn job(&self, id: u64) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    pub(crate) fn state(&self, state: JobState) -> String {
        format!("{}:jobs:{state}", self.prefix)
    }

    pub(crate) fn kind_state(&self, kind: &str, state: JobState) -> String {
        format!("{}:jobs:{kind}:{state}", self.prefix)
    }

    pub(crate) fn kinds(&self) -> String {
        format!("{}:job:types", self.prefix)
    }

    pub(crate) fn work_time(&self) -> String {
        format!("{}:stats:work-time", self.prefix)
    }

    pub(crate) fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }
}

/// The store-side image of a job hash.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub id: u64,
    pub kind: String,
    pub data: Value,
    pub priority: i32,
    pub progress: u8,
    pub state: JobState,
    pub attempts_remaining: u32,
    pub max_attempts: u32,
    pub backoff: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    pub delay: u64,
    pub duration: Option<u64>,
    pub error: Option<String>,
}

impl JobRecord {
    /// Hash field pairs for a full write.
    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("type", self.kind.clone()),
            ("data", self.data.to_string()),
            ("priority", self.priority.to_string()),
            ("progress", self.progress.to_string()),
            ("state", self.state.as_str().to_owned()),
            ("attempts_remaining", self.attempts_remaining.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("created_at", self.created_at.to_string()),
            ("updated_at", self.updated_at.to_string()),
            ("delay", self.delay.to_string()),
        ];
        if let Some(backoff) = self.backoff {
            fields.push(("backoff", backoff.to_string()));
        }
        if let Some(duration) = self.duration {
            fields.push(("duration", duration.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        fields
    }

    /// Decodes a hash read back from the store.
    pub(crate) fn from_fields(
        id: u64,
        fields: &HashMap<String, String>,
    ) -> Result<Self, StoreError> {
        fn required<'a>(
            fields: &'a HashMap<String, String>,
            name: &str,
        ) -> Result<&'a str, StoreError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| StoreError::Corrupt(format!("missing {name}")))
        }

        fn number<T: std::str::FromStr>(
            value: &str,
            name: &str,
        ) -> Result<T, StoreError> {
            value
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("bad {name}: {value}")))
        }

        let state = required(fields, "state")?;
        let state: JobState = state
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad state: {state}")))?;
        let data: Value = serde_json::from_str(required(fields, "data")?)
            .map_err(|e| StoreError::Corrupt(format!("bad data: {e}")))?;

        Ok(Self {
            id,
            kind: required(fields, "type")?.to_owned(),
            data,
            priority: number(required(fields, "priority")?, "priority")?,
            progress: number(required(fields, "progress")?, "progress")?,
            state,
            attempts_remaining: number(
                required(fields, "attempts_remaining")?,
                "attempts_remaining",
            )?,
            max_attempts: number(
                required(fields, "max_attempts")?,
                "max_attempts",
            )?,
            backoff: match fields.get("backoff") {
                Some(v) => Some(number(v, "backoff")?),
                None => None,
            },
            created_at: number(required(fields, "created_at")?, "created_at")?,
            updated_at: number(required(fields, "updated_at")?, "updated_at")?,
            delay: number(required(fields, "delay")?, "delay")?,
            duration: match fields.get("duration") {
                Some(v) => Some(number(v, "duration")?),
                None => None,
            },
            error: fields.get("error").cloned(),
        })
    }
}

/// A partial hash update applied by `update` or alongside a `transition`.
/// The `state` field itself is never part of a patch: transitions own it.
#[derive(Clone, Debug, Default)]
pub struct JobPatch {
    pub data: Option<Value>,
    pub priority: Option<i32>,
    pub progress: Option<u8>,
    pub attempts_remaining: Option<u32>,
    pub delay: Option<u64>,
    pub duration: Option<u64>,
    pub error: Option<String>,
    pub updated_at: Option<u64>,
}

impl JobPatch {
    pub(crate) fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(data) = &self.data {
            fields.push(("data", data.to_string()));
        }
        if let Some(priority) = self.priority {
            fields.push(("priority", priority.to_string()));
        }
        if let Some(progress) = self.progress {
            fields.push(("progress", progress.to_string()));
        }
        if let Some(attempts) = self.attempts_remaining {
            fields.push(("attempts_remaining", attempts.to_string()));
        }
        if let Some(delay) = self.delay {
            fields.push(("delay", delay.to_string()));
        }
        if let Some(duration) = self.duration {
            fields.push(("duration", duration.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(updated_at) = self.updated_at {
            fields.push(("updated_at", updated_at.to_string()));
        }
        fields
    }

    pub(crate) fn apply(&self, rec: &mut JobRecord) {
        if let Some(data) = &self.data {
            rec.data = data.clone();
        }
        if let Some(priority) = self.priority {
            rec.priority = priority;
        }
        if let Some(progress) = self.progress {
            rec.progress = progress;
        }
        if let Some(attempts) = self.attempts_remaining {
            rec.attempts_remaining = attempts;
        }
        if let Some(delay) = self.delay {
            rec.delay = delay;
        }
        if let Some(duration) = self.duration {
            rec.duration = Some(duration);
        }
        if let Some(error) = &self.error {
            rec.error = Some(error.clone());
        }
        if let Some(updated_at) = self.updated_at {
            rec.updated_at = updated_at;
        }
    }
}

/// One subscriber handle on the event channel. Delivery is at-most-once
/// and non-durable: anything published while disconnected is lost.
#[async_trait]
pub trait Subscription: Send {
    /// The next published payload, or `None` once the channel is gone.
    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, StoreError>;
}

/// The operation contract. Implementations must make every listed
/// operation atomic with respect to concurrent callers, in this process
/// or any other sharing the same store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Allocates the next job id.
    async fn next_id(&self) -> Result<u64, StoreError>;

    /// Writes a new job hash, registers its kind, and adds the id to the
    /// record's state set(s), as one atomic unit.
    async fn insert(&self, rec: &JobRecord) -> Result<(), StoreError>;

    /// Reads a job hash back, if it still exists.
    async fn read(&self, id: u64) -> Result<Option<JobRecord>, StoreError>;

    /// Applies a hash-only patch with no set movement. False when the
    /// job hash no longer exists.
    async fn update(&self, id: u64, patch: &JobPatch)
        -> Result<bool, StoreError>;

    /// Atomically moves `id` from the `from` set(s) to the `to` set(s)
    /// with `score`, updating the state field and `patch` in the same
    /// step. False when `id` was not in `from` (a lost race): in that
    /// case nothing is modified.
    async fn transition(
        &self,
        id: u64,
        kind: &str,
        from: JobState,
        to: JobState,
        score: f64,
        patch: &JobPatch,
    ) -> Result<bool, StoreError>;

    /// Deletes the job hash and purges the id from every state set.
    /// False when the job was already gone.
    async fn remove(&self, id: u64, kind: &str) -> Result<bool, StoreError>;

    /// The best claim candidate for `kind`: lowest priority value, then
    /// lowest id.
    async fn first_inactive(&self, kind: &str)
        -> Result<Option<u64>, StoreError>;

    /// Up to `limit` earliest-due `(id, due_ms)` pairs from the delayed
    /// set, in due-time order.
    async fn delayed_batch(
        &self,
        limit: usize,
    ) -> Result<Vec<(u64, u64)>, StoreError>;

    /// All ids in a state set, in score order.
    async fn state_ids(&self, state: JobState)
        -> Result<Vec<u64>, StoreError>;

    /// Cardinality of a state set.
    async fn card(&self, state: JobState) -> Result<u64, StoreError>;

    /// Known kind names.
    async fn kinds(&self) -> Result<Vec<String>, StoreError>;

    /// Adds to the cumulative handler-time counter.
    async fn add_work_time(&self, ms: u64) -> Result<(), StoreError>;

    /// Reads the cumulative handler-time counter.
    async fn work_time(&self) -> Result<u64, StoreError>;

    /// Publishes an event envelope to every currently-connected
    /// subscriber.
    async fn publish(&self, payload: &[u8]) -> Result<(), StoreError>;

    /// Opens a dedicated subscriber on the event channel.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_score_orders_by_priority_then_id() {
        // Lower priority value first; FIFO by id within a priority.
        let ordered = [
            claim_score(-15, 40),
            claim_score(-10, 2),
            claim_score(0, 1),
            claim_score(0, 2),
            claim_score(0, 3),
            claim_score(10, 1),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_record_field_round_trip() {
        let rec = JobRecord {
            id: 7,
            kind: "email".into(),
            data: serde_json::json!({"to": "user@example.com"}),
            priority: -10,
            progress: 30,
            state: JobState::Active,
            attempts_remaining: 2,
            max_attempts: 3,
            backoff: Some(500),
            created_at: 1_000,
            updated_at: 2_000,
            delay: 0,
            duration: None,
            error: Some("boom".into()),
        };

        let fields: HashMap<String, String> = rec
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        assert_eq!(JobRecord::from_fields(7, &fields).unwrap(), rec);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let mut fields: HashMap<String, String> = HashMap::new();
        fields.insert("state".into(), "inactive".into());
        assert!(JobRecord::from_fields(1, &fields).is_err());

        fields.insert("data".into(), "{not json".into());
        assert!(JobRecord::from_fields(1, &fields).is_err());
    }
}
