//! In-process store backend. One mutex stands in for the store server's
//! atomicity, which makes it a faithful model of the operation contract
//! for tests and development: share a single `MemoryStore` behind an
//! `Arc` between queue instances to model multiple processes.
//!
//! Pub/sub uses a bounded broadcast channel and drops messages for slow
//! or absent subscribers, matching the at-most-once, non-durable
//! delivery of the real event channel.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::job::JobState;
use crate::store::{
    entry_score, JobPatch, JobRecord, Keys, Store, Subscription,
};

pub struct MemoryStore {
    inner: Mutex<Inner>,
    keys: Keys,
    events: broadcast::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    jobs: HashMap<u64, JobRecord>,
    /// Sorted sets, keyed by the same key strings the real store uses.
    sets: HashMap<String, HashMap<u64, f64>>,
    kinds: BTreeSet<String>,
    work_time: u64,
}

/// Score order with id as the tie-break, like a sorted set of decimal
/// members.
fn score_then_id(a: &(u64, f64), b: &(u64, f64)) -> Ordering {
    a.1.partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

impl MemoryStore {
    pub fn new(prefix: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            keys: Keys::new(prefix),
            events,
        }
    }

    fn sorted(&self, key: &str) -> Vec<(u64, f64)> {
        let inner = self.inner.lock();
        inner
            .sets
            .get(key)
            .map(|set| {
                set.iter()
                    .map(|(&id, &score)| (id, score))
                    .sorted_by(score_then_id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("q")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn next_id(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    async fn insert(&self, rec: &JobRecord) -> Result<(), StoreError> {
        let score = entry_score(rec);
        let mut inner = self.inner.lock();
        inner.kinds.insert(rec.kind.clone());
        for key in [
            self.keys.state(rec.state),
            self.keys.kind_state(&rec.kind, rec.state),
        ] {
            inner.sets.entry(key).or_default().insert(rec.id, score);
        }
        inner.jobs.insert(rec.id, rec.clone());
        Ok(())
    }

    async fn read(&self, id: u64) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn update(
        &self,
        id: u64,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(rec) => {
                patch.apply(rec);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: u64,
        kind: &str,
        from: JobState,
        to: JobState,
        score: f64,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();

        // The global set decides the race; losing it leaves everything
        // untouched.
        let won = inner
            .sets
            .get_mut(&self.keys.state(from))
            .map_or(false, |set| set.remove(&id).is_some());
        if !won {
            return Ok(false);
        }

        if let Some(set) = inner.sets.get_mut(&self.keys.kind_state(kind, from))
        {
            set.remove(&id);
        }
        for key in [self.keys.state(to), self.keys.kind_state(kind, to)] {
            inner.sets.entry(key).or_default().insert(id, score);
        }
        if let Some(rec) = inner.jobs.get_mut(&id) {
            rec.state = to;
            patch.apply(rec);
        }
        Ok(true)
    }

    async fn remove(&self, id: u64, kind: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.jobs.remove(&id).is_none() {
            return Ok(false);
        }
        for state in JobState::ALL {
            for key in [self.keys.state(state), self.keys.kind_state(kind, state)]
            {
                if let Some(set) = inner.sets.get_mut(&key) {
                    set.remove(&id);
                }
            }
        }
        Ok(true)
    }

    async fn first_inactive(
        &self,
        kind: &str,
    ) -> Result<Option<u64>, StoreError> {
        let key = self.keys.kind_state(kind, JobState::Inactive);
        Ok(self.sorted(&key).first().map(|&(id, _)| id))
    }

    async fn delayed_batch(
        &self,
        limit: usize,
    ) -> Result<Vec<(u64, u64)>, StoreError> {
        let key = self.keys.state(JobState::Delayed);
        Ok(self
            .sorted(&key)
            .into_iter()
            .take(limit)
            .map(|(id, due)| (id, due as u64))
            .collect())
    }

    async fn state_ids(
        &self,
        state: JobState,
    ) -> Result<Vec<u64>, StoreError> {
        let key = self.keys.state(state);
        Ok(self.sorted(&key).into_iter().map(|(id, _)| id).collect())
    }

    async fn card(&self, state: JobState) -> Result<u64, StoreError> {
        let key = self.keys.state(state);
        let inner = self.inner.lock();
        Ok(inner.sets.get(&key).map_or(0, |set| set.len() as u64))
    }

    async fn kinds(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().kinds.iter().cloned().collect())
    }

    async fn add_work_time(&self, ms: u64) -> Result<(), StoreError> {
        self.inner.lock().work_time += ms;
        Ok(())
    }

    async fn work_time(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().work_time)
    }

    async fn publish(&self, payload: &[u8]) -> Result<(), StoreError> {
        // No subscribers is fine: delivery is at-most-once, not durable.
        let _ = self.events.send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError> {
        Ok(Box::new(MemorySubscription {
            rx: self.events.subscribe(),
        }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                // Lagged: messages were dropped for this subscriber.
                // That is the contract; pick up from the next one.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::store::claim_score;

    fn record(id: u64, kind: &str, priority: i32, state: JobState) -> JobRecord {
        JobRecord {
            id,
            kind: kind.to_owned(),
            data: serde_json::json!({}),
            priority,
            progress: 0,
            state,
            attempts_remaining: 1,
            max_attempts: 1,
            backoff: None,
            created_at: 1_000,
            updated_at: 1_000,
            delay: 0,
            duration: None,
            error: None,
        }
    }

    /// Membership across all state collections for one id.
    async fn memberships(store: &MemoryStore, id: u64) -> Vec<JobState> {
        let mut found = Vec::new();
        for state in JobState::ALL {
            if store.state_ids(state).await.unwrap().contains(&id) {
                found.push(state);
            }
        }
        found
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let store = MemoryStore::default();
        let a = store.next_id().await.unwrap();
        let b = store.next_id().await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_insert_joins_exactly_one_collection() {
        let store = MemoryStore::default();
        store
            .insert(&record(1, "email", 0, JobState::Inactive))
            .await
            .unwrap();
        assert_eq!(memberships(&store, 1).await, vec![JobState::Inactive]);
    }

    #[tokio::test]
    async fn test_transition_moves_between_collections() {
        let store = MemoryStore::default();
        store
            .insert(&record(1, "email", 0, JobState::Inactive))
            .await
            .unwrap();

        let won = store
            .transition(
                1,
                "email",
                JobState::Inactive,
                JobState::Active,
                claim_score(0, 1),
                &JobPatch::default(),
            )
            .await
            .unwrap();
        assert!(won);
        assert_eq!(memberships(&store, 1).await, vec![JobState::Active]);
        assert_eq!(
            store.read(1).await.unwrap().unwrap().state,
            JobState::Active
        );

        // A second claimer finds the id gone and must change nothing.
        let won = store
            .transition(
                1,
                "email",
                JobState::Inactive,
                JobState::Active,
                claim_score(0, 1),
                &JobPatch::default(),
            )
            .await
            .unwrap();
        assert!(!won);
        assert_eq!(memberships(&store, 1).await, vec![JobState::Active]);
    }

    #[tokio::test]
    async fn test_first_inactive_orders_by_priority_then_id() {
        let store = MemoryStore::default();
        store
            .insert(&record(1, "email", 0, JobState::Inactive))
            .await
            .unwrap();
        store
            .insert(&record(2, "email", -10, JobState::Inactive))
            .await
            .unwrap();
        store
            .insert(&record(3, "email", -10, JobState::Inactive))
            .await
            .unwrap();

        // Highest priority (lowest value) first, FIFO within it.
        assert_eq!(store.first_inactive("email").await.unwrap(), Some(2));

        // Other kinds never surface here.
        assert_eq!(store.first_inactive("sms").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_purges_everything() {
        let store = MemoryStore::default();
        store
            .insert(&record(1, "email", 0, JobState::Inactive))
            .await
            .unwrap();

        assert!(store.remove(1, "email").await.unwrap());
        assert!(store.read(1).await.unwrap().is_none());
        assert_eq!(memberships(&store, 1).await, vec![]);

        // Already gone.
        assert!(!store.remove(1, "email").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_patches_without_moving() {
        let store = MemoryStore::default();
        store
            .insert(&record(1, "email", 0, JobState::Active))
            .await
            .unwrap();

        let patch = JobPatch {
            progress: Some(42),
            ..JobPatch::default()
        };
        assert!(store.update(1, &patch).await.unwrap());
        assert!(!store.update(99, &patch).await.unwrap());

        let rec = store.read(1).await.unwrap().unwrap();
        assert_eq!(rec.progress, 42);
        assert_eq!(memberships(&store, 1).await, vec![JobState::Active]);
    }

    #[tokio::test]
    async fn test_delayed_batch_is_due_time_ordered() {
        let store = MemoryStore::default();
        let mut early = record(1, "email", 0, JobState::Delayed);
        early.delay = 500;
        let mut late = record(2, "email", 0, JobState::Delayed);
        late.delay = 5_000;
        store.insert(&late).await.unwrap();
        store.insert(&early).await.unwrap();

        let batch = store.delayed_batch(10).await.unwrap();
        assert_eq!(batch, vec![(1, 1_500), (2, 6_000)]);
        assert_eq!(store.delayed_batch(1).await.unwrap(), vec![(1, 1_500)]);
    }

    #[tokio::test]
    async fn test_pubsub_round_trip() {
        let store = MemoryStore::default();
        let mut sub = store.subscribe().await.unwrap();
        store.publish(b"hello").await.unwrap();
        assert_eq!(
            sub.next_message().await.unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn test_work_time_accumulates() {
        let store = MemoryStore::default();
        assert_eq!(store.work_time().await.unwrap(), 0);
        store.add_work_time(120).await.unwrap();
        store.add_work_time(80).await.unwrap();
        assert_eq!(store.work_time().await.unwrap(), 200);
    }
}
