//! Redis-backed store. Commands run on a multiplexed connection; every
//! multi-step transition runs as a Lua script so it is indivisible on
//! the server, and each subscriber gets its own dedicated connection (a
//! subscribed connection cannot interleave commands).

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Msg, Script};

use crate::error::StoreError;
use crate::job::JobState;
use crate::store::{
    entry_score, JobPatch, JobRecord, Keys, Store, Subscription,
};

const TRANSITION_LUA: &str = include_str!("lua/transition.lua");
const UPDATE_LUA: &str = include_str!("lua/update.lua");
const REMOVE_LUA: &str = include_str!("lua/remove.lua");

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
    transition: Script,
    update: Script,
    remove: Script,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`) with all keys
    /// namespaced under `prefix`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::Redis)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(StoreError::Redis)?;
        Ok(Self {
            client,
            conn,
            keys: Keys::new(prefix),
            transition: Script::new(TRANSITION_LUA),
            update: Script::new(UPDATE_LUA),
            remove: Script::new(REMOVE_LUA),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn next_id(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let id: u64 = conn.incr(self.keys.ids(), 1u64).await?;
        Ok(id)
    }

    async fn insert(&self, rec: &JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let score = entry_score(rec);
        let fields = rec.to_fields();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.keys.job(rec.id), &fields)
            .ignore()
            .sadd(self.keys.kinds(), &rec.kind)
            .ignore()
            .zadd(self.keys.state(rec.state), rec.id, score)
            .ignore()
            .zadd(self.keys.kind_state(&rec.kind, rec.state), rec.id, score)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn read(&self, id: u64) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys.job(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from_fields(id, &fields)?))
    }

    async fn update(
        &self,
        id: u64,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let mut inv = self.update.prepare_invoke();
        inv.key(self.keys.job(id));
        for (field, value) in patch.fields() {
            inv.arg(field).arg(value);
        }
        let updated: i64 = inv.invoke_async(&mut conn).await?;
        Ok(updated == 1)
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
        let mut conn = self.conn();
        let mut inv = self.transition.prepare_invoke();
        inv.key(self.keys.job(id))
            .key(self.keys.state(from))
            .key(self.keys.kind_state(kind, from))
            .key(self.keys.state(to))
            .key(self.keys.kind_state(kind, to))
            .arg(id)
            .arg(score)
            .arg(to.as_str());
        for (field, value) in patch.fields() {
            inv.arg(field).arg(value);
        }
        let won: i64 = inv.invoke_async(&mut conn).await?;
        Ok(won == 1)
    }

    async fn remove(&self, id: u64, kind: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let mut inv = self.remove.prepare_invoke();
        inv.key(self.keys.job(id));
        for state in JobState::ALL {
            inv.key(self.keys.state(state));
            inv.key(self.keys.kind_state(kind, state));
        }
        inv.arg(id);
        let removed: i64 = inv.invoke_async(&mut conn).await?;
        Ok(removed == 1)
    }

    async fn first_inactive(
        &self,
        kind: &str,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<u64> = conn
            .zrange(self.keys.kind_state(kind, JobState::Inactive), 0, 0)
            .await?;
        Ok(ids.first().copied())
    }

    async fn delayed_batch(
        &self,
        limit: usize,
    ) -> Result<Vec<(u64, u64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let entries: Vec<(u64, f64)> = conn
            .zrange_withscores(
                self.keys.state(JobState::Delayed),
                0,
                limit as isize - 1,
            )
            .await?;
        Ok(entries
            .into_iter()
            .map(|(id, due)| (id, due as u64))
            .collect())
    }

    async fn state_ids(
        &self,
        state: JobState,
    ) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<u64> = conn.zrange(self.keys.state(state), 0, -1).await?;
        Ok(ids)
    }

    async fn card(&self, state: JobState) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let n: u64 = conn.zcard(self.keys.state(state)).await?;
        Ok(n)
    }

    async fn kinds(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let kinds: Vec<String> = conn.smembers(self.keys.kinds()).await?;
        Ok(kinds)
    }

    async fn add_work_time(&self, ms: u64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: u64 = conn.incr(self.keys.work_time(), ms).await?;
        Ok(())
    }

    async fn work_time(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let total: Option<u64> = conn.get(self.keys.work_time()).await?;
        Ok(total.unwrap_or(0))
    }

    async fn publish(&self, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(self.keys.events(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.events()).await?;
        Ok(Box::new(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }
}

struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .messages
            .next()
            .await
            .map(|msg| msg.get_payload_bytes().to_vec()))
    }
}
