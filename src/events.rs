//! Cross-process event relay.
//!
//! Every job mutation publishes a small JSON envelope on one shared
//! channel. Each queue instance lazily opens a single subscriber the
//! first time anything registers interest, and relays incoming events
//! two ways: onto the specific local `Job` handle tracked for that id
//! (so holders of the original object observe remote changes as if they
//! were local), and onto the queue-wide activity feed. Delivery is
//! at-most-once per connected subscriber and not durable; messages
//! published while disconnected are lost.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, StoreError};
use crate::store::{Store, Subscription};

/// Events observable on an individual job handle.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// The job was saved into its first state collection.
    Enqueue,
    /// A promoter moved the job from delayed to inactive.
    Promotion,
    /// The job was pushed back to delayed.
    Delay,
    /// Progress report in percent; never a state change.
    Progress(u8),
    Complete,
    /// A failed attempt, with the error description. Also emitted when
    /// the job will still be retried.
    Failed(String),
    Remove,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Enqueue => "enqueue",
            JobEvent::Promotion => "promotion",
            JobEvent::Delay => "delay",
            JobEvent::Progress(_) => "progress",
            JobEvent::Complete => "complete",
            JobEvent::Failed(_) => "failed",
            JobEvent::Remove => "remove",
        }
    }

    /// Terminal events end live tracking of a job handle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Complete | JobEvent::Failed(_) | JobEvent::Remove
        )
    }

    fn args(&self) -> Vec<Value> {
        match self {
            JobEvent::Progress(pct) => vec![Value::from(*pct)],
            JobEvent::Failed(error) => vec![Value::from(error.clone())],
            _ => Vec::new(),
        }
    }

    fn from_envelope(envelope: &Envelope) -> Option<JobEvent> {
        match envelope.event.as_str() {
            "enqueue" => Some(JobEvent::Enqueue),
            "promotion" => Some(JobEvent::Promotion),
            "delay" => Some(JobEvent::Delay),
            "progress" => {
                let pct = envelope.args.first()?.as_u64()?;
                Some(JobEvent::Progress(pct.min(100) as u8))
            },
            "complete" => Some(JobEvent::Complete),
            "failed" => {
                let error = envelope
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(JobEvent::Failed(error.to_owned()))
            },
            "remove" => Some(JobEvent::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobEvent::Progress(pct) => write!(f, "progress {pct}%"),
            JobEvent::Failed(error) => write!(f, "failed: {error}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Queue-wide activity, for listeners that do not hold a job handle.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    /// A relayed job event, regardless of which process caused it.
    Job { id: u64, event: JobEvent },
    /// An error with no direct caller to return to, e.g. a store
    /// failure inside a worker loop.
    Error(Arc<Error>),
}

/// The wire format on the event channel.
#[derive(Debug, Deserialize, Serialize)]
struct Envelope {
    id: u64,
    event: String,
    args: Vec<Value>,
}

/// A composed subscribe/emit capability; queue and job handles each
/// carry one instead of sharing a type hierarchy.
pub(crate) struct Emitter<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Emitter<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: T) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

struct Shared {
    /// Live job handles by id, owned here rather than process-wide.
    /// Entries join on `track` and leave on terminal events or
    /// teardown.
    registry: Mutex<HashMap<u64, Arc<Emitter<JobEvent>>>>,
    activity: Emitter<QueueEvent>,
}

/// One per queue instance: the publish path, the id→handle registry,
/// and the lazily-started relay loop.
pub(crate) struct EventBus {
    store: Arc<dyn Store>,
    shared: Arc<Shared>,
    relay: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl EventBus {
    pub(crate) fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            shared: Arc::new(Shared {
                registry: Mutex::new(HashMap::new()),
                activity: Emitter::new(),
            }),
            relay: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a job handle for live updates and makes sure the relay
    /// is running.
    pub(crate) async fn track(
        &self,
        id: u64,
        emitter: Arc<Emitter<JobEvent>>,
    ) -> Result<(), StoreError> {
        self.shared.registry.lock().insert(id, emitter);
        self.ensure_relay().await
    }

    /// Subscribes to the queue-wide activity feed.
    pub(crate) async fn activity(
        &self,
    ) -> Result<broadcast::Receiver<QueueEvent>, StoreError> {
        self.ensure_relay().await?;
        Ok(self.shared.activity.subscribe())
    }

    /// Fans out an error that has no caller to return to.
    pub(crate) fn error(&self, error: Error) {
        self.shared.activity.emit(QueueEvent::Error(Arc::new(error)));
    }

    /// Publishes one job event to every connected subscriber, this
    /// process included.
    pub(crate) async fn publish(
        &self,
        id: u64,
        event: &JobEvent,
    ) -> Result<(), StoreError> {
        let envelope = Envelope {
            id,
            event: event.name().to_owned(),
            args: event.args(),
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| StoreError::Corrupt(format!("encode envelope: {e}")))?;
        self.store.publish(&payload).await
    }

    /// The subscription is only opened once someone cares, to avoid an
    /// idle dedicated connection per process.
    async fn ensure_relay(&self) -> Result<(), StoreError> {
        let mut relay = self.relay.lock().await;
        if relay.is_some() {
            return Ok(());
        }
        let sub = self.store.subscribe().await?;
        *relay = Some(tokio::spawn(relay_loop(
            sub,
            self.shared.clone(),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Stops the relay and drops every tracked handle.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.shared.registry.lock().clear();
    }
}

async fn relay_loop(
    mut sub: Box<dyn Subscription>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = sub.next_message() => msg,
        };
        match msg {
            Ok(Some(payload)) => dispatch(&shared, &payload),
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "event subscription lost");
                shared
                    .activity
                    .emit(QueueEvent::Error(Arc::new(Error::Store(error))));
                return;
            },
        }
    }
}

fn dispatch(shared: &Shared, payload: &[u8]) {
    // Malformed messages are dropped; they must never take down the
    // receive loop.
    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            debug!(%error, "dropping malformed event envelope");
            return;
        },
    };
    let Some(event) = JobEvent::from_envelope(&envelope) else {
        debug!(event = %envelope.event, "dropping unknown event");
        return;
    };

    let handle = {
        let mut registry = shared.registry.lock();
        if event.is_terminal() {
            registry.remove(&envelope.id)
        } else {
            registry.get(&envelope.id).cloned()
        }
    };
    if let Some(emitter) = handle {
        emitter.emit(event.clone());
    }

    shared.activity.emit(QueueEvent::Job {
        id: envelope.id,
        event,
    });
}
