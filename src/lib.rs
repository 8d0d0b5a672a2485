//! kiln is a Redis-backed, priority-ordered job queue: producers
//! enqueue typed jobs with JSON payloads, and worker processes claim
//! and execute them, reporting completion, failure, and progress back
//! to any interested process over the store's pub/sub channel.
//!
//! All cross-process coordination happens through atomic operations on
//! the shared store; see [`store::Store`] for the contract. A queue
//! holds its own connections, its own event relay, and its own
//! registry of live job handles, so several queue instances (in one
//! process or many) cooperate safely over the same key prefix.
//!
//! ```no_run
//! use kiln::{Config, Queue};
//!
//! # async fn demo() -> kiln::Result<()> {
//! let queue = Queue::connect(Config::default()).await?;
//! let mut job = queue.create_job("email", serde_json::json!({
//!     "to": "user@example.com",
//! }));
//! job.priority(kiln::Priority::High).attempts(3);
//! job.save().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod job;
mod promoter;
pub mod queue;
pub mod store;
mod util;
pub mod worker;

pub use error::{Error, HandlerError, Result};
pub use events::{JobEvent, QueueEvent};
pub use job::{Job, JobState, Priority};
pub use queue::{Config, Queue};
pub use store::memory::MemoryStore;
pub use store::redis::RedisStore;
pub use store::Store;
pub use worker::Handler;
