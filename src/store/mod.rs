//! Coordination store client
//!
//! A thin key/value + watch abstraction over the shared store:
//! - `get`/`set`/`delete`/`keys_with_prefix` for plain access
//! - `get_versioned` + `commit` for compare-and-swap transactions
//! - `watch` for per-key change streams
//!
//! An absent key reads as an empty value with revision 0.

pub mod etcd;
pub mod memory;
pub mod watch;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use watch::{WatchHandle, WatchRegistry};

use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Kind of change delivered to a watch subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
    /// Current value re-read after a watch stream was (re)opened
    Resync,
}

/// Typed watch event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes and absent keys
    pub value: String,
    /// Store revision the event was produced at
    pub revision: i64,
}

/// A value together with the revision it was last modified at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub revision: i64,
}

impl Versioned {
    pub fn is_absent(&self) -> bool {
        self.revision == 0
    }
}

/// Transaction guard: `key` must still be at `revision` (0 = must not exist)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub key: String,
    pub revision: i64,
}

impl Precondition {
    pub fn unchanged(key: impl Into<String>, seen: &Versioned) -> Self {
        Self {
            key: key.into(),
            revision: seen.revision,
        }
    }
}

/// Write applied when every precondition holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Mutation {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Mutation::Delete { key: key.into() }
    }
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Shared, watchable key-value store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key with its modification revision.
    async fn get_versioned(&self, key: &str) -> Result<Versioned>;

    /// Read a key; absent keys read as `""`.
    async fn get(&self, key: &str) -> Result<String> {
        Ok(self.get_versioned(key).await?.value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key, or every key under it when `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply `mutations` atomically iff every guard holds. Returns whether it applied.
    async fn commit(&self, guards: &[Precondition], mutations: &[Mutation]) -> Result<bool>;

    /// Open a change stream for one key. The stream ends when the connection drops.
    async fn watch(&self, key: &str) -> Result<WatchStream>;
}

/// Run a compare-and-swap step until it applies.
///
/// `step` returns `Ok(None)` when its transaction lost a race; it is then re-run
/// from a fresh read, up to `attempts` times.
pub async fn retry_on_conflict<T, F, Fut>(key: &str, attempts: usize, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=attempts {
        if let Some(out) = step().await? {
            return Ok(out);
        }
        tracing::debug!(key = %key, attempt, "compare-and-swap lost a race, retrying");
        tokio::task::yield_now().await;
    }
    Err(Error::Conflict {
        key: key.to_string(),
        attempts,
    })
}
