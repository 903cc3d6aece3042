//! In-process store with etcd semantics
//!
//! Revisions increase globally on every write, watches see every change to their
//! key, and transactions compare modification revisions. Used by tests and by
//! `--dry-run` CLI invocations.

use super::{CoordinationStore, EventKind, Mutation, Precondition, Versioned, WatchEvent, WatchStream};
use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Versioned>,
    revision: i64,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
}

impl Inner {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|(key, tx)| {
            if *key != event.key {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, key: &str, value: &str) {
        self.revision += 1;
        let entry = Versioned {
            value: value.to_string(),
            revision: self.revision,
        };
        self.data.insert(key.to_string(), entry);
        let event = WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
            revision: self.revision,
        };
        self.notify(event);
    }

    fn remove(&mut self, key: &str) {
        if self.data.remove(key).is_none() {
            return;
        }
        self.revision += 1;
        let event = WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: String::new(),
            revision: self.revision,
        };
        self.notify(event);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Number of watch streams currently attached.
    pub fn open_watches(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|(_, tx)| !tx.is_closed());
        inner.watchers.len()
    }

    /// Make every call fail with `StoreUnavailable` until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            self.disconnect_watches();
        }
    }

    /// Copy of every key/value pair, for assertions.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.lock()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_versioned(&self, key: &str) -> Result<Versioned> {
        self.check_available()?;
        Ok(self.lock().data.get(key).cloned().unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.lock().put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();
        let doomed: Vec<String> = if recursive {
            inner
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            vec![key.to_string()]
        };
        for k in doomed {
            inner.remove(&k);
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn commit(&self, guards: &[Precondition], mutations: &[Mutation]) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.lock();
        let holds = guards.iter().all(|g| {
            let current = inner.data.get(&g.key).map(|v| v.revision).unwrap_or(0);
            current == g.revision
        });
        if !holds {
            return Ok(false);
        }
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => inner.put(key, value),
                Mutation::Delete { key } => inner.remove(key),
            }
        }
        Ok(true)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push((key.to_string(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }
}
