//! Watch subscriptions keyed by path
//!
//! Each subscribed key gets its own loop: open a stream, emit a `Resync` event with
//! the value read right after opening, forward stream events, and reopen with
//! bounded exponential backoff when the stream ends or fails. Stream errors are
//! logged here and never reach the subscriber.

use super::{CoordinationStore, EventKind, WatchEvent, WatchStream};
use crate::common::{Backoff, Result};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running subscription
pub struct WatchHandle {
    task: JoinHandle<()>,
}

pub struct WatchRegistry {
    store: Arc<dyn CoordinationStore>,
    backoff: Backoff,
    cancel: CancellationToken,
    subscriptions: Mutex<HashMap<String, WatchHandle>>,
}

impl WatchRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, backoff: Backoff, cancel: CancellationToken) -> Self {
        Self {
            store,
            backoff,
            cancel,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `key`, delivering events into `events`.
    ///
    /// Returns `false` without side effects when the key is already watched.
    pub fn subscribe(&self, key: &str, events: mpsc::Sender<WatchEvent>) -> bool {
        let mut subs = self.lock();
        if subs.contains_key(key) {
            return false;
        }
        let task = tokio::spawn(run_watch(
            self.store.clone(),
            key.to_string(),
            events,
            self.cancel.child_token(),
            self.backoff.clone(),
        ));
        subs.insert(key.to_string(), WatchHandle { task });
        tracing::info!(key = %key, "Watch subscribed");
        true
    }

    pub fn is_watching(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Watched keys, sorted.
    pub fn watched(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<WatchHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.task.await {
                tracing::warn!("Watch task ended abnormally: {}", e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WatchHandle>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Open a stream, then read the current value so nothing between the two is missed.
async fn open_with_resync(store: &dyn CoordinationStore, key: &str) -> Result<(WatchStream, WatchEvent)> {
    let stream = store.watch(key).await?;
    let current = store.get_versioned(key).await?;
    let resync = WatchEvent {
        kind: EventKind::Resync,
        key: key.to_string(),
        value: current.value,
        revision: current.revision,
    };
    Ok((stream, resync))
}

/// Send unless cancelled first. A full channel must not hold up shutdown.
async fn deliver(events: &mpsc::Sender<WatchEvent>, event: WatchEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn run_watch(
    store: Arc<dyn CoordinationStore>,
    key: String,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    mut backoff: Backoff,
) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = open_with_resync(store.as_ref(), &key) => opened,
        };

        match opened {
            Ok((mut stream, resync)) => {
                backoff.reset();
                if !deliver(&events, resync, &cancel).await {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if !deliver(&events, event, &cancel).await {
                                tracing::debug!(key = %key, "Subscriber gone, stopping watch");
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(key = %key, "Watch stream failed: {}", e);
                            break;
                        }
                        None => {
                            tracing::debug!(key = %key, "Watch stream closed");
                            break;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(key = %key, "Cannot open watch: {}", e),
        }

        let delay = backoff.next_delay();
        tracing::debug!(key = %key, "Reopening watch in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
