//! Latest-value state container with change notification
//!
//! This is the sole coupling between workers: the coordinator's inventory
//! sync publishes here, the HTTP long-poll handlers and the agent reconciler
//! watch here. Watchers are wake-only — no payloads, no replay, a one-slot
//! buffer per watcher so bumps coalesce while a watcher hasn't drained.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A concurrent holder for the most recent value of `T`.
///
/// Cloning is cheap and shares the underlying cell.
#[derive(Debug)]
pub struct StateContainer<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

#[derive(Debug)]
struct Inner<T> {
    current: Option<T>,
    watchers: HashMap<u64, mpsc::Sender<()>>,
    next_id: u64,
}

impl<T> Clone for StateContainer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for StateContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StateContainer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                watchers: HashMap::new(),
                next_id: 0,
            })),
        }
    }
}

impl<T: Clone + Send + 'static> StateContainer<T> {
    /// Returns the most recently swapped value, or `None` before any swap.
    pub fn get(&self) -> Option<T> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Installs a new value and wakes every live watcher.
    ///
    /// Replacement and notification happen under one lock, so a `get`
    /// following a watcher wake always observes the new value.
    pub fn swap(&self, val: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = Some(val);
        inner.bump();
    }

    /// Wakes watchers without changing the value.
    ///
    /// Reconcilers call this after a successful mutation to request another
    /// pass, letting a long convergence proceed one step per wakeup.
    pub fn re_enter(&self) {
        self.inner.lock().unwrap().bump();
    }

    /// Registers a watcher bounded by `cancel`.
    ///
    /// The returned channel receives one unit per coalesced bump. When the
    /// token is cancelled the watcher is deregistered and the channel closed.
    pub fn watch(&self, cancel: CancellationToken) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);

        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.watchers.insert(id, tx);
            id
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            cancel.cancelled().await;
            inner.lock().unwrap().watchers.remove(&id);
        });

        rx
    }
}

impl<T> Inner<T> {
    fn bump(&mut self) {
        for tx in self.watchers.values() {
            // A full buffer means the watcher hasn't drained the last wake
            // yet — it will re-read the whole value anyway.
            let _ = tx.try_send(());
        }
    }
}
