//! Requests awaiting a reply from the listener.
//!
//! The probing side registers a key before sending and keeps the returned
//! [`Registration`] while it waits. The listener side calls
//! [`PendingTable::deliver`], which removes the entry and fulfills its slot,
//! so each slot is written at most once. Dropping the registration removes
//! whatever is left, on every exit path of the probing call.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::ping::PingError;

#[derive(Debug)]
struct PendingRequest<V> {
    created: Instant,
    slot: oneshot::Sender<V>,
}

#[derive(Debug)]
pub struct PendingTable<K, V> {
    entries: Mutex<HashMap<K, PendingRequest<V>>>,
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Copy,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims `key`. Fails with [`PingError::Collision`] if a live request already holds it.
    pub fn register(self: &Arc<Self>, key: K) -> Result<Registration<K, V>, PingError> {
        let (tx, rx) = oneshot::channel();
        let created = Instant::now();
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&key) {
                return Err(PingError::Collision);
            }
            entries.insert(key, PendingRequest { created, slot: tx });
        }
        Ok(Registration {
            table: Arc::clone(self),
            key,
            created,
            rx: Some(rx),
        })
    }

    /// Hands `value` to the request registered under `key`.
    ///
    /// Returns `false` when nobody waits for it: the key was never ours, the
    /// request already timed out, or its caller went away.
    pub fn deliver(&self, key: K, value: V) -> bool {
        let request = self.entries.lock().remove(&key);
        match request {
            Some(request) => request.slot.send(value).is_ok(),
            None => false,
        }
    }

    /// Creation time of the request registered under `key`, if still live.
    pub fn created(&self, key: K) -> Option<Instant> {
        self.entries.lock().get(&key).map(|r| r.created)
    }

    pub fn remove(&self, key: K) -> bool {
        self.entries.lock().remove(&key).is_some()
    }

    /// Drops every slot; the waiting side observes a closed channel.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one key in a [`PendingTable`]. Unregisters on drop.
#[derive(Debug)]
pub struct Registration<K, V>
where
    K: Eq + Hash + Copy,
{
    table: Arc<PendingTable<K, V>>,
    key: K,
    created: Instant,
    rx: Option<oneshot::Receiver<V>>,
}

impl<K, V> Registration<K, V>
where
    K: Eq + Hash + Copy,
{
    pub fn key(&self) -> K {
        self.key
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Waits for the delivered value, at most `timeout`.
    ///
    /// A slot dropped without a value (the table was cleared on close) yields
    /// [`PingError::Closed`]. Waiting twice yields `Closed` as well.
    pub async fn wait(&mut self, timeout: Duration) -> Result<V, PingError> {
        let rx = self.rx.as_mut().ok_or(PingError::Closed)?;
        let res = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PingError::Closed),
            Err(_) => Err(PingError::Timeout),
        };
        self.rx = None;
        res
    }
}

impl<K, V> Drop for Registration<K, V>
where
    K: Eq + Hash + Copy,
{
    fn drop(&mut self) {
        self.table.remove(self.key);
    }
}
