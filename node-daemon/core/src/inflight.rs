//! Tracks the slot keys that are currently being processed.
//!
//! A key is held by at most one request at a time. Holders either call
//! [`InflightRegistry::release`] explicitly or, more commonly, hold an
//! [`InflightGuard`] that releases the key when it is dropped, so that every
//! exit path of a request (including the request future being dropped)
//! releases the key.

use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry as HashEntry, HashMap},
    sync::Arc,
};
use tokio::sync::watch;

#[derive(Debug, Default)]
pub struct InflightRegistry {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    by_key: HashMap<String, Holder>,
    next_id: u64,
}

#[derive(Debug)]
struct Holder {
    id: u64,

    /// Never written. Dropping it wakes all requests queued behind this holder.
    released_tx: watch::Sender<()>,
}

/// Releases its key from the registry when dropped.
#[derive(Debug)]
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    key: String,
    id: u64,
}

/// Returned when a key is already held by another request.
#[derive(Debug)]
pub struct Held {
    released_rx: watch::Receiver<()>,
}

// === impl InflightRegistry ===

impl InflightRegistry {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `key` if it is not already held, returning whether the caller
    /// now owns it.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.slots.lock().insert(key).is_ok()
    }

    /// Removes `key` regardless of which request holds it.
    pub fn release(&self, key: &str) {
        let holder = self.slots.lock().by_key.remove(key);
        // Wake queued requests outside of the lock.
        drop(holder);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims `key`, returning a guard that releases it on drop.
    pub fn claim(self: &Arc<Self>, key: &str) -> Result<InflightGuard, Held> {
        let id = self.slots.lock().insert(key)?;
        Ok(InflightGuard {
            registry: self.clone(),
            key: key.to_string(),
            id,
        })
    }

    /// Claims `key`, waiting for the current holder (if any) to release it.
    ///
    /// Callers bound this with their own deadline; dropping the future leaves
    /// the registry unchanged.
    pub async fn claim_queued(self: &Arc<Self>, key: &str) -> InflightGuard {
        loop {
            match self.claim(key) {
                Ok(guard) => return guard,
                Err(held) => held.released().await,
            }
        }
    }

    fn release_holder(&self, key: &str, id: u64) {
        let holder = {
            let mut slots = self.slots.lock();
            match slots.by_key.get(key) {
                Some(h) if h.id == id => slots.by_key.remove(key),
                _ => None,
            }
        };
        drop(holder);
    }
}

// === impl Slots ===

impl Slots {
    fn insert(&mut self, key: &str) -> Result<u64, Held> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        match self.by_key.entry(key.to_string()) {
            HashEntry::Occupied(entry) => Err(Held {
                released_rx: entry.get().released_tx.subscribe(),
            }),
            HashEntry::Vacant(entry) => {
                let (released_tx, _) = watch::channel(());
                entry.insert(Holder { id, released_tx });
                Ok(id)
            }
        }
    }
}

// === impl InflightGuard ===

impl InflightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // A key that was force-released and re-acquired belongs to someone
        // else now.
        self.registry.release_holder(&self.key, self.id);
    }
}

// === impl Held ===

impl Held {
    /// Completes once the current holder releases the key.
    pub async fn released(mut self) {
        // The sender never publishes a value, so this only returns once it is
        // dropped.
        let _ = self.released_rx.changed().await;
    }
}
