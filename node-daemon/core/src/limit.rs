//! A fixed-size concurrency limit.
//!
//! Each key holds at most one permit. Permits are returned when the pod that
//! holds one reports that it no longer needs it (see [`ReleaseSlot`]) or when
//! the maximum hold time elapses, whichever comes first.

use crate::{PodContext, ReleaseSlot, SlotPolicy};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time,
};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct ConcurrencyLimit {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    max_hold: time::Duration,
    holders: Mutex<Holders>,
}

#[derive(Debug, Default)]
struct Holders {
    by_key: HashMap<String, Holder>,
    next_id: u64,
}

#[derive(Debug)]
struct Holder {
    id: u64,
    _permit: OwnedSemaphorePermit,
}

// === impl ConcurrencyLimit ===

impl ConcurrencyLimit {
    pub fn new(limit: usize, max_hold: time::Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(limit)),
                max_hold,
                holders: Mutex::new(Holders::default()),
            }),
        }
    }

    /// The number of slots that may be granted right now.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.inner.holders.lock().by_key.contains_key(key)
    }

    fn hold(&self, key: &str, permit: OwnedSemaphorePermit) -> u64 {
        let mut holders = self.inner.holders.lock();
        holders.next_id = holders.next_id.wrapping_add(1);
        let id = holders.next_id;
        let prior = holders.by_key.insert(
            key.to_string(),
            Holder {
                id,
                _permit: permit,
            },
        );
        drop(holders);
        drop(prior);
        id
    }

    fn expire(&self, key: &str, id: u64) {
        let holder = {
            let mut holders = self.inner.holders.lock();
            match holders.by_key.get(key) {
                Some(h) if h.id == id => holders.by_key.remove(key),
                _ => None,
            }
        };
        if holder.is_some() {
            info!(slot = %key, max_hold = ?self.inner.max_hold, "Slot held too long; releasing");
        }
    }
}

#[async_trait::async_trait]
impl SlotPolicy for ConcurrencyLimit {
    async fn acquire_slot(
        &self,
        key: &str,
        _pod: &PodContext,
        deadline: time::Instant,
    ) -> Result<()> {
        // A pod whose network setup is retried keeps the slot it already has.
        if self.is_held(key) {
            debug!(slot = %key, "Slot already held");
            return Ok(());
        }

        let permit = time::timeout_at(deadline, self.inner.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| anyhow!("no slot became available before the deadline"))?
            .map_err(|_| anyhow!("concurrency limit closed"))?;
        let id = self.hold(key, permit);
        debug!(slot = %key, available = self.available(), "Slot granted");

        let limit = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            time::sleep(limit.inner.max_hold).await;
            limit.expire(&key, id);
        });

        Ok(())
    }
}

impl ReleaseSlot for ConcurrencyLimit {
    fn release_slot(&self, key: &str) {
        let holder = self.inner.holders.lock().by_key.remove(key);
        if holder.is_some() {
            debug!(slot = %key, "Slot released");
        }
    }
}
