#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod inflight;
pub mod limit;
mod outcome;
mod pod;
pub mod poll;


pub use self::{
    inflight::InflightRegistry,
    limit::ConcurrencyLimit,
    outcome::{Outcome, SlotDecision},
    pod::{OwnerRef, PodContext},
};
use anyhow::Result;
use tokio::time;

/// Resolves the pod that is waiting on a slot.
///
/// Implementations are expected to be backed by a local cache: a pod that has
/// not been observed yet is reported as `Ok(None)` and the caller polls again.
pub trait PodLookup: Send + Sync + 'static {
    fn get_pod_by_key(&self, key: &str) -> Result<Option<PodContext>>;
}

/// Decides whether a slot is currently available for a pod.
#[async_trait::async_trait]
pub trait SlotPolicy: Send + Sync + 'static {
    /// Completes once a slot has been granted to `key`.
    ///
    /// The returned future may be dropped at any point (the request was
    /// cancelled or `deadline` elapsed), so implementations must not leak
    /// state across an await point.
    async fn acquire_slot(&self, key: &str, pod: &PodContext, deadline: time::Instant)
        -> Result<()>;
}

/// Notified when a pod no longer needs the slot it was granted.
pub trait ReleaseSlot: Send + Sync + 'static {
    fn release_slot(&self, key: &str);
}

/// Formats the slot key for a pod.
pub fn slot_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
