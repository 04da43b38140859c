#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use pacemaker_daemon_core as core;
pub use pacemaker_daemon_grpc as grpc;
pub use pacemaker_daemon_k8s_index as index;

mod args;
mod duration;
mod listen;


pub use self::args::Args;

/// Resolves slot keys against the node's pod index.
#[derive(Clone, Debug)]
struct PodDiscover(index::SharedIndex);

impl PodDiscover {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }
}

impl core::PodLookup for PodDiscover {
    fn get_pod_by_key(&self, key: &str) -> anyhow::Result<Option<core::PodContext>> {
        Ok(self.0.read().get(key))
    }
}
