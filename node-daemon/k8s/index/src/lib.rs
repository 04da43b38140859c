//! An index of the pods scheduled to this node.
//!
//! The wait handler resolves each slot key against this index, so it must
//! contain every pod whose network is being set up on the node. Pods are kept
//! in the index for as long as they exist; the index also reports lifecycle
//! transitions to the slot policy:
//!
//! - A pod that becomes `Ready`, or that reaches a terminal phase, no longer
//!   needs its slot.
//! - A deleted pod never will.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod pod;


use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use pacemaker_daemon_core::{slot_key, PodContext, ReleaseSlot};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    by_ns: HashMap<String, NamespaceIndex>,
    releaser: Arc<dyn ReleaseSlot>,
}

#[derive(Debug, Default)]
struct NamespaceIndex {
    pods: HashMap<String, PodContext>,
}

// === impl Index ===

impl Index {
    pub fn shared(releaser: Arc<dyn ReleaseSlot>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            by_ns: HashMap::default(),
            releaser,
        }))
    }

    /// Looks up a pod by its `namespace/name` slot key.
    pub fn get(&self, key: &str) -> Option<PodContext> {
        let (ns, name) = key.split_once('/')?;
        self.by_ns.get(ns)?.pods.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_ns.values().map(|ns| ns.pods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ns.values().all(|ns| ns.pods.is_empty())
    }

    fn release(&self, namespace: &str, name: &str) {
        self.releaser.release_slot(&slot_key(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        let name = pod.name_unchecked();

        if pod::no_longer_needs_slot(&pod) {
            trace!(%namespace, %name, "Pod is ready or finished");
            self.release(&namespace, &name);
        }

        let ctx = pod::context(namespace.clone(), name.clone(), pod);
        self.by_ns
            .entry(namespace)
            .or_default()
            .pods
            .insert(name, ctx);
    }

    fn delete(&mut self, namespace: String, name: String) {
        debug!(%namespace, %name, "Pod deleted");
        self.release(&namespace, &name);

        if let Some(ns) = self.by_ns.get_mut(&namespace) {
            ns.pods.remove(&name);
            if ns.pods.is_empty() {
                self.by_ns.remove(&namespace);
            }
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("by_ns", &self.by_ns)
            .finish_non_exhaustive()
    }
}
