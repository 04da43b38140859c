use k8s_openapi::api::core::v1::{Pod, PodStatus};
use pacemaker_daemon_core::{OwnerRef, PodContext};

pub(crate) fn context(namespace: String, name: String, pod: Pod) -> PodContext {
    let meta = pod.metadata;
    PodContext {
        namespace,
        name,
        labels: meta.labels.unwrap_or_default(),
        owner_references: meta
            .owner_references
            .into_iter()
            .flatten()
            .map(|o| OwnerRef {
                kind: o.kind,
                name: o.name,
                controller: o.controller.unwrap_or(false),
            })
            .collect(),
    }
}

/// Indicates whether the pod has become ready or has terminated.
pub(crate) fn no_longer_needs_slot(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    is_finished(status) || is_ready(status)
}

fn is_finished(status: &PodStatus) -> bool {
    matches!(status.phase.as_deref(), Some("Succeeded" | "Failed"))
}

fn is_ready(status: &PodStatus) -> bool {
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}
