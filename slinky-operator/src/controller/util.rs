//! Pod and ownership helpers shared across the controller.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use slinky_core::crd::{NodeSet, RequiredMetadata};
use slinky_core::{API_VERSION, ANNOTATION_HOSTNAME, LABEL_REVISION_HASH};

/// The reconcile-request key of a NodeSet, `namespace/name`.
pub fn nodeset_key(nodeset: &NodeSet) -> String {
    format!("{}/{}", nodeset.namespace(), nodeset.name())
}

/// The cache key of a pod, `namespace/name`.
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// The Kubernetes node a pod is bound to, falling back to the hostname
/// annotation stamped at creation time.
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .or_else(|| {
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(ANNOTATION_HOSTNAME))
                .map(String::as_str)
        })
}

/// The revision hash a pod was created from.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_REVISION_HASH))
        .map(String::as_str)
}

/// True if the pod has a deletion timestamp.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// True if the pod reports phase `Failed`.
pub fn is_failed(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Failed")
}

/// True if the pod reports phase `Pending`.
pub fn is_pending(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Pending")
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}

/// True if the pod's `Ready` condition is `True`.
pub fn is_ready(pod: &Pod) -> bool {
    ready_transition_time(pod).is_some()
}

/// True if the pod has been ready for at least `min_ready_seconds`.
pub fn is_available(pod: &Pod, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    match ready_transition_time(pod) {
        Some(since) if min_ready_seconds > 0 => {
            now.signed_duration_since(since) >= chrono::Duration::seconds(min_ready_seconds.into())
        }
        Some(_) => true,
        None => false,
    }
}

fn ready_transition_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions.iter().find(|c| c.type_ == "Ready" && c.status == "True")
        })
        .map(|condition| {
            condition
                .last_transition_time
                .as_ref()
                .map(|time| time.0)
                .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
        })
}

/// True if an owner reference points at the NodeSet kind this controller
/// serves, regardless of which object it names.
pub fn is_nodeset_ref(owner: &OwnerReference) -> bool {
    owner.kind == NodeSet::kind(&()).as_ref() && owner.api_version == API_VERSION
}

/// The controller owner reference of a pod, if any.
pub fn controller_ref(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Build the controller owner reference pointing at a NodeSet.
pub fn nodeset_owner_ref(nodeset: &NodeSet) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.into(),
        kind: NodeSet::kind(&()).into_owned(),
        name: nodeset.name().to_string(),
        uid: nodeset.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Classification of a pod relative to one NodeSet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Controlled by this NodeSet (kind, name, and UID all match).
    Owned,
    /// Has no controller; an adoption candidate if the selector matches.
    Orphan,
    /// Controlled by something else, or by a stale object with our name but a
    /// different UID.
    ForeignOwned,
}

/// Classify a pod's relationship to the given NodeSet.
pub fn classify(nodeset: &NodeSet, pod: &Pod) -> Ownership {
    let Some(owner) = controller_ref(pod) else {
        return Ownership::Orphan;
    };
    let uid = nodeset.meta().uid.as_deref().unwrap_or_default();
    if is_nodeset_ref(owner) && owner.name == nodeset.name() && owner.uid == uid {
        Ownership::Owned
    } else {
        Ownership::ForeignOwned
    }
}
