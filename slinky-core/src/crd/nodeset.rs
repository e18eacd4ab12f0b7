//! NodeSet CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. A NodeSet
//! projects a pool of Slurm compute nodes onto Kubernetes pods: each NodeSet
//! declares a pod template and a target replica count (or "one pod per
//! selectable node" when the replica count is absent), and the operator
//! drives the cluster toward that state while coordinating job draining with
//! the remote Slurm controller.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type NodeSet = NodeSetCRD; // Mostly to resolve a Rust Analyzer issue.

/// A status condition reported on a NodeSet.
pub type NodeSetCondition = Condition;

/// `Available` condition type: the NodeSet has its minimum available replicas.
pub const CONDITION_AVAILABLE: &str = "Available";
/// `Progressing` condition type: the NodeSet is advancing toward its desired state.
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition reason recorded when the Slurm cluster cannot be reached.
pub const REASON_SLURM_UNAVAILABLE: &str = "SlurmUnavailable";

/// CRD spec for the NodeSet resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "NodeSetCRD",
    status = "NodeSetStatus",
    group = "slinky.slurm.net",
    version = "v1alpha1",
    kind = "NodeSet",
    namespaced,
    derive = "PartialEq",
    shortname = "nss",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Desired","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"number","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Up-to-date","type":"number","jsonPath":".status.updatedReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// The name of the Slurm cluster which the pods of this NodeSet join.
    ///
    /// The named cluster must have a connected client in the operator's
    /// clusters registry before pods can be drained or undrained.
    pub cluster_name: String,

    /// The number of worker pods to run.
    ///
    /// When absent, one pod is run per Kubernetes node matching the template's
    /// scheduling constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// A label selector over the pods owned by this NodeSet.
    ///
    /// Must match the labels of `template`.
    pub selector: LabelSelector,

    /// The pod template which owned worker pods are created from.
    pub template: PodTemplateSpec,

    /// The strategy used to replace existing pods with new ones.
    #[serde(default)]
    pub update_strategy: NodeSetUpdateStrategy,

    /// The number of historical pod-template revisions to retain for rollback.
    #[serde(default = "NodeSetSpec::default_revision_history_limit")]
    pub revision_history_limit: i32,

    /// Minimum number of seconds a new pod must be ready before it is
    /// considered available.
    #[serde(default)]
    pub min_ready_seconds: i32,
}

impl NodeSetSpec {
    fn default_revision_history_limit() -> i32 {
        10
    }
}

/// The rollout strategy of a NodeSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetUpdateStrategy {
    /// The type of rollout to perform when the pod template changes.
    #[serde(default, rename = "type")]
    pub type_: UpdateStrategyType,
    /// Parameters for the `RollingUpdate` strategy type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

/// Rollout strategy types.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum UpdateStrategyType {
    /// Replace outdated pods automatically, bounded by `maxUnavailable`.
    #[default]
    RollingUpdate,
    /// Only replace pods which the user deletes manually.
    OnDelete,
}

/// Parameters of a rolling update.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// The maximum number of pods which may be unavailable during the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
    /// Node ordinals below this value are exempt from the rolling update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

impl NodeSetUpdateStrategy {
    /// The effective `maxUnavailable` budget, defaulting to 1.
    pub fn max_unavailable(&self) -> i32 {
        self.rolling_update
            .as_ref()
            .and_then(|rolling| rolling.max_unavailable)
            .unwrap_or(1)
            .max(1)
    }

    /// The effective rollout partition, defaulting to 0.
    pub fn partition(&self) -> i32 {
        self.rolling_update
            .as_ref()
            .and_then(|rolling| rolling.partition)
            .unwrap_or(0)
            .max(0)
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// The number of owned pods.
    #[serde(default)]
    pub replicas: i32,
    /// The number of owned pods with a Ready condition.
    #[serde(default)]
    pub ready_replicas: i32,
    /// The number of owned pods ready for at least `minReadySeconds`.
    #[serde(default)]
    pub available_replicas: i32,
    /// The number of owned pods created from the update revision.
    #[serde(default)]
    pub updated_replicas: i32,
    /// The name of the revision most owned pods were created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    /// The name of the revision new pods are created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    /// The number of revision-name hash collisions observed, used as an input
    /// to the revision hash to break the collision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    /// Current service state conditions of the NodeSet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeSetCondition>,
}
