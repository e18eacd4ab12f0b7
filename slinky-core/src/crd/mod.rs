//! Slinky CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod nodeset;

use kube::Resource;

pub use nodeset::{
    NodeSet, NodeSetCondition, NodeSetSpec, NodeSetStatus, NodeSetUpdateStrategy, RollingUpdate,
    UpdateStrategyType, CONDITION_AVAILABLE, CONDITION_PROGRESSING, REASON_SLURM_UNAVAILABLE,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for NodeSet {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
