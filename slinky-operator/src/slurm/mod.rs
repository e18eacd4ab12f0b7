//! The abstract Slurm cluster interface.
//!
//! The operator never talks to a Slurm REST endpoint directly; it consumes
//! connected clients through the [`SlurmClient`] trait and resolves them by
//! cluster name through the process-wide [`ClustersRegistry`]. The concrete
//! REST client is an external collaborator wired in at process startup.

pub mod informer;

#[cfg(test)]
pub mod fake;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;

/// A single Slurm node state.
///
/// A node carries a *set* of these; base states like `IDLE` or `ALLOCATED`
/// coexist with flags like `DRAIN`. `UNDRAIN` is only ever a requested
/// transition: merging it into a node's state set removes `DRAIN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Completing,
    Down,
    Drain,
    Undrain,
    Unknown,
}

/// A compute node registered with a Slurm controller, identified by hostname.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlurmNode {
    /// The node's hostname. Pairing between a pod and its Slurm node is by
    /// hostname equality.
    pub name: String,
    /// The node's current state set.
    pub state: BTreeSet<NodeState>,
    /// Free-text comment; carries the PodInfo breadcrumb.
    pub comment: Option<String>,
    /// Free-text reason for the most recent state transition.
    pub reason: Option<String>,
}

impl SlurmNode {
    /// True iff the node is draining and has no remaining job allocations.
    pub fn is_drained(&self) -> bool {
        self.state.contains(&NodeState::Drain)
            && !self.state.contains(&NodeState::Allocated)
            && !self.state.contains(&NodeState::Mixed)
    }

    /// True iff the node has jobs allocated to it.
    pub fn has_jobs(&self) -> bool {
        self.state.contains(&NodeState::Allocated) || self.state.contains(&NodeState::Mixed)
    }
}

/// A state-merge request addressed to a Slurm node.
///
/// The server merges `state` into the node's state set: `UNDRAIN` removes
/// `DRAIN`, any other state is inserted.
#[derive(Clone, Debug, Default)]
pub struct UpdateNodeRequest {
    pub state: Vec<NodeState>,
    pub comment: Option<String>,
    pub reason: Option<String>,
}

/// A connected client for one Slurm cluster.
///
/// Implementations must honor caller cancellation: all methods are invoked
/// with a timeout by the controller.
#[async_trait]
pub trait SlurmClient: Send + Sync + 'static {
    /// List all nodes registered with the cluster.
    async fn list_nodes(&self) -> Result<Vec<SlurmNode>>;

    /// Fetch a single node by hostname. Returns `None` for unknown hosts.
    async fn get_node(&self, name: &str) -> Result<Option<SlurmNode>>;

    /// Merge the requested state transitions into the node's state set.
    async fn update_node(&self, name: &str, req: UpdateNodeRequest) -> Result<()>;

    /// Remove the node's registration. Unknown hosts are a no-op.
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// The key identifying one Slurm cluster within the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    /// The namespace of the NodeSets served by this cluster.
    pub namespace: String,
    /// The cluster name, as referenced by `NodeSetSpec::cluster_name`.
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Process-wide registry of connected Slurm cluster clients.
///
/// Cheap to clone; all clones share the same map. Mutations never hold the
/// lock across I/O: callers clone the `Arc`ed client out before awaiting.
#[derive(Clone, Default)]
pub struct ClustersRegistry {
    inner: Arc<RwLock<HashMap<ClusterKey, Arc<dyn SlurmClient>>>>,
}

impl ClustersRegistry {
    /// Register a client for the given cluster, replacing any previous one.
    pub fn add(&self, key: ClusterKey, client: Arc<dyn SlurmClient>) {
        self.inner.write().expect("clusters registry lock poisoned").insert(key, client);
    }

    /// Remove a cluster's client.
    pub fn remove(&self, key: &ClusterKey) {
        self.inner.write().expect("clusters registry lock poisoned").remove(key);
    }

    /// Fetch the client for the given cluster.
    pub fn get(&self, key: &ClusterKey) -> Option<Arc<dyn SlurmClient>> {
        self.inner.read().expect("clusters registry lock poisoned").get(key).cloned()
    }

    /// The keys of all registered clusters.
    pub fn keys(&self) -> Vec<ClusterKey> {
        self.inner.read().expect("clusters registry lock poisoned").keys().cloned().collect()
    }
}
