//! Slurm-side coordination.
//!
//! Wraps the abstract cluster client with the drain semantics the reconciler
//! depends on: a pod may only be deleted once its Slurm peer reports `DRAIN`
//! with no remaining allocations, and `UNDRAIN` is only issued for nodes that
//! are draining but not down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::timeout;

use slinky_core::crd::{NodeSet, RequiredMetadata};
use slinky_core::error::{Error, Result};
use slinky_core::podinfo::PodInfo;

use crate::slurm::{ClusterKey, ClustersRegistry, NodeState, SlurmClient, SlurmNode, UpdateNodeRequest};

/// The default timeout for Slurm RPCs.
const SLURM_TIMEOUT: Duration = Duration::from_secs(10);

/// Reason recorded on Slurm nodes drained for a scale-down or rollout.
pub const DRAIN_REASON_SCALE_DOWN: &str = "nodeset scale-down";
/// Reason recorded on Slurm nodes drained because the NodeSet was deleted.
pub const DRAIN_REASON_DELETION: &str = "nodeset deleted";
/// Reason recorded on Slurm nodes drained for a rolling update.
pub const DRAIN_REASON_UPDATE: &str = "nodeset rolling update";
/// Reason recorded on Slurm nodes drained to replace an unhealthy pod.
pub const DRAIN_REASON_UNHEALTHY: &str = "nodeset pod replacement";

/// Talks to the Slurm cluster referenced by a NodeSet.
pub struct SlurmControl {
    clusters: ClustersRegistry,
}

impl SlurmControl {
    /// Create a new instance.
    pub fn new(clusters: ClustersRegistry) -> Self {
        Self { clusters }
    }

    fn client_for(&self, nodeset: &NodeSet) -> Result<Arc<dyn SlurmClient>> {
        let key = ClusterKey::new(nodeset.namespace(), &nodeset.spec.cluster_name);
        self.clusters
            .get(&key)
            .ok_or_else(|| Error::UnknownCluster(nodeset.spec.cluster_name.clone()))
    }

    fn unavailable(nodeset: &NodeSet, err: anyhow::Error) -> Error {
        Error::SlurmUnavailable { cluster: nodeset.spec.cluster_name.clone(), source: err }
    }

    async fn call<T>(
        &self,
        nodeset: &NodeSet,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        match timeout(SLURM_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Self::unavailable(nodeset, err)),
            Err(_) => Err(Self::unavailable(nodeset, anyhow!("slurm RPC timed out"))),
        }
    }

    /// List the nodes of the NodeSet's cluster.
    pub async fn list_nodes(&self, nodeset: &NodeSet) -> Result<Vec<SlurmNode>> {
        let client = self.client_for(nodeset)?;
        self.call(nodeset, client.list_nodes()).await
    }

    /// Fetch a single node by hostname.
    pub async fn get_node(&self, nodeset: &NodeSet, host: &str) -> Result<Option<SlurmNode>> {
        let client = self.client_for(nodeset)?;
        self.call(nodeset, client.get_node(host)).await
    }

    /// Request that the node stop accepting new job allocations.
    ///
    /// Idempotent: already-draining nodes are left untouched. The PodInfo
    /// breadcrumb is merged into the node's comment so the informer can route
    /// subsequent state changes back to the owning pod.
    #[tracing::instrument(level = "debug", skip(self, nodeset, info))]
    pub async fn drain(
        &self,
        nodeset: &NodeSet,
        host: &str,
        reason: &str,
        info: &PodInfo,
    ) -> Result<()> {
        let client = self.client_for(nodeset)?;
        let Some(node) = self.call(nodeset, client.get_node(host)).await? else {
            return Ok(());
        };
        if node.state.contains(&NodeState::Drain) {
            return Ok(());
        }
        let request = UpdateNodeRequest {
            state: vec![NodeState::Drain],
            comment: Some(info.merge_into_comment(node.comment.as_deref())),
            reason: Some(reason.to_string()),
        };
        tracing::info!(host = %host, reason = %reason, "draining slurm node");
        self.call(nodeset, client.update_node(host, request)).await
    }

    /// Allow job allocations on the node again.
    ///
    /// Only issued for nodes reporting `DRAIN` without `DOWN`; the meaning of
    /// an undrain against a down node is ambiguous, so it is never sent.
    #[tracing::instrument(level = "debug", skip(self, nodeset))]
    pub async fn undrain(&self, nodeset: &NodeSet, host: &str) -> Result<()> {
        let client = self.client_for(nodeset)?;
        let Some(node) = self.call(nodeset, client.get_node(host)).await? else {
            return Ok(());
        };
        if !node.state.contains(&NodeState::Drain) || node.state.contains(&NodeState::Down) {
            return Ok(());
        }
        let request = UpdateNodeRequest { state: vec![NodeState::Undrain], ..Default::default() };
        tracing::info!(host = %host, "undraining slurm node");
        self.call(nodeset, client.update_node(host, request)).await
    }

    /// True iff the node's state set contains `DRAIN` and carries no
    /// remaining `ALLOCATED` or `MIXED` allocation. Unknown hosts count as
    /// drained: there is nothing left to wait for.
    pub async fn is_drained(&self, nodeset: &NodeSet, host: &str) -> Result<bool> {
        let client = self.client_for(nodeset)?;
        let node = self.call(nodeset, client.get_node(host)).await?;
        Ok(node.map_or(true, |node| node.is_drained()))
    }

    /// Remove the node's registration from the cluster.
    #[tracing::instrument(level = "debug", skip(self, nodeset))]
    pub async fn delete_node(&self, nodeset: &NodeSet, host: &str) -> Result<()> {
        let client = self.client_for(nodeset)?;
        tracing::info!(host = %host, "deleting slurm node registration");
        self.call(nodeset, client.delete_node(host)).await
    }
}
