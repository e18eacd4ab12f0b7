//! A polling informer over Slurm node state.
//!
//! Slurm has no watch API, so the informer periodically lists the nodes of
//! every registered cluster, diffs the result against its previous snapshot,
//! and emits the PodInfo breadcrumb of each added, removed, or state-changed
//! node into the controller's event channel. The event router turns those
//! into reconcile requests for the owning NodeSet.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use slinky_core::podinfo::PodInfo;

use super::{ClusterKey, ClustersRegistry, SlurmNode};

/// Watches Slurm node state across all registered clusters.
pub struct SlurmNodeInformer {
    /// The process-wide clusters registry.
    registry: ClustersRegistry,
    /// Where observed PodInfo records are sent.
    events: mpsc::Sender<PodInfo>,
    /// The interval between list polls.
    interval: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,

    /// Per-cluster snapshot of the previous poll, keyed by hostname.
    snapshots: HashMap<ClusterKey, HashMap<String, SlurmNode>>,
}

impl SlurmNodeInformer {
    /// Create a new instance.
    pub fn new(
        registry: ClustersRegistry,
        events: mpsc::Sender<PodInfo>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            events,
            interval,
            shutdown: BroadcastStream::new(shutdown),
            snapshots: HashMap::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("slurm node informer initialized");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_clusters().await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("slurm node informer shutdown");
        Ok(())
    }

    /// Poll every registered cluster once.
    async fn poll_clusters(&mut self) {
        for key in self.registry.keys() {
            let Some(client) = self.registry.get(&key) else {
                continue;
            };
            let nodes = match client.list_nodes().await {
                Ok(nodes) => nodes,
                Err(err) => {
                    tracing::error!(error = ?err, cluster = %key.name, "error listing slurm nodes");
                    continue;
                }
            };
            let current: HashMap<String, SlurmNode> =
                nodes.into_iter().map(|node| (node.name.clone(), node)).collect();
            let previous = self.snapshots.insert(key.clone(), current.clone()).unwrap_or_default();
            self.emit_changes(&previous, &current).await;
        }

        // Drop snapshots of clusters which have been deregistered.
        let live = self.registry.keys();
        self.snapshots.retain(|key, _| live.contains(key));
    }

    /// Emit a PodInfo event for every node added, removed, or state-changed
    /// between two snapshots. Nodes with no parseable PodInfo are skipped;
    /// no controller is waiting on nodes it never stamped.
    async fn emit_changes(
        &self,
        previous: &HashMap<String, SlurmNode>,
        current: &HashMap<String, SlurmNode>,
    ) {
        for (name, node) in current {
            let changed = match previous.get(name) {
                Some(old) => old.state != node.state,
                None => true,
            };
            if changed {
                self.emit(node).await;
            }
        }
        for (name, node) in previous {
            if !current.contains_key(name) {
                self.emit(node).await;
            }
        }
    }

    async fn emit(&self, node: &SlurmNode) {
        let info = PodInfo::from_comment(node.comment.as_deref());
        if info.is_empty() {
            return;
        }
        if self.events.send(info).await.is_err() {
            tracing::debug!("slurm event channel closed");
        }
    }
}
