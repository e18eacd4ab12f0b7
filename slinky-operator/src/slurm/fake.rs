//! An in-memory Slurm client for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{NodeState, SlurmClient, SlurmNode, UpdateNodeRequest};

/// A fake cluster backed by a node map, applying the same state-merge
/// semantics the real controller exposes: `UNDRAIN` removes `DRAIN` from the
/// state set, any other requested state is inserted.
#[derive(Default)]
pub struct FakeSlurmClient {
    nodes: Mutex<HashMap<String, SlurmNode>>,
    /// When set, every call returns an error, simulating an unreachable cluster.
    unreachable: Mutex<bool>,
}

impl FakeSlurmClient {
    /// Create a fake cluster pre-populated with the given nodes.
    pub fn with_nodes(nodes: impl IntoIterator<Item = SlurmNode>) -> Arc<Self> {
        let client = Self::default();
        {
            let mut map = client.nodes.lock().unwrap();
            for node in nodes {
                map.insert(node.name.clone(), node);
            }
        }
        Arc::new(client)
    }

    /// Toggle unreachability.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap() = unreachable;
    }

    /// Snapshot a node's current state, for assertions.
    pub fn node(&self, name: &str) -> Option<SlurmNode> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Overwrite a node's state set, simulating transitions made by the
    /// cluster itself (jobs finishing, nodes going down).
    pub fn set_states(&self, name: &str, states: &[NodeState]) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(name) {
            node.state = states.iter().copied().collect();
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if *self.unreachable.lock().unwrap() {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl SlurmClient for FakeSlurmClient {
    async fn list_nodes(&self) -> Result<Vec<SlurmNode>> {
        self.check_reachable()?;
        let mut nodes: Vec<_> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Option<SlurmNode>> {
        self.check_reachable()?;
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn update_node(&self, name: &str, req: UpdateNodeRequest) -> Result<()> {
        self.check_reachable()?;
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get_mut(name) else {
            bail!("unknown node {name}");
        };
        for state in req.state {
            match state {
                NodeState::Undrain => {
                    node.state.remove(&NodeState::Drain);
                }
                state => {
                    node.state.insert(state);
                }
            }
        }
        if req.comment.is_some() {
            node.comment = req.comment;
        }
        if req.reason.is_some() {
            node.reason = req.reason;
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.check_reachable()?;
        self.nodes.lock().unwrap().remove(name);
        Ok(())
    }
}
