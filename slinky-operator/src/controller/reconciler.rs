//! NodeSet reconciliation.
//!
//! ## Overview
//! One pass drives a single NodeSet toward its declared state on both sides
//! of the pairing. The desired pod set is computed from Kubernetes nodes and
//! the live Slurm node list; deltas are then applied in a strict
//! delete-before-create-before-update order so a pass can never
//! over-provision. Every pod removal goes through drain-then-delete: the
//! Slurm node is asked to stop accepting jobs first, and the pod is only
//! deleted once the node reports `DRAIN` with no remaining allocations.
//!
//! Slurm unavailability is deliberately non-fatal. The pass records a
//! `Progressing=False` condition and requeues; the Kubernetes side of the
//! world is left untouched until the cluster answers again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Context as AnyhowContext;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::Resource;
use tokio::time::timeout;

use slinky_core::crd::{
    NodeSet, NodeSetCondition, RequiredMetadata, UpdateStrategyType, CONDITION_AVAILABLE,
    CONDITION_PROGRESSING, REASON_SLURM_UNAVAILABLE,
};
use slinky_core::error::{Error, Result};
use slinky_core::labels::{selector_is_empty, selector_matches};
use slinky_core::podinfo::PodInfo;
use slinky_core::NODESET_FINALIZER;

use crate::slurm::{NodeState, SlurmNode};

use super::node_matcher::node_should_run_pod;
use super::revisions::RealizedRevisions;
use super::slurm_control::{
    DRAIN_REASON_DELETION, DRAIN_REASON_SCALE_DOWN, DRAIN_REASON_UNHEALTHY, DRAIN_REASON_UPDATE,
};
use super::util::{
    classify, controller_ref, is_available, is_failed, is_nodeset_ref, is_pending, is_ready,
    is_terminating, nodeset_key, pod_key, pod_node_name, pod_revision, Ownership,
};
use super::{Context, API_TIMEOUT, SLURM_REQUEUE};
use super::{FAILED_NODESET_POD_REASON, FAILED_PLACEMENT_REASON, FAILED_VALIDATION_REASON, SELECTING_ALL_REASON};

impl Context {
    /// Run one reconcile pass for the given NodeSet.
    pub(super) async fn sync(&self, cached: &NodeSet) -> Result<()> {
        let key = nodeset_key(cached);
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), cached.namespace());

        // Re-fetch rather than trusting the cache: the previous pass may have
        // written status or metadata the trigger predates.
        let Some(nodeset) = timeout(API_TIMEOUT, api.get_opt(cached.name()))
            .await
            .context("timeout while fetching nodeset")??
        else {
            self.expectations.delete(&key);
            return Ok(());
        };

        if nodeset.meta().deletion_timestamp.is_some() {
            return match self.finalize(&api, &nodeset, &key).await {
                Err(err) if err.is_slurm_unavailable() => {
                    tracing::warn!(request = %key, error = %err, "slurm unavailable during finalization");
                    self.duration_store.push(&key, SLURM_REQUEUE);
                    Ok(())
                }
                other => other,
            };
        }

        match self.sync_nodeset(&api, &nodeset, &key).await {
            Err(err) if err.is_slurm_unavailable() => {
                tracing::warn!(request = %key, error = %err, "slurm cluster unavailable");
                self.mark_slurm_unavailable(&api, &nodeset, &err).await;
                self.duration_store.push(&key, SLURM_REQUEUE);
                Ok(())
            }
            other => other,
        }
    }

    async fn sync_nodeset(&self, api: &Api<NodeSet>, nodeset: &NodeSet, key: &str) -> Result<()> {
        // Gate on outstanding expectations: while creates or deletes from the
        // previous pass are unobserved, any listing we do is known stale.
        if !self.expectations.satisfied(key) {
            tracing::debug!(request = %key, "waiting on pending pod creates/deletes");
            return Ok(());
        }

        self.ensure_finalizer(api, nodeset).await?;

        if selector_is_empty(&nodeset.spec.selector) {
            self.record_event(
                nodeset,
                EventType::Warning,
                SELECTING_ALL_REASON,
                "This NodeSet is selecting all pods. A non-empty selector is required.".to_string(),
            )
            .await;
            return Ok(());
        }
        let template_labels = nodeset
            .spec
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default();
        if !selector_matches(&nodeset.spec.selector, &template_labels) {
            self.record_event(
                nodeset,
                EventType::Warning,
                FAILED_VALIDATION_REASON,
                "The NodeSet selector does not match its pod template labels.".to_string(),
            )
            .await;
            return Ok(());
        }

        // Snapshot the template into revision history.
        let realized = self.revisions.realize(nodeset).await?;

        // Adopt matching orphans, release pods that stopped matching.
        let all_pods = self.list_pods(nodeset.namespace()).await?;
        let owned = self.claim_pods(nodeset, &all_pods).await?;

        // Survey both sides of the pairing.
        let nodes = self.list_nodes().await?;
        let survey = survey_nodes(&nodes, nodeset);
        let slurm_nodes = self.slurm_control.list_nodes(nodeset).await?;
        self.remove_stranded_slurm_nodes(nodeset, &slurm_nodes, &nodes, key).await?;

        let current_hosts: HashSet<String> = owned
            .iter()
            .filter(|pod| pod_revision(pod) == Some(realized.current_hash()))
            .filter_map(|pod| pod_node_name(pod).map(str::to_string))
            .collect();
        let desired = compute_target_hosts(nodeset.spec.replicas, &survey, &current_hosts);

        // Apply deltas: delete, then create, then update. The order is what
        // keeps a single pass from over-provisioning.
        let (by_node, nodeless) = pods_by_node(&owned);
        let removals = pods_to_remove(&by_node, &nodeless, &desired, &survey.disqualified);
        for pod in &removals {
            self.drain_then_delete(nodeset, pod, DRAIN_REASON_SCALE_DOWN, key).await?;
        }
        let removal_keys: HashSet<String> = removals.iter().map(|pod| pod_key(pod)).collect();

        for host in &desired {
            let occupied = by_node
                .get(host.as_str())
                .is_some_and(|pods| pods.iter().any(|pod| !is_terminating(pod)));
            if occupied {
                continue;
            }
            if let Err(err) =
                self.pod_control.create_pod_on_node(nodeset, realized.update_hash(), host).await
            {
                // Exclude the node for the rest of this pass and surface the
                // failure per node; the requeue will retry placement.
                self.record_event(
                    nodeset,
                    EventType::Warning,
                    FAILED_PLACEMENT_REASON,
                    format!("Failed to place pod on node {host}: {err}"),
                )
                .await;
                self.duration_store.push(key, SLURM_REQUEUE);
            }
        }

        self.replace_unhealthy_pods(nodeset, &owned, &desired, &removal_keys, key).await?;

        if nodeset.spec.update_strategy.type_ == UpdateStrategyType::RollingUpdate {
            self.roll_pods(nodeset, &owned, &desired, &removal_keys, &realized, key).await?;
        }

        self.undrain_ready_pods(nodeset, &owned, &removal_keys, &slurm_nodes).await?;

        self.update_status(api, nodeset, &realized, &owned, desired.len(), key).await?;
        self.revisions.truncate_history(nodeset, &all_pods, &realized).await?;
        Ok(())
    }

    /// Cascade-drain and delete everything owned by a NodeSet pending
    /// deletion, then drop the finalizer once both sides are empty.
    async fn finalize(&self, api: &Api<NodeSet>, nodeset: &NodeSet, key: &str) -> Result<()> {
        let has_finalizer = nodeset
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == NODESET_FINALIZER));
        if !has_finalizer {
            self.expectations.delete(key);
            return Ok(());
        }

        let all_pods = self.list_pods(nodeset.namespace()).await?;
        let owned: Vec<&Pod> = all_pods
            .iter()
            .filter(|pod| classify(nodeset, pod) == Ownership::Owned)
            .collect();
        for pod in &owned {
            self.drain_then_delete(nodeset, pod, DRAIN_REASON_DELETION, key).await?;
        }

        if owned.is_empty() {
            self.remove_finalizer(api, nodeset).await?;
            self.expectations.delete(key);
            tracing::info!(request = %key, "nodeset finalized");
        } else {
            self.duration_store.push(key, SLURM_REQUEUE);
        }
        Ok(())
    }

    /// Delete a pod once its Slurm node has drained.
    ///
    /// Returns true when the pod was actually deleted this pass. When the
    /// node still holds allocations the drain is (idempotently) requested and
    /// the pass requeues instead.
    async fn drain_then_delete(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        reason: &str,
        key: &str,
    ) -> Result<bool> {
        if is_terminating(pod) {
            self.duration_store.push(key, SLURM_REQUEUE);
            return Ok(false);
        }
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        if self.expectations.is_deletion_expected(key, uid) {
            return Ok(false);
        }
        let Some(host) = pod_node_name(pod) else {
            // Never scheduled; nothing to drain.
            self.pod_control.delete_pod(nodeset, pod).await?;
            return Ok(true);
        };
        let info = PodInfo::new(nodeset.namespace(), pod.metadata.name.as_deref().unwrap_or_default());
        self.slurm_control.drain(nodeset, host, reason, &info).await?;
        if !self.slurm_control.is_drained(nodeset, host).await? {
            tracing::debug!(pod = ?pod.metadata.name, host = %host, "waiting for slurm node to drain");
            self.duration_store.push(key, SLURM_REQUEUE);
            return Ok(false);
        }
        self.pod_control.delete_pod(nodeset, pod).await?;
        self.slurm_control.delete_node(nodeset, host).await?;
        Ok(true)
    }

    /// Sort every pod in the namespace into owned / adopted / released.
    async fn claim_pods(&self, nodeset: &NodeSet, pods: &[Pod]) -> Result<Vec<Pod>> {
        let mut owned = Vec::new();
        for pod in pods {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            match classify(nodeset, pod) {
                Ownership::Owned => {
                    if selector_matches(&nodeset.spec.selector, &labels) {
                        owned.push(pod.clone());
                    } else {
                        self.pod_control.release(nodeset, pod).await?;
                    }
                }
                Ownership::Orphan => {
                    if selector_matches(&nodeset.spec.selector, &labels) && !is_terminating(pod) {
                        self.pod_control.adopt(nodeset, pod).await?;
                        owned.push(pod.clone());
                    }
                }
                Ownership::ForeignOwned => {
                    let stale = controller_ref(pod)
                        .is_some_and(|owner| is_nodeset_ref(owner) && owner.name == nodeset.name());
                    if stale {
                        // An owner reference with our name but a different
                        // UID should not exist; strip it so the pod can be
                        // adopted or garbage-collected.
                        tracing::error!(pod = ?pod.metadata.name, "owned pod carries a stale owner reference");
                        self.pod_control.release(nodeset, pod).await?;
                    }
                }
            }
        }
        Ok(owned)
    }

    /// Drain and delete Slurm registrations whose Kubernetes node is gone.
    ///
    /// Only registrations carrying this namespace's PodInfo breadcrumb are
    /// touched: a hybrid cluster's bare-metal nodes are not ours to manage.
    async fn remove_stranded_slurm_nodes(
        &self,
        nodeset: &NodeSet,
        slurm_nodes: &[SlurmNode],
        nodes: &[Node],
        key: &str,
    ) -> Result<()> {
        let kube_names: HashSet<&str> =
            nodes.iter().filter_map(|node| node.metadata.name.as_deref()).collect();
        for slurm_node in slurm_nodes {
            if kube_names.contains(slurm_node.name.as_str()) {
                continue;
            }
            let info = PodInfo::from_comment(slurm_node.comment.as_deref());
            if info.is_empty() || info.namespace != nodeset.namespace() {
                continue;
            }
            if slurm_node.has_jobs() {
                self.slurm_control
                    .drain(nodeset, &slurm_node.name, DRAIN_REASON_SCALE_DOWN, &info)
                    .await?;
                self.duration_store.push(key, SLURM_REQUEUE);
            } else {
                self.slurm_control.delete_node(nodeset, &slurm_node.name).await?;
            }
        }
        Ok(())
    }

    /// Replace pods which are `Failed`, or stuck in `Pending` past their
    /// backoff window. Each replacement advances the pod's backoff.
    async fn replace_unhealthy_pods(
        &self,
        nodeset: &NodeSet,
        owned: &[Pod],
        desired: &BTreeSet<String>,
        skip: &HashSet<String>,
        key: &str,
    ) -> Result<()> {
        for pod in owned {
            if skip.contains(&pod_key(pod)) || is_terminating(pod) {
                continue;
            }
            let on_desired_node =
                pod_node_name(pod).is_some_and(|node| desired.contains(node));
            if !on_desired_node {
                continue;
            }
            let failed = is_failed(pod);
            let pending = is_pending(pod);
            if !failed && !pending {
                continue;
            }
            if failed {
                self.record_event(
                    nodeset,
                    EventType::Warning,
                    FAILED_NODESET_POD_REASON,
                    format!("Pod {} failed and will be recreated", pod_key(pod)),
                )
                .await;
            }

            let backoff_key = pod_key(pod);
            if pending && !self.failed_pods_backoff.contains(&backoff_key) {
                // A pod that just started pending is normal; open its backoff
                // window and only replace it if it is still pending when the
                // window has passed.
                let window = self.failed_pods_backoff.next(&backoff_key);
                self.duration_store.push(key, window);
                continue;
            }
            if self.failed_pods_backoff.ready(&backoff_key) {
                if self.drain_then_delete(nodeset, pod, DRAIN_REASON_UNHEALTHY, key).await? {
                    self.failed_pods_backoff.next(&backoff_key);
                }
            } else {
                self.duration_store.push(key, self.failed_pods_backoff.remaining(&backoff_key));
            }
        }
        Ok(())
    }

    /// Drain-then-delete pods of outdated revisions, bounded by the
    /// `maxUnavailable` budget and exempting node ordinals below `partition`.
    async fn roll_pods(
        &self,
        nodeset: &NodeSet,
        owned: &[Pod],
        desired: &BTreeSet<String>,
        skip: &HashSet<String>,
        realized: &RealizedRevisions,
        key: &str,
    ) -> Result<()> {
        let partition = nodeset.spec.update_strategy.partition();
        let max_unavailable = nodeset.spec.update_strategy.max_unavailable();
        // Node ordinals follow sorted node-name order.
        let ordinals: HashMap<&str, i32> = desired
            .iter()
            .enumerate()
            .map(|(ordinal, host)| (host.as_str(), ordinal as i32))
            .collect();

        // Unavailability counts desired hosts lacking a ready pod, so a node
        // still waiting on its replacement holds the budget until the new
        // pod reports Ready. Pods failing readiness count the same way.
        let mut unavailable = desired
            .iter()
            .filter(|host| {
                !owned.iter().any(|pod| {
                    !skip.contains(&pod_key(pod))
                        && !is_terminating(pod)
                        && is_ready(pod)
                        && pod_node_name(pod) == Some(host.as_str())
                })
            })
            .count() as i32;

        let mut candidates: Vec<&Pod> = owned
            .iter()
            .filter(|pod| !skip.contains(&pod_key(pod)) && !is_terminating(pod))
            .filter(|pod| pod_revision(pod) != Some(realized.update_hash()))
            .filter(|pod| {
                pod_node_name(pod)
                    .and_then(|node| ordinals.get(node))
                    .is_some_and(|ordinal| *ordinal >= partition)
            })
            .collect();
        candidates.sort_by_key(|pod| pod_node_name(pod).unwrap_or_default().to_string());

        for pod in candidates {
            if unavailable >= max_unavailable {
                // Budget exhausted; pick the rollout back up once pods
                // become ready again.
                self.duration_store.push(key, SLURM_REQUEUE);
                break;
            }
            self.drain_then_delete(nodeset, pod, DRAIN_REASON_UPDATE, key).await?;
            // Initiating the disruption consumes budget even while the drain
            // is still pending, otherwise a pass could drain everything at
            // once and delete it all on the next tick.
            unavailable += 1;
        }
        Ok(())
    }

    /// Reopen job allocation for Ready pods whose Slurm peer is still
    /// draining (and not down).
    async fn undrain_ready_pods(
        &self,
        nodeset: &NodeSet,
        owned: &[Pod],
        skip: &HashSet<String>,
        slurm_nodes: &[SlurmNode],
    ) -> Result<()> {
        let by_host: HashMap<&str, &SlurmNode> =
            slurm_nodes.iter().map(|node| (node.name.as_str(), node)).collect();
        for pod in owned {
            if skip.contains(&pod_key(pod)) || is_terminating(pod) || !is_ready(pod) {
                continue;
            }
            let Some(host) = pod_node_name(pod) else {
                continue;
            };
            let Some(slurm_node) = by_host.get(host) else {
                continue;
            };
            if slurm_node.state.contains(&NodeState::Drain)
                && !slurm_node.state.contains(&NodeState::Down)
            {
                self.slurm_control.undrain(nodeset, host).await?;
            }
        }
        Ok(())
    }

    async fn ensure_finalizer(&self, api: &Api<NodeSet>, nodeset: &NodeSet) -> Result<()> {
        let mut finalizers = nodeset.meta().finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == NODESET_FINALIZER) {
            return Ok(());
        }
        finalizers.push(NODESET_FINALIZER.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        timeout(
            API_TIMEOUT,
            api.patch(nodeset.name(), &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while adding finalizer")??;
        Ok(())
    }

    async fn remove_finalizer(&self, api: &Api<NodeSet>, nodeset: &NodeSet) -> Result<()> {
        let finalizers: Vec<String> = nodeset
            .meta()
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != NODESET_FINALIZER)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        timeout(
            API_TIMEOUT,
            api.patch(nodeset.name(), &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while removing finalizer")??;
        Ok(())
    }

    /// Write observed state back to `status`, if anything changed.
    async fn update_status(
        &self,
        api: &Api<NodeSet>,
        nodeset: &NodeSet,
        realized: &RealizedRevisions,
        owned: &[Pod],
        desired: usize,
        key: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let min_ready_seconds = nodeset.spec.min_ready_seconds;
        let replicas = owned.len() as i32;
        let ready_replicas = owned.iter().filter(|pod| is_ready(pod)).count() as i32;
        let available_replicas = owned
            .iter()
            .filter(|pod| is_available(pod, min_ready_seconds, now))
            .count() as i32;
        let updated_replicas = owned
            .iter()
            .filter(|pod| pod_revision(pod) == Some(realized.update_hash()))
            .count() as i32;

        let mut status = nodeset.status.clone().unwrap_or_default();
        status.observed_generation = nodeset.metadata.generation;
        status.replicas = replicas;
        status.ready_replicas = ready_replicas;
        status.available_replicas = available_replicas;
        status.updated_replicas = updated_replicas;
        status.update_revision = realized.update.metadata.name.clone();
        // The rollout is complete once every owned pod runs the update
        // revision; current catches up to update at that point.
        status.current_revision = if updated_replicas == replicas {
            realized.update.metadata.name.clone()
        } else {
            realized.current.metadata.name.clone()
        };
        status.collision_count = Some(realized.collision_count);

        let generation = nodeset.metadata.generation;
        if available_replicas >= desired as i32 {
            upsert_condition(
                &mut status.conditions,
                CONDITION_AVAILABLE,
                true,
                "MinimumReplicasAvailable",
                format!("NodeSet has {available_replicas}/{desired} available replicas"),
                generation,
                now,
            );
        } else {
            upsert_condition(
                &mut status.conditions,
                CONDITION_AVAILABLE,
                false,
                "MinimumReplicasUnavailable",
                format!("NodeSet has {available_replicas}/{desired} available replicas"),
                generation,
                now,
            );
        }
        let (progressing_reason, progressing_note) = if updated_replicas == replicas {
            ("NodeSetUpdated", "All replicas run the update revision".to_string())
        } else {
            ("RollingUpdate", format!("{updated_replicas}/{replicas} replicas updated"))
        };
        upsert_condition(
            &mut status.conditions,
            CONDITION_PROGRESSING,
            true,
            progressing_reason,
            progressing_note,
            generation,
            now,
        );

        if nodeset.status.as_ref() != Some(&status) {
            let patch = serde_json::json!({ "status": status });
            timeout(
                API_TIMEOUT,
                api.patch_status(nodeset.name(), &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await
            .context("timeout while updating nodeset status")??;
        }

        // Pods that are ready but not yet available flip on their own once
        // minReadySeconds elapses; wake up for it.
        if ready_replicas > available_replicas && min_ready_seconds > 0 {
            self.duration_store
                .push(key, std::time::Duration::from_secs(min_ready_seconds as u64));
        }
        Ok(())
    }

    /// Record that the Slurm side is unreachable on the Progressing condition.
    async fn mark_slurm_unavailable(&self, api: &Api<NodeSet>, nodeset: &NodeSet, err: &Error) {
        let mut status = nodeset.status.clone().unwrap_or_default();
        upsert_condition(
            &mut status.conditions,
            CONDITION_PROGRESSING,
            false,
            REASON_SLURM_UNAVAILABLE,
            err.to_string(),
            nodeset.metadata.generation,
            Utc::now(),
        );
        if nodeset.status.as_ref() == Some(&status) {
            return;
        }
        let patch = serde_json::json!({ "status": status });
        let res = timeout(
            API_TIMEOUT,
            api.patch_status(nodeset.name(), &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await;
        match res {
            Ok(Ok(_)) => (),
            Ok(Err(err)) => tracing::debug!(error = ?err, "error recording slurm condition"),
            Err(_) => tracing::debug!("timeout recording slurm condition"),
        }
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = timeout(API_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context("timeout while listing pods")??;
        Ok(pods.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = timeout(API_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context("timeout while listing nodes")??;
        Ok(nodes.items)
    }
}

/// The partition of Kubernetes nodes for one NodeSet.
#[derive(Clone, Debug, Default)]
pub(super) struct NodeSurvey {
    /// Nodes a pod should be started on, sorted by name.
    pub must_run: Vec<String>,
    /// Nodes an existing pod may keep running on, sorted by name.
    pub may_continue: Vec<String>,
    /// Nodes whose pods must be drained away.
    pub disqualified: HashSet<String>,
}

/// Partition nodes into `{must_run, may_continue, disqualified}`.
pub(super) fn survey_nodes(nodes: &[Node], nodeset: &NodeSet) -> NodeSurvey {
    let mut survey = NodeSurvey::default();
    for node in nodes {
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        let verdict = node_should_run_pod(node, nodeset);
        if verdict.should_run {
            survey.must_run.push(name);
        } else if verdict.should_continue {
            survey.may_continue.push(name);
        } else {
            survey.disqualified.insert(name);
        }
    }
    survey.must_run.sort();
    survey.may_continue.sort();
    survey
}

/// Compute the set of hostnames which should carry a pod.
///
/// With no replica count, every must-run node gets one. With `replicas = R`,
/// the R-subset of eligible nodes is chosen deterministically by node name,
/// biased toward nodes already hosting a pod of the current revision.
pub(super) fn compute_target_hosts(
    replicas: Option<i32>,
    survey: &NodeSurvey,
    current_hosts: &HashSet<String>,
) -> BTreeSet<String> {
    match replicas {
        None => survey.must_run.iter().cloned().collect(),
        Some(count) => {
            let count = count.max(0) as usize;
            let mut candidates: Vec<&String> =
                survey.must_run.iter().chain(survey.may_continue.iter()).collect();
            candidates.sort_by_key(|name| (!current_hosts.contains(*name), (*name).clone()));
            candidates.into_iter().take(count).cloned().collect()
        }
    }
}

/// Group owned pods by the node they run on; pods with no node come back
/// separately.
pub(super) fn pods_by_node(owned: &[Pod]) -> (BTreeMap<&str, Vec<&Pod>>, Vec<&Pod>) {
    let mut by_node: BTreeMap<&str, Vec<&Pod>> = BTreeMap::new();
    let mut nodeless = Vec::new();
    for pod in owned {
        match pod_node_name(pod) {
            Some(node) => by_node.entry(node).or_default().push(pod),
            None => nodeless.push(pod),
        }
    }
    (by_node, nodeless)
}

/// The pods to remove this pass: everything on a non-desired node, plus
/// surplus duplicates on desired nodes. Pods on disqualified nodes are
/// ordered first so unhealthy placements drain before healthy ones.
pub(super) fn pods_to_remove<'a>(
    by_node: &BTreeMap<&'a str, Vec<&'a Pod>>,
    nodeless: &[&'a Pod],
    desired: &BTreeSet<String>,
    disqualified: &HashSet<String>,
) -> Vec<&'a Pod> {
    let mut from_disqualified = Vec::new();
    let mut from_healthy = Vec::new();
    for (node, pods) in by_node {
        if desired.contains(*node) {
            if pods.len() > 1 {
                // One pod per node: keep the preferred one, remove the rest.
                let mut pods = pods.clone();
                pods.sort_by(|a, b| duplicate_preference(a).cmp(&duplicate_preference(b)));
                from_healthy.extend(pods.into_iter().skip(1));
            }
        } else if disqualified.contains(*node) {
            from_disqualified.extend(pods.iter().copied());
        } else {
            from_healthy.extend(pods.iter().copied());
        }
    }
    from_healthy.extend(nodeless.iter().copied());
    from_disqualified.extend(from_healthy);
    from_disqualified
}

/// Duplicate resolution: prefer keeping ready pods, then older ones.
fn duplicate_preference(pod: &Pod) -> (bool, Option<chrono::DateTime<Utc>>, String) {
    (
        !is_ready(pod),
        pod.metadata.creation_timestamp.as_ref().map(|time| time.0),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

/// Insert or update a status condition, preserving the transition time when
/// the status itself is unchanged.
fn upsert_condition(
    conditions: &mut Vec<NodeSetCondition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    observed_generation: Option<i64>,
    now: chrono::DateTime<Utc>,
) {
    let status = if status { "True" } else { "False" };
    match conditions.iter_mut().find(|condition| condition.type_ == type_) {
        Some(condition) => {
            if condition.status != status {
                condition.last_transition_time = Time(now);
            }
            condition.status = status.to_string();
            condition.reason = reason.to_string();
            condition.message = message;
            condition.observed_generation = observed_generation;
        }
        None => conditions.push(NodeSetCondition {
            last_transition_time: Time(now),
            message,
            observed_generation,
            reason: reason.to_string(),
            status: status.to_string(),
            type_: type_.to_string(),
        }),
    }
}
