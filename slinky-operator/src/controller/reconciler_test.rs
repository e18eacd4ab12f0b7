use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::NodeSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use slinky_core::crd::NodeSet;
use slinky_core::NODESET_FINALIZER;

use crate::fixtures::{self, ApiState};
use crate::slurm::fake::FakeSlurmClient;
use crate::slurm::{ClusterKey, ClustersRegistry, NodeState};

use super::reconciler::{compute_target_hosts, pods_by_node, pods_to_remove, survey_nodes};
use super::revisions::hash_template;
use super::util::{classify, is_ready, nodeset_key, pod_key, pod_revision, Ownership};
use super::Context;

#[test]
fn test_survey_partitions_nodes() {
    let nodeset = fixtures::nodeset("workers", None);
    let schedulable = fixtures::k8s_node("node-1");
    let mut cordoned = fixtures::k8s_node("node-2");
    cordoned.spec = Some(NodeSpec { unschedulable: Some(true), ..Default::default() });
    let mut tainted = fixtures::k8s_node("node-3");
    tainted.spec = Some(NodeSpec {
        taints: Some(vec![k8s_openapi::api::core::v1::Taint {
            key: "maintenance".into(),
            effect: "NoExecute".into(),
            ..Default::default()
        }]),
        ..Default::default()
    });

    let survey = survey_nodes(&[schedulable, cordoned, tainted], &nodeset);
    assert_eq!(survey.must_run, vec!["node-1".to_string()]);
    assert_eq!(survey.may_continue, vec!["node-3".to_string()]);
    assert!(survey.disqualified.contains("node-2"));
}

#[test]
fn test_target_without_replicas_is_one_per_node() {
    let nodeset = fixtures::nodeset("workers", None);
    let nodes: Vec<_> = ["node-2", "node-1"].iter().map(|n| fixtures::k8s_node(n)).collect();
    let survey = survey_nodes(&nodes, &nodeset);
    let target = compute_target_hosts(None, &survey, &HashSet::new());
    assert_eq!(
        target,
        BTreeSet::from(["node-1".to_string(), "node-2".to_string()]),
    );
}

#[test]
fn test_target_subset_is_deterministic_by_node_name() {
    let nodeset = fixtures::nodeset("workers", Some(2));
    let nodes: Vec<_> = ["node-3", "node-1", "node-2"].iter().map(|n| fixtures::k8s_node(n)).collect();
    let survey = survey_nodes(&nodes, &nodeset);
    let target = compute_target_hosts(Some(2), &survey, &HashSet::new());
    assert_eq!(
        target,
        BTreeSet::from(["node-1".to_string(), "node-2".to_string()]),
    );
}

#[test]
fn test_target_subset_prefers_current_revision_hosts() {
    let nodeset = fixtures::nodeset("workers", Some(2));
    let nodes: Vec<_> = ["node-1", "node-2", "node-3"].iter().map(|n| fixtures::k8s_node(n)).collect();
    let survey = survey_nodes(&nodes, &nodeset);
    let current = HashSet::from(["node-3".to_string()]);
    let target = compute_target_hosts(Some(2), &survey, &current);
    assert_eq!(
        target,
        BTreeSet::from(["node-1".to_string(), "node-3".to_string()]),
        "nodes already hosting a current-revision pod win ties",
    );
}

#[test]
fn test_target_clamps_negative_replicas() {
    let nodeset = fixtures::nodeset("workers", Some(-3));
    let nodes = vec![fixtures::k8s_node("node-1")];
    let survey = survey_nodes(&nodes, &nodeset);
    assert!(compute_target_hosts(Some(-3), &survey, &HashSet::new()).is_empty());
}

#[test]
fn test_pods_to_remove_orders_disqualified_first() {
    let nodeset = fixtures::nodeset("workers", None);
    let on_good = fixtures::pod_on_node(&nodeset, "workers-aaaaa", "node-1", "rev1");
    let on_gone = fixtures::pod_on_node(&nodeset, "workers-bbbbb", "node-2", "rev1");
    let on_bad = fixtures::pod_on_node(&nodeset, "workers-ccccc", "node-3", "rev1");
    let owned = vec![on_good, on_gone, on_bad];

    let (by_node, nodeless) = pods_by_node(&owned);
    let desired = BTreeSet::from(["node-1".to_string()]);
    let disqualified = HashSet::from(["node-3".to_string()]);
    let removals = pods_to_remove(&by_node, &nodeless, &desired, &disqualified);

    let keys: Vec<String> = removals.iter().map(|pod| pod_key(pod)).collect();
    assert_eq!(keys, vec!["default/workers-ccccc".to_string(), "default/workers-bbbbb".to_string()]);
}

#[test]
fn test_duplicate_pods_on_one_node_are_reduced() {
    let nodeset = fixtures::nodeset("workers", None);
    let mut keeper = fixtures::pod_on_node(&nodeset, "workers-aaaaa", "node-1", "rev1");
    fixtures::make_ready(&mut keeper);
    keeper.metadata.creation_timestamp = Some(Time(chrono::Utc::now() - chrono::Duration::hours(1)));
    let mut extra = fixtures::pod_on_node(&nodeset, "workers-bbbbb", "node-1", "rev1");
    extra.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
    let owned = vec![keeper, extra];

    let (by_node, nodeless) = pods_by_node(&owned);
    let desired = BTreeSet::from(["node-1".to_string()]);
    let removals = pods_to_remove(&by_node, &nodeless, &desired, &HashSet::new());

    let keys: Vec<String> = removals.iter().map(|pod| pod_key(pod)).collect();
    assert_eq!(keys, vec!["default/workers-bbbbb".to_string()], "the ready, older pod is kept");
}

#[test]
fn test_nodeless_pods_are_removed() {
    let nodeset = fixtures::nodeset("workers", None);
    let mut pod = fixtures::pod_on_node(&nodeset, "workers-aaaaa", "node-1", "rev1");
    pod.spec.as_mut().unwrap().node_name = None;
    pod.metadata.annotations = None;
    let owned = vec![pod];

    let (by_node, nodeless) = pods_by_node(&owned);
    assert!(by_node.is_empty());
    let removals = pods_to_remove(&by_node, &nodeless, &BTreeSet::new(), &HashSet::new());
    assert_eq!(removals.len(), 1);
}

/// Wire a `Context` against the in-memory API server and a fake Slurm
/// cluster carrying one node (in the given states) per Kubernetes node.
fn reconcile_harness(
    nodeset: &NodeSet,
    nodes: &[&str],
    slurm_states: &[NodeState],
) -> (Arc<Context>, Arc<Mutex<ApiState>>, Arc<FakeSlurmClient>) {
    let state = Arc::new(Mutex::new(ApiState::default()));
    {
        let mut state = state.lock().unwrap();
        state
            .nodesets
            .insert(nodeset.metadata.name.clone().unwrap(), nodeset.clone());
        for node in nodes {
            state.nodes.insert(node.to_string(), fixtures::k8s_node(node));
        }
    }
    let slurm = FakeSlurmClient::with_nodes(
        nodes.iter().map(|node| fixtures::slurm_node(node, slurm_states)),
    );
    let clusters = ClustersRegistry::default();
    clusters.add(
        ClusterKey::new(fixtures::TEST_NAMESPACE, fixtures::TEST_CLUSTER),
        slurm.clone(),
    );
    let ctx = Arc::new(Context::new(fixtures::mock_client(state.clone()), clusters));
    (ctx, state, slurm)
}

#[tokio::test]
async fn test_create_pods_for_idle_slurm_nodes() {
    let nodeset = fixtures::nodeset("workers", None);
    let (ctx, state, _slurm) =
        reconcile_harness(&nodeset, &["node-1", "node-2"], &[NodeState::Idle]);

    ctx.sync(&nodeset).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.pods.len(), 2, "one pod per idle node");
    let mut hosts: Vec<String> = state
        .pods
        .values()
        .filter_map(|pod| pod.spec.as_ref().and_then(|spec| spec.node_name.clone()))
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["node-1".to_string(), "node-2".to_string()]);
    for pod in state.pods.values() {
        assert_eq!(classify(&nodeset, pod), Ownership::Owned);
    }

    let stored = state.nodesets.get("workers").unwrap();
    assert!(stored
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == NODESET_FINALIZER)));
    assert!(stored.status.as_ref().unwrap().update_revision.is_some());
    assert_eq!(state.revisions.len(), 1);
}

#[tokio::test]
async fn test_scale_down_drains_slurm_before_deleting_pods() {
    let nodeset = fixtures::nodeset("workers", None);
    let key = nodeset_key(&nodeset);
    let (ctx, state, slurm) =
        reconcile_harness(&nodeset, &["node-1", "node-2"], &[NodeState::Allocated]);

    ctx.sync(&nodeset).await.unwrap();
    assert_eq!(state.lock().unwrap().pods.len(), 2);

    // Scale to zero while jobs are still running.
    state.lock().unwrap().nodesets.get_mut("workers").unwrap().spec.replicas = Some(0);
    ctx.expectations.delete(&key);
    ctx.sync(&nodeset).await.unwrap();

    assert_eq!(
        state.lock().unwrap().pods.len(),
        2,
        "no pod may be deleted while its slurm node holds allocations",
    );
    for node in ["node-1", "node-2"] {
        let slurm_node = slurm.node(node).unwrap();
        assert!(slurm_node.state.contains(&NodeState::Drain), "{node} must be draining");
        assert!(slurm_node.state.contains(&NodeState::Allocated));
    }

    // Jobs finish; the next pass deletes pods and node registrations.
    slurm.set_states("node-1", &[NodeState::Idle, NodeState::Drain]);
    slurm.set_states("node-2", &[NodeState::Idle, NodeState::Drain]);
    ctx.expectations.delete(&key);
    ctx.sync(&nodeset).await.unwrap();

    assert!(state.lock().unwrap().pods.is_empty());
    assert!(slurm.node("node-1").is_none());
    assert!(slurm.node("node-2").is_none());
}

#[tokio::test]
async fn test_finalizer_removed_only_after_slurm_drains() {
    let mut nodeset = fixtures::nodeset("workers", None);
    nodeset.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    nodeset.metadata.finalizers = Some(vec![NODESET_FINALIZER.to_string()]);
    let key = nodeset_key(&nodeset);

    let (ctx, state, slurm) = reconcile_harness(&nodeset, &["node-1"], &[NodeState::Mixed]);
    {
        let mut state = state.lock().unwrap();
        let mut pod = fixtures::pod_on_node(&nodeset, "workers-aaaaa", "node-1", "rev1");
        fixtures::make_ready(&mut pod);
        state.pods.insert("workers-aaaaa".into(), pod);
    }

    // Jobs are running: the pod and the finalizer must both survive.
    ctx.sync(&nodeset).await.unwrap();
    {
        let state = state.lock().unwrap();
        assert_eq!(state.pods.len(), 1);
        let stored = state.nodesets.get("workers").unwrap();
        assert!(stored.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()));
    }
    assert!(slurm.node("node-1").unwrap().state.contains(&NodeState::Drain));

    // Jobs finish: the pod goes, then the finalizer on the following pass.
    slurm.set_states("node-1", &[NodeState::Idle, NodeState::Drain]);
    ctx.expectations.delete(&key);
    ctx.sync(&nodeset).await.unwrap();
    assert!(state.lock().unwrap().pods.is_empty());

    ctx.expectations.delete(&key);
    ctx.sync(&nodeset).await.unwrap();
    let state = state.lock().unwrap();
    let stored = state.nodesets.get("workers").unwrap();
    assert!(
        stored.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()),
        "finalizer must drop once both sides are empty",
    );
}

#[tokio::test]
async fn test_rolling_update_respects_max_unavailable() {
    let nodeset = fixtures::nodeset("workers", None);
    let key = nodeset_key(&nodeset);
    let hosts = ["node-1", "node-2", "node-3"];
    let (ctx, state, _slurm) = reconcile_harness(&nodeset, &hosts, &[NodeState::Idle]);
    {
        // Three ready pods from an outdated template revision.
        let mut state = state.lock().unwrap();
        for (index, host) in hosts.iter().enumerate() {
            let name = format!("workers-old{index}");
            let mut pod = fixtures::pod_on_node(&nodeset, &name, host, "oldhash0000");
            fixtures::make_ready(&mut pod);
            state.pods.insert(name, pod);
        }
    }
    let update_hash = hash_template(&nodeset.spec.template, 0);

    // Drive passes to completion; replacements become ready between passes.
    // maxUnavailable defaults to 1, so no observed instant may have more
    // than one node lacking a ready pod.
    let mut completed = false;
    for _ in 0..10 {
        ctx.expectations.delete(&key);
        ctx.sync(&nodeset).await.unwrap();

        let mut state = state.lock().unwrap();
        let not_ready = state.pods.values().filter(|pod| !is_ready(pod)).count();
        let missing = hosts.len() - state.pods.len();
        assert!(
            not_ready + missing <= 1,
            "at most one disrupted node at any observed instant",
        );

        for pod in state.pods.values_mut() {
            fixtures::make_ready(pod);
        }
        if state.pods.len() == hosts.len()
            && state
                .pods
                .values()
                .all(|pod| pod_revision(pod) == Some(update_hash.as_str()))
        {
            completed = true;
            break;
        }
    }
    assert!(completed, "every pod must end up on the update revision");
}
