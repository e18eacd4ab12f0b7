//! Observation routing.
//!
//! Normalizes every pod, Kubernetes node, and Slurm node observation into a
//! reconcile request for the owning NodeSet. The three routers are plain
//! streams of object references which the controller consumes as reconcile
//! triggers; each keeps a small previous-state cache so updates can be
//! compared against what was last seen, the way client-go handlers receive
//! old/new pairs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, Stream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use slinky_core::crd::{NodeSet, RequiredMetadata};
use slinky_core::labels::{selector_is_empty, selector_matches};
use slinky_core::podinfo::PodInfo;

use super::expectations::Expectations;
use super::node_matcher::node_should_run_pod;
use super::util::{controller_ref, is_nodeset_ref, is_terminating};

/// What the pod router remembers about each pod between observations.
#[derive(Clone, Debug)]
pub(super) struct PodObservation {
    resource_version: Option<String>,
    labels: BTreeMap<String, String>,
    controller: Option<OwnerReference>,
    terminating: bool,
}

impl PodObservation {
    fn of(pod: &Pod) -> Self {
        Self {
            resource_version: pod.metadata.resource_version.clone(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            controller: controller_ref(pod).cloned(),
            terminating: is_terminating(pod),
        }
    }
}

/// Reconcile triggers derived from pod observations.
///
/// Owned pods enqueue their controller; orphans enqueue every NodeSet whose
/// selector matches. Resync updates whose resource version is unchanged are
/// suppressed, and expectations are observed here: a watched create or delete
/// is what releases the reconcile gate.
pub fn pod_trigger(
    client: Client,
    nodesets: Store<NodeSet>,
    expectations: Arc<Expectations>,
) -> impl Stream<Item = ObjectRef<NodeSet>> + Send + 'static {
    let api: Api<Pod> = Api::all(client);
    let mut cache: HashMap<String, PodObservation> = HashMap::new();

    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|res| {
            futures::future::ready(match res {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::error!(error = ?err, "error from pod watch stream");
                    None
                }
            })
        })
        .map(move |event| route_pod_event(event, &mut cache, &nodesets, &expectations))
        .flat_map(stream::iter)
}

pub(super) fn route_pod_event(
    event: Event<Pod>,
    cache: &mut HashMap<String, PodObservation>,
    nodesets: &Store<NodeSet>,
    expectations: &Expectations,
) -> Vec<ObjectRef<NodeSet>> {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) => {
            let Some(uid) = pod.metadata.uid.clone() else {
                return Vec::new();
            };
            let observation = PodObservation::of(&pod);
            let previous = cache.insert(uid, observation.clone());
            match previous {
                None => pod_added(&pod, &observation, nodesets, expectations),
                Some(previous) => pod_updated(&pod, &previous, &observation, nodesets),
            }
        }
        Event::Delete(pod) => {
            if let Some(uid) = pod.metadata.uid.as_deref() {
                cache.remove(uid);
                if let Some(owner) = resolve_controller_ref(nodesets, &pod, controller_ref(&pod)) {
                    expectations.deletion_observed(&store_key(&owner), uid);
                    tracing::debug!(pod = ?pod.metadata.name, "nodeset pod deleted");
                    return vec![owner];
                }
            }
            Vec::new()
        }
        Event::Init | Event::InitDone => Vec::new(),
    }
}

fn pod_added(
    pod: &Pod,
    observation: &PodObservation,
    nodesets: &Store<NodeSet>,
    expectations: &Expectations,
) -> Vec<ObjectRef<NodeSet>> {
    if observation.terminating {
        // On controller restart a pod can show up already pending deletion.
        // Never count it as a creation observation.
        return resolve_controller_ref(nodesets, pod, observation.controller.as_ref())
            .into_iter()
            .collect();
    }
    if let Some(owner) = resolve_controller_ref(nodesets, pod, observation.controller.as_ref()) {
        expectations.creation_observed(&store_key(&owner));
        tracing::debug!(pod = ?pod.metadata.name, "nodeset pod added");
        return vec![owner];
    }
    // An orphan: wake every NodeSet whose selector matches so one of them can
    // adopt it. No controller is waiting for an orphan's creation.
    matching_nodesets(nodesets, pod)
}

fn pod_updated(
    pod: &Pod,
    previous: &PodObservation,
    current: &PodObservation,
    nodesets: &Store<NodeSet>,
) -> Vec<ObjectRef<NodeSet>> {
    if previous.resource_version == current.resource_version {
        // Periodic resyncs replay every known pod; two versions of the same
        // pod always differ in resource version.
        return Vec::new();
    }

    let mut requests = Vec::new();
    let controller_changed = previous.controller != current.controller;
    if controller_changed {
        if let Some(owner) =
            resolve_controller_ref(nodesets, pod, previous.controller.as_ref())
        {
            requests.push(owner);
        }
    }

    if current.terminating {
        // A graceful delete surfaces first as a deletion-timestamp update;
        // the owner should start replacing the pod now rather than when the
        // kubelet finishes tearing it down.
        requests.extend(resolve_controller_ref(nodesets, pod, current.controller.as_ref()));
        return requests;
    }

    if let Some(owner) = resolve_controller_ref(nodesets, pod, current.controller.as_ref()) {
        requests.push(owner);
        return requests;
    }

    // An orphan: if anything adoption-relevant changed, wake the matchers.
    if controller_changed || previous.labels != current.labels {
        requests.extend(matching_nodesets(nodesets, pod));
    }
    requests
}

/// Resolve a pod's controller reference to its owning NodeSet.
///
/// Returns `None` when the reference points at another kind, an unknown
/// NodeSet, or a NodeSet whose UID no longer matches the reference.
pub(super) fn resolve_controller_ref(
    nodesets: &Store<NodeSet>,
    pod: &Pod,
    owner: Option<&OwnerReference>,
) -> Option<ObjectRef<NodeSet>> {
    let owner = owner?;
    if !is_nodeset_ref(owner) {
        return None;
    }
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let reference = ObjectRef::new(&owner.name).within(namespace);
    let nodeset = nodesets.get(&reference)?;
    if nodeset.meta().uid.as_deref() != Some(owner.uid.as_str()) {
        // The NodeSet carrying this name is not the one the reference
        // points to.
        return None;
    }
    Some(reference)
}

/// All NodeSets in the pod's namespace whose selector matches its labels.
fn matching_nodesets(nodesets: &Store<NodeSet>, pod: &Pod) -> Vec<ObjectRef<NodeSet>> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let matched: Vec<ObjectRef<NodeSet>> = nodesets
        .state()
        .into_iter()
        .filter(|nodeset| nodeset.namespace() == namespace)
        .filter(|nodeset| {
            !selector_is_empty(&nodeset.spec.selector)
                && selector_matches(&nodeset.spec.selector, &labels)
        })
        .map(|nodeset| ObjectRef::new(nodeset.name()).within(namespace))
        .collect();
    if matched.len() > 1 {
        // Controller references keep this from doing anything destructive,
        // but overlapping selectors are user error worth surfacing.
        tracing::info!(pod = ?pod.metadata.name, "more than one NodeSet is selecting pod");
    }
    matched
}

/// Reconcile triggers derived from Kubernetes node observations.
///
/// A new node wakes every NodeSet that should run a pod on it; an updated
/// node wakes only the NodeSets whose `(should_run, should_continue)`
/// verdict changed. Node deletions are ignored, the pod deletion path covers
/// them.
pub fn node_trigger(
    client: Client,
    nodesets: Store<NodeSet>,
) -> impl Stream<Item = ObjectRef<NodeSet>> + Send + 'static {
    let api: Api<Node> = Api::all(client);
    let mut cache: HashMap<String, Node> = HashMap::new();

    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|res| {
            futures::future::ready(match res {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::error!(error = ?err, "error from node watch stream");
                    None
                }
            })
        })
        .map(move |event| route_node_event(event, &mut cache, &nodesets))
        .flat_map(stream::iter)
}

pub(super) fn route_node_event(
    event: Event<Node>,
    cache: &mut HashMap<String, Node>,
    nodesets: &Store<NodeSet>,
) -> Vec<ObjectRef<NodeSet>> {
    match event {
        Event::Apply(node) | Event::InitApply(node) => {
            let Some(name) = node.metadata.name.clone() else {
                return Vec::new();
            };
            let previous = cache.insert(name, node.clone());
            match previous {
                None => nodesets
                    .state()
                    .into_iter()
                    .filter(|nodeset| node_should_run_pod(&node, nodeset).should_run)
                    .map(|nodeset| ObjectRef::new(nodeset.name()).within(nodeset.namespace()))
                    .collect(),
                Some(previous) => {
                    if should_ignore_node_update(&previous, &node) {
                        return Vec::new();
                    }
                    nodesets
                        .state()
                        .into_iter()
                        .filter(|nodeset| {
                            node_should_run_pod(&previous, nodeset)
                                != node_should_run_pod(&node, nodeset)
                        })
                        .map(|nodeset| {
                            tracing::debug!(
                                node = ?node.metadata.name,
                                nodeset = %nodeset.name(),
                                "node update triggers nodeset reconcile",
                            );
                            ObjectRef::new(nodeset.name()).within(nodeset.namespace())
                        })
                        .collect()
                }
            }
        }
        Event::Delete(node) => {
            if let Some(name) = node.metadata.name.as_deref() {
                cache.remove(name);
            }
            Vec::new()
        }
        Event::Init | Event::InitDone => Vec::new(),
    }
}

/// True when a node update is pure resync noise: identical conditions and no
/// other semantic change.
pub(super) fn should_ignore_node_update(previous: &Node, current: &Node) -> bool {
    if !node_conditions_equal(previous, current) {
        return false;
    }
    let mut normalized = previous.clone();
    normalized.metadata.resource_version = current.metadata.resource_version.clone();
    normalized.metadata.managed_fields = current.metadata.managed_fields.clone();
    if let (Some(normalized_status), Some(current_status)) =
        (normalized.status.as_mut(), current.status.as_ref())
    {
        normalized_status.conditions = current_status.conditions.clone();
    }
    normalized == *current
}

fn node_conditions_equal(previous: &Node, current: &Node) -> bool {
    let conditions = |node: &Node| -> Vec<(String, String)> {
        let mut pairs: Vec<_> = node
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
            .iter()
            .map(|condition| (condition.type_.clone(), condition.status.clone()))
            .collect();
        pairs.sort();
        pairs
    };
    conditions(previous) == conditions(current)
}

/// Reconcile triggers derived from the Slurm node event channel.
///
/// Each event carries the PodInfo breadcrumb of the affected node; it is
/// resolved to the owning NodeSet through the pod it names. Events with an
/// empty or unparseable PodInfo are skipped, not fanned out.
pub fn slurm_trigger(
    client: Client,
    events: mpsc::Receiver<PodInfo>,
) -> impl Stream<Item = ObjectRef<NodeSet>> + Send + 'static {
    ReceiverStream::new(events)
        .filter(|info| futures::future::ready(!info.is_empty()))
        .then(move |info| {
            let client = client.clone();
            async move {
                let api: Api<Pod> = Api::namespaced(client, &info.namespace);
                let pod = match api.get_opt(&info.pod_name).await {
                    Ok(Some(pod)) => pod,
                    Ok(None) => return None,
                    Err(err) => {
                        tracing::debug!(error = ?err, pod = %info, "error resolving slurm event pod");
                        return None;
                    }
                };
                let owner = controller_ref(&pod)?;
                if !is_nodeset_ref(owner) {
                    return None;
                }
                Some(ObjectRef::new(&owner.name).within(&info.namespace))
            }
        })
        .filter_map(futures::future::ready)
}

fn store_key(reference: &ObjectRef<NodeSet>) -> String {
    format!("{}/{}", reference.namespace.as_deref().unwrap_or_default(), reference.name)
}
