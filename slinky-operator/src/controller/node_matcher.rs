//! Node-to-NodeSet matching.
//!
//! Given a NodeSet and a Kubernetes node, computes whether a worker pod
//! should be started on the node and whether an existing pod may keep
//! running there. The two differ only in which taint effects are enforced:
//! a `NoExecute` taint blocks new placement but does not immediately evict
//! a running pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Node, NodeSelectorRequirement, NodeSelectorTerm, PodSpec, Taint, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use slinky_core::crd::NodeSet;

const EFFECT_NO_SCHEDULE: &str = "NoSchedule";
const EFFECT_NO_EXECUTE: &str = "NoExecute";

/// The verdict for one `(node, nodeset)` pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeMatch {
    /// A pod should be started on this node.
    pub should_run: bool,
    /// An existing pod may keep running on this node.
    pub should_continue: bool,
}

/// Compute `(should_run, should_continue)` for the given node.
pub fn node_should_run_pod(node: &Node, nodeset: &NodeSet) -> NodeMatch {
    let Some(pod_spec) = nodeset.spec.template.spec.as_ref() else {
        return NodeMatch::default();
    };

    let schedulable = !node.spec.as_ref().and_then(|spec| spec.unschedulable).unwrap_or(false);
    let empty = BTreeMap::new();
    let node_labels = node.metadata.labels.as_ref().unwrap_or(&empty);

    let base = schedulable
        && matches_node_selector(pod_spec, node_labels)
        && matches_node_affinity(pod_spec, node, node_labels)
        && fits_allocatable(pod_spec, node);
    if !base {
        return NodeMatch::default();
    }

    let taints = node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default();
    let tolerations = pod_spec.tolerations.as_deref().unwrap_or_default();

    let tolerates = |enforce_no_execute: bool| {
        taints.iter().all(|taint| {
            let enforced = taint.effect == EFFECT_NO_SCHEDULE
                || (enforce_no_execute && taint.effect == EFFECT_NO_EXECUTE);
            !enforced || tolerations.iter().any(|t| tolerates_taint(t, taint))
        })
    };

    NodeMatch {
        should_run: tolerates(true),
        should_continue: tolerates(false),
    }
}

/// The pod's nodeSelector terms must all be present on the node.
fn matches_node_selector(pod_spec: &PodSpec, node_labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = pod_spec.node_selector.as_ref() else {
        return true;
    };
    selector.iter().all(|(key, value)| node_labels.get(key) == Some(value))
}

/// Required node affinity terms are ORed; the requirements within one term
/// are ANDed, exactly as the scheduler evaluates them.
fn matches_node_affinity(
    pod_spec: &PodSpec,
    node: &Node,
    node_labels: &BTreeMap<String, String>,
) -> bool {
    let required = pod_spec
        .affinity
        .as_ref()
        .and_then(|affinity| affinity.node_affinity.as_ref())
        .and_then(|node_affinity| {
            node_affinity.required_during_scheduling_ignored_during_execution.as_ref()
        });
    let Some(selector) = required else {
        return true;
    };
    if selector.node_selector_terms.is_empty() {
        return true;
    }
    selector
        .node_selector_terms
        .iter()
        .any(|term| matches_selector_term(term, node, node_labels))
}

fn matches_selector_term(
    term: &NodeSelectorTerm,
    node: &Node,
    node_labels: &BTreeMap<String, String>,
) -> bool {
    let expressions_ok = term
        .match_expressions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .all(|req| matches_requirement(req, node_labels.get(&req.key).map(String::as_str)));
    let node_name = node.metadata.name.as_deref();
    let fields_ok = term.match_fields.as_deref().unwrap_or_default().iter().all(|req| {
        // The only supported field selector is metadata.name.
        let value = (req.key == "metadata.name").then_some(node_name).flatten();
        matches_requirement(req, value)
    });
    expressions_ok && fields_ok
}

fn matches_requirement(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|want| want == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|want| want == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" => compare_numeric(value, values, |actual, bound| actual > bound),
        "Lt" => compare_numeric(value, values, |actual, bound| actual < bound),
        _ => false,
    }
}

fn compare_numeric(value: Option<&str>, values: &[String], cmp: fn(i64, i64) -> bool) -> bool {
    let (Some(actual), Some(bound)) = (value, values.first()) else {
        return false;
    };
    match (actual.parse::<i64>(), bound.parse::<i64>()) {
        (Ok(actual), Ok(bound)) => cmp(actual, bound),
        _ => false,
    }
}

/// Standard taint-toleration matching: an empty key with `Exists` tolerates
/// everything, an empty effect matches all effects.
fn tolerates_taint(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    let operator = toleration.operator.as_deref().unwrap_or("Equal");
    if key.is_empty() {
        return operator == "Exists";
    }
    if key != taint.key {
        return false;
    }
    match operator {
        "Exists" => true,
        "Equal" => toleration.value.as_deref().unwrap_or_default()
            == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}

/// The sum of the template's container requests must fit within the node's
/// allocatable cpu and memory.
fn fits_allocatable(pod_spec: &PodSpec, node: &Node) -> bool {
    let Some(allocatable) = node.status.as_ref().and_then(|status| status.allocatable.as_ref())
    else {
        // Nodes which have not reported capacity yet are given the benefit of
        // the doubt; kubelet will reject the pod if it truly does not fit.
        return true;
    };

    let mut cpu_request = 0.0;
    let mut memory_request = 0.0;
    for container in &pod_spec.containers {
        let Some(requests) =
            container.resources.as_ref().and_then(|resources| resources.requests.as_ref())
        else {
            continue;
        };
        cpu_request += requests.get("cpu").map(parse_quantity).unwrap_or(0.0);
        memory_request += requests.get("memory").map(parse_quantity).unwrap_or(0.0);
    }

    let cpu_allocatable = allocatable.get("cpu").map(parse_quantity).unwrap_or(f64::MAX);
    let memory_allocatable = allocatable.get("memory").map(parse_quantity).unwrap_or(f64::MAX);
    cpu_request <= cpu_allocatable && memory_request <= memory_allocatable
}

/// Parse a Kubernetes resource quantity into a plain number.
///
/// Handles the decimal (`k`, `M`, `G`, ...), binary (`Ki`, `Mi`, `Gi`, ...),
/// and milli (`m`) suffix families. Unparseable quantities evaluate to zero.
pub fn parse_quantity(quantity: &Quantity) -> f64 {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return 0.0;
    }
    let split = raw.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+');
    let (number, suffix) = match split {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let Ok(value) = number.parse::<f64>() else {
        return 0.0;
    };
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0f64.powi(2),
        "Gi" => 1024.0f64.powi(3),
        "Ti" => 1024.0f64.powi(4),
        "Pi" => 1024.0f64.powi(5),
        "Ei" => 1024.0f64.powi(6),
        _ => return 0.0,
    };
    value * multiplier
}
