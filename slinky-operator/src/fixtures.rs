//! Shared test fixtures, including an in-memory Kubernetes API server for
//! driving full reconcile passes against a mocked client.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta, OwnerReference, Time,
};
use kube::client::Body;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tower_test::mock;

use slinky_core::crd::{NodeSet, NodeSetSpec, NodeSetUpdateStrategy};
use slinky_core::{ANNOTATION_HOSTNAME, API_VERSION, LABEL_REVISION_HASH};

use crate::slurm::{NodeState, SlurmNode};

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_CLUSTER: &str = "test-cluster";

/// The selector/template labels every test NodeSet uses.
pub fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("foo".to_string(), "bar".to_string())])
}

/// A NodeSet with a matching selector/template pair and a fixed UID.
pub fn nodeset(name: &str, replicas: Option<i32>) -> NodeSet {
    let mut nodeset = NodeSet::new(
        name,
        NodeSetSpec {
            cluster_name: TEST_CLUSTER.into(),
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "worker".into(),
                        image: Some("image-foo".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            update_strategy: NodeSetUpdateStrategy::default(),
            revision_history_limit: 10,
            min_ready_seconds: 0,
        },
    );
    nodeset.metadata.namespace = Some(TEST_NAMESPACE.into());
    nodeset.metadata.uid = Some(format!("uid-{name}"));
    nodeset
}

/// The controller owner reference of the given NodeSet.
pub fn owner_ref(nodeset: &NodeSet) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.into(),
        kind: "NodeSet".into(),
        name: nodeset.metadata.name.clone().unwrap_or_default(),
        uid: nodeset.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// An owned pod pinned to the given node, stamped with a revision hash.
pub fn pod_on_node(nodeset: &NodeSet, pod_name: &str, node: &str, revision: &str) -> Pod {
    let mut pod_labels = selector_labels();
    pod_labels.insert(LABEL_REVISION_HASH.into(), revision.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.into()),
            namespace: nodeset.metadata.namespace.clone(),
            uid: Some(format!("uid-{pod_name}")),
            labels: Some(pod_labels),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_HOSTNAME.to_string(),
                node.to_string(),
            )])),
            owner_references: Some(vec![owner_ref(nodeset)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.into()),
            containers: vec![],
            ..Default::default()
        }),
        status: None,
    }
}

/// Mark a pod Running with a Ready condition.
pub fn make_ready(pod: &mut Pod) {
    pod.status = Some(PodStatus {
        phase: Some("Running".into()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "True".into(),
            last_transition_time: Some(Time(Utc::now())),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

/// A schedulable Kubernetes node with generous allocatable resources.
pub fn k8s_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("8".into())),
                ("memory".to_string(), Quantity("32Gi".into())),
            ])),
            ..Default::default()
        }),
    }
}

/// A Slurm node carrying the given state set.
pub fn slurm_node(name: &str, states: &[NodeState]) -> SlurmNode {
    SlurmNode {
        name: name.into(),
        state: states.iter().copied().collect(),
        comment: None,
        reason: None,
    }
}

/// The objects served by the mock API server, keyed by name.
#[derive(Default)]
pub struct ApiState {
    pub nodesets: HashMap<String, NodeSet>,
    pub pods: HashMap<String, Pod>,
    pub revisions: HashMap<String, ControllerRevision>,
    pub nodes: HashMap<String, Node>,
    counter: u64,
}

/// A kube client backed by an in-memory API server over `state`.
///
/// Serves just enough of the API surface for reconcile passes: typed
/// get/list/create/delete, JSON merge patches (including the status
/// subresource), proper 404 Status bodies, and an event sink. State survives
/// across calls so successive passes observe each other's writes.
pub fn mock_client(state: Arc<Mutex<ApiState>>) -> Client {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let response = serve(&state, request).await;
            send.send_response(response);
        }
    });
    Client::new(service, TEST_NAMESPACE)
}

async fn serve(state: &Mutex<ApiState>, request: Request<Body>) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let bytes = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return not_found("unreadable request body"),
    };
    let mut state = state.lock().expect("api state lock poisoned");

    // Event records are published fire-and-forget; accept and echo them.
    if method == Method::POST && path.contains("/events") {
        let echo = serde_json::from_slice::<serde_json::Value>(&bytes).unwrap_or_else(|_| json!({}));
        return json_response(StatusCode::CREATED, &echo);
    }
    if method == Method::GET && path == "/api/v1/nodes" {
        return list_response(state.nodes.values());
    }

    let nodesets_root =
        format!("/apis/slinky.slurm.net/v1alpha1/namespaces/{TEST_NAMESPACE}/nodesets");
    if let Some(rest) = strip_resource(&path, &nodesets_root) {
        return match (method.as_str(), rest.as_slice()) {
            ("GET", [name]) => get_json(state.nodesets.get(*name)),
            ("PATCH", [name]) | ("PATCH", [name, "status"]) => {
                match state.nodesets.get_mut(*name) {
                    Some(nodeset) => {
                        merge_into(nodeset, &bytes);
                        json_response(StatusCode::OK, nodeset)
                    }
                    None => not_found("nodeset not found"),
                }
            }
            _ => not_found("unhandled nodeset request"),
        };
    }

    let pods_root = format!("/api/v1/namespaces/{TEST_NAMESPACE}/pods");
    if let Some(rest) = strip_resource(&path, &pods_root) {
        return match (method.as_str(), rest.as_slice()) {
            ("GET", []) => list_response(state.pods.values()),
            ("POST", []) => {
                let Ok(mut pod) = serde_json::from_slice::<Pod>(&bytes) else {
                    return not_found("malformed pod body");
                };
                state.counter += 1;
                let counter = state.counter;
                pod.metadata.uid.get_or_insert_with(|| format!("uid-{counter}"));
                pod.metadata.resource_version = Some(counter.to_string());
                let name = pod.metadata.name.clone().unwrap_or_default();
                let response = json_response(StatusCode::CREATED, &pod);
                state.pods.insert(name, pod);
                response
            }
            ("GET", [name]) => get_json(state.pods.get(*name)),
            ("DELETE", [name]) => match state.pods.remove(*name) {
                Some(pod) => json_response(StatusCode::OK, &pod),
                None => not_found("pod not found"),
            },
            ("PATCH", [name]) => match state.pods.get_mut(*name) {
                Some(pod) => {
                    merge_into(pod, &bytes);
                    json_response(StatusCode::OK, pod)
                }
                None => not_found("pod not found"),
            },
            _ => not_found("unhandled pod request"),
        };
    }

    let revisions_root = format!("/apis/apps/v1/namespaces/{TEST_NAMESPACE}/controllerrevisions");
    if let Some(rest) = strip_resource(&path, &revisions_root) {
        return match (method.as_str(), rest.as_slice()) {
            ("GET", []) => list_response(state.revisions.values()),
            ("POST", []) => {
                let Ok(mut revision) = serde_json::from_slice::<ControllerRevision>(&bytes) else {
                    return not_found("malformed revision body");
                };
                state.counter += 1;
                let counter = state.counter;
                revision.metadata.uid.get_or_insert_with(|| format!("uid-{counter}"));
                revision.metadata.resource_version = Some(counter.to_string());
                let name = revision.metadata.name.clone().unwrap_or_default();
                let response = json_response(StatusCode::CREATED, &revision);
                state.revisions.insert(name, revision);
                response
            }
            ("GET", [name]) => get_json(state.revisions.get(*name)),
            ("DELETE", [name]) => match state.revisions.remove(*name) {
                Some(revision) => json_response(StatusCode::OK, &revision),
                None => not_found("revision not found"),
            },
            _ => not_found("unhandled revision request"),
        };
    }

    // No test seeds PVCs; the claim path treats 404 as nothing-to-do.
    not_found("unhandled request")
}

fn strip_resource<'a>(path: &'a str, root: &str) -> Option<Vec<&'a str>> {
    let rest = path.strip_prefix(root)?;
    Some(rest.split('/').filter(|part| !part.is_empty()).collect())
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("serialize response")))
        .expect("build response")
}

fn list_response<'a, T: Serialize + 'a>(items: impl Iterator<Item = &'a T>) -> Response<Body> {
    let items: Vec<&T> = items.collect();
    json_response(
        StatusCode::OK,
        &json!({ "metadata": { "resourceVersion": "0" }, "items": items }),
    )
}

fn get_json<T: Serialize>(obj: Option<&T>) -> Response<Body> {
    match obj {
        Some(obj) => json_response(StatusCode::OK, obj),
        None => not_found("object not found"),
    }
}

fn not_found(message: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": "NotFound",
            "code": 404,
        }),
    )
}

/// Apply an RFC 7386 JSON merge patch to a typed object.
fn merge_into<T: Serialize + DeserializeOwned>(obj: &mut T, patch: &[u8]) {
    let Ok(patch) = serde_json::from_slice::<serde_json::Value>(patch) else {
        return;
    };
    let mut value = serde_json::to_value(&*obj).expect("serialize object");
    json_merge(&mut value, &patch);
    if let Ok(updated) = serde_json::from_value(value) {
        *obj = updated;
    }
}

fn json_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            let map = target.as_object_mut().expect("object target");
            for (key, value) in entries {
                if value.is_null() {
                    map.remove(key);
                } else {
                    json_merge(map.entry(key.clone()).or_insert(serde_json::Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}
