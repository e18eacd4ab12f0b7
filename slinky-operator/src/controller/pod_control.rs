//! Pod lifecycle operations.
//!
//! All pod mutations issued by the reconciler flow through here so that
//! expectations bookkeeping, Kubernetes event recording, and owner-reference
//! handling stay in one place. Expectations are raised optimistically before
//! each API call and compensated when the call fails.

use std::sync::Arc;

use anyhow::Context as AnyhowContext;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, Preconditions, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use rand::Rng;
use tokio::time::timeout;

use slinky_core::crd::{NodeSet, RequiredMetadata};
use slinky_core::error::{Error, Result};
use slinky_core::podinfo::PodInfo;
use slinky_core::{ANNOTATION_HOSTNAME, ANNOTATION_POD_INFO, ANNOTATION_REVISION, LABEL_REVISION_HASH};

use super::expectations::Expectations;
use super::util::{is_nodeset_ref, nodeset_key, nodeset_owner_ref};
use super::API_TIMEOUT;

/// Characters used in generated pod-name suffixes. Mirrors the alphabet the
/// Kubernetes name generator uses: no vowels (avoids accidental words) and no
/// ambiguous digits.
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SUFFIX_LENGTH: usize = 5;

/// Creates, patches, and deletes the pods owned by NodeSets.
pub struct PodControl {
    client: Client,
    reporter: Reporter,
    expectations: Arc<Expectations>,
}

impl PodControl {
    /// Create a new instance.
    pub fn new(client: Client, reporter: Reporter, expectations: Arc<Expectations>) -> Self {
        Self { client, reporter, expectations }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn recorder(&self, nodeset: &NodeSet) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), nodeset.object_ref(&()))
    }

    async fn record(&self, nodeset: &NodeSet, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder(nodeset).publish(event).await {
            tracing::debug!(error = ?err, "error publishing event");
        }
    }

    /// Create a pod from the NodeSet's template, pinned to the given node and
    /// stamped with the hostname, revision, and PodInfo annotations.
    #[tracing::instrument(level = "debug", skip(self, nodeset, revision_hash))]
    pub async fn create_pod_on_node(
        &self,
        nodeset: &NodeSet,
        revision_hash: &str,
        node_name: &str,
    ) -> Result<Pod> {
        let pod = build_pod(nodeset, revision_hash, node_name);
        let key = nodeset_key(nodeset);
        self.expectations.expect_creations(&key, 1);

        let created = timeout(
            API_TIMEOUT,
            self.pods(nodeset.namespace()).create(&PostParams::default(), &pod),
        )
        .await
        .context("timeout while creating pod")
        .map_err(Error::from)
        .and_then(|res| res.map_err(Error::from));

        match created {
            Ok(created) => {
                let name = created.metadata.name.as_deref().unwrap_or_default();
                self.record(
                    nodeset,
                    EventType::Normal,
                    super::SUCCESSFUL_CREATE_REASON,
                    format!("Created pod {name} on node {node_name}"),
                )
                .await;
                if let Err(err) = self.claim_orphaned_pvcs(&created).await {
                    tracing::error!(error = ?err, pod = %name, "error claiming pod PVCs");
                }
                Ok(created)
            }
            Err(err) => {
                // The create never happened; take back the expectation so the
                // next pass is not gated on an event that will never arrive.
                self.expectations.creation_observed(&key);
                self.record(
                    nodeset,
                    EventType::Warning,
                    super::FAILED_CREATE_REASON,
                    format!("Error creating pod on node {node_name}: {err}"),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Delete a pod, guarded by its UID so a replacement with the same name
    /// is never torn down by a stale pass.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod))]
    pub async fn delete_pod(&self, nodeset: &NodeSet, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.as_deref().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let key = nodeset_key(nodeset);
        self.expectations.expect_deletions(&key, [uid.clone()]);

        let params = DeleteParams {
            preconditions: Some(Preconditions { uid: Some(uid.clone()), resource_version: None }),
            ..Default::default()
        };
        let res = timeout(API_TIMEOUT, self.pods(nodeset.namespace()).delete(name, &params))
            .await
            .context("timeout while deleting pod")
            .map_err(Error::from)
            .and_then(|res| res.map_err(Error::from));

        match res {
            Ok(_) => {
                self.record(
                    nodeset,
                    EventType::Normal,
                    super::SUCCESSFUL_DELETE_REASON,
                    format!("Deleted pod {name}"),
                )
                .await;
                Ok(())
            }
            Err(Error::Kube(kube::Error::Api(response))) if response.code == 404 => {
                // Already gone; the informer will never report this UID again.
                self.expectations.deletion_observed(&key, &uid);
                Ok(())
            }
            Err(err) => {
                self.expectations.deletion_observed(&key, &uid);
                self.record(
                    nodeset,
                    EventType::Warning,
                    super::FAILED_DELETE_REASON,
                    format!("Error deleting pod {name}: {err}"),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Take ownership of an orphaned pod whose labels match the selector.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod))]
    pub async fn adopt(&self, nodeset: &NodeSet, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.as_deref().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let mut owner_refs: Vec<OwnerReference> =
            pod.metadata.owner_references.clone().unwrap_or_default();
        owner_refs.retain(|r| r.controller != Some(true));
        owner_refs.push(nodeset_owner_ref(nodeset));

        // The UID in the patch body acts as a precondition: the patch fails
        // if the pod observed here has been replaced in the meantime.
        let patch = serde_json::json!({
            "metadata": {
                "uid": pod.metadata.uid,
                "ownerReferences": owner_refs,
            }
        });
        timeout(
            API_TIMEOUT,
            self.pods(nodeset.namespace()).patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while adopting pod")??;
        tracing::debug!(pod = %name, "adopted orphan pod");
        Ok(())
    }

    /// Release a pod whose labels no longer match the selector.
    ///
    /// Strips every owner reference naming this NodeSet, including stale ones
    /// whose UID points at a previous incarnation of the object.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod))]
    pub async fn release(&self, nodeset: &NodeSet, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.as_deref().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let owner_refs: Vec<OwnerReference> = pod
            .metadata
            .owner_references
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !(is_nodeset_ref(r) && r.name == nodeset.name()))
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "uid": pod.metadata.uid,
                "ownerReferences": owner_refs,
            }
        });
        let res = timeout(
            API_TIMEOUT,
            self.pods(nodeset.namespace()).patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while releasing pod")?;
        match res {
            Ok(_) => {
                tracing::debug!(pod = %name, "released pod");
                Ok(())
            }
            // The pod is gone or was replaced; either way it is not ours.
            Err(kube::Error::Api(response)) if response.code == 404 || response.code == 409 => Ok(()),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    /// Claim the persistent volume claims referenced by a pod's volumes so
    /// that deleting the pod cascades to its storage.
    pub async fn claim_orphaned_pvcs(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let volumes = pod.spec.as_ref().and_then(|spec| spec.volumes.as_deref()).unwrap_or_default();
        for volume in volumes {
            let Some(source) = volume.persistent_volume_claim.as_ref() else {
                continue;
            };
            let Some(pvc) = timeout(API_TIMEOUT, api.get_opt(&source.claim_name))
                .await
                .context("timeout while fetching PVC")??
            else {
                continue;
            };
            let has_controller = pvc
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true)));
            if has_controller {
                continue;
            }
            let patch = serde_json::json!({
                "metadata": {
                    "ownerReferences": [pod_owner_ref(pod)],
                }
            });
            timeout(
                API_TIMEOUT,
                api.patch(&source.claim_name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await
            .context("timeout while claiming PVC")??;
            tracing::debug!(pvc = %source.claim_name, "claimed orphaned PVC");
        }
        Ok(())
    }
}

/// Build a pod from the NodeSet's template for the given node.
pub fn build_pod(nodeset: &NodeSet, revision_hash: &str, node_name: &str) -> Pod {
    let template = &nodeset.spec.template;
    let name = format!("{}-{}", nodeset.name(), generate_suffix());

    let template_meta = template.metadata.clone().unwrap_or_default();
    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(LABEL_REVISION_HASH.into(), revision_hash.to_string());
    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.insert(ANNOTATION_HOSTNAME.into(), node_name.to_string());
    annotations.insert(ANNOTATION_REVISION.into(), revision_hash.to_string());
    let info = PodInfo::new(nodeset.namespace(), &name);
    annotations.insert(ANNOTATION_POD_INFO.into(), info.merge_into_comment(None));

    let mut spec = template.spec.clone().unwrap_or_default();
    spec.node_name = Some(node_name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(nodeset.namespace().to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![nodeset_owner_ref(nodeset)]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

fn pod_owner_ref(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".into(),
        kind: "Pod".into(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

fn generate_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LENGTH)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
