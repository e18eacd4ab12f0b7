//! Pod-template revision history.
//!
//! Every distinct pod template of a NodeSet is snapshotted into an immutable
//! `ControllerRevision` named `<nodeset>-<hash>`. Rolling updates compare
//! pods against the newest revision; history beyond the configured limit is
//! garbage-collected oldest-first, never touching a revision a live pod was
//! created from.

use std::collections::BTreeMap;
use std::collections::HashSet;

use anyhow::Context as AnyhowContext;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource};
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use slinky_core::crd::{NodeSet, RequiredMetadata};
use slinky_core::error::{Error, Result};
use slinky_core::LABEL_REVISION_HASH;

use super::util::{classify, nodeset_owner_ref, pod_revision, Ownership};
use super::API_TIMEOUT;

/// Characters of the hex digest kept in revision names.
const HASH_LENGTH: usize = 10;

/// The realized revision state for one reconcile pass.
#[derive(Clone, Debug)]
pub struct RealizedRevisions {
    /// The revision new pods are created from.
    pub update: ControllerRevision,
    /// The revision most existing pods were created from; equal to `update`
    /// once a rollout has completed.
    pub current: ControllerRevision,
    /// The possibly-incremented collision count to record in status.
    pub collision_count: i32,
}

impl RealizedRevisions {
    pub fn update_hash(&self) -> &str {
        self.update.metadata.labels.as_ref().and_then(|l| l.get(LABEL_REVISION_HASH)).map(String::as_str).unwrap_or_default()
    }

    pub fn current_hash(&self) -> &str {
        self.current.metadata.labels.as_ref().and_then(|l| l.get(LABEL_REVISION_HASH)).map(String::as_str).unwrap_or_default()
    }
}

/// Append-only history of pod-template revisions.
pub struct RevisionStore {
    client: Client,
}

impl RevisionStore {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, nodeset: &NodeSet) -> Api<ControllerRevision> {
        Api::namespaced(self.client.clone(), nodeset.namespace())
    }

    /// List the revisions owned by the given NodeSet, ordered by revision
    /// number with creation-timestamp tie-break.
    pub async fn list(&self, nodeset: &NodeSet) -> Result<Vec<ControllerRevision>> {
        let params = ListParams {
            label_selector: selector_string(nodeset),
            ..Default::default()
        };
        let list = timeout(API_TIMEOUT, self.api(nodeset).list(&params))
            .await
            .context("timeout while listing controller revisions")??;
        let uid = nodeset.meta().uid.as_deref().unwrap_or_default();
        let mut revisions: Vec<_> = list
            .items
            .into_iter()
            .filter(|revision| {
                revision
                    .metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid && r.controller == Some(true)))
            })
            .collect();
        revisions.sort_by(|a, b| {
            a.revision.cmp(&b.revision).then_with(|| {
                let left = a.metadata.creation_timestamp.as_ref().map(|time| time.0);
                let right = b.metadata.creation_timestamp.as_ref().map(|time| time.0);
                left.cmp(&right)
            })
        });
        Ok(revisions)
    }

    /// Ensure a revision exists for the NodeSet's current template and return
    /// the realized update/current pair.
    ///
    /// On a name collision with a revision holding *different* content, the
    /// collision count is incremented and the hash recomputed until the name
    /// is free or a deduplicate is found.
    pub async fn realize(&self, nodeset: &NodeSet) -> Result<RealizedRevisions> {
        let api = self.api(nodeset);
        let mut revisions = self.list(nodeset).await?;
        let next_revision = revisions.iter().map(|r| r.revision).max().unwrap_or(0) + 1;
        let mut collision_count = nodeset
            .status
            .as_ref()
            .and_then(|status| status.collision_count)
            .unwrap_or(0);

        let update = loop {
            let hash = hash_template(&nodeset.spec.template, collision_count);
            let name = format!("{}-{}", nodeset.name(), hash);
            let data = revision_data(&nodeset.spec.template);

            let existing = match revisions.iter().find(|r| r.metadata.name.as_deref() == Some(&name)) {
                Some(revision) => Some(revision.clone()),
                None => timeout(API_TIMEOUT, api.get_opt(&name))
                    .await
                    .context("timeout while fetching controller revision")??,
            };
            match existing {
                Some(revision) if revision.data.as_ref() == Some(&data) => break revision,
                Some(_) => {
                    // Same name, different content. Advance the collision
                    // counter and try again with a new hash.
                    collision_count += 1;
                    continue;
                }
                None => {
                    let revision = build_revision(nodeset, &name, &hash, data, next_revision);
                    let created = timeout(API_TIMEOUT, api.create(&PostParams::default(), &revision))
                        .await
                        .context("timeout while creating controller revision")??;
                    revisions.push(created.clone());
                    break created;
                }
            }
        };

        // The current revision is whatever status points at; before the first
        // rollout completes it is the update revision itself.
        let current = nodeset
            .status
            .as_ref()
            .and_then(|status| status.current_revision.as_deref())
            .and_then(|name| revisions.iter().find(|r| r.metadata.name.as_deref() == Some(name)))
            .cloned()
            .unwrap_or_else(|| update.clone());

        Ok(RealizedRevisions { update, current, collision_count })
    }

    /// Delete revisions beyond `revisionHistoryLimit`, oldest first,
    /// preserving the current and update revisions and any revision still
    /// referenced by a live pod.
    pub async fn truncate_history(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        realized: &RealizedRevisions,
    ) -> Result<()> {
        let api = self.api(nodeset);
        let revisions = self.list(nodeset).await?;

        let mut live: HashSet<String> = pods
            .iter()
            .filter(|pod| classify(nodeset, pod) == Ownership::Owned)
            .filter_map(|pod| pod_revision(pod))
            .map(|hash| format!("{}-{}", nodeset.name(), hash))
            .collect();
        live.extend(realized.update.metadata.name.clone());
        live.extend(realized.current.metadata.name.clone());

        let expendable: Vec<_> = revisions
            .iter()
            .filter(|revision| {
                revision.metadata.name.as_ref().is_some_and(|name| !live.contains(name))
            })
            .collect();
        let limit = nodeset.spec.revision_history_limit.max(0) as usize;
        let excess = expendable.len().saturating_sub(limit);
        for revision in expendable.into_iter().take(excess) {
            let Some(name) = revision.metadata.name.as_deref() else {
                continue;
            };
            tracing::debug!(revision = %name, "garbage collecting controller revision");
            match timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
                .await
                .context("timeout while deleting controller revision")?
            {
                Ok(_) => (),
                Err(kube::Error::Api(response)) if response.code == 404 => (),
                Err(err) => return Err(Error::Kube(err)),
            }
        }
        Ok(())
    }
}

/// Deterministic hash of a pod template plus the collision counter.
///
/// The output names objects persisted into the cluster, so it must be stable
/// across controller restarts and toolchain upgrades.
pub fn hash_template(template: &PodTemplateSpec, collision_count: i32) -> String {
    let mut hasher = Sha256::new();
    let encoded = serde_json::to_vec(template).unwrap_or_default();
    hasher.update(&encoded);
    hasher.update(collision_count.to_be_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..HASH_LENGTH].to_string()
}

fn revision_data(template: &PodTemplateSpec) -> RawExtension {
    RawExtension(serde_json::json!({ "spec": { "template": template } }))
}

fn build_revision(
    nodeset: &NodeSet,
    name: &str,
    hash: &str,
    data: RawExtension,
    revision: i64,
) -> ControllerRevision {
    let mut labels: BTreeMap<String, String> = nodeset
        .spec
        .selector
        .match_labels
        .clone()
        .unwrap_or_default();
    labels.insert(LABEL_REVISION_HASH.into(), hash.to_string());
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(nodeset.namespace().to_string()),
            labels: Some(labels),
            owner_references: Some(vec![nodeset_owner_ref(nodeset)]),
            ..Default::default()
        },
        data: Some(data),
        revision,
    }
}

fn selector_string(nodeset: &NodeSet) -> Option<String> {
    let labels = nodeset.spec.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}
