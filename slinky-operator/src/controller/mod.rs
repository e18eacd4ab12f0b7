//! The NodeSet controller.
//!
//! Reconciles NodeSet objects: owns worker pod lifecycle, revision history,
//! and node matching, and coordinates with the remote Slurm cluster so that
//! a worker pod is only terminated after its Slurm node has been drained of
//! running jobs. Reconcile requests are fed by the NodeSet watch itself plus
//! the event router's pod, node, and Slurm triggers; requests for one NodeSet
//! are serialized while distinct NodeSets reconcile concurrently.

mod backoff;
mod duration_store;
mod event_router;
mod expectations;
mod node_matcher;
mod pod_control;
mod reconciler;
mod revisions;
mod slurm_control;
mod util;

#[cfg(test)]
mod backoff_test;
#[cfg(test)]
mod reconciler_test;

use std::sync::{Arc, Once, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{self, StreamExt};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Client, Resource};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use slinky_core::crd::NodeSet;
use slinky_core::error::Error;
use slinky_core::podinfo::PodInfo;

use crate::config::Config;
use crate::slurm::ClustersRegistry;

use self::backoff::FailedPodBackoff;
use self::duration_store::DurationStore;
use self::expectations::Expectations;
use self::pod_control::PodControl;
use self::revisions::RevisionStore;
use self::slurm_control::SlurmControl;
use self::util::nodeset_key;

/// The component name recorded on published Kubernetes events.
const COMPONENT_NAME: &str = "nodeset-controller";

/// The default timeout for Kubernetes API calls.
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(5);
/// Requeue interval while waiting on the Slurm side (drains in progress,
/// unreachable clusters, pending finalization).
pub(crate) const SLURM_REQUEUE: Duration = Duration::from_secs(10);
/// The time that has to pass before the next iteration of backoff GC is run.
const BACKOFF_GC_INTERVAL: Duration = Duration::from_secs(60);

// Reasons for NodeSet events.
/// Added to an event when a NodeSet selects all pods.
pub(crate) const SELECTING_ALL_REASON: &str = "SelectingAll";
/// Added to an event when a NodeSet cannot place a pod on a specific node.
pub(crate) const FAILED_PLACEMENT_REASON: &str = "FailedPlacement";
/// Added to an event when the status of an owned pod is `Failed`.
pub(crate) const FAILED_NODESET_POD_REASON: &str = "FailedNodeSetPod";
/// Added to an event when the NodeSet spec fails validation.
pub(crate) const FAILED_VALIDATION_REASON: &str = "FailedValidation";
pub(crate) const SUCCESSFUL_CREATE_REASON: &str = "SuccessfulCreate";
pub(crate) const FAILED_CREATE_REASON: &str = "FailedCreate";
pub(crate) const SUCCESSFUL_DELETE_REASON: &str = "SuccessfulDelete";
pub(crate) const FAILED_DELETE_REASON: &str = "FailedDelete";

/// The process-wide failed-pod backoff registry.
fn failed_pods_backoff() -> Arc<FailedPodBackoff> {
    static BACKOFF: OnceLock<Arc<FailedPodBackoff>> = OnceLock::new();
    BACKOFF.get_or_init(|| Arc::new(FailedPodBackoff::default())).clone()
}

/// Start the backoff GC task exactly once per process; restarting the
/// controller within one process must not stack additional GC loops.
fn spawn_backoff_gc() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let backoff = failed_pods_backoff();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKOFF_GC_INTERVAL);
            loop {
                ticker.tick().await;
                backoff.gc();
            }
        });
    });
}

/// Shared state handed to every reconcile invocation.
pub struct Context {
    client: Client,
    reporter: Reporter,
    pod_control: PodControl,
    slurm_control: SlurmControl,
    revisions: RevisionStore,
    expectations: Arc<Expectations>,
    duration_store: DurationStore,
    failed_pods_backoff: Arc<FailedPodBackoff>,
}

impl Context {
    fn new(client: Client, clusters: ClustersRegistry) -> Self {
        let reporter = Reporter {
            controller: COMPONENT_NAME.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let expectations = Arc::new(Expectations::default());
        Self {
            pod_control: PodControl::new(client.clone(), reporter.clone(), expectations.clone()),
            slurm_control: SlurmControl::new(clusters),
            revisions: RevisionStore::new(client.clone()),
            expectations,
            duration_store: DurationStore::default(),
            failed_pods_backoff: failed_pods_backoff(),
            reporter,
            client,
        }
    }

    /// Publish an event against the given NodeSet.
    pub(crate) async fn record_event(
        &self,
        nodeset: &NodeSet,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder =
            Recorder::new(self.client.clone(), self.reporter.clone(), nodeset.object_ref(&()));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            tracing::debug!(error = ?err, "error publishing event");
        }
    }
}

/// One pass of the control loop for one NodeSet key.
async fn reconcile(nodeset: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = nodeset_key(&nodeset);
    let start = Instant::now();
    tracing::info!(request = %key, "started syncing nodeset");

    let result = ctx.sync(&nodeset).await;
    // Sub-steps request requeues through the duration store; pop it
    // regardless of outcome so a failed pass cannot leak a stale entry.
    let requeue = ctx.duration_store.pop(&key);
    match result {
        Ok(()) => {
            tracing::info!(
                request = %key,
                duration = ?start.elapsed(),
                requeue = ?requeue,
                "finished syncing nodeset",
            );
            Ok(requeue.map(Action::requeue).unwrap_or_else(Action::await_change))
        }
        Err(err) => {
            tracing::error!(request = %key, error = %err, "error while reconciling request");
            Err(err)
        }
    }
}

/// The controller triggers this on reconcile errors.
fn error_policy(nodeset: Arc<NodeSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    tracing::warn!(request = %nodeset_key(&nodeset), error = %error, "reconcile failed");
    Action::requeue(Duration::from_secs(10))
}

/// The NodeSet reconciliation engine.
pub struct NodeSetController {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The process-wide Slurm clusters registry.
    clusters: ClustersRegistry,
    /// The channel fed by the Slurm node informer.
    slurm_events: mpsc::Receiver<PodInfo>,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Receiver<()>,
}

impl NodeSetController {
    /// Create a new instance.
    pub fn new(
        client: Client,
        config: Arc<Config>,
        clusters: ClustersRegistry,
        slurm_events: mpsc::Receiver<PodInfo>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { client, config, clusters, slurm_events, shutdown }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        spawn_backoff_gc();

        let nodesets: Api<NodeSet> = Api::all(self.client.clone());
        let controller = Controller::new(nodesets, watcher::Config::default());
        let store = controller.store();
        let ctx = Arc::new(Context::new(self.client.clone(), self.clusters.clone()));

        let triggers = stream::select_all(vec![
            event_router::pod_trigger(self.client.clone(), store.clone(), ctx.expectations.clone())
                .boxed(),
            event_router::node_trigger(self.client.clone(), store).boxed(),
            event_router::slurm_trigger(self.client.clone(), self.slurm_events).boxed(),
        ]);

        let mut shutdown = self.shutdown;
        tracing::info!(workers = self.config.nodeset_workers, "nodeset controller initialized");
        controller
            .with_config(controller::Config::default().concurrency(self.config.nodeset_workers as u16))
            .reconcile_on(triggers)
            .graceful_shutdown_on(async move {
                let _ = shutdown.recv().await;
            })
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((object, action)) => {
                        tracing::debug!(object = %object, action = ?action, "reconciled nodeset")
                    }
                    Err(err) => tracing::debug!(error = %err, "reconcile dispatch error"),
                }
            })
            .await;

        tracing::debug!("nodeset controller shutdown");
        Ok(())
    }
}
