use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::controller::NodeSetController;
use crate::slurm::informer::SlurmNodeInformer;
use crate::slurm::ClustersRegistry;

/// The application object for when the operator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The process-wide Slurm clusters registry, populated as cluster
    /// clients connect.
    _clusters: ClustersRegistry,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the NodeSet controller.
    controller: JoinHandle<Result<()>>,
    /// The join handle of the Slurm node informer.
    informer: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // The clusters registry is shared between the informer, which polls
        // every registered cluster, and the controller, which resolves the
        // cluster a NodeSet names.
        let clusters = ClustersRegistry::default();

        // Spawn various core tasks.
        let (slurm_tx, slurm_rx) = mpsc::channel(1000);
        let informer = SlurmNodeInformer::new(
            clusters.clone(),
            slurm_tx,
            Duration::from_secs(config.slurm_poll_seconds),
            shutdown_tx.subscribe(),
        )
        .spawn();

        let controller = NodeSetController::new(
            client,
            config.clone(),
            clusters.clone(),
            slurm_rx,
            shutdown_tx.subscribe(),
        )
        .spawn();

        Ok(Self {
            _config: config,
            _clusters: clusters,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            controller,
            informer,
        })
    }

    /// The process-wide clusters registry.
    ///
    /// Slurm cluster clients are connected out of band (cluster bootstrap is
    /// not this controller's concern) and registered here; the informer and
    /// the controller pick them up on their next pass.
    pub fn clusters(&self) -> ClustersRegistry {
        self._clusters.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Slinky operator is shutting down");
        if let Err(err) = self.controller.await.context("error joining nodeset controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down nodeset controller");
        }
        if let Err(err) = self.informer.await.context("error joining slurm informer handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down slurm node informer");
        }

        tracing::debug!("Slinky operator shutdown complete");
        Ok(())
    }
}
