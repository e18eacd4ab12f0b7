//! Slinky error abstractions.

use thiserror::Error;

/// Result type used throughout the reconciliation core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reconciliation error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// An error returned from the Kubernetes API.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    /// The NodeSet references a Slurm cluster with no registered client.
    #[error("no client registered for slurm cluster {0}")]
    UnknownCluster(String),
    /// The Slurm cluster could not be reached or returned an error.
    #[error("slurm cluster {cluster} unavailable: {source}")]
    SlurmUnavailable {
        cluster: String,
        #[source]
        source: anyhow::Error,
    },
    /// The given object failed validation.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A required object field was absent.
    #[error("object is missing required field {0}")]
    MissingObjectKey(&'static str),
    /// Catch-all for errors which will be retried verbatim.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns true if this error indicates the Slurm side was unreachable.
    ///
    /// Such errors are non-fatal: the reconciler records a `Progressing=False`
    /// condition and requeues instead of surfacing them to the work queue.
    pub fn is_slurm_unavailable(&self) -> bool {
        matches!(self, Self::UnknownCluster(_) | Self::SlurmUnavailable { .. })
    }
}
