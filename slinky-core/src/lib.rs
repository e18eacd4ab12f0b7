pub mod crd;
pub mod error;
pub mod labels;
pub mod podinfo;

pub use error::Error;

/// The API group served by the Slinky operators.
pub const API_GROUP: &str = "slinky.slurm.net";
/// The API version of the NodeSet kind.
pub const API_VERSION: &str = "slinky.slurm.net/v1alpha1";

/// Finalizer placed on NodeSets so that deletion remains observable until all
/// owned pods have been drained and removed on the Slurm side.
pub const NODESET_FINALIZER: &str = "slinky.slurm.net/nodeset";

/// Label stamped onto pods carrying the hash of the revision they were created from.
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

/// Annotation carrying the Slurm hostname assigned to a pod.
pub const ANNOTATION_HOSTNAME: &str = "slinky.slurm.net/hostname";
/// Annotation carrying the revision hash a pod was created from.
pub const ANNOTATION_REVISION: &str = "slinky.slurm.net/revision";
/// Annotation mirroring the PodInfo blob which is also embedded in the Slurm
/// node's comment field for back-lookup.
pub const ANNOTATION_POD_INFO: &str = "slinky.slurm.net/pod-info";
