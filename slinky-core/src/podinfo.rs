//! The PodInfo breadcrumb.
//!
//! Every Slurm node managed by a NodeSet carries a `{namespace, podName}`
//! record in its free-text comment field, encoded as `key=value` pairs. The
//! operator uses it to resolve a Slurm node observation back to the owning
//! pod. Unrelated comment content is preserved when the record is written.

use std::fmt;

const KEY_NAMESPACE: &str = "k8sNamespace";
const KEY_POD_NAME: &str = "k8sPodName";
const PAIR_SEPARATOR: char = ',';
const KV_SEPARATOR: char = '=';

/// Back-reference from a Slurm node to the Kubernetes pod running on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodInfo {
    /// The namespace of the pod.
    pub namespace: String,
    /// The name of the pod.
    pub pod_name: String,
}

impl PodInfo {
    /// Create a new instance.
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }

    /// True if this record carries no pod reference.
    ///
    /// Empty records are not valid enqueue targets and are skipped by the
    /// event router.
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() || self.pod_name.is_empty()
    }

    /// Extract a PodInfo from a Slurm node comment.
    ///
    /// Parsing is tolerant: malformed pairs and unrelated content are ignored,
    /// and a comment with no record yields an empty PodInfo.
    pub fn from_comment(comment: Option<&str>) -> Self {
        let mut info = Self::default();
        for pair in comment.unwrap_or_default().split(PAIR_SEPARATOR) {
            let Some((key, value)) = pair.split_once(KV_SEPARATOR) else {
                continue;
            };
            match key.trim() {
                KEY_NAMESPACE => info.namespace = value.trim().to_string(),
                KEY_POD_NAME => info.pod_name = value.trim().to_string(),
                _ => continue,
            }
        }
        info
    }

    /// Render this record into a node comment, merging with the comment's
    /// existing content. Pairs owned by this record are replaced; everything
    /// else is carried through untouched.
    pub fn merge_into_comment(&self, existing: Option<&str>) -> String {
        let mut pairs: Vec<String> = existing
            .unwrap_or_default()
            .split(PAIR_SEPARATOR)
            .filter(|pair| !pair.trim().is_empty())
            .filter(|pair| {
                let key = pair.split_once(KV_SEPARATOR).map(|(k, _)| k.trim());
                key != Some(KEY_NAMESPACE) && key != Some(KEY_POD_NAME)
            })
            .map(|pair| pair.trim().to_string())
            .collect();
        if !self.is_empty() {
            pairs.push(format!("{}{}{}", KEY_NAMESPACE, KV_SEPARATOR, self.namespace));
            pairs.push(format!("{}{}{}", KEY_POD_NAME, KV_SEPARATOR, self.pod_name));
        }
        pairs.join(&PAIR_SEPARATOR.to_string())
    }
}

impl fmt::Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}
