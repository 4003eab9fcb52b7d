//! kfn core types: the `Function` resource, its status phases, child kinds
//! and the content fingerprint shared by the resolver and the engine.

#![forbid(unsafe_code)]

use std::fmt;

use kube::Resource;
use serde::{Deserialize, Serialize};

mod fingerprint;
mod function;

pub use fingerprint::{fingerprint, Fingerprint};
pub use function::{Function, FunctionSpec, FunctionStatus, Phase};

/// Port the server container listens on when the spec leaves it unset.
pub const DEFAULT_SERVER_PORT: i32 = 8080;
/// Replica count used when the spec leaves it unset.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Annotation on the ConfigMap and Service carrying the source fingerprint.
pub const HASH_ANNOTATION: &str = "hash";
/// Pod template annotation carrying the source fingerprint (workload change token).
pub const SOURCE_HASH_ANNOTATION: &str = "kfn.dev/source-hash";
/// Pod template annotation stamped when a rolling refresh is forced.
pub const RESTARTED_AT_ANNOTATION: &str = "kfn.dev/restarted-at";
/// Label linking the Service selector to the Deployment pods.
pub const APP_LABEL: &str = "app";
/// ConfigMap key holding the function source.
pub const HANDLER_KEY: &str = "handler.go";
/// Environment variable the server container reads its listen port from.
pub const PORT_ENV: &str = "SERVER_PORT";

/// Namespace-qualified identity of a Function (and of its children).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a namespaced resource; `None` when name or namespace is missing.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        let namespace = obj.meta().namespace.clone()?;
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The three generated child kinds, in convergence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildKind {
    Artifact,
    Network,
    Workload,
}

impl ChildKind {
    /// Convergence order: later kinds assume the earlier ones exist.
    pub const ORDER: [ChildKind; 3] = [ChildKind::Artifact, ChildKind::Network, ChildKind::Workload];

    /// Kubernetes kind backing this child.
    pub fn resource_kind(self) -> &'static str {
        match self {
            ChildKind::Artifact => "ConfigMap",
            ChildKind::Network => "Service",
            ChildKind::Workload => "Deployment",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_from_resource() {
        let mut f = Function::new("echo", FunctionSpec::default());
        assert!(ObjectKey::of(&f).is_none(), "namespace is required");
        f.metadata.namespace = Some("default".into());
        let key = ObjectKey::of(&f).unwrap();
        assert_eq!(key, ObjectKey::new("default", "echo"));
        assert_eq!(key.to_string(), "default/echo");
    }

    #[test]
    fn child_order_is_artifact_network_workload() {
        let kinds: Vec<_> = ChildKind::ORDER.iter().map(|k| k.resource_kind()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Service", "Deployment"]);
    }
}
