//! kfn control-plane façade.
//!
//! The reconciler talks to the cluster only through the traits here. `ControlPlane`
//! reads Functions and reads/writes their children; `StatusWriter` is the separate
//! capability for the status subresource and is handed to the reconciler alone.
//! Implementations: kube-backed in `kfn-kubehub`, in-memory [`MockControlPlane`] for tests.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kfn_core::{ChildKind, Function, FunctionStatus, ObjectKey};
use serde::{Deserialize, Serialize};

mod mock;

pub use mock::{Call, MockControlPlane};

/// Control-plane errors other than "not found" on reads (reads return `Ok(None)`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to Functions and read/write access to their children.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_function(&self, key: &ObjectKey) -> StoreResult<Option<Function>>;

    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<Option<ConfigMap>>;
    async fn create_config_map(&self, obj: &ConfigMap) -> StoreResult<()>;
    async fn update_config_map(&self, obj: &ConfigMap) -> StoreResult<()>;

    async fn get_service(&self, key: &ObjectKey) -> StoreResult<Option<Service>>;
    async fn create_service(&self, obj: &Service) -> StoreResult<()>;
    async fn update_service(&self, obj: &Service) -> StoreResult<()>;

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>>;
    async fn create_deployment(&self, obj: &Deployment) -> StoreResult<()>;
    async fn update_deployment(&self, obj: &Deployment) -> StoreResult<()>;
}

/// Write access to `Function.status`.
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update_function_status(&self, key: &ObjectKey, status: &FunctionStatus) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Created,
    Updated,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Created => f.write_str("Created"),
            EventAction::Updated => f.write_str("Updated"),
        }
    }
}

/// Human-readable event attached to a Function when one of its children is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEvent {
    pub kind: ChildKind,
    pub action: EventAction,
}

impl ChildEvent {
    pub fn created(kind: ChildKind) -> Self {
        Self { kind, action: EventAction::Created }
    }

    pub fn updated(kind: ChildKind) -> Self {
        Self { kind, action: EventAction::Updated }
    }

    pub fn reason(&self) -> String {
        self.action.to_string()
    }

    /// e.g. "ConfigMap created"
    pub fn note(&self) -> String {
        let verb = match self.action {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
        };
        format!("{} {}", self.kind, verb)
    }
}

#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, function: &Function, event: ChildEvent) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_event_text() {
        let ev = ChildEvent::created(ChildKind::Artifact);
        assert_eq!(ev.reason(), "Created");
        assert_eq!(ev.note(), "ConfigMap created");
        let ev = ChildEvent::updated(ChildKind::Workload);
        assert_eq!(ev.reason(), "Updated");
        assert_eq!(ev.note(), "Deployment updated");
    }
}
