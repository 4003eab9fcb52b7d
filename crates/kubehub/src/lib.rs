//! kfn kubehub: API-server backed control plane and the controller loop.
//!
//! `KubeControlPlane` implements the reconciler's store and status traits on
//! typed `Api`s; `run_controller` wires a kube-runtime `Controller` that watches
//! Functions and the ConfigMaps, Services and Deployments they own.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kfn_api::{ControlPlane, StatusWriter, StoreError, StoreResult};
use kfn_core::{Function, FunctionStatus, ObjectKey};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::debug;

mod controller;
mod events;

pub use controller::{run_controller, ControllerConfig, ControllerError};
pub use events::KubeRecorder;

/// Field manager / reporter name used for writes and events.
pub const CONTROLLER_NAME: &str = "kfn-controller";

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Classify a kube client error for the reconciler.
pub fn store_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(ae.message),
            409 => StoreError::Conflict(ae.message),
            429 | 500..=599 => StoreError::Unavailable(format!("{} ({})", ae.message, ae.code)),
            _ => StoreError::Internal(format!("{}: {} ({})", ae.reason, ae.message, ae.code)),
        },
        kube::Error::SerdeError(e) => StoreError::Internal(e.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Merge patch for the status subresource. `null` clears fields the status no longer carries.
pub fn status_patch(status: &FunctionStatus) -> Value {
    let phase = if status.phase.is_unset() { Value::Null } else { Value::from(status.phase.as_str()) };
    let error = status.error_message.as_deref().map_or(Value::Null, Value::from);
    json!({ "status": { "phase": phase, "errorMessage": error } })
}

/// Control plane talking to the API server through typed namespaced `Api`s.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, key: &ObjectKey) -> StoreResult<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(&key.namespace).get_opt(&key.name).await.map_err(store_error)
    }

    async fn create<K>(&self, obj: &K) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let key = key_of(obj)?;
        self.api::<K>(&key.namespace).create(&PostParams::default(), obj).await.map_err(store_error)?;
        debug!(object = %key, kind = %K::kind(&Default::default()), "created");
        Ok(())
    }

    async fn replace<K>(&self, obj: &K) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let key = key_of(obj)?;
        self.api::<K>(&key.namespace).replace(&key.name, &PostParams::default(), obj).await.map_err(store_error)?;
        debug!(object = %key, kind = %K::kind(&Default::default()), "replaced");
        Ok(())
    }
}

fn key_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Internal("object missing metadata.name or metadata.namespace".into()))
}

#[async_trait::async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_function(&self, key: &ObjectKey) -> StoreResult<Option<Function>> {
        self.get(key).await
    }

    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<Option<ConfigMap>> {
        self.get(key).await
    }
    async fn create_config_map(&self, obj: &ConfigMap) -> StoreResult<()> {
        self.create(obj).await
    }
    async fn update_config_map(&self, obj: &ConfigMap) -> StoreResult<()> {
        self.replace(obj).await
    }

    async fn get_service(&self, key: &ObjectKey) -> StoreResult<Option<Service>> {
        self.get(key).await
    }
    async fn create_service(&self, obj: &Service) -> StoreResult<()> {
        self.create(obj).await
    }
    async fn update_service(&self, obj: &Service) -> StoreResult<()> {
        self.replace(obj).await
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        self.get(key).await
    }
    async fn create_deployment(&self, obj: &Deployment) -> StoreResult<()> {
        self.create(obj).await
    }
    async fn update_deployment(&self, obj: &Deployment) -> StoreResult<()> {
        self.replace(obj).await
    }
}

#[async_trait::async_trait]
impl StatusWriter for KubeControlPlane {
    async fn update_function_status(&self, key: &ObjectKey, status: &FunctionStatus) -> StoreResult<()> {
        let api = self.api::<Function>(&key.namespace);
        let patch = status_patch(status);
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(store_error)?;
        debug!(function = %key, phase = %status.phase, "status patched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfn_core::Phase;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        assert!(matches!(store_error(api_err(404, "NotFound")), StoreError::NotFound(_)));
        assert!(matches!(store_error(api_err(409, "Conflict")), StoreError::Conflict(_)));
        assert!(matches!(store_error(api_err(503, "ServiceUnavailable")), StoreError::Unavailable(_)));
        assert!(matches!(store_error(api_err(429, "TooManyRequests")), StoreError::Unavailable(_)));
        match store_error(api_err(422, "Invalid")) {
            StoreError::Internal(msg) => assert!(msg.contains("Invalid"), "msg={msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_patch_clears_absent_fields() {
        let patch = status_patch(&FunctionStatus::with_phase(Phase::Building));
        assert_eq!(patch, json!({ "status": { "phase": "Building", "errorMessage": null } }));

        let status = FunctionStatus { phase: Phase::Unavailable, error_message: Some("create ConfigMap failed".into()) };
        assert_eq!(status_patch(&status)["status"]["errorMessage"], json!("create ConfigMap failed"));
        assert_eq!(status_patch(&FunctionStatus::default())["status"]["phase"], Value::Null);
    }
}
