//! In-memory control plane for engine tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use kfn_core::{ChildKind, Function, FunctionStatus, ObjectKey};
use tracing::debug;
use uuid::Uuid;

use crate::{ChildEvent, ControlPlane, EventRecorder, StatusWriter, StoreError, StoreResult};

/// One control-plane call observed by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    GetFunction,
    Get(ChildKind),
    Create(ChildKind),
    Update(ChildKind),
    UpdateStatus,
}

impl Call {
    /// Creates, updates and status writes.
    pub fn is_write(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Update(_) | Call::UpdateStatus)
    }
}

#[derive(Default)]
struct MockState {
    functions: BTreeMap<ObjectKey, Function>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    services: BTreeMap<ObjectKey, Service>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    calls: Vec<Call>,
    failures: Vec<(Call, StoreError)>,
    events: Vec<(ObjectKey, ChildEvent)>,
    rv: u64,
    cluster_ips: u8,
}

impl MockState {
    fn observe(&mut self, call: Call) -> StoreResult<()> {
        self.calls.push(call);
        match self.failures.iter().position(|(c, _)| *c == call) {
            Some(idx) => {
                let (_, err) = self.failures.remove(idx);
                debug!(?call, error = %err, "mock: injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }
}

/// In-memory control plane with call recording and failure injection.
///
/// Mimics the API server where it matters to the reconciler: `resourceVersion`
/// bumps on every write, stale versions conflict, Service `clusterIP` is
/// immutable, and Deployment status survives spec updates.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a Function, assigning uid and resourceVersion when missing.
    pub fn insert_function(&self, mut function: Function) -> ObjectKey {
        let mut st = self.state();
        if function.metadata.uid.is_none() {
            function.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        function.metadata.resource_version = Some(st.next_rv());
        let key = ObjectKey::new(
            function.metadata.namespace.clone().unwrap_or_default(),
            function.metadata.name.clone().unwrap_or_default(),
        );
        st.functions.insert(key.clone(), function);
        key
    }

    pub fn remove_function(&self, key: &ObjectKey) -> Option<Function> {
        self.state().functions.remove(key)
    }

    pub fn function(&self, key: &ObjectKey) -> Option<Function> {
        self.state().functions.get(key).cloned()
    }

    pub fn config_map(&self, key: &ObjectKey) -> Option<ConfigMap> {
        self.state().config_maps.get(key).cloned()
    }

    pub fn service(&self, key: &ObjectKey) -> Option<Service> {
        self.state().services.get(key).cloned()
    }

    pub fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        self.state().deployments.get(key).cloned()
    }

    /// Out-of-band edit of a stored child, as a cluster operator would do.
    pub fn edit_config_map(&self, key: &ObjectKey, f: impl FnOnce(&mut ConfigMap)) {
        let mut st = self.state();
        let rv = st.next_rv();
        if let Some(obj) = st.config_maps.get_mut(key) {
            f(obj);
            obj.metadata.resource_version = Some(rv);
        }
    }

    pub fn edit_service(&self, key: &ObjectKey, f: impl FnOnce(&mut Service)) {
        let mut st = self.state();
        let rv = st.next_rv();
        if let Some(obj) = st.services.get_mut(key) {
            f(obj);
            obj.metadata.resource_version = Some(rv);
        }
    }

    pub fn edit_deployment(&self, key: &ObjectKey, f: impl FnOnce(&mut Deployment)) {
        let mut st = self.state();
        let rv = st.next_rv();
        if let Some(obj) = st.deployments.get_mut(key) {
            f(obj);
            obj.metadata.resource_version = Some(rv);
        }
    }

    pub fn edit_function(&self, key: &ObjectKey, f: impl FnOnce(&mut Function)) {
        let mut st = self.state();
        let rv = st.next_rv();
        if let Some(obj) = st.functions.get_mut(key) {
            f(obj);
            obj.metadata.resource_version = Some(rv);
        }
    }

    /// Report the Deployment's `Available` condition as the scheduler would.
    /// `None` removes all conditions.
    pub fn set_workload_available(&self, key: &ObjectKey, available: Option<bool>) {
        self.edit_deployment(key, |dep| {
            let conditions = available.map(|ok| {
                vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: if ok { "True" } else { "False" }.to_string(),
                    reason: Some(if ok { "MinimumReplicasAvailable" } else { "MinimumReplicasUnavailable" }.to_string()),
                    ..Default::default()
                }]
            });
            dep.status = Some(DeploymentStatus { conditions, ..Default::default() });
        });
    }

    /// Make the next matching call fail with `err`.
    pub fn fail_next(&self, call: Call, err: StoreError) {
        self.state().failures.push((call, err));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.state().calls.iter().copied().filter(Call::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn events(&self) -> Vec<(ObjectKey, ChildEvent)> {
        self.state().events.clone()
    }
}

fn key_of(meta: &ObjectMeta) -> StoreResult<ObjectKey> {
    let name = meta.name.clone().ok_or_else(|| StoreError::Internal("object missing metadata.name".into()))?;
    let namespace =
        meta.namespace.clone().ok_or_else(|| StoreError::Internal("object missing metadata.namespace".into()))?;
    Ok(ObjectKey { namespace, name })
}

fn create_in<K>(map: &mut BTreeMap<ObjectKey, K>, rv: String, obj: &K) -> StoreResult<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone,
{
    let key = key_of(obj.metadata())?;
    if map.contains_key(&key) {
        return Err(StoreError::Conflict(format!("{key} already exists")));
    }
    let mut obj = obj.clone();
    let meta = obj.metadata_mut();
    meta.uid = Some(Uuid::new_v4().to_string());
    meta.resource_version = Some(rv);
    map.insert(key, obj.clone());
    Ok(obj)
}

fn update_in<K>(
    map: &mut BTreeMap<ObjectKey, K>,
    rv: String,
    obj: &K,
    carry: impl FnOnce(&K, &mut K) -> StoreResult<()>,
) -> StoreResult<()>
where
    K: Metadata<Ty = ObjectMeta> + Clone,
{
    let key = key_of(obj.metadata())?;
    let stored = map.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    if let Some(want) = obj.metadata().resource_version.as_deref() {
        if stored.metadata().resource_version.as_deref() != Some(want) {
            return Err(StoreError::Conflict(format!("{key}: resourceVersion {want} is stale")));
        }
    }
    let mut next = obj.clone();
    carry(stored, &mut next)?;
    let meta = next.metadata_mut();
    meta.uid = stored.metadata().uid.clone();
    meta.resource_version = Some(rv);
    map.insert(key, next);
    Ok(())
}

#[async_trait::async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_function(&self, key: &ObjectKey) -> StoreResult<Option<Function>> {
        let mut st = self.state();
        st.observe(Call::GetFunction)?;
        Ok(st.functions.get(key).cloned())
    }

    async fn get_config_map(&self, key: &ObjectKey) -> StoreResult<Option<ConfigMap>> {
        let mut st = self.state();
        st.observe(Call::Get(ChildKind::Artifact))?;
        Ok(st.config_maps.get(key).cloned())
    }

    async fn create_config_map(&self, obj: &ConfigMap) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Create(ChildKind::Artifact))?;
        let rv = st.next_rv();
        create_in(&mut st.config_maps, rv, obj).map(drop)
    }

    async fn update_config_map(&self, obj: &ConfigMap) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Update(ChildKind::Artifact))?;
        let rv = st.next_rv();
        update_in(&mut st.config_maps, rv, obj, |_, _| Ok(()))
    }

    async fn get_service(&self, key: &ObjectKey) -> StoreResult<Option<Service>> {
        let mut st = self.state();
        st.observe(Call::Get(ChildKind::Network))?;
        Ok(st.services.get(key).cloned())
    }

    async fn create_service(&self, obj: &Service) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Create(ChildKind::Network))?;
        st.cluster_ips = st.cluster_ips.wrapping_add(1);
        let ip = format!("10.96.0.{}", st.cluster_ips);
        let mut obj = obj.clone();
        let spec = obj.spec.get_or_insert_with(Default::default);
        spec.cluster_ip = Some(ip.clone());
        spec.cluster_ips = Some(vec![ip]);
        let rv = st.next_rv();
        create_in(&mut st.services, rv, &obj).map(drop)
    }

    async fn update_service(&self, obj: &Service) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Update(ChildKind::Network))?;
        let rv = st.next_rv();
        update_in(&mut st.services, rv, obj, |stored, next| {
            let old = stored.spec.as_ref().and_then(|s| s.cluster_ip.clone());
            let new = next.spec.as_ref().and_then(|s| s.cluster_ip.clone());
            if old != new {
                return Err(StoreError::Internal("Service spec.clusterIP: field is immutable".into()));
            }
            Ok(())
        })
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        let mut st = self.state();
        st.observe(Call::Get(ChildKind::Workload))?;
        Ok(st.deployments.get(key).cloned())
    }

    async fn create_deployment(&self, obj: &Deployment) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Create(ChildKind::Workload))?;
        let rv = st.next_rv();
        create_in(&mut st.deployments, rv, obj).map(drop)
    }

    async fn update_deployment(&self, obj: &Deployment) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::Update(ChildKind::Workload))?;
        let rv = st.next_rv();
        update_in(&mut st.deployments, rv, obj, |stored, next| {
            next.status = stored.status.clone();
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl StatusWriter for MockControlPlane {
    async fn update_function_status(&self, key: &ObjectKey, status: &FunctionStatus) -> StoreResult<()> {
        let mut st = self.state();
        st.observe(Call::UpdateStatus)?;
        let rv = st.next_rv();
        let function = st.functions.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        function.status = Some(status.clone());
        function.metadata.resource_version = Some(rv);
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventRecorder for MockControlPlane {
    async fn record(&self, function: &Function, event: ChildEvent) -> StoreResult<()> {
        let key = key_of(&function.metadata)?;
        self.state().events.push((key, event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("default".into()), ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_update_bumps_resource_version() {
        let mock = MockControlPlane::new();
        let key = ObjectKey::new("default", "a");
        mock.create_config_map(&cm("a")).await.unwrap();
        let first = mock.config_map(&key).unwrap();
        let rv1 = first.metadata.resource_version.clone().unwrap();

        assert!(matches!(mock.create_config_map(&cm("a")).await, Err(StoreError::Conflict(_))));

        mock.update_config_map(&first).await.unwrap();
        let second = mock.config_map(&key).unwrap();
        assert_ne!(second.metadata.resource_version.unwrap(), rv1);
        assert_eq!(second.metadata.uid, first.metadata.uid);

        // stale version
        let err = mock.update_config_map(&first).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "err={err}");
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let mock = MockControlPlane::new();
        let key = ObjectKey::new("default", "a");
        mock.fail_next(Call::Get(ChildKind::Artifact), StoreError::Unavailable("etcd".into()));
        assert!(mock.get_config_map(&key).await.is_err());
        assert_eq!(mock.get_config_map(&key).await, Ok(None));
        assert_eq!(mock.calls(), vec![Call::Get(ChildKind::Artifact), Call::Get(ChildKind::Artifact)]);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn service_cluster_ip_is_immutable() {
        let mock = MockControlPlane::new();
        let key = ObjectKey::new("default", "svc");
        let svc = Service {
            metadata: ObjectMeta { name: Some("svc".into()), namespace: Some("default".into()), ..Default::default() },
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        };
        mock.create_service(&svc).await.unwrap();
        assert!(mock.update_service(&svc).await.is_err());
        let stored = mock.service(&key).unwrap();
        mock.update_service(&stored).await.unwrap();
    }
}
