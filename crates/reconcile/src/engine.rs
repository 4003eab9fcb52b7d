use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kfn_api::{ChildEvent, ControlPlane, EventRecorder, StatusWriter, StoreResult};
use kfn_core::{ChildKind, Function, FunctionStatus, ObjectKey, Phase, RESTARTED_AT_ANNOTATION};
use kfn_render::{bind_children, check_adoptable, resolve, template_annotation, DesiredChildren, RenderConfig};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::drift;
use crate::error::{Error, Op, Result};
use crate::status::{requeue_after, PhaseTracker};

const FUNCTION: &str = "Function";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub render: RenderConfig,
    /// Re-check delay while the workload reports not-ready.
    pub building_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { render: RenderConfig::default(), building_requeue: Duration::from_secs(20) }
    }
}

/// Per-trigger context. Every control-plane call of the pass must finish before `deadline`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassContext {
    pub deadline: Option<tokio::time::Instant>,
}

impl PassContext {
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(tokio::time::Instant::now() + timeout) }
    }
}

/// Result of a completed pass, consumed by the trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Function no longer exists; its children are garbage collected by the cluster.
    Gone,
    Converged { phase: Phase, requeue_after: Option<Duration> },
}

impl Outcome {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Outcome::Gone => None,
            Outcome::Converged { phase, .. } => Some(*phase),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Outcome::Gone => None,
            Outcome::Converged { requeue_after, .. } => *requeue_after,
        }
    }
}

/// What a child step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Unchanged,
}

async fn guarded<T>(
    pass: &PassContext,
    target: &'static str,
    op: Op,
    call: impl Future<Output = StoreResult<T>>,
) -> Result<T> {
    let res = match pass.deadline {
        Some(at) => tokio::time::timeout_at(at, call).await.map_err(|_| Error::DeadlineExceeded { target, op })?,
        None => call.await,
    };
    res.map_err(|source| Error::Store { target, op, source })
}

/// Converges the children of one Function per pass, Artifact → Network → Workload,
/// and owns the only write path to `Function.status`.
pub struct Reconciler {
    store: Arc<dyn ControlPlane>,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventRecorder>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ControlPlane>,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventRecorder>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { store, status, events, config }
    }

    /// Run one convergence pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey, pass: &PassContext) -> Result<Outcome> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.run_pass(key, pass).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_errors_total", 1u64, "transient" => if e.is_transient() { "true" } else { "false" });
        }
        res
    }

    async fn run_pass(&self, key: &ObjectKey, pass: &PassContext) -> Result<Outcome> {
        let Some(function) = guarded(pass, FUNCTION, Op::Get, self.store.get_function(key)).await? else {
            debug!(function = %key, "function not found; nothing to converge");
            return Ok(Outcome::Gone);
        };

        let mut tracker = PhaseTracker::begin(function.status.as_ref());
        match self.converge(key, &function, &mut tracker, pass).await {
            Ok(workload) => {
                let phase = tracker.settle(workload.as_ref());
                self.persist(key, &tracker, tracker.status(None), pass).await?;
                let requeue_after = requeue_after(phase, self.config.building_requeue);
                if phase == Phase::Building {
                    info!(function = %key, requeue_secs = ?requeue_after.map(|d| d.as_secs()), "function still initializing");
                } else {
                    info!(function = %key, %phase, "function converged");
                }
                Ok(Outcome::Converged { phase, requeue_after })
            }
            Err(err) => {
                warn!(function = %key, phase = %tracker.phase(), error = %err, "convergence pass aborted");
                let status = tracker.status(Some(err.to_string()));
                if let Err(e) = self.persist(key, &tracker, status, pass).await {
                    warn!(function = %key, error = %e, "failed to record pass error on status");
                }
                Err(err)
            }
        }
    }

    async fn persist(&self, key: &ObjectKey, tracker: &PhaseTracker, status: FunctionStatus, pass: &PassContext) -> Result<()> {
        if !tracker.changed(&status) {
            return Ok(());
        }
        guarded(pass, FUNCTION, Op::UpdateStatus, self.status.update_function_status(key, &status)).await?;
        debug!(function = %key, phase = %status.phase, "status updated");
        Ok(())
    }

    /// Converge all children in order; returns the workload as observed before this pass
    /// touched it (`None` when it was just created).
    async fn converge(
        &self,
        key: &ObjectKey,
        function: &Function,
        tracker: &mut PhaseTracker,
        pass: &PassContext,
    ) -> Result<Option<Deployment>> {
        let mut desired = resolve(key, &function.spec, &self.config.render);
        let oref = bind_children(function, &mut desired)?;
        let DesiredChildren { artifact, network, workload } = desired;

        let artifact = self.converge_artifact(key, function, &oref, artifact, tracker, pass).await?;
        let network = self.converge_network(key, function, &oref, network, tracker, pass).await?;
        let refresh = tracker.resumes_update() || artifact == Applied::Updated || network == Applied::Updated;
        self.converge_workload(key, function, &oref, workload, refresh, pass).await
    }

    async fn converge_artifact(
        &self,
        key: &ObjectKey,
        function: &Function,
        oref: &OwnerReference,
        mut desired: ConfigMap,
        tracker: &mut PhaseTracker,
        pass: &PassContext,
    ) -> Result<Applied> {
        let kind = ChildKind::Artifact;
        let Some(observed) = guarded(pass, kind.resource_kind(), Op::Get, self.store.get_config_map(key)).await? else {
            guarded(pass, kind.resource_kind(), Op::Create, self.store.create_config_map(&desired)).await?;
            self.written(function, key, ChildEvent::created(kind)).await;
            return Ok(Applied::Created);
        };
        check_adoptable(oref, &observed.metadata)?;
        if !drift::artifact(&desired, &observed) {
            return Ok(Applied::Unchanged);
        }
        tracker.mark_update();
        desired.metadata.resource_version = observed.metadata.resource_version;
        guarded(pass, kind.resource_kind(), Op::Update, self.store.update_config_map(&desired)).await?;
        self.written(function, key, ChildEvent::updated(kind)).await;
        Ok(Applied::Updated)
    }

    async fn converge_network(
        &self,
        key: &ObjectKey,
        function: &Function,
        oref: &OwnerReference,
        mut desired: Service,
        tracker: &mut PhaseTracker,
        pass: &PassContext,
    ) -> Result<Applied> {
        let kind = ChildKind::Network;
        let Some(observed) = guarded(pass, kind.resource_kind(), Op::Get, self.store.get_service(key)).await? else {
            guarded(pass, kind.resource_kind(), Op::Create, self.store.create_service(&desired)).await?;
            self.written(function, key, ChildEvent::created(kind)).await;
            return Ok(Applied::Created);
        };
        check_adoptable(oref, &observed.metadata)?;
        if !drift::network(&desired, &observed) {
            return Ok(Applied::Unchanged);
        }
        tracker.mark_update();
        desired.metadata.resource_version = observed.metadata.resource_version;
        // clusterIP is allocated by the API server and immutable
        if let (Some(want), Some(have)) = (desired.spec.as_mut(), observed.spec) {
            want.cluster_ip = have.cluster_ip;
            want.cluster_ips = have.cluster_ips;
        }
        guarded(pass, kind.resource_kind(), Op::Update, self.store.update_service(&desired)).await?;
        self.written(function, key, ChildEvent::updated(kind)).await;
        Ok(Applied::Updated)
    }

    async fn converge_workload(
        &self,
        key: &ObjectKey,
        function: &Function,
        oref: &OwnerReference,
        mut desired: Deployment,
        refresh: bool,
        pass: &PassContext,
    ) -> Result<Option<Deployment>> {
        let kind = ChildKind::Workload;
        let Some(observed) = guarded(pass, kind.resource_kind(), Op::Get, self.store.get_deployment(key)).await? else {
            guarded(pass, kind.resource_kind(), Op::Create, self.store.create_deployment(&desired)).await?;
            self.written(function, key, ChildEvent::created(kind)).await;
            return Ok(None);
        };
        check_adoptable(oref, &observed.metadata)?;
        let reason = if refresh { Some("refresh") } else { drift::workload(&desired, &observed).map(|d| d.as_str()) };
        let Some(reason) = reason else {
            return Ok(Some(observed));
        };
        debug!(function = %key, reason, "workload drifted");
        stamp_restart(&mut desired, &observed, refresh);
        desired.metadata.resource_version = observed.metadata.resource_version.clone();
        guarded(pass, kind.resource_kind(), Op::Update, self.store.update_deployment(&desired)).await?;
        self.written(function, key, ChildEvent::updated(kind)).await;
        Ok(Some(observed))
    }

    /// Metrics and a best-effort event for a child write.
    async fn written(&self, function: &Function, key: &ObjectKey, event: ChildEvent) {
        counter!("child_writes_total", 1u64, "kind" => event.kind.resource_kind(), "op" => event.reason());
        info!(function = %key, kind = %event.kind, action = %event.action, "child written");
        if let Err(e) = self.events.record(function, event).await {
            warn!(function = %key, error = %e, "failed to record event");
        }
    }
}

/// Forced refreshes get a fresh restart stamp so every pod is replaced; other
/// updates keep the live stamp so they do not roll pods by themselves.
fn stamp_restart(desired: &mut Deployment, observed: &Deployment, refresh: bool) {
    let stamp = if refresh {
        Some(chrono::Utc::now().to_rfc3339())
    } else {
        template_annotation(observed, RESTARTED_AT_ANNOTATION).map(str::to_string)
    };
    let Some(stamp) = stamp else { return };
    if let Some(meta) = desired.spec.as_mut().and_then(|s| s.template.metadata.as_mut()) {
        meta.annotations.get_or_insert_with(Default::default).insert(RESTARTED_AT_ANNOTATION.to_string(), stamp);
    }
}
