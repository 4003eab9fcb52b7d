use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kfn_core::{Function, ObjectKey};
use kfn_reconcile::{Outcome, PassContext, Reconciler, ReconcilerConfig};
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::{KubeControlPlane, KubeRecorder};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Watch a single namespace; `None` watches all namespaces.
    pub namespace: Option<String>,
    pub reconciler: ReconcilerConfig,
    /// Deadline for the control-plane calls of one pass.
    pub call_timeout: Option<Duration>,
    /// Retry delay after a transient failure.
    pub error_requeue: Duration,
    /// Retry delay after a failure that needs operator attention.
    pub fatal_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            reconciler: ReconcilerConfig::default(),
            call_timeout: Some(Duration::from_secs(30)),
            error_requeue: Duration::from_secs(5),
            fatal_requeue: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("function is missing metadata.name or metadata.namespace")]
    MissingKey,
    #[error(transparent)]
    Reconcile(#[from] kfn_reconcile::Error),
}

impl ControllerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::MissingKey => false,
            ControllerError::Reconcile(e) => e.is_transient(),
        }
    }
}

struct Context {
    reconciler: Reconciler,
    config: ControllerConfig,
}

impl Context {
    fn pass(&self) -> PassContext {
        match self.config.call_timeout {
            Some(t) => PassContext::with_timeout(t),
            None => PassContext::unbounded(),
        }
    }
}

/// Requeue policy for a finished pass.
pub(crate) fn action_for(outcome: &Outcome) -> Action {
    match outcome.requeue_after() {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

pub(crate) fn retry_delay(err: &ControllerError, cfg: &ControllerConfig) -> Duration {
    if err.is_transient() {
        cfg.error_requeue
    } else {
        cfg.fatal_requeue
    }
}

async fn reconcile(function: Arc<Function>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let key = ObjectKey::of(&*function).ok_or(ControllerError::MissingKey)?;
    let outcome = ctx.reconciler.reconcile(&key, &ctx.pass()).await?;
    Ok(action_for(&outcome))
}

fn error_policy(function: Arc<Function>, err: &ControllerError, ctx: Arc<Context>) -> Action {
    let delay = retry_delay(err, &ctx.config);
    let transient = err.is_transient();
    counter!("controller_retries_total", 1u64, "transient" => if transient { "true" } else { "false" });
    if transient {
        warn!(function = %function.name_any(), error = %err, retry_secs = delay.as_secs(), "reconcile failed; retrying");
    } else {
        error!(function = %function.name_any(), error = %err, retry_secs = delay.as_secs(), "reconcile failed; needs attention");
    }
    Action::requeue(delay)
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watch Functions and their owned children, reconciling until SIGINT/SIGTERM.
pub async fn run_controller(client: Client, config: ControllerConfig) -> Result<()> {
    let ns = config.namespace.clone();
    let ns = ns.as_deref();

    let functions: Api<Function> = scoped(&client, ns);
    if let Err(e) = functions.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "cannot list Functions");
        return Err(anyhow!("Function CRD is not queryable ({e}); install it with `kfnctl crd | kubectl apply -f -`"));
    }

    let store = Arc::new(KubeControlPlane::new(client.clone()));
    let events = Arc::new(KubeRecorder::new(client.clone()));
    let reconciler = Reconciler::new(store.clone(), store, events, config.reconciler.clone());
    let ctx = Arc::new(Context { reconciler, config });

    info!(ns = ?ns, "controller started");
    Controller::new(functions, watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns), watcher::Config::default())
        .owns(scoped::<Service>(&client, ns), watcher::Config::default())
        .owns(scoped::<Deployment>(&client, ns), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(function = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
