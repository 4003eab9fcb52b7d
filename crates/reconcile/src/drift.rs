//! Kind-specific drift predicates. Only the fields listed here are compared;
//! everything else on the live objects belongs to the API server or to other actors.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kfn_core::SOURCE_HASH_ANNOTATION;
use kfn_render::{service_port, template_annotation, workload_port_env, workload_replicas};

/// Payload content differs.
pub fn artifact(desired: &ConfigMap, observed: &ConfigMap) -> bool {
    desired.data != observed.data
}

/// Listen port differs. A Service without ports has drifted.
pub fn network(desired: &Service, observed: &Service) -> bool {
    match service_port(observed) {
        Some(have) => service_port(desired) != Some(have),
        None => true,
    }
}

/// Why a workload needs an update, if it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadDrift {
    Replicas,
    Port,
    Source,
}

impl WorkloadDrift {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadDrift::Replicas => "replicas",
            WorkloadDrift::Port => "port",
            WorkloadDrift::Source => "source",
        }
    }
}

pub fn workload(desired: &Deployment, observed: &Deployment) -> Option<WorkloadDrift> {
    if workload_replicas(desired) != workload_replicas(observed) {
        return Some(WorkloadDrift::Replicas);
    }
    match (workload_port_env(desired), workload_port_env(observed)) {
        (Some(want), Some(have)) if want == have => {}
        _ => return Some(WorkloadDrift::Port),
    }
    if template_annotation(desired, SOURCE_HASH_ANNOTATION) != template_annotation(observed, SOURCE_HASH_ANNOTATION) {
        return Some(WorkloadDrift::Source);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;
    use kfn_core::{FunctionSpec, ObjectKey};
    use kfn_render::{resolve, DesiredChildren, RenderConfig};

    fn desired(port: i32, replicas: i32, source: &str) -> DesiredChildren {
        let spec = FunctionSpec { server_port: port, replicas, source: source.into(), ..Default::default() };
        resolve(&ObjectKey::new("default", "fn"), &spec, &RenderConfig::default())
    }

    #[test]
    fn artifact_compares_payload_only() {
        let a = desired(0, 0, "v1").artifact;
        let mut b = a.clone();
        b.metadata.annotations = None;
        b.metadata.labels = Some([("team".to_string(), "x".to_string())].into());
        assert!(!artifact(&a, &b));
        assert!(artifact(&a, &desired(0, 0, "v2").artifact));
        b.data = None;
        assert!(artifact(&a, &b));
    }

    #[test]
    fn network_compares_port_only() {
        let a = desired(9000, 1, "v1").network;
        let mut b = desired(9000, 1, "other").network;
        b.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.1".into());
        assert!(!network(&a, &b));
        assert!(network(&a, &desired(9001, 1, "v1").network));
        b.spec.as_mut().unwrap().ports = None;
        assert!(network(&a, &b));
    }

    #[test]
    fn workload_reports_first_drift_reason() {
        let a = desired(9000, 2, "v1").workload;
        assert_eq!(workload(&a, &a.clone()), None);
        assert_eq!(workload(&a, &desired(9000, 3, "v1").workload), Some(WorkloadDrift::Replicas));
        assert_eq!(workload(&a, &desired(9001, 2, "v1").workload), Some(WorkloadDrift::Port));
        assert_eq!(workload(&a, &desired(9000, 2, "v2").workload), Some(WorkloadDrift::Source));
    }

    #[test]
    fn missing_port_env_is_drift() {
        let a = desired(9000, 1, "v1").workload;
        let mut b = a.clone();
        let pod = b.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].env = Some(vec![EnvVar { name: "OTHER".into(), value: Some("1".into()), value_from: None }]);
        assert_eq!(workload(&a, &b), Some(WorkloadDrift::Port));
        assert_eq!(workload_port_env(&a), Some("9000"));
    }
}
