//! kfn render: pure mapping from a `Function` to the three child resources it owns,
//! plus the owner-reference binding that ties those children to their parent.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kfn_core::{fingerprint, FunctionSpec, ObjectKey, APP_LABEL, HANDLER_KEY, HASH_ANNOTATION, PORT_ENV, SOURCE_HASH_ANNOTATION};
use serde::{Deserialize, Serialize};

mod owner;

pub use owner::{bind_children, bind_owner, check_adoptable, controller_ref, OwnershipError};

pub const BUILDER_CONTAINER: &str = "builder";
pub const SERVER_CONTAINER: &str = "server";
pub const SERVICE_PORT_NAME: &str = "http";

const BUILD_VOLUME: &str = "build";
const HANDLER_VOLUME: &str = "handler";

/// Images and pull policy for the generated workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    pub builder_image: String,
    pub server_image: String,
    pub image_pull_policy: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            builder_image: "ghcr.io/hooksie1/goless-builder".to_string(),
            server_image: "ghcr.io/hooksie1/goless-server".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
        }
    }
}

/// Target shape of every child owned by one Function.
#[derive(Debug, Clone)]
pub struct DesiredChildren {
    pub artifact: ConfigMap,
    pub network: Service,
    pub workload: Deployment,
}

/// Resolve the desired children for `key`. Pure and total.
pub fn resolve(key: &ObjectKey, spec: &FunctionSpec, cfg: &RenderConfig) -> DesiredChildren {
    let port = spec.effective_port();
    let hash = fingerprint(&spec.source).into_string();
    DesiredChildren {
        artifact: artifact(key, &spec.source, &hash),
        network: network(key, port, &hash),
        workload: workload(key, port, spec.effective_replicas(), &hash, cfg),
    }
}

fn child_meta(key: &ObjectKey, annotations: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        annotations,
        ..Default::default()
    }
}

fn app_labels(key: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), key.name.clone())])
}

fn hash_annotations(hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(HASH_ANNOTATION.to_string(), hash.to_string())])
}

fn artifact(key: &ObjectKey, source: &str, hash: &str) -> ConfigMap {
    ConfigMap {
        metadata: child_meta(key, Some(hash_annotations(hash))),
        data: Some(BTreeMap::from([(HANDLER_KEY.to_string(), source.to_string())])),
        ..Default::default()
    }
}

fn network(key: &ObjectKey, port: i32, hash: &str) -> Service {
    Service {
        metadata: child_meta(key, Some(hash_annotations(hash))),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(SERVICE_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            selector: Some(app_labels(key)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

fn workload(key: &ObjectKey, port: i32, replicas: i32, hash: &str, cfg: &RenderConfig) -> Deployment {
    let labels = app_labels(key);
    let builder = Container {
        name: BUILDER_CONTAINER.to_string(),
        image: Some(cfg.builder_image.clone()),
        image_pull_policy: Some(cfg.image_pull_policy.clone()),
        volume_mounts: Some(vec![mount(BUILD_VOLUME, "/server"), mount(HANDLER_VOLUME, "/handlers")]),
        ..Default::default()
    };
    let server = Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(cfg.server_image.clone()),
        image_pull_policy: Some(cfg.image_pull_policy.clone()),
        env: Some(vec![EnvVar { name: PORT_ENV.to_string(), value: Some(port.to_string()), value_from: None }]),
        volume_mounts: Some(vec![mount(BUILD_VOLUME, "/server")]),
        ..Default::default()
    };
    let volumes = vec![
        Volume {
            name: HANDLER_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource { name: Some(key.name.clone()), ..Default::default() }),
            ..Default::default()
        },
        Volume { name: BUILD_VOLUME.to_string(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() },
    ];
    Deployment {
        metadata: child_meta(key, None),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(key.name.clone()),
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(SOURCE_HASH_ANNOTATION.to_string(), hash.to_string())])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![builder]),
                    containers: vec![server],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Listen port carried by the `http` Service port (first entry when none is named).
pub fn service_port(svc: &Service) -> Option<i32> {
    let ports = svc.spec.as_ref()?.ports.as_ref()?;
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(SERVICE_PORT_NAME))
        .or_else(|| ports.first())
        .map(|p| p.port)
}

/// Value of the listen-port env var on the server container.
pub fn workload_port_env(dep: &Deployment) -> Option<&str> {
    let pod = dep.spec.as_ref()?.template.spec.as_ref()?;
    pod.containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == PORT_ENV)?
        .value
        .as_deref()
}

pub fn workload_replicas(dep: &Deployment) -> Option<i32> {
    dep.spec.as_ref()?.replicas
}

/// Annotation value on the pod template.
pub fn template_annotation<'a>(dep: &'a Deployment, name: &str) -> Option<&'a str> {
    dep.spec.as_ref()?.template.metadata.as_ref()?.annotations.as_ref()?.get(name).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new("default", "test-function")
    }

    fn spec(port: i32, replicas: i32) -> FunctionSpec {
        FunctionSpec { service: Some("test".into()), server_port: port, replicas, source: "package handlers\n".into() }
    }

    #[test]
    fn default_port_is_shared_by_service_and_env() {
        let d = resolve(&key(), &spec(0, 2), &RenderConfig::default());
        let svc_port = service_port(&d.network).unwrap();
        assert_eq!(svc_port, 8080);
        let svc = d.network.spec.as_ref().unwrap();
        assert_eq!(svc.ports.as_ref().unwrap()[0].target_port, Some(IntOrString::Int(8080)));
        assert_eq!(workload_port_env(&d.workload), Some("8080"));
    }

    #[test]
    fn default_replicas_is_one() {
        let d = resolve(&key(), &spec(9000, 0), &RenderConfig::default());
        assert_eq!(workload_replicas(&d.workload), Some(1));
        let d = resolve(&key(), &spec(9000, 4), &RenderConfig::default());
        assert_eq!(workload_replicas(&d.workload), Some(4));
    }

    #[test]
    fn children_share_identity_and_fingerprint() {
        let s = spec(9000, 0);
        let d = resolve(&key(), &s, &RenderConfig::default());
        let hash = fingerprint(&s.source).into_string();

        for meta in [&d.artifact.metadata, &d.network.metadata, &d.workload.metadata] {
            assert_eq!(meta.name.as_deref(), Some("test-function"));
            assert_eq!(meta.namespace.as_deref(), Some("default"));
        }
        let cm_hash = d.artifact.metadata.annotations.as_ref().unwrap().get(HASH_ANNOTATION);
        assert_eq!(cm_hash, Some(&hash));
        let svc_hash = d.network.metadata.annotations.as_ref().unwrap().get(HASH_ANNOTATION);
        assert_eq!(svc_hash, Some(&hash));
        assert_eq!(template_annotation(&d.workload, SOURCE_HASH_ANNOTATION), Some(hash.as_str()));
        assert_eq!(d.artifact.data.as_ref().unwrap().get(HANDLER_KEY).map(String::as_str), Some("package handlers\n"));
    }

    #[test]
    fn workload_mounts_artifact_and_selects_by_app_label() {
        let d = resolve(&key(), &spec(9000, 1), &RenderConfig::default());
        let dep = d.workload.spec.as_ref().unwrap();
        let pod = dep.template.spec.as_ref().unwrap();
        let handler = pod.volumes.as_ref().unwrap().iter().find(|v| v.name == "handler").unwrap();
        assert_eq!(handler.config_map.as_ref().unwrap().name.as_deref(), Some("test-function"));
        assert_eq!(pod.init_containers.as_ref().unwrap()[0].name, BUILDER_CONTAINER);
        assert_eq!(pod.init_containers.as_ref().unwrap()[0].image.as_deref(), Some("ghcr.io/hooksie1/goless-builder"));

        let match_labels = dep.selector.match_labels.as_ref().unwrap();
        assert_eq!(match_labels.get(APP_LABEL).map(String::as_str), Some("test-function"));
        let selector = d.network.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(selector, match_labels);
    }

    #[test]
    fn resolve_is_deterministic() {
        let s = spec(7000, 3);
        let a = serde_json::to_value(resolve(&key(), &s, &RenderConfig::default()).workload).unwrap();
        let b = serde_json::to_value(resolve(&key(), &s, &RenderConfig::default()).workload).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn service_port_prefers_named_http_entry() {
        let mut svc = resolve(&key(), &spec(9000, 1), &RenderConfig::default()).network;
        let ports = svc.spec.as_mut().unwrap().ports.as_mut().unwrap();
        ports.insert(0, ServicePort { name: Some("metrics".into()), port: 9100, ..Default::default() });
        assert_eq!(service_port(&svc), Some(9000));
        svc.spec.as_mut().unwrap().ports = Some(vec![]);
        assert_eq!(service_port(&svc), None);
    }
}
