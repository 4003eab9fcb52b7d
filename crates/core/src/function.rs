use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_REPLICAS, DEFAULT_SERVER_PORT};

/// Desired state of a served function.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kfn.dev",
    version = "v1beta1",
    kind = "Function",
    namespaced,
    status = "FunctionStatus",
    shortname = "fn",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Advisory name for the generated Service. Children are always named after the Function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Port the function server listens on (8080 when unset).
    #[serde(default)]
    pub server_port: i32,

    /// Number of function replicas (1 when unset).
    #[serde(default)]
    pub replicas: i32,

    /// Function source code, served by the runtime image.
    #[serde(default, alias = "function")]
    pub source: String,
}

impl FunctionSpec {
    /// Effective listen port. Every consumer of the port must go through here.
    pub fn effective_port(&self) -> i32 {
        if self.server_port > 0 { self.server_port } else { DEFAULT_SERVER_PORT }
    }

    pub fn effective_replicas(&self) -> i32 {
        if self.replicas > 0 { self.replicas } else { DEFAULT_REPLICAS }
    }
}

/// Externally visible lifecycle phase of a Function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Unset,
    Unavailable,
    Building,
    Available,
    Update,
}

impl Phase {
    pub fn is_unset(&self) -> bool {
        matches!(self, Phase::Unset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Unset => "Unset",
            Phase::Unavailable => "Unavailable",
            Phase::Building => "Building",
            Phase::Available => "Available",
            Phase::Update => "Update",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a Function. Written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    #[serde(default, skip_serializing_if = "Phase::is_unset")]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FunctionStatus {
    pub fn with_phase(phase: Phase) -> Self {
        Self { phase, error_message: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_negative_values_take_defaults() {
        let spec = FunctionSpec { server_port: 0, replicas: 0, ..Default::default() };
        assert_eq!(spec.effective_port(), 8080);
        assert_eq!(spec.effective_replicas(), 1);
        let spec = FunctionSpec { server_port: -3, replicas: -1, ..Default::default() };
        assert_eq!(spec.effective_port(), 8080);
        assert_eq!(spec.effective_replicas(), 1);
        let spec = FunctionSpec { server_port: 9000, replicas: 3, ..Default::default() };
        assert_eq!(spec.effective_port(), 9000);
        assert_eq!(spec.effective_replicas(), 3);
    }

    #[test]
    fn spec_accepts_legacy_function_field() {
        let spec: FunctionSpec = serde_json::from_value(serde_json::json!({
            "service": "test",
            "serverPort": 9000,
            "function": "package handlers"
        }))
        .unwrap();
        assert_eq!(spec.source, "package handlers");
        assert_eq!(spec.server_port, 9000);
        assert_eq!(spec.replicas, 0);
    }

    #[test]
    fn unset_phase_is_omitted_from_status() {
        let json = serde_json::to_value(FunctionStatus::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
        let json = serde_json::to_value(FunctionStatus::with_phase(Phase::Building)).unwrap();
        assert_eq!(json, serde_json::json!({ "phase": "Building" }));
    }
}
