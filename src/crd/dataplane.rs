//! Dataplane Custom Resource Definition
//!
//! A Dataplane is the workload template for TURN relay pods. Gateways pick
//! one through their class's GatewayConfig.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Dataplane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "turngate.dev",
    version = "v1",
    kind = "Dataplane",
    plural = "dataplanes",
    shortname = "dp",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataplaneSpec {
    /// Relay container image
    pub image: String,

    /// Number of relay replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Container entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Container arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Container resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Run relay pods in the host network namespace
    #[serde(default)]
    pub host_network: bool,
}

fn default_replicas() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = Dataplane::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "dataplanes");
    }

    #[test]
    fn test_replicas_default_to_one() {
        let spec: DataplaneSpec =
            serde_json::from_str(r#"{"image": "turngate/relay:1.0"}"#).unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(!spec.host_network);
        assert!(spec.command.is_empty());
    }
}
