//! GatewayConfig Custom Resource Definition
//!
//! A GatewayConfig is the parameters object of a turngate GatewayClass. It
//! carries the settings shared by every gateway of the class: the TURN
//! realm, which dataplane template to run, and how backend endpoints are
//! discovered.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of turngate resources
pub const TURNGATE_GROUP: &str = "turngate.dev";

/// Specification for a GatewayConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "turngate.dev",
    version = "v1",
    kind = "GatewayConfig",
    plural = "gatewayconfigs",
    shortname = "gwconf",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Realm","type":"string","jsonPath":".spec.realm"}"#,
    printcolumn = r#"{"name":"Dataplane","type":"string","jsonPath":".spec.dataplane"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigSpec {
    /// TURN realm announced by relays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    /// Name of the Dataplane used for gateway workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataplane: Option<String>,

    /// Add ready EndpointSlice addresses of backends to clusters.
    /// Falls back to the controller-wide default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_discovery: Option<bool>,

    /// Add backend cluster IPs to clusters.
    /// Falls back to the controller-wide default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_to_cluster_ip: Option<bool>,

    /// Name of the config artifact gateways of this class write to.
    /// Defaults to one artifact per gateway, named after the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,

    /// Service type of the gateway workload (LoadBalancer, NodePort, ClusterIP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}
