//! Gateway API GatewayClass and Gateway resources
//!
//! Only the fields the TURN control plane reads are modelled. Unknown fields
//! are ignored on deserialization so newer Gateway API releases still decode.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// API group of the Gateway API
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// Specification for a GatewayClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "GatewayClass",
    plural = "gatewayclasses",
    status = "GatewayClassStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayClassSpec {
    /// Controller that manages gateways of this class
    pub controller_name: String,

    /// Reference to the GatewayConfig holding class-wide settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_ref: Option<ParametersReference>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Reference from a GatewayClass to its parameters object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersReference {
    /// API group of the referent
    pub group: String,
    /// Kind of the referent
    pub kind: String,
    /// Name of the referent
    pub name: String,
    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Observed state of a GatewayClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayClassStatus {
    /// Class conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Specification for a Gateway
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    plural = "gateways",
    status = "GatewayStatus",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Name of the GatewayClass this gateway belongs to
    pub gateway_class_name: String,

    /// Listener configurations
    #[serde(default)]
    pub listeners: Vec<Listener>,

    /// Requested public addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<GatewayAddress>,
}

/// A listener on a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    /// Listener name, unique within the gateway
    pub name: String,

    /// Protocol name (TURN-UDP, TURN-TCP, TURN-TLS, TURN-DTLS or the bare transport)
    pub protocol: String,

    /// Listening port
    pub port: i32,

    /// Hostname; unused by TURN but accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// TLS settings for TURN-TLS and TURN-DTLS listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayTlsConfig>,

    /// Which routes may attach to this listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_routes: Option<AllowedRoutes>,
}

/// TLS configuration of a listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTlsConfig {
    /// TLS mode (Terminate)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Certificate secrets
    #[serde(default)]
    pub certificate_refs: Vec<SecretObjectReference>,
}

/// Reference to a Secret holding a certificate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjectReference {
    /// API group, empty for core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind, defaults to Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Secret name
    pub name: String,
    /// Secret namespace, defaults to the gateway namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Route admission rules of a listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoutes {
    /// Namespaces routes may come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<RouteNamespaces>,

    /// Route kinds that may attach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<RouteGroupKind>,
}

/// Namespace restriction of a listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteNamespaces {
    /// Namespace selection mode, defaults to Same
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<FromNamespaces>,
}

/// Namespace selection modes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FromNamespaces {
    /// Routes from any namespace
    All,
    /// Routes from the gateway namespace only
    #[default]
    Same,
    /// Label selector; not supported, treated as admitting nothing
    Selector,
}

/// Group and kind of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupKind {
    /// API group, defaults to the Gateway API group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Route kind
    pub kind: String,
}

impl RouteGroupKind {
    /// The UDPRoute kind
    pub fn udp_route() -> Self {
        Self {
            group: Some(GATEWAY_API_GROUP.to_string()),
            kind: "UDPRoute".to_string(),
        }
    }

    /// Whether this names the UDPRoute kind
    pub fn is_udp_route(&self) -> bool {
        self.kind == "UDPRoute"
            && self
                .group
                .as_deref()
                .map_or(true, |g| g == GATEWAY_API_GROUP)
    }
}

/// Address requested in a Gateway spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAddress {
    /// Address type (IPAddress or Hostname)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Address value
    pub value: String,
}

/// Observed state of a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Addresses the gateway is reachable at
    #[serde(default)]
    pub addresses: Vec<GatewayStatusAddress>,

    /// Gateway conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per-listener status
    #[serde(default)]
    pub listeners: Vec<ListenerStatus>,
}

/// Address reported in gateway status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatusAddress {
    /// Address type (IPAddress or Hostname)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Address value
    pub value: String,
}

/// Status of one listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    /// Listener name
    pub name: String,
    /// Number of routes attached to the listener
    pub attached_routes: i32,
    /// Route kinds the listener supports
    #[serde(default)]
    pub supported_kinds: Vec<RouteGroupKind>,
    /// Listener conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Gateway {
    /// Whether the gateway is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the gateway carries the given finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
