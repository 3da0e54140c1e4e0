//! Gateway API UDPRoute resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::gateway::GATEWAY_API_GROUP;
use super::types::{Condition, ObjectKey};

/// Specification for a UDPRoute
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1alpha2",
    kind = "UDPRoute",
    root = "UdpRoute",
    plural = "udproutes",
    status = "RouteStatus",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UdpRouteSpec {
    /// Gateways (and optionally listeners) this route attaches to
    #[serde(default)]
    pub parent_refs: Vec<ParentReference>,

    /// Routing rules
    #[serde(default)]
    pub rules: Vec<UdpRouteRule>,
}

/// Reference from a route to a parent gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    /// API group, defaults to the Gateway API group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind, defaults to Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Namespace, defaults to the route namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Gateway name
    pub name: String,
    /// Listener name to attach to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    /// Listener port to attach to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl ParentReference {
    /// Whether this reference names a Gateway
    pub fn is_gateway(&self) -> bool {
        self.group.as_deref().map_or(true, |g| g == GATEWAY_API_GROUP)
            && self.kind.as_deref().map_or(true, |k| k == "Gateway")
    }

    /// Key of the referenced gateway, resolving the namespace against the route
    pub fn gateway_key(&self, route_namespace: &str) -> ObjectKey {
        ObjectKey::namespaced(
            self.namespace.as_deref().unwrap_or(route_namespace),
            self.name.clone(),
        )
    }
}

/// A UDPRoute rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UdpRouteRule {
    /// Backends traffic is relayed to
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

/// Reference to a backend Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// API group, empty for core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind, defaults to Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Service name
    pub name: String,
    /// Service namespace, defaults to the route namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Backend port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Load balancing weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

impl BackendRef {
    /// Whether this reference names a core Service
    pub fn is_service(&self) -> bool {
        self.group.as_deref().map_or(true, str::is_empty)
            && self.kind.as_deref().map_or(true, |k| k == "Service")
    }

    /// Key of the referenced service, resolving the namespace against the route
    pub fn service_key(&self, route_namespace: &str) -> ObjectKey {
        ObjectKey::namespaced(
            self.namespace.as_deref().unwrap_or(route_namespace),
            self.name.clone(),
        )
    }
}

/// Observed state of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    /// Status per parent reference
    #[serde(default)]
    pub parents: Vec<RouteParentStatus>,
}

/// Route status relative to one parent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteParentStatus {
    /// The parent this entry describes
    pub parent_ref: ParentReference,
    /// Controller that wrote this entry
    pub controller_name: String,
    /// Conditions relative to the parent
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl UdpRoute {
    /// Gateways referenced by this route
    pub fn parent_gateways(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        let namespace = self.metadata.namespace.clone().unwrap_or_default();
        self.spec
            .parent_refs
            .iter()
            .filter(|p| p.is_gateway())
            .map(move |p| p.gateway_key(&namespace))
    }

    /// All backend references across rules
    pub fn backend_refs(&self) -> impl Iterator<Item = &BackendRef> {
        self.spec.rules.iter().flat_map(|r| r.backend_refs.iter())
    }
}
