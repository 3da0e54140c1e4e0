//! Shared types used across turngate resources
//!
//! Object keys, resource kinds and Kubernetes-style conditions. The
//! condition vocabulary follows the Gateway API so relay operators can read
//! statuses with the same tooling they use for other gateway controllers.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identity of a stored object: optional namespace plus name
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of any kube resource
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// Namespace or the empty string for cluster-scoped keys
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Kinds of objects the control plane stores
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// gateway.networking.k8s.io GatewayClass
    GatewayClass,
    /// turngate.dev GatewayConfig
    GatewayConfig,
    /// gateway.networking.k8s.io Gateway
    Gateway,
    /// gateway.networking.k8s.io UDPRoute
    UdpRoute,
    /// core Service
    Service,
    /// discovery EndpointSlice
    EndpointSlice,
    /// core Secret
    Secret,
    /// core Node
    Node,
    /// turngate.dev Dataplane
    Dataplane,
}

impl ObjectKind {
    /// Every kind, in watch start order
    pub const ALL: [ObjectKind; 9] = [
        ObjectKind::GatewayClass,
        ObjectKind::GatewayConfig,
        ObjectKind::Gateway,
        ObjectKind::UdpRoute,
        ObjectKind::Service,
        ObjectKind::EndpointSlice,
        ObjectKind::Secret,
        ObjectKind::Node,
        ObjectKind::Dataplane,
    ];

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(self) -> bool {
        !matches!(
            self,
            ObjectKind::GatewayClass | ObjectKind::Node | ObjectKind::Dataplane
        )
    }

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::GatewayClass => "GatewayClass",
            ObjectKind::GatewayConfig => "GatewayConfig",
            ObjectKind::Gateway => "Gateway",
            ObjectKind::UdpRoute => "UDPRoute",
            ObjectKind::Service => "Service",
            ObjectKind::EndpointSlice => "EndpointSlice",
            ObjectKind::Secret => "Secret",
            ObjectKind::Node => "Node",
            ObjectKind::Dataplane => "Dataplane",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-qualified object key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Object kind
    pub kind: ObjectKind,
    /// Object identity within the kind
    pub key: ObjectKey,
}

impl ResourceKey {
    /// Build a resource key
    pub fn new(kind: ObjectKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }

    /// Key of a Gateway
    pub fn gateway(key: ObjectKey) -> Self {
        Self::new(ObjectKind::Gateway, key)
    }

    /// Key of a UDPRoute
    pub fn udp_route(key: ObjectKey) -> Self {
        Self::new(ObjectKind::UdpRoute, key)
    }

    /// Key of a GatewayClass
    pub fn gateway_class(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::GatewayClass, ObjectKey::cluster(name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// The renderer produces conditions without a transition time. The status
/// updater stamps `last_transition_time` when it writes them, keeping the
/// previous timestamp when the status value did not change.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Accepted, Programmed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new, unstamped condition
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    /// Attach the observed generation
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Whether the condition is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Stamp transition times onto freshly rendered conditions
///
/// A condition whose status matches the previous condition of the same type
/// keeps the previous timestamp. Anything else transitions at `now`.
pub fn stamp_conditions(conditions: &mut [Condition], previous: &[Condition], now: DateTime<Utc>) {
    for condition in conditions.iter_mut() {
        let carried = find_condition(previous, &condition.type_)
            .filter(|prev| prev.status == condition.status)
            .and_then(|prev| prev.last_transition_time);
        condition.last_transition_time = Some(carried.unwrap_or(now));
    }
}

/// Condition types used on gateway resources
pub mod condition_types {
    /// Resource was accepted by the controller
    pub const ACCEPTED: &str = "Accepted";
    /// Gateway configuration was delivered to the dataplane
    pub const PROGRAMMED: &str = "Programmed";
    /// All references were resolved
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    /// Listener conflicts with another listener
    pub const CONFLICTED: &str = "Conflicted";
}

/// Condition reasons used on gateway resources
pub mod condition_reasons {
    /// Positive Accepted
    pub const ACCEPTED: &str = "Accepted";
    /// Positive Programmed
    pub const PROGRAMMED: &str = "Programmed";
    /// Positive ResolvedRefs
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    /// Listener has no conflicts
    pub const NO_CONFLICTS: &str = "NoConflicts";
    /// Waiting on something, or being torn down
    pub const PENDING: &str = "Pending";
    /// Generic invalid input
    pub const INVALID: &str = "Invalid";
    /// Gateway class is missing or not accepted
    pub const INVALID_GATEWAY_CLASS: &str = "InvalidGatewayClass";
    /// Class parameters reference does not resolve
    pub const INVALID_PARAMETERS: &str = "InvalidParameters";
    /// Listener protocol not supported
    pub const UNSUPPORTED_PROTOCOL: &str = "UnsupportedProtocol";
    /// Listener port not usable
    pub const PORT_UNAVAILABLE: &str = "PortUnavailable";
    /// Listener shares port and transport with another
    pub const PROTOCOL_CONFLICT: &str = "ProtocolConflict";
    /// Several listeners of a gateway share one name
    pub const LISTENER_NAME_CONFLICT: &str = "ListenerNameConflict";
    /// TLS certificate reference does not resolve
    pub const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
    /// Listener allows no supported route kind
    pub const INVALID_ROUTE_KINDS: &str = "InvalidRouteKinds";
    /// No public address could be found
    pub const ADDRESS_NOT_ASSIGNED: &str = "AddressNotAssigned";
    /// Route parent does not exist or has no matching listener
    pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";
    /// Listener does not admit the route
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    /// Backend reference does not resolve
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
    /// Reference kind not supported
    pub const INVALID_KIND: &str = "InvalidKind";
    /// Value rejected by the controller
    pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";
}
