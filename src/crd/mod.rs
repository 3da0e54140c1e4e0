//! Resource definitions used by the turngate control plane
//!
//! Gateway API resources (GatewayClass, Gateway, UDPRoute) are modelled
//! locally with only the fields the renderer reads. GatewayConfig and
//! Dataplane are turngate's own CRDs.

mod dataplane;
mod gateway;
mod gateway_config;
mod route;
mod types;

pub use dataplane::{Dataplane, DataplaneSpec};
pub use gateway::{
    AllowedRoutes, FromNamespaces, Gateway, GatewayAddress, GatewayClass, GatewayClassSpec,
    GatewayClassStatus, GatewaySpec, GatewayStatus, GatewayStatusAddress, GatewayTlsConfig,
    Listener, ListenerStatus, ParametersReference, RouteGroupKind, RouteNamespaces,
    SecretObjectReference, GATEWAY_API_GROUP,
};
pub use gateway_config::{GatewayConfig, GatewayConfigSpec, TURNGATE_GROUP};
pub use route::{
    BackendRef, ParentReference, RouteParentStatus, RouteStatus, UdpRoute, UdpRouteRule,
    UdpRouteSpec,
};
pub use types::{
    condition_reasons, condition_types, find_condition, stamp_conditions, Condition,
    ConditionStatus, ObjectKey, ObjectKind, ResourceKey,
};
