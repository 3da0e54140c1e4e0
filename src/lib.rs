//! Turngate - Gateway API control plane for TURN relay fleets
//!
//! Turngate watches Gateway API resources (GatewayClass, Gateway, UDPRoute)
//! together with the Services, EndpointSlices, Secrets and Nodes they refer
//! to, renders them into TURN relay configuration, and streams that
//! configuration to relay instances.
//!
//! # Architecture
//!
//! The control plane is a pipeline of single-purpose stages connected by
//! bounded channels:
//!
//! - The [`store`] holds the last observed version of every watched object
//!   and signals the renderer whenever something changes
//! - The [`render`]er turns a store snapshot into per-gateway configuration
//!   documents plus the status conditions every resource should carry
//! - The [`operator`] creates and deletes the derived relay workload and
//!   config artifacts, guarded by a finalizer on each gateway
//! - The [`updater`] writes status conditions back with optimistic concurrency
//! - The [`distribution`] service fans configuration out to relay subscribers
//!
//! # Modules
//!
//! - [`crd`] - Resource definitions (Gateway API types, GatewayConfig, Dataplane)
//! - [`document`] - The rendered TURN configuration document
//! - [`dataplane`] - Relay workload descriptors and their Kubernetes manifests
//! - [`pipeline`] - Wiring of the stages into running tasks
//! - [`watch`] - Kubernetes watchers feeding the store
//! - [`client`] - Kubernetes-backed implementations of the operator and updater clients
//! - [`config`] - Controller configuration
//! - [`retry`] - Backoff and conflict retry helpers
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod crd;
pub mod dataplane;
pub mod distribution;
pub mod document;
pub mod error;
pub mod operator;
pub mod pipeline;
pub mod render;
pub mod retry;
pub mod store;
pub mod updater;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Controller name turngate GatewayClasses must carry
pub const DEFAULT_CONTROLLER_NAME: &str = "turngate.dev/gateway-operator";

/// Finalizer placed on every managed gateway before derived resources exist
pub const GATEWAY_FINALIZER: &str = "turngate.dev/gateway-finalizer";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "turngate-operator";

/// Dataplane used when a GatewayConfig names none
pub const DEFAULT_DATAPLANE: &str = "default";

/// Default port of the config distribution server
pub const DEFAULT_DISTRIBUTION_PORT: u16 = 13478;

/// Key of the rendered document inside config artifact ConfigMaps
pub const CONFIG_DATA_KEY: &str = "turngate.conf";

/// Label naming the gateway a derived resource belongs to
pub const LABEL_GATEWAY: &str = "turngate.dev/gateway";

/// Label naming the gateway namespace a derived resource belongs to
pub const LABEL_GATEWAY_NAMESPACE: &str = "turngate.dev/gateway-namespace";

/// Standard managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on derived resources
pub const LABEL_MANAGED_BY_VALUE: &str = "turngate";

/// Label linking an EndpointSlice to its Service
pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
