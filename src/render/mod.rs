//! Renderer: store snapshot in, configuration and statuses out
//!
//! Rendering is a pure function of a [`Snapshot`]. For every gateway whose
//! class belongs to this controller, [`Renderer::render_gateway`] produces
//! the TURN configuration document the gateway contributes, the workload it
//! needs, and the statuses of the gateway and of every route attached to it.
//! [`Renderer::render_all`] runs that over the whole snapshot and adds
//! GatewayClass statuses plus the merged route statuses.
//!
//! Validation problems never fail a render; they become condition values.
//! An `Err` from `render_gateway` means an internal invariant broke. The
//! sweep records it against the gateway and carries on with the others.

mod address;
mod cluster;
mod listener;
mod route;
mod status;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ControllerConfig, EndpointPolicy};
use crate::crd::{
    condition_reasons as reasons, condition_types as types, Condition, ConditionStatus, Gateway,
    GatewayClass, GatewayClassStatus, GatewayConfig, GatewayStatus, ObjectKey, ResourceKey,
    RouteParentStatus, RouteStatus, UdpRoute, TURNGATE_GROUP,
};
use crate::dataplane::{DataplaneWorkload, GatewayOwner, WorkloadPort, DEFAULT_SERVICE_TYPE};
use crate::document::{ListenerConfig, RenderedConfig};
use crate::store::{Snapshot, Store, StoreChange};
use crate::Error;

pub use status::ResourceStatus;

use listener::{pending_listener_statuses, plan_listeners};
use route::{attach_routes, missing_parent, rejected_parents};

/// How the operator should treat a rendered gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    /// Class accepted; configuration and workload should exist
    Active,
    /// Class missing or not accepted; derived resources must go
    Invalid,
    /// Deletion requested; tear down, then release the finalizer
    Terminating,
}

/// Everything the operator needs to reconcile one gateway
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayRender {
    /// Gateway identity
    pub gateway: ObjectKey,
    /// Lifecycle state
    pub state: GatewayState,
    /// Configuration contributed by the gateway (active gateways only)
    pub config: Option<RenderedConfig>,
    /// Config artifact the contribution goes to (active gateways only)
    pub target: Option<ObjectKey>,
    /// Relay workload, when the gateway is active and its Dataplane exists
    pub workload: Option<DataplaneWorkload>,
    /// Whether the gateway currently carries our finalizer
    pub has_finalizer: bool,
    /// Owner used for references on derived resources
    pub owner: Option<GatewayOwner>,
}

/// Result of rendering one gateway
#[derive(Clone, Debug)]
pub struct GatewayOutput {
    /// What the operator should do with the gateway
    pub render: GatewayRender,
    /// Desired gateway status
    pub status: GatewayStatus,
    /// Our parent entries for routes attached to the gateway
    pub route_parents: Vec<(ObjectKey, RouteParentStatus)>,
}

/// Result of rendering a whole snapshot
#[derive(Clone, Debug, Default)]
pub struct RenderSweep {
    /// Snapshot generation the sweep was computed from
    pub generation: u64,
    /// Every gateway of ours, by key
    pub gateways: BTreeMap<ObjectKey, GatewayRender>,
    /// Desired statuses of classes, gateways and routes
    pub statuses: BTreeMap<ResourceKey, ResourceStatus>,
    /// Gateways whose render hit an internal error
    pub failures: BTreeMap<ObjectKey, String>,
}

/// Outcome of validating a GatewayClass
struct ClassCheck {
    accepted: Condition,
    params: Option<Arc<GatewayConfig>>,
}

/// Turns snapshots into configuration and statuses
#[derive(Clone, Debug)]
pub struct Renderer {
    config: ControllerConfig,
}

impl Renderer {
    /// Create a renderer for the given controller settings
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn is_ours(&self, class: &GatewayClass) -> bool {
        class.spec.controller_name == self.config.controller_name
    }

    fn check_class(&self, snapshot: &Snapshot, class: &GatewayClass) -> ClassCheck {
        let generation = class.metadata.generation;
        let invalid = |message: String| ClassCheck {
            accepted: Condition::new(
                types::ACCEPTED,
                ConditionStatus::False,
                reasons::INVALID_PARAMETERS,
                message,
            )
            .observed(generation),
            params: None,
        };

        let Some(params) = class.spec.parameters_ref.as_ref() else {
            return invalid("parametersRef must name a GatewayConfig".to_string());
        };
        if params.group != TURNGATE_GROUP || params.kind != "GatewayConfig" {
            return invalid(format!(
                "parametersRef must point to {TURNGATE_GROUP}/GatewayConfig, got {}/{}",
                params.group, params.kind
            ));
        }
        let Some(namespace) = params.namespace.as_deref().filter(|ns| !ns.is_empty()) else {
            return invalid("parametersRef must set a namespace".to_string());
        };
        let key = ObjectKey::namespaced(namespace, params.name.clone());
        match snapshot.gateway_config(&key) {
            Some(config) => ClassCheck {
                accepted: Condition::new(
                    types::ACCEPTED,
                    ConditionStatus::True,
                    reasons::ACCEPTED,
                    "gateway class accepted",
                )
                .observed(generation),
                params: Some(config.clone()),
            },
            None => invalid(format!("GatewayConfig {key} not found")),
        }
    }

    fn policy(&self, params: Option<&GatewayConfig>) -> EndpointPolicy {
        self.config.endpoint_policy(params.map(|p| &p.spec))
    }

    /// Render one gateway
    ///
    /// Returns `None` for gateways this controller does not manage.
    #[instrument(skip(self, snapshot), fields(gateway = %key))]
    pub fn render_gateway(
        &self,
        snapshot: &Snapshot,
        key: &ObjectKey,
    ) -> Result<Option<GatewayOutput>, Error> {
        let gateway = snapshot.gateway(key).ok_or_else(|| {
            Error::internal_with_context("render", format!("gateway {key} vanished from snapshot"))
        })?;
        let has_finalizer = gateway.has_finalizer(&self.config.finalizer);
        let class = snapshot.gateway_class(&gateway.spec.gateway_class_name);

        let check = match class {
            Some(class) if !self.is_ours(class) => return Ok(None),
            Some(class) => Some(self.check_class(snapshot, class)),
            // A missing class can only be ours if we already manage the gateway
            None if !has_finalizer => return Ok(None),
            None => None,
        };

        let base = GatewayRender {
            gateway: key.clone(),
            state: GatewayState::Active,
            config: None,
            target: None,
            workload: None,
            has_finalizer,
            owner: GatewayOwner::of(gateway),
        };

        if gateway.is_deleting() {
            let policy = self.policy(check.as_ref().and_then(|c| c.params.as_deref()));
            return Ok(Some(self.terminating(snapshot, key, gateway, base, policy)));
        }

        match check {
            Some(ClassCheck {
                accepted,
                params: Some(params),
            }) if accepted.is_true() => {
                self.active(snapshot, key, gateway, base, &params).map(Some)
            }
            Some(ClassCheck { accepted, .. }) => Ok(Some(self.invalid(
                snapshot,
                key,
                gateway,
                base,
                format!(
                    "gateway class {} is not accepted: {}",
                    gateway.spec.gateway_class_name, accepted.message
                ),
            ))),
            None => Ok(Some(self.invalid(
                snapshot,
                key,
                gateway,
                base,
                format!("gateway class {} not found", gateway.spec.gateway_class_name),
            ))),
        }
    }

    fn active(
        &self,
        snapshot: &Snapshot,
        key: &ObjectKey,
        gateway: &Gateway,
        mut render: GatewayRender,
        params: &GatewayConfig,
    ) -> Result<GatewayOutput, Error> {
        let generation = gateway.metadata.generation;
        let namespace = key.namespace_or_default();
        let policy = self.policy(Some(params));

        let mut plans = plan_listeners(snapshot, key, gateway);
        let controller = &self.config.controller_name;
        let attachments = attach_routes(snapshot, key, &mut plans, controller, policy);
        let address = address::public_address(snapshot, key, gateway);

        let mut listeners = Vec::new();
        let mut ports = BTreeSet::new();
        for plan in plans.iter().filter(|p| p.is_ready()) {
            let (Some(protocol), Some(port)) = (plan.protocol, plan.port) else {
                continue;
            };
            ports.insert(WorkloadPort::new(protocol, port));
            listeners.push(ListenerConfig {
                name: format!("{namespace}/{}/{}", key.name, plan.name),
                protocol,
                port,
                public_address: address.as_ref().map(|a| a.value.clone()),
                public_port: address.as_ref().map(|a| a.public_port(protocol, port)),
                routes: plan.routes.iter().cloned().collect(),
            });
        }

        let mut config = RenderedConfig {
            listeners,
            clusters: attachments.clusters,
        };
        config.normalize();
        check_document(key, &config)?;

        let target_name = params.spec.config_name.clone().unwrap_or_else(|| key.name.clone());
        let target = ObjectKey::namespaced(namespace, target_name);
        let dataplane_name = params
            .spec
            .dataplane
            .clone()
            .unwrap_or_else(|| self.config.default_dataplane.clone());
        let dataplane = snapshot.dataplane(&dataplane_name);

        let programmed = match (&dataplane, &address) {
            (None, _) => Condition::new(
                types::PROGRAMMED,
                ConditionStatus::False,
                reasons::INVALID,
                format!("dataplane {dataplane_name} not found"),
            ),
            (Some(_), None) => Condition::new(
                types::PROGRAMMED,
                ConditionStatus::False,
                reasons::ADDRESS_NOT_ASSIGNED,
                "no public address assigned yet",
            ),
            (Some(_), Some(a)) => Condition::new(
                types::PROGRAMMED,
                ConditionStatus::True,
                reasons::PROGRAMMED,
                format!("gateway programmed at {}", a.value),
            ),
        }
        .observed(generation);

        render.workload = dataplane.map(|dp| DataplaneWorkload {
            gateway: key.clone(),
            owner: render.owner.clone(),
            dataplane: dataplane_name.clone(),
            spec: dp.spec.clone(),
            ports: ports.into_iter().collect(),
            service_type: params
                .spec
                .service_type
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            config_name: target.name.clone(),
            realm: params.spec.realm.clone(),
        });
        render.config = Some(config);
        render.target = Some(target);

        let status = GatewayStatus {
            addresses: address.iter().map(|a| a.status_address()).collect(),
            conditions: vec![
                Condition::new(
                    types::ACCEPTED,
                    ConditionStatus::True,
                    reasons::ACCEPTED,
                    "gateway accepted",
                )
                .observed(generation),
                programmed,
            ],
            listeners: plans.iter().map(|p| p.status()).collect(),
        };

        debug!(
            listeners = render.config.as_ref().map_or(0, |c| c.listeners.len()),
            routes = attachments.parents.len(),
            "Rendered gateway"
        );
        Ok(GatewayOutput {
            render,
            status,
            route_parents: attachments.parents,
        })
    }

    fn invalid(
        &self,
        snapshot: &Snapshot,
        key: &ObjectKey,
        gateway: &Gateway,
        mut render: GatewayRender,
        message: String,
    ) -> GatewayOutput {
        let generation = gateway.metadata.generation;
        render.state = GatewayState::Invalid;
        let status = GatewayStatus {
            addresses: vec![],
            conditions: vec![
                Condition::new(
                    types::ACCEPTED,
                    ConditionStatus::False,
                    reasons::INVALID_GATEWAY_CLASS,
                    message.clone(),
                )
                .observed(generation),
                Condition::new(
                    types::PROGRAMMED,
                    ConditionStatus::Unknown,
                    reasons::PENDING,
                    "waiting for a valid gateway class",
                )
                .observed(generation),
            ],
            listeners: pending_listener_statuses(gateway, "gateway is not accepted"),
        };
        let route_parents = rejected_parents(
            snapshot,
            key,
            &self.config.controller_name,
            self.policy(None),
            reasons::NO_MATCHING_PARENT,
            &message,
            false,
        );
        GatewayOutput {
            render,
            status,
            route_parents,
        }
    }

    fn terminating(
        &self,
        snapshot: &Snapshot,
        key: &ObjectKey,
        gateway: &Gateway,
        mut render: GatewayRender,
        policy: EndpointPolicy,
    ) -> GatewayOutput {
        let generation = gateway.metadata.generation;
        let message = "gateway is being deleted";
        render.state = GatewayState::Terminating;
        let status = GatewayStatus {
            addresses: vec![],
            conditions: vec![
                Condition::new(types::ACCEPTED, ConditionStatus::Unknown, reasons::PENDING, message)
                    .observed(generation),
                Condition::new(types::PROGRAMMED, ConditionStatus::False, reasons::PENDING, message)
                    .observed(generation),
            ],
            listeners: pending_listener_statuses(gateway, message),
        };
        let route_parents = rejected_parents(
            snapshot,
            key,
            &self.config.controller_name,
            policy,
            reasons::PENDING,
            message,
            true,
        );
        GatewayOutput {
            render,
            status,
            route_parents,
        }
    }

    /// Render every class, gateway and route in a snapshot
    #[instrument(skip_all, fields(generation = snapshot.generation()))]
    pub fn render_all(&self, snapshot: &Snapshot) -> RenderSweep {
        let mut sweep = RenderSweep {
            generation: snapshot.generation(),
            ..Default::default()
        };

        for class in snapshot.gateway_classes().filter(|c| self.is_ours(c)) {
            let check = self.check_class(snapshot, class);
            sweep.statuses.insert(
                ResourceKey::gateway_class(class.metadata.name.clone().unwrap_or_default()),
                ResourceStatus::GatewayClass(GatewayClassStatus {
                    conditions: vec![check.accepted],
                }),
            );
        }

        let mut parents: BTreeMap<ObjectKey, Vec<RouteParentStatus>> = BTreeMap::new();
        for (key, _) in snapshot.gateways() {
            match self.render_gateway(snapshot, key) {
                Ok(Some(output)) => {
                    sweep.statuses.insert(
                        ResourceKey::gateway(key.clone()),
                        ResourceStatus::Gateway(output.status),
                    );
                    for (route, parent) in output.route_parents {
                        parents.entry(route).or_default().push(parent);
                    }
                    sweep.gateways.insert(key.clone(), output.render);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        gateway = %key,
                        error = %e,
                        "Gateway render failed, keeping previous state"
                    );
                    sweep.failures.insert(key.clone(), e.to_string());
                }
            }
        }

        for (route_key, route) in snapshot.udp_routes() {
            let status =
                self.route_status(snapshot, route_key, route, &mut parents, &sweep.failures);
            if let Some(status) = status {
                sweep.statuses.insert(
                    ResourceKey::udp_route(route_key.clone()),
                    ResourceStatus::UdpRoute(status),
                );
            }
        }

        debug!(
            gateways = sweep.gateways.len(),
            statuses = sweep.statuses.len(),
            failures = sweep.failures.len(),
            "Render sweep complete"
        );
        sweep
    }

    fn route_status(
        &self,
        snapshot: &Snapshot,
        route_key: &ObjectKey,
        route: &UdpRoute,
        parents: &mut BTreeMap<ObjectKey, Vec<RouteParentStatus>>,
        failures: &BTreeMap<ObjectKey, String>,
    ) -> Option<RouteStatus> {
        let namespace = route_key.namespace_or_default();
        if route.parent_gateways().any(|gw| failures.contains_key(&gw)) {
            return None;
        }

        let controller = &self.config.controller_name;
        let mut ours = parents.remove(route_key).unwrap_or_default();
        let previously_ours = route
            .status
            .as_ref()
            .is_some_and(|s| s.parents.iter().any(|p| p.controller_name == *controller));

        if !ours.is_empty() || previously_ours {
            let mut seen = BTreeSet::new();
            for parent in route.spec.parent_refs.iter().filter(|p| p.is_gateway()) {
                let missing = snapshot.gateway(&parent.gateway_key(namespace)).is_none();
                if missing && seen.insert(parent.clone()) {
                    ours.push(missing_parent(parent, controller, route.metadata.generation));
                }
            }
        }

        if ours.is_empty() && !previously_ours {
            return None;
        }
        Some(RouteStatus { parents: ours })
    }

    /// Render on every store change until cancelled
    ///
    /// Pending triggers are drained before each render so a burst of
    /// changes costs one sweep. Sweeps go out in generation order.
    pub async fn run(
        self,
        store: Arc<Store>,
        mut triggers: mpsc::Receiver<StoreChange>,
        sweeps: mpsc::Sender<RenderSweep>,
        token: CancellationToken,
    ) {
        info!("Renderer started");
        let mut rendered: Option<u64> = None;
        let mut pending = store.snapshot().generation() > 0;

        loop {
            if !pending {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = triggers.recv() => match change {
                        Some(change) => debug!(
                            generation = change.generation,
                            resource = %change.resource,
                            "Render triggered"
                        ),
                        None => break,
                    },
                }
            }
            pending = false;
            while triggers.try_recv().is_ok() {}

            let snapshot = store.snapshot();
            if rendered == Some(snapshot.generation()) {
                continue;
            }
            let sweep = self.render_all(&snapshot);
            rendered = Some(sweep.generation);

            tokio::select! {
                _ = token.cancelled() => break,
                sent = sweeps.send(sweep) => {
                    if sent.is_err() {
                        debug!("Sweep channel closed");
                        break;
                    }
                }
            }
        }
        info!("Renderer stopped");
    }
}

/// Listener names are unique and every listener route names a cluster
fn check_document(key: &ObjectKey, config: &RenderedConfig) -> Result<(), Error> {
    let clusters: BTreeSet<&str> = config.clusters.iter().map(|c| c.name.as_str()).collect();
    let mut names = BTreeSet::new();
    for listener in &config.listeners {
        if !names.insert(listener.name.as_str()) {
            return Err(Error::internal_with_context(
                "render",
                format!("gateway {key} rendered listener {} twice", listener.name),
            ));
        }
        if let Some(route) = listener.routes.iter().find(|r| !clusters.contains(r.as_str())) {
            return Err(Error::internal_with_context(
                "render",
                format!("listener {} references unknown cluster {route}", listener.name),
            ));
        }
    }
    Ok(())
}
