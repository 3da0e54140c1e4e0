//! Route attachment: binding UDPRoutes to gateway listeners

use std::collections::BTreeSet;

use crate::config::EndpointPolicy;
use crate::crd::{
    condition_reasons as reasons, condition_types as types, Condition, ConditionStatus, ObjectKey,
    ParentReference, RouteParentStatus,
};
use crate::document::ClusterConfig;
use crate::store::Snapshot;

use super::cluster::{resolve_backends, ResolvedBackends};
use super::listener::ListenerPlan;

/// Result of attaching routes to one gateway
#[derive(Debug, Default)]
pub(crate) struct Attachments {
    /// Clusters of every route attached to at least one listener
    pub clusters: Vec<ClusterConfig>,
    /// Parent status entries, one per matching parentRef
    pub parents: Vec<(ObjectKey, RouteParentStatus)>,
}

struct Rejection {
    reason: &'static str,
    message: String,
}

fn parent_conditions(
    accepted: Result<(), &Rejection>,
    backends: &ResolvedBackends,
    generation: Option<i64>,
) -> Vec<Condition> {
    match accepted {
        Ok(()) => vec![
            Condition::new(
                types::ACCEPTED,
                ConditionStatus::True,
                reasons::ACCEPTED,
                "route accepted",
            )
            .observed(generation),
            backends.resolved_refs.clone(),
        ],
        Err(rejection) => vec![
            Condition::new(
                types::ACCEPTED,
                ConditionStatus::False,
                rejection.reason,
                rejection.message.clone(),
            )
            .observed(generation),
            Condition::new(
                types::RESOLVED_REFS,
                ConditionStatus::False,
                rejection.reason,
                rejection.message.clone(),
            )
            .observed(generation),
        ],
    }
}

fn targets(parent: &ParentReference, route_namespace: &str, gateway_key: &ObjectKey) -> bool {
    parent.is_gateway() && parent.gateway_key(route_namespace) == *gateway_key
}

/// Pick the listeners a parentRef attaches to
fn match_listeners(
    parent: &ParentReference,
    listeners: &[ListenerPlan],
    gateway_namespace: &str,
    route_namespace: &str,
) -> Result<Vec<usize>, Rejection> {
    let candidates: Vec<usize> = listeners
        .iter()
        .enumerate()
        .filter(|(_, l)| parent.section_name.as_ref().map_or(true, |s| *s == l.name))
        .filter(|(_, l)| parent.port.map_or(true, |p| l.port.map(i32::from) == Some(p)))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        let message = match (&parent.section_name, parent.port) {
            (Some(section), _) => format!("gateway has no listener named {section}"),
            (None, Some(port)) => format!("gateway has no listener on port {port}"),
            (None, None) => "gateway has no listeners".to_string(),
        };
        return Err(Rejection {
            reason: reasons::NO_MATCHING_PARENT,
            message,
        });
    }

    let allowed: Vec<usize> = candidates
        .into_iter()
        .filter(|&i| listeners[i].admits(gateway_namespace, route_namespace))
        .collect();
    if allowed.is_empty() {
        return Err(Rejection {
            reason: reasons::NOT_ALLOWED_BY_LISTENERS,
            message: format!("no listener admits UDPRoutes from namespace {route_namespace}"),
        });
    }

    let ready: Vec<usize> = allowed.into_iter().filter(|&i| listeners[i].is_ready()).collect();
    if ready.is_empty() {
        return Err(Rejection {
            reason: reasons::NO_MATCHING_PARENT,
            message: "no matching listener is ready".to_string(),
        });
    }
    Ok(ready)
}

/// Attach every route naming this gateway to its listeners
///
/// Listener route lists and attached-route counts are updated in place.
/// A route attached through several parentRefs or to several listeners is
/// rendered as a single cluster.
pub(crate) fn attach_routes(
    snapshot: &Snapshot,
    gateway_key: &ObjectKey,
    listeners: &mut [ListenerPlan],
    controller_name: &str,
    policy: EndpointPolicy,
) -> Attachments {
    let gateway_namespace = gateway_key.namespace_or_default();
    let mut out = Attachments::default();

    for (route_key, route) in snapshot.routes_for_gateway(gateway_key) {
        let route_namespace = route_key.namespace_or_default();
        let generation = route.metadata.generation;
        let backends = resolve_backends(snapshot, route_key, route, policy);
        let mut attached_to: BTreeSet<usize> = BTreeSet::new();
        let mut seen_parents = BTreeSet::new();

        for parent in route
            .spec
            .parent_refs
            .iter()
            .filter(|p| targets(p, route_namespace, gateway_key))
        {
            if !seen_parents.insert(parent.clone()) {
                continue;
            }
            let outcome = match_listeners(parent, listeners, gateway_namespace, route_namespace);
            let conditions = parent_conditions(outcome.as_ref().map(|_| ()), &backends, generation);
            if let Ok(indices) = outcome {
                attached_to.extend(indices);
            }
            out.parents.push((
                route_key.clone(),
                RouteParentStatus {
                    parent_ref: parent.clone(),
                    controller_name: controller_name.to_string(),
                    conditions,
                },
            ));
        }

        if attached_to.is_empty() {
            continue;
        }
        for index in attached_to {
            let listener = &mut listeners[index];
            listener.attached_routes += 1;
            listener.routes.insert(backends.cluster.name.clone());
        }
        out.clusters.push(backends.cluster);
    }

    out
}

/// Parent entries for routes of a gateway that is not being programmed
///
/// `reason` is used for Accepted. When `keep_backend_status` is set, the
/// route's backend resolution is reported as ResolvedRefs; otherwise
/// ResolvedRefs mirrors the rejection.
pub(crate) fn rejected_parents(
    snapshot: &Snapshot,
    gateway_key: &ObjectKey,
    controller_name: &str,
    policy: EndpointPolicy,
    reason: &'static str,
    message: &str,
    keep_backend_status: bool,
) -> Vec<(ObjectKey, RouteParentStatus)> {
    let mut parents = Vec::new();
    for (route_key, route) in snapshot.routes_for_gateway(gateway_key) {
        let route_namespace = route_key.namespace_or_default();
        let generation = route.metadata.generation;
        let backends = resolve_backends(snapshot, route_key, route, policy);
        let rejection = Rejection {
            reason,
            message: message.to_string(),
        };
        let mut seen = BTreeSet::new();
        for parent in route
            .spec
            .parent_refs
            .iter()
            .filter(|p| targets(p, route_namespace, gateway_key))
        {
            if !seen.insert(parent.clone()) {
                continue;
            }
            let mut conditions = parent_conditions(Err(&rejection), &backends, generation);
            if keep_backend_status {
                conditions[1] = backends.resolved_refs.clone();
            }
            parents.push((
                route_key.clone(),
                RouteParentStatus {
                    parent_ref: parent.clone(),
                    controller_name: controller_name.to_string(),
                    conditions,
                },
            ));
        }
    }
    parents
}

/// Parent entry for a parentRef whose gateway does not exist
pub(crate) fn missing_parent(
    parent: &ParentReference,
    controller_name: &str,
    generation: Option<i64>,
) -> RouteParentStatus {
    let message = format!("gateway {} not found", parent.name);
    RouteParentStatus {
        parent_ref: parent.clone(),
        controller_name: controller_name.to_string(),
        conditions: vec![
            Condition::new(
                types::ACCEPTED,
                ConditionStatus::False,
                reasons::NO_MATCHING_PARENT,
                message.clone(),
            )
            .observed(generation),
            Condition::new(
                types::RESOLVED_REFS,
                ConditionStatus::False,
                reasons::NO_MATCHING_PARENT,
                message,
            )
            .observed(generation),
        ],
    }
}
