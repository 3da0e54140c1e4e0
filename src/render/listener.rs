//! Listener validation and conflict detection

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::crd::{
    condition_reasons as reasons, condition_types as types, Condition, ConditionStatus,
    FromNamespaces, Gateway, ListenerStatus, ObjectKey, RouteGroupKind,
};
use crate::document::{TransportFamily, TurnProtocol};
use crate::store::Snapshot;

/// A gateway listener after validation
#[derive(Clone, Debug)]
pub(crate) struct ListenerPlan {
    pub name: String,
    pub protocol: Option<TurnProtocol>,
    pub port: Option<u16>,
    pub from: FromNamespaces,
    pub supported_kinds: Vec<RouteGroupKind>,
    pub accepted: Condition,
    pub resolved_refs: Condition,
    pub conflicted: Condition,
    pub attached_routes: i32,
    pub routes: BTreeSet<String>,
}

impl ListenerPlan {
    /// Accepted, resolved and conflict-free
    pub fn is_ready(&self) -> bool {
        self.accepted.is_true() && self.resolved_refs.is_true() && !self.conflicted.is_true()
    }

    /// Whether a route from `route_namespace` may attach
    pub fn admits(&self, gateway_namespace: &str, route_namespace: &str) -> bool {
        if self.supported_kinds.is_empty() {
            return false;
        }
        match self.from {
            FromNamespaces::All => true,
            FromNamespaces::Same => gateway_namespace == route_namespace,
            FromNamespaces::Selector => false,
        }
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            name: self.name.clone(),
            attached_routes: self.attached_routes,
            supported_kinds: self.supported_kinds.clone(),
            conditions: vec![
                self.accepted.clone(),
                self.resolved_refs.clone(),
                self.conflicted.clone(),
            ],
        }
    }
}

fn condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    Condition::new(type_, status, reason, message).observed(generation)
}

/// Validate every listener of a gateway and mark port conflicts
///
/// Listener names must be unique. Only the first listener of a name is
/// planned; when the name is reused the plan is marked conflicted so the
/// gateway status says why none of them is served.
pub(crate) fn plan_listeners(
    snapshot: &Snapshot,
    gateway_key: &ObjectKey,
    gateway: &Gateway,
) -> Vec<ListenerPlan> {
    let generation = gateway.metadata.generation;
    let namespace = gateway_key.namespace_or_default();
    let mut uses: BTreeMap<&str, usize> = BTreeMap::new();
    let mut plans = Vec::with_capacity(gateway.spec.listeners.len());

    for listener in &gateway.spec.listeners {
        let count = uses.entry(listener.name.as_str()).or_default();
        *count += 1;
        if *count > 1 {
            warn!(
                gateway = %gateway_key,
                listener = %listener.name,
                "Ignoring listener with duplicate name"
            );
            continue;
        }

        let protocol = listener.protocol.parse::<TurnProtocol>().ok();
        let port = u16::try_from(listener.port).ok().filter(|p| *p != 0);

        let accepted = match (protocol, port) {
            (None, _) => condition(
                types::ACCEPTED,
                ConditionStatus::False,
                reasons::UNSUPPORTED_PROTOCOL,
                format!("protocol {} is not supported", listener.protocol),
                generation,
            ),
            (_, None) => condition(
                types::ACCEPTED,
                ConditionStatus::False,
                reasons::PORT_UNAVAILABLE,
                format!("port {} is not usable", listener.port),
                generation,
            ),
            _ => condition(
                types::ACCEPTED,
                ConditionStatus::True,
                reasons::ACCEPTED,
                "listener accepted",
                generation,
            ),
        };

        let allowed = listener.allowed_routes.as_ref();
        let from = allowed
            .and_then(|a| a.namespaces.as_ref())
            .and_then(|n| n.from)
            .unwrap_or_default();
        let requested_kinds = allowed.map(|a| a.kinds.as_slice()).unwrap_or_default();
        let supported_kinds = if requested_kinds.is_empty()
            || requested_kinds.iter().any(RouteGroupKind::is_udp_route)
        {
            vec![RouteGroupKind::udp_route()]
        } else {
            Vec::new()
        };

        let resolved_refs = if supported_kinds.is_empty() {
            condition(
                types::RESOLVED_REFS,
                ConditionStatus::False,
                reasons::INVALID_ROUTE_KINDS,
                "no supported route kind allowed, only UDPRoute is supported",
                generation,
            )
        } else if let Some(message) = protocol
            .filter(|p| p.requires_certificate())
            .and_then(|_| certificate_problem(snapshot, namespace, listener))
        {
            condition(
                types::RESOLVED_REFS,
                ConditionStatus::False,
                reasons::INVALID_CERTIFICATE_REF,
                message,
                generation,
            )
        } else {
            condition(
                types::RESOLVED_REFS,
                ConditionStatus::True,
                reasons::RESOLVED_REFS,
                "all references resolved",
                generation,
            )
        };

        plans.push(ListenerPlan {
            name: listener.name.clone(),
            protocol,
            port,
            from,
            supported_kinds,
            accepted,
            resolved_refs,
            conflicted: condition(
                types::CONFLICTED,
                ConditionStatus::False,
                reasons::NO_CONFLICTS,
                "no conflicts",
                generation,
            ),
            attached_routes: 0,
            routes: BTreeSet::new(),
        });
    }

    mark_conflicts(&mut plans, generation);
    for plan in &mut plans {
        let count = uses.get(plan.name.as_str()).copied().unwrap_or(1);
        if count > 1 {
            plan.conflicted = condition(
                types::CONFLICTED,
                ConditionStatus::True,
                reasons::LISTENER_NAME_CONFLICT,
                format!(
                    "listener name {} is used by {count} listeners, only the first is reported",
                    plan.name
                ),
                generation,
            );
        }
    }
    plans
}

fn certificate_problem(
    snapshot: &Snapshot,
    namespace: &str,
    listener: &crate::crd::Listener,
) -> Option<String> {
    let refs = listener
        .tls
        .as_ref()
        .map(|t| t.certificate_refs.as_slice())
        .unwrap_or_default();
    if refs.is_empty() {
        return Some(format!("{} listener requires a certificate", listener.protocol));
    }
    for cert in refs {
        let is_secret = cert.group.as_deref().map_or(true, str::is_empty)
            && cert.kind.as_deref().map_or(true, |k| k == "Secret");
        if !is_secret {
            return Some(format!("certificate reference {} is not a Secret", cert.name));
        }
        let namespace = cert.namespace.as_deref().unwrap_or(namespace);
        let key = ObjectKey::namespaced(namespace, cert.name.clone());
        if snapshot.secret(&key).is_none() {
            return Some(format!("certificate secret {key} not found"));
        }
    }
    None
}

/// Listeners sharing a port within one transport family conflict
fn mark_conflicts(plans: &mut [ListenerPlan], generation: Option<i64>) {
    let mut groups: BTreeMap<(u16, TransportFamily), Vec<usize>> = BTreeMap::new();
    for (index, plan) in plans.iter().enumerate() {
        if let (Some(protocol), Some(port), true) =
            (plan.protocol, plan.port, plan.accepted.is_true())
        {
            groups.entry((port, protocol.family())).or_default().push(index);
        }
    }

    for ((port, _), members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
        let names: Vec<&str> = members.iter().map(|&i| plans[i].name.as_str()).collect();
        let message = format!("port {port} is shared by listeners {}", names.join(", "));
        for index in members {
            plans[index].conflicted = condition(
                types::CONFLICTED,
                ConditionStatus::True,
                reasons::PROTOCOL_CONFLICT,
                message.clone(),
                generation,
            );
        }
    }
}

/// Listener statuses for a gateway that is not being programmed
pub(crate) fn pending_listener_statuses(gateway: &Gateway, message: &str) -> Vec<ListenerStatus> {
    let generation = gateway.metadata.generation;
    let mut seen = BTreeSet::new();
    gateway
        .spec
        .listeners
        .iter()
        .filter(|l| seen.insert(l.name.clone()))
        .map(|l| ListenerStatus {
            name: l.name.clone(),
            attached_routes: 0,
            supported_kinds: vec![RouteGroupKind::udp_route()],
            conditions: vec![condition(
                types::ACCEPTED,
                ConditionStatus::Unknown,
                reasons::PENDING,
                message,
                generation,
            )],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AllowedRoutes, GatewaySpec, GatewayTlsConfig, Listener, RouteNamespaces,
        SecretObjectReference,
    };
    use crate::store::Store;
    use k8s_openapi::api::core::v1::Secret;

    fn listener(name: &str, protocol: &str, port: i32) -> Listener {
        Listener {
            name: name.to_string(),
            protocol: protocol.to_string(),
            port,
            ..Default::default()
        }
    }

    fn plan(store: &Store, listeners: Vec<Listener>) -> Vec<ListenerPlan> {
        let mut gateway = Gateway::new(
            "gw",
            GatewaySpec {
                gateway_class_name: "turngate".to_string(),
                listeners,
                addresses: vec![],
            },
        );
        gateway.metadata.namespace = Some("default".to_string());
        gateway.metadata.generation = Some(4);
        plan_listeners(&store.snapshot(), &ObjectKey::namespaced("default", "gw"), &gateway)
    }

    #[test]
    fn test_valid_listeners_are_ready() {
        let plans = plan(
            &Store::new(),
            vec![listener("udp", "TURN-UDP", 3478), listener("tcp", "TCP", 3478)],
        );
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(ListenerPlan::is_ready));
        assert_eq!(plans[1].protocol, Some(TurnProtocol::TurnTcp));
        assert_eq!(plans[0].accepted.observed_generation, Some(4));
    }

    #[test]
    fn test_unsupported_protocol_and_bad_port() {
        let plans = plan(
            &Store::new(),
            vec![listener("http", "HTTP", 80), listener("zero", "UDP", 0)],
        );
        assert_eq!(plans[0].accepted.reason, reasons::UNSUPPORTED_PROTOCOL);
        assert_eq!(plans[1].accepted.reason, reasons::PORT_UNAVAILABLE);
        assert!(!plans[0].is_ready());
        assert!(!plans[1].is_ready());
    }

    /// Story: UDP and DTLS cannot share a port, UDP and TCP can
    #[test]
    fn story_same_family_port_sharing_conflicts() {
        let store = Store::new();
        let mut secret = Secret::default();
        secret.metadata.name = Some("cert".to_string());
        secret.metadata.namespace = Some("default".to_string());
        store.upsert(secret).unwrap();

        let mut dtls = listener("dtls", "TURN-DTLS", 3478);
        dtls.tls = Some(GatewayTlsConfig {
            mode: None,
            certificate_refs: vec![SecretObjectReference {
                name: "cert".to_string(),
                ..Default::default()
            }],
        });
        let plans = plan(
            &store,
            vec![
                listener("udp", "TURN-UDP", 3478),
                dtls,
                listener("tcp", "TURN-TCP", 3478),
            ],
        );

        assert!(plans[0].conflicted.is_true());
        assert!(plans[1].conflicted.is_true());
        assert_eq!(plans[1].conflicted.reason, reasons::PROTOCOL_CONFLICT);
        assert!(!plans[2].conflicted.is_true());
        assert!(plans[2].is_ready());
    }

    #[test]
    fn test_tls_listener_needs_existing_secret() {
        let mut tls = listener("tls", "TURN-TLS", 443);
        tls.tls = Some(GatewayTlsConfig {
            mode: None,
            certificate_refs: vec![SecretObjectReference {
                name: "missing".to_string(),
                ..Default::default()
            }],
        });
        let plans = plan(&Store::new(), vec![tls, listener("bare-tls", "TLS", 444)]);
        assert_eq!(plans[0].resolved_refs.reason, reasons::INVALID_CERTIFICATE_REF);
        assert!(plans[0].resolved_refs.message.contains("default/missing"));
        assert_eq!(plans[1].resolved_refs.reason, reasons::INVALID_CERTIFICATE_REF);
        assert!(plans[0].accepted.is_true());
        assert!(!plans[0].is_ready());
    }

    #[test]
    fn test_route_kinds_and_namespaces() {
        let mut only_tcp = listener("tcp-routes", "UDP", 1000);
        only_tcp.allowed_routes = Some(AllowedRoutes {
            namespaces: None,
            kinds: vec![RouteGroupKind {
                group: None,
                kind: "TCPRoute".to_string(),
            }],
        });
        let mut all = listener("all", "UDP", 1001);
        all.allowed_routes = Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some(FromNamespaces::All),
            }),
            kinds: vec![],
        });
        let plans = plan(
            &Store::new(),
            vec![only_tcp, all, listener("same", "UDP", 1002)],
        );

        assert_eq!(plans[0].resolved_refs.reason, reasons::INVALID_ROUTE_KINDS);
        assert!(plans[0].supported_kinds.is_empty());
        assert!(!plans[0].admits("default", "default"));

        assert!(plans[1].admits("default", "other"));
        assert!(plans[2].admits("default", "default"));
        assert!(!plans[2].admits("default", "other"));
    }

    /// Story: a listener name used twice shows up as a conflict instead of
    /// silently losing one definition
    #[test]
    fn story_duplicate_listener_name_is_reported() {
        let plans = plan(
            &Store::new(),
            vec![
                listener("udp", "UDP", 1),
                listener("udp", "TCP", 2),
                listener("tcp", "TCP", 3),
            ],
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].port, Some(1));

        let status = plans[0].status();
        assert_eq!(status.name, "udp");
        let conflicted = &status.conditions[2];
        assert_eq!(conflicted.type_, types::CONFLICTED);
        assert_eq!(conflicted.status, ConditionStatus::True);
        assert_eq!(conflicted.reason, reasons::LISTENER_NAME_CONFLICT);
        assert!(conflicted.message.contains("used by 2 listeners"));
        assert!(!plans[0].is_ready());

        assert!(plans[1].is_ready());
    }

    #[test]
    fn test_status_carries_three_conditions() {
        let plans = plan(&Store::new(), vec![listener("udp", "UDP", 1)]);
        let status = plans[0].status();
        let types: Vec<_> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Accepted", "ResolvedRefs", "Conflicted"]);
        assert_eq!(status.supported_kinds, vec![RouteGroupKind::udp_route()]);
    }
}
