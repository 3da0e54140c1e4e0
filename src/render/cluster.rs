//! Backend resolution: turning a route's backendRefs into a cluster

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;

use crate::config::EndpointPolicy;
use crate::crd::{
    condition_reasons as reasons, condition_types as types, Condition, ConditionStatus, ObjectKey,
    UdpRoute,
};
use crate::document::{ClusterConfig, ClusterType};
use crate::store::Snapshot;

/// Cluster name for a route, `<namespace>/<route>`
pub(crate) fn cluster_name(route_key: &ObjectKey) -> String {
    route_key.to_string()
}

/// A route's cluster and whether all of its backends resolved
#[derive(Clone, Debug)]
pub(crate) struct ResolvedBackends {
    pub cluster: ClusterConfig,
    pub resolved_refs: Condition,
}

struct Failure {
    reason: &'static str,
    message: String,
}

fn is_external_name(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "ExternalName")
}

fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

fn ready_endpoints<'a>(
    snapshot: &'a Snapshot,
    service_key: &ObjectKey,
) -> impl Iterator<Item = String> + 'a {
    snapshot
        .endpoint_slices_for_service(service_key)
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|ep| ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true))
        .flat_map(|ep| ep.addresses.iter().cloned())
}

/// Resolve every backend of a route into one cluster
///
/// ExternalName services produce a STRICT_DNS cluster of hostnames. Any
/// other service contributes its ready endpoint addresses and/or its
/// cluster IP, depending on the endpoint policy. A route cannot mix the
/// two; ExternalName backends next to regular ones are reported as
/// unresolved and left out.
pub(crate) fn resolve_backends(
    snapshot: &Snapshot,
    route_key: &ObjectKey,
    route: &UdpRoute,
    policy: EndpointPolicy,
) -> ResolvedBackends {
    let namespace = route_key.namespace_or_default();
    let generation = route.metadata.generation;
    let mut failures = Vec::new();
    let mut hostnames = BTreeSet::new();
    let mut addresses = BTreeSet::new();
    let mut static_backends = 0usize;
    let mut external_backends = Vec::new();

    for backend in route.backend_refs() {
        if !backend.is_service() {
            failures.push(Failure {
                reason: reasons::INVALID_KIND,
                message: format!(
                    "backend {} has unsupported kind {}",
                    backend.name,
                    backend.kind.as_deref().unwrap_or("Service")
                ),
            });
            continue;
        }

        let key = backend.service_key(namespace);
        let Some(service) = snapshot.service(&key) else {
            failures.push(Failure {
                reason: reasons::BACKEND_NOT_FOUND,
                message: format!("backend service {key} not found"),
            });
            continue;
        };

        if is_external_name(service) {
            match service.spec.as_ref().and_then(|s| s.external_name.as_deref()) {
                Some(host) if !host.is_empty() => external_backends.push((key, host.to_string())),
                _ => failures.push(Failure {
                    reason: reasons::BACKEND_NOT_FOUND,
                    message: format!("ExternalName service {key} has no externalName"),
                }),
            }
            continue;
        }

        static_backends += 1;
        if policy.relay_to_cluster_ip {
            if let Some(ip) = cluster_ip(service) {
                addresses.insert(ip.to_string());
            }
        }
        if policy.discovery {
            addresses.extend(ready_endpoints(snapshot, &key));
        }
    }

    let type_ = if static_backends == 0 && !external_backends.is_empty() {
        hostnames.extend(external_backends.into_iter().map(|(_, host)| host));
        ClusterType::StrictDns
    } else {
        for (key, _) in external_backends {
            failures.push(Failure {
                reason: reasons::UNSUPPORTED_VALUE,
                message: format!("ExternalName backend {key} cannot be mixed with other backends"),
            });
        }
        ClusterType::Static
    };

    let resolved_refs = match failures.first() {
        None => Condition::new(
            types::RESOLVED_REFS,
            ConditionStatus::True,
            reasons::RESOLVED_REFS,
            "all backends resolved",
        ),
        Some(first) => {
            let message = failures
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            Condition::new(types::RESOLVED_REFS, ConditionStatus::False, first.reason, message)
        }
    }
    .observed(generation);

    ResolvedBackends {
        cluster: ClusterConfig {
            name: cluster_name(route_key),
            type_,
            endpoints: match type_ {
                ClusterType::StrictDns => hostnames,
                ClusterType::Static => addresses,
            },
        },
        resolved_refs,
    }
}
