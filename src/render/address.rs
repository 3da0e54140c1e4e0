//! Public address discovery for gateways
//!
//! Addresses are tried in priority order:
//! 1. the first address requested in the Gateway spec
//! 2. the load balancer ingress of the gateway's Service
//! 3. a node ExternalIP when the gateway's Service is a NodePort
//!
//! The gateway Service is the one the operator derives for the gateway, so
//! it shares the gateway's namespace and name.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;

use crate::crd::{Gateway, GatewayStatusAddress, ObjectKey};
use crate::document::TurnProtocol;
use crate::store::Snapshot;

const IP_ADDRESS: &str = "IPAddress";
const HOSTNAME: &str = "Hostname";

/// Where clients reach a gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PublicAddress {
    pub value: String,
    pub type_: String,
    /// NodePort remapping, keyed by (service protocol, listener port)
    node_ports: BTreeMap<(String, u16), u16>,
}

impl PublicAddress {
    fn new(value: impl Into<String>, type_: Option<&str>) -> Self {
        let value = value.into();
        let type_ = type_.map(str::to_string).unwrap_or_else(|| {
            if value.parse::<IpAddr>().is_ok() {
                IP_ADDRESS.to_string()
            } else {
                HOSTNAME.to_string()
            }
        });
        Self {
            value,
            type_,
            node_ports: BTreeMap::new(),
        }
    }

    /// Port clients use for a listener
    pub fn public_port(&self, protocol: TurnProtocol, port: u16) -> u16 {
        self.node_ports
            .get(&(protocol.service_protocol().to_string(), port))
            .copied()
            .unwrap_or(port)
    }

    pub fn status_address(&self) -> GatewayStatusAddress {
        GatewayStatusAddress {
            type_: Some(self.type_.clone()),
            value: self.value.clone(),
        }
    }
}

/// Find the public address of a gateway, if it has one yet
pub(crate) fn public_address(
    snapshot: &Snapshot,
    gateway_key: &ObjectKey,
    gateway: &Gateway,
) -> Option<PublicAddress> {
    if let Some(requested) = gateway.spec.addresses.iter().find(|a| !a.value.is_empty()) {
        return Some(PublicAddress::new(&requested.value, requested.type_.as_deref()));
    }

    let service = snapshot.service(gateway_key)?;
    if let Some(address) = load_balancer_address(service) {
        return Some(address);
    }

    let is_node_port = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "NodePort");
    if !is_node_port {
        return None;
    }

    let mut address = node_external_ip(snapshot)?;
    address.node_ports = node_ports(service);
    Some(address)
}

fn load_balancer_address(service: &Service) -> Option<PublicAddress> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?;
    ingress.iter().find_map(|i| match (&i.ip, &i.hostname) {
        (Some(ip), _) if !ip.is_empty() => Some(PublicAddress::new(ip, Some(IP_ADDRESS))),
        (_, Some(host)) if !host.is_empty() => Some(PublicAddress::new(host, Some(HOSTNAME))),
        _ => None,
    })
}

fn node_external_ip(snapshot: &Snapshot) -> Option<PublicAddress> {
    snapshot.nodes().find_map(|node| {
        node.status
            .as_ref()?
            .addresses
            .as_ref()?
            .iter()
            .find(|a| a.type_ == "ExternalIP" && !a.address.is_empty())
            .map(|a| PublicAddress::new(&a.address, Some(IP_ADDRESS)))
    })
}

fn node_ports(service: &Service) -> BTreeMap<(String, u16), u16> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok()?;
            let node_port = u16::try_from(p.node_port?).ok()?;
            let protocol = p.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            Some(((protocol, port), node_port))
        })
        .collect()
}
