//! The rendered TURN configuration document
//!
//! This is the artifact the control plane produces for each gateway (or
//! each shared config target) and streams to relay instances. Collections
//! are kept sorted so two renders of the same inputs serialize to identical
//! bytes, which lets every downstream stage detect "no change" by equality.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Rendered configuration for one config target
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedConfig {
    /// TURN listeners
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Backend clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// A TURN listener
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Unique name, `<namespace>/<gateway>/<listener>`
    pub name: String,
    /// TURN protocol
    pub protocol: TurnProtocol,
    /// Listening port
    pub port: u16,
    /// Public address clients reach the listener at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Public port clients reach the listener at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    /// Names of clusters reachable through this listener
    #[serde(default)]
    pub routes: Vec<String>,
}

/// A backend cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Unique name, `<namespace>/<route>`
    pub name: String,
    /// How endpoints are interpreted
    #[serde(rename = "type")]
    pub type_: ClusterType,
    /// Peer addresses or hostnames
    #[serde(default)]
    pub endpoints: BTreeSet<String>,
}

/// How a cluster's endpoints are interpreted by relays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    /// Fixed IP addresses
    #[serde(rename = "STATIC")]
    Static,
    /// Hostnames resolved by the relay
    #[serde(rename = "STRICT_DNS")]
    StrictDns,
}

/// Transport family of a listener; listeners of the same family cannot share a port
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportFamily {
    /// UDP and DTLS
    Udp,
    /// TCP and TLS
    Tcp,
}

/// TURN listener protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TurnProtocol {
    /// TURN over UDP
    #[serde(rename = "TURN-UDP")]
    TurnUdp,
    /// TURN over TCP
    #[serde(rename = "TURN-TCP")]
    TurnTcp,
    /// TURN over TLS
    #[serde(rename = "TURN-TLS")]
    TurnTls,
    /// TURN over DTLS
    #[serde(rename = "TURN-DTLS")]
    TurnDtls,
}

impl TurnProtocol {
    /// Canonical protocol name
    pub fn as_str(self) -> &'static str {
        match self {
            TurnProtocol::TurnUdp => "TURN-UDP",
            TurnProtocol::TurnTcp => "TURN-TCP",
            TurnProtocol::TurnTls => "TURN-TLS",
            TurnProtocol::TurnDtls => "TURN-DTLS",
        }
    }

    /// Transport family used for port conflict detection
    pub fn family(self) -> TransportFamily {
        match self {
            TurnProtocol::TurnUdp | TurnProtocol::TurnDtls => TransportFamily::Udp,
            TurnProtocol::TurnTcp | TurnProtocol::TurnTls => TransportFamily::Tcp,
        }
    }

    /// Whether the listener terminates TLS and needs a certificate
    pub fn requires_certificate(self) -> bool {
        matches!(self, TurnProtocol::TurnTls | TurnProtocol::TurnDtls)
    }

    /// Kubernetes Service port protocol
    pub fn service_protocol(self) -> &'static str {
        match self.family() {
            TransportFamily::Udp => "UDP",
            TransportFamily::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TurnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnProtocol {
    type Err = Error;

    /// Accepts canonical names and the bare transport aliases, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TURN-UDP" | "UDP" => Ok(TurnProtocol::TurnUdp),
            "TURN-TCP" | "TCP" => Ok(TurnProtocol::TurnTcp),
            "TURN-TLS" | "TLS" => Ok(TurnProtocol::TurnTls),
            "TURN-DTLS" | "DTLS" => Ok(TurnProtocol::TurnDtls),
            _ => Err(Error::validation(format!("unsupported protocol: {s}"))),
        }
    }
}

impl RenderedConfig {
    /// Whether the document carries no listeners and no clusters
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.clusters.is_empty()
    }

    /// Sort every collection by name so equal inputs give equal documents
    pub fn normalize(&mut self) {
        for listener in &mut self.listeners {
            listener.routes.sort();
            listener.routes.dedup();
        }
        self.listeners.sort_by(|a, b| a.name.cmp(&b.name));
        self.clusters.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Merge another document into this one
    ///
    /// Listeners are unique per gateway, so they are appended. Clusters with
    /// the same name (the same route attached to several gateways) are
    /// unioned.
    pub fn merge(&mut self, other: &RenderedConfig) {
        self.listeners.extend(other.listeners.iter().cloned());
        for cluster in &other.clusters {
            match self.clusters.iter_mut().find(|c| c.name == cluster.name) {
                Some(existing) => existing.endpoints.extend(cluster.endpoints.iter().cloned()),
                None => self.clusters.push(cluster.clone()),
            }
        }
        self.normalize();
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("RenderedConfig", e.to_string()))
    }

    /// Parse the JSON wire form
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s)
            .map_err(|e| Error::serialization_for_kind("RenderedConfig", e.to_string()))
    }

    /// Find a listener by name
    pub fn listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }

    /// Find a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(name: &str, protocol: TurnProtocol, port: u16, routes: &[&str]) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            protocol,
            port,
            public_address: None,
            public_port: None,
            routes: routes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn cluster(name: &str, endpoints: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            type_: ClusterType::Static,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_protocol_aliases_parse() {
        assert_eq!("TURN-UDP".parse::<TurnProtocol>().unwrap(), TurnProtocol::TurnUdp);
        assert_eq!("udp".parse::<TurnProtocol>().unwrap(), TurnProtocol::TurnUdp);
        assert_eq!("TLS".parse::<TurnProtocol>().unwrap(), TurnProtocol::TurnTls);
        assert_eq!("turn-dtls".parse::<TurnProtocol>().unwrap(), TurnProtocol::TurnDtls);
        assert!("HTTP".parse::<TurnProtocol>().is_err());
    }

    #[test]
    fn test_protocol_families() {
        assert_eq!(TurnProtocol::TurnUdp.family(), TurnProtocol::TurnDtls.family());
        assert_eq!(TurnProtocol::TurnTcp.family(), TurnProtocol::TurnTls.family());
        assert_ne!(TurnProtocol::TurnUdp.family(), TurnProtocol::TurnTcp.family());
        assert_eq!(TurnProtocol::TurnDtls.service_protocol(), "UDP");
        assert!(TurnProtocol::TurnTls.requires_certificate());
        assert!(!TurnProtocol::TurnTcp.requires_certificate());
    }

    #[test]
    fn test_wire_form_uses_canonical_names() {
        let mut config = RenderedConfig {
            listeners: vec![listener(
                "default/gw/udp",
                TurnProtocol::TurnUdp,
                3478,
                &["default/r"],
            )],
            clusters: vec![ClusterConfig {
                name: "default/r".to_string(),
                type_: ClusterType::StrictDns,
                endpoints: ["media.example.com".to_string()].into(),
            }],
        };
        config.listeners[0].public_address = Some("1.2.3.4".to_string());

        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(json["listeners"][0]["protocol"], "TURN-UDP");
        assert_eq!(json["clusters"][0]["type"], "STRICT_DNS");

        assert_eq!(RenderedConfig::from_json(&config.to_json().unwrap()).unwrap(), config);
    }

    /// Story: relays read one casing across the whole document
    #[test]
    fn story_wire_form_is_camel_case_throughout() {
        let mut udp = listener("default/gw/udp", TurnProtocol::TurnUdp, 3478, &[]);
        udp.public_address = Some("1.2.3.4".to_string());
        udp.public_port = Some(30478);
        let config = RenderedConfig {
            listeners: vec![udp],
            clusters: vec![cluster("default/r", &["10.0.0.1"])],
        };

        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        let listener = &json["listeners"][0];
        assert_eq!(listener["publicAddress"], "1.2.3.4");
        assert_eq!(listener["publicPort"], 30478);
        assert!(listener.get("public_address").is_none());
        assert!(listener.get("public_port").is_none());

        let keys = |v: &serde_json::Value| -> Vec<String> {
            v.as_object().unwrap().keys().cloned().collect()
        };
        for key in keys(listener).into_iter().chain(keys(&json["clusters"][0])) {
            assert!(!key.contains('_'), "{key} is not camelCase");
        }
    }

    #[test]
    fn test_unset_public_port_is_omitted() {
        let config = RenderedConfig {
            listeners: vec![listener("default/gw/udp", TurnProtocol::TurnUdp, 3478, &[])],
            clusters: vec![],
        };
        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert!(json["listeners"][0].get("publicPort").is_none());
        assert!(json["listeners"][0].get("publicAddress").is_none());
    }

    #[test]
    fn test_normalize_orders_by_name() {
        let mut config = RenderedConfig {
            listeners: vec![
                listener("ns/gw/b", TurnProtocol::TurnTcp, 2, &["ns/z", "ns/a", "ns/a"]),
                listener("ns/gw/a", TurnProtocol::TurnUdp, 1, &[]),
            ],
            clusters: vec![cluster("ns/z", &[]), cluster("ns/a", &[])],
        };
        config.normalize();
        assert_eq!(config.listeners[0].name, "ns/gw/a");
        assert_eq!(config.listeners[1].routes, vec!["ns/a", "ns/z"]);
        assert_eq!(config.clusters[0].name, "ns/a");
    }

    /// Story: two gateways sharing one config target merge into one document
    #[test]
    fn story_shared_target_unions_clusters() {
        let mut merged = RenderedConfig {
            listeners: vec![listener("ns/gw-a/udp", TurnProtocol::TurnUdp, 3478, &["ns/r"])],
            clusters: vec![cluster("ns/r", &["10.0.0.1"])],
        };
        let other = RenderedConfig {
            listeners: vec![listener("ns/gw-b/udp", TurnProtocol::TurnUdp, 3479, &["ns/r"])],
            clusters: vec![cluster("ns/r", &["10.0.0.2"]), cluster("ns/s", &["10.0.1.1"])],
        };
        merged.merge(&other);

        assert_eq!(merged.listeners.len(), 2);
        assert_eq!(merged.clusters.len(), 2);
        let r = merged.cluster("ns/r").unwrap();
        assert_eq!(r.endpoints.len(), 2);
        assert!(merged.listener("ns/gw-b/udp").is_some());
    }

    #[test]
    fn test_empty_document() {
        assert!(RenderedConfig::default().is_empty());
        assert_eq!(
            RenderedConfig::default().to_json().unwrap(),
            r#"{"listeners":[],"clusters":[]}"#
        );
    }
}
