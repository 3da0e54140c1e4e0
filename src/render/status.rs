//! Desired status of rendered resources
//!
//! The renderer emits statuses without transition times. Before writing, the
//! updater calls [`ResourceStatus::stamped`] with the status currently on
//! the object so unchanged conditions keep their timestamps and parent
//! entries written by other controllers survive.

use chrono::{DateTime, Utc};

use crate::crd::{
    stamp_conditions, Condition, GatewayClassStatus, GatewayStatus, ObjectKind, RouteParentStatus,
    RouteStatus,
};
use crate::Error;

/// Status the control plane wants a resource to carry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceStatus {
    /// GatewayClass status
    GatewayClass(GatewayClassStatus),
    /// Gateway status
    Gateway(GatewayStatus),
    /// UDPRoute status
    UdpRoute(RouteStatus),
}

impl ResourceStatus {
    /// Kind of resource this status belongs to
    pub fn kind(&self) -> ObjectKind {
        match self {
            ResourceStatus::GatewayClass(_) => ObjectKind::GatewayClass,
            ResourceStatus::Gateway(_) => ObjectKind::Gateway,
            ResourceStatus::UdpRoute(_) => ObjectKind::UdpRoute,
        }
    }

    /// Top-level conditions (empty for routes, whose conditions are per parent)
    pub fn conditions(&self) -> &[Condition] {
        match self {
            ResourceStatus::GatewayClass(s) => &s.conditions,
            ResourceStatus::Gateway(s) => &s.conditions,
            ResourceStatus::UdpRoute(_) => &[],
        }
    }

    /// JSON form used in status patches
    pub fn to_value(&self) -> Result<serde_json::Value, Error> {
        let value = match self {
            ResourceStatus::GatewayClass(s) => serde_json::to_value(s),
            ResourceStatus::Gateway(s) => serde_json::to_value(s),
            ResourceStatus::UdpRoute(s) => serde_json::to_value(s),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))
    }

    /// Stamp transition times against the status currently on the object
    ///
    /// For routes, parent entries owned by other controllers are carried
    /// over from `previous` ahead of ours.
    pub fn stamped(
        &self,
        previous: Option<&ResourceStatus>,
        controller_name: &str,
        now: DateTime<Utc>,
    ) -> ResourceStatus {
        match (self, previous) {
            (ResourceStatus::GatewayClass(desired), prev) => {
                let previous: &[Condition] = match prev {
                    Some(ResourceStatus::GatewayClass(p)) => p.conditions.as_slice(),
                    _ => &[],
                };
                let mut status = desired.clone();
                stamp_conditions(&mut status.conditions, previous, now);
                ResourceStatus::GatewayClass(status)
            }
            (ResourceStatus::Gateway(desired), prev) => {
                let previous = match prev {
                    Some(ResourceStatus::Gateway(p)) => Some(p),
                    _ => None,
                };
                let mut status = desired.clone();
                stamp_conditions(
                    &mut status.conditions,
                    previous.map(|p| p.conditions.as_slice()).unwrap_or_default(),
                    now,
                );
                for listener in &mut status.listeners {
                    let prev_conditions = previous
                        .and_then(|p| p.listeners.iter().find(|l| l.name == listener.name))
                        .map(|l| l.conditions.as_slice())
                        .unwrap_or_default();
                    stamp_conditions(&mut listener.conditions, prev_conditions, now);
                }
                ResourceStatus::Gateway(status)
            }
            (ResourceStatus::UdpRoute(desired), prev) => {
                let previous: &[RouteParentStatus] = match prev {
                    Some(ResourceStatus::UdpRoute(p)) => p.parents.as_slice(),
                    _ => &[],
                };
                let mut parents: Vec<RouteParentStatus> = previous
                    .iter()
                    .filter(|p| p.controller_name != controller_name)
                    .cloned()
                    .collect();
                for entry in &desired.parents {
                    let mut entry = entry.clone();
                    let prev_conditions = previous
                        .iter()
                        .find(|p| {
                            p.controller_name == controller_name && p.parent_ref == entry.parent_ref
                        })
                        .map(|p| p.conditions.as_slice())
                        .unwrap_or_default();
                    stamp_conditions(&mut entry.conditions, prev_conditions, now);
                    parents.push(entry);
                }
                ResourceStatus::UdpRoute(RouteStatus { parents })
            }
        }
    }
}
