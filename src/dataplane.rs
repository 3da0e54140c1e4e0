//! Relay workload descriptors
//!
//! For every programmed gateway the operator runs a relay Deployment and a
//! Service exposing the gateway's listener ports. The renderer decides
//! *what* should run as a [`DataplaneWorkload`]; this module turns the
//! descriptor into Kubernetes manifests.
//!
//! The Service is named after the gateway so its load balancer status can
//! be read back as the gateway's public address.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{DataplaneSpec, Gateway, ObjectKey};
use crate::document::TurnProtocol;
use crate::{
    CONFIG_DATA_KEY, LABEL_GATEWAY, LABEL_GATEWAY_NAMESPACE, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_VALUE,
};

/// Name of the relay container
pub const RELAY_CONTAINER: &str = "turngate-relay";

/// Directory the config artifact is mounted at inside relay pods
pub const CONFIG_MOUNT_PATH: &str = "/etc/turngate";

/// Service type used when the GatewayConfig does not pick one
pub const DEFAULT_SERVICE_TYPE: &str = "LoadBalancer";

/// Identity of the gateway that owns derived resources
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GatewayOwner {
    /// Gateway name
    pub name: String,
    /// Gateway UID
    pub uid: String,
}

impl GatewayOwner {
    /// Owner of resources derived from a gateway; `None` until the API
    /// server has assigned a UID
    pub fn of(gateway: &Gateway) -> Option<Self> {
        Some(Self {
            name: gateway.name_any(),
            uid: gateway.uid()?,
        })
    }

    /// Owner reference for derived resources
    pub fn owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "Gateway".to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }
}

/// A port the relay listens on
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkloadPort {
    /// Port name, unique within the workload
    pub name: String,
    /// Listener protocol
    pub protocol: TurnProtocol,
    /// Port number
    pub port: u16,
}

impl WorkloadPort {
    /// Port named after its transport and number
    pub fn new(protocol: TurnProtocol, port: u16) -> Self {
        Self {
            name: format!("{}-{}", protocol.service_protocol().to_ascii_lowercase(), port),
            protocol,
            port,
        }
    }
}

/// Everything needed to run the relay for one gateway
#[derive(Clone, Debug, PartialEq)]
pub struct DataplaneWorkload {
    /// Gateway the workload serves
    pub gateway: ObjectKey,
    /// Owner reference target, if the gateway has a UID
    pub owner: Option<GatewayOwner>,
    /// Name of the Dataplane template
    pub dataplane: String,
    /// Dataplane template
    pub spec: DataplaneSpec,
    /// Ports of rendered listeners, one per transport and port
    pub ports: Vec<WorkloadPort>,
    /// Service type for the exposing Service
    pub service_type: String,
    /// Name of the config artifact the relay reads
    pub config_name: String,
    /// TURN realm
    pub realm: Option<String>,
}

impl DataplaneWorkload {
    /// Name shared by the Deployment and Service
    pub fn name(&self) -> &str {
        &self.gateway.name
    }

    /// Namespace of the workload (the gateway's namespace)
    pub fn namespace(&self) -> &str {
        self.gateway.namespace_or_default()
    }

    /// Labels selecting the relay pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_GATEWAY.to_string(), self.gateway.name.clone()),
            (
                LABEL_GATEWAY_NAMESPACE.to_string(),
                self.namespace().to_string(),
            ),
        ])
    }

    /// Labels placed on every derived object
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_VALUE.to_string());
        labels.insert("app.kubernetes.io/name".to_string(), RELAY_CONTAINER.to_string());
        labels
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name().to_string()),
            namespace: Some(self.namespace().to_string()),
            labels: Some(self.labels()),
            owner_references: self
                .owner
                .as_ref()
                .map(|owner| vec![owner.owner_reference(true)]),
            ..Default::default()
        }
    }

    /// Relay Deployment manifest
    pub fn deployment(&self) -> Deployment {
        let mut env = vec![EnvVar {
            name: "TURNGATE_CONFIG_FILE".to_string(),
            value: Some(format!("{CONFIG_MOUNT_PATH}/{CONFIG_DATA_KEY}")),
            ..Default::default()
        }];
        if let Some(realm) = &self.realm {
            env.push(EnvVar {
                name: "TURNGATE_REALM".to_string(),
                value: Some(realm.clone()),
                ..Default::default()
            });
        }

        let container = Container {
            name: RELAY_CONTAINER.to_string(),
            image: Some(self.spec.image.clone()),
            image_pull_policy: self.spec.image_pull_policy.clone(),
            command: (!self.spec.command.is_empty()).then(|| self.spec.command.clone()),
            args: (!self.spec.args.is_empty()).then(|| self.spec.args.clone()),
            env: Some(env),
            ports: Some(
                self.ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: Some(p.name.clone()),
                        container_port: i32::from(p.port),
                        protocol: Some(p.protocol.service_protocol().to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: self.spec.resources.clone(),
            volume_mounts: Some(vec![VolumeMount {
                name: "turngate-config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let volume = Volume {
            name: "turngate-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.config_name.clone(),
                items: Some(vec![KeyToPath {
                    key: CONFIG_DATA_KEY.to_string(),
                    path: CONFIG_DATA_KEY.to_string(),
                    ..Default::default()
                }]),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(),
            spec: Some(DeploymentSpec {
                replicas: Some(self.spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![volume]),
                        host_network: self.spec.host_network.then_some(true),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Service manifest exposing the relay
    pub fn service(&self) -> Service {
        Service {
            metadata: self.metadata(),
            spec: Some(ServiceSpec {
                type_: Some(self.service_type.clone()),
                selector: Some(self.selector_labels()),
                ports: Some(
                    self.ports
                        .iter()
                        .map(|p| ServicePort {
                            name: Some(p.name.clone()),
                            port: i32::from(p.port),
                            target_port: Some(IntOrString::Int(i32::from(p.port))),
                            protocol: Some(p.protocol.service_protocol().to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
