//! Kubernetes-backed implementations of the operator and updater clients

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::crd::{Gateway, GatewayClass, ObjectKey, ObjectKind, ResourceKey, UdpRoute};
use crate::dataplane::DataplaneWorkload;
use crate::operator::{ConfigArtifact, GatewayClient};
use crate::render::ResourceStatus;
use crate::retry::retry_on_conflict;
use crate::updater::{CurrentStatus, StatusClient};
use crate::{Error, CONFIG_DATA_KEY, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};

/// Attempts for a finalizer update that keeps racing other writers
const FINALIZER_ATTEMPTS: u32 = 5;

/// Delete an object, treating "already gone" as success
async fn delete_if_present<K>(api: &Api<K>, name: &str, what: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!(resource = %what, "Deleted");
            Ok(())
        }
        Err(e) => match Error::from_kube(what, e) {
            e if e.is_not_found() => Ok(()),
            e => Err(e),
        },
    }
}

/// Applies workloads, artifacts and finalizers with server-side apply
pub struct KubeGatewayClient {
    client: Client,
}

impl KubeGatewayClient {
    /// Create a client on top of a kube [`Client`]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn update_finalizers(
        &self,
        key: &ObjectKey,
        finalizer: &str,
        add: bool,
    ) -> Result<(), Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), key.namespace_or_default());
        let api = &api;
        retry_on_conflict(FINALIZER_ATTEMPTS, "update_finalizers", move || async move {
            let gateway = api
                .get_opt(&key.name)
                .await
                .map_err(|e| Error::from_kube(key.to_string(), e))?;
            let Some(gateway) = gateway else {
                return if add {
                    Err(Error::not_found(format!("gateway {key}")))
                } else {
                    Ok(())
                };
            };

            let mut finalizers = gateway.finalizers().to_vec();
            let present = finalizers.iter().any(|f| f == finalizer);
            match (add, present) {
                (true, true) | (false, false) => return Ok(()),
                (true, false) => finalizers.push(finalizer.to_string()),
                (false, true) => finalizers.retain(|f| f != finalizer),
            }

            let patch = serde_json::json!({
                "metadata": {
                    "resourceVersion": gateway.resource_version(),
                    "finalizers": finalizers,
                }
            });
            api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| Error::from_kube(key.to_string(), e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl GatewayClient for KubeGatewayClient {
    async fn apply_workload(&self, workload: &DataplaneWorkload) -> Result<(), Error> {
        let namespace = workload.namespace();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments
            .patch(workload.name(), &params, &Patch::Apply(&workload.deployment()))
            .await
            .map_err(|e| Error::from_kube(format!("deployment {}", workload.gateway), e))?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        services
            .patch(workload.name(), &params, &Patch::Apply(&workload.service()))
            .await
            .map_err(|e| Error::from_kube(format!("service {}", workload.gateway), e))?;

        info!(
            gateway = %workload.gateway,
            dataplane = %workload.dataplane,
            ports = workload.ports.len(),
            "Applied relay workload"
        );
        Ok(())
    }

    async fn delete_workload(&self, gateway: &ObjectKey) -> Result<(), Error> {
        let namespace = gateway.namespace_or_default();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        delete_if_present(&deployments, &gateway.name, &format!("deployment {gateway}")).await?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        delete_if_present(&services, &gateway.name, &format!("service {gateway}")).await
    }

    async fn apply_artifact(&self, artifact: &ConfigArtifact) -> Result<(), Error> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(artifact.key.name.clone()),
                namespace: Some(artifact.key.namespace_or_default().to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_VALUE.to_string(),
                )])),
                owner_references: Some(
                    artifact
                        .owners
                        .iter()
                        .map(|o| o.owner_reference(false))
                        .collect(),
                ),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIG_DATA_KEY.to_string(),
                artifact.config.to_json()?,
            )])),
            ..Default::default()
        };

        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), artifact.key.namespace_or_default());
        api.patch(
            &artifact.key.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await
        .map_err(|e| Error::from_kube(format!("configmap {}", artifact.key), e))?;
        Ok(())
    }

    async fn delete_artifact(&self, key: &ObjectKey) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), key.namespace_or_default());
        delete_if_present(&api, &key.name, &format!("configmap {key}")).await
    }

    async fn add_finalizer(&self, gateway: &ObjectKey, finalizer: &str) -> Result<(), Error> {
        self.update_finalizers(gateway, finalizer, true).await
    }

    async fn remove_finalizer(&self, gateway: &ObjectKey, finalizer: &str) -> Result<(), Error> {
        self.update_finalizers(gateway, finalizer, false).await
    }
}

/// Reads and patches the status subresource of Gateway API objects
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Create a client on top of a kube [`Client`]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn classes(&self) -> Api<GatewayClass> {
        Api::all(self.client.clone())
    }

    fn gateways(&self, key: &ObjectKey) -> Api<Gateway> {
        Api::namespaced(self.client.clone(), key.namespace_or_default())
    }

    fn routes(&self, key: &ObjectKey) -> Api<UdpRoute> {
        Api::namespaced(self.client.clone(), key.namespace_or_default())
    }
}

async fn read_status<K>(
    api: Api<K>,
    key: &ResourceKey,
    status: impl FnOnce(K) -> Option<ResourceStatus>,
) -> Result<Option<CurrentStatus>, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let object = api
        .get_opt(&key.key.name)
        .await
        .map_err(|e| Error::from_kube(key.to_string(), e))?;
    Ok(object.map(|object| CurrentStatus {
        resource_version: object.resource_version(),
        status: status(object),
    }))
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn get_status(&self, key: &ResourceKey) -> Result<Option<CurrentStatus>, Error> {
        match key.kind {
            ObjectKind::GatewayClass => {
                read_status(self.classes(), key, |o| {
                    o.status.map(ResourceStatus::GatewayClass)
                })
                .await
            }
            ObjectKind::Gateway => {
                read_status(self.gateways(&key.key), key, |o| {
                    o.status.map(ResourceStatus::Gateway)
                })
                .await
            }
            ObjectKind::UdpRoute => {
                read_status(self.routes(&key.key), key, |o| {
                    o.status.map(ResourceStatus::UdpRoute)
                })
                .await
            }
            other => Err(Error::internal_with_context(
                "status",
                format!("{other} carries no status managed by turngate"),
            )),
        }
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<String>,
        status: &ResourceStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status.to_value()?,
        });
        let params = PatchParams::apply(FIELD_MANAGER);
        let name = &key.key.name;
        let result = match status {
            ResourceStatus::GatewayClass(_) => self
                .classes()
                .patch_status(name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ()),
            ResourceStatus::Gateway(_) => self
                .gateways(&key.key)
                .patch_status(name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ()),
            ResourceStatus::UdpRoute(_) => self
                .routes(&key.key)
                .patch_status(name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ()),
        };
        result.map_err(|e| Error::from_kube(key.to_string(), e))
    }
}
