//! Operator: turns render sweeps into side effects
//!
//! For every sweep the operator:
//!
//! 1. Reconciles each gateway's relay workload. Active gateways get the
//!    finalizer before anything is created; invalid and terminating ones
//!    have their workload deleted.
//! 2. Merges the contributions of all active gateways into one config
//!    artifact per target, writes changed artifacts, deletes artifacts no
//!    gateway contributes to any more, and publishes every write to the
//!    [`ConfigDistributor`].
//! 3. Forwards the sweep's statuses to the updater. When gateways are ready
//!    to release their finalizer it waits for the updater's report and only
//!    removes the finalizer once the gateway's terminal status was written.
//!
//! Gateways whose render failed keep whatever they contributed before.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::crd::{ObjectKey, ResourceKey};
use crate::dataplane::{DataplaneWorkload, GatewayOwner};
use crate::distribution::ConfigDistributor;
use crate::document::RenderedConfig;
use crate::render::{GatewayRender, GatewayState, RenderSweep};
use crate::retry::{retry_transient, RetryConfig};
use crate::updater::{StatusBatch, UpdateReport};
use crate::Error;

/// A persisted configuration document and the gateways it belongs to
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigArtifact {
    /// Artifact identity
    pub key: ObjectKey,
    /// Merged document
    pub config: RenderedConfig,
    /// Contributing gateways, sorted
    pub owners: Vec<GatewayOwner>,
}

/// Side effects the operator performs against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Create or update the relay workload of a gateway
    async fn apply_workload(&self, workload: &DataplaneWorkload) -> Result<(), Error>;

    /// Delete the relay workload of a gateway; absent workloads are not an error
    async fn delete_workload(&self, gateway: &ObjectKey) -> Result<(), Error>;

    /// Create or update a config artifact
    async fn apply_artifact(&self, artifact: &ConfigArtifact) -> Result<(), Error>;

    /// Delete a config artifact; absent artifacts are not an error
    async fn delete_artifact(&self, key: &ObjectKey) -> Result<(), Error>;

    /// Add a finalizer to a gateway if it is not present
    async fn add_finalizer(&self, gateway: &ObjectKey, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a gateway if it is present
    async fn remove_finalizer(&self, gateway: &ObjectKey, finalizer: &str) -> Result<(), Error>;
}

/// What the operator remembers about a gateway between sweeps
#[derive(Clone, Debug, Default)]
struct Tracked {
    target: Option<ObjectKey>,
    contribution: Option<RenderedConfig>,
    owner: Option<GatewayOwner>,
    /// Last workload written; only meaningful when `synced`
    workload: Option<DataplaneWorkload>,
    synced: bool,
}

impl Tracked {
    fn is_clean(&self) -> bool {
        self.contribution.is_none() && self.synced && self.workload.is_none()
    }
}

/// Applies render sweeps to the cluster
pub struct Operator {
    client: Arc<dyn GatewayClient>,
    distributor: ConfigDistributor,
    finalizer: String,
    write_retry: RetryConfig,
    gateways: BTreeMap<ObjectKey, Tracked>,
    artifacts: BTreeMap<ObjectKey, ConfigArtifact>,
}

impl Operator {
    /// Create an operator writing through `client` and publishing to `distributor`
    pub fn new(
        config: &ControllerConfig,
        client: Arc<dyn GatewayClient>,
        distributor: ConfigDistributor,
    ) -> Self {
        Self {
            client,
            distributor,
            finalizer: config.finalizer.clone(),
            write_retry: config.write_retry.clone(),
            gateways: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Reconcile derived resources for a sweep
    ///
    /// Returns the gateways whose teardown is complete and whose finalizer
    /// can go once their statuses are written.
    #[instrument(skip_all, fields(generation = sweep.generation))]
    pub async fn reconcile(&mut self, sweep: &RenderSweep) -> Vec<ObjectKey> {
        for render in sweep.gateways.values() {
            match render.state {
                GatewayState::Active => self.ensure_active(render).await,
                GatewayState::Invalid | GatewayState::Terminating => self.tear_down(render).await,
            }
        }

        let vanished: Vec<ObjectKey> = self
            .gateways
            .keys()
            .filter(|key| !sweep.gateways.contains_key(*key) && !sweep.failures.contains_key(*key))
            .cloned()
            .collect();
        for key in vanished {
            debug!(gateway = %key, "Gateway gone, removing derived resources");
            self.release_workload(&key).await;
            if let Some(tracked) = self.gateways.get_mut(&key) {
                tracked.contribution = None;
            }
        }

        let failed_targets = self.sync_artifacts().await;
        self.gateways.retain(|_, tracked| {
            !tracked.is_clean()
                || tracked.target.as_ref().is_some_and(|t| failed_targets.contains(t))
        });

        sweep
            .gateways
            .values()
            .filter(|r| r.state != GatewayState::Active && r.has_finalizer)
            .filter(|r| !self.gateways.contains_key(&r.gateway))
            .map(|r| r.gateway.clone())
            .collect()
    }

    async fn ensure_active(&mut self, render: &GatewayRender) {
        let key = &render.gateway;
        if !render.has_finalizer {
            let client = self.client.as_ref();
            let finalizer = self.finalizer.as_str();
            let added = retry_transient(&self.write_retry, "add_finalizer", || {
                client.add_finalizer(key, finalizer)
            })
            .await;
            if let Err(e) = added {
                warn!(
                    gateway = %key,
                    error = %e,
                    "Failed to add finalizer, not creating derived resources"
                );
                return;
            }
            info!(gateway = %key, "Added finalizer");
        }

        let tracked = self.gateways.entry(key.clone()).or_default();
        tracked.target = render.target.clone();
        tracked.contribution = render.config.clone();
        tracked.owner = render.owner.clone();

        if tracked.synced && tracked.workload == render.workload {
            return;
        }
        let client = self.client.as_ref();
        let result = match &render.workload {
            Some(workload) => {
                retry_transient(&self.write_retry, "apply_workload", || {
                    client.apply_workload(workload)
                })
                .await
            }
            None => {
                retry_transient(&self.write_retry, "delete_workload", || {
                    client.delete_workload(key)
                })
                .await
            }
        };
        match result {
            Ok(()) => {
                debug!(gateway = %key, present = render.workload.is_some(), "Workload reconciled");
                tracked.workload = render.workload.clone();
                tracked.synced = true;
            }
            Err(e) => {
                warn!(gateway = %key, error = %e, "Failed to reconcile workload");
                tracked.synced = false;
            }
        }
    }

    async fn tear_down(&mut self, render: &GatewayRender) {
        let key = &render.gateway;
        if !self.gateways.contains_key(key) {
            if !render.has_finalizer {
                return;
            }
            // Nothing remembered (e.g. after a restart): assume the default target
            self.gateways.insert(
                key.clone(),
                Tracked {
                    target: Some(ObjectKey::namespaced(
                        key.namespace_or_default(),
                        key.name.clone(),
                    )),
                    ..Default::default()
                },
            );
        }
        if let Some(tracked) = self.gateways.get_mut(key) {
            tracked.contribution = None;
        }
        self.release_workload(key).await;
    }

    /// Delete a gateway's workload unless it is known to be gone
    async fn release_workload(&mut self, key: &ObjectKey) {
        let Some(tracked) = self.gateways.get_mut(key) else {
            return;
        };
        if tracked.synced && tracked.workload.is_none() {
            return;
        }
        let client = self.client.as_ref();
        let deleted = retry_transient(&self.write_retry, "delete_workload", || {
            client.delete_workload(key)
        })
        .await;
        match deleted {
            Ok(()) => {
                info!(gateway = %key, "Deleted relay workload");
                tracked.workload = None;
                tracked.synced = true;
            }
            Err(e) => {
                warn!(gateway = %key, error = %e, "Failed to delete relay workload");
                tracked.synced = false;
            }
        }
    }

    /// Artifacts every tracked contribution adds up to
    fn desired_artifacts(&self) -> BTreeMap<ObjectKey, ConfigArtifact> {
        let mut desired: BTreeMap<ObjectKey, ConfigArtifact> = BTreeMap::new();
        for tracked in self.gateways.values() {
            let (Some(target), Some(contribution)) = (&tracked.target, &tracked.contribution) else {
                continue;
            };
            let artifact = desired.entry(target.clone()).or_insert_with(|| ConfigArtifact {
                key: target.clone(),
                config: RenderedConfig::default(),
                owners: Vec::new(),
            });
            artifact.config.merge(contribution);
            artifact.owners.extend(tracked.owner.clone());
        }
        for artifact in desired.values_mut() {
            artifact.owners.sort();
            artifact.owners.dedup();
        }
        desired
    }

    /// Write changed artifacts and delete stale ones; returns targets whose
    /// write failed
    async fn sync_artifacts(&mut self) -> BTreeSet<ObjectKey> {
        let desired = self.desired_artifacts();
        let mut failed = BTreeSet::new();
        let client = self.client.as_ref();

        for (target, artifact) in &desired {
            if self.artifacts.get(target) == Some(artifact) {
                continue;
            }
            let applied = retry_transient(&self.write_retry, "apply_artifact", || {
                client.apply_artifact(artifact)
            })
            .await;
            match applied {
                Ok(()) => {
                    let version = self.distributor.publish(target, artifact.config.clone());
                    info!(
                        artifact = %target,
                        version,
                        listeners = artifact.config.listeners.len(),
                        clusters = artifact.config.clusters.len(),
                        "Config artifact written"
                    );
                    self.artifacts.insert(target.clone(), artifact.clone());
                }
                Err(e) => {
                    warn!(artifact = %target, error = %e, "Failed to write config artifact");
                    failed.insert(target.clone());
                }
            }
        }

        let stale: BTreeSet<ObjectKey> = self
            .artifacts
            .keys()
            .cloned()
            .chain(self.gateways.values().filter_map(|t| t.target.clone()))
            .filter(|target| !desired.contains_key(target))
            .collect();
        for target in stale {
            let deleted = retry_transient(&self.write_retry, "delete_artifact", || {
                client.delete_artifact(&target)
            })
            .await;
            match deleted {
                Ok(()) => {
                    info!(artifact = %target, "Config artifact deleted");
                    self.artifacts.remove(&target);
                    self.distributor.remove(&target);
                }
                Err(e) => {
                    warn!(artifact = %target, error = %e, "Failed to delete config artifact");
                    failed.insert(target);
                }
            }
        }
        failed
    }

    /// Remove finalizers of gateways whose terminal status was written
    pub async fn release_finalizers(&self, gateways: &[ObjectKey], report: &UpdateReport) {
        let client = self.client.as_ref();
        let finalizer = self.finalizer.as_str();
        for key in gateways {
            if !report.settled(&ResourceKey::gateway(key.clone())) {
                debug!(gateway = %key, "Terminal status not written yet, keeping finalizer");
                continue;
            }
            let removed = retry_transient(&self.write_retry, "remove_finalizer", || {
                client.remove_finalizer(key, finalizer)
            })
            .await;
            match removed {
                Ok(()) => info!(gateway = %key, "Removed finalizer"),
                Err(e) => warn!(gateway = %key, error = %e, "Failed to remove finalizer"),
            }
        }
    }

    async fn handle(
        &mut self,
        sweep: RenderSweep,
        statuses: &mpsc::Sender<StatusBatch>,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        let release = self.reconcile(&sweep).await;

        let (ack, report) = if release.is_empty() {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let batch = StatusBatch {
            generation: sweep.generation,
            statuses: sweep.statuses,
            ack,
        };
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            sent = statuses.send(batch) => {
                sent.map_err(|_| Error::channel_closed("status batches"))?
            }
        }

        if let Some(report) = report {
            let report = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                report = report => report.map_err(|_| Error::channel_closed("status report"))?,
            };
            self.release_finalizers(&release, &report).await;
        }
        Ok(())
    }

    /// Reconcile sweeps until cancelled
    ///
    /// Sweeps describe the full desired state, so when several queue up
    /// only the newest is applied.
    pub async fn run(
        mut self,
        mut sweeps: mpsc::Receiver<RenderSweep>,
        statuses: mpsc::Sender<StatusBatch>,
        token: CancellationToken,
    ) {
        info!("Operator started");
        loop {
            let mut sweep = tokio::select! {
                _ = token.cancelled() => break,
                sweep = sweeps.recv() => match sweep {
                    Some(sweep) => sweep,
                    None => break,
                },
            };
            while let Ok(newer) = sweeps.try_recv() {
                sweep = newer;
            }

            if let Err(e) = self.handle(sweep, &statuses, &token).await {
                warn!(error = %e, "Operator stopping");
                break;
            }
        }
        info!("Operator stopped");
    }
}
