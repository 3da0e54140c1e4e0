//! Status updater: writes rendered statuses back to the API server
//!
//! The operator forwards the statuses of every render sweep as a
//! [`StatusBatch`]. Each batch carries the full desired status set, so when
//! several batches queue up only the newest one matters. Every desired
//! status is compared against the live object, never against what this
//! updater wrote before: the object may have been recreated or its status
//! overwritten since.
//!
//! Every write is a read-stamp-compare-patch cycle guarded by the object's
//! resourceVersion. A conflict re-reads and retries right away, a bounded
//! number of times. Writes that still fail stay pending and are retried on
//! a timer until a newer batch supersedes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::crd::ResourceKey;
use crate::render::ResourceStatus;
use crate::retry::retry_on_conflict;
use crate::Error;

/// Statuses of one render sweep
#[derive(Debug, Default)]
pub struct StatusBatch {
    /// Store generation the statuses were rendered from
    pub generation: u64,
    /// Desired status per resource
    pub statuses: BTreeMap<ResourceKey, ResourceStatus>,
    /// Receives the outcome once the batch has been written
    pub ack: Option<oneshot::Sender<UpdateReport>>,
}

/// Outcome of writing a batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Statuses written
    pub patched: Vec<ResourceKey>,
    /// Statuses already up to date
    pub unchanged: Vec<ResourceKey>,
    /// Resources that no longer exist
    pub missing: Vec<ResourceKey>,
    /// Statuses that could not be written and remain pending
    pub failed: Vec<ResourceKey>,
}

impl UpdateReport {
    /// Whether the resource's status is settled (written, unchanged or gone)
    pub fn settled(&self, key: &ResourceKey) -> bool {
        !self.failed.contains(key)
    }
}

/// Status currently stored on a resource
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentStatus {
    /// resourceVersion the status was read at
    pub resource_version: Option<String>,
    /// Parsed status, `None` when the resource has none yet
    pub status: Option<ResourceStatus>,
}

/// Reads and writes resource statuses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Current status of a resource, `None` when the resource does not exist
    async fn get_status(&self, key: &ResourceKey) -> Result<Option<CurrentStatus>, Error>;

    /// Replace a resource's status, failing with [`Error::Conflict`] when
    /// `resource_version` is stale
    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<String>,
        status: &ResourceStatus,
    ) -> Result<(), Error>;
}

enum Outcome {
    Patched,
    Unchanged,
    Missing,
}

/// Writes statuses with optimistic concurrency
pub struct Updater {
    client: Arc<dyn StatusClient>,
    controller_name: String,
    attempts: u32,
    retry_interval: Duration,
    pending: BTreeMap<ResourceKey, ResourceStatus>,
}

impl Updater {
    /// Create an updater writing through `client`
    pub fn new(config: &ControllerConfig, client: Arc<dyn StatusClient>) -> Self {
        Self {
            client,
            controller_name: config.controller_name.clone(),
            attempts: config.status_retry_attempts,
            retry_interval: config.status_retry_interval,
            pending: BTreeMap::new(),
        }
    }

    /// Statuses waiting to be written
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Replace the desired status set
    ///
    /// Anything pending from earlier batches is superseded.
    pub fn set_desired(&mut self, statuses: BTreeMap<ResourceKey, ResourceStatus>) {
        self.pending = statuses;
    }

    /// Try to write every pending status once
    #[instrument(skip(self), fields(pending = self.pending.len()))]
    pub async fn flush(&mut self) -> UpdateReport {
        let mut report = UpdateReport::default();
        let pending = std::mem::take(&mut self.pending);

        for (key, status) in pending {
            match self.write(&key, &status).await {
                Ok(Outcome::Patched) => {
                    debug!(resource = %key, "Patched status");
                    report.patched.push(key);
                }
                Ok(Outcome::Unchanged) => report.unchanged.push(key),
                Ok(Outcome::Missing) => {
                    debug!(resource = %key, "Resource gone, dropping status");
                    report.missing.push(key);
                }
                Err(e) => {
                    warn!(resource = %key, error = %e, "Status update failed, will retry");
                    self.pending.insert(key.clone(), status);
                    report.failed.push(key);
                }
            }
        }
        report
    }

    async fn write(&self, key: &ResourceKey, desired: &ResourceStatus) -> Result<Outcome, Error> {
        let client = self.client.as_ref();
        let controller = self.controller_name.as_str();
        let result = retry_on_conflict(self.attempts, "patch_status", move || async move {
            let Some(current) = client.get_status(key).await? else {
                return Ok(Outcome::Missing);
            };
            let stamped = desired.stamped(current.status.as_ref(), controller, Utc::now());
            if current.status.as_ref() == Some(&stamped) {
                return Ok(Outcome::Unchanged);
            }
            client.patch_status(key, current.resource_version, &stamped).await?;
            Ok(Outcome::Patched)
        })
        .await;

        match result {
            Err(e) if e.is_not_found() => Ok(Outcome::Missing),
            other => other,
        }
    }

    /// Write batches until cancelled
    pub async fn run(
        mut self,
        mut batches: mpsc::Receiver<StatusBatch>,
        token: CancellationToken,
    ) {
        info!("Status updater started");
        let mut retry = tokio::time::interval(self.retry_interval);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                batch = batches.recv() => {
                    let Some(mut batch) = batch else {
                        debug!("Status batch channel closed");
                        break;
                    };
                    let mut acks: Vec<_> = batch.ack.take().into_iter().collect();
                    while let Ok(mut newer) = batches.try_recv() {
                        acks.extend(newer.ack.take());
                        batch = newer;
                    }

                    debug!(
                        generation = batch.generation,
                        statuses = batch.statuses.len(),
                        "Writing statuses"
                    );
                    self.set_desired(batch.statuses);
                    let report = self.flush().await;
                    for ack in acks {
                        let _ = ack.send(report.clone());
                    }
                }
                _ = retry.tick(), if !self.pending.is_empty() => {
                    let report = self.flush().await;
                    debug!(failed = report.failed.len(), "Retried pending statuses");
                }
            }
        }
        info!("Status updater stopped");
    }
}
