//! Wiring of the control plane stages
//!
//! ```text
//! watchers -> Store --trigger--> Renderer --sweeps--> Operator --batches--> Updater
//!                                                        |
//!                                                        +--> ConfigDistributor --> relays
//! ```
//!
//! Each stage is one tokio task. Stages only talk through bounded channels
//! and all of them stop on the shared [`CancellationToken`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::distribution::ConfigDistributor;
use crate::operator::{GatewayClient, Operator};
use crate::render::Renderer;
use crate::store::Store;
use crate::updater::{StatusClient, Updater};
use crate::Error;

/// Running control plane stages
pub struct Pipeline {
    store: Arc<Store>,
    distributor: ConfigDistributor,
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Start renderer, operator and updater tasks
    ///
    /// The store's change trigger is (re)attached to the new renderer. The
    /// pipeline stops when `token` is cancelled or [`Pipeline::shutdown`] is
    /// called.
    pub fn spawn(
        config: &ControllerConfig,
        store: Arc<Store>,
        gateway_client: Arc<dyn GatewayClient>,
        status_client: Arc<dyn StatusClient>,
        distributor: ConfigDistributor,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        config.validate()?;

        // One pending trigger is enough: the renderer always reads the newest snapshot
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (sweep_tx, sweep_rx) = mpsc::channel(config.channel_capacity);
        let (status_tx, status_rx) = mpsc::channel(config.channel_capacity);
        store.set_trigger(trigger_tx);

        let renderer = Renderer::new(config);
        let operator = Operator::new(config, gateway_client, distributor.clone());
        let updater = Updater::new(config, status_client);

        let tasks = vec![
            (
                "renderer",
                tokio::spawn(renderer.run(store.clone(), trigger_rx, sweep_tx, token.clone())),
            ),
            ("operator", tokio::spawn(operator.run(sweep_rx, status_tx, token.clone()))),
            ("updater", tokio::spawn(updater.run(status_rx, token.clone()))),
        ];
        info!(controller = %config.controller_name, "Pipeline started");

        Ok(Self {
            store,
            distributor,
            token,
            tasks,
        })
    }

    /// Store the pipeline renders from
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Distributor the operator publishes to
    pub fn distributor(&self) -> &ConfigDistributor {
        &self.distributor
    }

    /// Cancel every stage and wait for it to stop
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Pipeline task panicked");
            }
        }
        info!("Pipeline stopped");
    }
}
