use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::watch;
use tracing::info;

use idhub_core::workflows::{HolderRequestState, IssuanceProcessState, holder_request, issuance};
use idhub_core::{
    EngineConfig, EventBus, LoggingListener, ProcessManager, SharedClock, WorkflowState,
};

use crate::backend::{Backend, Stores};
use crate::clients::{HttpCredentialIssuer, HttpIssuerClient};

#[derive(Args)]
pub struct Serve {
    /// YAML engine configuration (defaults plus IDHUB_* environment variables when omitted)
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl Serve {
    pub fn load_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(EngineConfig::default()),
        }
    }

    pub async fn execute(self, backend: &Backend, clock: SharedClock) -> Result<()> {
        let config = self.load_config()?;
        backend.run_migrations().await?;
        let stores = backend.stores(clock.clone())?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = start_managers(&config, &stores, clock, shutdown_rx)?;
        info!(
            runtime_id = %config.runtime_id,
            backend = backend.name(),
            "idhub engine running, press Ctrl+C to stop"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("shutdown requested, waiting for in-flight work");
        let _ = shutdown_tx.send(true);
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

fn event_bus() -> EventBus {
    let mut events = EventBus::new();
    events.subscribe(Arc::new(LoggingListener));
    events
}

/// Spawns one process manager per workflow; they stop once `shutdown` flips.
pub fn start_managers(
    config: &EngineConfig,
    stores: &Stores,
    clock: SharedClock,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let issuer = Arc::new(HttpIssuerClient::new(&config.issuer_endpoint)?);
    let holder_registry =
        holder_request::registry(issuer, clock.clone(), config.requested_time_limit())?;
    let holder_manager = Arc::new(ProcessManager::new(
        stores.holder_requests.clone(),
        Arc::new(holder_registry),
        event_bus(),
        clock.clone(),
        config.owner_token(HolderRequestState::WORKFLOW),
        config.holder_requests.clone(),
    ));

    let delivery = Arc::new(HttpCredentialIssuer::new(&config.delivery_endpoint)?);
    let issuance_manager = Arc::new(ProcessManager::new(
        stores.issuance.clone(),
        Arc::new(issuance::registry(delivery)?),
        event_bus(),
        clock,
        config.owner_token(IssuanceProcessState::WORKFLOW),
        config.issuance.clone(),
    ));

    Ok(vec![
        holder_manager.spawn(shutdown.clone()),
        issuance_manager.spawn(shutdown),
    ])
}
