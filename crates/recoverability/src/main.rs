use std::sync::Arc;

use anyhow::Context;

use busmon_events::{InMemoryEventBus, Notification};
use busmon_recoverability::store::{InMemoryBatchStore, InMemoryFailedMessageStore};
use busmon_recoverability::transport::InMemoryTransport;
use busmon_recoverability::{Collaborators, RecoverabilityConfig, RecoverabilityHost};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    busmon_observability::init();

    let config = RecoverabilityConfig::from_env().context("invalid recoverability configuration")?;
    tracing::info!(
        staging_address = %config.staging_address,
        machine = %config.local_machine_name,
        "starting recoverability host"
    );

    let host = RecoverabilityHost::new(
        config,
        Collaborators {
            store: InMemoryBatchStore::arc(),
            messages: InMemoryFailedMessageStore::arc(),
            transport: InMemoryTransport::arc(),
            events: Arc::new(InMemoryEventBus::<Notification>::new()),
        },
    );
    host.start().await.context("failed to start recoverability host")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    host.shutdown().await;
    Ok(())
}
