use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tenant_rabbitmq::config::{self, CONFIG_FILE_NAME};
use tenant_rabbitmq::rabbitmq::{LapinConnector, LoggingHandler};
use tenant_rabbitmq::TenantBroker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing for logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if std::env::args().nth(1).as_deref() == Some("--init-config") {
        return config::create_default_config_file(Path::new(CONFIG_FILE_NAME));
    }

    info!("Loading configuration...");
    let config = config::load_config().context("Could not load config")?;

    let broker = TenantBroker::new(
        Arc::new(LapinConnector),
        config.channel_config(),
        Arc::new(LoggingHandler),
    )
    .with_exchange(config.topology.exchange.clone());
    info!(exchange = %broker.exchange(), "Tenant queues bind to exchange");

    info!("Connecting to RabbitMQ...");
    broker
        .establish_connection(&config.connection.uri)
        .await
        .context("Could not connect to RabbitMQ")?;

    broker
        .start_health_monitor(&config.connection.uri, config.health_check_interval())
        .await;

    for tenant in &config.tenants {
        if let Err(e) = start_tenant(&broker, tenant).await {
            error!(tenant = %tenant, error = %e, "Failed to start tenant queue");
        }
    }

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    broker.shutdown().await;
    Ok(())
}

async fn start_tenant(broker: &TenantBroker, tenant: &str) -> tenant_rabbitmq::Result<()> {
    broker.provision_queue(tenant).await?;
    broker.start_consuming(tenant).await
}
