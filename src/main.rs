// src/main.rs
use anyhow::{anyhow, Context, Result};
use tokio::time::{timeout, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rabbit_autoconfig::config::DEFAULT_PREFIX;
use rabbit_autoconfig::rabbitmq::ConnectionFactory;
use rabbit_autoconfig::{load_properties, AutoConfiguration, ComponentRegistry, Definitions, PropertySet};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const USAGE: &str = "usage: rabbit-autoconfig [--connect] [key=value ...]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut connect = false;
    let mut entries = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--connect" => connect = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(());
            }
            flag if flag.starts_with("--") => return Err(anyhow!("unknown flag '{}'\n{}", flag, USAGE)),
            _ => entries.push(arg),
        }
    }

    let mut properties = load_properties(DEFAULT_PREFIX).context("Failed to load properties")?;
    properties.merge(PropertySet::from_entries(&entries).context("Invalid command-line property")?);

    let registry = AutoConfiguration::new(properties)
        .resolve(Definitions::new())
        .context("RabbitMQ auto-configuration failed")?;
    report(&registry);

    if connect {
        check_broker(&registry).await?;
    }
    Ok(())
}

fn report(registry: &ComponentRegistry) {
    for (name, component, origin) in registry.iter() {
        info!(name, role = %component.role(), ?origin, "Registered component");
    }
}

async fn check_broker(registry: &ComponentRegistry) -> Result<()> {
    let factory = registry.connection_factory()?;
    info!(
        host = factory.host(),
        port = factory.port(),
        virtual_host = factory.virtual_host(),
        secure = factory.socket_factory().is_secure(),
        "Checking RabbitMQ broker"
    );

    match timeout(CONNECT_TIMEOUT, factory.create_connection()).await {
        Ok(Ok(_connection)) => {
            info!("Successfully connected to RabbitMQ");
            factory.close().await?;
            Ok(())
        }
        Ok(Err(e)) => {
            error!("RabbitMQ connection check failed: {}", e);
            Err(anyhow!("Failed to connect to RabbitMQ: {}", e))
        }
        Err(_) => Err(anyhow!(
            "Connection to RabbitMQ timed out after {} seconds",
            CONNECT_TIMEOUT.as_secs()
        )),
    }
}
