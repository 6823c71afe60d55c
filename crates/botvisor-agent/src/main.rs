use std::sync::Arc;

use botvisor_agent::{AgentConfig, Host, PlanBook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env();
    let plans = PlanBook::load(config.plans_file.as_deref())?;
    tracing::info!(
        data_root = %config.data_root.display(),
        runtime = %config.runtime,
        "botvisor-agent starting"
    );

    let host = Host::open(config, Arc::new(plans)).await?;
    host.spawn_background().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; stopping bots");
    host.shutdown().await;

    Ok(())
}
