//! agent-relay node - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agent_relay::{
    agent::{Agent, AgentDeps},
    config::Config,
    executor::EchoExecutor,
    registry::{InMemoryRegistry, Registry},
    transport::HttpTransport,
};

#[derive(Parser, Debug)]
#[command(name = "agent-relay")]
#[command(about = "Relay node that receives, executes and answers agent tasks over HTTP")]
#[command(version)]
struct Args {
    /// Listener host (overrides AGENT_HOST)
    #[arg(long, env = "AGENT_HOST")]
    host: Option<String>,

    /// Listener port, 0 for an OS-assigned port (overrides AGENT_PORT)
    #[arg(long, env = "AGENT_PORT")]
    port: Option<u16>,

    /// Agent name used as the message sender (overrides AGENT_NAME)
    #[arg(long, env = "AGENT_NAME")]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent_relay=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Also loads .env, so it must run before clap reads env-backed flags
    let mut config = Config::from_env()?;
    let args = Args::parse();

    if let Some(host) = args.host {
        config.transport.host = host;
    }
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    if let Some(name) = args.name {
        config.agent.name = name;
    }
    tracing::info!("Loaded configuration for agent: {}", config.agent.name);

    let transport = HttpTransport::new(config.transport.clone())?;
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());

    let agent = Agent::new(
        config.agent,
        config.retention,
        AgentDeps {
            transport: Arc::new(transport),
            executor: Arc::new(EchoExecutor),
            registry: Some(registry),
        },
    );

    agent.run().await?;
    tracing::info!("Accepting messages at {}", agent.url());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        }
        _ = agent.stopped() => {
            tracing::info!("Stopped by control message");
        }
    }

    agent.stop().await?;
    Ok(())
}
