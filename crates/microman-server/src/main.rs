use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use microman_broker::Transport;
use microman_config::{Config, ConfigManager};
use microman_gateway::Gateway;
use microman_server::handlers::{self, HandlerOptions, Profile};
use microman_server::Standalone;
use microman_worker::Worker;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "microman")]
#[command(about = "Real-time request/reply gateway and topic workers")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "MICROMAN_CONFIG", default_value = "~/.microman/config.json")]
    config: String,

    /// Gateway host (overrides config)
    #[arg(long, env = "MM_API_HOST")]
    host: Option<String>,

    /// Gateway port (overrides config)
    #[arg(long, env = "MM_API_PORT")]
    port: Option<u16>,

    /// Broker URL (overrides config)
    #[arg(long, env = "MM_BROKER_URL")]
    broker_url: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Secret used to sign access tokens
    #[arg(long, env = "MM_API_SECRET", default_value = "microman-dev-secret", hide_env_values = true)]
    secret: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve WebSocket clients
    Gateway,

    /// Consume the work channel
    Worker {
        #[arg(long, value_enum, default_value = "all")]
        profile: Profile,

        /// Competing consumer group
        #[arg(long, env = "MM_WORKER_GROUP")]
        group: Option<String>,

        /// Binding pattern; repeatable
        #[arg(long = "binding")]
        bindings: Vec<String>,

        /// Requeue a failed message once
        #[arg(long, default_value = "false")]
        auto_retry: bool,
    },

    /// Gateway and workers over the in-process broker
    Standalone {
        /// One worker per profile
        #[arg(long, value_enum, num_args = 1.., default_values_t = [Profile::Echo, Profile::Misc])]
        profiles: Vec<Profile>,
    },
}

#[cfg(feature = "amqp")]
fn broker_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    Ok(Arc::new(microman_broker::AmqpTransport::new(&config.broker.url)))
}

#[cfg(not(feature = "amqp"))]
fn broker_transport(_config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    anyhow::bail!("this build has no broker transport; rebuild with `--features amqp` or use `standalone`")
}

async fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = microman_config::expand_tilde(&cli.config)
        .unwrap_or_else(|| std::path::PathBuf::from(&cli.config));
    let manager = ConfigManager::load(&path)
        .await
        .with_context(|| format!("failed to load config from {:?}", path))?;
    let mut config = manager.snapshot().await;

    if let Some(host) = &cli.host {
        config.gateway.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(url) = &cli.broker_url {
        config.broker.url = url.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    if let Command::Worker {
        group,
        bindings,
        auto_retry,
        ..
    } = &cli.command
    {
        if group.is_some() {
            config.worker.group = group.clone();
        }
        if !bindings.is_empty() {
            config.worker.bindings = bindings.clone();
        }
        config.worker.auto_retry |= *auto_retry;
    }

    ConfigManager::validate(&config)?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    let _log_manager = microman_observability::init(&config.logging)?;

    let options = HandlerOptions {
        secret: cli.secret.clone(),
        ..HandlerOptions::default()
    };

    match &cli.command {
        Command::Gateway => {
            let gateway = Gateway::start(broker_transport(&config)?, &config);
            let listener = TcpListener::bind(config.gateway.bind_addr()).await?;
            let serving = gateway.clone();
            let server = tokio::spawn(async move { serving.serve(listener).await });

            shutdown_signal().await;
            info!("Shutting down gateway");
            gateway.shutdown().await;
            server.await??;
        }
        Command::Worker { profile, .. } => {
            let registry = handlers::registry(*profile, &options)?;
            let worker = Worker::start(broker_transport(&config)?, &config, registry)?;
            info!(worker_id = %worker.id(), profile = ?profile, "Worker running");

            shutdown_signal().await;
            info!("Shutting down worker");
            worker.shutdown().await;
        }
        Command::Standalone { profiles } => {
            let registries = profiles
                .iter()
                .map(|profile| handlers::registry(*profile, &options))
                .collect::<Result<Vec<_>, _>>()?;
            let standalone = Arc::new(Standalone::start(&config, registries)?);
            standalone.ready().await?;

            let listener = TcpListener::bind(config.gateway.bind_addr()).await?;
            let serving = Arc::clone(&standalone);
            let server = tokio::spawn(async move { serving.serve(listener).await });

            shutdown_signal().await;
            info!("Shutting down");
            standalone.shutdown().await;
            server.await??;
        }
    }

    Ok(())
}
