use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_engine::Relay;
use tether_engine::config::{ConfigLoader, RelayConfig};
use tether_r::http::{self, AppState};
use tether_r::server::ObserverServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether", version, about = "Browser observation relay")]
struct Args {
    /// Config file (defaults to ./tether.yaml, then ~/.tether/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the observer WebSocket endpoint and the caller HTTP API
    Serve {
        /// Address to bind both listeners to
        #[arg(long)]
        bind: Option<String>,
        /// WebSocket port for in-page observers
        #[arg(long)]
        observer_port: Option<u16>,
        /// HTTP port for callers
        #[arg(long)]
        http_port: Option<u16>,
    },
    /// Print the effective configuration as YAML
    Config,
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    let config = match path {
        Some(path) => ConfigLoader::load_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_default().await?,
    };
    Ok(config)
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", bind, port))
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    let observer_addr = socket_addr(&config.server.bind, config.server.observer_port)?;
    let http_addr = socket_addr(&config.server.bind, config.server.http_port)?;

    let relay = Arc::new(Relay::new(config));
    let observers = ObserverServer::new(observer_addr, relay.clone())
        .start()
        .await
        .context("starting observer endpoint")?;

    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding {}", http_addr))?;
    http::serve(listener, AppState::new(relay), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await
    .context("serving caller API")?;

    observers.shutdown();
    info!("Relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `tether config` output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_ref()).await?;

    match args.command {
        Command::Serve {
            bind,
            observer_port,
            http_port,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = observer_port {
                config.server.observer_port = port;
            }
            if let Some(port) = http_port {
                config.server.http_port = port;
            }
            serve(config).await
        }
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
