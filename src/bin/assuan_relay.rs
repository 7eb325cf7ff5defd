//! Assuan relay CLI binary.
//!
//! # Commands
//!
//! - `agent` - Connect to the backend agent and serve the stream bridge
//! - `client` - Listen for Assuan clients and forward through the bridge
//! - `relay` - Both sides in one process
//! - `parse-descriptor` - Check a descriptor file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use assuan_relay::{
    serve_bridge, AgentCoordinator, ClientListener, Config, Descriptor, StatsSummary,
    StreamBridge, VERSION,
};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "assuan-relay")]
#[command(version = VERSION)]
#[command(about = "Relay an Assuan agent protocol across a boundary", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the backend agent and serve the stream bridge
    Agent {
        /// Descriptor file (port + nonce)
        #[arg(short, long)]
        descriptor: Option<PathBuf>,

        /// Bridge listen address
        #[arg(long)]
        bridge_listen: Option<SocketAddr>,
    },

    /// Listen for Assuan clients and forward through the stream bridge
    Client {
        /// Client socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Bridge address of the agent side
        #[arg(long)]
        bridge_connect: Option<SocketAddr>,
    },

    /// Run both sides in one process
    Relay {
        /// Descriptor file (port + nonce)
        #[arg(short, long)]
        descriptor: Option<PathBuf>,

        /// Client socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Parse a descriptor file and print its port
    ParseDescriptor {
        /// Descriptor file
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::ParseDescriptor { file } = &cli.command {
        return cmd_parse_descriptor(file);
    }

    init_logging(cli.verbose, cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Agent {
            descriptor,
            bridge_listen,
        } => cmd_agent(config, descriptor, bridge_listen),

        Commands::Client {
            socket,
            bridge_connect,
        } => cmd_client(config, socket, bridge_connect),

        Commands::Relay { descriptor, socket } => cmd_relay(config, descriptor, socket),

        Commands::ParseDescriptor { .. } => Ok(()),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// File settings, overridden by `ASSUAN_RELAY_*` variables.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    Ok(file.merge(Config::from_env()))
}

fn log_summary(side: &str, summary: StatsSummary) {
    tracing::info!(
        side,
        opened = summary.opened,
        rejected = summary.rejected,
        closed = summary.closed,
        fatal = summary.fatal,
        commands = summary.commands,
        inquiries = summary.inquiries,
        "session totals"
    );
}

fn cmd_parse_descriptor(file: &std::path::Path) -> anyhow::Result<()> {
    let descriptor = Descriptor::load(file)
        .with_context(|| format!("parsing descriptor {}", file.display()))?;

    println!("Descriptor: {}", file.display());
    println!("  Port:  {}", descriptor.port);
    println!("  Nonce: {} bytes (redacted)", descriptor.nonce.as_bytes().len());
    Ok(())
}

fn cmd_agent(
    mut config: Config,
    descriptor: Option<PathBuf>,
    bridge_listen: Option<SocketAddr>,
) -> anyhow::Result<()> {
    if let Some(path) = descriptor {
        config.agent = config.agent.with_descriptor(path);
    }
    let addr = bridge_listen.unwrap_or(config.bridge.addr);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let agent = Arc::new(AgentCoordinator::bootstrap(config.agent)?);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding bridge on {addr}"))?;

        let (stop, shutdown) = watch::channel(false);
        let server = tokio::spawn(serve_bridge(
            listener,
            Arc::clone(&agent),
            config.bridge.max_line_bytes,
            shutdown,
        ));

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        stop.send_replace(true);
        agent.stop().await;
        server.await??;

        log_summary("agent", agent.stats().summary());
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(unix)]
fn cmd_client(
    mut config: Config,
    socket: Option<PathBuf>,
    bridge_connect: Option<SocketAddr>,
) -> anyhow::Result<()> {
    if let Some(path) = socket {
        config.client = config.client.with_socket(path);
    }
    let addr = bridge_connect.unwrap_or(config.bridge.addr);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let bridge = Arc::new(StreamBridge::connect(addr, config.bridge.max_line_bytes).await?);
        let client = Arc::new(ClientListener::new(config.client, bridge));
        let socket = client.bind()?;

        let serving = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.serve(socket).await })
        };

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        client.stop().await;
        serving.await??;

        log_summary("client", client.stats().summary());
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(unix)]
fn cmd_relay(
    mut config: Config,
    descriptor: Option<PathBuf>,
    socket: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(path) = descriptor {
        config.agent = config.agent.with_descriptor(path);
    }
    if let Some(path) = socket {
        config.client = config.client.with_socket(path);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let agent = Arc::new(AgentCoordinator::bootstrap(config.agent)?);
        let client = Arc::new(ClientListener::new(config.client, Arc::clone(&agent)));
        let socket = client.bind()?;

        let serving = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.serve(socket).await })
        };

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        client.stop().await;
        agent.stop().await;
        serving.await??;

        log_summary("client", client.stats().summary());
        log_summary("agent", agent.stats().summary());
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(not(unix))]
fn cmd_client(_: Config, _: Option<PathBuf>, _: Option<SocketAddr>) -> anyhow::Result<()> {
    anyhow::bail!("the client side needs Unix domain sockets")
}

#[cfg(not(unix))]
fn cmd_relay(_: Config, _: Option<PathBuf>, _: Option<PathBuf>) -> anyhow::Result<()> {
    anyhow::bail!("the client side needs Unix domain sockets")
}
