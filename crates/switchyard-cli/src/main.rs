use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchyard_agents::{Agent, EchoBackend, Expert, ExpertProfile, QueryClient, RouterAgent};
use switchyard_bus::{Broker, create_bus};
use switchyard_core::MessageBus;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::SwitchyardConfig;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version)]
#[command(about = "Route queries to specialized expert agents over a message bus")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Run the TCP broker for multi-process deployments
    Broker {
        /// Listen address (defaults to bus.broker_addr)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Run the router and configured experts until Ctrl+C
    Serve,

    /// Run router, experts and a client; answer queries read from stdin
    Run,

    /// Send a one-shot query and print the answer
    Ask {
        /// The query to route
        query: String,

        /// Only start the client; the router and experts run elsewhere on the broker
        #[arg(long)]
        remote: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so answers on stdout stay machine-readable
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Broker { addr } => cmd_broker(&cli.config, addr).await,
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Ask { query, remote } => cmd_ask(&cli.config, &query, remote).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Switchyard initialized at {}", config_dir.display());
    println!("Edit {} to configure experts and routing.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_broker(config_path: &Option<PathBuf>, addr: Option<String>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => SwitchyardConfig::load(config_path)?.bus.broker_addr,
    };

    let broker = Broker::bind(&addr).await?;
    let handle = broker.handle();
    let cancel = CancellationToken::new();
    let server = broker.spawn(cancel.clone());

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    match server.await {
        Ok(Err(e)) => error!("Broker exited with error: {:#}", e),
        Err(e) => error!("Broker task failed: {}", e),
        Ok(Ok(())) => {}
    }

    println!("{}", serde_json::to_string_pretty(&handle.stats())?);
    Ok(())
}

/// Router plus experts sharing one bus
struct Mesh {
    bus: Arc<dyn MessageBus>,
    router: RouterAgent,
    experts: Vec<Agent>,
}

impl Mesh {
    async fn start(cfg: &SwitchyardConfig) -> Result<Self> {
        let bus = create_bus(&cfg.bus_options()).await?;
        let agent_config = cfg.agent_config();

        let router = RouterAgent::new(
            cfg.router.id.clone(),
            bus.clone(),
            cfg.router_config()?,
            agent_config.clone(),
        );
        router.start().await?;

        if cfg.experts.is_empty() {
            warn!("No experts configured; every query will fail to route");
        }

        let mut experts = Vec::with_capacity(cfg.experts.len());
        for entry in &cfg.experts {
            let Some(mut profile) = ExpertProfile::by_name(&entry.profile) else {
                anyhow::bail!("Unknown expert profile '{}'", entry.profile);
            };
            if !entry.categories.is_empty() {
                profile = profile.with_categories(entry.categories.clone());
            }

            let categories = profile.categories.clone();
            let metadata = serde_json::json!({
                "agent_type": profile.agent_type,
                "specialization": profile.specialization,
            });
            let backend = EchoBackend::new().with_latency(Duration::from_millis(entry.latency_ms));
            let agent = Expert::new(profile, Arc::new(backend))
                .with_cache_ttl(Duration::from_secs(entry.cache_ttl_secs))
                .into_agent(
                entry.id.clone(),
                bus.clone(),
                agent_config.clone(),
            );
            agent
                .start()
                .await
                .with_context(|| format!("Failed to start expert '{}'", entry.id))?;

            router.register_expert(&entry.id, categories, metadata);
            info!("Expert '{}' ({}) ready", entry.id, entry.profile);
            experts.push(agent);
        }

        Ok(Self {
            bus,
            router,
            experts,
        })
    }

    async fn stop(self) {
        for expert in &self.experts {
            if let Err(e) = expert.stop().await {
                warn!("Failed to stop expert '{}': {}", expert.id(), e);
            }
        }
        if let Err(e) = self.router.stop().await {
            warn!("Failed to stop router: {}", e);
        }
        if let Err(e) = self.bus.stop().await {
            warn!("Failed to stop bus: {}", e);
        }
    }
}

async fn start_client(cfg: &SwitchyardConfig, bus: Arc<dyn MessageBus>) -> Result<QueryClient> {
    let client = QueryClient::new(
        cfg.client.id.clone(),
        cfg.router.id.clone(),
        bus,
        cfg.client_config(),
        cfg.agent_config(),
    );
    client.start().await?;
    Ok(client)
}

async fn cmd_serve(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    info!("Starting router '{}' with {} experts", cfg.router.id, cfg.experts.len());

    let mesh = Mesh::start(&cfg).await?;

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    println!("{}", serde_json::to_string_pretty(&mesh.router.router().stats())?);
    mesh.stop().await;
    println!("Switchyard stopped.");
    Ok(())
}

async fn cmd_run(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    let mesh = Mesh::start(&cfg).await?;
    let client = start_client(&cfg, mesh.bus.clone()).await?;

    info!("Reading queries from stdin, one per line");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let query = line.trim();
                if query.is_empty() {
                    continue;
                }
                match client.ask(query).await {
                    Ok(answer) => println!("{}", serde_json::to_string(&answer)?),
                    Err(e) => println!(
                        "{}",
                        serde_json::json!({
                            "query": query,
                            "error": e.to_string(),
                            "error_kind": e.kind(),
                        })
                    ),
                }
            }
        }
    }

    eprintln!("{}", serde_json::to_string_pretty(&mesh.router.router().stats())?);
    if let Err(e) = client.stop().await {
        warn!("Failed to stop client: {}", e);
    }
    mesh.stop().await;
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, query: &str, remote: bool) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;

    let (bus, mesh) = if remote {
        (create_bus(&cfg.bus_options()).await?, None)
    } else {
        let mesh = Mesh::start(&cfg).await?;
        (mesh.bus.clone(), Some(mesh))
    };

    let client = start_client(&cfg, bus.clone()).await?;
    let outcome = client.ask(query).await;

    if let Err(e) = client.stop().await {
        warn!("Failed to stop client: {}", e);
    }
    match mesh {
        Some(mesh) => mesh.stop().await,
        None => {
            if let Err(e) = bus.stop().await {
                warn!("Failed to stop bus: {}", e);
            }
        }
    }

    let answer = outcome.with_context(|| format!("Query failed: {}", query))?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}
