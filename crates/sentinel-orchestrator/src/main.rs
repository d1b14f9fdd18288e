//! sentinel: privacy-router orchestrator daemon and control client
//!
//! Initializes the global allocator and logging, then either runs the daemon
//! (`serve`), forwards one request to it (`ctl`) or parses a config offline
//! (`parse`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentinel_network::{
    HickoryCanary, HickoryPathResolver, NftBackend, PathResolver, RouteEgressProbe,
};
use sentinel_orchestrator::{
    ControlServer, DEFAULT_CONFIG_PATH, FileStore, LocalChainPath, Orchestrator,
    OrchestratorConfig, Request, Response, Services, Store, SupervisedResolvers, control,
    exit_code,
};
use sentinel_supervisor::Supervisor;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about = "Protocol & network-policy orchestrator")]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator daemon
    Serve,
    /// Send one JSON request to the running daemon
    Ctl {
        /// e.g. '{"op":"control","name":"home","action":"start"}'
        request: String,
    },
    /// Parse a configuration from stdin without touching the daemon
    Parse {
        /// Protocol type hint (wireguard, xray, byedpi, ...)
        #[arg(long)]
        hint: Option<String>,
    },
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print(response: &Response) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(exit_code(response.code.as_deref()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OrchestratorConfig::load(&cli.config)?;

    let code = match cli.command {
        Command::Serve => {
            init_logging(&config.log_level.0);
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(serve(config))?;
            0
        }
        Command::Ctl { request } => match serde_json::from_str::<Request>(&request) {
            Err(e) => print(&Response::malformed(e))?,
            Ok(request) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to start tokio runtime")?;
                let socket = &config.paths.control_socket;
                let response = runtime
                    .block_on(control::send(socket, &request))
                    .with_context(|| format!("cannot reach {:?}", socket))?;
                print(&response)?
            }
        },
        Command::Parse { hint } => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            print(&Orchestrator::parse(&text, hint.as_deref()).into())?
        }
    };
    std::process::exit(code)
}

fn build_services(config: &OrchestratorConfig, store: Arc<dyn Store>) -> Result<Services> {
    let supervisor = Arc::new(Supervisor::new(config.supervisor.to_supervisor_config()));
    let probe_timeout = Duration::from_secs(config.dns.probe_timeout_secs.max(1));
    let raw_path: Arc<dyn PathResolver> = if config.dns.raw_resolvers.is_empty() {
        Arc::new(HickoryPathResolver::system().map_err(anyhow::Error::msg)?)
    } else {
        Arc::new(HickoryPathResolver::at(&config.dns.raw_resolvers, 53, probe_timeout))
    };

    Ok(Services {
        store,
        firewall_backend: Arc::new(NftBackend::new(config.firewall.nft_binary.clone())),
        resolver_runtime: Arc::new(SupervisedResolvers::new(
            supervisor.clone(),
            config.binaries.resolve(&config.dns.resolver_binary),
        )),
        canary: Arc::new(HickoryCanary::new(Duration::from_secs(
            config.dns.canary_timeout_secs.max(1),
        ))),
        raw_path,
        privacy_path: Arc::new(LocalChainPath::new(probe_timeout)),
        egress: Arc::new(RouteEgressProbe),
        supervisor,
    })
}

async fn serve(config: OrchestratorConfig) -> Result<()> {
    info!("sentinel {} starting", env!("CARGO_PKG_VERSION"));
    info!("Using mimalloc allocator");

    let store = FileStore::open(&config.paths.state_file)
        .with_context(|| format!("cannot open store {:?}", config.paths.state_file))?;
    let services = build_services(&config, Arc::new(store))?;
    let supervisor = services.supervisor.clone();
    supervisor.start_poller()?;

    let socket_path = config.paths.control_socket.clone();
    let orchestrator = Arc::new(Orchestrator::new(config, services));
    orchestrator.load().await?;
    orchestrator.watch_events()?;
    orchestrator.autostart().await;

    let server = ControlServer::bind(&socket_path)?;
    let mut terminate = signal(SignalKind::terminate()).context("cannot watch SIGTERM")?;
    tokio::select! {
        result = server.serve(orchestrator.clone()) => {
            if let Err(e) = result {
                error!("Control socket failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested (SIGINT)");
        }
        _ = terminate.recv() => {
            info!("Shutdown requested (SIGTERM)");
        }
    }
    drop(server);

    tokio::task::spawn_blocking(move || supervisor.shutdown()).await?;
    info!("sentinel shut down");
    Ok(())
}
