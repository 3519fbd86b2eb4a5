//! Cadence: email sequence enrollment and delivery engine.
//!
//! Main entry point that wires the store, mail transport, scheduler and
//! HTTP API together.

use anyhow::Context;
use cadence_api::ApiServer;
use cadence_channels::{LogTransport, MailTransport, SmtpTransport, TrackingLinks};
use cadence_core::config::{AppConfig, StoreBackend};
use cadence_core::event_bus::{EventSink, TracingSink};
use cadence_core::types::Member;
use cadence_engine::{Scheduler, SequenceService, SystemClock};
use cadence_store::{MemberDirectory, MemoryDirectory, MemoryStore, RedisStore, SequenceStore};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cadence-server")]
#[command(about = "Email sequence enrollment and delivery engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CADENCE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CADENCE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between scheduler ticks (overrides config)
    #[arg(long, env = "CADENCE__SCHEDULER__INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Storage backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Log emails instead of sending them
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Serve the API without the periodic scheduler; manual ticks still work
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,

    /// JSON file with an array of members to load into the directory
    #[arg(long)]
    members: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Memory,
    Redis,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => StoreBackend::Memory,
            BackendArg::Redis => StoreBackend::Redis,
        }
    }
}

fn load_members(path: &Path) -> anyhow::Result<Vec<Member>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading members file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing members file {}", path.display()))
}

async fn build_store(
    config: &AppConfig,
    members: Vec<Member>,
) -> anyhow::Result<(Arc<dyn SequenceStore>, Arc<dyn MemberDirectory>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            let members_dir = MemoryDirectory::new();
            for member in members {
                members_dir.insert(member);
            }
            let store: Arc<dyn SequenceStore> = Arc::new(MemoryStore::new());
            let directory: Arc<dyn MemberDirectory> = Arc::new(members_dir);
            Ok((store, directory))
        }
        StoreBackend::Redis => {
            let store = Arc::new(
                RedisStore::connect(&config.redis)
                    .await
                    .context("connecting to Redis")?,
            );
            for member in &members {
                store.put_member(member).await?;
            }
            let directory: Arc<dyn MemberDirectory> = store.clone();
            let sequences: Arc<dyn SequenceStore> = store;
            Ok((sequences, directory))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Cadence starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.interval_secs {
        config.scheduler.interval_secs = secs;
    }
    if let Some(backend) = cli.backend {
        config.store.backend = backend.into();
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.store.backend,
        interval_secs = config.scheduler.interval_secs,
        scheduler_enabled = config.scheduler.enabled,
        dry_run = cli.dry_run,
        "Configuration loaded"
    );

    let members = match &cli.members {
        Some(path) => load_members(path)?,
        None => Vec::new(),
    };
    let (store, directory) = build_store(&config, members).await?;

    let send_timeout = Duration::from_secs(config.scheduler.send_timeout_secs);
    let transport: Arc<dyn MailTransport> = if cli.dry_run {
        info!("Dry run: emails are logged, not sent");
        Arc::new(LogTransport)
    } else {
        Arc::new(SmtpTransport::new(&config.smtp, send_timeout)?)
    };

    let links = TrackingLinks::new(config.tracking.base_url.clone());
    let clock = Arc::new(SystemClock);
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let service = SequenceService::new(store.clone(), directory.clone(), clock.clone(), links.clone())
        .with_event_sink(sink.clone());

    let scheduler = Arc::new(
        Scheduler::new(store, directory, transport, clock, links, send_timeout)
            .with_event_sink(sink),
    );
    let interval = config
        .scheduler
        .enabled
        .then(|| Duration::from_secs(config.scheduler.interval_secs.max(1)));
    let handle = scheduler.spawn(interval);

    let api_server = ApiServer::new(config.clone(), service, Some(handle.clone()));

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    info!("Cadence is ready to serve traffic");

    tokio::select! {
        result = api_server.start_http() => {
            if let Err(e) = &result {
                error!(error = %e, "HTTP server exited");
            }
            handle.shutdown().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; waiting for in-flight tick");
            handle.shutdown().await;
            Ok(())
        }
    }
}
