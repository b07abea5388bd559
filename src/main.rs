//! DnsChef Rust - a spoofing DNS server written in Rust

pub mod api;
pub mod config;
pub mod events;
pub mod forward;
pub mod mappings;
pub mod server;
pub mod wire;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Log timestamps in local time rather than the subscriber's UTC default.
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dnschef-rust")]
#[command(about = "A spoofing DNS server written in Rust", long_about = None)]
struct Args {
    /// Path to the JSON settings file; defaults apply when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listening port from the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Override the upstream resolver from the settings file.
    #[arg(long)]
    upstream: Option<String>,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("dnschef-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    std::fs::create_dir_all("logs").unwrap_or_default();

    let file_appender = RollingFileAppender::new(
        "logs/dnschef.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting DnsChef Rust version {}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => config::Settings::load(path)?,
        None => config::Settings::default(),
    };
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(upstream) = args.upstream {
        settings.upstream = upstream;
    }
    let upstream = settings.upstream_addr()?;

    let mappings = Arc::new(mappings::MappingTable::new());
    for (domain, address) in &settings.mappings {
        if let Err(e) = mappings.upsert(domain, address) {
            tracing::warn!("Skipping initial mapping '{}': {}", domain, e);
        }
    }
    let events = Arc::new(events::EventLog::new());

    let server = Arc::new(server::DnsServer::new(
        settings.port,
        upstream,
        settings.forward_timeout(),
        settings.rcode_policy,
        mappings.clone(),
        events.clone(),
    ));
    server.start().await?;

    let state = api::AppState {
        server: server.clone(),
        mappings,
        events,
    };
    let api_task = tokio::spawn(api::serve(settings.api_address, state));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    api_task.abort();
    server.stop().await;

    Ok(())
}
