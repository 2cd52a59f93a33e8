mod config;
mod units;

use aggregator::config::Settings;
use aggregator::core::ProxyCore;
use aggregator::gate::{self, GateService, SharedCore};
use clap::Parser;
use config::{ConfigError, FileConfig, MetricsSection};
use idcache::TranslationCache;
use shared::http::ServerTimeouts;
use shared::metrics::Metrics;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "zproxy", about = "JSON-RPC aggregation proxy", disable_version_flag = true)]
struct Cli {
    /// Path to the config file
    #[arg(
        short = 'c',
        long = "config",
        default_value = "config.yaml",
        value_name = "PATH"
    )]
    config: PathBuf,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cache error: {0}")]
    Cache(#[from] idcache::CacheError),
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();
    if cli.version {
        println!("Version: {VERSION}");
        return;
    }

    init_tracing();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let file_config = FileConfig::from_file(&cli.config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve(cli.config, file_config))
}

async fn serve(config_path: PathBuf, file_config: FileConfig) -> Result<(), CliError> {
    tracing::info!(version = VERSION, "Starting Zabbix API proxy");

    let metrics = build_metrics(&file_config.metrics);
    let core = build_core(&file_config, metrics.clone())?;
    tracing::info!(
        backends = core.engine.backends().len(),
        "Loaded backends from configuration"
    );

    let (timeouts_tx, timeouts_rx) = watch::channel(server_timeouts(&core.settings));
    let core_handle = gate::shared_core(core);
    let service = GateService::new(core_handle.clone(), metrics.clone(), VERSION);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listen_addr = file_config.listen_addr();
    tracing::info!(listen_addr, "Starting HTTP listener");
    let mut server = tokio::spawn(async move {
        shared::http::run_http_service(&listen_addr, service, timeouts_rx, shutdown_rx, DRAIN_TIMEOUT)
            .await
    });

    if file_config.global.monitoring_in_log {
        spawn_monitor(core_handle.clone(), shutdown_tx.subscribe());
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigquit.recv() => {
                tracing::info!("Received SIGQUIT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                reload(&config_path, &core_handle, &metrics, &timeouts_tx);
            }
            result = &mut server => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
                    Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
                }
                core_handle.read().clone().shutdown();
                return Ok(());
            }
        }
    }

    // Final cache snapshot first, then drain HTTP connections.
    core_handle.read().clone().shutdown();
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => tracing::info!("Server stopped gracefully"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server shutdown error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
    }
    Ok(())
}

fn build_metrics(section: &Option<MetricsSection>) -> Metrics {
    match section {
        Some(MetricsSection {
            statsd_host,
            statsd_port,
        }) => match Metrics::statsd(statsd_host, *statsd_port, "zproxy") {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(error = %e, "StatsD init failed, metrics disabled");
                Metrics::noop()
            }
        },
        None => Metrics::noop(),
    }
}

fn build_core(file_config: &FileConfig, metrics: Metrics) -> Result<ProxyCore, CliError> {
    let settings = file_config.settings()?;
    let backends = file_config.backends();
    let breaker_config = file_config.breaker_config()?;
    let outbound = file_config.outbound_limits()?;

    let cache = Arc::new(TranslationCache::open(file_config.cache_config()?)?);
    cache.start();

    Ok(ProxyCore::new(
        settings,
        backends,
        breaker_config,
        outbound,
        cache,
        metrics,
    ))
}

/// SIGHUP handler: load the new file, retire the old core (stopping its
/// cache so the store file is released), swap in the new generation, and
/// rewire the listener timeouts for connections accepted from now on.
fn reload(
    config_path: &Path,
    core_handle: &SharedCore,
    metrics: &Metrics,
    timeouts: &watch::Sender<ServerTimeouts>,
) {
    let file_config = match FileConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    core_handle.read().clone().shutdown();

    match build_core(&file_config, metrics.clone()) {
        Ok(new_core) => {
            let _ = timeouts.send(server_timeouts(&new_core.settings));
            *core_handle.write() = Arc::new(new_core);
            tracing::info!("Configuration reloaded successfully");
        }
        Err(e) => tracing::error!(error = %e, "Failed to rebuild proxy after reload"),
    }
}

fn server_timeouts(settings: &Settings) -> ServerTimeouts {
    ServerTimeouts {
        read: settings.read_timeout,
        write: settings.write_timeout,
        idle: settings.idle_timeout,
    }
}

fn spawn_monitor(core_handle: SharedCore, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = core_handle.read().clone().stats();
                    tracing::info!(stats = %stats, "Proxy state");
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
