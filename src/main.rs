use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qpsgate::config::{LoggingConfig, QpsGateConfig};
use qpsgate::ratelimit::{GateHandle, GateRegistry, Rule};

/// Drive a QPS admission gate with concurrent callers and report its
/// rolling statistics.
#[derive(Parser, Debug)]
#[command(name = "qpsgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the rule to drive (defaults to the first configured rule)
    #[arg(short, long)]
    rule: Option<String>,

    /// Override the ceiling of the driven rule
    #[arg(long)]
    limit_qps: Option<u64>,

    /// Number of concurrent callers
    #[arg(short, long)]
    workers: Option<usize>,

    /// How long to drive load, in seconds
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Print each report as a JSON line on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = QpsGateConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.load.workers = workers;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.load.duration_secs = duration_secs;
    }

    init_tracing(&config.logging);

    info!("Starting qpsgate load driver");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut rules = config.all_rules()?;
    if rules.is_empty() {
        rules.push(Rule::default());
    }
    let registry = GateRegistry::from_rules(rules.clone())?;
    info!(gates = ?registry.names(), "Configuration loaded");

    let name = args.rule.unwrap_or_else(|| rules[0].name.clone());
    let handle = registry
        .get(&name)
        .ok_or_else(|| anyhow::anyhow!("no rule named '{}'", name))?;
    if let Some(limit_qps) = args.limit_qps {
        let mut rule = handle.rule();
        rule.limit_qps = limit_qps;
        registry.load(rule)?;
    }

    drive(handle, &config, args.json).await
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// Run the configured callers against `handle` until the duration elapses or
/// a shutdown signal arrives.
async fn drive(handle: GateHandle, config: &QpsGateConfig, json: bool) -> anyhow::Result<()> {
    let load = &config.load;
    let running = Arc::new(AtomicBool::new(true));
    let completed = Arc::new(AtomicU64::new(0));

    info!(
        rule = %handle.rule().name,
        limit_qps = handle.rule().limit_qps,
        workers = load.workers,
        duration_secs = load.duration_secs,
        "Driving load"
    );

    let mut workers = Vec::with_capacity(load.workers);
    for _ in 0..load.workers {
        let handle = handle.clone();
        let running = Arc::clone(&running);
        let completed = Arc::clone(&completed);
        let max_work_ms = load.max_work_ms;

        workers.push(tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let guard = handle.entry_guard();
                if guard.is_admitted() {
                    let work_ms = rand::thread_rng().gen_range(0..=max_work_ms);
                    tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    tokio::task::yield_now().await;
                }
                drop(guard);
            }
        }));
    }

    let deadline = tokio::time::sleep(Duration::from_secs(load.duration_secs));
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_millis(load.report_interval_ms));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Load duration elapsed");
                break;
            }
            _ = &mut shutdown => break,
            _ = ticker.tick() => report(&handle, json)?,
        }
    }

    running.store(false, Ordering::Relaxed);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task failed");
        }
    }

    info!(
        completed = completed.load(Ordering::Relaxed),
        "qpsgate load driver stopped"
    );
    Ok(())
}

fn report(handle: &GateHandle, json: bool) -> anyhow::Result<()> {
    let stats = handle.stats();
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        info!(
            pass_qps = stats.pass_qps,
            success_qps = stats.success_qps,
            block_qps = stats.block_qps,
            max_success_qps = stats.max_success_qps,
            avg_rt_ms = stats.avg_rt,
            "Window statistics"
        );
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
