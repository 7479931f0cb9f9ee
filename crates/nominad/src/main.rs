//! nominad: keeps the analysis current without an operator.
//!
//! Daily and weekly triggers fire on the configured intervals. The domains
//! directory is polled, and any new or changed document starts an
//! on-demand run. Runs never overlap. Ctrl-C cancels the run in progress,
//! lets it store its partial report, then exits.

use anyhow::{Context, Result};
use clap::Parser;
use nomina_core::{
    AnalysisReport, DomainRegistry, EngineConfig, FeatureProvider, LexicalFeatureProvider,
    Scheduler, TriggerMode,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "nominad")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Nomina daemon: scheduled and change-driven analysis runs", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, env = "NOMINA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of JSON domain documents
    #[arg(long, env = "NOMINA_DOMAINS_DIR", default_value = "domains")]
    domains_dir: PathBuf,

    /// Result store: `memory`, a SurrealDB endpoint, or a database path
    #[arg(long, env = "NOMINA_STORE")]
    store: Option<String>,

    /// Seconds between scans of the domains directory
    #[arg(long, env = "NOMINA_POLL_SECS", default_value = "60")]
    poll_secs: u64,
}

/// What woke the daemon up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Daily,
    Weekly,
    Poll,
}

struct Daemon {
    scheduler: Scheduler,
    domains_dir: PathBuf,
}

impl Daemon {
    async fn start(config: EngineConfig, domains_dir: PathBuf, store: Option<&str>) -> Result<Self> {
        let registry = Arc::new(DomainRegistry::new());
        sync_domains(&registry, &domains_dir).await?;

        let store = nomina_store::open_store(store)
            .await
            .context("Failed to open result store")?;
        let provider: Arc<dyn FeatureProvider> = Arc::new(LexicalFeatureProvider::new());
        let scheduler = Scheduler::new(config, registry, provider, store)
            .context("Invalid engine configuration")?;
        let warmed = scheduler
            .warm_cache()
            .await
            .context("Failed to warm evaluation cache")?;
        info!(warmed, "nominad ready");

        Ok(Self {
            scheduler,
            domains_dir,
        })
    }

    /// The trigger a wake-up calls for, if any. A poll only triggers when a
    /// domain no stored run has covered is present.
    async fn trigger_for(&self, wake: Wake) -> Result<Option<TriggerMode>> {
        Ok(match wake {
            Wake::Daily => Some(TriggerMode::Daily),
            Wake::Weekly => Some(TriggerMode::Weekly),
            Wake::Poll => {
                sync_domains(self.scheduler.domains(), &self.domains_dir).await?;
                let pending = self.scheduler.uncovered_domains().await?;
                if pending.is_empty() {
                    None
                } else {
                    info!(?pending, "domains changed");
                    Some(TriggerMode::OnDemand { domain: None })
                }
            }
        })
    }

    /// Handle one wake-up. Failed runs are logged and the daemon keeps going.
    async fn on_wake(&self, wake: Wake) -> Option<AnalysisReport> {
        let mode = match self.trigger_for(wake).await {
            Ok(Some(mode)) => mode,
            Ok(None) => return None,
            Err(e) => {
                warn!(?wake, error = %format!("{e:#}"), "wake-up skipped");
                return None;
            }
        };
        match self.scheduler.trigger(mode.clone()).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(trigger = %mode, error = %e, "run aborted");
                None
            }
        }
    }
}

async fn sync_domains(registry: &DomainRegistry, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "domains directory not found");
        return Ok(());
    }
    registry
        .sync_json_dir(dir)
        .await
        .with_context(|| format!("Failed to read domains from {}", dir.display()))?;
    Ok(())
}

fn interval(period: Duration, first_now: bool) -> time::Interval {
    let start = if first_now {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn serve(daemon: Daemon, poll: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let schedule = daemon.scheduler.config().scheduler.clone();
    let mut daily = interval(Duration::from_secs(schedule.daily_interval_secs), false);
    let mut weekly = interval(Duration::from_secs(schedule.weekly_interval_secs), false);
    let mut polling = interval(poll, true);

    loop {
        let wake = tokio::select! {
            Ok(()) = shutdown.changed() => break,
            _ = daily.tick() => Wake::Daily,
            _ = weekly.tick() => Wake::Weekly,
            _ = polling.tick() => Wake::Poll,
        };
        if *shutdown.borrow() {
            break;
        }
        if let Some(report) = daemon.on_wake(wake).await {
            info!(
                run_id = %report.run_id,
                trigger = %report.trigger,
                cells = report.stats.cells,
                fitness = report.aggregate_fitness,
                "run stored"
            );
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("nominad stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    nomina_core::telemetry::init_tracing(args.json, level);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let daemon = Daemon::start(config, args.domains_dir.clone(), args.store.as_deref()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancel = daemon.scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_tx.send_replace(true);
            cancel.cancel();
        }
    });

    serve(daemon, Duration::from_secs(args.poll_secs.max(1)), shutdown_rx).await
}
