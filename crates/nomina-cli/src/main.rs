//! Nomina CLI
//!
//! The `nomina` command runs analysis triggers over a directory of JSON
//! domain documents and reads back stored runs.
//!
//! ## Commands
//!
//! - `daily`: re-evaluate the best formulas of the latest generation
//! - `weekly`: run an evolution cycle from the latest checkpoint
//! - `on-demand`: evaluate new or changed domains
//! - `status`: latest run and its headline numbers
//! - `runs`: stored run history
//! - `domains`: registered domains and their versions
//! - `verify`: re-check recent evaluations for reproducibility

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nomina_core::{
    AnalysisReport, DomainId, DomainRegistry, DomainStatus, EngineConfig, FeatureProvider,
    LexicalFeatureProvider, ReproducibilityCheck, RunStatus, Scheduler, TriggerMode,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "nomina")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cross-domain formula evolution and invariant discovery", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "NOMINA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of JSON domain documents
    #[arg(long, global = true, env = "NOMINA_DOMAINS_DIR", default_value = "domains")]
    domains_dir: PathBuf,

    /// Result store: `memory`, a SurrealDB endpoint, or a database path
    /// (default: NOMINA_SURREAL_URL)
    #[arg(long, global = true, env = "NOMINA_STORE")]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-evaluate the top formulas of the latest generation on every domain
    Daily,

    /// Run an evolution cycle from the latest generation checkpoint
    Weekly,

    /// Evaluate the current population on new or changed domains
    OnDemand {
        /// Restrict the run to one domain
        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Show the latest run
    Status,

    /// List stored runs, newest first
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List registered domains
    Domains,

    /// Re-evaluate recent ledger entries and compare with the recorded statistics
    Verify {
        /// Number of most recent evaluations to check
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    nomina_core::telemetry::init_tracing(cli.json, level);

    let scheduler = build_scheduler(&cli).await?;
    let format = cli.format;

    match cli.command {
        Commands::Daily => cmd_trigger(&scheduler, TriggerMode::Daily, format).await,
        Commands::Weekly => cmd_trigger(&scheduler, TriggerMode::Weekly, format).await,
        Commands::OnDemand { domain } => {
            let mode = TriggerMode::OnDemand {
                domain: domain.map(DomainId::from),
            };
            cmd_trigger(&scheduler, mode, format).await
        }
        Commands::Status => cmd_status(&scheduler, format).await,
        Commands::Runs { limit } => cmd_runs(&scheduler, limit, format).await,
        Commands::Domains => cmd_domains(&scheduler, format),
        Commands::Verify { limit } => cmd_verify(&scheduler, limit, format).await,
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn load_domains(registry: &DomainRegistry, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "domains directory not found, no domains registered");
        return Ok(());
    }
    let changed = registry
        .sync_json_dir(dir)
        .await
        .with_context(|| format!("Failed to read domains from {}", dir.display()))?;
    info!(dir = %dir.display(), domains = changed.len(), "domains loaded");
    Ok(())
}

async fn build_scheduler(cli: &Cli) -> Result<Scheduler> {
    let config = load_config(cli.config.as_deref())?;

    let registry = Arc::new(DomainRegistry::new());
    load_domains(&registry, &cli.domains_dir).await?;

    let store = nomina_store::open_store(cli.store.as_deref())
        .await
        .context("Failed to open result store")?;
    let provider: Arc<dyn FeatureProvider> = Arc::new(LexicalFeatureProvider::new());

    let scheduler =
        Scheduler::new(config, registry, provider, store).context("Invalid engine configuration")?;
    scheduler
        .warm_cache()
        .await
        .context("Failed to warm evaluation cache")?;
    Ok(scheduler)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Run one trigger; Ctrl-C cancels it and the partial report is still stored.
async fn cmd_trigger(scheduler: &Scheduler, mode: TriggerMode, format: Format) -> Result<()> {
    let cancel = scheduler.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = scheduler.trigger(mode.clone()).await;
    interrupt.abort();
    let report = result.with_context(|| format!("{mode} run failed"))?;

    match format {
        Format::Json => print_json(&report),
        Format::Text => {
            println!("{}", render_report_text(&report));
            Ok(())
        }
    }
}

async fn cmd_status(scheduler: &Scheduler, format: Format) -> Result<()> {
    let Some(status) = scheduler.status().await? else {
        println!("No runs recorded");
        return Ok(());
    };
    if format == Format::Json {
        return print_json(&status);
    }

    println!("run       {}", status.run_id);
    println!("trigger   {}", status.trigger);
    println!("status    {}", render_status(&status.status));
    println!(
        "finished  {}",
        status.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("fitness   {:.4}", status.aggregate_fitness);
    if let Some(best) = &status.best_formula {
        println!("best      {best}");
    }
    println!(
        "domains   {} evaluated, {} excluded",
        status.domains_evaluated,
        status.domains_excluded.len()
    );
    for (domain, reason) in &status.domains_excluded {
        println!("  - {domain}: {reason}");
    }
    println!("invalid   {}", status.invalid_formulas);
    println!("invariants {}", status.invariants);
    println!("digest    {}", status.report_digest.short());
    Ok(())
}

async fn cmd_runs(scheduler: &Scheduler, limit: usize, format: Format) -> Result<()> {
    let mut runs = scheduler.runs().await?;
    runs.truncate(limit);
    if format == Format::Json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10} {:<9} {} domains  {}",
            run.completed_at.format("%Y-%m-%d %H:%M:%S"),
            run.trigger,
            run.outcome.as_str(),
            run.coverage.domains.len(),
            run.run_id
        );
    }
    Ok(())
}

fn cmd_domains(scheduler: &Scheduler, format: Format) -> Result<()> {
    let domains = scheduler.domains().list_domains();
    if format == Format::Json {
        return print_json(&domains);
    }
    if domains.is_empty() {
        println!("No domains registered");
        return Ok(());
    }
    for info in domains {
        let state = match &info.status {
            DomainStatus::Active => "active".to_string(),
            DomainStatus::Inactive => "inactive".to_string(),
            DomainStatus::Unavailable { reason } => format!("unavailable: {reason}"),
        };
        println!(
            "{:<20} v{:<4} {:>6} entities  {} ({})",
            info.id, info.version, info.entity_count, info.outcome.name, state
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct VerifyLine {
    domain_id: DomainId,
    formula_id: String,
    check: ReproducibilityCheck,
}

async fn cmd_verify(scheduler: &Scheduler, limit: usize, format: Format) -> Result<()> {
    let checks = scheduler.verify_ledger(limit).await?;
    let lines: Vec<VerifyLine> = checks
        .into_iter()
        .map(|(result, check)| VerifyLine {
            domain_id: result.domain_id,
            formula_id: result.formula_id.to_string(),
            check,
        })
        .collect();
    if format == Format::Json {
        return print_json(&lines);
    }
    if lines.is_empty() {
        println!("No evaluations recorded");
        return Ok(());
    }
    for line in &lines {
        let verdict = match &line.check {
            ReproducibilityCheck::Reproduced => "reproduced".to_string(),
            ReproducibilityCheck::Diverged { recorded, live } => format!(
                "DIVERGED r={} recorded, r={} live",
                recorded.coefficient, live.coefficient
            ),
            ReproducibilityCheck::VersionChanged { recorded, live } => {
                format!("domain moved v{recorded} -> v{live}")
            }
            ReproducibilityCheck::UnknownFormula { formula_id } => {
                format!("formula {formula_id} unknown")
            }
            ReproducibilityCheck::Failed { reason } => format!("failed: {reason}"),
        };
        println!("{:<16} {:<20} {}", line.formula_id, line.domain_id, verdict);
    }
    let reproduced = lines
        .iter()
        .filter(|l| l.check == ReproducibilityCheck::Reproduced)
        .count();
    println!("\n{reproduced}/{} reproduced", lines.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_status(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed => "completed".to_string(),
        RunStatus::Cancelled { reason } => format!("cancelled ({reason})"),
    }
}

fn render_report_text(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run {}\n", report.run_id));
    out.push_str(&format!(
        "trigger: {}  status: {}\n",
        report.trigger,
        render_status(&report.status)
    ));
    out.push_str(&format!(
        "cells: {} ({} cached, {} computed, {} invalid, {} skipped)\n",
        report.stats.cells,
        report.stats.cache_hits,
        report.stats.cache_misses,
        report.stats.invalid,
        report.stats.skipped
    ));
    out.push_str(&format!("aggregate fitness: {:.4}\n", report.aggregate_fitness));
    if let Some(best) = &report.best_formula {
        out.push_str(&format!(
            "best formula: {} (generation {}, {} domains)\n",
            best.expression, best.generation, best.valid_domains
        ));
    }

    if !report.generations.is_empty() {
        out.push_str("\nGenerations:\n");
        for g in &report.generations {
            out.push_str(&format!(
                "  #{:<3} best {:.4}  population {}  globally invalid {}\n",
                g.number, g.best_fitness, g.population, g.globally_invalid
            ));
        }
    }

    out.push_str("\nDomains:\n");
    for d in &report.domains {
        out.push_str(&format!(
            "  {} v{}: {}\n",
            d.domain_id,
            d.version,
            d.status.label()
        ));
        if let Some(best) = &d.best_formula {
            out.push_str(&format!(
                "      best r={:.3} p={:.2e} n={}  {}\n",
                best.coefficient, best.p_value, best.sample_size, best.expression
            ));
        }
        if let Some(dominant) = &d.dominant_feature {
            out.push_str(&format!(
                "      dominant feature {} (r={:.3})\n",
                dominant.feature, dominant.coefficient
            ));
        }
    }

    if !report.universal_features.is_empty() {
        out.push_str(&format!(
            "\nUniversal features: {}\n",
            report.universal_features.join(", ")
        ));
    }

    if !report.invariants.clusters.is_empty() {
        out.push_str("\nInvariant candidates:\n");
        for c in &report.invariants.clusters {
            let near = c
                .near_constants
                .first()
                .map(|n| format!("  ~{}", n.name))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {:?} {:.4} [{:.4}, {:.4}]  support {}/{} ({:.0}%){}\n",
                c.kind,
                c.center,
                c.min,
                c.max,
                c.support,
                c.total,
                c.occurrence_rate * 100.0,
                near
            ));
        }
    }

    if !report.invalid_formulas.is_empty() {
        out.push_str(&format!(
            "\nInvalid formulas: {}\n",
            report.invalid_formulas.len()
        ));
        for invalid in report.invalid_formulas.iter().take(10) {
            out.push_str(&format!(
                "  {} on {}: {}\n",
                invalid.formula_id, invalid.domain_id, invalid.reason
            ));
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use nomina_core::DomainRunStatus;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn on_demand_takes_an_optional_domain() {
        let cli = Cli::try_parse_from(["nomina", "--store", "memory", "on-demand", "-d", "crypto"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::OnDemand { domain: Some(ref d) } if d == "crypto"
        ));
        assert_eq!(cli.store.as_deref(), Some("memory"));
        assert_eq!(cli.format, Format::Text);
    }

    const PREFIXES: [&str; 7] = ["Kar", "Zel", "Mo", "Tri", "Bax", "Ul", "Quen"];
    const SUFFIXES: [&str; 6] = ["a", "on", "ix", "ette", "bark", "o Prime"];

    fn write_domain(dir: &Path, id: &str, count: usize) {
        let entities: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                let name = format!("{}{}", PREFIXES[i % 7], SUFFIXES[(i / 7) % 6]);
                serde_json::json!({
                    "name": name,
                    "outcome": name.len() as f64 * 2.0 + (i % 3) as f64,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "id": id,
            "outcome": { "name": "rank" },
            "entities": entities,
        });
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_vec_pretty(&doc).unwrap(),
        )
        .unwrap();
    }

    fn cli(dir: &Path, command: &str) -> Cli {
        let config = dir.join("nomina.toml");
        std::fs::write(
            &config,
            "min_sample = 10\n\n[evolution]\npopulation_size = 4\nmax_generations = 2\n",
        )
        .unwrap();
        Cli::try_parse_from([
            "nomina",
            "--store",
            "memory",
            "--config",
            config.to_str().unwrap(),
            "--domains-dir",
            dir.join("domains").to_str().unwrap(),
            command,
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn weekly_run_over_json_domains_renders_every_domain() {
        let dir = tempfile::tempdir().unwrap();
        let domains = dir.path().join("domains");
        std::fs::create_dir_all(&domains).unwrap();
        write_domain(&domains, "brands", 40);
        write_domain(&domains, "ships", 4);

        let scheduler = build_scheduler(&cli(dir.path(), "weekly")).await.unwrap();
        assert_eq!(scheduler.domains().len(), 2);

        let report = scheduler.run_weekly().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(
            report.domain(&DomainId::from("ships")).unwrap().status,
            DomainRunStatus::InsufficientSample {
                sample_size: 4,
                required: 10
            }
        );

        let text = render_report_text(&report);
        assert!(text.starts_with(&format!("Run {}", report.run_id)));
        assert!(text.contains("trigger: weekly  status: completed"));
        assert!(text.contains("brands v1"));
        assert!(text.contains("ships v1: insufficient sample: 4 of 10"));
        assert!(text.contains("Generations:"));
    }

    #[tokio::test]
    async fn missing_domains_dir_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(&cli(dir.path(), "status")).await.unwrap();
        assert!(scheduler.domains().is_empty());
        assert!(scheduler.status().await.unwrap().is_none());
    }

    #[test]
    fn missing_config_file_is_reported_with_its_path() {
        let err = load_config(Some(Path::new("/nonexistent/nomina.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/nomina.toml"));
    }

    #[test]
    fn cancelled_status_shows_reason() {
        let status = RunStatus::Cancelled {
            reason: "timeout".to_string(),
        };
        assert_eq!(render_status(&status), "cancelled (timeout)");
    }
}
