use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catrec_storage::MemoryStore;
use catrec_sync::config::DEFAULT_CONFIG_FILE;
use catrec_sync::{
    open_store, recent_runs_markdown, BatchRunner, CancelToken, LiveOptions, ReconConfig,
    RunSummary, StoredReport,
};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "catrec")]
#[command(about = "Fuzzy catalog reconciliation")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan a reconciliation and write a report; nothing is changed.
    Run,
    /// Apply a reviewed plan to the target store.
    Apply {
        /// `report.json` of the approved dry run.
        #[arg(long)]
        approve: PathBuf,
        /// `report.json` of an interrupted live run to continue from.
        #[arg(long)]
        resume_from: Option<PathBuf>,
    },
    /// Export the duplicate-annotated catalog only.
    Dedup,
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

/// Cancels the token on Ctrl-C; the runner stops at the next page boundary.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current page");
            handle.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary) {
    let t = &summary.totals;
    println!(
        "{} complete: run_id={} processed={} matched={} updated={} proposed={} skipped={} failed={} inserted={} report={}",
        summary.mode,
        summary.run_id,
        t.processed,
        t.matched,
        t.updated,
        t.proposed,
        t.skipped,
        t.failed,
        t.inserted,
        summary.report_dir.display()
    );
}

/// Reports directory for `catrec report`, which works without a complete
/// configuration.
fn reports_root(config_path: &Path) -> Result<PathBuf> {
    let mut config = if config_path.exists() {
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        ReconConfig::from_yaml_str(&text)
            .with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        ReconConfig::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config.reports_dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = ReconConfig::load(&cli.config)?;
            let store = open_store(&config).await?;
            let runner = BatchRunner::new(config, store)?;
            let summary = runner.dry_run(&cancel_on_ctrl_c()).await?;
            print_summary(&summary);
        }
        Commands::Apply {
            approve,
            resume_from,
        } => {
            let config = ReconConfig::load(&cli.config)?;
            let mut options = LiveOptions::new(StoredReport::load(&approve)?);
            if let Some(previous) = resume_from {
                options = options.resuming(StoredReport::load(&previous)?);
            }
            let store = open_store(&config).await?;
            let runner = BatchRunner::new(config, store)?;
            let summary = runner.live_run(&options, &cancel_on_ctrl_c()).await?;
            print_summary(&summary);
        }
        Commands::Dedup => {
            let config = ReconConfig::load(&cli.config)?;
            let runner = BatchRunner::new(config, MemoryStore::default())?;
            let export = runner.export_catalog().await?;
            println!(
                "dedup complete: export_id={} entries={} duplicates={} parse_errors={} dir={}",
                export.export_id,
                export.entries,
                export.duplicates,
                export.parse_errors,
                export.dir.display()
            );
        }
        Commands::Report { runs } => {
            let root = reports_root(&cli.config)?;
            println!("{}", recent_runs_markdown(&root, runs)?);
        }
    }

    Ok(())
}
