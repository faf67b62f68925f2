//! Handicap-Discover: Asian-handicap strategy discovery from the command line
//!
//! Usage:
//!   handicap-discover run --dataset matches.jsonl --factors factors.json
//!   handicap-discover merge data/runs/<run_id>
//!   handicap-discover import data/runs/<run_id>/summaries.jsonl
//!   handicap-discover top --min-bets 30 --min-roi 5
//!   handicap-discover settle --home-goals 1 --away-goals 0 --handicap=-0.5/-1 --side home --odds 1.9 --stake 100

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{
    run_discovery, settle, DiscoveryConfig, DiscoveryProgress, DiscoveryRequest, DiscoveryStatus, HandicapLine, Side,
};
use persistence::repository::{StrategyRepository, TopQuery};
use persistence::shard::{list_shards, merge_shards, ShardReader};
use persistence::SummaryRecord;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "handicap-discover")]
#[command(about = "Asian-handicap betting strategy discovery", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate and backtest every factor combination
    Run {
        /// Match dataset (JSON array or JSON lines)
        #[arg(long)]
        dataset: PathBuf,
        /// Factor library (JSON)
        #[arg(long)]
        factors: PathBuf,
        /// Run configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output root; the run writes into <out>/<run_id>
        #[arg(long, env = "HANDICAP_DISCOVER_OUT", default_value = "data/runs")]
        out: PathBuf,
        /// Run identifier (default: current timestamp)
        #[arg(long)]
        run_id: Option<String>,
        /// Parallel shards
        #[arg(long)]
        workers: Option<usize>,
        /// Maximum factors per combination, side and size included
        #[arg(long)]
        max_factors: Option<usize>,
        /// Minimum plausible sample for a branch to be explored
        #[arg(long)]
        min_sample: Option<usize>,
        /// Disable pruning (exhaustive enumeration)
        #[arg(long)]
        no_prune: bool,
    },
    /// Merge a run's shard files into summaries.jsonl + meta.json
    Merge {
        /// Run directory holding summaries-<n>.jsonl files
        dir: PathBuf,
        /// Output directory (default: the run directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Import summaries into the SQLite ranking database
    Import {
        /// A summaries file or a run directory of shards
        path: PathBuf,
        /// Rows per transaction
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Show the best imported strategies
    Top {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
        /// Minimum number of graded bets
        #[arg(long, default_value_t = 15)]
        min_bets: i64,
        /// Minimum ROI, percent
        #[arg(long, allow_hyphen_values = true)]
        min_roi: Option<f64>,
        /// Only strategies using this side factor
        #[arg(long)]
        side: Option<String>,
        /// roi, total_profit, win_rate, total_bets, max_drawdown
        #[arg(long, default_value = "roi")]
        sort: String,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Summary statistics of the ranking database
    Stats {
        /// Sample floor for the best-ROI pick
        #[arg(long, default_value_t = 15)]
        min_bets: i64,
    },
    /// Grade a single bet
    Settle {
        #[arg(long)]
        home_goals: i64,
        #[arg(long)]
        away_goals: i64,
        /// Line for the backed side, e.g. -0.5, +1 or -0.5/-1
        #[arg(long, allow_hyphen_values = true)]
        handicap: String,
        /// home or away
        #[arg(long)]
        side: String,
        #[arg(long)]
        odds: Decimal,
        #[arg(long)]
        stake: Decimal,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,handicap_discover=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,handicap_discover=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("HANDICAP_DISCOVER_DB").unwrap_or_else(|_| "data/strategies.db".to_string())
}

async fn open_db() -> anyhow::Result<persistence::Database> {
    let path = db_path();
    let db = persistence::Database::new(&path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database opened: {}", path);
    Ok(db)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            dataset,
            factors,
            config,
            out,
            run_id,
            workers,
            max_factors,
            min_sample,
            no_prune,
        } => {
            let mut config = match config {
                Some(path) => DiscoveryConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => DiscoveryConfig::default(),
            };
            if let Some(w) = workers {
                config.workers = w;
            }
            if let Some(m) = max_factors {
                config.max_factors = m;
            }
            if let Some(m) = min_sample {
                config.min_sample = m;
            }
            if no_prune {
                config.prune = false;
            }
            cmd_run(dataset, factors, out, run_id, config).await?;
        }
        Commands::Merge { dir, out } => {
            cmd_merge(&dir, out.as_deref())?;
        }
        Commands::Import { path, batch } => {
            cmd_import(&path, batch).await?;
        }
        Commands::Top {
            limit,
            min_bets,
            min_roi,
            side,
            sort,
            export,
        } => {
            cmd_top(limit, min_bets, min_roi, side, sort, export).await?;
        }
        Commands::Stats { min_bets } => {
            cmd_stats(min_bets).await?;
        }
        Commands::Settle {
            home_goals,
            away_goals,
            handicap,
            side,
            odds,
            stake,
        } => {
            cmd_settle(home_goals, away_goals, &handicap, &side, odds, stake)?;
        }
    }

    Ok(())
}

// ============================================================================
// Run command
// ============================================================================

async fn cmd_run(
    dataset: PathBuf,
    factors: PathBuf,
    out: PathBuf,
    run_id: Option<String>,
    config: DiscoveryConfig,
) -> anyhow::Result<()> {
    println!("\n=== Handicap-Discover v{} ===", APP_VERSION);

    let run_id = run_id.unwrap_or_else(|| chrono::Utc::now().timestamp_millis().to_string());
    let out_dir = out.join(&run_id);
    println!("Dataset: {}", dataset.display());
    println!("Factors: {}", factors.display());
    println!("Output:  {}", out_dir.display());
    println!(
        "Workers: {} | Max factors: {} | Min sample: {} | Pruning: {}",
        config.workers,
        config.max_factors,
        config.min_sample,
        if config.prune { "on" } else { "off" }
    );
    println!();

    let progress = Arc::new(DiscoveryProgress::new());
    let request = DiscoveryRequest {
        dataset,
        library: factors,
        out_dir: out_dir.clone(),
        run_id: Some(run_id.clone()),
        config,
    };

    // Spawn discovery in background and monitor progress
    let progress_clone = progress.clone();
    let discovery_handle = tokio::spawn(async move { run_discovery(request, progress_clone).await });

    // Progress display loop
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        let status = progress.status();
        let completed = progress.completed.load(Ordering::Relaxed);
        let pruned = progress.pruned.load(Ordering::Relaxed);
        let written = progress.written.load(Ordering::Relaxed);
        let total = progress.total_combinations.load(Ordering::Relaxed);
        let pct = progress.progress_pct();

        match status {
            DiscoveryStatus::Loading => {
                print!("\r  {}...                                      ", progress.phase());
            }
            DiscoveryStatus::Searching => {
                let bar_len = 30;
                let filled = ((pct as usize) * bar_len / 100).min(bar_len);
                let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
                print!(
                    "\r  [{}] {:.0}% ({}/{} graded, {} pruned, {} written)   ",
                    bar, pct, completed, total, pruned, written
                );
            }
            DiscoveryStatus::Complete | DiscoveryStatus::Error => break,
            DiscoveryStatus::Idle => {}
        }
        if discovery_handle.is_finished() {
            break;
        }
    }

    let outcome = discovery_handle
        .await
        .map_err(|e| anyhow::anyhow!("Discovery task panicked: {}", e))?;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("\r  Error: {}                                      ", e);
            println!("  Flushed batches in {} remain valid.", out_dir.display());
            return Err(e.into());
        }
    };

    println!(
        "\r  Complete! {} enumerated, {} pruned, {} written                              ",
        outcome.combinations_enumerated(),
        outcome.combinations_pruned(),
        outcome.strategies_written()
    );
    let skipped = progress.skipped_matches.load(Ordering::Relaxed);
    if skipped > 0 {
        println!("  {} bets skipped across all strategies (see log for reasons)", skipped);
    }
    println!("\nNext: handicap-discover merge {}", outcome.out_dir.display());
    Ok(())
}

// ============================================================================
// Merge / Import
// ============================================================================

fn cmd_merge(dir: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let out = out.unwrap_or(dir);
    let report = merge_shards(dir, out).with_context(|| format!("merging {}", dir.display()))?;
    println!(
        "Merged {} shards: {} strategies ({:?}) -> {}",
        report.shards,
        report.records,
        report.metadata.status,
        out.display()
    );
    if report.truncated_shards > 0 {
        warn!(shards = report.truncated_shards, "Some shards ended with an incomplete record");
    }
    Ok(())
}

async fn cmd_import(path: &Path, batch: usize) -> anyhow::Result<()> {
    let files: Vec<PathBuf> = if path.is_dir() {
        list_shards(path)?.into_iter().map(|(_, p)| p).collect()
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        anyhow::bail!("No summaries found in {}", path.display());
    }

    let db = open_db().await?;
    let repo = StrategyRepository::new(db.pool());
    let batch = batch.max(1);
    let (mut read, mut inserted) = (0u64, 0u64);

    for file in &files {
        let mut pending: Vec<SummaryRecord> = Vec::with_capacity(batch);
        for record in ShardReader::open(file).with_context(|| format!("opening {}", file.display()))? {
            pending.push(record?);
            read += 1;
            if pending.len() >= batch {
                inserted += repo.save_batch(&pending).await?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            inserted += repo.save_batch(&pending).await?;
        }
        info!(file = %file.display(), "Imported");
    }

    println!(
        "Imported {} summaries ({} new, {} already present)",
        read,
        inserted,
        read - inserted
    );
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

async fn cmd_top(
    limit: i64,
    min_bets: i64,
    min_roi: Option<f64>,
    side: Option<String>,
    sort: String,
    export: Option<String>,
) -> anyhow::Result<()> {
    let db = open_db().await?;
    let repo = StrategyRepository::new(db.pool());
    let records = repo
        .get_top(&TopQuery {
            limit,
            min_bets: Some(min_bets),
            min_roi,
            side_factor: side.as_deref(),
            sort_by: Some(sort.as_str()),
        })
        .await?;

    if records.is_empty() {
        println!("No strategies match (min bets {}).", min_bets);
        return Ok(());
    }

    println!(
        "\n{:<4} {:<60} {:>6} {:>8} {:>8} {:>10} {:>10}",
        "#", "Strategy", "Bets", "ROI %", "Win %", "Profit", "Drawdown"
    );
    println!("{}", "-".repeat(112));
    for (i, r) in records.iter().enumerate() {
        let name = if r.name.chars().count() > 60 {
            format!("{}...", r.name.chars().take(57).collect::<String>())
        } else {
            r.name.clone()
        };
        println!(
            "{:<4} {:<60} {:>6} {:>8} {:>8} {:>10} {:>10}",
            i + 1,
            name,
            r.total_bets,
            r.roi,
            r.win_rate,
            r.total_profit,
            r.max_drawdown
        );
    }

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&path, json)?;
        println!("\nExported {} strategies to {}", records.len(), path);
    }
    Ok(())
}

async fn cmd_stats(min_bets: i64) -> anyhow::Result<()> {
    let db = open_db().await?;
    let stats = StrategyRepository::new(db.pool()).get_stats(min_bets).await?;
    println!("\n=== Strategy database: {} ===", db_path());
    println!("Strategies:  {}", stats.total_strategies);
    println!("Profitable:  {}", stats.profitable);
    println!("Runs:        {}", stats.total_runs);
    println!("Most bets:   {}", stats.most_bets);
    println!(
        "Best ROI:    {}% ({}, min {} bets)",
        stats.best_roi, stats.best_roi_strategy, min_bets
    );
    Ok(())
}

fn cmd_settle(
    home_goals: i64,
    away_goals: i64,
    handicap: &str,
    side: &str,
    odds: Decimal,
    stake: Decimal,
) -> anyhow::Result<()> {
    let line = HandicapLine::parse(handicap)?;
    let side: Side = side.parse()?;
    let grade = settle(home_goals, away_goals, &line, side, odds, stake)?;
    println!("{}", serde_json::to_string_pretty(&grade)?);
    Ok(())
}
