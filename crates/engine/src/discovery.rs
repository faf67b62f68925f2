//! Discovery run: enumerate, grade and stream every combination
//!
//! The combination space is split by side × size pair into `workers` shards.
//! Each shard runs on a blocking thread with its own evaluation cache and its
//! own output file; the dataset and library are shared read-only.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, RwLock,
};

use chrono::Utc;
use persistence::sink::{JsonlSink, SinkConfig};
use persistence::{RunMetadata, SummaryRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backtest::Aggregator;
use crate::cache::FactorCache;
use crate::combination::{combination_hash, CombinationGenerator, GeneratorStats, PruneConfig};
use crate::config::DiscoveryConfig;
use crate::dataset::MatchDataset;
use crate::error::{DiscoveryError, LoadError};
use crate::factors::FactorLibrary;
use crate::types::StrategySummary;

// ============================================================================
// Request / Status Types
// ============================================================================

/// Request to start a discovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub dataset: PathBuf,
    pub library: PathBuf,
    pub out_dir: PathBuf,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub config: DiscoveryConfig,
}

/// Discovery run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Idle,
    Loading,
    Searching,
    Complete,
    Error,
}

/// Shared progress tracker, polled by the CLI while workers run
pub struct DiscoveryProgress {
    pub status: RwLock<DiscoveryStatus>,
    pub phase: RwLock<String>,
    pub total_combinations: AtomicU64,
    pub completed: AtomicU64,
    pub pruned: AtomicU64,
    /// Combinations inside pruned branches
    pub pruned_space: AtomicU64,
    pub written: AtomicU64,
    pub skipped_matches: AtomicU64,
    pub shards_done: AtomicU32,
    pub error_message: RwLock<Option<String>>,
    pub started_at: RwLock<Option<String>>,
}

impl DiscoveryProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(DiscoveryStatus::Idle),
            phase: RwLock::new(String::new()),
            total_combinations: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            pruned_space: AtomicU64::new(0),
            written: AtomicU64::new(0),
            skipped_matches: AtomicU64::new(0),
            shards_done: AtomicU32::new(0),
            error_message: RwLock::new(None),
            started_at: RwLock::new(None),
        }
    }

    pub fn reset(&self) {
        self.set_status(DiscoveryStatus::Loading, "Loading dataset and factor library");
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.pruned.store(0, Ordering::Relaxed);
        self.pruned_space.store(0, Ordering::Relaxed);
        self.written.store(0, Ordering::Relaxed);
        self.skipped_matches.store(0, Ordering::Relaxed);
        self.shards_done.store(0, Ordering::Relaxed);
        *self.error_message.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now().to_rfc3339());
    }

    pub fn set_status(&self, status: DiscoveryStatus, phase: &str) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
        *self.phase.write().unwrap_or_else(|e| e.into_inner()) = phase.to_string();
    }

    pub fn set_error(&self, message: String) {
        *self.error_message.write().unwrap_or_else(|e| e.into_inner()) = Some(message);
        self.set_status(DiscoveryStatus::Error, "Failed");
    }

    pub fn status(&self) -> DiscoveryStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> String {
        self.phase.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Share of the unpruned space already visited, enumerated or pruned away
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed) + self.pruned_space.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            ((done as f64 / total as f64) * 100.0).min(100.0) as f32
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), DiscoveryStatus::Loading | DiscoveryStatus::Searching)
    }
}

impl Default for DiscoveryProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub run_id: String,
    pub out_dir: PathBuf,
    pub shards: Vec<RunMetadata>,
}

impl DiscoveryOutcome {
    pub fn strategies_written(&self) -> u64 {
        self.shards.iter().map(|s| s.strategies_written).sum()
    }

    pub fn combinations_enumerated(&self) -> u64 {
        self.shards.iter().map(|s| s.combinations_enumerated).sum()
    }

    pub fn combinations_pruned(&self) -> u64 {
        self.shards.iter().map(|s| s.combinations_pruned).sum()
    }
}

// ============================================================================
// Persistence Helpers
// ============================================================================

/// Convert a finalized summary into the record written to a shard
pub fn summary_to_record(summary: &StrategySummary, run_id: &str, shard: usize) -> SummaryRecord {
    SummaryRecord {
        combination_hash: combination_hash(&summary.name),
        name: summary.name.clone(),
        side_factor: summary.side_factor.clone(),
        size_factor: summary.size_factor.clone(),
        optional_factors: summary.optional_factors.clone(),
        total_bets: summary.total_bets,
        wins: summary.wins,
        losses: summary.losses,
        pushes: summary.pushes,
        skipped: summary.skipped,
        total_stake: summary.total_stake,
        total_payout: summary.total_payout,
        total_profit: summary.total_profit,
        roi: summary.roi,
        win_rate: summary.win_rate,
        avg_odds: summary.avg_odds,
        max_drawdown: summary.max_drawdown,
        max_consecutive_losses: summary.max_consecutive_losses,
        run_id: run_id.to_string(),
        shard,
    }
}

// ============================================================================
// Shard Worker
// ============================================================================

/// Run one shard to completion on the calling thread
#[allow(clippy::too_many_arguments)]
pub fn run_shard(
    library: &FactorLibrary,
    dataset: &MatchDataset,
    config: &DiscoveryConfig,
    out_dir: &Path,
    run_id: &str,
    shard: usize,
    shards: usize,
    progress: &DiscoveryProgress,
) -> Result<RunMetadata, DiscoveryError> {
    let mut cache = FactorCache::new(library, dataset);
    let sizes = cache.warm();
    let generator = CombinationGenerator::new(library, sizes, config.max_factors, PruneConfig::from(config));
    progress
        .total_combinations
        .fetch_add(generator.unpruned_shard_total(shard, shards), Ordering::Relaxed);

    let mut sink = JsonlSink::create(
        out_dir,
        run_id,
        shard,
        shards,
        SinkConfig {
            batch_size: config.batch_size,
            metadata_every: config.metadata_every,
        },
    )?;
    let mut aggregator = Aggregator::new(cache);
    let mut combinations = generator.iter_shard(shard, shards);
    let mut reported = GeneratorStats::default();

    info!(
        shard,
        shards,
        pairs = generator.shard_pair_count(shard, shards),
        "Shard starting"
    );

    while let Some(combination) = combinations.next() {
        let summary = aggregator.aggregate(&combination);
        progress.completed.fetch_add(1, Ordering::Relaxed);
        progress
            .skipped_matches
            .fetch_add(summary.skipped as u64, Ordering::Relaxed);

        let stats = combinations.stats();
        report_pruning(progress, &mut reported, stats);
        sink.record_progress(stats.enumerated, stats.pruned);

        if summary.total_bets < config.min_bets_to_write {
            continue;
        }
        if let Err(e) = sink.push(&summary_to_record(&summary, run_id, shard)) {
            error!(shard, error = %e, "Result sink failed");
            if let Err(meta) = sink.fail(&e.to_string()) {
                warn!(shard, error = %meta, "Could not mark shard metadata as failed");
            }
            return Err(e.into());
        }
        progress.written.fetch_add(1, Ordering::Relaxed);
    }

    let stats = combinations.stats();
    report_pruning(progress, &mut reported, stats);
    sink.record_progress(stats.enumerated, stats.pruned);
    let metadata = match sink.finish() {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(shard, error = %e, "Final flush failed");
            return Err(e.into());
        }
    };

    let cache_stats = aggregator.cache().stats();
    info!(
        shard,
        enumerated = stats.enumerated,
        pruned = stats.pruned,
        written = metadata.strategies_written,
        cache_hits = cache_stats.hits,
        cache_misses = cache_stats.misses,
        eval_failures = cache_stats.failures,
        "Shard complete"
    );
    progress.shards_done.fetch_add(1, Ordering::Relaxed);
    Ok(metadata)
}

fn report_pruning(progress: &DiscoveryProgress, reported: &mut GeneratorStats, stats: GeneratorStats) {
    if stats.pruned > reported.pruned {
        progress
            .pruned
            .fetch_add(stats.pruned - reported.pruned, Ordering::Relaxed);
        progress
            .pruned_space
            .fetch_add(stats.pruned_space - reported.pruned_space, Ordering::Relaxed);
        *reported = stats;
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Load the inputs and run every shard. Flushed output stays valid if a
/// shard fails; the first failure is returned once all shards have stopped.
pub async fn run_discovery(
    request: DiscoveryRequest,
    progress: Arc<DiscoveryProgress>,
) -> Result<DiscoveryOutcome, DiscoveryError> {
    progress.reset();
    let result = run_inner(request, &progress).await;
    match &result {
        Ok(outcome) => {
            progress.set_status(DiscoveryStatus::Complete, "Complete");
            info!(
                run_id = %outcome.run_id,
                written = outcome.strategies_written(),
                enumerated = outcome.combinations_enumerated(),
                pruned = outcome.combinations_pruned(),
                "Discovery complete"
            );
        }
        Err(e) => {
            error!(error = %e, "Discovery failed");
            progress.set_error(e.to_string());
        }
    }
    result
}

async fn run_inner(request: DiscoveryRequest, progress: &Arc<DiscoveryProgress>) -> Result<DiscoveryOutcome, DiscoveryError> {
    request.config.validate()?;
    let run_id = request
        .run_id
        .clone()
        .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());

    info!(
        run_id = %run_id,
        dataset = %request.dataset.display(),
        library = %request.library.display(),
        workers = request.config.workers,
        max_factors = request.config.max_factors,
        min_sample = request.config.min_sample,
        prune = request.config.prune,
        "Starting discovery"
    );

    let (dataset_path, library_path) = (request.dataset.clone(), request.library.clone());
    let (dataset, library) = tokio::task::spawn_blocking(move || -> Result<_, LoadError> {
        let (dataset, _) = MatchDataset::load(&dataset_path)?;
        let (library, _) = FactorLibrary::load(&library_path)?;
        Ok((dataset, library))
    })
    .await
    .map_err(|e| DiscoveryError::Worker {
        shard: 0,
        message: format!("loader panicked: {e}"),
    })??;

    let dataset = Arc::new(dataset);
    let library = Arc::new(library);
    let config = Arc::new(request.config.clone());
    let shards = request.config.workers;

    progress.set_status(DiscoveryStatus::Searching, "Searching combinations");

    let mut handles = Vec::with_capacity(shards);
    for shard in 0..shards {
        let dataset = Arc::clone(&dataset);
        let library = Arc::clone(&library);
        let config = Arc::clone(&config);
        let progress = Arc::clone(progress);
        let out_dir = request.out_dir.clone();
        let run_id = run_id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            run_shard(&library, &dataset, &config, &out_dir, &run_id, shard, shards, &progress)
        }));
    }

    let mut metadata = Vec::with_capacity(shards);
    let mut first_error = None;
    for (shard, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(meta)) => metadata.push(meta),
            Ok(Err(e)) => {
                debug!(shard, error = %e, "Shard failed");
                first_error.get_or_insert(e);
            }
            Err(join) => {
                first_error.get_or_insert(DiscoveryError::Worker {
                    shard,
                    message: join.to_string(),
                });
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(DiscoveryOutcome {
        run_id,
        out_dir: request.out_dir,
        shards: metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::sample_records;
    use crate::factors::tests::sample_library;
    use persistence::shard::{merge_shards, ShardReader, MERGED_SUMMARIES};
    use persistence::sink::summaries_path;
    use persistence::RunStatus;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
        let dataset = dir.join("matches.json");
        let library = dir.join("factors.json");
        std::fs::write(&dataset, serde_json::to_string(&sample_records()).unwrap()).unwrap();
        std::fs::write(&library, serde_json::to_string(&sample_library()).unwrap()).unwrap();
        (dataset, library)
    }

    fn exhaustive(workers: usize) -> DiscoveryConfig {
        DiscoveryConfig {
            prune: false,
            workers,
            batch_size: 3,
            ..DiscoveryConfig::default()
        }
    }

    fn names_in(path: &Path) -> BTreeSet<String> {
        ShardReader::open(path).unwrap().map(|r| r.unwrap().name).collect()
    }

    #[test]
    fn test_progress_defaults() {
        let progress = DiscoveryProgress::new();
        assert!(!progress.is_running());
        assert_eq!(progress.progress_pct(), 0.0);
        progress.reset();
        assert!(progress.is_running());
        assert!(progress.started_at.read().unwrap().is_some());
    }

    #[test]
    fn test_run_shard_writes_every_combination() {
        let dir = tempfile::tempdir().unwrap();
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let progress = DiscoveryProgress::new();

        let meta = run_shard(&lib, &ds, &exhaustive(1), dir.path(), "run-x", 0, 1, &progress).unwrap();
        // 2 sides × 2 sizes × (1 + 2 + 2 + 4)
        assert_eq!(meta.combinations_enumerated, 36);
        assert_eq!(meta.strategies_written, 36);
        assert_eq!(meta.status, RunStatus::Complete);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 36);
        assert_eq!(progress.total_combinations.load(Ordering::Relaxed), 36);

        let records: Vec<SummaryRecord> = ShardReader::open(summaries_path(dir.path(), 0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let target = records.iter().find(|r| r.name == "xg_home+flat_200").unwrap();
        assert_eq!(target.total_bets, 1);
        assert_eq!(target.total_stake, dec!(200));
        assert_eq!(target.combination_hash, combination_hash("xg_home+flat_200"));
    }

    #[test]
    fn test_min_bets_filter_and_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let progress = DiscoveryProgress::new();
        let config = DiscoveryConfig {
            min_sample: 1,
            prune_ratio: 0.5,
            min_bets_to_write: 2,
            ..DiscoveryConfig::default()
        };
        let meta = run_shard(&lib, &ds, &config, dir.path(), "run-y", 0, 1, &progress).unwrap();
        // xg_home matches one game: its optional branches are pruned
        assert!(meta.combinations_pruned > 0);
        let names = names_in(&summaries_path(dir.path(), 0));
        assert!(!names.contains("xg_home+flat_200"));
        assert!(names.contains("xg_favourite+flat_200"));
        assert!(meta.strategies_written < meta.combinations_enumerated);

        // enumerated plus pruned branches cover the whole space
        let visited = progress.completed.load(Ordering::Relaxed) + progress.pruned_space.load(Ordering::Relaxed);
        assert_eq!(visited, progress.total_combinations.load(Ordering::Relaxed));
        assert_eq!(progress.progress_pct(), 100.0);
    }

    #[tokio::test]
    async fn test_sharded_run_matches_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, library) = write_inputs(dir.path());

        let single = run_discovery(
            DiscoveryRequest {
                dataset: dataset.clone(),
                library: library.clone(),
                out_dir: dir.path().join("single"),
                run_id: Some("single".to_string()),
                config: exhaustive(1),
            },
            Arc::new(DiscoveryProgress::new()),
        )
        .await
        .unwrap();
        assert_eq!(single.strategies_written(), 36);

        let progress = Arc::new(DiscoveryProgress::new());
        let sharded = run_discovery(
            DiscoveryRequest {
                dataset,
                library,
                out_dir: dir.path().join("sharded"),
                run_id: None,
                config: exhaustive(3),
            },
            Arc::clone(&progress),
        )
        .await
        .unwrap();
        assert_eq!(sharded.shards.len(), 3);
        assert_eq!(sharded.strategies_written(), 36);
        assert_eq!(progress.status(), DiscoveryStatus::Complete);
        assert_eq!(progress.shards_done.load(Ordering::Relaxed), 3);

        let report = merge_shards(&dir.path().join("sharded"), &dir.path().join("merged")).unwrap();
        assert_eq!(report.records, 36);
        assert_eq!(
            names_in(&dir.path().join("merged").join(MERGED_SUMMARIES)),
            names_in(&summaries_path(&dir.path().join("single"), 0))
        );
    }

    #[tokio::test]
    async fn test_missing_library_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (dataset, _) = write_inputs(dir.path());
        let progress = Arc::new(DiscoveryProgress::new());
        let result = run_discovery(
            DiscoveryRequest {
                dataset,
                library: dir.path().join("missing.json"),
                out_dir: dir.path().join("out"),
                run_id: None,
                config: DiscoveryConfig::default(),
            },
            Arc::clone(&progress),
        )
        .await;
        assert!(matches!(result, Err(DiscoveryError::Load(LoadError::Io { .. }))));
        assert_eq!(progress.status(), DiscoveryStatus::Error);
        assert!(progress.error_message.read().unwrap().is_some());
    }
}
