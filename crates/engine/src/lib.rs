//! Handicap Discover Engine: Asian-handicap strategy search and backtesting
//!
//! Provides:
//! - Match dataset loader and factor library
//! - Factor expression language with a per-worker evaluation cache
//! - Exact Asian-handicap settlement, including quarter lines
//! - Lazy combination generator with sample-size pruning
//! - Backtest aggregator and sharded discovery runner

pub mod backtest;
pub mod cache;
pub mod combination;
pub mod config;
pub mod dataset;
pub mod discovery;
pub mod error;
pub mod expr;
pub mod factors;
pub mod matchset;
pub mod settlement;
pub mod types;

// Re-exports for convenience
pub use backtest::Aggregator;
pub use cache::{evaluate, CacheStats, Evaluation, FactorCache, Resolution};
pub use combination::{combination_hash, Combination, CombinationGenerator, GeneratorStats, PruneConfig};
pub use config::DiscoveryConfig;
pub use dataset::{LoadReport, Match, MatchDataset};
pub use discovery::{
    run_discovery, run_shard, summary_to_record, DiscoveryOutcome, DiscoveryProgress, DiscoveryRequest,
    DiscoveryStatus,
};
pub use error::{DiscoveryError, LoadError};
pub use expr::{EvalError, Expr, ExprError, MatchContext, Value};
pub use factors::{Factor, FactorLibrary, LibraryReport};
pub use matchset::MatchSet;
pub use settlement::{round_money, settle, SettlementError};
pub use types::*;
