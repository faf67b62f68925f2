//! Records written to shard files

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One finalized strategy summary, one JSON line in a shard file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub combination_hash: String,
    pub name: String,
    pub side_factor: String,
    pub size_factor: String,
    #[serde(default)]
    pub optional_factors: Vec<String>,
    pub total_bets: u32,
    pub wins: u32,
    pub losses: u32,
    pub pushes: u32,
    #[serde(default)]
    pub skipped: u32,
    pub total_stake: Decimal,
    pub total_payout: Decimal,
    pub total_profit: Decimal,
    pub roi: Decimal,
    pub win_rate: Decimal,
    pub avg_odds: Decimal,
    pub max_drawdown: Decimal,
    pub max_consecutive_losses: u32,
    pub run_id: String,
    pub shard: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
}

/// Companion checkpoint for a shard, rewritten periodically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub shard: usize,
    pub shards: usize,
    pub status: RunStatus,
    pub combinations_enumerated: u64,
    pub combinations_pruned: u64,
    pub strategies_written: u64,
    pub batches_flushed: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMetadata {
    pub fn new(run_id: impl Into<String>, shard: usize, shards: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            shard,
            shards,
            status: RunStatus::Running,
            combinations_enumerated: 0,
            combinations_pruned: 0,
            strategies_written: 0,
            batches_flushed: 0,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }
}
