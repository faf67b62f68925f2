//! Database schema definitions

/// SQL to create all tables
/// NOTE: All money and ratio columns stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Imported strategy summaries
CREATE TABLE IF NOT EXISTS strategy_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    combination_hash TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    side_factor TEXT NOT NULL,
    size_factor TEXT NOT NULL,
    optional_factors TEXT NOT NULL DEFAULT '[]',
    factor_count INTEGER NOT NULL,
    total_bets INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    pushes INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    total_stake TEXT NOT NULL DEFAULT '0',
    total_payout TEXT NOT NULL DEFAULT '0',
    total_profit TEXT NOT NULL DEFAULT '0',
    roi TEXT NOT NULL DEFAULT '0',
    win_rate TEXT NOT NULL DEFAULT '0',
    avg_odds TEXT NOT NULL DEFAULT '0',
    max_drawdown TEXT NOT NULL DEFAULT '0',
    max_consecutive_losses INTEGER NOT NULL DEFAULT 0,
    run_id TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_strategy_hash ON strategy_summaries(combination_hash);
CREATE INDEX IF NOT EXISTS idx_strategy_bets ON strategy_summaries(total_bets DESC);
CREATE INDEX IF NOT EXISTS idx_strategy_side_size ON strategy_summaries(side_factor, size_factor);
CREATE INDEX IF NOT EXISTS idx_strategy_run ON strategy_summaries(run_id)
"#;

/// Column additions applied after CREATE_TABLES. A "duplicate column name"
/// error means the column already exists and is ignored.
pub const MIGRATIONS: &[&str] = &["ALTER TABLE strategy_summaries ADD COLUMN shard INTEGER"];
