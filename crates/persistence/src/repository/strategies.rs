//! Strategy summaries repository: ranking store fed from shard files

use crate::record::SummaryRecord;
use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A strategy summary row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyRecord {
    pub id: Option<i64>,
    pub combination_hash: String,
    pub name: String,
    pub side_factor: String,
    pub size_factor: String,
    /// JSON array of `category.key`
    pub optional_factors: String,
    pub factor_count: i64,
    pub total_bets: i64,
    pub wins: i64,
    pub losses: i64,
    pub pushes: i64,
    pub skipped: i64,
    pub total_stake: String,
    pub total_payout: String,
    pub total_profit: String,
    pub roi: String,
    pub win_rate: String,
    pub avg_odds: String,
    pub max_drawdown: String,
    pub max_consecutive_losses: i64,
    pub run_id: Option<String>,
    pub shard: Option<i64>,
}

impl From<&SummaryRecord> for StrategyRecord {
    fn from(s: &SummaryRecord) -> Self {
        Self {
            id: None,
            combination_hash: s.combination_hash.clone(),
            name: s.name.clone(),
            side_factor: s.side_factor.clone(),
            size_factor: s.size_factor.clone(),
            optional_factors: serde_json::to_string(&s.optional_factors).unwrap_or_else(|_| "[]".to_string()),
            factor_count: 2 + s.optional_factors.len() as i64,
            total_bets: s.total_bets as i64,
            wins: s.wins as i64,
            losses: s.losses as i64,
            pushes: s.pushes as i64,
            skipped: s.skipped as i64,
            total_stake: s.total_stake.to_string(),
            total_payout: s.total_payout.to_string(),
            total_profit: s.total_profit.to_string(),
            roi: s.roi.to_string(),
            win_rate: s.win_rate.to_string(),
            avg_odds: s.avg_odds.to_string(),
            max_drawdown: s.max_drawdown.to_string(),
            max_consecutive_losses: s.max_consecutive_losses as i64,
            run_id: Some(s.run_id.clone()),
            shard: Some(s.shard as i64),
        }
    }
}

/// Filters for ranking queries
#[derive(Debug, Clone, Default)]
pub struct TopQuery<'q> {
    pub limit: i64,
    pub min_bets: Option<i64>,
    pub min_roi: Option<f64>,
    pub side_factor: Option<&'q str>,
    pub sort_by: Option<&'q str>,
}

/// Aggregated stats over imported strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStats {
    pub total_strategies: i64,
    pub profitable: i64,
    pub total_runs: i64,
    pub best_roi: String,
    pub best_roi_strategy: String,
    pub most_bets: i64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, combination_hash, name, side_factor, size_factor, optional_factors,
           factor_count, total_bets, wins, losses, pushes, skipped,
           total_stake, total_payout, total_profit, roi, win_rate, avg_odds,
           max_drawdown, max_consecutive_losses, run_id, shard
    FROM strategy_summaries
"#;

/// Repository for strategy summaries
pub struct StrategyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StrategyRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch in one transaction (INSERT OR IGNORE on combination_hash).
    /// Returns the number of rows actually inserted.
    pub async fn save_batch(&self, records: &[SummaryRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for summary in records {
            let record = StrategyRecord::from(summary);
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO strategy_summaries (
                    combination_hash, name, side_factor, size_factor, optional_factors,
                    factor_count, total_bets, wins, losses, pushes, skipped,
                    total_stake, total_payout, total_profit, roi, win_rate, avg_odds,
                    max_drawdown, max_consecutive_losses, run_id, shard
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.combination_hash)
            .bind(&record.name)
            .bind(&record.side_factor)
            .bind(&record.size_factor)
            .bind(&record.optional_factors)
            .bind(record.factor_count)
            .bind(record.total_bets)
            .bind(record.wins)
            .bind(record.losses)
            .bind(record.pushes)
            .bind(record.skipped)
            .bind(&record.total_stake)
            .bind(&record.total_payout)
            .bind(&record.total_profit)
            .bind(&record.roi)
            .bind(&record.win_rate)
            .bind(&record.avg_odds)
            .bind(&record.max_drawdown)
            .bind(record.max_consecutive_losses)
            .bind(&record.run_id)
            .bind(record.shard)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<StrategyRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE combination_hash = ?");
        let record = sqlx::query_as::<_, StrategyRecord>(&sql)
            .bind(hash)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Best strategies by the chosen column, with sample-size and ROI floors
    pub async fn get_top(&self, query: &TopQuery<'_>) -> DbResult<Vec<StrategyRecord>> {
        let mut where_clauses = vec!["1=1".to_string()];

        if query.min_bets.is_some() {
            where_clauses.push("total_bets >= ?".to_string());
        }
        if query.min_roi.is_some() {
            where_clauses.push("CAST(roi AS REAL) >= ?".to_string());
        }
        if query.side_factor.is_some() {
            where_clauses.push("side_factor = ?".to_string());
        }

        let order_col = match query.sort_by {
            Some("total_profit") => "CAST(total_profit AS REAL)",
            Some("win_rate") => "CAST(win_rate AS REAL)",
            Some("total_bets") => "total_bets",
            Some("max_drawdown") => "-CAST(max_drawdown AS REAL)",
            _ => "CAST(roi AS REAL)",
        };

        let sql = format!(
            "{SELECT_COLUMNS} WHERE {} ORDER BY {order_col} DESC, total_bets DESC LIMIT ?",
            where_clauses.join(" AND ")
        );

        let mut q = sqlx::query_as::<_, StrategyRecord>(&sql);
        if let Some(min_bets) = query.min_bets {
            q = q.bind(min_bets);
        }
        if let Some(min_roi) = query.min_roi {
            q = q.bind(min_roi);
        }
        if let Some(side) = query.side_factor {
            q = q.bind(side);
        }
        q = q.bind(query.limit);

        let records = q.fetch_all(self.pool).await?;
        Ok(records)
    }

    pub async fn get_stats(&self, min_bets: i64) -> DbResult<StrategyStats> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM strategy_summaries")
            .fetch_one(self.pool)
            .await?;

        let profitable: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM strategy_summaries WHERE CAST(total_profit AS REAL) > 0")
                .fetch_one(self.pool)
                .await?;

        let total_runs: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT run_id) FROM strategy_summaries WHERE run_id IS NOT NULL",
        )
        .fetch_one(self.pool)
        .await?;

        let most_bets: (Option<i64>,) = sqlx::query_as("SELECT MAX(total_bets) FROM strategy_summaries")
            .fetch_one(self.pool)
            .await?;

        // Best ROI among strategies with a usable sample
        let best: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT roi, name
            FROM strategy_summaries
            WHERE total_bets >= ?
            ORDER BY CAST(roi AS REAL) DESC
            LIMIT 1
            "#,
        )
        .bind(min_bets)
        .fetch_optional(self.pool)
        .await?;

        let (best_roi, best_roi_strategy) = best.unwrap_or_else(|| ("0".to_string(), "N/A".to_string()));

        Ok(StrategyStats {
            total_strategies: total.0,
            profitable: profitable.0,
            total_runs: total_runs.0,
            best_roi,
            best_roi_strategy,
            most_bets: most_bets.0.unwrap_or(0),
        })
    }
}
