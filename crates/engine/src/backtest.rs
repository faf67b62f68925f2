//! Backtest Aggregator
//!
//! Grades every match in a combination's matching set and folds the bets
//! into a [`StrategySummary`]. The matching set is the intersection of the
//! per-factor sets: predicate factors filter by truth, side and size factors
//! only filter when gated by a condition. A match that cannot be graded is
//! logged, counted as skipped and left out of the totals.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::cache::{Evaluation, FactorCache, Resolution};
use crate::combination::Combination;
use crate::dataset::Match;
use crate::matchset::MatchSet;
use crate::settlement::{round_money, settle, SettlementError};
use crate::types::{BetGrade, MatchIdx, Outcome, Side, StrategySummary};

/// Why a qualifying match was not graded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SkipReason {
    SideUnresolved,
    StakeUnresolved,
    Settlement,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SideUnresolved => "side factor could not be resolved",
            Self::StakeUnresolved => "size factor could not be resolved",
            Self::Settlement => "settlement rejected the bet",
        }
    }
}

/// Warn once per (match, reason) so a bad record does not flood the log
#[derive(Default)]
struct SkipLog {
    seen: HashSet<(MatchIdx, SkipReason)>,
}

impl SkipLog {
    fn record(&mut self, m: &Match, strategy: &str, reason: SkipReason, detail: &str) {
        if self.seen.insert((m.idx, reason)) {
            warn!(match_id = %m.id, strategy = %strategy, reason = reason.as_str(), detail = %detail, "Skipping match");
        } else {
            debug!(match_id = %m.id, strategy = %strategy, reason = reason.as_str(), "Skipping match");
        }
    }
}

/// Running totals for one combination
#[derive(Debug, Default)]
struct Tally {
    bets: u32,
    wins: u32,
    losses: u32,
    pushes: u32,
    skipped: u32,
    stake: Decimal,
    payout: Decimal,
    profit: Decimal,
    odds_sum: Decimal,
    peak: Decimal,
    max_drawdown: Decimal,
    loss_streak: u32,
    max_loss_streak: u32,
}

impl Tally {
    fn fold(&mut self, grade: &BetGrade, odds: Decimal) {
        self.bets += 1;
        self.stake += grade.stake;
        self.payout += grade.payout;
        self.profit += grade.profit;
        self.odds_sum += odds;

        match grade.outcome {
            Outcome::Win => {
                self.wins += 1;
                self.loss_streak = 0;
            }
            Outcome::Loss => {
                self.losses += 1;
                self.loss_streak += 1;
                self.max_loss_streak = self.max_loss_streak.max(self.loss_streak);
            }
            Outcome::Push => self.pushes += 1,
        }

        if self.profit > self.peak {
            self.peak = self.profit;
        }
        let drawdown = self.peak - self.profit;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }

    fn finish(self, combination: &Combination, cache: &FactorCache<'_>) -> StrategySummary {
        let library = cache.library();
        let hundred = dec!(100);

        let roi = if self.stake.is_zero() {
            Decimal::ZERO
        } else {
            (self.profit / self.stake * hundred).round_dp(2)
        };
        let win_rate = if self.bets == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(self.wins) / Decimal::from(self.bets) * hundred).round_dp(2)
        };
        let avg_odds = if self.bets == 0 {
            Decimal::ZERO
        } else {
            (self.odds_sum / Decimal::from(self.bets)).round_dp(3)
        };

        StrategySummary {
            name: combination.name(library),
            side_factor: library.qualified_key(combination.side),
            size_factor: library.qualified_key(combination.size),
            optional_factors: combination
                .optional
                .iter()
                .map(|id| library.qualified_key(*id))
                .collect(),
            total_bets: self.bets,
            wins: self.wins,
            losses: self.losses,
            pushes: self.pushes,
            skipped: self.skipped,
            total_stake: round_money(self.stake),
            total_payout: round_money(self.payout),
            total_profit: round_money(self.profit),
            roi,
            win_rate,
            avg_odds,
            max_drawdown: round_money(self.max_drawdown),
            max_consecutive_losses: self.max_loss_streak,
        }
    }
}

/// Grades combinations against one worker's cache
pub struct Aggregator<'a> {
    cache: FactorCache<'a>,
    skips: SkipLog,
}

impl<'a> Aggregator<'a> {
    pub fn new(cache: FactorCache<'a>) -> Self {
        Self {
            cache,
            skips: SkipLog::default(),
        }
    }

    pub fn cache(&self) -> &FactorCache<'a> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut FactorCache<'a> {
        &mut self.cache
    }

    /// Intersection of every factor's matching set
    pub fn matching_set(&mut self, combination: &Combination) -> MatchSet {
        let mut factors = combination.factors();
        let first = factors.next().unwrap_or(combination.side);
        let mut set = self.cache.matching_set(first).clone();
        for id in factors {
            if set.is_empty() {
                break;
            }
            set.intersect_with(self.cache.matching_set(id));
        }
        set
    }

    pub fn aggregate(&mut self, combination: &Combination) -> StrategySummary {
        let set = self.matching_set(combination);
        let dataset = self.cache.dataset();
        let mut tally = Tally::default();
        let mut name: Option<String> = None;

        for idx in set.iter() {
            let m = dataset.get(idx);
            let side = match self.cache.evaluate(combination.side, idx) {
                Evaluation::Side(Resolution::Value(side)) => side,
                _ => {
                    tally.skipped += 1;
                    let strategy = name.get_or_insert_with(|| combination.name(self.cache.library()));
                    self.skips.record(m, strategy, SkipReason::SideUnresolved, "no side");
                    continue;
                }
            };
            let stake = match self.cache.evaluate(combination.size, idx) {
                Evaluation::Stake(Resolution::Value(stake)) => stake,
                _ => {
                    tally.skipped += 1;
                    let strategy = name.get_or_insert_with(|| combination.name(self.cache.library()));
                    self.skips.record(m, strategy, SkipReason::StakeUnresolved, "no stake");
                    continue;
                }
            };

            match grade(m, side, stake) {
                Ok((grade, odds)) => tally.fold(&grade, odds),
                Err(e) => {
                    tally.skipped += 1;
                    let strategy = name.get_or_insert_with(|| combination.name(self.cache.library()));
                    self.skips.record(m, strategy, SkipReason::Settlement, &e.to_string());
                }
            }
        }

        tally.finish(combination, &self.cache)
    }
}

fn grade(m: &Match, side: Side, stake: Decimal) -> Result<(BetGrade, Decimal), SettlementError> {
    let odds = m.odds_for(side);
    let grade = settle(m.home_goals, m.away_goals, m.line_for(side), side, odds, stake)?;
    Ok((grade, odds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::sample_records;
    use crate::dataset::MatchDataset;
    use crate::factors::tests::sample_library;
    use crate::factors::FactorLibrary;
    use crate::types::FactorId;
    use serde_json::json;

    fn find(lib: &FactorLibrary, key: &str) -> FactorId {
        lib.factors().iter().find(|f| f.key == key).unwrap().id
    }

    #[test]
    fn test_single_qualifying_match() {
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));

        let combination = Combination {
            side: find(&lib, "xg_home"),
            size: find(&lib, "flat_200"),
            optional: vec![],
        };
        let summary = agg.aggregate(&combination);
        assert_eq!(summary.name, "xg_home+flat_200");
        assert_eq!(summary.total_bets, 1);
        assert_eq!(summary.total_stake, dec!(200));
        // m1: 2-1 at -0.5, odds 1.9
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.total_payout, dec!(380));
        assert_eq!(summary.total_profit, dec!(180));
        assert_eq!(summary.roi, dec!(90));
        assert_eq!(summary.win_rate, dec!(100));
        assert_eq!(summary.avg_odds, dec!(1.9));
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn test_folds_mixed_results() {
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));

        // Always away: m2 0-0 at 0 push, m1 1-2 at +0.5 loss, m3 3-1 at +0.5/+1 win
        let doc = json!({
            "mandatory": {"side": [{"key": "away", "side": "away"}], "size": [{"key": "flat", "stake": 100}]}
        });
        let (away_lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let mut away = Aggregator::new(FactorCache::new(&away_lib, &ds));
        let summary = away.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![],
        });
        assert_eq!(summary.total_bets, 3);
        assert_eq!((summary.wins, summary.losses, summary.pushes), (1, 1, 1));
        assert_eq!(summary.total_stake, dec!(300));
        // 100 + 0 + 205
        assert_eq!(summary.total_payout, dec!(305));
        assert_eq!(summary.total_profit, dec!(5));
        assert_eq!(summary.roi, dec!(1.67));
        assert_eq!(summary.win_rate, dec!(33.33));
        assert_eq!(summary.max_drawdown, dec!(100));
        assert_eq!(summary.max_consecutive_losses, 1);

        let any = agg.aggregate(&Combination {
            side: find(&lib, "xg_favourite"),
            size: find(&lib, "flat_200"),
            optional: vec![find(&lib, "short_line")],
        });
        // short_line keeps m2 (0) and m1 (-0.5)
        assert_eq!(any.total_bets, 2);
    }

    #[test]
    fn test_zero_matches_gives_zero_ratios() {
        let doc = json!({
            "mandatory": {"side": [{"key": "home", "side": "home"}], "size": [{"key": "flat", "stake": 100}]},
            "never": [{"key": "none", "expr": "false"}]
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let summary = agg.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![FactorId(2)],
        });
        assert_eq!(summary.total_bets, 0);
        assert_eq!(summary.roi, Decimal::ZERO);
        assert_eq!(summary.win_rate, Decimal::ZERO);
        assert_eq!(summary.avg_odds, Decimal::ZERO);
    }

    #[test]
    fn test_adding_a_predicate_never_grows_the_set() {
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let base = Combination {
            side: find(&lib, "xg_favourite"),
            size: find(&lib, "odds_scaled"),
            optional: vec![],
        };
        let base_set = agg.matching_set(&base);
        for category in lib.categories() {
            for member in &category.members {
                let extended = Combination {
                    optional: vec![*member],
                    ..base.clone()
                };
                let set = agg.matching_set(&extended);
                assert!(set.iter().all(|idx| base_set.contains(idx)));
                let expected: Vec<MatchIdx> = base_set
                    .iter()
                    .filter(|idx| agg.cache_mut().matching_set(*member).contains(*idx))
                    .collect();
                assert_eq!(set.iter().collect::<Vec<_>>(), expected);
            }
        }
    }

    #[test]
    fn test_unresolved_stake_is_skipped_not_graded() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "home", "side": "home"}],
                "size": [{"key": "edge", "expr": "home.xg - away.xg"}]
            }
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let summary = agg.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![],
        });
        // Only m1 has a positive xg edge
        assert_eq!(summary.total_bets, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.total_stake, dec!(0.70));
    }

    #[test]
    fn test_unsettleable_match_is_skipped() {
        let mut records = sample_records();
        records.push(json!({
            "id": "m4", "date": "2024-03-04", "home_team": "Vitesse", "away_team": "Heerenveen",
            "home_goals": 1, "away_goals": 0, "handicap": "0",
            "home_odds": 0, "away_odds": 1.9,
            "home": {"xg": 1.2}, "away": {"xg": 0.7}
        }));
        let doc = json!({
            "mandatory": {"side": [{"key": "home", "side": "home"}], "size": [{"key": "flat", "stake": 100}]}
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, report) = MatchDataset::from_records(records);
        assert_eq!(report.loaded, 4);
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let summary = agg.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![],
        });
        assert_eq!(summary.total_bets, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_stake, dec!(300));
    }

    #[test]
    fn test_unresolved_side_is_skipped_not_graded() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "strong_or_draw", "expr": "home.xg > 1.5 ? 'home' : 'draw'"}],
                "size": [{"key": "flat", "stake": 100}]
            }
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let summary = agg.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![],
        });
        // only m1 resolves to a side
        assert_eq!(summary.total_bets, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(agg.cache().failures(FactorId(0)), 2);
    }

    #[test]
    fn test_sub_cent_fixed_stake_keeps_profit_consistent() {
        let doc = json!({
            "mandatory": {"side": [{"key": "home", "side": "home"}], "size": [{"key": "odd", "stake": 100.555}]}
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut agg = Aggregator::new(FactorCache::new(&lib, &ds));
        let summary = agg.aggregate(&Combination {
            side: FactorId(0),
            size: FactorId(1),
            optional: vec![],
        });
        // m2 push 100.56, m1 win 191.06, m3 loss
        assert_eq!(summary.total_bets, 3);
        assert_eq!(summary.total_stake, dec!(301.68));
        assert_eq!(summary.total_payout, dec!(291.62));
        assert_eq!(summary.total_profit, dec!(-10.06));
        assert_eq!(summary.total_profit, summary.total_payout - summary.total_stake);
    }
}
