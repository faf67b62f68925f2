//! Per-worker memo of factor evaluations
//!
//! A factor recurs across thousands of combinations, so each (factor, match)
//! pair is evaluated at most once per worker. Storage is a dense column per
//! factor, allocated the first time that factor is touched. Nothing is ever
//! evicted: the dataset and library are fixed for the run.

use std::collections::HashSet;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dataset::{Match, MatchDataset};
use crate::expr::EvalError;
use crate::factors::{Factor, FactorLibrary, FactorRule, SideRule, StakeRule};
use crate::matchset::MatchSet;
use crate::types::{FactorId, MatchIdx, Side};

/// Result of resolving a side or stake factor for one match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    Value(T),
    /// The factor's condition does not hold; the match does not qualify
    GatedOut,
    /// The match qualifies but the value could not be computed
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Predicate(bool),
    Side(Resolution<Side>),
    Stake(Resolution<Decimal>),
}

impl Evaluation {
    /// Whether the match belongs to the factor's matching set
    pub fn qualifies(&self) -> bool {
        match self {
            Self::Predicate(b) => *b,
            Self::Side(r) => !matches!(r, Resolution::GatedOut),
            Self::Stake(r) => !matches!(r, Resolution::GatedOut),
        }
    }

    /// Value used when evaluation fails
    fn fail_soft(factor: &Factor) -> Self {
        match factor.rule {
            FactorRule::Predicate(_) => Self::Predicate(false),
            FactorRule::Side(_) => Self::Side(Resolution::Failed),
            FactorRule::Stake(_) => Self::Stake(Resolution::Failed),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactorError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("'{0}' is not a side")]
    NotASide(String),

    #[error("stake {0} is not a positive amount")]
    BadStake(String),
}

/// Evaluate a factor against a match without memoization.
///
/// Pure: the same (factor, match) always yields the same result.
pub fn evaluate(factor: &Factor, m: &Match) -> Result<Evaluation, FactorError> {
    if let Some(condition) = &factor.condition {
        if !condition.eval_bool(&m.context)? {
            return Ok(match factor.rule {
                FactorRule::Predicate(_) => Evaluation::Predicate(false),
                FactorRule::Side(_) => Evaluation::Side(Resolution::GatedOut),
                FactorRule::Stake(_) => Evaluation::Stake(Resolution::GatedOut),
            });
        }
    }

    Ok(match &factor.rule {
        FactorRule::Predicate(expr) => Evaluation::Predicate(expr.eval_bool(&m.context)?),
        FactorRule::Side(SideRule::Fixed(side)) => Evaluation::Side(Resolution::Value(*side)),
        FactorRule::Side(SideRule::Computed(expr)) => {
            let text = expr.eval_text(&m.context)?;
            let side = text.parse::<Side>().map_err(|_| FactorError::NotASide(text))?;
            Evaluation::Side(Resolution::Value(side))
        }
        FactorRule::Stake(StakeRule::Fixed(stake)) => Evaluation::Stake(Resolution::Value(*stake)),
        FactorRule::Stake(StakeRule::Computed(expr)) => {
            let raw = expr.eval_number(&m.context)?;
            let text = format!("{:.2}", raw);
            let stake = Decimal::from_str_exact(&text).map_err(|_| FactorError::BadStake(text.clone()))?;
            if stake <= Decimal::ZERO {
                return Err(FactorError::BadStake(text));
            }
            Evaluation::Stake(Resolution::Value(stake))
        }
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

pub struct FactorCache<'a> {
    library: &'a FactorLibrary,
    dataset: &'a MatchDataset,
    columns: Vec<Option<Vec<Option<Evaluation>>>>,
    sets: Vec<Option<MatchSet>>,
    failures: Vec<u32>,
    warned: HashSet<FactorId>,
    stats: CacheStats,
}

impl<'a> FactorCache<'a> {
    pub fn new(library: &'a FactorLibrary, dataset: &'a MatchDataset) -> Self {
        let n = library.len();
        Self {
            library,
            dataset,
            columns: vec![None; n],
            sets: vec![None; n],
            failures: vec![0; n],
            warned: HashSet::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn library(&self) -> &'a FactorLibrary {
        self.library
    }

    pub fn dataset(&self) -> &'a MatchDataset {
        self.dataset
    }

    pub fn evaluate(&mut self, id: FactorId, idx: MatchIdx) -> Evaluation {
        let universe = self.dataset.len();
        let column = self.columns[id.index()].get_or_insert_with(|| vec![None; universe]);
        if let Some(cached) = column[idx.index()] {
            self.stats.hits += 1;
            return cached;
        }
        self.stats.misses += 1;

        let library = self.library;
        let dataset = self.dataset;
        let factor = library.factor(id);
        let m = dataset.get(idx);
        let evaluation = match evaluate(factor, m) {
            Ok(e) => e,
            Err(e) => {
                self.record_failure(factor, m, &e);
                Evaluation::fail_soft(factor)
            }
        };
        if let Some(column) = self.columns[id.index()].as_mut() {
            column[idx.index()] = Some(evaluation);
        }
        evaluation
    }

    /// Matches for which the factor qualifies. Built on first use.
    pub fn matching_set(&mut self, id: FactorId) -> &MatchSet {
        let set = match self.sets[id.index()].take() {
            Some(set) => set,
            None => {
                let mut set = MatchSet::empty(self.dataset.len());
                for i in 0..self.dataset.len() {
                    let idx = MatchIdx(i as u32);
                    if self.evaluate(id, idx).qualifies() {
                        set.insert(idx);
                    }
                }
                set
            }
        };
        self.sets[id.index()].insert(set)
    }

    pub fn set_size(&mut self, id: FactorId) -> usize {
        self.matching_set(id).len()
    }

    /// Evaluate every factor against every match
    pub fn warm(&mut self) -> Vec<usize> {
        (0..self.library.len())
            .map(|i| self.set_size(FactorId(i as u32)))
            .collect()
    }

    pub fn failures(&self, id: FactorId) -> u32 {
        self.failures[id.index()]
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn record_failure(&mut self, factor: &Factor, m: &Match, error: &FactorError) {
        self.failures[factor.id.index()] += 1;
        self.stats.failures += 1;
        if self.warned.insert(factor.id) {
            warn!(
                factor = %self.library.qualified_key(factor.id),
                match_id = %m.id,
                error = %error,
                "Factor evaluation failed, falling back to default"
            );
        } else {
            debug!(factor = %factor.key, match_id = %m.id, error = %error, "Factor evaluation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::sample_records;
    use crate::factors::tests::sample_library;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn fixtures() -> (FactorLibrary, MatchDataset) {
        let (lib, _) = FactorLibrary::from_json(&sample_library()).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        (lib, ds)
    }

    fn find(lib: &FactorLibrary, key: &str) -> FactorId {
        lib.factors().iter().find(|f| f.key == key).unwrap().id
    }

    #[test]
    fn test_gated_side_factor() {
        let (lib, ds) = fixtures();
        let mut cache = FactorCache::new(&lib, &ds);
        let xg_home = find(&lib, "xg_home");
        // Sorted order: m2, m1, m3. Only m1 has home xg above away xg.
        assert_eq!(cache.evaluate(xg_home, MatchIdx(0)), Evaluation::Side(Resolution::GatedOut));
        assert_eq!(
            cache.evaluate(xg_home, MatchIdx(1)),
            Evaluation::Side(Resolution::Value(Side::Home))
        );
        let set: Vec<u32> = cache.matching_set(xg_home).iter().map(|m| m.0).collect();
        assert_eq!(set, vec![1]);
    }

    #[test]
    fn test_computed_side_and_stake() {
        let (lib, ds) = fixtures();
        let mut cache = FactorCache::new(&lib, &ds);
        let fav = find(&lib, "xg_favourite");
        let scaled = find(&lib, "odds_scaled");
        assert_eq!(cache.evaluate(fav, MatchIdx(0)), Evaluation::Side(Resolution::Value(Side::Away)));
        assert_eq!(cache.evaluate(fav, MatchIdx(2)), Evaluation::Side(Resolution::Value(Side::Home)));
        assert_eq!(
            cache.evaluate(scaled, MatchIdx(1)),
            Evaluation::Stake(Resolution::Value(dec!(190.00)))
        );
        // Ungated mandatory factors qualify everywhere
        assert_eq!(cache.set_size(fav), 3);
        assert_eq!(cache.set_size(scaled), 3);
    }

    #[test]
    fn test_cold_and_warm_evaluations_match() {
        let (lib, ds) = fixtures();
        let mut cache = FactorCache::new(&lib, &ds);
        for factor in lib.factors() {
            for m in ds.iter() {
                let cold = cache.evaluate(factor.id, m.idx);
                let warm = cache.evaluate(factor.id, m.idx);
                assert_eq!(cold, warm);
                assert_eq!(evaluate(factor, m).unwrap(), cold);
            }
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, (lib.len() * ds.len()) as u64);
        assert_eq!(stats.hits, stats.misses);
    }

    #[test]
    fn test_failures_are_soft_and_counted() {
        let doc = json!({
            "mandatory": {
                "side": [{"key": "by_field", "expr": "preferred_side"}],
                "size": [{"key": "ratio", "expr": "home.xg - away.xg"}]
            },
            "extra": [{"key": "needs_missing", "expr": "home.shots > 5"}]
        });
        let (lib, _) = FactorLibrary::from_json(&doc).unwrap();
        let (ds, _) = MatchDataset::from_records(sample_records());
        let mut cache = FactorCache::new(&lib, &ds);

        let side = lib.side_factors()[0];
        let size = lib.size_factors()[0];
        let extra = lib.categories()[0].members[0];

        assert_eq!(cache.evaluate(side, MatchIdx(0)), Evaluation::Side(Resolution::Failed));
        // m1 has a positive xg difference, m2 a negative one
        assert_eq!(cache.evaluate(size, MatchIdx(1)), Evaluation::Stake(Resolution::Value(dec!(0.70))));
        assert_eq!(cache.evaluate(size, MatchIdx(0)), Evaluation::Stake(Resolution::Failed));
        assert!(cache.matching_set(extra).is_empty());
        assert_eq!(cache.failures(extra), 3);
        assert_eq!(cache.set_size(side), 3);
    }
}
