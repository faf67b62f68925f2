//! Lazy enumeration of candidate strategies
//!
//! Every combination holds one side factor, one size factor and up to
//! `max_factors - 2` optional factors drawn from distinct categories. The
//! space is walked depth-first with an explicit stack, one combination per
//! `next()`, so memory is bounded by the search depth rather than by the
//! number of combinations.
//!
//! Optional factors are always chosen in ascending category order, which
//! gives each combination exactly one path and one canonical name.

use sha2::{Digest, Sha256};

use crate::config::DiscoveryConfig;
use crate::factors::FactorLibrary;
use crate::types::FactorId;

// ============================================================================
// Combination
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Combination {
    pub side: FactorId,
    pub size: FactorId,
    /// In ascending category order
    pub optional: Vec<FactorId>,
}

impl Combination {
    pub fn factor_count(&self) -> usize {
        2 + self.optional.len()
    }

    pub fn factors(&self) -> impl Iterator<Item = FactorId> + '_ {
        [self.side, self.size].into_iter().chain(self.optional.iter().copied())
    }

    /// `side+size+category.key+...`
    pub fn name(&self, library: &FactorLibrary) -> String {
        let mut name = format!(
            "{}+{}",
            library.qualified_key(self.side),
            library.qualified_key(self.size)
        );
        for id in &self.optional {
            name.push('+');
            name.push_str(&library.qualified_key(*id));
        }
        name
    }
}

/// Stable identity of a combination across runs and shards
pub fn combination_hash(name: &str) -> String {
    let hash = Sha256::digest(name.as_bytes());
    format!("{:x}", hash)
}

// ============================================================================
// Pruning
// ============================================================================

/// Lower-bound estimate used to abandon branches that cannot reach a useful
/// sample. The intersection of several sets is estimated as the smallest
/// set scaled by `ratio`. This is a heuristic and can discard a rare viable
/// combination; disable it for exhaustive runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneConfig {
    pub enabled: bool,
    pub min_sample: usize,
    pub ratio: f64,
}

impl PruneConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_sample: 0,
            ratio: 1.0,
        }
    }

    pub fn keeps(&self, smallest_set: usize) -> bool {
        !self.enabled || smallest_set as f64 * self.ratio >= self.min_sample as f64
    }
}

impl From<&DiscoveryConfig> for PruneConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            enabled: config.prune,
            min_sample: config.min_sample,
            ratio: config.prune_ratio,
        }
    }
}

// ============================================================================
// Generator
// ============================================================================

pub struct CombinationGenerator<'a> {
    library: &'a FactorLibrary,
    set_sizes: Vec<usize>,
    max_optional: usize,
    prune: PruneConfig,
    /// `extensions[c][r]`: ways to add at most `r` factors from categories `c..`
    extensions: Vec<Vec<u64>>,
}

impl<'a> CombinationGenerator<'a> {
    /// `set_sizes` holds the matching-set size of every factor, by id
    pub fn new(library: &'a FactorLibrary, set_sizes: Vec<usize>, max_factors: usize, prune: PruneConfig) -> Self {
        debug_assert_eq!(set_sizes.len(), library.len());
        let max_optional = max_factors.saturating_sub(2).min(library.categories().len());
        let categories = library.categories();
        let mut extensions = vec![vec![1u64; max_optional + 1]; categories.len() + 1];
        for c in (0..categories.len()).rev() {
            let members = categories[c].members.len() as u64;
            for r in 1..=max_optional {
                extensions[c][r] =
                    extensions[c + 1][r].saturating_add(members.saturating_mul(extensions[c + 1][r - 1]));
            }
        }
        Self {
            library,
            set_sizes,
            max_optional,
            prune,
            extensions,
        }
    }

    /// Side × size pairs
    pub fn pair_count(&self) -> usize {
        self.library.side_factors().len() * self.library.size_factors().len()
    }

    /// Number of combinations an unpruned walk would produce
    pub fn unpruned_total(&self) -> u64 {
        self.unpruned_shard_total(0, 1)
    }

    /// Unpruned combination count for one shard's pairs
    pub fn unpruned_shard_total(&self, shard: usize, shards: usize) -> u64 {
        let per_pair = self.extensions[0][self.max_optional];
        per_pair.saturating_mul(self.shard_pair_count(shard, shards) as u64)
    }

    /// Pairs whose index is congruent to `shard` mod `shards`
    pub fn shard_pair_count(&self, shard: usize, shards: usize) -> usize {
        let pairs = self.pair_count();
        let shards = shards.max(1);
        if shard >= pairs {
            0
        } else {
            (pairs - shard).div_ceil(shards)
        }
    }

    /// Walk the whole space
    pub fn iter(&self) -> Combinations<'_, 'a> {
        self.iter_shard(0, 1)
    }

    /// Walk the pairs whose index is congruent to `shard` mod `shards`
    pub fn iter_shard(&self, shard: usize, shards: usize) -> Combinations<'_, 'a> {
        Combinations {
            generator: self,
            shard,
            shards: shards.max(1),
            next_pair: shard,
            pair: None,
            stack: Vec::new(),
            path: Vec::new(),
            stats: GeneratorStats::default(),
        }
    }

    fn size_of(&self, id: FactorId) -> usize {
        self.set_sizes.get(id.index()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub enumerated: u64,
    /// Branches abandoned by the pruning estimate
    pub pruned: u64,
    /// Combinations inside abandoned branches, the branch root included
    pub pruned_space: u64,
}

/// Next candidate at one depth of the walk
#[derive(Debug, Clone, Copy)]
struct Frame {
    category: usize,
    member: usize,
    /// Smallest set size among the factors already on the path
    floor: usize,
}

pub struct Combinations<'g, 'a> {
    generator: &'g CombinationGenerator<'a>,
    shard: usize,
    shards: usize,
    next_pair: usize,
    pair: Option<(FactorId, FactorId)>,
    stack: Vec<Frame>,
    path: Vec<FactorId>,
    stats: GeneratorStats,
}

impl Combinations<'_, '_> {
    pub fn stats(&self) -> GeneratorStats {
        self.stats
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    fn start_next_pair(&mut self) -> Option<Combination> {
        let generator = self.generator;
        let library = generator.library;
        let sizes = library.size_factors();
        if self.next_pair >= generator.pair_count() {
            return None;
        }
        let p = self.next_pair;
        self.next_pair += self.shards;

        let side = library.side_factors()[p / sizes.len()];
        let size = sizes[p % sizes.len()];
        self.pair = Some((side, size));
        self.path.clear();
        self.stack.clear();
        if generator.max_optional > 0 {
            self.stack.push(Frame {
                category: 0,
                member: 0,
                floor: generator.size_of(side).min(generator.size_of(size)),
            });
        }
        self.stats.enumerated += 1;
        Some(Combination {
            side,
            size,
            optional: Vec::new(),
        })
    }
}

impl Iterator for Combinations<'_, '_> {
    type Item = Combination;

    fn next(&mut self) -> Option<Combination> {
        let generator = self.generator;
        let categories = generator.library.categories();

        loop {
            let Some((side, size)) = self.pair else {
                return self.start_next_pair();
            };
            let Some(frame) = self.stack.last_mut() else {
                self.pair = None;
                continue;
            };

            if frame.category >= categories.len() {
                self.stack.pop();
                self.path.pop();
                continue;
            }
            let members = &categories[frame.category].members;
            if frame.member >= members.len() {
                frame.category += 1;
                frame.member = 0;
                continue;
            }

            let candidate = members[frame.member];
            let category = frame.category;
            frame.member += 1;

            let floor = frame.floor.min(generator.size_of(candidate));
            if !generator.prune.keeps(floor) {
                let remaining = generator.max_optional - self.path.len() - 1;
                self.stats.pruned += 1;
                self.stats.pruned_space = self
                    .stats
                    .pruned_space
                    .saturating_add(generator.extensions[category + 1][remaining]);
                continue;
            }

            self.path.push(candidate);
            let combination = Combination {
                side,
                size,
                optional: self.path.clone(),
            };
            if self.path.len() < generator.max_optional {
                self.stack.push(Frame {
                    category: category + 1,
                    member: 0,
                    floor,
                });
            } else {
                self.path.pop();
            }
            self.stats.enumerated += 1;
            return Some(combination);
        }
    }
}
