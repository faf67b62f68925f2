//! Dense bitset over dataset match indices

use crate::types::MatchIdx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSet {
    words: Vec<u64>,
    universe: usize,
}

impl MatchSet {
    /// Empty set over `universe` matches
    pub fn empty(universe: usize) -> Self {
        Self {
            words: vec![0; universe.div_ceil(64)],
            universe,
        }
    }

    /// Set containing every match
    pub fn full(universe: usize) -> Self {
        let mut set = Self::empty(universe);
        for idx in 0..universe {
            set.insert(MatchIdx(idx as u32));
        }
        set
    }

    pub fn universe(&self) -> usize {
        self.universe
    }

    pub fn insert(&mut self, idx: MatchIdx) {
        let i = idx.index();
        debug_assert!(i < self.universe);
        self.words[i / 64] |= 1 << (i % 64);
    }

    pub fn contains(&self, idx: MatchIdx) -> bool {
        let i = idx.index();
        i < self.universe && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// In-place intersection
    pub fn intersect_with(&mut self, other: &MatchSet) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }

    /// Ascending match indices
    pub fn iter(&self) -> impl Iterator<Item = MatchIdx> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(MatchIdx((w * 64 + tz) as u32))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_iterate_across_words() {
        let mut set = MatchSet::empty(130);
        for i in [0u32, 63, 64, 129] {
            set.insert(MatchIdx(i));
        }
        assert_eq!(set.len(), 4);
        let got: Vec<u32> = set.iter().map(|m| m.0).collect();
        assert_eq!(got, vec![0, 63, 64, 129]);
        assert!(set.contains(MatchIdx(64)));
        assert!(!set.contains(MatchIdx(65)));
        assert!(!set.contains(MatchIdx(500)));
    }

    #[test]
    fn test_intersection_only_shrinks() {
        let full = MatchSet::full(70);
        let mut evens = MatchSet::empty(70);
        for i in (0..70).step_by(2) {
            evens.insert(MatchIdx(i));
        }
        let mut both = full.clone();
        both.intersect_with(&evens);
        assert_eq!(both, evens);
        assert_eq!(full.len(), 70);
        assert!(both.len() <= full.len());
        assert!(MatchSet::empty(3).is_empty());
    }
}
