//! Sorted set: member -> score map plus a (score, member) ordered index.

use ahash::AHashMap;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SortedSet {
    scores: AHashMap<Bytes, f64>,
    ordered: BTreeSet<(Score, Bytes)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert_eq!(
            self.scores.len(),
            self.ordered.len(),
            "Invariant violated: score map and ordered index differ in size"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Insert or update. Returns true when the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        let added = match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member));
        self.verify_invariants();
        added
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove_entry(member) {
            Some((key, score)) => {
                self.ordered.remove(&(Score(score), key));
                self.verify_invariants();
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Members in ascending (score, member) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.ordered.iter().map(|(s, m)| (m, s.0))
    }

    /// Inclusive rank range with negative indices counted from the end.
    pub fn range(&self, start: i64, stop: i64) -> Vec<(&Bytes, f64)> {
        let len = self.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Vec::new();
        }
        self.iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_insert_update_remove() {
        let mut z = SortedSet::new();
        assert!(z.insert(b("a"), 2.0));
        assert!(z.insert(b("b"), 1.0));
        assert!(!z.insert(b("a"), 0.5));
        let order: Vec<&[u8]> = z.iter().map(|(m, _)| m.as_ref()).collect();
        assert_eq!(order, vec![b"a".as_ref(), b"b".as_ref()]);
        assert!(z.remove(b"a"));
        assert!(!z.remove(b"a"));
        assert_eq!(z.len(), 1);
    }

    #[test]
    fn test_ties_order_by_member() {
        let mut z = SortedSet::new();
        z.insert(b("c"), 1.0);
        z.insert(b("a"), 1.0);
        z.insert(b("b"), 1.0);
        let order: Vec<&[u8]> = z.iter().map(|(m, _)| m.as_ref()).collect();
        assert_eq!(order, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }

    #[test]
    fn test_range_negative_indices() {
        let mut z = SortedSet::new();
        for (i, m) in ["a", "b", "c", "d"].iter().enumerate() {
            z.insert(b(m), i as f64);
        }
        assert_eq!(z.range(0, -1).len(), 4);
        assert_eq!(z.range(-2, -1)[0].0.as_ref(), b"c");
        assert!(z.range(3, 1).is_empty());
        assert_eq!(z.range(1, 100).len(), 3);
        assert!(z.range(10, 20).is_empty());
    }
}
