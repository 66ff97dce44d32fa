//! Distinct-value index: column value to chain head.

use bmx_types::RowPointer;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordered map from a column value to the pointer of its bitmap chain head.
///
/// Range bounds are inclusive; `None` leaves that side open.
pub trait ValueIndex<K> {
    fn point_lookup(&self, value: &K) -> Option<RowPointer>;

    /// Insert or replace the pointer stored for `value`.
    fn insert(&mut self, value: K, pointer: RowPointer);

    /// Entries with `low <= value <= high`, in value order.
    fn range_scan<'a>(
        &'a self,
        low: Option<&K>,
        high: Option<&K>,
    ) -> Box<dyn Iterator<Item = (K, RowPointer)> + 'a>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory ordered value index.
#[derive(Debug, Clone)]
pub struct BTreeValueIndex<K> {
    entries: BTreeMap<K, RowPointer>,
}

impl<K> Default for BTreeValueIndex<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord> BTreeValueIndex<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Ord + Clone> ValueIndex<K> for BTreeValueIndex<K> {
    fn point_lookup(&self, value: &K) -> Option<RowPointer> {
        self.entries.get(value).copied()
    }

    fn insert(&mut self, value: K, pointer: RowPointer) {
        self.entries.insert(value, pointer);
    }

    fn range_scan<'a>(
        &'a self,
        low: Option<&K>,
        high: Option<&K>,
    ) -> Box<dyn Iterator<Item = (K, RowPointer)> + 'a> {
        // BTreeMap::range panics on an inverted range.
        if matches!((low, high), (Some(low), Some(high)) if low > high) {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.entries
                .range((included(low), included(high)))
                .map(|(value, pointer)| (value.clone(), *pointer)),
        )
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn included<T>(key: Option<&T>) -> Bound<&T> {
    key.map_or(Bound::Unbounded, Bound::Included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmx_types::PageId;

    fn index() -> BTreeValueIndex<i64> {
        let mut idx = BTreeValueIndex::new();
        for (value, page) in [(10, 1), (20, 2), (30, 3), (40, 4)] {
            idx.insert(value, RowPointer::chain_head(PageId(page)));
        }
        idx
    }

    fn keys(iter: impl Iterator<Item = (i64, RowPointer)>) -> Vec<i64> {
        iter.map(|(k, _)| k).collect()
    }

    #[test]
    fn point_lookup_and_replace() {
        let mut idx = index();
        assert_eq!(idx.point_lookup(&20).map(|p| p.page), Some(PageId(2)));
        assert_eq!(idx.point_lookup(&25), None);
        idx.insert(20, RowPointer::chain_head(PageId(9)));
        assert_eq!(idx.point_lookup(&20).map(|p| p.page), Some(PageId(9)));
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn ranges_are_inclusive_and_optional() {
        let idx = index();
        assert_eq!(keys(idx.range_scan(Some(&20), Some(&30))), vec![20, 30]);
        assert_eq!(keys(idx.range_scan(None, Some(&15))), vec![10]);
        assert_eq!(keys(idx.range_scan(Some(&35), None)), vec![40]);
        assert_eq!(keys(idx.range_scan(None, None)), vec![10, 20, 30, 40]);
        assert_eq!(keys(idx.range_scan(Some(&30), Some(&30))), vec![30]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let idx = index();
        assert!(keys(idx.range_scan(Some(&30), Some(&20))).is_empty());
        assert!(BTreeValueIndex::<i64>::new().is_empty());
    }
}
