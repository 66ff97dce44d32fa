//! Combining scans at the query layer.
//!
//! Two strategies, both working on positions rather than row ids:
//!
//! | Strategy | Inputs | Cost |
//! |----------|--------|------|
//! | [`probe_and`] | a driver scan and a probe scan | one `get_position` per driver match |
//! | [`merge_and`] / [`merge_or`] | two ascending position streams | one pass over both |
//!
//! [`sorted_positions`] turns a scan over several values into an ascending,
//! de-duplicated stream suitable for the merge joins.

use crate::{IndexScan, ScanEntry, ValueIndex};
use bmx_bitmap::BitmapPage;
use bmx_error::Result;
use bmx_types::RowPosition;
use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;

/// Driver matches whose position is also in the probe scan's result.
///
/// The probe scan's position cursor is reset first, so it may be reused
/// across calls.
pub fn probe_and<K1, P1, V1, K2, P2, V2>(
    driver: &mut IndexScan<'_, K1, P1, V1>,
    probe: &mut IndexScan<'_, K2, P2, V2>,
) -> Result<Vec<ScanEntry<K1>>>
where
    K1: Ord + Clone + fmt::Debug,
    P1: BitmapPage,
    V1: ValueIndex<K1>,
    K2: Ord + Clone + fmt::Debug,
    P2: BitmapPage,
    V2: ValueIndex<K2>,
{
    probe.reset_position_scan()?;
    let mut out = Vec::new();
    while let Some(entry) = driver.get_next()? {
        if probe.get_position(entry.position)? {
            out.push(entry);
        }
    }
    Ok(out)
}

/// Every position the scan yields, ascending and without duplicates.
pub fn sorted_positions<K, P, V>(scan: &mut IndexScan<'_, K, P, V>) -> Result<Vec<RowPosition>>
where
    K: Ord + Clone + fmt::Debug,
    P: BitmapPage,
    V: ValueIndex<K>,
{
    let mut positions = Vec::new();
    while let Some(entry) = scan.get_next()? {
        positions.push(entry.position);
    }
    positions.sort_unstable();
    positions.dedup();
    Ok(positions)
}

/// Intersection of two ascending position streams.
pub fn merge_and<L, R>(left: L, right: R) -> MergeAnd<L::IntoIter, R::IntoIter>
where
    L: IntoIterator<Item = RowPosition>,
    R: IntoIterator<Item = RowPosition>,
{
    MergeAnd {
        left: left.into_iter().peekable(),
        right: right.into_iter().peekable(),
    }
}

/// Union of two ascending position streams, without duplicates.
pub fn merge_or<L, R>(left: L, right: R) -> MergeOr<L::IntoIter, R::IntoIter>
where
    L: IntoIterator<Item = RowPosition>,
    R: IntoIterator<Item = RowPosition>,
{
    MergeOr {
        left: left.into_iter().peekable(),
        right: right.into_iter().peekable(),
    }
}

/// Iterator returned by [`merge_and`].
pub struct MergeAnd<L: Iterator, R: Iterator> {
    left: Peekable<L>,
    right: Peekable<R>,
}

impl<L, R> Iterator for MergeAnd<L, R>
where
    L: Iterator<Item = RowPosition>,
    R: Iterator<Item = RowPosition>,
{
    type Item = RowPosition;

    fn next(&mut self) -> Option<RowPosition> {
        loop {
            let (l, r) = (*self.left.peek()?, *self.right.peek()?);
            match l.cmp(&r) {
                Ordering::Less => {
                    self.left.next();
                }
                Ordering::Greater => {
                    self.right.next();
                }
                Ordering::Equal => {
                    self.left.next();
                    self.right.next();
                    return Some(l);
                }
            }
        }
    }
}

/// Iterator returned by [`merge_or`].
pub struct MergeOr<L: Iterator, R: Iterator> {
    left: Peekable<L>,
    right: Peekable<R>,
}

impl<L, R> Iterator for MergeOr<L, R>
where
    L: Iterator<Item = RowPosition>,
    R: Iterator<Item = RowPosition>,
{
    type Item = RowPosition;

    fn next(&mut self) -> Option<RowPosition> {
        match (self.left.peek().copied(), self.right.peek().copied()) {
            (None, None) => None,
            (Some(_), None) => self.left.next(),
            (None, Some(_)) => self.right.next(),
            (Some(l), Some(r)) => match l.cmp(&r) {
                Ordering::Less => self.left.next(),
                Ordering::Greater => self.right.next(),
                Ordering::Equal => {
                    self.right.next();
                    self.left.next()
                }
            },
        }
    }
}
