//! Dual-cursor index scan.
//!
//! An [`IndexScan`] holds two independent cursors over the same value range:
//!
//! - the *value cursor* behind [`IndexScan::get_next`], which walks the
//!   distinct values in order and each value's chain forward, and
//! - the *position cursor* behind [`IndexScan::get_position`], a set of chain
//!   probes (one per value in range) for answering "is position `p` in this
//!   scan's result?" without materializing it.
//!
//! The position cursor is opened by [`IndexScan::reset_position_scan`] or,
//! implicitly, when `get_next` opens its first value. Probing before either,
//! or touching a scan after [`IndexScan::close`], is a [`BmxError::ScanMisuse`].

use crate::{BitmapIndex, ValueIndex};
use bmx_bitmap::BitmapPage;
use bmx_chain::{ChainCursor, ChainManager, ChainProbe};
use bmx_error::{BmxError, Result};
use bmx_types::{RowId, RowPointer, RowPosition};
use serde::Serialize;
use std::fmt;
use std::iter::Fuse;
use tracing::{debug, trace};

/// One match produced by [`IndexScan::get_next`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry<K> {
    pub value: K,
    pub position: RowPosition,
    pub row_id: RowId,
}

type ValueCursor<'a, K> = Fuse<Box<dyn Iterator<Item = (K, RowPointer)> + 'a>>;

pub struct IndexScan<'a, K, P, V> {
    index: &'a BitmapIndex<K, P, V>,
    low: Option<K>,
    high: Option<K>,
    values: Option<ValueCursor<'a, K>>,
    current: Option<(K, ChainCursor<P>)>,
    probes: Option<Vec<ChainProbe<P>>>,
    closed: bool,
    matches: u64,
}

impl<K: fmt::Debug, P, V> fmt::Debug for IndexScan<'_, K, P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexScan")
            .field("low", &self.low)
            .field("high", &self.high)
            .field("current", &self.current.as_ref().map(|(value, _)| value))
            .field("position_cursor_open", &self.probes.is_some())
            .field("closed", &self.closed)
            .field("matches", &self.matches)
            .finish_non_exhaustive()
    }
}

impl<'a, K, P, V> IndexScan<'a, K, P, V>
where
    K: Ord + Clone + fmt::Debug,
    P: BitmapPage,
    V: ValueIndex<K>,
{
    pub(crate) fn new(index: &'a BitmapIndex<K, P, V>, low: Option<K>, high: Option<K>) -> Self {
        let values = index
            .value_index()
            .range_scan(low.as_ref(), high.as_ref())
            .fuse();
        Self {
            index,
            low,
            high,
            values: Some(values),
            current: None,
            probes: None,
            closed: false,
            matches: 0,
        }
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed {
            return Err(BmxError::misuse(format!("{op} on a closed scan")));
        }
        Ok(())
    }

    /// Next `(value, position)` match in value order, then position order
    /// within a value. `None` once every value in range is exhausted.
    pub fn get_next(&mut self) -> Result<Option<ScanEntry<K>>> {
        self.ensure_open("get_next")?;
        let index = self.index;
        let cache = index.cache();
        loop {
            if self.current.is_none() {
                let Some(values) = self.values.as_mut() else {
                    return Ok(None);
                };
                let Some((value, pointer)) = values.next() else {
                    return Ok(None);
                };
                if self.probes.is_none() {
                    self.reset_position_scan()?;
                }
                trace!(
                    target: "bmx::scan",
                    value = ?value,
                    head = pointer.page.0,
                    "value opened"
                );
                let cursor = ChainManager::<P>::open(pointer.page).cursor();
                self.current = Some((value, cursor));
            }

            let Some((value, cursor)) = self.current.as_mut() else {
                continue;
            };
            if let Some(position) = cursor.next_set(cache)? {
                let row_id = index
                    .rows()
                    .position_to_row_id(position, index.options().column)?;
                self.matches += 1;
                return Ok(Some(ScanEntry {
                    value: value.clone(),
                    position,
                    row_id,
                }));
            }
            self.current = None;
        }
    }

    /// Whether `position` is set in the bitmap of any value in the scan's
    /// range.
    pub fn get_position(&mut self, position: RowPosition) -> Result<bool> {
        self.ensure_open("get_position")?;
        let index = self.index;
        let cache = index.cache();
        let Some(probes) = self.probes.as_mut() else {
            return Err(BmxError::misuse(
                "get_position before get_next or reset_position_scan",
            ));
        };
        for probe in probes {
            if probe.check(cache, position)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reopen the position cursor from the start of the value range.
    pub fn reset_position_scan(&mut self) -> Result<()> {
        self.ensure_open("reset_position_scan")?;
        let probes: Vec<ChainProbe<P>> = self
            .index
            .value_index()
            .range_scan(self.low.as_ref(), self.high.as_ref())
            .map(|(_, pointer)| ChainManager::<P>::open(pointer.page).probe())
            .collect();
        trace!(target: "bmx::scan", values = probes.len(), "position cursor opened");
        self.probes = Some(probes);
        Ok(())
    }

    /// Release both cursors. Further use of the scan is an error.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.values = None;
        self.current = None;
        self.probes = None;
        self.closed = true;
        debug!(target: "bmx::scan", matches = self.matches, "scan closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Value whose chain `get_next` is currently walking.
    #[must_use]
    pub fn current_value(&self) -> Option<&K> {
        self.current.as_ref().map(|(value, _)| value)
    }
}
