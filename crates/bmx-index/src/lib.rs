#![forbid(unsafe_code)]
//! Bitmap indexes over a column.
//!
//! A [`BitmapIndex`] ties three collaborators together:
//!
//! - a [`ValueIndex`] mapping each distinct column value to the head page of
//!   its bitmap chain,
//! - a [`PageCache`] holding the chain pages, and
//! - a [`RowSource`] translating row positions to row ids for scan results.
//!
//! Mutations take `&mut self` and scans borrow the index shared, so a chain
//! cannot change underneath an open [`IndexScan`].
//!
//! `update` is a delete followed by an insert. It is not atomic: a failure
//! between the two steps leaves the position in neither bitmap.

pub mod compose;
mod row_source;
mod scan;
mod value_index;

pub use row_source::{ColumnStore, RowSource};
pub use scan::{IndexScan, ScanEntry};
pub use value_index::{BTreeValueIndex, ValueIndex};

use bmx_bitmap::{BitPage, BitmapPage, CompressedBitPage, PageKind};
use bmx_chain::ChainManager;
use bmx_error::Result;
use bmx_page::{BufferPool, CacheConfig, CacheStats, DeviceConfig, PageCache};
use bmx_types::{ColumnId, RowId, RowPointer, RowPosition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Index construction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Column whose row ids scans report.
    pub column: ColumnId,
    pub cache: CacheConfig,
    /// Geometry of the page device used by [`BitmapIndex::in_memory`].
    pub device: DeviceConfig,
}

/// Aggregate counters over every chain in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub kind: PageKind,
    pub column: ColumnId,
    pub distinct_values: usize,
    pub pages: u64,
    pub empty_pages: u64,
    /// Set positions summed over all values.
    pub ones: u64,
    /// Longest chain span.
    pub max_span: u64,
    pub cache: CacheStats,
}

/// Bitmap index keyed by column value.
pub struct BitmapIndex<K, P, V = BTreeValueIndex<K>> {
    options: IndexOptions,
    cache: Box<dyn PageCache>,
    values: V,
    rows: Arc<dyn RowSource>,
    _marker: PhantomData<fn() -> (K, P)>,
}

pub type UncompressedIndex<K> = BitmapIndex<K, BitPage>;
pub type CompressedIndex<K> = BitmapIndex<K, CompressedBitPage>;

impl<K, P: BitmapPage, V: ValueIndex<K>> fmt::Debug for BitmapIndex<K, P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapIndex")
            .field("kind", &P::KIND)
            .field("column", &self.options.column)
            .field("distinct_values", &self.values.len())
            .finish_non_exhaustive()
    }
}

impl<K, P> BitmapIndex<K, P>
where
    K: Ord + Clone + fmt::Debug,
    P: BitmapPage,
{
    /// Index over a fresh heap-backed buffer pool.
    pub fn in_memory(rows: Arc<dyn RowSource>, options: IndexOptions) -> Result<Self> {
        let cache = BufferPool::in_memory(options.device, options.cache)?;
        Ok(Self::with_parts(
            Box::new(cache),
            BTreeValueIndex::new(),
            rows,
            options,
        ))
    }
}

impl<K, P, V> BitmapIndex<K, P, V>
where
    K: Ord + Clone + fmt::Debug,
    P: BitmapPage,
    V: ValueIndex<K>,
{
    pub fn with_parts(
        cache: Box<dyn PageCache>,
        values: V,
        rows: Arc<dyn RowSource>,
        options: IndexOptions,
    ) -> Self {
        Self {
            options,
            cache,
            values,
            rows,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    #[must_use]
    pub fn kind(&self) -> PageKind {
        P::KIND
    }

    #[must_use]
    pub fn cache(&self) -> &dyn PageCache {
        &*self.cache
    }

    #[must_use]
    pub fn rows(&self) -> &dyn RowSource {
        &*self.rows
    }

    pub(crate) fn value_index(&self) -> &V {
        &self.values
    }

    /// Chain of `value`, if it has ever been inserted.
    #[must_use]
    pub fn chain(&self, value: &K) -> Option<ChainManager<P>> {
        self.values
            .point_lookup(value)
            .map(|pointer| ChainManager::open(pointer.page))
    }

    /// Set `pos` in the bitmap of `value`, creating the chain on first use.
    /// Returns whether the bit ended up set.
    pub fn insert(&mut self, value: K, pos: RowPosition) -> Result<bool> {
        let chain = self.chain_or_create(value)?;
        chain.insert_bit(&*self.cache, pos)
    }

    /// Like [`insert`](Self::insert), but returns `true` only if the
    /// position was previously clear.
    pub fn insert_changed(&mut self, value: K, pos: RowPosition) -> Result<bool> {
        let chain = self.chain_or_create(value)?;
        chain.write_bit(&*self.cache, pos, true)
    }

    fn chain_or_create(&mut self, value: K) -> Result<ChainManager<P>> {
        if let Some(chain) = self.chain(&value) {
            return Ok(chain);
        }
        let chain = ChainManager::<P>::create(&*self.cache)?;
        debug!(
            target: "bmx::index",
            value = ?value,
            head = chain.head().0,
            "new distinct value"
        );
        self.values
            .insert(value, RowPointer::chain_head(chain.head()));
        Ok(chain)
    }

    /// Clear `pos` in the bitmap of `value`. Unknown values are a no-op.
    /// Returns `true` once the bit reads clear.
    pub fn delete(&mut self, value: &K, pos: RowPosition) -> Result<bool> {
        self.delete_changed(value, pos)?;
        Ok(true)
    }

    /// Like [`delete`](Self::delete), but returns `true` only if the
    /// position was set.
    pub fn delete_changed(&mut self, value: &K, pos: RowPosition) -> Result<bool> {
        let Some(chain) = self.chain(value) else {
            trace!(target: "bmx::index", value = ?value, pos = pos.0, "delete of unknown value");
            return Ok(false);
        };
        chain.write_bit(&*self.cache, pos, false)
    }

    /// Move `pos` from `old` to `new`. Not atomic.
    pub fn update(&mut self, old: &K, new: K, pos: RowPosition) -> Result<()> {
        self.delete(old, pos)?;
        self.insert(new, pos)?;
        Ok(())
    }

    pub fn contains(&self, value: &K, pos: RowPosition) -> Result<bool> {
        match self.chain(value) {
            Some(chain) => chain.check_bit(&*self.cache, pos),
            None => Ok(false),
        }
    }

    pub fn insert_row(&mut self, value: K, row: RowId) -> Result<bool> {
        let pos = self.rows.row_id_to_position(row)?;
        self.insert(value, pos)
    }

    pub fn delete_row(&mut self, value: &K, row: RowId) -> Result<bool> {
        let pos = self.rows.row_id_to_position(row)?;
        self.delete(value, pos)
    }

    /// Scan values in `low..=high`; `None` leaves a side open.
    #[must_use]
    pub fn scan(&self, low: Option<K>, high: Option<K>) -> IndexScan<'_, K, P, V> {
        IndexScan::new(self, low, high)
    }

    #[must_use]
    pub fn point_scan(&self, value: K) -> IndexScan<'_, K, P, V> {
        IndexScan::new(self, Some(value.clone()), Some(value))
    }

    /// Distinct values in order.
    #[must_use]
    pub fn values(&self) -> Vec<K> {
        self.values
            .range_scan(None, None)
            .map(|(value, _)| value)
            .collect()
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let mut stats = IndexStats {
            kind: P::KIND,
            column: self.options.column,
            distinct_values: self.values.len(),
            pages: 0,
            empty_pages: 0,
            ones: 0,
            max_span: 0,
            cache: self.cache.stats(),
        };
        for (_, pointer) in self.values.range_scan(None, None) {
            let chain = ChainManager::<P>::open(pointer.page).stats(&*self.cache)?;
            stats.pages += u64::from(chain.pages);
            stats.empty_pages += u64::from(chain.empty_pages);
            stats.ones += chain.ones;
            stats.max_span = stats.max_span.max(chain.span);
        }
        stats.cache = self.cache.stats();
        Ok(stats)
    }

    /// Validate every chain.
    pub fn validate(&self) -> Result<()> {
        for (_, pointer) in self.values.range_scan(None, None) {
            ChainManager::<P>::open(pointer.page).validate(&*self.cache)?;
        }
        Ok(())
    }

    /// Write every dirty page back to the device.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }
}
