//! Row source: position <-> row id translation.

use bmx_error::{BmxError, Result};
use bmx_types::{ColumnId, RowId, RowPosition};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

/// Maps the positions a bitmap indexes over to opaque row identifiers.
///
/// The bitmap engine never interprets a [`RowId`]; it only asks for the
/// translation when a scan hands a match to its caller.
pub trait RowSource {
    fn position_to_row_id(&self, pos: RowPosition, column: ColumnId) -> Result<RowId>;

    fn row_id_to_position(&self, row: RowId) -> Result<RowPosition>;

    /// Positions assigned so far.
    fn row_count(&self) -> u64;
}

#[derive(Debug, Default)]
struct StoreInner {
    rows: Vec<RowId>,
    positions: HashMap<RowId, RowPosition>,
}

/// Append-only in-memory column store.
///
/// Positions are handed out in append order starting at zero. Readers and the
/// single appender may share the store across threads.
#[derive(Debug)]
pub struct ColumnStore {
    column: ColumnId,
    inner: RwLock<StoreInner>,
}

impl ColumnStore {
    #[must_use]
    pub fn new(column: ColumnId) -> Self {
        Self {
            column,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    #[must_use]
    pub fn column(&self) -> ColumnId {
        self.column
    }

    /// Assign the next position to `row`.
    pub fn append(&self, row: RowId) -> Result<RowPosition> {
        let mut inner = self.inner.write();
        if inner.positions.contains_key(&row) {
            return Err(BmxError::Format(format!("row {row} already has a position")));
        }
        let pos = RowPosition(inner.rows.len() as u64);
        inner.rows.push(row);
        inner.positions.insert(row, pos);
        trace!(target: "bmx::index", row = row.0, pos = pos.0, "row appended");
        Ok(pos)
    }
}

impl RowSource for ColumnStore {
    fn position_to_row_id(&self, pos: RowPosition, column: ColumnId) -> Result<RowId> {
        if column != self.column {
            return Err(BmxError::NotFound(format!(
                "column {column} (store holds column {})",
                self.column
            )));
        }
        let inner = self.inner.read();
        usize::try_from(pos.0)
            .ok()
            .and_then(|idx| inner.rows.get(idx).copied())
            .ok_or_else(|| BmxError::NotFound(format!("row at position {pos}")))
    }

    fn row_id_to_position(&self, row: RowId) -> Result<RowPosition> {
        self.inner
            .read()
            .positions
            .get(&row)
            .copied()
            .ok_or_else(|| BmxError::NotFound(format!("row {row}")))
    }

    fn row_count(&self) -> u64 {
        self.inner.read().rows.len() as u64
    }
}
