#![forbid(unsafe_code)]
//! bmx public API facade.
//!
//! Re-exports the index layer together with the page, chain, and error types
//! callers need to drive it. This is the crate the CLI depends on.

pub use bmx_bitmap::{BitPage, BitmapPage, CompressedBitPage, Mutation, PageKind, Spillover};
pub use bmx_chain::{ChainCursor, ChainManager, ChainProbe, ChainStats};
pub use bmx_error::{BmxError, ErrorKind, Result};
pub use bmx_index::*;
pub use bmx_page::{
    BufferPool, BytePageDevice, CacheConfig, CacheStats, DeviceConfig, FileByteDevice,
    MemByteDevice, PageCache,
};
pub use bmx_types::{ColumnId, PAGE_SIZE, PageId, RowId, RowPointer, RowPosition};
