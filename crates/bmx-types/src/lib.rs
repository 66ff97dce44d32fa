#![forbid(unsafe_code)]
//! Shared newtypes and on-page layout constants.
//!
//! Every physical page is [`PAGE_SIZE`] bytes. Both bitmap page flavours start
//! with the same three link fields, stored little-endian:
//!
//! | Offset | Field | Uncompressed | Compressed |
//! |--------|-------|--------------|------------|
//! | 0x00 | `prev_page: i32` | yes | yes |
//! | 0x04 | `next_page: i32` | yes | yes |
//! | 0x08 | `self_page: i32` | yes | yes |
//! | 0x0C | `bit_count: i32` | no | yes |
//!
//! The uncompressed payload starts at [`BIT_PAGE_HEADER_SIZE`], the run
//! descriptor stream at [`COMPRESSED_PAGE_HEADER_SIZE`]. A link of `-1` means
//! "no page".

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical page size in bytes.
pub const PAGE_SIZE: usize = 1024;

/// `prev`, `next`, `self` links.
pub const BIT_PAGE_HEADER_SIZE: usize = 12;

/// Links plus the cached `bit_count`.
pub const COMPRESSED_PAGE_HEADER_SIZE: usize = 16;

/// Bits addressable by one uncompressed page.
#[expect(clippy::cast_possible_truncation)]
pub const BIT_PAGE_CAPACITY: u32 = ((PAGE_SIZE - BIT_PAGE_HEADER_SIZE) * 8) as u32;

/// Run descriptor slots in one compressed page.
pub const RUN_CAPACITY: usize = PAGE_SIZE - COMPRESSED_PAGE_HEADER_SIZE;

/// Longest run a single descriptor byte can express.
pub const MAX_RUN_LEN: u8 = 0x7F;

/// On-page encoding of an absent link.
pub const NO_PAGE: i32 = -1;

pub const OFF_PREV_PAGE: usize = 0x00;
pub const OFF_NEXT_PAGE: usize = 0x04;
pub const OFF_SELF_PAGE: usize = 0x08;
pub const OFF_BIT_COUNT: usize = 0x0C;

/// Page identifier handed out by the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Encode an optional link the way it is stored on a page.
    pub fn encode_link(link: Option<Self>) -> Result<i32, ParseError> {
        match link {
            None => Ok(NO_PAGE),
            Some(id) => i32::try_from(id.0).map_err(|_| ParseError::IntegerConversion {
                field: "page_id",
            }),
        }
    }

    /// Decode an on-page link field. `-1` is "no page"; any other negative
    /// value is rejected.
    pub fn decode_link(raw: i32, field: &'static str) -> Result<Option<Self>, ParseError> {
        if raw == NO_PAGE {
            return Ok(None);
        }
        u32::try_from(raw)
            .map(|id| Some(Self(id)))
            .map_err(|_| ParseError::InvalidField {
                field,
                reason: "negative page link",
            })
    }
}

/// Zero-based row position in column insertion order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowPosition(pub u64);

/// Opaque row identifier owned by the row source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

/// Column of the row source an index is built over.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ColumnId(pub u32);

/// RID-like pointer stored in the distinct-value index.
///
/// Only the page component is meaningful to the bitmap engine: it is the head
/// page of the value's bitmap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowPointer {
    pub page: PageId,
    pub slot: u16,
}

impl RowPointer {
    #[must_use]
    pub fn chain_head(head: PageId) -> Self {
        Self {
            page: head,
            slot: 0,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    let Some(end) = offset.checked_add(4) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
