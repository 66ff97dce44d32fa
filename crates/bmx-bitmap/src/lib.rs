#![forbid(unsafe_code)]
//! Bitmap page formats.
//!
//! Two page flavours implement [`BitmapPage`]:
//!
//! 1. [`BitPage`]: one literal bit per position, MSB-first per byte. Every
//!    page spans exactly [`BIT_PAGE_CAPACITY`] positions.
//! 2. [`CompressedBitPage`]: one run descriptor per byte (bit 7 = value,
//!    bits 6..0 = length). A page spans `bit_count` positions, which varies
//!    with how well its runs compress.
//!
//! Pages are decoded from and encoded into the raw bytes of a pinned page;
//! they never touch the page cache themselves. Every mutating call returns a
//! [`Mutation`] carrying the outcome and any [`Spillover`] bytes that did not
//! fit, so the chain manager can move them to the successor page.

mod bit_page;
mod compressed;

pub use bit_page::{BitPage, bit_clear, bit_get, bit_set};
pub use compressed::{CompressedBitPage, Run};

use bmx_error::{BmxError, Result};
use bmx_types::{
    BIT_PAGE_CAPACITY, OFF_NEXT_PAGE, OFF_PREV_PAGE, OFF_SELF_PAGE, PageId, ParseError,
    read_le_i32, write_le_i32,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Most descriptor bytes a single mutation can push off the end of a page.
pub const MAX_SPILL: usize = 2;

/// Which page format a chain is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageKind {
    Uncompressed,
    Compressed,
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncompressed => f.write_str("uncompressed"),
            Self::Compressed => f.write_str("compressed"),
        }
    }
}

pub(crate) fn corrupt(page: PageId) -> impl Fn(ParseError) -> BmxError {
    move |err| BmxError::corruption(page.0, err.to_string())
}

// ── Chain links ─────────────────────────────────────────────────────────────

/// The `prev`/`next`/`self` header shared by both page formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLinks {
    pub prev: Option<PageId>,
    pub next: Option<PageId>,
    pub self_id: PageId,
}

impl PageLinks {
    #[must_use]
    pub fn detached(self_id: PageId) -> Self {
        Self {
            prev: None,
            next: None,
            self_id,
        }
    }

    /// Decode the link header of the page read from `page`.
    ///
    /// A `self_page` field naming a different page is corruption: the page
    /// was written somewhere it does not belong.
    pub fn decode(page: PageId, bytes: &[u8]) -> Result<Self> {
        let link = |offset: usize, field: &'static str| -> Result<Option<PageId>> {
            let raw = read_le_i32(bytes, offset).map_err(corrupt(page))?;
            PageId::decode_link(raw, field).map_err(corrupt(page))
        };
        let prev = link(OFF_PREV_PAGE, "prev_page")?;
        let next = link(OFF_NEXT_PAGE, "next_page")?;
        let self_id = link(OFF_SELF_PAGE, "self_page")?
            .ok_or_else(|| BmxError::corruption(page.0, "self_page is unset"))?;
        if self_id != page {
            return Err(BmxError::corruption(
                page.0,
                format!("self_page field names page {self_id}"),
            ));
        }
        Ok(Self {
            prev,
            next,
            self_id,
        })
    }

    pub fn encode(&self, bytes: &mut [u8]) -> Result<()> {
        let page = self.self_id;
        let fields = [
            (OFF_PREV_PAGE, PageId::encode_link(self.prev)),
            (OFF_NEXT_PAGE, PageId::encode_link(self.next)),
            (OFF_SELF_PAGE, PageId::encode_link(Some(self.self_id))),
        ];
        for (offset, raw) in fields {
            let raw = raw.map_err(corrupt(page))?;
            write_le_i32(bytes, offset, raw).map_err(corrupt(page))?;
        }
        Ok(())
    }
}

// ── Mutation outcome ────────────────────────────────────────────────────────

/// Descriptor bytes displaced off the end of a page, in page order.
///
/// Lives only for the duration of one chain mutation; the chain manager must
/// hand every byte to a successor page before the mutation returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Spillover {
    bytes: [u8; MAX_SPILL],
    len: u8,
}

impl Spillover {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    pub(crate) fn push(&mut self, byte: u8) {
        debug_assert!(self.len() < MAX_SPILL, "spillover register overflow");
        self.bytes[self.len()] = byte;
        self.len += 1;
    }

    /// Take the earliest displaced byte.
    pub fn pop_front(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let first = self.bytes[0];
        self.bytes.copy_within(1.., 0);
        self.len -= 1;
        self.bytes[self.len()] = 0;
        Some(first)
    }
}

/// Result of a page-level mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mutation {
    /// The page now holds the requested value (or accepted the bytes).
    /// `false` means the position lies beyond what this page can address.
    pub applied: bool,
    /// The page bytes changed and must be released dirty.
    pub dirty: bool,
    /// Bytes displaced off the end of the page.
    pub spill: Spillover,
}

impl Mutation {
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            applied: true,
            dirty: false,
            spill: Spillover::new(),
        }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn changed(spill: Spillover) -> Self {
        Self {
            applied: true,
            dirty: true,
            spill,
        }
    }
}

// ── Page trait ──────────────────────────────────────────────────────────────

/// A page in a per-value bitmap chain.
///
/// Positions passed to a page are local: `0` is the first position the page
/// spans. The rebalancing primitives (`dequeue_byte`, `postfix_byte`,
/// `prefix_bytes`) only have meaning for variable-span pages; the defaults
/// describe a fixed-span page that never has room and never spills.
pub trait BitmapPage: Sized + fmt::Debug {
    const KIND: PageKind;

    /// A fresh, empty, unlinked page.
    fn init(self_id: PageId) -> Self;

    fn decode(page: PageId, bytes: &[u8]) -> Result<Self>;

    fn encode(&self, bytes: &mut [u8]) -> Result<()>;

    fn links(&self) -> &PageLinks;

    fn links_mut(&mut self) -> &mut PageLinks;

    /// Number of chain positions this page covers.
    fn span(&self) -> u32;

    /// Positions beyond `span()` may be appended to this page.
    fn has_room(&self) -> bool {
        false
    }

    fn set_bit(&mut self, pos: u32) -> Mutation;

    fn clear_bit(&mut self, pos: u32) -> Mutation;

    /// `false` for positions the page does not hold.
    fn check_bit(&self, pos: u32) -> bool;

    /// First set position at or after `from`.
    fn next_set_bit(&self, from: u32) -> Option<u32>;

    fn count_ones(&self) -> u32;

    /// Remove and return the first descriptor byte.
    fn dequeue_byte(&mut self) -> Option<u8> {
        None
    }

    /// Append one descriptor byte at the tail.
    fn postfix_byte(&mut self, _byte: u8) -> Mutation {
        Mutation::rejected()
    }

    /// Insert descriptor bytes at the front, in order.
    fn prefix_bytes(&mut self, _bytes: &[u8]) -> Mutation {
        Mutation::rejected()
    }

    /// Check the page's structural invariants.
    fn validate(&self) -> Result<()>;
}

/// Positions a page of `kind` can address when every slot holds a full run.
#[must_use]
pub fn nominal_capacity(kind: PageKind) -> u64 {
    match kind {
        PageKind::Uncompressed => u64::from(BIT_PAGE_CAPACITY),
        PageKind::Compressed => {
            bmx_types::RUN_CAPACITY as u64 * u64::from(bmx_types::MAX_RUN_LEN)
        }
    }
}
