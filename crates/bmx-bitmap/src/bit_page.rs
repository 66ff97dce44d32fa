#![forbid(unsafe_code)]
//! Uncompressed bitmap page.

use crate::{BitmapPage, Mutation, PageKind, PageLinks, Spillover};
use bmx_error::{BmxError, Result};
use bmx_types::{BIT_PAGE_CAPACITY, BIT_PAGE_HEADER_SIZE, PAGE_SIZE, PageId};

// ── MSB-first bit helpers ───────────────────────────────────────────────────

/// Get bit `idx` of a byte slice. Bit 0 is the most significant bit of
/// byte 0.
#[must_use]
pub fn bit_get(bits: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    if byte_idx >= bits.len() {
        return false;
    }
    bits[byte_idx] & (0x80 >> (idx % 8)) != 0
}

/// Set bit `idx`. Returns `false` if the bit was already set or lies
/// outside the slice.
pub fn bit_set(bits: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let mask = 0x80 >> (idx % 8);
    match bits.get_mut(byte_idx) {
        Some(byte) if *byte & mask == 0 => {
            *byte |= mask;
            true
        }
        _ => false,
    }
}

/// Clear bit `idx`. Returns `false` if the bit was already clear or lies
/// outside the slice.
pub fn bit_clear(bits: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let mask = 0x80 >> (idx % 8);
    match bits.get_mut(byte_idx) {
        Some(byte) if *byte & mask != 0 => {
            *byte &= !mask;
            true
        }
        _ => false,
    }
}

// ── BitPage ─────────────────────────────────────────────────────────────────

/// One literal bit per chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitPage {
    links: PageLinks,
    bits: Vec<u8>,
}

impl BitPage {
    #[must_use]
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }
}

impl BitmapPage for BitPage {
    const KIND: PageKind = PageKind::Uncompressed;

    fn init(self_id: PageId) -> Self {
        Self {
            links: PageLinks::detached(self_id),
            bits: vec![0; PAGE_SIZE - BIT_PAGE_HEADER_SIZE],
        }
    }

    fn decode(page: PageId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(BmxError::corruption(
                page.0,
                format!("page buffer is {} bytes", bytes.len()),
            ));
        }
        Ok(Self {
            links: PageLinks::decode(page, bytes)?,
            bits: bytes[BIT_PAGE_HEADER_SIZE..].to_vec(),
        })
    }

    fn encode(&self, bytes: &mut [u8]) -> Result<()> {
        let page = self.links.self_id;
        let Some(payload) = bytes.get_mut(BIT_PAGE_HEADER_SIZE..PAGE_SIZE) else {
            return Err(BmxError::corruption(page.0, "page buffer too small"));
        };
        payload.copy_from_slice(&self.bits);
        self.links.encode(bytes)
    }

    fn links(&self) -> &PageLinks {
        &self.links
    }

    fn links_mut(&mut self) -> &mut PageLinks {
        &mut self.links
    }

    fn span(&self) -> u32 {
        BIT_PAGE_CAPACITY
    }

    fn set_bit(&mut self, pos: u32) -> Mutation {
        if pos >= BIT_PAGE_CAPACITY {
            return Mutation::rejected();
        }
        if bit_set(&mut self.bits, pos) {
            Mutation::changed(Spillover::new())
        } else {
            Mutation::unchanged()
        }
    }

    fn clear_bit(&mut self, pos: u32) -> Mutation {
        if pos >= BIT_PAGE_CAPACITY {
            return Mutation::rejected();
        }
        if bit_clear(&mut self.bits, pos) {
            Mutation::changed(Spillover::new())
        } else {
            Mutation::unchanged()
        }
    }

    fn check_bit(&self, pos: u32) -> bool {
        bit_get(&self.bits, pos)
    }

    fn next_set_bit(&self, from: u32) -> Option<u32> {
        if from >= BIT_PAGE_CAPACITY {
            return None;
        }
        let first = (from / 8) as usize;
        // Mask off bits before `from` in its own byte.
        let head = self.bits[first] & (0xFF >> (from % 8));
        if head != 0 {
            return Some(from - from % 8 + head.leading_zeros());
        }
        self.bits[first + 1..]
            .iter()
            .position(|&byte| byte != 0)
            .map(|offset| {
                let byte_idx = first + 1 + offset;
                #[expect(clippy::cast_possible_truncation)]
                let base = (byte_idx * 8) as u32;
                base + self.bits[byte_idx].leading_zeros()
            })
    }

    fn count_ones(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    fn validate(&self) -> Result<()> {
        if self.bits.len() == PAGE_SIZE - BIT_PAGE_HEADER_SIZE {
            Ok(())
        } else {
            Err(BmxError::corruption(
                self.links.self_id.0,
                "payload length does not match page size",
            ))
        }
    }
}
