//! Run-length compressed bitmap page.
//!
//! The payload is a stream of descriptor bytes, one run each:
//!
//! ```text
//!   bit 7     value of every position in the run
//!   bits 6..0 run length, 1..=127
//! ```
//!
//! A zero-length byte is an empty slot. Occupied slots form a prefix of the
//! payload; an occupied slot after an empty one is corruption.
//!
//! After every mutation the page is re-compressed: two adjacent runs of the
//! same value are merged unless the left one is already saturated at 127.
//! Inserting runs into a full page pushes the last descriptors off the end;
//! they are returned as [`Spillover`] and the chain manager prefixes them
//! onto the next page.

use crate::{BitmapPage, MAX_SPILL, Mutation, PageKind, PageLinks, Spillover, corrupt};
use bmx_error::{BmxError, Result};
use bmx_types::{
    COMPRESSED_PAGE_HEADER_SIZE, MAX_RUN_LEN, OFF_BIT_COUNT, PAGE_SIZE, PageId, RUN_CAPACITY,
    read_le_i32, write_le_i32,
};
use std::fmt;

/// One decoded descriptor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub value: bool,
    pub len: u8,
}

impl Run {
    #[must_use]
    pub fn new(value: bool, len: u8) -> Self {
        debug_assert!(len <= MAX_RUN_LEN);
        Self { value, len }
    }

    #[must_use]
    pub fn decode(byte: u8) -> Self {
        Self {
            value: byte & 0x80 != 0,
            len: byte & MAX_RUN_LEN,
        }
    }

    #[must_use]
    pub fn encode(self) -> u8 {
        if self.len == 0 {
            return 0;
        }
        (u8::from(self.value) << 7) | self.len
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", u8::from(self.value), self.len)
    }
}

/// Bitmap page storing runs instead of literal bits.
#[derive(Clone, PartialEq, Eq)]
pub struct CompressedBitPage {
    links: PageLinks,
    /// Total positions covered by the occupied runs.
    bit_count: u32,
    runs: Vec<u8>,
    used: usize,
}

impl fmt::Debug for CompressedBitPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedBitPage")
            .field("links", &self.links)
            .field("bit_count", &self.bit_count)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

impl CompressedBitPage {
    /// Build a page holding `runs` verbatim, then compress it.
    ///
    /// Fails if the runs do not fit in one page.
    pub fn from_runs(self_id: PageId, runs: &[Run]) -> Result<Self> {
        if runs.len() > RUN_CAPACITY {
            return Err(BmxError::Format(format!(
                "{} runs exceed page capacity {RUN_CAPACITY}",
                runs.len()
            )));
        }
        let mut page = Self::init(self_id);
        for run in runs.iter().filter(|run| !run.is_empty()) {
            page.runs[page.used] = run.encode();
            page.used += 1;
        }
        let mut spill = Spillover::new();
        page.compress_and_recount(&mut spill);
        Ok(page)
    }

    /// Occupied runs in page order.
    pub fn runs(&self) -> impl Iterator<Item = Run> + '_ {
        self.runs[..self.used].iter().map(|&byte| Run::decode(byte))
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    /// At least one empty slot remains.
    #[must_use]
    pub fn tail_is_empty(&self) -> bool {
        self.used < RUN_CAPACITY
    }

    /// Run index containing `pos` and the position at which that run starts.
    fn locate(&self, pos: u32) -> Option<(usize, u32)> {
        if pos >= self.bit_count {
            return None;
        }
        let mut start = 0_u32;
        for (idx, run) in self.runs().enumerate() {
            let end = start + u32::from(run.len);
            if pos < end {
                return Some((idx, start));
            }
            start = end;
        }
        None
    }

    fn remove_at(&mut self, idx: usize) {
        self.runs.copy_within(idx + 1..self.used, idx);
        self.used -= 1;
        self.runs[self.used] = 0;
    }

    /// Insert descriptor bytes before slot `idx`. Bytes pushed past the last
    /// slot go to `spill`.
    fn insert_runs(&mut self, idx: usize, bytes: &[u8], spill: &mut Spillover) {
        debug_assert!(bytes.len() <= MAX_SPILL);
        let mut tail = Vec::with_capacity(bytes.len() + self.used - idx);
        tail.extend_from_slice(bytes);
        tail.extend_from_slice(&self.runs[idx..self.used]);
        let mut slot = idx;
        for byte in tail {
            if slot < RUN_CAPACITY {
                self.runs[slot] = byte;
                slot += 1;
            } else {
                spill.push(byte);
            }
        }
        self.used = slot;
    }

    /// Merge adjacent same-valued runs, then recompute `bit_count`.
    ///
    /// A merge that frees a slot at the tail pulls the earliest byte back out
    /// of `spill`, so bytes only leave the page when it is genuinely full.
    pub fn compress_and_recount(&mut self, spill: &mut Spillover) {
        let mut idx = 0;
        while idx + 1 < self.used {
            let left = Run::decode(self.runs[idx]);
            let right = Run::decode(self.runs[idx + 1]);
            if left.value != right.value || left.len == MAX_RUN_LEN {
                idx += 1;
                continue;
            }
            let sum = left.len + right.len;
            if sum <= MAX_RUN_LEN {
                self.runs[idx] = Run::new(left.value, sum).encode();
                self.remove_at(idx + 1);
                if let Some(byte) = spill.pop_front() {
                    self.runs[self.used] = byte;
                    self.used += 1;
                }
            } else {
                self.runs[idx] = Run::new(left.value, MAX_RUN_LEN).encode();
                self.runs[idx + 1] = Run::new(left.value, sum - MAX_RUN_LEN).encode();
                idx += 1;
            }
        }
        self.bit_count = self.runs().map(|run| u32::from(run.len)).sum();
    }

    /// Append up to `count` positions of `value` at the end of the page.
    /// Returns how many were appended.
    fn append(&mut self, value: bool, count: u32) -> u32 {
        let mut remaining = count;
        if remaining > 0 && self.used > 0 {
            let last = Run::decode(self.runs[self.used - 1]);
            if last.value == value && last.len < MAX_RUN_LEN {
                let take = (MAX_RUN_LEN - last.len).min(clamp_len(remaining));
                self.runs[self.used - 1] = Run::new(value, last.len + take).encode();
                remaining -= u32::from(take);
            }
        }
        while remaining > 0 && self.tail_is_empty() {
            let take = clamp_len(remaining);
            self.runs[self.used] = Run::new(value, take).encode();
            self.used += 1;
            remaining -= u32::from(take);
        }
        let appended = count - remaining;
        self.bit_count += appended;
        appended
    }

    fn write_bit(&mut self, pos: u32, value: bool) -> Mutation {
        let Some((idx, start)) = self.locate(pos) else {
            if !value {
                // Positions past the last run already read as zero.
                return Mutation::unchanged();
            }
            return self.append_set_bit(pos);
        };

        let run = Run::decode(self.runs[idx]);
        if run.value == value {
            return Mutation::unchanged();
        }

        let mut spill = Spillover::new();
        let flipped = Run::new(value, 1).encode();
        #[expect(clippy::cast_possible_truncation)]
        let offset = (pos - start) as u8;
        if run.len == 1 {
            self.runs[idx] = flipped;
        } else if offset == 0 {
            self.runs[idx] = Run::new(run.value, run.len - 1).encode();
            self.insert_runs(idx, &[flipped], &mut spill);
        } else if offset == run.len - 1 {
            self.runs[idx] = Run::new(run.value, run.len - 1).encode();
            self.insert_runs(idx + 1, &[flipped], &mut spill);
        } else {
            let trailing = Run::new(run.value, run.len - offset - 1).encode();
            self.runs[idx] = Run::new(run.value, offset).encode();
            self.insert_runs(idx + 1, &[flipped, trailing], &mut spill);
        }
        self.compress_and_recount(&mut spill);

        tracing::trace!(
            target: "bmx::page",
            page = self.links.self_id.0,
            pos,
            value,
            runs = self.used,
            spilled = spill.len(),
            "run split"
        );
        Mutation::changed(spill)
    }

    /// Set a position beyond the last run: pad with zeros, then append a
    /// single one. If the page fills first the padding is kept and the call
    /// reports `applied = false`; the chain continues on the next page.
    fn append_set_bit(&mut self, pos: u32) -> Mutation {
        let gap = pos - self.bit_count;
        let padded = self.append(false, gap);
        if padded < gap || self.append(true, 1) == 0 {
            return Mutation {
                applied: false,
                dirty: padded > 0,
                spill: Spillover::new(),
            };
        }
        Mutation::changed(Spillover::new())
    }

    fn check_runs(&self) -> Result<()> {
        let page = self.links.self_id.0;
        let stray = self.runs[self.used..]
            .iter()
            .position(|&byte| byte & MAX_RUN_LEN != 0);
        if let Some(gap) = stray {
            return Err(BmxError::corruption(
                page,
                format!("run at slot {} follows an empty slot", self.used + gap),
            ));
        }
        let sum: u32 = self.runs().map(|run| u32::from(run.len)).sum();
        if sum != self.bit_count {
            return Err(BmxError::corruption(
                page,
                format!("bit_count {} != run sum {sum}", self.bit_count),
            ));
        }
        for (idx, pair) in self.runs[..self.used].windows(2).enumerate() {
            let (left, right) = (Run::decode(pair[0]), Run::decode(pair[1]));
            if left.value == right.value && left.len < MAX_RUN_LEN {
                return Err(BmxError::corruption(
                    page,
                    format!("uncompressed runs {left}{right} at slot {idx}"),
                ));
            }
        }
        Ok(())
    }
}

#[expect(clippy::cast_possible_truncation)]
fn clamp_len(count: u32) -> u8 {
    count.min(u32::from(MAX_RUN_LEN)) as u8
}

impl BitmapPage for CompressedBitPage {
    const KIND: PageKind = PageKind::Compressed;

    fn init(self_id: PageId) -> Self {
        Self {
            links: PageLinks::detached(self_id),
            bit_count: 0,
            runs: vec![0; RUN_CAPACITY],
            used: 0,
        }
    }

    fn decode(page: PageId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(BmxError::corruption(
                page.0,
                format!("page buffer is {} bytes", bytes.len()),
            ));
        }
        let links = PageLinks::decode(page, bytes)?;
        let raw_count = read_le_i32(bytes, OFF_BIT_COUNT).map_err(corrupt(page))?;
        let bit_count = u32::try_from(raw_count)
            .map_err(|_| BmxError::corruption(page.0, format!("negative bit_count {raw_count}")))?;
        let runs = bytes[COMPRESSED_PAGE_HEADER_SIZE..].to_vec();
        let used = runs
            .iter()
            .position(|&byte| byte & MAX_RUN_LEN == 0)
            .unwrap_or(RUN_CAPACITY);
        let decoded = Self {
            links,
            bit_count,
            runs,
            used,
        };
        decoded.check_runs()?;
        Ok(decoded)
    }

    fn encode(&self, bytes: &mut [u8]) -> Result<()> {
        let page = self.links.self_id;
        let Some(payload) = bytes.get_mut(COMPRESSED_PAGE_HEADER_SIZE..PAGE_SIZE) else {
            return Err(BmxError::corruption(page.0, "page buffer too small"));
        };
        payload.copy_from_slice(&self.runs);
        let count = i32::try_from(self.bit_count)
            .map_err(|_| BmxError::corruption(page.0, "bit_count exceeds i32"))?;
        write_le_i32(bytes, OFF_BIT_COUNT, count).map_err(corrupt(page))?;
        self.links.encode(bytes)
    }

    fn links(&self) -> &PageLinks {
        &self.links
    }

    fn links_mut(&mut self) -> &mut PageLinks {
        &mut self.links
    }

    fn span(&self) -> u32 {
        self.bit_count
    }

    fn has_room(&self) -> bool {
        self.tail_is_empty()
    }

    fn set_bit(&mut self, pos: u32) -> Mutation {
        self.write_bit(pos, true)
    }

    fn clear_bit(&mut self, pos: u32) -> Mutation {
        self.write_bit(pos, false)
    }

    fn check_bit(&self, pos: u32) -> bool {
        self.locate(pos)
            .is_some_and(|(idx, _)| Run::decode(self.runs[idx]).value)
    }

    fn next_set_bit(&self, from: u32) -> Option<u32> {
        let mut start = 0_u32;
        for run in self.runs() {
            let end = start + u32::from(run.len);
            if run.value && end > from {
                return Some(start.max(from));
            }
            start = end;
        }
        None
    }

    fn count_ones(&self) -> u32 {
        self.runs()
            .filter(|run| run.value)
            .map(|run| u32::from(run.len))
            .sum()
    }

    fn dequeue_byte(&mut self) -> Option<u8> {
        if self.used == 0 {
            return None;
        }
        let byte = self.runs[0];
        self.remove_at(0);
        self.bit_count -= u32::from(Run::decode(byte).len);
        Some(byte)
    }

    fn postfix_byte(&mut self, byte: u8) -> Mutation {
        if Run::decode(byte).is_empty() {
            return Mutation::unchanged();
        }
        if !self.tail_is_empty() {
            return Mutation::rejected();
        }
        self.runs[self.used] = byte;
        self.used += 1;
        let mut spill = Spillover::new();
        self.compress_and_recount(&mut spill);
        Mutation::changed(spill)
    }

    fn prefix_bytes(&mut self, bytes: &[u8]) -> Mutation {
        let occupied: Vec<u8> = bytes
            .iter()
            .copied()
            .filter(|&byte| !Run::decode(byte).is_empty())
            .collect();
        if occupied.is_empty() {
            return Mutation::unchanged();
        }
        let mut spill = Spillover::new();
        self.insert_runs(0, &occupied, &mut spill);
        self.compress_and_recount(&mut spill);
        Mutation::changed(spill)
    }

    fn validate(&self) -> Result<()> {
        self.check_runs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs_of(page: &CompressedBitPage) -> Vec<(bool, u8)> {
        page.runs().map(|run| (run.value, run.len)).collect()
    }

    /// A full page of alternating single-position runs ending in a zero run.
    fn full_alternating_page() -> CompressedBitPage {
        let runs: Vec<Run> = (0..RUN_CAPACITY)
            .map(|idx| Run::new(idx % 2 == 1, 1))
            .collect();
        CompressedBitPage::from_runs(PageId(0), &runs).unwrap()
    }

    #[test]
    fn run_byte_codec() {
        assert_eq!(Run::decode(0x85), Run::new(true, 5));
        assert_eq!(Run::decode(0x7F), Run::new(false, 127));
        assert_eq!(Run::new(true, 1).encode(), 0x81);
        assert_eq!(Run::new(true, 0).encode(), 0x00);
        assert!(Run::decode(0x80).is_empty());
        assert_eq!(Run::new(true, 40).to_string(), "[1|40]");
    }

    #[test]
    fn interior_set_splits_run_in_three() {
        let mut page =
            CompressedBitPage::from_runs(PageId(0), &[Run::new(false, 80)]).unwrap();
        let m = page.set_bit(40);
        assert!(m.applied && m.dirty);
        assert!(m.spill.is_empty());
        assert_eq!(runs_of(&page), vec![(false, 40), (true, 1), (false, 39)]);
        assert_eq!(page.bit_count(), 80);
        assert!(page.check_bit(40));
        assert!(!page.check_bit(39));
    }

    #[test]
    fn edge_sets_split_run_in_two_and_merge() {
        let mut page =
            CompressedBitPage::from_runs(PageId(0), &[Run::new(true, 2), Run::new(false, 10)])
                .unwrap();
        // First position of the zero run merges into the preceding one run.
        page.set_bit(2);
        assert_eq!(runs_of(&page), vec![(true, 3), (false, 9)]);
        // Last position splits the tail off.
        page.set_bit(11);
        assert_eq!(runs_of(&page), vec![(true, 3), (false, 8), (true, 1)]);
        assert_eq!(page.bit_count(), 12);
    }

    #[test]
    fn single_position_run_flips_in_place_then_merges() {
        let mut page = CompressedBitPage::from_runs(
            PageId(0),
            &[Run::new(false, 4), Run::new(true, 1), Run::new(false, 4)],
        )
        .unwrap();
        page.clear_bit(4);
        assert_eq!(runs_of(&page), vec![(false, 9)]);
        assert_eq!(page.count_ones(), 0);
        assert_eq!(page.bit_count(), 9);
    }

    #[test]
    fn set_on_matching_run_is_noop() {
        let mut page = CompressedBitPage::from_runs(PageId(0), &[Run::new(true, 5)]).unwrap();
        let m = page.set_bit(3);
        assert!(m.applied && !m.dirty);
        let m = page.clear_bit(10);
        assert!(m.applied && !m.dirty, "clear beyond runs is a no-op");
    }

    #[test]
    fn append_pads_with_zeros() {
        let mut page = CompressedBitPage::init(PageId(0));
        assert!(page.set_bit(300).applied);
        assert_eq!(
            runs_of(&page),
            vec![(false, 127), (false, 127), (false, 46), (true, 1)]
        );
        assert_eq!(page.span(), 301);
        assert_eq!(page.next_set_bit(0), Some(300));
        // Adjacent append extends the last one run.
        assert!(page.set_bit(301).applied);
        assert_eq!(runs_of(&page).last(), Some(&(true, 2)));
        assert!(page.validate().is_ok());
    }

    #[test]
    fn merge_over_max_run_length_saturates_left() {
        let page = CompressedBitPage::from_runs(
            PageId(0),
            &[Run::new(false, 100), Run::new(false, 50), Run::new(true, 3)],
        )
        .unwrap();
        assert_eq!(runs_of(&page), vec![(false, 127), (false, 23), (true, 3)]);
        assert_eq!(page.bit_count(), 153);
    }

    #[test]
    fn split_in_full_page_spills_tail_bytes() {
        let mut page = full_alternating_page();
        assert!(!page.has_room());
        let before = page.bit_count();
        // Flip the zero at position 0: [0|1][1|1] -> [1|2], freeing a slot.
        let m = page.set_bit(0);
        assert!(m.spill.is_empty());
        assert!(page.has_room());
        assert_eq!(page.bit_count(), before);

        let mut page = CompressedBitPage::from_runs(
            PageId(0),
            &std::iter::once(Run::new(false, 3))
                .chain((1..RUN_CAPACITY).map(|idx| Run::new(idx % 2 == 1, 1)))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let tail = page.runs().last().unwrap();
        let before = page.bit_count();
        // Interior split of [0|3] needs two more slots on a full page.
        let m = page.set_bit(1);
        assert!(m.applied);
        assert_eq!(m.spill.len(), 2);
        let spilled: u32 = m
            .spill
            .as_slice()
            .iter()
            .map(|&byte| u32::from(Run::decode(byte).len))
            .sum();
        assert_eq!(page.bit_count() + spilled, before);
        assert_eq!(Run::decode(m.spill.as_slice()[1]), tail);
        assert!(page.validate().is_ok());
    }

    #[test]
    fn append_on_full_page_keeps_padding_and_fails() {
        let mut page = full_alternating_page();
        let span = page.span();
        // Last run is [1|1]; a one appended directly after still fits.
        assert_eq!(page.runs().last(), Some(Run::new(true, 1)));
        assert!(page.set_bit(span).applied);
        assert_eq!(page.span(), span + 1);
        // Anything needing padding cannot.
        let m = page.set_bit(span + 10);
        assert!(!m.applied);
        assert!(!m.dirty);
        assert_eq!(page.span(), span + 1);
    }

    #[test]
    fn dequeue_postfix_prefix() {
        let mut page = CompressedBitPage::from_runs(
            PageId(0),
            &[Run::new(true, 2), Run::new(false, 5), Run::new(true, 1)],
        )
        .unwrap();
        let first = page.dequeue_byte().unwrap();
        assert_eq!(Run::decode(first), Run::new(true, 2));
        assert_eq!(page.bit_count(), 6);

        let m = page.postfix_byte(Run::new(true, 4).encode());
        assert!(m.applied && m.dirty);
        assert_eq!(runs_of(&page), vec![(false, 5), (true, 5)]);

        let m = page.prefix_bytes(&[Run::new(true, 1).encode(), Run::new(false, 2).encode()]);
        assert!(m.spill.is_empty());
        assert_eq!(runs_of(&page), vec![(true, 1), (false, 7), (true, 5)]);
        assert_eq!(page.bit_count(), 13);

        let mut empty = CompressedBitPage::init(PageId(1));
        assert_eq!(empty.dequeue_byte(), None);
    }

    #[test]
    fn postfix_rejected_when_full() {
        let mut page = full_alternating_page();
        // Same value as the tail run merges rather than needing a slot, but a
        // full page refuses before looking.
        assert!(!page.postfix_byte(Run::new(false, 1).encode()).applied);
    }

    #[test]
    fn prefix_on_full_page_spills() {
        let mut page = full_alternating_page();
        let m = page.prefix_bytes(&[Run::new(true, 3).encode()]);
        // [1|3][0|1] does not merge, so the last run leaves the page.
        assert_eq!(m.spill.as_slice(), &[Run::new(true, 1).encode()]);
        assert_eq!(page.run_count(), RUN_CAPACITY);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut page = CompressedBitPage::init(PageId(6));
        page.links_mut().prev = Some(PageId(2));
        page.set_bit(10);
        page.set_bit(500);
        let mut buf = vec![0_u8; PAGE_SIZE];
        page.encode(&mut buf).unwrap();
        assert_eq!(read_le_i32(&buf, OFF_BIT_COUNT).unwrap(), 501);
        let decoded = CompressedBitPage::decode(PageId(6), &buf).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn gap_in_run_stream_is_corruption() {
        let mut page = CompressedBitPage::from_runs(PageId(0), &[Run::new(true, 3)]).unwrap();
        let mut buf = vec![0_u8; PAGE_SIZE];
        page.encode(&mut buf).unwrap();
        buf[COMPRESSED_PAGE_HEADER_SIZE + 2] = 0x85;
        let err = CompressedBitPage::decode(PageId(0), &buf).unwrap_err();
        assert!(err.to_string().contains("follows an empty slot"), "{err}");

        page.bit_count = 4;
        page.encode(&mut buf).unwrap();
        let err = CompressedBitPage::decode(PageId(0), &buf).unwrap_err();
        assert!(err.to_string().contains("bit_count 4 != run sum 3"), "{err}");
    }

    #[test]
    fn too_many_runs_rejected() {
        let runs = vec![Run::new(true, 1); RUN_CAPACITY + 1];
        assert!(CompressedBitPage::from_runs(PageId(0), &runs).is_err());
    }
}
