#![forbid(unsafe_code)]
//! Per-value bitmap page chains.
//!
//! A chain is a doubly-linked list of bitmap pages starting at a fixed head
//! page. Positions are partitioned left to right: page `k` covers the
//! positions after everything pages `0..k` span. Pages are only ever appended
//! at the tail and never freed; clearing bits never shrinks a chain.
//!
//! For compressed pages every mutation is followed by a rebalance that
//! restores two chain-wide properties before the call returns:
//!
//! - no spillover bytes are left in flight, and
//! - a page with tail room is never followed by a page that still holds
//!   positions.
//!
//! The chain manager itself only stores the head page id. Every operation
//! takes the page cache explicitly and releases each page it pins before
//! returning, on error paths included.

mod cursor;

pub use cursor::{ChainCursor, ChainProbe};

use bmx_bitmap::{BitmapPage, PageKind, Spillover};
use bmx_error::{BmxError, Result};
use bmx_page::{PageCache, PageGuard};
use bmx_types::{PageId, RowPosition};
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::{debug, trace, warn};

// ── Pinned pages ────────────────────────────────────────────────────────────

/// A decoded page together with the guard keeping its frame pinned.
///
/// Changes are written back to the frame by [`Pinned::release`]. Dropping a
/// `Pinned` without releasing it unpins the frame clean, discarding the
/// in-memory changes.
pub(crate) struct Pinned<'c, P> {
    guard: PageGuard<'c>,
    page: P,
    dirty: bool,
}

impl<'c, P: BitmapPage> Pinned<'c, P> {
    pub(crate) fn load(cache: &'c dyn PageCache, id: PageId) -> Result<Self> {
        let guard = PageGuard::acquire(cache, id, false)?;
        let page = P::decode(id, guard.data()).inspect_err(|err| {
            warn!(target: "bmx::chain", page = id.0, kind = %P::KIND, error = %err, "page rejected");
        })?;
        Ok(Self {
            guard,
            page,
            dirty: false,
        })
    }

    fn allocate(cache: &'c dyn PageCache) -> Result<Self> {
        let guard = PageGuard::allocate(cache)?;
        let page = P::init(guard.page_id());
        Ok(Self {
            guard,
            page,
            dirty: true,
        })
    }

    fn id(&self) -> PageId {
        self.guard.page_id()
    }

    pub(crate) fn page(&self) -> &P {
        &self.page
    }

    fn release(mut self) -> Result<()> {
        if self.dirty {
            self.page.encode(self.guard.data_mut())?;
        }
        Ok(())
    }

    /// Allocate a page, link it after this one, and return its id.
    fn link_new_page(&mut self, cache: &'c dyn PageCache) -> Result<PageId> {
        let mut fresh = Self::allocate(cache)?;
        let id = fresh.id();
        fresh.page.links_mut().prev = Some(self.id());
        fresh.release()?;
        self.page.links_mut().next = Some(id);
        self.dirty = true;
        debug!(
            target: "bmx::chain",
            tail = self.id().0,
            page = id.0,
            kind = %P::KIND,
            "chain extended"
        );
        Ok(id)
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainStats {
    pub pages: u32,
    /// Positions covered by the chain, set or not.
    pub span: u64,
    /// Set positions.
    pub ones: u64,
    /// Pages that currently span no positions.
    pub empty_pages: u32,
}

// ── Chain manager ───────────────────────────────────────────────────────────

/// Bitmap chain for one distinct value.
#[derive(Debug)]
pub struct ChainManager<P> {
    head: PageId,
    _page: PhantomData<fn() -> P>,
}

impl<P> Clone for ChainManager<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ChainManager<P> {}

impl<P: BitmapPage> ChainManager<P> {
    /// Allocate and initialize a head page.
    pub fn create(cache: &dyn PageCache) -> Result<Self> {
        let head = Pinned::<P>::allocate(cache)?;
        let id = head.id();
        head.release()?;
        debug!(target: "bmx::chain", head = id.0, kind = %P::KIND, "chain created");
        Ok(Self::open(id))
    }

    /// Attach to an existing chain.
    #[must_use]
    pub fn open(head: PageId) -> Self {
        Self {
            head,
            _page: PhantomData,
        }
    }

    #[must_use]
    pub fn head(&self) -> PageId {
        self.head
    }

    #[must_use]
    pub fn kind(&self) -> PageKind {
        P::KIND
    }

    /// Set `pos`, extending the chain as needed. Returns whether the bit
    /// ended up set, which is always the case once the write succeeds.
    pub fn insert_bit(&self, cache: &dyn PageCache, pos: RowPosition) -> Result<bool> {
        self.write_bit(cache, pos, true)?;
        Ok(true)
    }

    /// Clear `pos`. Positions beyond the end of the chain are already clear
    /// and nothing is allocated. Returns `true` once the bit reads clear.
    pub fn clear_bit(&self, cache: &dyn PageCache, pos: RowPosition) -> Result<bool> {
        self.write_bit(cache, pos, false)?;
        Ok(true)
    }

    pub fn check_bit(&self, cache: &dyn PageCache, pos: RowPosition) -> Result<bool> {
        let mut probe = self.probe();
        probe.check(cache, pos)
    }

    /// Forward scan over the set positions, starting at the head.
    #[must_use]
    pub fn cursor(&self) -> ChainCursor<P> {
        ChainCursor::new(self.head)
    }

    /// Positional probe that resumes from its last page for increasing
    /// positions.
    #[must_use]
    pub fn probe(&self) -> ChainProbe<P> {
        ChainProbe::new(self.head)
    }

    /// Store `value` at `pos`. Returns `true` if the stored bit changed.
    pub fn write_bit(
        &self,
        cache: &dyn PageCache,
        pos: RowPosition,
        value: bool,
    ) -> Result<bool> {
        let mut id = self.head;
        let mut start = 0_u64;
        loop {
            let mut cur = Pinned::<P>::load(cache, id)?;
            let end = start + u64::from(cur.page.span());
            if pos.0 < end || cur.page.has_room() {
                let local = u32::try_from(pos.0 - start).unwrap_or(u32::MAX);
                let m = if value {
                    cur.page.set_bit(local)
                } else {
                    cur.page.clear_bit(local)
                };
                cur.dirty |= m.dirty;
                if m.applied {
                    trace!(
                        target: "bmx::chain",
                        head = self.head.0,
                        page = id.0,
                        pos = pos.0,
                        value,
                        changed = m.dirty,
                        "bit written"
                    );
                    if m.dirty {
                        rebalance(cache, cur, m.spill)?;
                    } else {
                        cur.release()?;
                    }
                    return Ok(m.dirty);
                }
            }

            // The page may have grown while padding towards `pos`.
            start += u64::from(cur.page.span());
            let link = cur.page.links().next;
            let next = match link {
                Some(next) => next,
                None if !value => {
                    cur.release()?;
                    return Ok(false);
                }
                None => cur.link_new_page(cache)?,
            };
            cur.release()?;
            id = next;
        }
    }

    /// Every page id in chain order.
    pub fn page_ids(&self, cache: &dyn PageCache) -> Result<Vec<PageId>> {
        let mut ids = Vec::new();
        self.walk(cache, |page| {
            ids.push(page.links().self_id);
            Ok(())
        })?;
        Ok(ids)
    }

    pub fn stats(&self, cache: &dyn PageCache) -> Result<ChainStats> {
        let mut stats = ChainStats::default();
        self.walk(cache, |page| {
            stats.pages += 1;
            stats.span += u64::from(page.span());
            stats.ones += u64::from(page.count_ones());
            if page.span() == 0 {
                stats.empty_pages += 1;
            }
            Ok(())
        })?;
        Ok(stats)
    }

    /// Check link consistency, per-page invariants, and that no page with
    /// tail room precedes a page holding positions.
    pub fn validate(&self, cache: &dyn PageCache) -> Result<()> {
        let mut prev: Option<PageId> = None;
        let mut roomy: Option<PageId> = None;
        self.walk(cache, |page| {
            let id = page.links().self_id;
            if page.links().prev != prev {
                return Err(BmxError::corruption(
                    id.0,
                    format!("prev link {:?} != {:?}", page.links().prev, prev),
                ));
            }
            page.validate()?;
            if let Some(open) = roomy.filter(|_| page.span() > 0) {
                return Err(BmxError::corruption(
                    id.0,
                    format!("holds positions after page {open} which has room"),
                ));
            }
            if roomy.is_none() && page.has_room() {
                roomy = Some(id);
            }
            prev = Some(id);
            Ok(())
        })
    }

    /// Visit every page in chain order.
    fn walk(&self, cache: &dyn PageCache, mut visit: impl FnMut(&P) -> Result<()>) -> Result<()> {
        let mut seen = HashSet::new();
        let mut next = Some(self.head);
        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(BmxError::corruption(id.0, "chain links form a cycle"));
            }
            let pinned = Pinned::<P>::load(cache, id)?;
            visit(pinned.page())?;
            next = pinned.page().links().next;
        }
        Ok(())
    }
}

// ── Rebalancing ─────────────────────────────────────────────────────────────

/// Restore the chain properties after `cur` was mutated.
///
/// Spillover is prefixed onto the successor (allocated if missing), which
/// may spill in turn. A page left with tail room pulls descriptor bytes from
/// its nearest non-empty successors; the first successor it took bytes from
/// then has room itself, so the walk continues there. At most two pages are
/// pinned at any time.
fn rebalance<'c, P: BitmapPage>(
    cache: &'c dyn PageCache,
    mut cur: Pinned<'c, P>,
    mut carry: Spillover,
) -> Result<()> {
    loop {
        if !carry.is_empty() {
            let link = cur.page.links().next;
            let next = match link {
                Some(next) => next,
                None => cur.link_new_page(cache)?,
            };
            let from = cur.id();
            cur.release()?;

            let mut succ = Pinned::<P>::load(cache, next)?;
            let m = succ.page.prefix_bytes(carry.as_slice());
            if !m.applied {
                return Err(BmxError::corruption(
                    next.0,
                    "page refused spillover bytes",
                ));
            }
            trace!(
                target: "bmx::chain",
                from = from.0,
                to = next.0,
                bytes = carry.len(),
                spilled = m.spill.len(),
                "spillover moved"
            );
            succ.dirty = true;
            carry = m.spill;
            cur = succ;
            continue;
        }

        if !cur.page.has_room() {
            return cur.release();
        }
        let touched = pull_into(cache, &mut cur)?;
        cur.release()?;
        let Some(next) = touched else {
            return Ok(());
        };
        cur = Pinned::load(cache, next)?;
    }
}

/// Move leading descriptor bytes from successors onto the tail of `cur`
/// until it is full or every successor is drained. Returns the first
/// successor that gave up bytes.
fn pull_into<'c, P: BitmapPage>(
    cache: &'c dyn PageCache,
    cur: &mut Pinned<'c, P>,
) -> Result<Option<PageId>> {
    let mut first_touched = None;
    let mut next = cur.page.links().next;
    while let Some(id) = next {
        if !cur.page.has_room() {
            break;
        }
        let mut succ = Pinned::<P>::load(cache, id)?;
        let mut moved = 0_usize;
        while cur.page.has_room() {
            let Some(byte) = succ.page.dequeue_byte() else {
                break;
            };
            let m = cur.page.postfix_byte(byte);
            if !m.applied || !m.spill.is_empty() {
                return Err(BmxError::corruption(
                    cur.id().0,
                    "tail append overflowed a page with room",
                ));
            }
            moved += 1;
        }
        if moved > 0 {
            succ.dirty = true;
            cur.dirty = true;
            first_touched.get_or_insert(id);
            trace!(
                target: "bmx::chain",
                from = id.0,
                to = cur.id().0,
                bytes = moved,
                "bytes pulled"
            );
        }
        next = succ.page.links().next;
        succ.release()?;
    }
    Ok(first_touched)
}
