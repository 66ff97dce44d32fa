//! Read-side cursors over a chain.
//!
//! Both cursors hold page ids and offsets only, never a pinned page, so an
//! idle cursor costs no cache frame. Neither is isolated from writers: results
//! are only meaningful while the chain is not mutated.

use crate::Pinned;
use bmx_bitmap::BitmapPage;
use bmx_error::Result;
use bmx_page::PageCache;
use bmx_types::{PageId, RowPosition};
use std::marker::PhantomData;

/// Forward scan over set positions.
#[derive(Debug)]
pub struct ChainCursor<P> {
    head: PageId,
    page: Option<PageId>,
    /// Chain position of the first position on `page`.
    start: u64,
    /// Local position to resume from on `page`.
    from: u32,
    _page: PhantomData<fn() -> P>,
}

impl<P: BitmapPage> ChainCursor<P> {
    pub(crate) fn new(head: PageId) -> Self {
        Self {
            head,
            page: Some(head),
            start: 0,
            from: 0,
            _page: PhantomData,
        }
    }

    /// Next set position after the last one returned, `None` once the chain
    /// is exhausted.
    pub fn next_set(&mut self, cache: &dyn PageCache) -> Result<Option<RowPosition>> {
        while let Some(id) = self.page {
            let pinned = Pinned::<P>::load(cache, id)?;
            let page = pinned.page();
            if let Some(local) = page.next_set_bit(self.from) {
                self.from = local + 1;
                return Ok(Some(RowPosition(self.start + u64::from(local))));
            }
            self.start += u64::from(page.span());
            self.from = 0;
            self.page = page.links().next;
        }
        Ok(None)
    }

    /// Restart from the head of the chain.
    pub fn rewind(&mut self) {
        self.page = Some(self.head);
        self.start = 0;
        self.from = 0;
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.page.is_none()
    }
}

/// Random-access lookup of single positions.
///
/// Remembers the page that answered the last probe. A probe at or after that
/// page's first position resumes there, so a sequence of increasing probes
/// walks the chain once.
#[derive(Debug)]
pub struct ChainProbe<P> {
    head: PageId,
    last: Option<(PageId, u64)>,
    _page: PhantomData<fn() -> P>,
}

impl<P: BitmapPage> ChainProbe<P> {
    pub(crate) fn new(head: PageId) -> Self {
        Self {
            head,
            last: None,
            _page: PhantomData,
        }
    }

    #[must_use]
    pub fn head(&self) -> PageId {
        self.head
    }

    pub fn check(&mut self, cache: &dyn PageCache, pos: RowPosition) -> Result<bool> {
        let (mut id, mut start) = match self.last {
            Some((id, start)) if pos.0 >= start => (id, start),
            _ => (self.head, 0),
        };
        loop {
            let pinned = Pinned::<P>::load(cache, id)?;
            let page = pinned.page();
            let end = start + u64::from(page.span());
            if pos.0 < end {
                self.last = Some((id, start));
                #[expect(clippy::cast_possible_truncation)]
                let local = (pos.0 - start) as u32;
                return Ok(page.check_bit(local));
            }
            let Some(next) = page.links().next else {
                self.last = Some((id, start));
                return Ok(false);
            };
            id = next;
            start = end;
        }
    }

    /// Forget the remembered page.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
