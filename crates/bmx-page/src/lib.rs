#![forbid(unsafe_code)]
//! Page I/O layer with an LRU buffer pool.
//!
//! Provides the `PageDevice` trait, a pinning page cache with dirty
//! write-back, and [`PageGuard`], a scoped acquisition that releases its page
//! on every exit path.

use bmx_error::{BmxError, Result};
use bmx_types::{PAGE_SIZE, PageId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, trace};

// ── Configuration ───────────────────────────────────────────────────────────

/// Buffer pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Page frames the pool may keep resident. Default: 64.
    pub frames: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { frames: 64 }
    }
}

/// Page device sizing for freshly created images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of pages the device can hold. Default: 4096.
    pub pages: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { pages: 4096 }
    }
}

impl DeviceConfig {
    pub fn len_bytes(&self) -> Result<u64> {
        u64::from(self.pages)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or_else(|| BmxError::Format("device length overflows u64".to_owned()))
    }
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| BmxError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| BmxError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(BmxError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positioned I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) an image sized for `config.pages` pages.
    pub fn create(path: impl AsRef<Path>, config: DeviceConfig) -> Result<Self> {
        let len = config.len_bytes()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Heap-backed byte device.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let len = usize::try_from(config.len_bytes()?)
            .map_err(|_| BmxError::Format("device length does not fit usize".to_owned()))?;
        Ok(Self {
            bytes: Mutex::new(vec![0_u8; len]),
        })
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| BmxError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| BmxError::Format("offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Page devices ────────────────────────────────────────────────────────────

/// Page-addressed I/O interface.
pub trait PageDevice: Send + Sync {
    /// Read a whole page.
    fn read_page(&self, page: PageId) -> Result<Vec<u8>>;

    /// Write a whole page. `data.len()` MUST equal [`PAGE_SIZE`].
    fn write_page(&self, page: PageId, data: &[u8]) -> Result<()>;

    /// Total number of pages.
    fn page_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct BytePageDevice<D: ByteDevice> {
    inner: D,
    page_count: u32,
}

impl<D: ByteDevice> BytePageDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let page_size = PAGE_SIZE as u64;
        let remainder = len % page_size;
        if remainder != 0 {
            return Err(BmxError::Format(format!(
                "image length is not page-aligned: len_bytes={len} page_size={page_size} remainder={remainder}"
            )));
        }
        let page_count = u32::try_from(len / page_size)
            .map_err(|_| BmxError::Format("image holds more than u32::MAX pages".to_owned()))?;
        Ok(Self { inner, page_count })
    }

    fn offset_of(&self, page: PageId) -> Result<u64> {
        if page.0 >= self.page_count {
            return Err(BmxError::Format(format!(
                "page out of range: page={page} page_count={}",
                self.page_count
            )));
        }
        u64::from(page.0)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or_else(|| BmxError::Format("page offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> PageDevice for BytePageDevice<D> {
    fn read_page(&self, page: PageId) -> Result<Vec<u8>> {
        let offset = self.offset_of(page)?;
        let mut buf = vec![0_u8; PAGE_SIZE];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn write_page(&self, page: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(BmxError::Format(format!(
                "write_page data size mismatch: got={} expected={PAGE_SIZE}",
                data.len()
            )));
        }
        let offset = self.offset_of(page)?;
        self.inner.write_all_at(offset, data)
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Page cache ──────────────────────────────────────────────────────────────

/// Counters reported by a page cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub allocated_pages: u32,
    /// Frames currently pinned by an outstanding [`PageGuard`].
    pub pinned: usize,
}

/// Pinning page cache consumed by the bitmap engine.
///
/// Callers normally go through [`PageGuard`] instead of calling
/// `pin`/`release` directly.
pub trait PageCache {
    /// Reserve `count` consecutive fresh pages and return the first.
    fn allocate(&self, count: u32) -> Result<PageId>;

    /// Pin `page` and return a copy of its bytes. With `zero_init` the page is
    /// zeroed instead of read from the device.
    fn pin(&self, page: PageId, zero_init: bool) -> Result<Vec<u8>>;

    /// Unpin `page`. `Some(bytes)` replaces the frame contents and marks it
    /// dirty.
    fn release(&self, page: PageId, data: Option<Vec<u8>>);

    /// Write back every dirty frame and sync the device.
    fn flush(&self) -> Result<()>;

    fn stats(&self) -> CacheStats;
}

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    pins: u32,
    dirty: bool,
}

#[derive(Debug)]
struct PoolState {
    frames: HashMap<PageId, Frame>,
    /// Unpinned resident pages, least recently used at the front.
    lru: VecDeque<PageId>,
    next_page: u32,
    stats: CacheStats,
}

impl PoolState {
    fn forget_lru(&mut self, page: PageId) {
        if let Some(pos) = self.lru.iter().position(|p| *p == page) {
            let _ = self.lru.remove(pos);
        }
    }
}

/// LRU buffer pool over a [`PageDevice`].
///
/// Frames are written back when evicted or on [`PageCache::flush`]. A pinned
/// frame is never evicted.
#[derive(Debug)]
pub struct BufferPool<D: PageDevice> {
    dev: D,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl<D: PageDevice> BufferPool<D> {
    pub fn new(dev: D, config: CacheConfig) -> Result<Self> {
        if config.frames == 0 {
            return Err(BmxError::Format(
                "BufferPool frames must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            dev,
            capacity: config.frames,
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                lru: VecDeque::new(),
                next_page: 0,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Pool over an existing image whose first `allocated` pages are in use.
    pub fn reopen(dev: D, config: CacheConfig, allocated: u32) -> Result<Self> {
        if allocated > dev.page_count() {
            return Err(BmxError::Format(format!(
                "allocation watermark {allocated} exceeds device page_count {}",
                dev.page_count()
            )));
        }
        let pool = Self::new(dev, config)?;
        {
            let mut state = pool.state.lock();
            state.next_page = allocated;
            state.stats.allocated_pages = allocated;
        }
        Ok(pool)
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    fn make_room(&self, state: &mut PoolState) -> Result<()> {
        while state.frames.len() >= self.capacity {
            let Some(victim) = state.lru.pop_front() else {
                return Err(BmxError::CacheExhausted {
                    frames: self.capacity,
                });
            };
            let Some(frame) = state.frames.remove(&victim) else {
                continue;
            };
            if frame.dirty {
                self.dev.write_page(victim, &frame.bytes)?;
                state.stats.writebacks += 1;
            }
            state.stats.evictions += 1;
            debug!(
                target: "bmx::cache",
                page = victim.0,
                dirty = frame.dirty,
                "evict"
            );
        }
        Ok(())
    }
}

impl BufferPool<BytePageDevice<MemByteDevice>> {
    /// Pool over a fresh heap-backed device.
    pub fn in_memory(device: DeviceConfig, cache: CacheConfig) -> Result<Self> {
        Self::new(BytePageDevice::new(MemByteDevice::new(device)?)?, cache)
    }
}

impl<D: PageDevice> PageCache for BufferPool<D> {
    fn allocate(&self, count: u32) -> Result<PageId> {
        if count == 0 {
            return Err(BmxError::Format("allocate count must be > 0".to_owned()));
        }
        let mut state = self.state.lock();
        let first = state.next_page;
        let end = first.checked_add(count).ok_or(BmxError::NoSpace)?;
        if end > self.dev.page_count() {
            error!(
                target: "bmx::cache",
                requested = count,
                allocated = first,
                page_count = self.dev.page_count(),
                "page allocation failed"
            );
            return Err(BmxError::NoSpace);
        }
        state.next_page = end;
        state.stats.allocated_pages = end;
        trace!(target: "bmx::cache", first, count, "allocate");
        Ok(PageId(first))
    }

    fn pin(&self, page: PageId, zero_init: bool) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if page.0 >= state.next_page {
            return Err(BmxError::NotFound(format!("page {page} is not allocated")));
        }

        let was_resident = if let Some(frame) = state.frames.get_mut(&page) {
            frame.pins += 1;
            if zero_init {
                frame.bytes.fill(0);
                frame.dirty = true;
            }
            Some(frame.pins == 1)
        } else {
            None
        };
        if let Some(first_pin) = was_resident {
            state.stats.hits += 1;
            if first_pin {
                state.forget_lru(page);
            }
            let bytes = state.frames[&page].bytes.clone();
            drop(state);
            return Ok(bytes);
        }

        state.stats.misses += 1;
        self.make_room(&mut state)?;
        let bytes = if zero_init {
            vec![0_u8; PAGE_SIZE]
        } else {
            self.dev.read_page(page)?
        };
        state.frames.insert(
            page,
            Frame {
                bytes: bytes.clone(),
                pins: 1,
                dirty: zero_init,
            },
        );
        drop(state);
        Ok(bytes)
    }

    fn release(&self, page: PageId, data: Option<Vec<u8>>) {
        let mut state = self.state.lock();
        let Some(frame) = state.frames.get_mut(&page) else {
            error!(target: "bmx::cache", page = page.0, "release of non-resident page");
            return;
        };
        if let Some(bytes) = data {
            frame.bytes = bytes;
            frame.dirty = true;
        }
        frame.pins = frame.pins.saturating_sub(1);
        if frame.pins == 0 {
            state.lru.push_back(page);
        }
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut written = 0_u64;
        for (page, frame) in &mut state.frames {
            if frame.dirty {
                self.dev.write_page(*page, &frame.bytes)?;
                frame.dirty = false;
                written += 1;
            }
        }
        state.stats.writebacks += written;
        drop(state);
        debug!(target: "bmx::cache", written, "flush");
        self.dev.sync()
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            pinned: state.frames.values().filter(|f| f.pins > 0).count(),
            ..state.stats
        }
    }
}

// ── Scoped acquisition ──────────────────────────────────────────────────────

/// A pinned page. Dropping the guard releases the page, handing the bytes
/// back to the cache only if they were borrowed mutably.
pub struct PageGuard<'a> {
    cache: &'a dyn PageCache,
    page: PageId,
    bytes: Vec<u8>,
    dirty: bool,
}

impl<'a> PageGuard<'a> {
    pub fn acquire(cache: &'a dyn PageCache, page: PageId, zero_init: bool) -> Result<Self> {
        let bytes = cache.pin(page, zero_init)?;
        Ok(Self {
            cache,
            page,
            bytes,
            dirty: false,
        })
    }

    /// Allocate a fresh page and acquire it zeroed.
    pub fn allocate(cache: &'a dyn PageCache) -> Result<Self> {
        let page = cache.allocate(1)?;
        Self::acquire(cache, page, true)
    }

    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access; the page is released dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.bytes
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page", &self.page)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        let data = self.dirty.then(|| std::mem::take(&mut self.bytes));
        self.cache.release(self.page, data);
    }
}
