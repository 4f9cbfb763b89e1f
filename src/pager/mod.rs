//! Paged file storage.
//!
//! A [`Pager`] turns one backing file into a sequence of fixed-size pages
//! with stable ids. Page 0 is the file meta page holding the free-list root
//! and the allocation high-water mark. Reads go through the shared
//! [`PageCache`]; writes land in the cache as sealed dirty frames and reach
//! disk on [`Pager::sync`] or on eviction write-back. When memory mapping is
//! enabled, cache misses are served by slicing a read-only mapping instead
//! of a read syscall; file growth leaves the mapping stale and reads past it
//! fall back to positioned reads until the next sync remaps.
#![allow(unsafe_code)]

pub mod cache;
pub mod io;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{CorruptionKind, Result, VettoreError};
use crate::types::page::{seal_page, verify_page, PAGE_FLAG_CHAIN_HEAD};
use crate::types::{FileId, PageHeader, PageId, PageKind, NULL_PAGE, PAGE_HDR_LEN};
use cache::{Frame, PageCache, PinnedFrame, WriteBack};
use io::FileHandle;

/// Default page size when a collection spec does not override it.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Pages added per file extension, amortizing `ftruncate` calls.
pub const DEFAULT_GROWTH_CHUNK: u64 = 64;

// Meta payload: u32 page_size | u64 free_head | u64 next_page
// | u64 generation | u64 free_len
const META_PAYLOAD_LEN: usize = 36;

/// Creation/open options for one paged file.
#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    pub page_size: u32,
    pub use_mmap: bool,
    pub growth_chunk: u64,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            use_mmap: true,
            growth_chunk: DEFAULT_GROWTH_CHUNK,
        }
    }
}

/// A verified page image: decoded header plus a copy of the payload bytes.
#[derive(Debug, Clone)]
pub struct PageData {
    pub header: PageHeader,
    pub payload: Vec<u8>,
}

struct AllocState {
    free_head: PageId,
    free_len: u64,
    next_page: u64,
    generation: u64,
}

struct PagerSink {
    file: Arc<FileHandle>,
    page_size: u64,
}

impl WriteBack for PagerSink {
    fn write_back(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.file.write_all_at(page_id.0 * self.page_size, data)
    }
}

pub struct Pager {
    file_id: FileId,
    path: PathBuf,
    file: Arc<FileHandle>,
    _sink: Arc<PagerSink>,
    cache: Arc<PageCache>,
    page_size: usize,
    growth_chunk: u64,
    use_mmap: bool,
    mmap: RwLock<Option<Mmap>>,
    file_pages: AtomicU64,
    state: Mutex<AllocState>,
    dirty: Mutex<BTreeSet<PageId>>,
    meta_dirty: AtomicBool,
}

impl Pager {
    /// Creates a fresh paged file with an empty free list.
    pub fn create(
        path: impl AsRef<Path>,
        file_id: FileId,
        cache: Arc<PageCache>,
        opts: PagerOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Arc::new(FileHandle::open_rw(&path)?);
        if file.len()? != 0 {
            return Err(VettoreError::AlreadyExists("paged file"));
        }
        let page_size = opts.page_size as usize;
        let mut meta = vec![0u8; page_size];
        encode_meta(&mut meta, opts.page_size, NULL_PAGE, 1, 0, 0)?;
        file.write_all_at(0, &meta)?;
        file.sync_data()?;
        Self::finish_open(path, file, file_id, cache, opts, NULL_PAGE, 0, 1, 0)
    }

    /// Opens an existing paged file, validating its meta page.
    pub fn open(
        path: impl AsRef<Path>,
        file_id: FileId,
        cache: Arc<PageCache>,
        opts: PagerOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Arc::new(FileHandle::open_rw(&path)?);
        let len = file.len()?;
        let page_size = opts.page_size as usize;
        if len < page_size as u64 || len % page_size as u64 != 0 {
            return Err(VettoreError::corruption(PageId(0), CorruptionKind::Truncated));
        }
        let mut meta = vec![0u8; page_size];
        file.read_exact_at(0, &mut meta)?;
        let header = verify_page(&meta, PageId(0))?;
        if header.kind != PageKind::Meta {
            return Err(VettoreError::corruption(PageId(0), CorruptionKind::BadHeader));
        }
        let (stored_page_size, free_head, next_page, generation, free_len) =
            decode_meta(&meta)?;
        if stored_page_size != opts.page_size {
            return Err(VettoreError::corruption(PageId(0), CorruptionKind::BadHeader));
        }
        Self::finish_open(
            path, file, file_id, cache, opts, free_head, free_len, next_page, generation,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_open(
        path: PathBuf,
        file: Arc<FileHandle>,
        file_id: FileId,
        cache: Arc<PageCache>,
        opts: PagerOptions,
        free_head: PageId,
        free_len: u64,
        next_page: u64,
        generation: u64,
    ) -> Result<Self> {
        let sink = Arc::new(PagerSink {
            file: Arc::clone(&file),
            page_size: opts.page_size as u64,
        });
        cache.register_file(file_id, Arc::downgrade(&sink) as Weak<dyn WriteBack>);
        let file_pages = file.len()? / opts.page_size as u64;
        let pager = Self {
            file_id,
            path,
            file,
            _sink: sink,
            cache,
            page_size: opts.page_size as usize,
            growth_chunk: opts.growth_chunk.max(1),
            use_mmap: opts.use_mmap,
            mmap: RwLock::new(None),
            file_pages: AtomicU64::new(file_pages),
            state: Mutex::new(AllocState {
                free_head,
                free_len,
                next_page,
                generation,
            }),
            dirty: Mutex::new(BTreeSet::new()),
            meta_dirty: AtomicBool::new(false),
        };
        pager.remap();
        Ok(pager)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Payload bytes one page can carry.
    pub fn payload_capacity(&self) -> usize {
        self.page_size - PAGE_HDR_LEN
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().next_page
    }

    pub fn free_page_count(&self) -> u64 {
        self.state.lock().free_len
    }

    fn remap(&self) {
        if !self.use_mmap {
            return;
        }
        // Safety: the mapping is read-only and the file is only mutated by
        // this process through positioned writes, which the OS keeps
        // coherent with the mapping on the platforms we support.
        match unsafe { Mmap::map(self.file.raw()) } {
            Ok(map) => *self.mmap.write() = Some(map),
            Err(err) => {
                warn!(file = %self.path.display(), %err, "mmap failed, using read syscalls");
                *self.mmap.write() = None;
            }
        }
    }

    fn load_frame(&self, page_id: PageId) -> Result<Arc<Frame>> {
        let key = (self.file_id, page_id);
        if let Some(frame) = self.cache.get(key) {
            return Ok(frame);
        }
        if page_id.0 >= self.file_pages.load(Ordering::Acquire) {
            return Err(VettoreError::corruption(page_id, CorruptionKind::Truncated));
        }
        let offset = page_id.0 * self.page_size as u64;
        let mut buf = vec![0u8; self.page_size];
        let mut from_map = false;
        if self.use_mmap {
            let map = self.mmap.read();
            if let Some(map) = map.as_ref() {
                let end = offset as usize + self.page_size;
                if end <= map.len() {
                    buf.copy_from_slice(&map[offset as usize..end]);
                    from_map = true;
                }
            }
        }
        if !from_map {
            self.file.read_exact_at(offset, &mut buf)?;
        }
        trace!(page = page_id.0, mmap = from_map, "page miss");
        let frame = Frame::new(buf);
        self.cache.insert(key, Arc::clone(&frame))?;
        Ok(frame)
    }

    /// Reads and validates one page, returning its header and payload copy.
    pub fn read(&self, page_id: PageId) -> Result<PageData> {
        let frame = self.load_frame(page_id)?;
        let pinned = PinnedFrame::new(frame);
        let data = pinned.frame().read();
        let header = verify_page(&data, page_id)?;
        let payload =
            data[PAGE_HDR_LEN..PAGE_HDR_LEN + header.payload_len as usize].to_vec();
        Ok(PageData { header, payload })
    }

    /// Reads one page without header or checksum validation. Open-time scans
    /// use this to stay lenient in the face of damaged pages.
    pub fn read_raw(&self, page_id: PageId) -> Result<Vec<u8>> {
        let frame = self.load_frame(page_id)?;
        let pinned = PinnedFrame::new(frame);
        let data = pinned.frame().read();
        Ok(data.clone())
    }

    /// Seals `payload` into `page_id` and queues it as dirty. Nothing is
    /// written to disk until sync or eviction.
    pub fn write(
        &self,
        page_id: PageId,
        kind: PageKind,
        flags: u8,
        next_page: PageId,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > self.payload_capacity() {
            return Err(VettoreError::corruption(page_id, CorruptionKind::BadState));
        }
        let mut buf = vec![0u8; self.page_size];
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + payload.len()].copy_from_slice(payload);
        let mut header = PageHeader::new(kind);
        header.flags = flags;
        header.next_page = next_page;
        header.payload_len = payload.len() as u32;
        seal_page(&mut buf, header)?;
        let frame = Frame::new(buf);
        frame.mark_dirty();
        self.cache.insert((self.file_id, page_id), frame)?;
        self.dirty.lock().insert(page_id);
        Ok(())
    }

    /// Returns a page id to use, preferring the free list and growing the
    /// file in fixed chunks when the list is empty.
    pub fn allocate(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if state.free_head != NULL_PAGE {
            let id = state.free_head;
            let page = self.read(id)?;
            if page.header.kind != PageKind::Free {
                return Err(VettoreError::corruption(id, CorruptionKind::BadState));
            }
            state.free_head = page.header.next_page;
            state.free_len = state.free_len.saturating_sub(1);
            self.meta_dirty.store(true, Ordering::Release);
            trace!(page = id.0, "allocated from free list");
            return Ok(id);
        }
        if state.next_page >= self.file_pages.load(Ordering::Acquire) {
            let grown = self.file_pages.load(Ordering::Acquire) + self.growth_chunk;
            self.file.set_len(grown * self.page_size as u64)?;
            self.file_pages.store(grown, Ordering::Release);
            debug!(file = %self.path.display(), pages = grown, "extended file");
        }
        let id = PageId(state.next_page);
        state.next_page += 1;
        self.meta_dirty.store(true, Ordering::Release);
        Ok(id)
    }

    /// Links `page_id` onto the free list for reuse.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        self.write(page_id, PageKind::Free, 0, state.free_head, &[])?;
        state.free_head = page_id;
        state.free_len += 1;
        self.meta_dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes `payload` across a freshly allocated page chain; returns the
    /// head page id. Single-page payloads produce a one-page chain.
    pub fn write_chain(&self, kind: PageKind, payload: &[u8]) -> Result<PageId> {
        let chunk = self.payload_capacity();
        let mut parts: Vec<&[u8]> = payload.chunks(chunk).collect();
        if parts.is_empty() {
            parts.push(&[]);
        }
        let ids: Vec<PageId> = (0..parts.len())
            .map(|_| self.allocate())
            .collect::<Result<_>>()?;
        for (index, part) in parts.iter().enumerate() {
            let next = ids.get(index + 1).copied().unwrap_or(NULL_PAGE);
            let flags = if index == 0 { PAGE_FLAG_CHAIN_HEAD } else { 0 };
            self.write(ids[index], kind, flags, next, part)?;
        }
        Ok(ids[0])
    }

    /// Rewrites an existing chain in place with a payload of the same
    /// length, preserving page ids, flags, and links.
    pub fn rewrite_chain(&self, head: PageId, payload: &[u8]) -> Result<()> {
        let chunk = self.payload_capacity();
        let mut parts: Vec<&[u8]> = payload.chunks(chunk).collect();
        if parts.is_empty() {
            parts.push(&[]);
        }
        let mut current = head;
        for (index, part) in parts.iter().enumerate() {
            if current == NULL_PAGE {
                return Err(VettoreError::corruption(head, CorruptionKind::BadState));
            }
            let page = self.read(current)?;
            let wants_next = index + 1 < parts.len();
            if wants_next != (page.header.next_page != NULL_PAGE) {
                return Err(VettoreError::corruption(current, CorruptionKind::BadState));
            }
            self.write(
                current,
                page.header.kind,
                page.header.flags,
                page.header.next_page,
                part,
            )?;
            current = page.header.next_page;
        }
        Ok(())
    }

    /// Reads a full chain starting at `head`, validating every page.
    pub fn read_chain(&self, head: PageId) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut current = head;
        let mut hops = 0u64;
        let limit = self.file_pages.load(Ordering::Acquire);
        while current != NULL_PAGE {
            if hops > limit {
                return Err(VettoreError::corruption(head, CorruptionKind::BadState));
            }
            let page = self.read(current)?;
            payload.extend_from_slice(&page.payload);
            current = page.header.next_page;
            hops += 1;
        }
        Ok(payload)
    }

    /// Frees every page of the chain rooted at `head`.
    pub fn free_chain(&self, head: PageId) -> Result<()> {
        let mut ids = Vec::new();
        let mut current = head;
        let limit = self.file_pages.load(Ordering::Acquire);
        while current != NULL_PAGE {
            if ids.len() as u64 > limit {
                return Err(VettoreError::corruption(head, CorruptionKind::BadState));
            }
            let page = self.read(current)?;
            ids.push(current);
            current = page.header.next_page;
        }
        for id in ids {
            self.free(id)?;
        }
        Ok(())
    }

    /// Flushes every dirty page in ascending id order, rewrites the meta
    /// page, and issues a durability barrier.
    pub fn sync(&self) -> Result<()> {
        let pages: Vec<PageId> = self.dirty.lock().iter().copied().collect();
        let had_meta = self.meta_dirty.swap(false, Ordering::AcqRel);
        if pages.is_empty() && !had_meta {
            return Ok(());
        }
        if let Err(err) = self.sync_inner(&pages) {
            self.meta_dirty.store(true, Ordering::Release);
            return Err(err);
        }
        debug!(file = %self.path.display(), pages = pages.len(), "synced");
        Ok(())
    }

    fn sync_inner(&self, pages: &[PageId]) -> Result<()> {
        for page_id in pages {
            if let Some(frame) = self.cache.get((self.file_id, *page_id)) {
                let pinned = PinnedFrame::new(frame);
                let data = pinned.frame().read();
                self.file
                    .write_all_at(page_id.0 * self.page_size as u64, &data)?;
                pinned.frame().clear_dirty();
            }
            // Frames missing from the cache were written back at eviction.
        }
        {
            let mut state = self.state.lock();
            state.generation += 1;
            let mut meta = vec![0u8; self.page_size];
            encode_meta(
                &mut meta,
                self.page_size as u32,
                state.free_head,
                state.next_page,
                state.generation,
                state.free_len,
            )?;
            self.file.write_all_at(0, &meta)?;
        }
        self.file.sync_data()?;
        {
            let mut dirty = self.dirty.lock();
            for page_id in pages {
                dirty.remove(page_id);
            }
        }
        self.remap();
        Ok(())
    }

    /// Walks every allocated page and validates headers and checksums.
    /// Returns the number of pages checked, or the first corruption found.
    pub fn verify(&self) -> Result<u64> {
        let next_page = self.state.lock().next_page;
        for page_no in 1..next_page {
            let page_id = PageId(page_no);
            let raw = self.read_raw(page_id)?;
            verify_page(&raw, page_id)?;
        }
        Ok(next_page.saturating_sub(1))
    }

    /// Writes a sidecar checkpoint of the free list next to the data file.
    /// Loaders compare its generation against the meta page and fall back to
    /// walking the on-page chain on mismatch.
    pub fn write_free_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let (generation, ids) = {
            let state = self.state.lock();
            let mut ids = Vec::with_capacity(state.free_len as usize);
            let mut current = state.free_head;
            while current != NULL_PAGE {
                let page = self.read(current)?;
                ids.push(current.0);
                current = page.header.next_page;
            }
            (state.generation, ids)
        };
        let mut buf = Vec::with_capacity(12 + ids.len() * 8);
        buf.extend_from_slice(&generation.to_le_bytes());
        buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, path.as_ref())?;
        Ok(())
    }

    /// Drops this pager's pages from the shared cache, flushing dirty ones.
    pub fn release_cache(&self, flush_dirty: bool) -> Result<()> {
        self.cache.evict_file(self.file_id, flush_dirty)
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(err) = self.cache.evict_file(self.file_id, true) {
            warn!(file = %self.path.display(), %err, "flush on drop failed");
        }
        self.cache.unregister_file(self.file_id);
    }
}

fn encode_meta(
    buf: &mut [u8],
    page_size: u32,
    free_head: PageId,
    next_page: u64,
    generation: u64,
    free_len: u64,
) -> Result<()> {
    let mut payload = [0u8; META_PAYLOAD_LEN];
    payload[0..4].copy_from_slice(&page_size.to_le_bytes());
    payload[4..12].copy_from_slice(&free_head.0.to_le_bytes());
    payload[12..20].copy_from_slice(&next_page.to_le_bytes());
    payload[20..28].copy_from_slice(&generation.to_le_bytes());
    payload[28..36].copy_from_slice(&free_len.to_le_bytes());
    buf[PAGE_HDR_LEN..PAGE_HDR_LEN + META_PAYLOAD_LEN].copy_from_slice(&payload);
    let mut header = PageHeader::new(PageKind::Meta);
    header.payload_len = META_PAYLOAD_LEN as u32;
    seal_page(buf, header)
}

fn decode_meta(buf: &[u8]) -> Result<(u32, PageId, u64, u64, u64)> {
    let payload = &buf[PAGE_HDR_LEN..PAGE_HDR_LEN + META_PAYLOAD_LEN];
    let page_size = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
    let free_head = PageId(u64::from_le_bytes(
        payload[4..12].try_into().expect("8 bytes"),
    ));
    let next_page = u64::from_le_bytes(payload[12..20].try_into().expect("8 bytes"));
    let generation = u64::from_le_bytes(payload[20..28].try_into().expect("8 bytes"));
    let free_len = u64::from_le_bytes(payload[28..36].try_into().expect("8 bytes"));
    Ok((page_size, free_head, next_page, generation, free_len))
}
