use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Per-frame metadata. Mutated only under the pool mutex; the page bytes
/// themselves are guarded by the frame's own `RwLock` latch.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Everything the pool mutex protects: the frame directory, the free list,
/// the replacer, and per-frame metadata.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    meta: Vec<FrameMeta>,
}

/// A bounded cache of fixed-size pages.
///
/// Frames are allocated once at construction and reused forever. Page data
/// latches (the per-frame `RwLock`s) are acquired outside the pool mutex, so
/// latch contention never blocks unrelated pool operations.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
    next_page_id: AtomicU32,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut meta = Vec::with_capacity(pool_size);

        for frame_id in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(frame_id);
            meta.push(FrameMeta::new());
        }

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                meta,
            }),
            disk_manager,
            next_page_id: AtomicU32::new(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id and pin it into a frame with zeroed bytes.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        state.page_table.insert(page_id, frame_id);

        let meta = &mut state.meta[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        {
            let mut page = self.frames[frame_id].write();
            page.data.fill(0);
            page.page_id = page_id;
        }

        Ok((self.frames[frame_id].clone(), page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident. The caller
    /// owns a pin and must `unpin_page` when done.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID || page_id >= self.next_page_id.load(Ordering::SeqCst) {
            return Err(BufferPoolError::PageNotFound(page_id));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.meta[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(self.frames[frame_id].clone());
        }

        let frame_id = self.acquire_frame(&mut state)?;
        state.page_table.insert(page_id, frame_id);

        let meta = &mut state.meta[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        {
            let mut page = self.frames[frame_id].write();
            page.page_id = page_id;
            self.disk_manager.read_page(page_id, &mut page.data)?;
        }

        Ok(self.frames[frame_id].clone())
    }

    /// Drop one pin on a page, ORing in the caller's dirty flag. When the
    /// pin count reaches zero the frame becomes evictable. Returns false if
    /// the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut state.meta[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        if meta.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident page to disk and clear its dirty flag. Returns false
    /// if the page is not resident. The frame latch is taken outside the
    /// pool mutex; a latch holder may be blocked on the pool mutex itself.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let frame = {
            let state = self.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            self.frames[frame_id].clone()
        };

        {
            let page = frame.read();
            if page.page_id != page_id {
                // Evicted and reused between the lookup and the latch.
                return Ok(false);
            }
            self.disk_manager.write_page(page_id, &page.data)?;
        }

        let mut state = self.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.meta[frame_id].is_dirty = false;
        }
        Ok(true)
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let resident: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().copied().collect()
        };
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Remove a page from the pool and return its frame to the free list.
    /// Returns Ok(false) if the page is still pinned; deleting a page that is
    /// not resident succeeds trivially.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.meta[frame_id].pin_count > 0 {
            return Ok(false);
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);
        state.meta[frame_id] = FrameMeta::new();
        state.free_list.push_back(frame_id);
        self.frames[frame_id].write().reset();
        Ok(true)
    }

    /// Fetch a page and wrap the pin in a `BasicPageGuard`.
    pub fn fetch_page_basic(self: &Arc<Self>, page_id: PageId) -> Result<BasicPageGuard, BufferPoolError> {
        let page = self.fetch_page(page_id)?;
        Ok(BasicPageGuard::new(self.clone(), page, page_id))
    }

    /// Fetch a page with a read latch held for the guard's lifetime.
    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> Result<ReadPageGuard, BufferPoolError> {
        let page = self.fetch_page(page_id)?;
        let latch = page.read_arc();
        Ok(ReadPageGuard::new(self.clone(), page_id, latch))
    }

    /// Fetch a page with an exclusive latch held for the guard's lifetime.
    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> Result<WritePageGuard, BufferPoolError> {
        let page = self.fetch_page(page_id)?;
        let latch = page.write_arc();
        Ok(WritePageGuard::new(self.clone(), page_id, latch))
    }

    /// Allocate a new page and wrap the pin in a `BasicPageGuard`.
    pub fn new_page_guarded(self: &Arc<Self>) -> Result<(PageId, BasicPageGuard), BufferPoolError> {
        let (page, page_id) = self.new_page()?;
        Ok((page_id, BasicPageGuard::new(self.clone(), page, page_id)))
    }

    /// Find a reusable frame: from the free list if possible, otherwise by
    /// evicting an unpinned victim (flushing it first when dirty). The
    /// victim's directory entry is removed before the frame is handed out.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = state.replacer.evict() else {
            return Err(BufferPoolError::BufferPoolFull);
        };

        let old_page_id = state.meta[frame_id].page_id;
        debug_assert_eq!(state.meta[frame_id].pin_count, 0);
        debug!("evicting page {} from frame {}", old_page_id, frame_id);

        if old_page_id != INVALID_PAGE_ID {
            state.page_table.remove(&old_page_id);
            if state.meta[frame_id].is_dirty {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(old_page_id, &page.data)?;
            }
        }
        state.meta[frame_id] = FrameMeta::new();
        Ok(frame_id)
    }

    /// Number of frames currently holding a pinned page. Zero means every
    /// outstanding guard has been dropped.
    pub fn pinned_frame_count(&self) -> usize {
        let state = self.state.lock();
        state.meta.iter().filter(|m| m.pin_count > 0).count()
    }

    #[cfg(test)]
    pub(crate) fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.meta[frame_id].pin_count)
    }
}
