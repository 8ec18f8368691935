use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{Page, PageId, PagePtr};
use crate::storage::buffer::manager::BufferPoolManager;

/// Scoped ownership of one pin on a buffer pool page.
///
/// Dropping the guard unpins the page with the guard's dirty flag. Guards
/// are move-only; the language's single-drop guarantee makes release
/// idempotent.
pub struct BasicPageGuard {
    bpm: Arc<BufferPoolManager>,
    page: PagePtr,
    page_id: PageId,
    is_dirty: bool,
}

impl BasicPageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, page: PagePtr, page_id: PageId) -> Self {
        Self {
            bpm,
            page,
            page_id,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The underlying page handle. Callers latch it themselves for access;
    /// a fresh page that no other thread can reach yet may be written
    /// through a short-lived borrow.
    pub fn page(&self) -> &PagePtr {
        &self.page
    }

    /// Record that the caller modified the page; the unpin on drop will
    /// carry the dirty flag.
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}

/// A pin plus a shared latch on the page data, both held until drop.
/// The latch is released before the pin.
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<ArcRwLockReadGuard<RawRwLock, Page>>,
}

impl ReadPageGuard {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        page_id: PageId,
        latch: ArcRwLockReadGuard<RawRwLock, Page>,
    ) -> Self {
        Self {
            bpm,
            page_id,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        let latch = self.latch.as_ref().expect("read latch released before drop");
        &latch.data
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.bpm.unpin_page(self.page_id, false);
    }
}

/// A pin plus an exclusive latch on the page data. Accessing the page
/// mutably marks the guard dirty; drop releases the latch, then unpins with
/// the dirty flag.
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    is_dirty: bool,
    latch: Option<ArcRwLockWriteGuard<RawRwLock, Page>>,
}

impl WritePageGuard {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        page_id: PageId,
        latch: ArcRwLockWriteGuard<RawRwLock, Page>,
    ) -> Self {
        Self {
            bpm,
            page_id,
            is_dirty: false,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        let latch = self.latch.as_ref().expect("write latch released before drop");
        &latch.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        let latch = self.latch.as_mut().expect("write latch released before drop");
        &mut latch.data
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}
