use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel for "no page". Real page ids start at 1.
pub const INVALID_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Table object ID type
pub type TableOid = u32;

/// Record ID: the physical address of a tuple inside a table heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot_num)
    }
}

/// Page structure: a fixed-size byte image plus the id it currently holds.
#[derive(Debug)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a page; the `RwLock` is the page's data latch.
pub type PagePtr = Arc<RwLock<Page>>;
