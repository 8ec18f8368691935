use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::{HeaderNode, TreeNode};
use crate::index::btree::serialization::{
    decode_header_page, decode_node, encode_header_page, encode_node,
};
use crate::storage::buffer::{BasicPageGuard, BufferPoolManager, WritePageGuard};

pub mod deletion;
pub mod operations;
pub mod range_scan;

/// A concurrent, unique-key B+Tree index on top of the buffer pool.
///
/// Lookups couple read latches down the tree; inserts and deletes descend
/// with write guards on a context stack, releasing every ancestor as soon as
/// the current node is known to be safe. Structure changes that would move
/// the root are done in place on the root's page, so the header page never
/// has to stay latched for a whole descent.
pub struct BTreeIndex<K> {
    name: String,
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _phantom: PhantomData<K>,
}

/// Write guards collected on the way down, oldest first. Ancestors still on
/// the stack are exactly the nodes a split or merge may have to touch.
pub(crate) struct Context {
    pub root_page_id: PageId,
    pub write_set: VecDeque<WritePageGuard>,
}

impl Context {
    pub fn new(root_page_id: PageId) -> Self {
        Self {
            root_page_id,
            write_set: VecDeque::new(),
        }
    }

    /// Drop every guard above the current node.
    pub fn release_ancestors(&mut self) {
        while self.write_set.len() > 1 {
            self.write_set.pop_front();
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Attach an index to an existing header page, initializing it to the
    /// empty tree. `leaf_max_size` and `internal_max_size` must be at least 3.
    pub fn new(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        debug_assert!(leaf_max_size >= 3 && internal_max_size >= 3);
        let mut header = bpm.fetch_page_write(header_page_id)?;
        encode_header_page(
            &HeaderNode {
                root_page_id: INVALID_PAGE_ID,
            },
            header.data_mut(),
        );
        drop(header);

        Ok(Self {
            name: name.into(),
            header_page_id,
            bpm,
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Allocate a fresh header page and build an index on it.
    pub fn create(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let (header_page_id, guard) = bpm.new_page_guarded()?;
        drop(guard);
        Self::new(name, header_page_id, bpm, leaf_max_size, internal_max_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current root page id; `INVALID_PAGE_ID` for an empty tree.
    pub fn root_page_id(&self) -> Result<PageId, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(decode_header_page(header.data())?.root_page_id)
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = decode_header_page(header.data())?.root_page_id;
        drop(header);
        if root_id == INVALID_PAGE_ID {
            return Ok(true);
        }
        let root = self.bpm.fetch_page_read(root_id)?;
        match decode_node::<K>(root.data())? {
            TreeNode::Leaf(leaf) => Ok(leaf.keys.is_empty()),
            TreeNode::Internal(_) => Ok(false),
        }
    }

    /// Point lookup. Couples read latches parent-to-child on the way down.
    pub fn get(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = decode_header_page(header.data())?.root_page_id;
        drop(header);
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        loop {
            match decode_node::<K>(guard.data())? {
                TreeNode::Leaf(leaf) => return Ok(leaf.lookup(key)),
                TreeNode::Internal(node) => {
                    // The child guard is acquired before the parent drops.
                    guard = self.bpm.fetch_page_read(node.child_for(key))?;
                }
            }
        }
    }

    pub(crate) fn write_node(
        &self,
        guard: &mut WritePageGuard,
        node: &TreeNode<K>,
    ) -> Result<(), BTreeError> {
        encode_node(node, guard.data_mut())
    }

    /// Initialize a freshly allocated page through its basic guard. The page
    /// is not reachable from the tree yet, so no latch is needed.
    pub(crate) fn write_node_basic(
        &self,
        guard: &mut BasicPageGuard,
        node: &TreeNode<K>,
    ) -> Result<(), BTreeError> {
        {
            let mut page = guard.page().write();
            encode_node(node, &mut page.data)?;
        }
        guard.mark_dirty();
        Ok(())
    }
}
