use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::BTreeIndex;
use crate::index::btree::page::{LeafNode, TreeNode};
use crate::index::btree::serialization::{decode_header_page, decode_node};
use crate::storage::buffer::{BufferPoolManager, ReadPageGuard};

/// Forward iterator over the leaf chain.
///
/// The iterator pins and read-latches one leaf at a time; stepping to the
/// next leaf releases the current guard before acquiring the next, so it
/// always moves left-to-right like every other sibling access in the tree.
pub struct TreeIterator<K> {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    leaf: Option<LeafNode<K>>,
    index: usize,
}

impl<K> TreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    pub(crate) fn at(
        bpm: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        leaf: LeafNode<K>,
        index: usize,
    ) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            leaf: Some(leaf),
            index,
        }
    }

    /// The exhausted sentinel iterator.
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            leaf: None,
            index: 0,
        }
    }
}

impl<K> Iterator for TreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.keys.len() {
                let item = (leaf.keys[self.index].clone(), leaf.values[self.index]);
                self.index += 1;
                return Some(item);
            }

            let next_id = leaf.next_page_id;
            self.leaf = None;
            self.guard = None;
            if next_id == INVALID_PAGE_ID {
                return None;
            }
            match self.bpm.fetch_page_read(next_id) {
                Ok(guard) => match decode_node::<K>(guard.data()) {
                    Ok(TreeNode::Leaf(leaf)) => {
                        self.leaf = Some(leaf);
                        self.guard = Some(guard);
                        self.index = 0;
                    }
                    Ok(TreeNode::Internal(_)) | Err(_) => {
                        warn!("leaf chain points at page {} which is not a leaf", next_id);
                        return None;
                    }
                },
                Err(e) => {
                    warn!("scan failed to fetch next leaf {}: {}", next_id, e);
                    return None;
                }
            }
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate the whole tree in ascending key order.
    pub fn iter(&self) -> Result<TreeIterator<K>, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = decode_header_page(header.data())?.root_page_id;
        drop(header);
        if root_id == INVALID_PAGE_ID {
            return Ok(TreeIterator::end(self.bpm.clone()));
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        loop {
            match decode_node::<K>(guard.data())? {
                TreeNode::Leaf(leaf) => {
                    return Ok(TreeIterator::at(self.bpm.clone(), guard, leaf, 0));
                }
                TreeNode::Internal(node) => {
                    guard = self.bpm.fetch_page_read(node.children[0])?;
                }
            }
        }
    }

    /// Iterate starting at exactly `key`. If the key is not present the
    /// iterator is immediately exhausted (this positions, it does not seek
    /// to a lower bound).
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = decode_header_page(header.data())?.root_page_id;
        drop(header);
        if root_id == INVALID_PAGE_ID {
            return Ok(TreeIterator::end(self.bpm.clone()));
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        loop {
            match decode_node::<K>(guard.data())? {
                TreeNode::Leaf(leaf) => {
                    return match leaf.keys.binary_search(key) {
                        Ok(index) => Ok(TreeIterator::at(self.bpm.clone(), guard, leaf, index)),
                        Err(_) => Ok(TreeIterator::end(self.bpm.clone())),
                    };
                }
                TreeNode::Internal(node) => {
                    guard = self.bpm.fetch_page_read(node.child_for(key))?;
                }
            }
        }
    }
}
