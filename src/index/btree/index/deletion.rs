use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, Context};
use crate::index::btree::page::{InternalNode, TreeNode};
use crate::index::btree::serialization::{decode_header_page, decode_node};
use crate::storage::buffer::WritePageGuard;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let header = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = decode_header_page(header.data())?.root_page_id;
        drop(header);
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut ctx = Context::new(root_id);

        let mut page_id = root_id;
        loop {
            let guard = self.bpm.fetch_page_write(page_id)?;
            let node = decode_node::<K>(guard.data())?;
            let is_root = guard.page_id() == ctx.root_page_id;
            ctx.write_set.push_back(guard);
            if node.is_safe_for_delete(is_root) {
                ctx.release_ancestors();
            }
            match node {
                TreeNode::Internal(internal) => {
                    page_id = internal.child_for(key);
                }
                TreeNode::Leaf(mut leaf) => {
                    let Some(mut guard) = ctx.write_set.pop_back() else {
                        return Err(BTreeError::InvalidPageFormat);
                    };
                    let Ok(slot) = leaf.keys.binary_search(key) else {
                        return Ok(());
                    };
                    leaf.keys.remove(slot);
                    leaf.values.remove(slot);

                    // A root leaf may shrink to empty; anything else that
                    // drops below min size is rebalanced.
                    let underflow = guard.page_id() != ctx.root_page_id
                        && leaf.keys.len() < leaf.min_size();
                    self.write_node(&mut guard, &TreeNode::Leaf(leaf))?;
                    if underflow {
                        self.rebalance(&mut ctx, guard)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Fix an underflowed node by borrowing from or merging with a sibling,
    /// walking up through the retained ancestor guards as merges propagate.
    fn rebalance(&self, ctx: &mut Context, mut guard: WritePageGuard) -> Result<(), BTreeError> {
        loop {
            let Some(mut parent_guard) = ctx.write_set.pop_back() else {
                warn!("{}: underflow of page {} found no parent guard", self.name(), guard.page_id());
                return Ok(());
            };
            let mut parent = match decode_node::<K>(parent_guard.data())? {
                TreeNode::Internal(parent) => parent,
                TreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };
            let Some(idx) = parent.child_index_of(guard.page_id()) else {
                return Err(BTreeError::InvalidPageFormat);
            };

            let merged = if idx > 0 {
                self.rebalance_with_left(&mut parent, idx, guard)?
            } else {
                self.rebalance_with_right(&mut parent, guard)?
            };
            if !merged {
                return self.write_node(&mut parent_guard, &TreeNode::Internal(parent));
            }

            if parent_guard.page_id() == ctx.root_page_id {
                if parent.children.len() == 1 {
                    return self.collapse_root(parent_guard, parent);
                }
                return self.write_node(&mut parent_guard, &TreeNode::Internal(parent));
            }
            if parent.children.len() >= parent.min_size() {
                return self.write_node(&mut parent_guard, &TreeNode::Internal(parent));
            }
            self.write_node(&mut parent_guard, &TreeNode::Internal(parent))?;
            guard = parent_guard;
        }
    }

    /// Rebalance against the left sibling. Returns true when the current
    /// node was merged away (the parent already lost one child).
    fn rebalance_with_left(
        &self,
        parent: &mut InternalNode<K>,
        idx: usize,
        guard: WritePageGuard,
    ) -> Result<bool, BTreeError> {
        let left_id = parent.children[idx - 1];
        let self_id = guard.page_id();

        // Sibling latches are only ever taken left-to-right, the same order
        // forward iterators use: release the current guard, lock the left
        // sibling, then relock the current page. The parent stays latched,
        // so both children are stable across the gap.
        drop(guard);
        let mut left_guard = self.bpm.fetch_page_write(left_id)?;
        let mut guard = self.bpm.fetch_page_write(self_id)?;

        match (decode_node::<K>(left_guard.data())?, decode_node::<K>(guard.data())?) {
            (TreeNode::Leaf(mut left), TreeNode::Leaf(mut node)) => {
                if left.keys.len() > left.min_size() {
                    // Right-rotate the left sibling's last entry.
                    let (Some(key), Some(value)) = (left.keys.pop(), left.values.pop()) else {
                        return Err(BTreeError::InvalidPageFormat);
                    };
                    parent.keys[idx - 1] = key.clone();
                    node.keys.insert(0, key);
                    node.values.insert(0, value);
                    self.write_node(&mut left_guard, &TreeNode::Leaf(left))?;
                    self.write_node(&mut guard, &TreeNode::Leaf(node))?;
                    Ok(false)
                } else {
                    left.keys.append(&mut node.keys);
                    left.values.append(&mut node.values);
                    left.next_page_id = node.next_page_id;
                    parent.keys.remove(idx - 1);
                    parent.children.remove(idx);
                    self.write_node(&mut left_guard, &TreeNode::Leaf(left))?;
                    drop(guard);
                    self.bpm.delete_page(self_id)?;
                    Ok(true)
                }
            }
            (TreeNode::Internal(mut left), TreeNode::Internal(mut node)) => {
                if left.children.len() > left.min_size() {
                    // Right-rotate through the parent separator.
                    let (Some(moved_key), Some(moved_child)) = (left.keys.pop(), left.children.pop()) else {
                        return Err(BTreeError::InvalidPageFormat);
                    };
                    let separator = std::mem::replace(&mut parent.keys[idx - 1], moved_key);
                    node.keys.insert(0, separator);
                    node.children.insert(0, moved_child);
                    self.write_node(&mut left_guard, &TreeNode::Internal(left))?;
                    self.write_node(&mut guard, &TreeNode::Internal(node))?;
                    Ok(false)
                } else {
                    // The separator comes down to glue the two halves.
                    left.keys.push(parent.keys.remove(idx - 1));
                    left.keys.append(&mut node.keys);
                    left.children.append(&mut node.children);
                    parent.children.remove(idx);
                    self.write_node(&mut left_guard, &TreeNode::Internal(left))?;
                    drop(guard);
                    self.bpm.delete_page(self_id)?;
                    Ok(true)
                }
            }
            _ => Err(BTreeError::InvalidPageFormat),
        }
    }

    /// Rebalance the leftmost child against its right sibling.
    fn rebalance_with_right(
        &self,
        parent: &mut InternalNode<K>,
        mut guard: WritePageGuard,
    ) -> Result<bool, BTreeError> {
        let right_id = parent.children[1];
        let mut right_guard = self.bpm.fetch_page_write(right_id)?;

        match (decode_node::<K>(guard.data())?, decode_node::<K>(right_guard.data())?) {
            (TreeNode::Leaf(mut node), TreeNode::Leaf(mut right)) => {
                if right.keys.len() > right.min_size() {
                    // Left-rotate the right sibling's first entry.
                    node.keys.push(right.keys.remove(0));
                    node.values.push(right.values.remove(0));
                    parent.keys[0] = right.keys[0].clone();
                    self.write_node(&mut guard, &TreeNode::Leaf(node))?;
                    self.write_node(&mut right_guard, &TreeNode::Leaf(right))?;
                    Ok(false)
                } else {
                    node.keys.append(&mut right.keys);
                    node.values.append(&mut right.values);
                    node.next_page_id = right.next_page_id;
                    parent.keys.remove(0);
                    parent.children.remove(1);
                    self.write_node(&mut guard, &TreeNode::Leaf(node))?;
                    drop(right_guard);
                    self.bpm.delete_page(right_id)?;
                    Ok(true)
                }
            }
            (TreeNode::Internal(mut node), TreeNode::Internal(mut right)) => {
                if right.children.len() > right.min_size() {
                    let separator = std::mem::replace(&mut parent.keys[0], right.keys.remove(0));
                    node.keys.push(separator);
                    node.children.push(right.children.remove(0));
                    self.write_node(&mut guard, &TreeNode::Internal(node))?;
                    self.write_node(&mut right_guard, &TreeNode::Internal(right))?;
                    Ok(false)
                } else {
                    node.keys.push(parent.keys.remove(0));
                    node.keys.append(&mut right.keys);
                    node.children.append(&mut right.children);
                    parent.children.remove(1);
                    self.write_node(&mut guard, &TreeNode::Internal(node))?;
                    drop(right_guard);
                    self.bpm.delete_page(right_id)?;
                    Ok(true)
                }
            }
            _ => Err(BTreeError::InvalidPageFormat),
        }
    }

    /// A root internal node left with a single child collapses into that
    /// child in place, keeping the root page id stable.
    fn collapse_root(
        &self,
        mut root_guard: WritePageGuard,
        root: InternalNode<K>,
    ) -> Result<(), BTreeError> {
        let child_id = root.children[0];
        let child_guard = self.bpm.fetch_page_write(child_id)?;
        let child = decode_node::<K>(child_guard.data())?;
        self.write_node(&mut root_guard, &child)?;
        drop(child_guard);
        self.bpm.delete_page(child_id)?;
        Ok(())
    }
}
