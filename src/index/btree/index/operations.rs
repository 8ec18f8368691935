use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, Context};
use crate::index::btree::page::{InternalNode, LeafNode, TreeNode};
use crate::index::btree::serialization::{decode_header_page, decode_node, encode_header_page};
use crate::storage::buffer::WritePageGuard;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/rid pair. Duplicate keys are rejected: the tree is left
    /// untouched and `Ok(false)` is returned.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut header = self.bpm.fetch_page_write(self.header_page_id)?;
        let mut hdr = decode_header_page(header.data())?;
        if hdr.root_page_id == INVALID_PAGE_ID {
            let (root_id, mut root_guard) = self.bpm.new_page_guarded()?;
            self.write_node_basic(&mut root_guard, &TreeNode::Leaf(LeafNode::new(self.leaf_max_size)))?;
            hdr.root_page_id = root_id;
            encode_header_page(&hdr, header.data_mut());
        }
        let mut ctx = Context::new(hdr.root_page_id);
        drop(header);

        let mut page_id = ctx.root_page_id;
        loop {
            let guard = self.bpm.fetch_page_write(page_id)?;
            let node = decode_node::<K>(guard.data())?;
            ctx.write_set.push_back(guard);
            if node.is_safe_for_insert() {
                ctx.release_ancestors();
            }
            match node {
                TreeNode::Internal(internal) => {
                    page_id = internal.child_for(&key);
                }
                TreeNode::Leaf(mut leaf) => {
                    let Some(mut guard) = ctx.write_set.pop_back() else {
                        return Err(BTreeError::InvalidPageFormat);
                    };
                    let slot = match leaf.keys.binary_search(&key) {
                        Ok(_) => return Ok(false),
                        Err(slot) => slot,
                    };
                    leaf.keys.insert(slot, key);
                    leaf.values.insert(slot, rid);

                    if leaf.keys.len() > leaf.max_size {
                        self.split_leaf(&mut ctx, guard, leaf)?;
                    } else {
                        self.write_node(&mut guard, &TreeNode::Leaf(leaf))?;
                    }
                    return Ok(true);
                }
            }
        }
    }

    /// Split an overflowing leaf, pushing the separator into the parent.
    fn split_leaf(
        &self,
        ctx: &mut Context,
        mut guard: WritePageGuard,
        mut leaf: LeafNode<K>,
    ) -> Result<(), BTreeError> {
        let mid = leaf.keys.len() / 2;

        if guard.page_id() == ctx.root_page_id {
            // Root split happens in place: both halves move to fresh pages
            // and the root page becomes an internal node with two children,
            // so the header page never needs to be re-latched.
            let (left_id, mut left_guard) = self.bpm.new_page_guarded()?;
            let (right_id, mut right_guard) = self.bpm.new_page_guarded()?;
            let right = LeafNode {
                max_size: leaf.max_size,
                next_page_id: leaf.next_page_id,
                keys: leaf.keys.split_off(mid),
                values: leaf.values.split_off(mid),
            };
            let separator = right.keys[0].clone();
            let left = LeafNode {
                max_size: leaf.max_size,
                next_page_id: right_id,
                keys: leaf.keys,
                values: leaf.values,
            };
            self.write_node_basic(&mut left_guard, &TreeNode::Leaf(left))?;
            self.write_node_basic(&mut right_guard, &TreeNode::Leaf(right))?;
            let root = InternalNode {
                max_size: self.internal_max_size,
                keys: vec![separator],
                children: vec![left_id, right_id],
            };
            return self.write_node(&mut guard, &TreeNode::Internal(root));
        }

        let (right_id, mut right_guard) = self.bpm.new_page_guarded()?;
        let right = LeafNode {
            max_size: leaf.max_size,
            next_page_id: leaf.next_page_id,
            keys: leaf.keys.split_off(mid),
            values: leaf.values.split_off(mid),
        };
        leaf.next_page_id = right_id;
        let separator = right.keys[0].clone();
        self.write_node(&mut guard, &TreeNode::Leaf(leaf))?;
        self.write_node_basic(&mut right_guard, &TreeNode::Leaf(right))?;

        let left_id = guard.page_id();
        drop(guard);
        drop(right_guard);
        self.insert_into_parent(ctx, left_id, separator, right_id)
    }

    /// Insert a (separator, right child) produced by a split into the parent
    /// of `child_id`, splitting upward as long as parents overflow.
    fn insert_into_parent(
        &self,
        ctx: &mut Context,
        child_id: PageId,
        separator: K,
        right_id: PageId,
    ) -> Result<(), BTreeError> {
        let Some(mut parent_guard) = ctx.write_set.pop_back() else {
            warn!("{}: split of page {} found no parent guard", self.name(), child_id);
            return Ok(());
        };
        let mut parent = match decode_node::<K>(parent_guard.data())? {
            TreeNode::Internal(parent) => parent,
            TreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
        };
        let Some(pos) = parent.child_index_of(child_id) else {
            return Err(BTreeError::InvalidPageFormat);
        };
        parent.keys.insert(pos, separator);
        parent.children.insert(pos + 1, right_id);

        if parent.children.len() <= parent.max_size {
            return self.write_node(&mut parent_guard, &TreeNode::Internal(parent));
        }

        // Internal split: the middle key moves up instead of being copied.
        let mid = parent.children.len() / 2;
        let right_children = parent.children.split_off(mid);
        let right_keys = parent.keys.split_off(mid);
        let Some(push_up) = parent.keys.pop() else {
            return Err(BTreeError::InvalidPageFormat);
        };
        let right_node = InternalNode {
            max_size: parent.max_size,
            keys: right_keys,
            children: right_children,
        };

        if parent_guard.page_id() == ctx.root_page_id {
            let (left_id, mut left_guard) = self.bpm.new_page_guarded()?;
            let (new_right_id, mut right_guard) = self.bpm.new_page_guarded()?;
            self.write_node_basic(&mut left_guard, &TreeNode::Internal(parent))?;
            self.write_node_basic(&mut right_guard, &TreeNode::Internal(right_node))?;
            let root = InternalNode {
                max_size: self.internal_max_size,
                keys: vec![push_up],
                children: vec![left_id, new_right_id],
            };
            return self.write_node(&mut parent_guard, &TreeNode::Internal(root));
        }

        let (new_right_id, mut right_guard) = self.bpm.new_page_guarded()?;
        self.write_node_basic(&mut right_guard, &TreeNode::Internal(right_node))?;
        self.write_node(&mut parent_guard, &TreeNode::Internal(parent))?;

        let left_id = parent_guard.page_id();
        drop(parent_guard);
        drop(right_guard);
        self.insert_into_parent(ctx, left_id, push_up, new_right_id)
    }
}
