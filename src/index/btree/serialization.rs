//! On-page layout of B+Tree nodes.
//!
//! Every tree page starts with a little-endian fixed header:
//!
//! ```text
//! byte 0      page type (1 = header, 2 = internal, 3 = leaf)
//! bytes 1..3  size (u16): entry count for leaves, child count for internals
//! bytes 3..5  max size (u16)
//! bytes 5..9  next leaf page id (u32, leaves only)
//! ```
//!
//! Keys follow as length-prefixed bincode; values are raw u32 pairs for leaf
//! rids, raw u32s for internal child page ids. The header page only stores
//! the root page id.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::{HeaderNode, InternalNode, LeafNode, TreeNode};

const PAGE_TYPE_HEADER: u8 = 1;
const PAGE_TYPE_INTERNAL: u8 = 2;
const PAGE_TYPE_LEAF: u8 = 3;

const NODE_HEADER_SIZE: usize = 9;

pub fn encode_header_page(header: &HeaderNode, data: &mut [u8]) {
    data.fill(0);
    data[0] = PAGE_TYPE_HEADER;
    LittleEndian::write_u32(&mut data[1..5], header.root_page_id);
}

pub fn decode_header_page(data: &[u8]) -> Result<HeaderNode, BTreeError> {
    if data[0] != PAGE_TYPE_HEADER {
        return Err(BTreeError::InvalidPageFormat);
    }
    Ok(HeaderNode {
        root_page_id: LittleEndian::read_u32(&data[1..5]),
    })
}

/// Serialize a tree node into a page image.
pub fn encode_node<K>(node: &TreeNode<K>, data: &mut [u8]) -> Result<(), BTreeError>
where
    K: Serialize,
{
    data.fill(0);
    match node {
        TreeNode::Leaf(leaf) => {
            data[0] = PAGE_TYPE_LEAF;
            LittleEndian::write_u16(&mut data[1..3], leaf.keys.len() as u16);
            LittleEndian::write_u16(&mut data[3..5], leaf.max_size as u16);
            LittleEndian::write_u32(&mut data[5..9], leaf.next_page_id);

            let mut offset = write_keys(&leaf.keys, data, NODE_HEADER_SIZE)?;
            for rid in &leaf.values {
                if offset + 8 > data.len() {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut data[offset..offset + 4], rid.page_id);
                LittleEndian::write_u32(&mut data[offset + 4..offset + 8], rid.slot_num);
                offset += 8;
            }
        }
        TreeNode::Internal(internal) => {
            data[0] = PAGE_TYPE_INTERNAL;
            LittleEndian::write_u16(&mut data[1..3], internal.children.len() as u16);
            LittleEndian::write_u16(&mut data[3..5], internal.max_size as u16);
            LittleEndian::write_u32(&mut data[5..9], INVALID_PAGE_ID);

            let mut offset = write_keys(&internal.keys, data, NODE_HEADER_SIZE)?;
            for child in &internal.children {
                if offset + 4 > data.len() {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut data[offset..offset + 4], *child);
                offset += 4;
            }
        }
    }
    Ok(())
}

/// Deserialize a tree node from a page image.
pub fn decode_node<K>(data: &[u8]) -> Result<TreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de>,
{
    let page_type = data[0];
    let size = LittleEndian::read_u16(&data[1..3]) as usize;
    let max_size = LittleEndian::read_u16(&data[3..5]) as usize;
    let next_page_id = LittleEndian::read_u32(&data[5..9]);

    match page_type {
        PAGE_TYPE_LEAF => {
            let (keys, mut offset) = read_keys(data, NODE_HEADER_SIZE, size)?;
            let mut values = Vec::with_capacity(size);
            for _ in 0..size {
                let page_id = LittleEndian::read_u32(&data[offset..offset + 4]);
                let slot_num = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
                values.push(Rid::new(page_id, slot_num));
                offset += 8;
            }
            Ok(TreeNode::Leaf(LeafNode {
                max_size,
                next_page_id,
                keys,
                values,
            }))
        }
        PAGE_TYPE_INTERNAL => {
            let key_count = size.saturating_sub(1);
            let (keys, mut offset) = read_keys(data, NODE_HEADER_SIZE, key_count)?;
            let mut children = Vec::with_capacity(size);
            for _ in 0..size {
                children.push(LittleEndian::read_u32(&data[offset..offset + 4]));
                offset += 4;
            }
            Ok(TreeNode::Internal(InternalNode {
                max_size,
                keys,
                children,
            }))
        }
        _ => Err(BTreeError::InvalidPageFormat),
    }
}

fn write_keys<K: Serialize>(keys: &[K], data: &mut [u8], mut offset: usize) -> Result<usize, BTreeError> {
    for key in keys {
        let bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
        if offset + 2 + bytes.len() > data.len() {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut data[offset..offset + 2], bytes.len() as u16);
        offset += 2;
        data[offset..offset + bytes.len()].copy_from_slice(&bytes);
        offset += bytes.len();
    }
    Ok(offset)
}

fn read_keys<K: for<'de> Deserialize<'de>>(
    data: &[u8],
    mut offset: usize,
    count: usize,
) -> Result<(Vec<K>, usize), BTreeError> {
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        if offset + 2 > data.len() {
            return Err(BTreeError::InvalidPageFormat);
        }
        let len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + len > data.len() {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&data[offset..offset + len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        keys.push(key);
        offset += len;
    }
    Ok((keys, offset))
}
