//! Arena-backed block index graph.
//!
//! Every known header gets a node addressed by a dense [`BlockId`].
//! Parent and skip links are ids, the active chain is a vector of ids,
//! and the candidate set stores ids, so the graph carries no interior
//! pointers.

use std::collections::{HashMap, HashSet, VecDeque};

use candyd_pow::difficulty::block_proof;
use candyd_primitives::block::BlockHeader;
use candyd_primitives::encoding::{DecodeError, Decoder, Encoder};
use candyd_primitives::Hash256;
use primitive_types::U256;

use crate::flatfiles::FileLocation;
use crate::status::{BlockStatus, BlockValidity};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<BlockId>,
    pub skip: Option<BlockId>,
    pub height: i32,
    /// Total work in the chain up to and including this block.
    pub chain_work: U256,
    /// Maximum header timestamp along the chain up to this block.
    pub time_max: u32,
    /// Number of transactions in this block; zero until the body is
    /// seen.
    pub tx_count: u32,
    /// Transactions in the chain up to and including this block; zero
    /// until this block and all ancestors have data.
    pub chain_tx: u64,
    pub status: BlockStatus,
    /// Order in which block data arrived. Zero for blocks loaded from
    /// disk, negative once a block has been marked precious.
    pub sequence_id: i32,
    pub data_location: Option<FileLocation>,
    pub undo_location: Option<FileLocation>,
}

#[derive(Debug)]
pub enum BlockIndexError {
    MissingParent,
    InvalidTarget,
}

impl std::fmt::Display for BlockIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockIndexError::MissingParent => write!(f, "parent header not found"),
            BlockIndexError::InvalidTarget => write!(f, "header carries an undecodable target"),
        }
    }
}

impl std::error::Error for BlockIndexError {}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, BlockId>,
    /// Children whose parent does not have a complete ancestor chain of
    /// block data yet, keyed by parent.
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    dirty: HashSet<BlockId>,
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Height of the ancestor the skip pointer jumps to.
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: BlockId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: BlockId) -> &mut BlockIndexNode {
        self.dirty.insert(id);
        &mut self.nodes[id.index()]
    }

    pub fn find(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.nodes.len() as u32).map(BlockId)
    }

    pub fn take_dirty(&mut self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.dirty.drain().collect();
        ids.sort_unstable();
        ids
    }

    pub fn mark_dirty(&mut self, id: BlockId) {
        self.dirty.insert(id);
    }

    /// Insert a header, computing height, chain work, time-max, and the
    /// skip pointer, and raising validity to Tree. Returns the existing
    /// node on duplicates.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<BlockId, BlockIndexError> {
        let hash = header.hash();
        if let Some(existing) = self.find(&hash) {
            return Ok(existing);
        }

        let parent = if header.prev_block == [0u8; 32] {
            None
        } else {
            Some(
                self.find(&header.prev_block)
                    .ok_or(BlockIndexError::MissingParent)?,
            )
        };

        let proof = block_proof(header.bits).map_err(|_| BlockIndexError::InvalidTarget)?;
        let (height, chain_work, time_max) = match parent {
            Some(parent_id) => {
                let parent_node = self.node(parent_id);
                (
                    parent_node.height + 1,
                    parent_node.chain_work + proof,
                    parent_node.time_max.max(header.time),
                )
            }
            None => (0, proof, header.time),
        };

        let id = BlockId(self.nodes.len() as u32);
        let skip = match parent {
            Some(parent_id) => self.ancestor(parent_id, skip_height(height)),
            None => None,
        };
        let status = BlockStatus::new().with_validity(BlockValidity::Tree);

        self.nodes.push(BlockIndexNode {
            hash,
            header: header.clone(),
            parent,
            skip,
            height,
            chain_work,
            time_max,
            tx_count: 0,
            chain_tx: 0,
            status,
            sequence_id: 0,
            data_location: None,
            undo_location: None,
        });
        self.by_hash.insert(hash, id);
        self.dirty.insert(id);
        Ok(id)
    }

    /// Insert a node restored from the index database. Parents must be
    /// inserted first (callers sort by height).
    pub fn insert_loaded(
        &mut self,
        header: &BlockHeader,
        status: BlockStatus,
        tx_count: u32,
        data_location: Option<FileLocation>,
        undo_location: Option<FileLocation>,
    ) -> Result<BlockId, BlockIndexError> {
        let id = self.insert_header(header)?;
        let node = &mut self.nodes[id.index()];
        node.status = status;
        node.tx_count = tx_count;
        node.data_location = data_location;
        node.undo_location = undo_location;
        // Loaded nodes are clean until something touches them again.
        self.dirty.remove(&id);
        Ok(id)
    }

    /// Ancestor of `id` at `height`, following skip pointers where they
    /// help; O(log depth).
    pub fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.node(walk).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let node = self.node(walk);
            let jump = skip_height(walk_height);
            let jump_prev = skip_height(walk_height - 1);
            let take_skip = node.skip.is_some()
                && (jump == height
                    || (jump > height && !(jump_prev < jump - 2 && jump_prev >= height)));
            if take_skip {
                walk = node.skip.expect("checked above");
                walk_height = jump;
            } else {
                walk = node.parent?;
                walk_height -= 1;
            }
        }
        Some(walk)
    }

    /// Last common ancestor of two nodes.
    pub fn find_fork(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let (mut a, mut b) = (a, b);
        let height = self.node(a).height.min(self.node(b).height);
        a = self.ancestor(a, height)?;
        b = self.ancestor(b, height)?;
        while a != b {
            a = self.node(a).parent?;
            b = self.node(b).parent?;
        }
        Some(a)
    }

    /// Is `ancestor` on the chain leading to `descendant`?
    pub fn is_ancestor_of(&self, ancestor: BlockId, descendant: BlockId) -> bool {
        let height = self.node(ancestor).height;
        self.ancestor(descendant, height) == Some(ancestor)
    }

    /// Two nodes sit on the same fork if one is an ancestor of the
    /// other.
    pub fn same_fork(&self, a: BlockId, b: BlockId) -> bool {
        self.is_ancestor_of(a, b) || self.is_ancestor_of(b, a)
    }

    /// Raise the validity level. Returns true when the level changed;
    /// refuses on failed entries.
    pub fn raise_validity(&mut self, id: BlockId, up_to: BlockValidity) -> bool {
        let node = &mut self.nodes[id.index()];
        if node.status.is_invalid() {
            return false;
        }
        if node.status.validity() >= up_to {
            return false;
        }
        node.status = node.status.with_validity(up_to);
        self.dirty.insert(id);
        true
    }

    /// Median of the last 11 header timestamps ending at `id`.
    pub fn median_time_past(&self, id: BlockId) -> i64 {
        let mut times = Vec::with_capacity(11);
        let mut walk = Some(id);
        for _ in 0..11 {
            let Some(current) = walk else { break };
            let node = self.node(current);
            times.push(node.header.time as i64);
            walk = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Record that a block's data arrived, then flow `chain_tx` to it
    /// and any descendants that were waiting on it. Returns every node
    /// whose chain became complete, in traversal order; the caller
    /// assigns sequence ids and candidate entries.
    pub fn connect_block_data(
        &mut self,
        id: BlockId,
        tx_count: u32,
        location: FileLocation,
    ) -> Vec<BlockId> {
        {
            let node = &mut self.nodes[id.index()];
            node.tx_count = tx_count;
            node.chain_tx = 0;
            node.data_location = Some(location);
            node.status = node.status.with_data(true);
        }
        self.dirty.insert(id);
        self.raise_validity(id, BlockValidity::Transactions);

        let parent_complete = match self.node(id).parent {
            None => true,
            Some(parent) => self.node(parent).chain_tx != 0,
        };
        if !parent_complete {
            let parent = self.node(id).parent.expect("checked above");
            self.unlinked.entry(parent).or_default().push(id);
            return Vec::new();
        }

        let mut connected = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            let parent_chain_tx = match self.node(current).parent {
                Some(parent) => self.node(parent).chain_tx,
                None => 0,
            };
            let node = &mut self.nodes[current.index()];
            node.chain_tx = parent_chain_tx + node.tx_count as u64;
            self.dirty.insert(current);
            connected.push(current);

            if let Some(children) = self.unlinked.remove(&current) {
                for child in children {
                    queue.push_back(child);
                }
            }
        }
        connected
    }

    /// Apply `update` to `base` and to every descendant of `base`,
    /// collecting the ids whose status changed.
    pub fn update_flags<F>(&mut self, base: BlockId, update: F) -> Vec<BlockId>
    where
        F: Fn(BlockStatus) -> BlockStatus,
    {
        let mut changed = Vec::new();
        for id in (0..self.nodes.len() as u32).map(BlockId) {
            if id != base && !self.is_ancestor_of(base, id) {
                continue;
            }
            let node = &mut self.nodes[id.index()];
            let updated = update(node.status);
            if updated != node.status {
                node.status = updated;
                self.dirty.insert(id);
                changed.push(id);
            }
        }
        changed
    }

    /// Apply one transform to `base` and a different one to its
    /// descendants (the unpark-without-children case).
    pub fn update_flags_split<F, G>(&mut self, base: BlockId, on_base: F, on_child: G) -> Vec<BlockId>
    where
        F: Fn(BlockStatus) -> BlockStatus,
        G: Fn(BlockStatus) -> BlockStatus,
    {
        let mut changed = Vec::new();
        for id in (0..self.nodes.len() as u32).map(BlockId) {
            let is_base = id == base;
            if !is_base && !self.is_ancestor_of(base, id) {
                continue;
            }
            let node = &mut self.nodes[id.index()];
            let updated = if is_base {
                on_base(node.status)
            } else {
                on_child(node.status)
            };
            if updated != node.status {
                node.status = updated;
                self.dirty.insert(id);
                changed.push(id);
            }
        }
        changed
    }
}

/// Persisted form of a block index node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub status: BlockStatus,
    pub tx_count: u32,
    pub data_location: Option<FileLocation>,
    pub undo_location: Option<FileLocation>,
}

impl BlockIndexEntry {
    pub fn from_node(node: &BlockIndexNode) -> Self {
        Self {
            header: node.header.clone(),
            status: node.status,
            tx_count: node.tx_count,
            data_location: node.data_location,
            undo_location: node.undo_location,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.status.bits());
        encoder.write_u32_le(self.tx_count);
        encode_location(&mut encoder, &self.data_location);
        encode_location(&mut encoder, &self.undo_location);
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let status = BlockStatus::from_bits(decoder.read_u32_le()?);
        let tx_count = decoder.read_u32_le()?;
        let data_location = decode_location(&mut decoder)?;
        let undo_location = decode_location(&mut decoder)?;
        let header = BlockHeader::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(Self {
            header,
            status,
            tx_count,
            data_location,
            undo_location,
        })
    }
}

fn encode_location(encoder: &mut Encoder, location: &Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_u8(1);
            encoder.write_u32_le(location.file_id);
            encoder.write_u64_le(location.offset);
            encoder.write_u32_le(location.len);
        }
        None => encoder.write_u8(0),
    }
}

fn decode_location(decoder: &mut Decoder<'_>) -> Result<Option<FileLocation>, DecodeError> {
    if decoder.read_u8()? == 0 {
        return Ok(None);
    }
    let file_id = decoder.read_u32_le()?;
    let offset = decoder.read_u64_le()?;
    let len = decoder.read_u32_le()?;
    Ok(Some(FileLocation {
        file_id,
        offset,
        len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash256, height: u32, nonce_seed: u8) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [height as u8; 32],
            height,
            reserved: [0u32; 7],
            time: 1_500_000_000 + height * 120,
            bits: 0x207f_ffff,
            nonce: [nonce_seed; 32],
            solution: vec![nonce_seed; 4],
        }
    }

    fn build_chain(index: &mut BlockIndex, len: u32) -> Vec<BlockId> {
        let mut prev = [0u8; 32];
        let mut ids = Vec::new();
        for height in 0..len {
            let h = header(prev, height, 1);
            prev = h.hash();
            ids.push(index.insert_header(&h).expect("insert"));
        }
        ids
    }

    #[test]
    fn chain_work_accumulates_block_proof() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 5);
        let proof = block_proof(0x207f_ffff).expect("proof");
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.node(*id).chain_work, proof * U256::from(i as u64 + 1));
        }
    }

    #[test]
    fn ancestor_via_skip_list() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 200);
        for target in [0i32, 1, 63, 64, 127, 128, 198] {
            assert_eq!(index.ancestor(ids[199], target), Some(ids[target as usize]));
        }
        assert_eq!(index.ancestor(ids[10], 11), None);
    }

    #[test]
    fn find_fork_between_branches() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 10);
        // Branch off at height 5.
        let mut prev = index.node(trunk[5]).hash;
        let mut branch = Vec::new();
        for height in 6..12 {
            let h = header(prev, height, 2);
            prev = h.hash();
            branch.push(index.insert_header(&h).expect("insert"));
        }
        let fork = index.find_fork(trunk[9], *branch.last().unwrap());
        assert_eq!(fork, Some(trunk[5]));
        assert!(index.is_ancestor_of(trunk[5], branch[0]));
        assert!(!index.same_fork(trunk[9], branch[0]));
    }

    #[test]
    fn raise_validity_is_monotone() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 2);
        assert!(index.raise_validity(ids[1], BlockValidity::Chain));
        assert!(!index.raise_validity(ids[1], BlockValidity::Transactions));
        assert_eq!(index.node(ids[1]).status.validity(), BlockValidity::Chain);
        assert!(index.raise_validity(ids[1], BlockValidity::Scripts));
    }

    #[test]
    fn chain_tx_waits_for_ancestor_data() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 3);
        let loc = FileLocation {
            file_id: 0,
            offset: 0,
            len: 100,
        };

        // Child data first: nothing connects yet.
        let connected = index.connect_block_data(ids[1], 5, loc);
        assert!(connected.is_empty());
        assert_eq!(index.node(ids[1]).chain_tx, 0);

        // Genesis data arrives: both link up.
        let connected = index.connect_block_data(ids[0], 1, loc);
        assert_eq!(connected, vec![ids[0], ids[1]]);
        assert_eq!(index.node(ids[0]).chain_tx, 1);
        assert_eq!(index.node(ids[1]).chain_tx, 6);

        let connected = index.connect_block_data(ids[2], 2, loc);
        assert_eq!(connected, vec![ids[2]]);
        assert_eq!(index.node(ids[2]).chain_tx, 8);
    }

    #[test]
    fn update_flags_reaches_descendants_only() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 6);
        let changed = index.update_flags(trunk[3], |status| status.with_failed_parent(true));
        assert_eq!(changed.len(), 3);
        assert!(index.node(trunk[4]).status.has_failed_parent());
        assert!(!index.node(trunk[2]).status.has_failed_parent());
    }

    #[test]
    fn index_entry_roundtrip() {
        let entry = BlockIndexEntry {
            header: header([9u8; 32], 77, 3),
            status: BlockStatus::new()
                .with_validity(BlockValidity::Scripts)
                .with_data(true)
                .with_undo(true),
            tx_count: 12,
            data_location: Some(FileLocation {
                file_id: 1,
                offset: 4096,
                len: 2048,
            }),
            undo_location: None,
        };
        let decoded = BlockIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded, entry);
    }
}
