//! The chain state machine: header/block acceptance, best-chain
//! activation with reorgs, finalization, parking, and precious blocks.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candyd_consensus::constants::{
    DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MAX_REORG_DEPTH, MIN_BLOCKS_TO_KEEP,
};
use candyd_consensus::{ChainParams, Hash256};
use candyd_pow::difficulty::{get_next_work_required, required_history, HeaderInfo};
use candyd_primitives::block::{Block, BlockHeader};
use candyd_script::flags::{block_script_flags, TipInfo};
use candyd_script::{AlwaysValid, ScriptChecker};
use candyd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{BlockId, BlockIndex, BlockIndexEntry};
use crate::coins::{CoinsCache, StoreCoinsView};
use crate::connect::{connect_block, disconnect_block, ConnectContext, DisconnectResult};
use crate::filemeta::{
    block_file_info_key, undo_file_info_key, FlatFileInfo, META_LAST_BLOCK_FILE_KEY,
    META_LAST_UNDO_FILE_KEY,
};
use crate::flatfiles::{FileLocation, FlatFileStore, DEFAULT_MAX_FILE_SIZE};
use crate::mempool::{Mempool, NullMempool};
use crate::notify::{ChainNotifier, NullNotifier};
use crate::status::BlockValidity;
use crate::undo::BlockUndo;
use crate::validation::{
    check_block, check_block_header, contextual_check_block, contextual_check_header,
    ChainstateError, PrevInfo, Rejection, RejectionKind,
};

/// Policy and performance knobs. Consensus-relevant values stay in the
/// network params.
pub struct ChainstateOptions {
    /// Finalization depth below the tip; reorgs past it are refused.
    pub max_reorg_depth: i32,
    /// Park incoming blocks that would reorg more than one block.
    pub park_deep_reorg: bool,
    pub stop_at_height: Option<i32>,
    pub max_block_size: u64,
    /// Skip script checks for ancestors of this block when the chain
    /// carries at least the minimum work.
    pub assume_valid: Option<Hash256>,
    pub checkpoints_enabled: bool,
    pub tx_index: bool,
    pub max_file_size: u64,
}

impl Default for ChainstateOptions {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            park_deep_reorg: true,
            stop_at_height: None,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            assume_valid: None,
            checkpoints_enabled: true,
            tx_index: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Candidate ordering: most work first, then earliest-received (lowest
/// sequence id, where precious blocks sit below zero), then oldest
/// arena slot. The set's maximum is the preferred tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    work: [u8; 32],
    seq_rank: i64,
    id_rank: i64,
    id: BlockId,
}

pub struct ChainState<S> {
    params: ChainParams,
    options: ChainstateOptions,
    store: Arc<S>,
    blocks: FlatFileStore,
    undo_files: FlatFileStore,
    index: BlockIndex,
    active_chain: Vec<BlockId>,
    candidates: BTreeSet<CandidateKey>,
    best_header: Option<BlockId>,
    best_invalid: Option<BlockId>,
    best_parked: Option<BlockId>,
    finalized: Option<BlockId>,
    next_sequence_id: i32,
    reverse_sequence_id: i32,
    last_precious_work: U256,
    mempool: Box<dyn Mempool>,
    notifier: Box<dyn ChainNotifier>,
    script_checker: Arc<dyn ScriptChecker>,
    shutdown: Arc<AtomicBool>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Open (or bootstrap) the chain state in `data_dir`, loading the
    /// block index from the store.
    pub fn open(
        params: ChainParams,
        options: ChainstateOptions,
        store: Arc<S>,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self, ChainstateError> {
        let data_dir = data_dir.as_ref();
        let blocks = FlatFileStore::open(
            data_dir.join("blocks"),
            "blk",
            params.disk_magic,
            options.max_file_size,
        )?;
        let undo_files = FlatFileStore::open(
            data_dir.join("blocks"),
            "rev",
            params.disk_magic,
            options.max_file_size,
        )?;

        let mut state = Self {
            params,
            options,
            store,
            blocks,
            undo_files,
            index: BlockIndex::new(),
            active_chain: Vec::new(),
            candidates: BTreeSet::new(),
            best_header: None,
            best_invalid: None,
            best_parked: None,
            finalized: None,
            next_sequence_id: 1,
            reverse_sequence_id: -1,
            last_precious_work: U256::zero(),
            mempool: Box::new(NullMempool),
            notifier: Box::new(NullNotifier),
            script_checker: Arc::new(AlwaysValid),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        state.load_index()?;
        if state.index.is_empty() {
            state.bootstrap_genesis()?;
        } else {
            state.rebuild_views()?;
        }
        Ok(state)
    }

    pub fn set_mempool(&mut self, mempool: Box<dyn Mempool>) {
        self.mempool = mempool;
    }

    pub fn set_notifier(&mut self, notifier: Box<dyn ChainNotifier>) {
        self.notifier = notifier;
    }

    pub fn set_script_checker(&mut self, checker: Arc<dyn ScriptChecker>) {
        self.script_checker = checker;
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.active_chain.last().copied()
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip().map(|id| self.index.node(id).hash)
    }

    pub fn tip_height(&self) -> i32 {
        self.active_chain.len() as i32 - 1
    }

    pub fn finalized_block(&self) -> Option<Hash256> {
        self.finalized.map(|id| self.index.node(id).hash)
    }

    pub fn best_invalid(&self) -> Option<Hash256> {
        self.best_invalid.map(|id| self.index.node(id).hash)
    }

    pub fn best_parked(&self) -> Option<Hash256> {
        self.best_parked.map(|id| self.index.node(id).hash)
    }

    pub fn best_header(&self) -> Option<Hash256> {
        self.best_header.map(|id| self.index.node(id).hash)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        let height = self.index.node(id).height;
        height >= 0 && self.active_chain.get(height as usize) == Some(&id)
    }

    pub fn block_at_height(&self, height: i32) -> Option<Hash256> {
        if height < 0 {
            return None;
        }
        self.active_chain
            .get(height as usize)
            .map(|id| self.index.node(*id).hash)
    }

    /// Read a coin straight from the persisted UTXO set.
    pub fn utxo(
        &self,
        outpoint: &candyd_primitives::outpoint::OutPoint,
    ) -> Result<Option<crate::coins::Coin>, ChainstateError> {
        let view = StoreCoinsView::new(Arc::clone(&self.store));
        use crate::coins::CoinsView;
        Ok(view.get_coin(outpoint)?)
    }

    fn candidate_key(&self, id: BlockId) -> CandidateKey {
        let node = self.index.node(id);
        CandidateKey {
            work: node.chain_work.to_big_endian(),
            seq_rank: -(node.sequence_id as i64),
            id_rank: -(id.0 as i64),
            id,
        }
    }

    fn insert_candidate(&mut self, id: BlockId) {
        let key = self.candidate_key(id);
        self.candidates.insert(key);
    }

    fn remove_candidate(&mut self, id: BlockId) {
        let key = self.candidate_key(id);
        self.candidates.remove(&key);
    }

    /// Delete all candidates that are worse than the current tip; the
    /// tip itself (or a successor being worked towards) stays.
    fn prune_candidates(&mut self) {
        let Some(tip) = self.tip() else { return };
        let tip_key = self.candidate_key(tip);
        self.candidates = self.candidates.split_off(&tip_key);
    }

    // ---- loading and bootstrap ------------------------------------

    fn load_index(&mut self) -> Result<(), ChainstateError> {
        let mut entries: Vec<BlockIndexEntry> = Vec::new();
        for (_, value) in self.store.scan_prefix(Column::BlockIndex, b"")? {
            let entry = BlockIndexEntry::decode(&value)
                .map_err(|_| ChainstateError::Corrupt("invalid block index entry"))?;
            entries.push(entry);
        }
        // Parents must exist before children; header heights are not
        // trustworthy pre-fork, so order by parent linkage height via
        // repeated passes over a hash map instead.
        let mut pending: Vec<BlockIndexEntry> = entries;
        let mut progress = true;
        while progress && !pending.is_empty() {
            progress = false;
            let mut remaining = Vec::with_capacity(pending.len());
            for entry in pending {
                let is_root = entry.header.prev_block == [0u8; 32];
                if is_root || self.index.find(&entry.header.prev_block).is_some() {
                    self.index
                        .insert_loaded(
                            &entry.header,
                            entry.status,
                            entry.tx_count,
                            entry.data_location,
                            entry.undo_location,
                        )
                        .map_err(|_| ChainstateError::Corrupt("unlinkable block index entry"))?;
                    progress = true;
                } else {
                    remaining.push(entry);
                }
            }
            pending = remaining;
        }
        if !pending.is_empty() {
            return Err(ChainstateError::Corrupt("orphaned block index entries"));
        }
        Ok(())
    }

    fn bootstrap_genesis(&mut self) -> Result<(), ChainstateError> {
        let genesis = self.params.genesis.clone();
        let id = self
            .index
            .insert_header(&genesis.header)
            .map_err(|_| ChainstateError::Corrupt("genesis header rejected"))?;

        let body = genesis.consensus_encode();
        let location = self.blocks.append(&body)?;
        let mut batch = WriteBatch::new();
        self.record_block_file(&mut batch, location, 0, genesis.header.time)?;

        self.index.connect_block_data(id, genesis.transactions.len() as u32, location);
        self.index.raise_validity(id, BlockValidity::Scripts);

        let hash = self.index.node(id).hash;
        batch.put(Column::Meta, crate::coins::BEST_BLOCK_KEY.to_vec(), hash.to_vec());
        batch.put(Column::HeightIndex, 0u32.to_be_bytes().to_vec(), hash.to_vec());
        self.flush_index_into(&mut batch);
        self.store.write_batch(&batch)?;

        self.active_chain.push(id);
        self.best_header = Some(id);
        self.insert_candidate(id);
        Ok(())
    }

    fn rebuild_views(&mut self) -> Result<(), ChainstateError> {
        // Recompute chain_tx bottom-up; it is never persisted.
        let mut by_height: Vec<BlockId> = self.index.ids().collect();
        by_height.sort_by_key(|id| self.index.node(*id).height);
        for id in &by_height {
            let (has_data, tx_count, parent) = {
                let node = self.index.node(*id);
                (node.status.has_data(), node.tx_count, node.parent)
            };
            if !has_data {
                continue;
            }
            let parent_chain_tx = match parent {
                Some(parent) => self.index.node(parent).chain_tx,
                None => 0,
            };
            if parent.is_none() || parent_chain_tx != 0 {
                self.index.node_mut(*id).chain_tx = parent_chain_tx + tx_count as u64;
            }
        }
        // Loaded entries are clean.
        self.index.take_dirty();

        let view = StoreCoinsView::new(Arc::clone(&self.store));
        use crate::coins::CoinsView;
        let best = view
            .best_block()?
            .ok_or(ChainstateError::Corrupt("missing best block pointer"))?;
        let tip = self
            .index
            .find(&best)
            .ok_or(ChainstateError::Corrupt("best block missing from index"))?;

        let mut chain = Vec::new();
        let mut walk = Some(tip);
        while let Some(id) = walk {
            chain.push(id);
            walk = self.index.node(id).parent;
        }
        chain.reverse();
        self.active_chain = chain;

        for id in by_height {
            let node = self.index.node(id);
            let is_valid_with_tx = node.status.is_valid(BlockValidity::Transactions) && node.chain_tx != 0;
            let node_chain_work = node.chain_work;
            let node_is_invalid = node.status.is_invalid();
            if is_valid_with_tx {
                self.insert_candidate(id);
            }
            let is_better_header = match self.best_header {
                Some(best) => node_chain_work > self.index.node(best).chain_work,
                None => true,
            };
            if !node_is_invalid && is_better_header {
                self.best_header = Some(id);
            }
        }
        self.prune_candidates();
        Ok(())
    }

    // ---- persistence helpers --------------------------------------

    fn flush_index_into(&mut self, batch: &mut WriteBatch) {
        for id in self.index.take_dirty() {
            let node = self.index.node(id);
            batch.put(
                Column::BlockIndex,
                node.hash.to_vec(),
                BlockIndexEntry::from_node(node).encode(),
            );
        }
    }

    /// Persist any dirty index entries immediately.
    pub fn flush(&mut self) -> Result<(), ChainstateError> {
        let mut batch = WriteBatch::new();
        self.flush_index_into(&mut batch);
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        Ok(())
    }

    fn record_block_file(
        &mut self,
        batch: &mut WriteBatch,
        location: FileLocation,
        height: i32,
        time: u32,
    ) -> Result<(), ChainstateError> {
        let key = block_file_info_key(location.file_id);
        let mut info = match self.store.get(Column::Meta, &key)? {
            Some(bytes) => FlatFileInfo::decode(&bytes)
                .map_err(|_| ChainstateError::Corrupt("invalid block file info"))?,
            None => FlatFileInfo::default(),
        };
        info.add_block(height.max(0) as u32, time as u64);
        info.size = location.offset + location.len as u64;
        batch.put(Column::Meta, key, info.encode());
        batch.put(
            Column::Meta,
            META_LAST_BLOCK_FILE_KEY.to_vec(),
            location.file_id.to_le_bytes().to_vec(),
        );
        Ok(())
    }

    fn record_undo_file(
        &mut self,
        batch: &mut WriteBatch,
        location: FileLocation,
    ) -> Result<(), ChainstateError> {
        let key = undo_file_info_key(location.file_id);
        let mut info = match self.store.get(Column::Meta, &key)? {
            Some(bytes) => FlatFileInfo::decode(&bytes)
                .map_err(|_| ChainstateError::Corrupt("invalid undo file info"))?,
            None => FlatFileInfo::default(),
        };
        info.blocks += 1;
        info.size = location.offset + location.len as u64;
        batch.put(Column::Meta, key, info.encode());
        batch.put(
            Column::Meta,
            META_LAST_UNDO_FILE_KEY.to_vec(),
            location.file_id.to_le_bytes().to_vec(),
        );
        Ok(())
    }

    fn read_block(&self, id: BlockId) -> Result<Block, ChainstateError> {
        let location = self
            .index
            .node(id)
            .data_location
            .ok_or(ChainstateError::Corrupt("missing block data"))?;
        let bytes = self.blocks.read(location)?;
        Block::consensus_decode(&bytes).map_err(|_| ChainstateError::Corrupt("invalid block bytes"))
    }

    fn read_undo(&self, id: BlockId) -> Result<BlockUndo, ChainstateError> {
        let node = self.index.node(id);
        let location = node
            .undo_location
            .ok_or(ChainstateError::Corrupt("missing undo data; resync required"))?;
        let prev_hash = node.header.prev_block;
        let bytes = self.undo_files.read_with_checksum(location, &prev_hash)?;
        BlockUndo::decode(&bytes).map_err(|_| ChainstateError::Corrupt("invalid undo bytes"))
    }

    // ---- header acceptance ----------------------------------------

    fn header_window(&self, tip: BlockId) -> Vec<HeaderInfo> {
        let len = required_history(&self.params.consensus);
        let mut window = Vec::with_capacity(len);
        let mut walk = Some(tip);
        while let Some(id) = walk {
            let node = self.index.node(id);
            window.push(HeaderInfo {
                height: node.height as i64,
                time: node.header.time as i64,
                bits: node.header.bits,
            });
            if window.len() >= len {
                break;
            }
            walk = node.parent;
        }
        window.reverse();
        window
    }

    fn expected_bits(&self, prev: BlockId, next_time: i64) -> Result<u32, ChainstateError> {
        let window = self.header_window(prev);
        Ok(get_next_work_required(
            &window,
            Some(next_time),
            &self.params.consensus,
        )?)
    }

    /// Validate a header against its parent and insert it into the
    /// index. Known headers are returned as-is unless marked invalid.
    pub fn accept_header(
        &mut self,
        header: &BlockHeader,
        adjusted_time: i64,
    ) -> Result<BlockId, ChainstateError> {
        let hash = header.hash();
        let consensus = &self.params.consensus;

        if let Some(existing) = self.index.find(&hash) {
            if self.index.node(existing).status.is_invalid() {
                return Err(Rejection::duplicate("duplicate")
                    .with_debug("block is marked invalid".to_string())
                    .into());
            }
            return Ok(existing);
        }

        if hash == consensus.hash_genesis_block {
            let id = self
                .index
                .insert_header(header)
                .map_err(|_| ChainstateError::Corrupt("genesis header rejected"))?;
            return Ok(id);
        }

        check_block_header(header, consensus, true)?;

        let prev = self
            .index
            .find(&header.prev_block)
            .ok_or_else(|| Rejection::invalid(10, "bad-prevblk"))?;
        let prev_node = self.index.node(prev);
        if prev_node.status.is_invalid() {
            return Err(Rejection::invalid(100, "bad-prevblk").into());
        }
        let height = prev_node.height + 1;

        if self.options.checkpoints_enabled {
            if let Some(checkpoint) = consensus
                .checkpoints
                .iter()
                .find(|checkpoint| checkpoint.height == height)
            {
                if checkpoint.hash != hash {
                    return Err(Rejection::invalid(100, "checkpoint mismatch").into());
                }
            }
            // Forks below the last checkpoint on the active chain are
            // refused outright.
            if let Some(last) = consensus
                .checkpoints
                .iter()
                .filter(|checkpoint| checkpoint.height <= self.tip_height())
                .max_by_key(|checkpoint| checkpoint.height)
            {
                if height < last.height {
                    return Err(Rejection::invalid(100, "bad-fork-prior-checkpoint").into());
                }
            }
        }

        let expected_bits = self.expected_bits(prev, header.time as i64)?;
        let prev_info = PrevInfo {
            height: prev_node.height,
            time: prev_node.header.time as i64,
            median_time_past: self.index.median_time_past(prev),
        };
        contextual_check_header(header, &prev_info, expected_bits, adjusted_time, consensus)?;

        let id = self
            .index
            .insert_header(header)
            .map_err(|_| ChainstateError::Corrupt("header parent vanished"))?;

        let is_better = match self.best_header {
            Some(best) => {
                self.index.node(id).chain_work > self.index.node(best).chain_work
            }
            None => true,
        };
        if is_better {
            self.best_header = Some(id);
        }
        Ok(id)
    }

    // ---- block acceptance -----------------------------------------

    /// Store a block body, extending the index. Returns the node and
    /// whether the body was new.
    pub fn accept_block(
        &mut self,
        block: &Block,
        requested: bool,
        adjusted_time: i64,
    ) -> Result<(BlockId, bool), ChainstateError> {
        let id = self.accept_header(&block.header, adjusted_time)?;

        if self.index.node(id).status.has_data() {
            return Ok((id, false));
        }

        if !requested {
            let node = self.index.node(id);
            let tip_work = self.tip().map(|tip| self.index.node(tip).chain_work);
            let has_more_work = tip_work.map_or(true, |work| node.chain_work > work);
            let too_far_ahead = node.height > self.tip_height() + MIN_BLOCKS_TO_KEEP;
            let minimum_work =
                U256::from_little_endian(&self.params.consensus.minimum_chain_work);
            if !has_more_work || too_far_ahead || node.chain_work < minimum_work {
                return Ok((id, false));
            }
        }

        let consensus = &self.params.consensus;
        let prev_info = match self.index.node(id).parent {
            Some(parent) => PrevInfo {
                height: self.index.node(parent).height,
                time: self.index.node(parent).header.time as i64,
                median_time_past: self.index.median_time_past(parent),
            },
            None => PrevInfo {
                height: -1,
                time: 0,
                median_time_past: 0,
            },
        };
        let monolith_active = prev_info.median_time_past >= consensus.monolith_activation_time;

        let checked = check_block(block, consensus, self.options.max_block_size, true, true)
            .and_then(|_| contextual_check_block(block, &prev_info, monolith_active, consensus));
        if let Err(rejection) = checked {
            if rejection.marks_failed() {
                self.mark_block_failed(id);
            }
            return Err(rejection.into());
        }

        // A block that would reorg more than one block gets parked on
        // arrival; enough accumulated work will unpark it.
        if self.options.park_deep_reorg {
            if let Some(tip) = self.tip() {
                if let Some(fork) = self.index.find_fork(id, tip) {
                    let node_height = self.index.node(id).height;
                    if self.index.node(fork).height + 1 < node_height && !self.contains(id) {
                        eprintln!(
                            "parking block at height {node_height}: it would cause a deep reorg"
                        );
                        self.set_parked(id);
                    }
                }
            }
        }

        let body = block.consensus_encode();
        let location = self.blocks.append(&body)?;
        let mut batch = WriteBatch::new();
        let height = self.index.node(id).height;
        self.record_block_file(&mut batch, location, height, block.header.time)?;

        let newly_linked =
            self.index
                .connect_block_data(id, block.transactions.len() as u32, location);
        for linked in newly_linked {
            // Sequence ids are only handed out once the body exists, so
            // header-only broadcasts gain no preference.
            self.index.node_mut(linked).sequence_id = self.next_sequence_id;
            self.next_sequence_id += 1;

            let eligible = {
                let node = self.index.node(linked);
                node.status.is_valid(BlockValidity::Transactions) && node.chain_tx != 0
            };
            let not_worse = match self.tip() {
                Some(tip) => self.candidate_key(linked) >= self.candidate_key(tip),
                None => true,
            };
            if eligible && not_worse {
                self.insert_candidate(linked);
            }
        }

        self.flush_index_into(&mut batch);
        self.store.write_batch(&batch)?;
        Ok((id, true))
    }

    /// Full pipeline for an externally received block: context-free
    /// checks, storage, then best-chain activation.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        adjusted_time: i64,
    ) -> Result<bool, ChainstateError> {
        check_block(
            block,
            &self.params.consensus,
            self.options.max_block_size,
            true,
            true,
        )?;
        let (_, is_new) = self.accept_block(block, true, adjusted_time)?;
        self.activate_best_chain(Some(block))?;
        Ok(is_new)
    }

    // ---- failure and parking flags --------------------------------

    fn mark_block_failed(&mut self, id: BlockId) {
        self.index
            .update_flags_split(id, |status| status.with_failed(true), |status| {
                status.with_failed_parent(true)
            });
        self.remove_candidate_subtree(id);
        let is_worse = match self.best_invalid {
            Some(best) => self.index.node(id).chain_work > self.index.node(best).chain_work,
            None => true,
        };
        if is_worse {
            self.best_invalid = Some(id);
        }
    }

    fn set_parked(&mut self, id: BlockId) {
        self.index
            .update_flags_split(id, |status| status.with_parked(true), |status| {
                status.with_parked_parent(true)
            });
    }

    fn remove_candidate_subtree(&mut self, base: BlockId) {
        let doomed: Vec<BlockId> = self
            .candidates
            .iter()
            .map(|key| key.id)
            .filter(|id| *id == base || self.index.is_ancestor_of(base, *id))
            .collect();
        for id in doomed {
            self.remove_candidate(id);
        }
    }

    /// Clear failure flags on a branch and reconsider it (the
    /// `reconsiderblock` path).
    pub fn reset_failure_flags(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;
        if let Some(best) = self.best_invalid {
            if self.index.same_fork(best, id) {
                self.best_invalid = None;
            }
        }
        self.index
            .update_flags(id, |status| status.with_cleared_failure_flags());
        self.readd_candidates();
        self.flush()?;
        self.activate_best_chain(None)
    }

    fn unpark_impl(&mut self, id: BlockId, clear_children: bool) {
        if let Some(best) = self.best_parked {
            if self.index.same_fork(best, id) {
                self.best_parked = None;
            }
        }
        self.index.update_flags_split(
            id,
            |status| status.with_cleared_parked_flags(),
            move |status| {
                if clear_children {
                    status.with_cleared_parked_flags()
                } else {
                    status.with_parked_parent(false)
                }
            },
        );
    }

    pub fn unpark_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;
        self.unpark_impl(id, false);
        self.readd_candidates();
        self.activate_best_chain(None)
    }

    pub fn unpark_block_and_children(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;
        self.unpark_impl(id, true);
        self.readd_candidates();
        self.activate_best_chain(None)
    }

    fn readd_candidates(&mut self) {
        let tip_key = self.tip().map(|tip| self.candidate_key(tip));
        for id in self.index.ids().collect::<Vec<_>>() {
            let node = self.index.node(id);
            if !node.status.is_valid(BlockValidity::Transactions) || node.chain_tx == 0 {
                continue;
            }
            let key = self.candidate_key(id);
            if tip_key.map_or(true, |tip_key| key >= tip_key) {
                self.candidates.insert(key);
            }
        }
    }

    // ---- finalization ---------------------------------------------

    fn finalize_internal(&mut self, id: BlockId) -> Result<(), ChainstateError> {
        if self.index.node(id).status.is_invalid() {
            return Err(Rejection::invalid(100, "finalize-invalid-block").into());
        }
        if let Some(finalized) = self.finalized {
            if !self.index.same_fork(id, finalized) {
                return Err(Rejection::against_finalized("bad-fork-prior-finalized").into());
            }
        }
        self.finalized = Some(id);
        Ok(())
    }

    /// Manually finalize a block, invalidating any competing chain the
    /// active tip currently sits on.
    pub fn finalize_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;
        self.finalize_internal(id)?;
        if self.index.node(id).status.is_on_parked_chain() {
            self.unpark_impl(id, false);
            self.readd_candidates();
        }
        let Some(tip) = self.tip() else {
            return Ok(());
        };
        if !self.index.same_fork(id, tip) {
            let fork = self
                .index
                .find_fork(id, tip)
                .ok_or(ChainstateError::Corrupt("disconnected index graph"))?;
            let doomed = self
                .index
                .ancestor(tip, self.index.node(fork).height + 1)
                .ok_or(ChainstateError::Corrupt("fork point above tip"))?;
            let doomed_hash = self.index.node(doomed).hash;
            return self.invalidate_block(&doomed_hash);
        }
        Ok(())
    }

    // ---- precious -------------------------------------------------

    /// Prefer the given block over same-work competitors without
    /// changing any chain work.
    pub fn precious_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;
        let tip_work = self
            .tip()
            .map(|tip| self.index.node(tip).chain_work)
            .unwrap_or_default();
        if self.index.node(id).chain_work < tip_work {
            // Not at the tip work level; nothing to do.
            return Ok(());
        }

        if tip_work > self.last_precious_work {
            // The chain advanced since the last call; restart the
            // negative sequence counter.
            self.reverse_sequence_id = -1;
        }
        self.last_precious_work = tip_work;

        self.remove_candidate(id);
        self.index.node_mut(id).sequence_id = self.reverse_sequence_id;
        if self.reverse_sequence_id > i32::MIN {
            self.reverse_sequence_id -= 1;
        }
        self.unpark_impl(id, false);

        let eligible = {
            let node = self.index.node(id);
            node.status.is_valid(BlockValidity::Transactions) && node.chain_tx != 0
        };
        if eligible {
            self.insert_candidate(id);
            self.prune_candidates();
        }
        self.activate_best_chain(None)
    }

    // ---- invalidate / park ----------------------------------------

    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        self.unwind_block(hash, true)?;
        self.activate_best_chain(None)
    }

    pub fn park_block(&mut self, hash: &Hash256) -> Result<(), ChainstateError> {
        self.unwind_block(hash, false)?;
        self.activate_best_chain(None)
    }

    fn unwind_block(&mut self, hash: &Hash256, invalidate: bool) -> Result<(), ChainstateError> {
        let id = self
            .index
            .find(hash)
            .ok_or(ChainstateError::Corrupt("unknown block"))?;

        {
            let node = self.index.node_mut(id);
            node.status = if invalidate {
                node.status.with_failed(true)
            } else {
                node.status.with_parked(true)
            };
        }
        self.remove_candidate(id);

        while self.contains(id) {
            let tip = self.tip().expect("chain contains the block");
            if tip != id {
                let node = self.index.node_mut(tip);
                node.status = if invalidate {
                    node.status.with_failed_parent(true)
                } else {
                    node.status.with_parked_parent(true)
                };
                self.remove_candidate(tip);
            }
            // The active chain treats its members as unconditionally
            // valid, so force the disconnect.
            self.disconnect_tip()?;
        }

        // Descendants off the active chain inherit the parent flag.
        if invalidate {
            self.mark_block_failed(id);
        } else {
            self.set_parked(id);
            let is_worse = match self.best_parked {
                Some(best) => {
                    self.index.node(id).chain_work > self.index.node(best).chain_work
                }
                None => true,
            };
            if is_worse {
                self.best_parked = Some(id);
            }
            self.remove_candidate_subtree(id);
        }

        self.readd_candidates();
        let new_height = self.tip_height();
        self.mempool.removed_for_reorg(new_height + 1);
        self.flush()?;
        Ok(())
    }

    // ---- reorg machinery ------------------------------------------

    /// Pick the best tip candidate whose branch is fully usable,
    /// pruning unusable branches (and unparking branches that earned
    /// it) along the way.
    fn find_most_work_chain(&mut self) -> Option<BlockId> {
        loop {
            let best = self.candidates.iter().next_back()?.id;

            // A candidate that would reorg the finalized block is dead
            // on arrival.
            if let Some(finalized) = self.finalized {
                if !self.index.same_fork(best, finalized) {
                    eprintln!(
                        "marking block at height {} invalid: it forks prior to the finalization point",
                        self.index.node(best).height
                    );
                    self.mark_block_failed(best);
                    continue;
                }
            }

            let tip = self.tip();
            let fork = tip.and_then(|tip| self.index.find_fork(best, tip));

            let mut test = Some(best);
            let mut usable = true;
            while let Some(current) = test {
                if Some(current) == fork {
                    break;
                }

                let mut parked = self.index.node(current).status.is_on_parked_chain();
                if parked && self.options.park_deep_reorg {
                    match (tip, fork) {
                        (Some(tip), Some(fork)) => {
                            if self.parked_branch_has_enough_work(best, tip, fork) {
                                eprintln!(
                                    "unparking block at height {}: its chain accumulated enough work",
                                    self.index.node(current).height
                                );
                                self.unpark_impl(current, false);
                                parked = false;
                            }
                        }
                        _ => {
                            // During initialization there is nothing to
                            // protect yet.
                            self.unpark_impl(current, false);
                            parked = false;
                        }
                    }
                }

                let node = self.index.node(current);
                let invalid = node.status.is_invalid();
                let missing_data = !node.status.has_data();
                if !(invalid || parked || missing_data) {
                    test = node.parent;
                    continue;
                }

                // Branch unusable: drop it from the candidate set and
                // propagate the parent flags down to the walk point.
                usable = false;
                if invalid {
                    let is_worse = match self.best_invalid {
                        Some(best_invalid) => {
                            self.index.node(best).chain_work
                                > self.index.node(best_invalid).chain_work
                        }
                        None => true,
                    };
                    if is_worse {
                        self.best_invalid = Some(best);
                    }
                }
                if parked {
                    let is_worse = match self.best_parked {
                        Some(best_parked) => {
                            self.index.node(best).chain_work
                                > self.index.node(best_parked).chain_work
                        }
                        None => true,
                    };
                    if is_worse {
                        self.best_parked = Some(best);
                    }
                }

                self.remove_candidate(current);
                let mut walk = best;
                while walk != current {
                    if invalid {
                        let node = self.index.node_mut(walk);
                        node.status = node.status.with_failed_parent(true);
                    } else if parked {
                        let node = self.index.node_mut(walk);
                        node.status = node.status.with_parked_parent(true);
                    }
                    self.remove_candidate(walk);
                    walk = self
                        .index
                        .node(walk)
                        .parent
                        .expect("walk stays above the fork point");
                }
                break;
            }

            if usable {
                return Some(best);
            }
        }
    }

    /// Parked-branch release rule: shallow reorgs (depth 1-3) need half
    /// a block's work beyond the tip; deeper ones must double the work
    /// accumulated since the fork.
    fn parked_branch_has_enough_work(&self, candidate: BlockId, tip: BlockId, fork: BlockId) -> bool {
        let tip_node = self.index.node(tip);
        let fork_work = self.index.node(fork).chain_work;
        let depth = tip_node.height - self.index.node(fork).height;

        let mut required = tip_node.chain_work;
        match depth {
            1..=3 => {
                let extra_from = if depth >= 2 {
                    self.index.node(tip).parent.unwrap_or(tip)
                } else {
                    tip
                };
                let delta = self.index.node(extra_from).chain_work - fork_work;
                required = required + (delta >> 1);
            }
            _ => {
                required = required + (tip_node.chain_work - fork_work);
            }
        }

        self.index.node(candidate).chain_work > required
    }

    /// Disconnect to the fork point and connect towards `target` in
    /// batches. Returns whether an invalid block was found on the way.
    fn activate_best_chain_step(
        &mut self,
        target: BlockId,
        new_block: Option<&Block>,
    ) -> Result<bool, ChainstateError> {
        let old_tip = self.tip();
        let old_tip_work = old_tip.map(|tip| self.index.node(tip).chain_work);
        let fork = old_tip.and_then(|tip| self.index.find_fork(target, tip));

        let mut disconnected = false;
        while let Some(tip) = self.tip() {
            if Some(tip) == fork {
                break;
            }
            self.disconnect_tip()?;
            disconnected = true;
        }

        let mut invalid_found = false;
        let mut height = fork.map(|fork| self.index.node(fork).height).unwrap_or(-1);
        let target_height = self.index.node(target).height;
        let target_hash = self.index.node(target).hash;

        'outer: while height != target_height {
            // Connect in slices of at most 32 so the lock can breathe
            // between batches on long reorgs.
            let next_height = (height + 32).min(target_height);
            let mut to_connect = Vec::with_capacity((next_height - height) as usize);
            let mut walk = self
                .index
                .ancestor(target, next_height)
                .ok_or(ChainstateError::Corrupt("target lost its ancestors"))?;
            while self.index.node(walk).height != height {
                to_connect.push(walk);
                match self.index.node(walk).parent {
                    Some(parent) => walk = parent,
                    None => break,
                }
            }
            height = next_height;

            for id in to_connect.into_iter().rev() {
                let block_ref = match new_block {
                    Some(block) if self.index.node(id).hash == target_hash && id == target => {
                        Some(block)
                    }
                    _ => None,
                };
                match self.connect_tip(id, block_ref) {
                    Ok(()) => {
                        self.prune_candidates();
                        let improved = match old_tip_work {
                            Some(work) => {
                                self.tip()
                                    .map(|tip| self.index.node(tip).chain_work > work)
                                    .unwrap_or(false)
                            }
                            None => true,
                        };
                        if improved {
                            break 'outer;
                        }
                    }
                    Err(err) => {
                        let Some(rejection) = err.rejection() else {
                            return Err(err);
                        };
                        if rejection.kind != RejectionKind::CorruptionPossible {
                            self.mark_block_failed(id);
                        } else {
                            self.remove_candidate(id);
                        }
                        eprintln!("failed to connect block: {rejection}");
                        invalid_found = true;
                        break 'outer;
                    }
                }
            }
        }

        if disconnected {
            let new_height = self.tip_height();
            self.mempool.removed_for_reorg(new_height + 1);
        }
        Ok(invalid_found)
    }

    /// Activate the best available chain, reorganizing as needed.
    pub fn activate_best_chain(
        &mut self,
        new_block: Option<&Block>,
    ) -> Result<(), ChainstateError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.flush()?;
                return Ok(());
            }

            let Some(target) = self.find_most_work_chain() else {
                return Ok(());
            };
            if Some(target) == self.tip() {
                return Ok(());
            }

            self.activate_best_chain_step(target, new_block)?;

            if let Some(tip) = self.tip() {
                let node = self.index.node(tip);
                let hash = node.hash;
                let tip_height = node.height;
                self.notifier.tip_updated(&hash, tip_height);
                if let Some(stop) = self.options.stop_at_height {
                    if tip_height >= stop {
                        eprintln!("stop-at-height reached at {tip_height}; halting activation");
                        self.shutdown.store(true, Ordering::Relaxed);
                        self.flush()?;
                        return Ok(());
                    }
                }
            }

            if Some(target) == self.tip() {
                return Ok(());
            }
        }
    }

    // ---- tip transitions ------------------------------------------

    fn monolith_active_at(&self, id: Option<BlockId>) -> bool {
        match id {
            Some(id) => {
                self.index.median_time_past(id)
                    >= self.params.consensus.monolith_activation_time
            }
            None => false,
        }
    }

    fn assume_valid_covers(&self, id: BlockId) -> bool {
        let assume_valid = self
            .options
            .assume_valid
            .unwrap_or(self.params.consensus.default_assume_valid);
        if assume_valid == [0u8; 32] {
            return false;
        }
        let Some(trusted) = self.index.find(&assume_valid) else {
            return false;
        };
        let Some(best_header) = self.best_header else {
            return false;
        };
        let height = self.index.node(id).height;
        if self.index.ancestor(trusted, height) != Some(id) {
            return false;
        }
        if self.index.ancestor(best_header, height) != Some(id) {
            return false;
        }
        let minimum = U256::from_little_endian(&self.params.consensus.minimum_chain_work);
        self.index.node(best_header).chain_work >= minimum
    }

    fn connect_tip(&mut self, id: BlockId, provided: Option<&Block>) -> Result<(), ChainstateError> {
        let parent = self.index.node(id).parent;
        if parent != self.tip() {
            return Err(ChainstateError::Corrupt("connect target does not extend tip"));
        }

        let block_storage;
        let block = match provided {
            Some(block) => block,
            None => {
                block_storage = self.read_block(id)?;
                &block_storage
            }
        };

        let consensus = &self.params.consensus;
        let height = self.index.node(id).height;
        let block_hash = self.index.node(id).hash;

        let (prev_info, enforce_bip30) = match parent {
            Some(parent_id) => {
                let parent_node = self.index.node(parent_id);
                let prev_info = TipInfo {
                    height: parent_node.height,
                    time: parent_node.header.time as i64,
                    median_time_past: self.index.median_time_past(parent_id),
                };
                // BIP34 made coinbase overwrites impossible; if the
                // activation block hash matches, the scan is skipped.
                let bip34_ancestor = self.index.ancestor(parent_id, consensus.bip34_height);
                let excused = bip34_ancestor
                    .map(|ancestor| self.index.node(ancestor).hash == consensus.bip34_hash)
                    .unwrap_or(false);
                (prev_info, !excused)
            }
            None => (
                TipInfo {
                    height: -1,
                    time: 0,
                    median_time_past: 0,
                },
                true,
            ),
        };

        let script_flags = block_script_flags(&prev_info, consensus);
        let check_scripts = !self.assume_valid_covers(id);
        let monolith_before = self.monolith_active_at(parent);

        let base = StoreCoinsView::new(Arc::clone(&self.store));
        let mut view = CoinsCache::new(&base);
        {
            use crate::coins::CoinsView;
            let view_best = base.best_block()?;
            let expected = parent.map(|parent_id| self.index.node(parent_id).hash);
            if view_best != expected {
                return Err(ChainstateError::Corrupt("utxo set out of sync with chain"));
            }
        }

        let outcome = {
            let index_ref = &self.index;
            let mtp_at_height = move |h: i32| -> i64 {
                match parent.and_then(|parent_id| index_ref.ancestor(parent_id, h)) {
                    Some(ancestor) => index_ref.median_time_past(ancestor),
                    None => 0,
                }
            };
            let ctx = ConnectContext {
                params: &self.params,
                height,
                block_hash,
                prev_median_time_past: prev_info.median_time_past,
                script_flags,
                verify_sequence_locks: consensus.csv_active(height),
                enforce_bip30,
                check_scripts,
                mtp_at_height: &mtp_at_height,
            };
            connect_block(
                block,
                &ctx,
                &mut view,
                self.script_checker.as_ref(),
                self.options.max_block_size,
                false,
            )?
        };

        let mut batch = WriteBatch::new();

        // Journal the undo data before the new tip becomes visible.
        if height > 0 {
            let prev_hash = self.index.node(id).header.prev_block;
            let undo_bytes = outcome.undo.encode();
            let undo_location = self.undo_files.append_with_checksum(&undo_bytes, &prev_hash)?;
            self.record_undo_file(&mut batch, undo_location)?;
            let node = self.index.node_mut(id);
            node.undo_location = Some(undo_location);
            node.status = node.status.with_undo(true);
        }
        self.index.raise_validity(id, BlockValidity::Scripts);

        // Advance finalization to max-reorg-depth below the new tip; it
        // never leaves the active chain by construction.
        let finalize_height = height - self.options.max_reorg_depth;
        if finalize_height >= 0 {
            if let Some(to_finalize) = self.index.ancestor(id, finalize_height) {
                self.finalize_internal(to_finalize).map_err(|err| match err {
                    ChainstateError::Rejected(rejection) => ChainstateError::Rejected(Rejection {
                        kind: RejectionKind::CorruptionPossible,
                        reason: rejection.reason,
                        debug: rejection.debug,
                    }),
                    other => other,
                })?;
            }
        }

        view.flush_to_batch(&mut batch);
        batch.put(
            Column::HeightIndex,
            (height as u32).to_be_bytes().to_vec(),
            block_hash.to_vec(),
        );
        if self.options.tx_index {
            for (tx_index, txid) in outcome.txids.iter().enumerate() {
                let mut value = block_hash.to_vec();
                value.extend_from_slice(&(tx_index as u32).to_le_bytes());
                batch.put(Column::TxIndex, txid.to_vec(), value);
            }
        }
        self.flush_index_into(&mut batch);
        self.store.write_batch(&batch)?;

        self.active_chain.push(id);

        // Mempool first, then the connected block, then the tip: the
        // notification order observers rely on.
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.vin {
                self.mempool.remove_conflicts(&input.prevout);
            }
        }
        self.mempool.remove_for_block(&outcome.txids);
        self.notifier.transactions_removed(&outcome.txids);
        if !monolith_before && self.monolith_active_at(Some(id)) {
            self.mempool.clear();
        }
        self.notifier.block_connected(block, height);
        Ok(())
    }

    fn disconnect_tip(&mut self) -> Result<(), ChainstateError> {
        let tip = self
            .tip()
            .ok_or(ChainstateError::Corrupt("no tip to disconnect"))?;
        let node_height = self.index.node(tip).height;
        if node_height == 0 {
            return Err(ChainstateError::Corrupt("cannot disconnect genesis"));
        }
        if Some(tip) == self.finalized {
            // Walking back over the finalization point is forbidden by
            // construction; the pointer retreats with the tip.
            self.finalized = self.index.node(tip).parent;
        }

        let block = self.read_block(tip)?;
        let undo = self.read_undo(tip)?;

        let base = StoreCoinsView::new(Arc::clone(&self.store));
        {
            use crate::coins::CoinsView;
            if base.best_block()? != Some(self.index.node(tip).hash) {
                return Err(ChainstateError::Corrupt("utxo set out of sync with chain"));
            }
        }
        let mut view = CoinsCache::new(&base);
        if disconnect_block(&block, &undo, &mut view)? == DisconnectResult::Unclean {
            eprintln!("unclean disconnect at height {node_height}");
        }

        let mut batch = WriteBatch::new();
        view.flush_to_batch(&mut batch);
        batch.delete(Column::HeightIndex, (node_height as u32).to_be_bytes().to_vec());
        if self.options.tx_index {
            for tx in &block.transactions {
                batch.delete(Column::TxIndex, tx.txid().to_vec());
            }
        }
        self.flush_index_into(&mut batch);
        self.store.write_batch(&batch)?;

        let monolith_before = self.monolith_active_at(Some(tip));
        self.active_chain.pop();

        // Deactivating the monolith opcodes strands transactions that
        // use them; flush rather than re-filter.
        if monolith_before && !self.monolith_active_at(self.tip()) {
            self.mempool.clear();
        } else {
            for tx in block.transactions.iter().skip(1) {
                // Rejected resurrections are simply dropped.
                let _ = self.mempool.resubmit(tx);
            }
        }

        self.notifier.block_disconnected(&block, node_height);
        Ok(())
    }
}

impl<S: KeyValueStore> ChainState<S> {
    /// Walk the active chain verifying stored blocks against their undo
    /// journals. Bounded by `depth` blocks back from the tip; stops
    /// early on shutdown.
    pub fn verify_chain(&self, depth: i32) -> Result<(), ChainstateError> {
        let Some(tip) = self.tip() else {
            return Ok(());
        };
        let stop_height = (self.index.node(tip).height - depth).max(1);
        let mut walk = Some(tip);
        while let Some(id) = walk {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let node = self.index.node(id);
            if node.height < stop_height {
                break;
            }
            let block = self.read_block(id)?;
            if block.header.hash() != node.hash {
                return Err(ChainstateError::Corrupt("stored block hash mismatch"));
            }
            check_block(
                &block,
                &self.params.consensus,
                self.options.max_block_size,
                true,
                true,
            )
            .map_err(|_| ChainstateError::Corrupt("stored block fails validation"))?;
            if node.height > 0 {
                self.read_undo(id)?;
            }
            walk = node.parent;
        }
        Ok(())
    }
}
