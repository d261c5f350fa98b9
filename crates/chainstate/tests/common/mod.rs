//! Shared harness for chainstate integration tests: an in-memory store,
//! throwaway flat-file directories, and a deterministic block factory
//! for the regtest network.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use candyd_chainstate::{ChainState, ChainstateOptions};
use candyd_consensus::{ChainParams, Network, COIN};
use candyd_pow::difficulty::{compact_to_target, hash_meets_target};
use candyd_primitives::block::{Block, BlockHeader};
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use candyd_primitives::Hash256;
use candyd_script::structural::height_script_prefix;
use candyd_storage::memory::MemoryStore;
use candyd_storage::{Column, KeyValueStore};

pub const REGTEST_BITS: u32 = 0x207f_ffff;

static HARNESS_COUNTER: AtomicU32 = AtomicU32::new(0);

pub struct Harness {
    pub state: ChainState<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub factory: BlockFactory,
    pub dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn harness(tag: &str) -> Harness {
    harness_with(tag, ChainstateOptions::default())
}

pub fn harness_with(tag: &str, options: ChainstateOptions) -> Harness {
    let serial = HARNESS_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "candyd-chainstate-{tag}-{}-{serial}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);

    let params = ChainParams::for_network(Network::Regtest);
    let store = Arc::new(MemoryStore::new());
    let state = ChainState::open(params.clone(), options, Arc::clone(&store), &dir)
        .expect("open chain state");
    let factory = BlockFactory::new(&params);
    Harness {
        state,
        store,
        factory,
        dir,
    }
}

/// Builds valid regtest blocks on top of any known parent, tracking
/// heights and times so callers only name the parent hash.
pub struct BlockFactory {
    params: ChainParams,
    known: HashMap<Hash256, (i32, u32)>,
}

impl BlockFactory {
    pub fn new(params: &ChainParams) -> Self {
        let genesis = &params.genesis.header;
        let mut known = HashMap::new();
        known.insert(genesis.hash(), (0, genesis.time));
        Self {
            params: params.clone(),
            known,
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.params.consensus.hash_genesis_block
    }

    pub fn height_of(&self, hash: &Hash256) -> i32 {
        self.known[hash].0
    }

    /// Mine a block on `parent` carrying `txs` after the coinbase. The
    /// coinbase pays `coinbase_value` to OP_TRUE; `salt` differentiates
    /// siblings.
    pub fn block_on(
        &mut self,
        parent: Hash256,
        txs: Vec<Transaction>,
        coinbase_value: i64,
        salt: u8,
    ) -> Block {
        let (parent_height, parent_time) = self.known[&parent];
        let height = parent_height + 1;
        let time = parent_time + 600;

        let mut script_sig = height_script_prefix(height as i64);
        script_sig.push(salt);
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: coinbase_value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };

        let mut transactions = vec![coinbase];
        transactions.extend(txs);

        let mut mutated = false;
        let merkle_root =
            candyd_primitives::merkle::block_merkle_root(&transactions, &mut mutated);
        assert!(!mutated, "test factory produced a mutated tx list");

        let mut header = BlockHeader {
            version: 4,
            prev_block: parent,
            merkle_root,
            height: height as u32,
            reserved: [0u32; 7],
            time,
            bits: REGTEST_BITS,
            nonce: [0u8; 32],
            solution: Vec::new(),
        };
        mine(&mut header);

        let block = Block {
            header,
            transactions,
        };
        self.known.insert(block.header.hash(), (height, time));
        block
    }

    /// Standard subsidy-only block.
    pub fn simple_block(&mut self, parent: Hash256, salt: u8) -> Block {
        self.block_on(parent, Vec::new(), 50 * COIN, salt)
    }
}

/// Grind the nonce until the legacy header hash meets the claimed
/// target; a couple of tries at regtest difficulty.
fn mine(header: &mut BlockHeader) {
    let target = compact_to_target(header.bits).expect("valid bits");
    let mut counter: u64 = 0;
    loop {
        header.nonce[..8].copy_from_slice(&counter.to_le_bytes());
        if hash_meets_target(&header.hash(), &target) {
            return;
        }
        counter += 1;
    }
}

/// Spend an output with a trivial scriptSig.
pub fn spend_tx(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Full contents of the persisted UTXO column plus the best-block
/// pointer, for bitwise state comparisons.
pub fn utxo_snapshot(store: &MemoryStore) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut snapshot = store.scan_prefix(Column::Utxo, b"").expect("scan utxo");
    snapshot.extend(store.scan_prefix(Column::Meta, b"coins_best_block").expect("scan meta"));
    snapshot
}

/// Extend the chain with `count` subsidy-only blocks, returning the
/// tip hash.
pub fn extend_chain(harness: &mut Harness, mut parent: Hash256, count: usize, salt: u8) -> Hash256 {
    for _ in 0..count {
        let block = harness.factory.simple_block(parent, salt);
        parent = block.header.hash();
        let now = block.header.time as i64;
        harness
            .state
            .process_new_block(&block, now)
            .expect("process block");
    }
    parent
}
