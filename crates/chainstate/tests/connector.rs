//! Direct connector tests: reject reasons, relative lock-times, and
//! the non-mandatory script downgrade.

mod common;

use candyd_chainstate::connect::{connect_block, disconnect_block, ConnectContext};
use candyd_chainstate::{Coin, CoinsCache, RejectionKind, StoreCoinsView};
use candyd_consensus::{ChainParams, Network, COIN};
use candyd_primitives::block::{Block, BlockHeader};
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use candyd_script::flags::{MANDATORY_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_CLEANSTACK};
use candyd_script::{AlwaysValid, ScriptError};
use candyd_storage::memory::MemoryStore;
use common::REGTEST_BITS;

fn params() -> ChainParams {
    ChainParams::for_network(Network::Regtest)
}

fn build_block(height: u32, txs: Vec<Transaction>, coinbase_value: i64) -> Block {
    let mut script_sig = candyd_script::structural::height_script_prefix(height as i64);
    script_sig.push(0);
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
    let merkle_root = candyd_primitives::merkle::block_merkle_root(&transactions, &mut mutated);
    let mut header = BlockHeader {
        version: 4,
        prev_block: [0xaa; 32],
        merkle_root,
        height,
        reserved: [0u32; 7],
        time: 1_400_000_000,
        bits: REGTEST_BITS,
        nonce: [0u8; 32],
        solution: Vec::new(),
    };
    mine(&mut header);
    Block {
        header,
        transactions,
    }
}

fn mine(header: &mut BlockHeader) {
    use candyd_pow::difficulty::{compact_to_target, hash_meets_target};
    let target = compact_to_target(header.bits).expect("bits");
    let mut counter: u64 = 0;
    loop {
        header.nonce[..8].copy_from_slice(&counter.to_le_bytes());
        if hash_meets_target(&header.hash(), &target) {
            return;
        }
        counter += 1;
    }
}

fn seed_coin(view: &mut CoinsCache<'_>, outpoint: OutPoint, value: i64, height: u32, coinbase: bool) {
    view.add_coin(
        outpoint,
        Coin {
            value,
            script_pubkey: vec![0x51],
            height,
            is_coinbase: coinbase,
        },
        false,
    )
    .expect("seed coin");
}

fn context<'a>(
    params: &'a ChainParams,
    height: i32,
    block_hash: candyd_primitives::Hash256,
    script_flags: u32,
    mtp_at_height: &'a dyn Fn(i32) -> i64,
) -> ConnectContext<'a> {
    ConnectContext {
        params,
        height,
        block_hash,
        prev_median_time_past: 1_399_999_000,
        script_flags,
        verify_sequence_locks: true,
        enforce_bip30: false,
        check_scripts: true,
        mtp_at_height,
    }
}

fn spend(prevout: OutPoint, version: i32, sequence: u32, value: i64) -> Transaction {
    Transaction {
        version,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[test]
fn premature_coinbase_spend_reason() {
    let params = params();
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);
    let mut view = CoinsCache::new(&base);
    let outpoint = OutPoint {
        hash: [1u8; 32],
        index: 0,
    };
    seed_coin(&mut view, outpoint.clone(), 50 * COIN, 10, true);

    let block = build_block(50, vec![spend(outpoint, 1, SEQUENCE_FINAL, 50 * COIN)], 50 * COIN);
    let mtp = |_h: i32| 0i64;
    let ctx = context(&params, 50, block.header.hash(), 0, &mtp);

    let err = connect_block(&block, &ctx, &mut view, &AlwaysValid, 8_000_000, true).unwrap_err();
    let rejection = err.rejection().expect("rejection");
    assert_eq!(rejection.reason, "bad-txns-premature-spend-of-coinbase");
    assert_eq!(rejection.kind, RejectionKind::Invalid { dos: 100 });
}

#[test]
fn missing_input_reason() {
    let params = params();
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);
    let mut view = CoinsCache::new(&base);

    let outpoint = OutPoint {
        hash: [2u8; 32],
        index: 0,
    };
    let block = build_block(50, vec![spend(outpoint, 1, SEQUENCE_FINAL, COIN)], 50 * COIN);
    let mtp = |_h: i32| 0i64;
    let ctx = context(&params, 50, block.header.hash(), 0, &mtp);

    let err = connect_block(&block, &ctx, &mut view, &AlwaysValid, 8_000_000, true).unwrap_err();
    assert_eq!(
        err.rejection().expect("rejection").reason,
        "bad-txns-inputs-missingorspent"
    );
}

#[test]
fn bip68_height_lock_enforced() {
    let params = params();
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);

    let outpoint = OutPoint {
        hash: [3u8; 32],
        index: 0,
    };
    // Coin born at height 10, relative lock of 5 blocks: spendable
    // from height 14 upward (10 + 5 - 1 < h).
    let locked = spend(outpoint.clone(), 2, 5, 40 * COIN);

    let mtp = |_h: i32| 0i64;

    let mut view = CoinsCache::new(&base);
    seed_coin(&mut view, outpoint.clone(), 40 * COIN, 10, false);
    let early = build_block(12, vec![locked.clone()], 50 * COIN);
    let ctx = context(&params, 12, early.header.hash(), 0, &mtp);
    let err = connect_block(&early, &ctx, &mut view, &AlwaysValid, 8_000_000, true).unwrap_err();
    assert_eq!(err.rejection().expect("rejection").reason, "bad-txns-nonfinal");

    let mut view = CoinsCache::new(&base);
    seed_coin(&mut view, outpoint, 40 * COIN, 10, false);
    let late = build_block(15, vec![locked], 50 * COIN);
    let ctx = context(&params, 15, late.header.hash(), 0, &mtp);
    connect_block(&late, &ctx, &mut view, &AlwaysValid, 8_000_000, true).expect("mature lock");
}

#[test]
fn non_mandatory_script_failure_downgrades() {
    let params = params();
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);
    let mut view = CoinsCache::new(&base);
    let outpoint = OutPoint {
        hash: [4u8; 32],
        index: 0,
    };
    seed_coin(&mut view, outpoint.clone(), 10 * COIN, 10, false);

    let block = build_block(50, vec![spend(outpoint, 1, SEQUENCE_FINAL, 10 * COIN)], 50 * COIN);
    let mtp = |_h: i32| 0i64;

    // A checker that only objects under CLEANSTACK, a policy flag.
    let fussy = |_sig: &[u8],
                 _pubkey: &[u8],
                 _tx: &Transaction,
                 _input: usize,
                 _value: i64,
                 flags: u32|
     -> Result<(), ScriptError> {
        if flags & SCRIPT_VERIFY_CLEANSTACK != 0 {
            Err(ScriptError {
                reason: "cleanstack violation",
            })
        } else {
            Ok(())
        }
    };

    let flags = MANDATORY_SCRIPT_VERIFY_FLAGS | SCRIPT_VERIFY_CLEANSTACK;
    let ctx = context(&params, 50, block.header.hash(), flags, &mtp);
    let err = connect_block(&block, &ctx, &mut view, &fussy, 8_000_000, true).unwrap_err();
    let rejection = err.rejection().expect("rejection");
    assert_eq!(rejection.kind, RejectionKind::NonStandard);
    assert_eq!(rejection.reason, "non-mandatory-script-verify-flag");

    // A checker that always fails is a consensus violation.
    let hostile = |_sig: &[u8],
                   _pubkey: &[u8],
                   _tx: &Transaction,
                   _input: usize,
                   _value: i64,
                   _flags: u32|
     -> Result<(), ScriptError> {
        Err(ScriptError {
            reason: "no scripts today",
        })
    };
    let mut view = CoinsCache::new(&base);
    seed_coin(
        &mut view,
        OutPoint {
            hash: [4u8; 32],
            index: 0,
        },
        10 * COIN,
        10,
        false,
    );
    let ctx = context(&params, 50, block.header.hash(), flags, &mtp);
    let err = connect_block(&block, &ctx, &mut view, &hostile, 8_000_000, true).unwrap_err();
    let rejection = err.rejection().expect("rejection");
    assert_eq!(rejection.reason, "mandatory-script-verify-flag-failed");
    assert_eq!(rejection.kind, RejectionKind::Invalid { dos: 100 });
}

#[test]
fn connect_then_disconnect_is_identity() {
    let params = params();
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);
    let mut view = CoinsCache::new(&base);
    let outpoint = OutPoint {
        hash: [5u8; 32],
        index: 0,
    };
    seed_coin(&mut view, outpoint.clone(), 30 * COIN, 10, false);

    // Persist the seed so the connect operates over a real backing
    // set.
    let mut batch = candyd_storage::WriteBatch::new();
    view.flush_to_batch(&mut batch);
    use candyd_storage::KeyValueStore;
    store.write_batch(&batch).expect("seed commit");

    let before = store
        .scan_prefix(candyd_storage::Column::Utxo, b"")
        .expect("scan");

    let block = build_block(
        50,
        vec![spend(outpoint, 1, SEQUENCE_FINAL, 29 * COIN)],
        51 * COIN,
    );
    let mtp = |_h: i32| 0i64;
    let ctx = context(&params, 50, block.header.hash(), 0, &mtp);

    let mut view = CoinsCache::new(&base);
    let outcome =
        connect_block(&block, &ctx, &mut view, &AlwaysValid, 8_000_000, false).expect("connect");
    assert_eq!(outcome.fees, COIN);

    let mut batch = candyd_storage::WriteBatch::new();
    view.flush_to_batch(&mut batch);
    store.write_batch(&batch).expect("connect commit");
    assert_ne!(
        store
            .scan_prefix(candyd_storage::Column::Utxo, b"")
            .expect("scan"),
        before
    );

    let mut view = CoinsCache::new(&base);
    disconnect_block(&block, &outcome.undo, &mut view).expect("disconnect");
    let mut batch = candyd_storage::WriteBatch::new();
    view.flush_to_batch(&mut batch);
    store.write_batch(&batch).expect("disconnect commit");

    assert_eq!(
        store
            .scan_prefix(candyd_storage::Column::Utxo, b"")
            .expect("scan"),
        before
    );
}

#[test]
fn legacy_undo_metadata_recovered_from_sibling_output() {
    let store = MemoryStore::new();
    let base = StoreCoinsView::new(&store);

    // Two outputs of one transaction in the set; the undo record for
    // the spent one lacks height metadata (legacy form).
    let txid = [6u8; 32];
    let mut view = CoinsCache::new(&base);
    seed_coin(
        &mut view,
        OutPoint {
            hash: txid,
            index: 1,
        },
        5 * COIN,
        77,
        false,
    );
    let mut batch = candyd_storage::WriteBatch::new();
    view.flush_to_batch(&mut batch);
    use candyd_storage::KeyValueStore;
    store.write_batch(&batch).expect("seed");

    let block = build_block(
        80,
        vec![spend(
            OutPoint {
                hash: txid,
                index: 0,
            },
            1,
            SEQUENCE_FINAL,
            5 * COIN,
        )],
        50 * COIN,
    );
    let undo = candyd_chainstate::undo::BlockUndo {
        tx_undos: vec![candyd_chainstate::undo::TxUndo {
            spent: vec![Coin {
                value: 5 * COIN,
                script_pubkey: vec![0x51],
                // Height zero: metadata must come from the sibling.
                height: 0,
                is_coinbase: false,
            }],
        }],
    };

    let mut view = CoinsCache::new(&base);
    // Make the block's own outputs visible so the disconnect can remove
    // them.
    for (index, output) in block.transactions.iter().flat_map(|tx| {
        let txid = tx.txid();
        tx.vout
            .iter()
            .enumerate()
            .map(move |(i, o)| ((txid, i as u32), o.clone()))
    }) {
        view.add_coin(
            OutPoint {
                hash: index.0,
                index: index.1,
            },
            Coin {
                value: output.value,
                script_pubkey: output.script_pubkey,
                height: 80,
                is_coinbase: false,
            },
            false,
        )
        .expect("block outputs");
    }

    disconnect_block(&block, &undo, &mut view).expect("disconnect");

    // The restored coin picked up the sibling's creation height.
    let restored = view
        .get_coin(&OutPoint {
            hash: txid,
            index: 0,
        })
        .expect("get")
        .expect("restored");
    assert_eq!(restored.height, 77);
}
