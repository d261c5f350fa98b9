//! Connector-level scenarios: maturity, BIP30, reward caps, and the
//! connect/disconnect identity.

mod common;

use candyd_chainstate::{BlockValidity, RejectionKind};
use candyd_consensus::COIN;
use candyd_primitives::outpoint::OutPoint;
use candyd_storage::KeyValueStore;
use common::*;

#[test]
fn genesis_bootstrap_creates_single_root() {
    let harness = harness("bootstrap");
    assert_eq!(harness.state.tip_height(), 0);
    assert_eq!(
        harness.state.tip_hash(),
        Some(harness.factory.genesis_hash())
    );
    // The genesis coinbase is unspendable: the UTXO set starts empty.
    let utxos = harness
        .store
        .scan_prefix(candyd_storage::Column::Utxo, b"")
        .expect("scan");
    assert!(utxos.is_empty());
}

#[test]
fn simple_chain_extends_and_creates_coins() {
    let mut harness = harness("extend");
    let genesis = harness.factory.genesis_hash();
    let block = harness.factory.simple_block(genesis, 0);
    let coinbase_txid = block.transactions[0].txid();
    let now = block.header.time as i64;

    let is_new = harness
        .state
        .process_new_block(&block, now)
        .expect("process");
    assert!(is_new);
    assert_eq!(harness.state.tip_height(), 1);

    let coin = harness
        .state
        .utxo(&OutPoint {
            hash: coinbase_txid,
            index: 0,
        })
        .expect("utxo")
        .expect("coinbase coin exists");
    assert_eq!(coin.value, 50 * COIN);
    assert!(coin.is_coinbase);
    assert_eq!(coin.height, 1);

    // Re-submitting the same block is a no-op.
    let is_new = harness
        .state
        .process_new_block(&block, now)
        .expect("process again");
    assert!(!is_new);
}

#[test]
fn premature_coinbase_spend_is_rejected() {
    let mut harness = harness("maturity");
    let genesis = harness.factory.genesis_hash();
    let first = harness.factory.simple_block(genesis, 0);
    let coinbase_txid = first.transactions[0].txid();
    let now = first.header.time as i64;
    harness.state.process_new_block(&first, now).expect("b1");

    // 98 filler blocks put the tip at height 99.
    let tip = extend_chain(&mut harness, first.header.hash(), 98, 0);
    assert_eq!(harness.state.tip_height(), 99);

    // A spend at height 100 sits at depth 99: one short of maturity.
    let spend = spend_tx(
        OutPoint {
            hash: coinbase_txid,
            index: 0,
        },
        50 * COIN,
    );
    let premature = harness
        .factory
        .block_on(tip, vec![spend.clone()], 50 * COIN, 0);
    let now = premature.header.time as i64;
    harness
        .state
        .process_new_block(&premature, now)
        .expect("accepted into the index");
    // The block failed to connect: tip unchanged, block marked failed.
    assert_eq!(harness.state.tip_height(), 99);
    let id = harness
        .state
        .index()
        .find(&premature.header.hash())
        .expect("indexed");
    assert!(harness.state.index().node(id).status.has_failed());

    // One more filler block, then the spend matures at height 101.
    let tip = extend_chain(&mut harness, tip, 1, 1);
    let mature = harness.factory.block_on(tip, vec![spend], 50 * COIN, 0);
    let now = mature.header.time as i64;
    harness.state.process_new_block(&mature, now).expect("mature spend");
    assert_eq!(harness.state.tip_height(), 101);
    assert_eq!(harness.state.tip_hash(), Some(mature.header.hash()));
}

#[test]
fn coinbase_overpay_is_rejected() {
    let mut harness = harness("cb-amount");
    let genesis = harness.factory.genesis_hash();

    // One satoshi over the subsidy.
    let block = harness
        .factory
        .block_on(genesis, Vec::new(), 50 * COIN + 1, 0);
    let now = block.header.time as i64;
    harness
        .state
        .process_new_block(&block, now)
        .expect("accepted into the index");
    assert_eq!(harness.state.tip_height(), 0);
    let id = harness
        .state
        .index()
        .find(&block.header.hash())
        .expect("indexed");
    assert!(harness.state.index().node(id).status.has_failed());
}

#[test]
fn fees_extend_the_coinbase_allowance() {
    let mut harness = harness("fees");
    let genesis = harness.factory.genesis_hash();
    let first = harness.factory.simple_block(genesis, 0);
    let coinbase_txid = first.transactions[0].txid();
    let now = first.header.time as i64;
    harness.state.process_new_block(&first, now).expect("b1");
    let tip = extend_chain(&mut harness, first.header.hash(), 100, 0);

    // Spend 50, keep 49: one coin of fees for the miner.
    let spend = spend_tx(
        OutPoint {
            hash: coinbase_txid,
            index: 0,
        },
        49 * COIN,
    );
    let block = harness
        .factory
        .block_on(tip, vec![spend], 51 * COIN, 0);
    let now = block.header.time as i64;
    harness.state.process_new_block(&block, now).expect("fee claim");
    assert_eq!(harness.state.tip_hash(), Some(block.header.hash()));
}

#[test]
fn bip30_duplicate_coinbase_rejected() {
    let mut harness = harness("bip30");
    let genesis = harness.factory.genesis_hash();

    // Two blocks at different heights whose coinbases share a txid:
    // craft them with identical scriptSigs. Heights 1 and 2 both fit
    // the same fixed prefix because BIP34 is inactive on regtest.
    let first = harness.factory.simple_block(genesis, 7);
    let now = first.header.time as i64;
    harness.state.process_new_block(&first, now).expect("b1");

    let mut duplicate = harness
        .factory
        .block_on(first.header.hash(), Vec::new(), 50 * COIN, 7);
    // Rewrite the coinbase to byte-match the first block's, restoring
    // the merkle commitment and re-mining.
    duplicate.transactions[0] = first.transactions[0].clone();
    let mut mutated = false;
    duplicate.header.merkle_root =
        candyd_primitives::merkle::block_merkle_root(&duplicate.transactions, &mut mutated);
    remine(&mut duplicate);

    let now = duplicate.header.time as i64;
    harness
        .state
        .process_new_block(&duplicate, now)
        .expect("accepted into the index");
    // Connection failed on the unspent duplicate: tip stays at 1.
    assert_eq!(harness.state.tip_height(), 1);
    let id = harness
        .state
        .index()
        .find(&duplicate.header.hash())
        .expect("indexed");
    assert!(harness.state.index().node(id).status.has_failed());
}

#[test]
fn disconnect_restores_utxo_set_bitwise() {
    let mut harness = harness("undo-identity");
    let genesis = harness.factory.genesis_hash();
    let first = harness.factory.simple_block(genesis, 0);
    let coinbase_txid = first.transactions[0].txid();
    let now = first.header.time as i64;
    harness.state.process_new_block(&first, now).expect("b1");
    let tip = extend_chain(&mut harness, first.header.hash(), 100, 0);

    let before = utxo_snapshot(&harness.store);

    // A block that spends a matured coinbase and creates two outputs.
    let mut spend = spend_tx(
        OutPoint {
            hash: coinbase_txid,
            index: 0,
        },
        20 * COIN,
    );
    spend.vout.push(candyd_primitives::transaction::TxOut {
        value: 29 * COIN,
        script_pubkey: vec![0x52],
    });
    let block = harness
        .factory
        .block_on(tip, vec![spend], 51 * COIN, 0);
    let now = block.header.time as i64;
    harness.state.process_new_block(&block, now).expect("connect");
    assert_ne!(utxo_snapshot(&harness.store), before);

    // Disconnect via invalidation; the UTXO set must match bitwise.
    harness
        .state
        .invalidate_block(&block.header.hash())
        .expect("invalidate");
    assert_eq!(utxo_snapshot(&harness.store), before);
}

#[test]
fn validity_reaches_scripts_on_connect() {
    let mut harness = harness("validity");
    let genesis = harness.factory.genesis_hash();
    let block = harness.factory.simple_block(genesis, 0);
    let now = block.header.time as i64;
    harness.state.process_new_block(&block, now).expect("process");

    let id = harness
        .state
        .index()
        .find(&block.header.hash())
        .expect("indexed");
    let status = harness.state.index().node(id).status;
    assert!(status.is_valid(BlockValidity::Scripts));
    assert!(status.has_data());
    assert!(status.has_undo());
}

#[test]
fn rejection_kinds_classify_bans() {
    use candyd_chainstate::Rejection;
    let invalid = Rejection::invalid(100, "bad-cb-amount");
    assert!(invalid.marks_failed());
    assert_eq!(invalid.kind, RejectionKind::Invalid { dos: 100 });

    let non_standard = Rejection::non_standard("non-mandatory-script-verify-flag");
    assert!(!non_standard.marks_failed());

    let corruption = Rejection::corruption("bad-txnmrklroot");
    assert!(!corruption.marks_failed());
}

/// Re-grind a modified block's nonce (the factory mined the original).
fn remine(block: &mut candyd_primitives::block::Block) {
    use candyd_pow::difficulty::{compact_to_target, hash_meets_target};
    let target = compact_to_target(block.header.bits).expect("bits");
    let mut counter: u64 = 0;
    loop {
        block.header.nonce[..8].copy_from_slice(&counter.to_le_bytes());
        if hash_meets_target(&block.header.hash(), &target) {
            return;
        }
        counter += 1;
    }
}
