//! Block connect/disconnect against a coins view.

use candyd_consensus::constants::{max_block_sigops, COINBASE_MATURITY, MAX_TX_SIGOPS_COUNT};
use candyd_consensus::money::money_range;
use candyd_consensus::rewards::block_subsidy;
use candyd_consensus::{ChainParams, Hash256};
use candyd_primitives::block::Block;
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::{
    Transaction, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use candyd_script::flags::{
    SCRIPT_ENABLE_MONOLITH_OPCODES, SCRIPT_VERIFY_P2SH, STANDARD_NOT_MANDATORY_VERIFY_FLAGS,
};
use candyd_script::sigops::tx_sigops;
use candyd_script::structural::is_unspendable;
use candyd_script::ScriptChecker;
use rayon::prelude::*;

use crate::coins::{Coin, CoinsCache};
use crate::undo::{BlockUndo, TxUndo};
use crate::validation::{check_block, ChainstateError, Rejection};

/// Heights whose duplicate coinbases predate BIP30 enforcement.
const BIP30_EXCEPTIONS: [(i32, &str); 2] = [
    (91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    (91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

pub fn bip30_exception(height: i32, hash: &Hash256) -> bool {
    BIP30_EXCEPTIONS.iter().any(|(exception_height, hex)| {
        *exception_height == height
            && *hash == candyd_consensus::params::hash_from_hex(hex)
    })
}

/// Everything the connector needs to know about where the block lands.
pub struct ConnectContext<'a> {
    pub params: &'a ChainParams,
    pub height: i32,
    pub block_hash: Hash256,
    pub prev_median_time_past: i64,
    /// Composed via `block_script_flags` for the parent tip.
    pub script_flags: u32,
    /// BIP68 enforcement (CSV deployment active).
    pub verify_sequence_locks: bool,
    /// False once the BIP34 ancestor check has excused the scan.
    pub enforce_bip30: bool,
    /// False when assume-valid ancestry covers this block.
    pub check_scripts: bool,
    /// Median-time-past of the block at a given height on this chain,
    /// for time-based relative locks.
    pub mtp_at_height: &'a dyn Fn(i32) -> i64,
}

#[derive(Debug)]
pub struct ConnectOutcome {
    pub undo: BlockUndo,
    pub fees: i64,
    pub txids: Vec<Hash256>,
}

struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    script_sig: Vec<u8>,
    script_pubkey: Vec<u8>,
    value: i64,
}

/// Relative lock-time evaluation (BIP68). `prev_heights[i]` is the
/// height the i-th input's coin was created at.
fn sequence_locks_satisfied(
    tx: &Transaction,
    prev_heights: &[i32],
    block_height: i32,
    prev_block_mtp: i64,
    mtp_at_height: &dyn Fn(i32) -> i64,
) -> bool {
    if tx.version < 2 {
        return true;
    }
    let mut min_height = -1i32;
    let mut min_time = -1i64;
    for (input, &coin_height) in tx.vin.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let locked = input.sequence & SEQUENCE_LOCKTIME_MASK;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = mtp_at_height((coin_height - 1).max(0));
            min_time = min_time.max(coin_time + ((locked as i64) << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            min_height = min_height.max(coin_height + locked as i32 - 1);
        }
    }
    min_height < block_height && min_time < prev_block_mtp
}

/// Apply a block to the view. On success the undo journal, total fees,
/// and txids come back and the view's best block points at this block.
pub fn connect_block(
    block: &Block,
    ctx: &ConnectContext<'_>,
    view: &mut CoinsCache<'_>,
    checker: &dyn ScriptChecker,
    max_block_size: u64,
    just_check: bool,
) -> Result<ConnectOutcome, ChainstateError> {
    let consensus = &ctx.params.consensus;

    // Re-run the context-free checks in case an earlier version let a
    // bad block into the files.
    check_block(block, consensus, max_block_size, true, true)?;

    // The genesis coinbase is unspendable by construction; connecting
    // it only moves the best-block pointer.
    if ctx.block_hash == consensus.hash_genesis_block {
        if !just_check {
            view.set_best_block(ctx.block_hash);
        }
        return Ok(ConnectOutcome {
            undo: BlockUndo::default(),
            fees: 0,
            txids: block.transactions.iter().map(|tx| tx.txid()).collect(),
        });
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();

    if ctx.enforce_bip30 && !bip30_exception(ctx.height, &ctx.block_hash) {
        for (tx, txid) in block.transactions.iter().zip(&txids) {
            for output_index in 0..tx.vout.len() {
                let outpoint = OutPoint {
                    hash: *txid,
                    index: output_index as u32,
                };
                if view.have_coin(&outpoint)? {
                    return Err(Rejection::invalid(100, "bad-txns-BIP30").into());
                }
            }
        }
    }

    let block_size = block.serialized_size() as u64;
    let sigops_limit = max_block_sigops(block_size);
    let p2sh_active = ctx.script_flags & SCRIPT_VERIFY_P2SH != 0;

    let mut undo = BlockUndo::default();
    let mut script_checks: Vec<ScriptCheck> = Vec::new();
    let mut total_sigops = 0u64;
    let mut total_fees = 0i64;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let is_coinbase = tx_index == 0;
        let txid = txids[tx_index];

        let mut spent_coins: Vec<Coin> = Vec::new();
        if !is_coinbase {
            spent_coins.reserve(tx.vin.len());
            for input in &tx.vin {
                let coin = view.get_coin(&input.prevout)?.ok_or_else(|| {
                    Rejection::invalid(100, "bad-txns-inputs-missingorspent").with_debug(format!(
                        "input of {} not found",
                        hex(&txid)
                    ))
                })?;
                spent_coins.push(coin);
            }

            if ctx.verify_sequence_locks {
                let prev_heights: Vec<i32> =
                    spent_coins.iter().map(|coin| coin.height as i32).collect();
                if !sequence_locks_satisfied(
                    tx,
                    &prev_heights,
                    ctx.height,
                    ctx.prev_median_time_past,
                    ctx.mtp_at_height,
                ) {
                    return Err(Rejection::invalid(100, "bad-txns-nonfinal").into());
                }
            }
        }

        // Sigops need the spent scripts, so they are counted again here
        // with P2SH included.
        let tx_sigops_count = tx_sigops(tx, p2sh_active, |input_index| {
            spent_coins
                .get(input_index)
                .map(|coin| coin.script_pubkey.as_slice())
        });
        if tx_sigops_count > MAX_TX_SIGOPS_COUNT {
            return Err(Rejection::invalid(100, "bad-txn-sigops").into());
        }
        total_sigops += tx_sigops_count;
        if total_sigops > sigops_limit {
            return Err(Rejection::invalid(100, "bad-blk-sigops").into());
        }

        if !is_coinbase {
            let mut value_in = 0i64;
            for (input_index, coin) in spent_coins.iter().enumerate() {
                if coin.is_coinbase {
                    let depth = ctx.height as i64 - coin.height as i64;
                    if depth < COINBASE_MATURITY as i64 {
                        return Err(Rejection::invalid(100, "bad-txns-premature-spend-of-coinbase")
                            .with_debug(format!("tried to spend coinbase at depth {depth}"))
                            .into());
                    }
                }
                if !money_range(coin.value) {
                    return Err(Rejection::invalid(100, "bad-txns-inputvalues-outofrange").into());
                }
                value_in = value_in
                    .checked_add(coin.value)
                    .filter(|total| money_range(*total))
                    .ok_or_else(|| Rejection::invalid(100, "bad-txns-inputvalues-outofrange"))?;

                if ctx.check_scripts {
                    script_checks.push(ScriptCheck {
                        tx_index,
                        input_index,
                        script_sig: tx.vin[input_index].script_sig.clone(),
                        script_pubkey: coin.script_pubkey.clone(),
                        value: coin.value,
                    });
                }
            }

            let value_out = tx
                .value_out()
                .filter(|total| money_range(*total))
                .ok_or_else(|| Rejection::invalid(100, "bad-txns-txouttotal-toolarge"))?;
            if value_in < value_out {
                return Err(Rejection::invalid(100, "bad-txns-in-belowout")
                    .with_debug(format!("value in {value_in} < value out {value_out}"))
                    .into());
            }
            total_fees = total_fees
                .checked_add(value_in - value_out)
                .filter(|total| money_range(*total))
                .ok_or_else(|| Rejection::invalid(100, "bad-txns-fee-outofrange"))?;

            // Consume the inputs, journaling the coins for disconnect.
            let mut tx_undo = TxUndo::default();
            for (input, coin) in tx.vin.iter().zip(spent_coins) {
                view.spend_coin(&input.prevout)?
                    .ok_or(ChainstateError::Corrupt("spent coin vanished mid-connect"))?;
                tx_undo.spent.push(coin);
            }
            undo.tx_undos.push(tx_undo);
        }

        for (output_index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            view.add_coin(
                OutPoint {
                    hash: txid,
                    index: output_index as u32,
                },
                Coin {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: ctx.height as u32,
                    is_coinbase,
                },
                false,
            )?;
        }
    }

    let block_reward = block_subsidy(ctx.height, consensus)
        .checked_add(total_fees)
        .ok_or_else(|| Rejection::invalid(100, "bad-cb-amount"))?;
    let coinbase_out = block.transactions[0]
        .value_out()
        .ok_or_else(|| Rejection::invalid(100, "bad-txns-txouttotal-toolarge"))?;
    if coinbase_out > block_reward {
        return Err(Rejection::invalid(100, "bad-cb-amount")
            .with_debug(format!("actual={coinbase_out} vs limit={block_reward}"))
            .into());
    }

    // Every coinbase output must pay a whitelisted pool once the
    // protection plan is in force.
    if !ctx.params.pool_whitelist.is_empty()
        && ctx.height >= consensus.pool_protection_height
    {
        for output in &block.transactions[0].vout {
            if !ctx
                .params
                .pool_whitelist
                .iter()
                .any(|script| script == &output.script_pubkey)
            {
                return Err(Rejection::invalid(100, "blk-bad-scriptPubKey").into());
            }
        }
    }

    if ctx.check_scripts && !script_checks.is_empty() {
        let flags = ctx.script_flags;
        let result = script_checks.par_iter().try_for_each(|check| {
            let tx = &block.transactions[check.tx_index];
            checker
                .check(
                    &check.script_sig,
                    &check.script_pubkey,
                    tx,
                    check.input_index,
                    check.value,
                    flags,
                )
                .map_err(|err| (check.tx_index, check.input_index, err))
        });
        if let Err((tx_index, input_index, err)) = result {
            // A failure caused only by non-mandatory flags must not
            // split the network: downgrade it to a policy rejection.
            let has_non_mandatory = flags & STANDARD_NOT_MANDATORY_VERIFY_FLAGS != 0;
            let lacks_monolith = flags & SCRIPT_ENABLE_MONOLITH_OPCODES == 0;
            if has_non_mandatory || lacks_monolith {
                let check = script_checks
                    .iter()
                    .find(|check| check.tx_index == tx_index && check.input_index == input_index)
                    .expect("reported failure is in the batch");
                let mandatory_flags = (flags & !STANDARD_NOT_MANDATORY_VERIFY_FLAGS)
                    | SCRIPT_ENABLE_MONOLITH_OPCODES;
                let retry = checker.check(
                    &check.script_sig,
                    &check.script_pubkey,
                    &block.transactions[tx_index],
                    input_index,
                    check.value,
                    mandatory_flags,
                );
                if retry.is_ok() {
                    return Err(Rejection::non_standard("non-mandatory-script-verify-flag")
                        .with_debug(err.to_string())
                        .into());
                }
            }
            eprintln!(
                "script validation failed for tx {} input {}: {}",
                hex(&txids[tx_index]),
                input_index,
                err
            );
            return Err(Rejection::invalid(100, "mandatory-script-verify-flag-failed")
                .with_debug(err.to_string())
                .into());
        }
    }

    if !just_check {
        view.set_best_block(ctx.block_hash);
    }

    Ok(ConnectOutcome {
        undo,
        fees: total_fees,
        txids,
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Ok,
    /// State was restored, but something did not line up exactly
    /// (tolerated on legacy data).
    Unclean,
}

/// Undo a block's effects. Outputs added by the block are marked spent,
/// consumed coins are restored in reverse order, and the view's best
/// block moves to the parent.
pub fn disconnect_block(
    block: &Block,
    undo: &BlockUndo,
    view: &mut CoinsCache<'_>,
) -> Result<DisconnectResult, ChainstateError> {
    if undo.tx_undos.len() + 1 != block.transactions.len() {
        return Err(ChainstateError::Corrupt("block and undo data inconsistent"));
    }

    let mut clean = true;

    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();

        // Remove the outputs this block created, checking they match
        // the block itself.
        for (output_index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint {
                hash: txid,
                index: output_index as u32,
            };
            match view.spend_coin(&outpoint)? {
                Some(coin) => {
                    if coin.value != output.value || coin.script_pubkey != output.script_pubkey {
                        clean = false;
                    }
                }
                None => clean = false,
            }
        }

        if tx_index == 0 {
            continue;
        }

        let tx_undo = &undo.tx_undos[tx_index - 1];
        if tx_undo.spent.len() != tx.vin.len() {
            return Err(ChainstateError::Corrupt(
                "transaction and undo data inconsistent",
            ));
        }

        for (input, spent) in tx.vin.iter().zip(&tx_undo.spent).rev() {
            let mut coin = spent.clone();
            if coin.height == 0 {
                // Legacy undo records carried creation metadata only on
                // a transaction's last spent output; recover it from a
                // sibling output still in the view.
                let alternate = view
                    .find_coin_by_txid(&input.prevout.hash)?
                    .ok_or(ChainstateError::Corrupt("undo metadata unrecoverable"))?;
                coin.height = alternate.height;
                coin.is_coinbase = alternate.is_coinbase;
            }
            let overwrite = view.have_coin(&input.prevout)?;
            if overwrite {
                clean = false;
            }
            view.add_coin(input.prevout.clone(), coin, overwrite)?;
        }
    }

    view.set_best_block(block.header.prev_block);

    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}

fn hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
