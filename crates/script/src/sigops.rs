//! Signature-operation counting.

use candyd_primitives::transaction::Transaction;

use crate::structural::{is_p2sh, parse_ops, Op};

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

const MAX_PUBKEYS_PER_MULTISIG: u64 = 20;

/// Count sigops in a script. With `accurate`, a CHECKMULTISIG preceded
/// by OP_1..OP_16 counts that many keys; otherwise the 20-key maximum
/// is charged.
pub fn count_sigops(script: &[u8], accurate: bool) -> u64 {
    let mut count = 0u64;
    let mut last_opcode: Option<u8> = None;
    for op in parse_ops(script) {
        match op {
            Op::Code(code) => {
                match code {
                    OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                    OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                        count += match last_opcode {
                            Some(n) if accurate && (OP_1..=OP_16).contains(&n) => {
                                (n - OP_1 + 1) as u64
                            }
                            _ => MAX_PUBKEYS_PER_MULTISIG,
                        };
                    }
                    _ => {}
                }
                last_opcode = Some(code);
            }
            Op::Push(_, opcode) => last_opcode = Some(opcode),
            Op::Malformed => break,
        }
    }
    count
}

/// Legacy sigop count of a transaction: every scriptSig and every
/// scriptPubKey, inaccurate multisig counting, P2SH not considered.
pub fn tx_sigops_without_p2sh(tx: &Transaction) -> u64 {
    let mut count = 0u64;
    for input in &tx.vin {
        count += count_sigops(&input.script_sig, false);
    }
    for output in &tx.vout {
        count += count_sigops(&output.script_pubkey, false);
    }
    count
}

/// Sigops contributed by P2SH redeem scripts, given a resolver from
/// input index to the spent scriptPubKey. Coinbase inputs spend nothing
/// and contribute none.
pub fn tx_p2sh_sigops<'a>(
    tx: &Transaction,
    spent_script: impl Fn(usize) -> Option<&'a [u8]>,
) -> u64 {
    if tx.is_coinbase() {
        return 0;
    }
    let mut count = 0u64;
    for (index, input) in tx.vin.iter().enumerate() {
        let Some(prev_script) = spent_script(index) else {
            continue;
        };
        if !is_p2sh(prev_script) {
            continue;
        }
        // The redeem script is the final data push of the scriptSig.
        let mut redeem: Option<&[u8]> = None;
        for op in parse_ops(&input.script_sig) {
            match op {
                Op::Push(data, _) => redeem = Some(data),
                Op::Code(_) => {
                    redeem = None;
                    break;
                }
                Op::Malformed => {
                    redeem = None;
                    break;
                }
            }
        }
        if let Some(redeem) = redeem {
            count += count_sigops(redeem, true);
        }
    }
    count
}

/// Total sigop count of a transaction under the given flag set.
pub fn tx_sigops<'a>(
    tx: &Transaction,
    p2sh_active: bool,
    spent_script: impl Fn(usize) -> Option<&'a [u8]>,
) -> u64 {
    let mut count = tx_sigops_without_p2sh(tx);
    if p2sh_active {
        count += tx_p2sh_sigops(tx, spent_script);
    }
    count
}
