//! Script verification flags and their composition over the upgrade
//! schedule.

use candyd_consensus::ConsensusParams;

pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: u32 = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: u32 = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: u32 = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: u32 = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: u32 = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: u32 = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: u32 = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
pub const SCRIPT_VERIFY_MINIMALIF: u32 = 1 << 13;
pub const SCRIPT_VERIFY_NULLFAIL: u32 = 1 << 14;
pub const SCRIPT_VERIFY_COMPRESSED_PUBKEYTYPE: u32 = 1 << 15;
pub const SCRIPT_ENABLE_SIGHASH_FORKID: u32 = 1 << 16;
pub const SCRIPT_ENABLE_MONOLITH_OPCODES: u32 = 1 << 17;
pub const SCRIPT_ENABLE_CHANGE_FORKID: u32 = 1 << 18;

/// Flags every valid block must satisfy regardless of policy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: u32 =
    SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICTENC | SCRIPT_ENABLE_SIGHASH_FORKID;

/// Policy-level flags on top of the mandatory set. Failures under these
/// alone are standardness rejections, not consensus failures.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_SIGPUSHONLY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;

pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: u32 =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;

/// BIP16 switchover, by block timestamp.
const BIP16_SWITCH_TIME: i64 = 1_333_238_400;

/// Summary of the chain tip a block builds on, enough to compose the
/// block's script flag set.
#[derive(Clone, Copy, Debug)]
pub struct TipInfo {
    pub height: i32,
    pub time: i64,
    pub median_time_past: i64,
}

/// Flag set under which the scripts of the block at `tip.height + 1`
/// are executed.
pub fn block_script_flags(tip: &TipInfo, params: &ConsensusParams) -> u32 {
    let next_height = tip.height + 1;

    let mut flags = if tip.time >= BIP16_SWITCH_TIME {
        SCRIPT_VERIFY_P2SH
    } else {
        SCRIPT_VERIFY_NONE
    };

    if next_height >= params.bip66_height {
        flags |= SCRIPT_VERIFY_DERSIG;
    }

    if next_height >= params.bip65_height {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }

    if params.csv_active(next_height) {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
    }

    // Replay-protected signatures; the CDY fork adds its own fork id on
    // top of the UAHF one. These gates read the tip height, so the new
    // rules start one block after the activation block.
    if params.cdy_active(tip.height) {
        flags |= SCRIPT_VERIFY_STRICTENC;
        flags |= SCRIPT_ENABLE_SIGHASH_FORKID;
        flags |= SCRIPT_ENABLE_CHANGE_FORKID;
    } else if params.uahf_active(tip.height) {
        flags |= SCRIPT_VERIFY_STRICTENC;
        flags |= SCRIPT_ENABLE_SIGHASH_FORKID;
    }

    if params.daa_active(tip.height) {
        flags |= SCRIPT_VERIFY_LOW_S;
        flags |= SCRIPT_VERIFY_NULLFAIL;
    }

    if tip.median_time_past >= params.monolith_activation_time {
        flags |= SCRIPT_ENABLE_MONOLITH_OPCODES;
    }

    flags
}
