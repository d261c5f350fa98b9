//! Consensus-wide constants shared across validation.

/// Coinbase transaction outputs can only be spent after this number of
/// new blocks.
pub const COINBASE_MATURITY: i32 = 100;

/// One megabyte, the sigop bucketing unit.
pub const ONE_MEGABYTE: u64 = 1_000_000;

/// The maximum allowed size for a serialized block after the monolith
/// upgrade (network rule).
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 32_000_000;

/// Blocks may not exceed this size before the monolith upgrade.
pub const LEGACY_MAX_BLOCK_SIZE: u64 = 8 * ONE_MEGABYTE;

/// The maximum allowed number of signature check operations per MB in a
/// block (network rule).
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;

/// Allowed number of signature check operations per transaction.
pub const MAX_TX_SIGOPS_COUNT: u64 = 20_000;

/// Serialized size of an empty transaction; used to bail out early on
/// blocks that cannot possibly fit their transaction count.
pub const MIN_TRANSACTION_SIZE: u64 = 10;

/// Coinbase scriptSig length bounds (network rule).
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum amount of time that a block timestamp is allowed to exceed
/// network-adjusted time on the legacy (pre-fork) rules.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Use median-time-past instead of block time for lock-time cutoffs.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Interpret sequence numbers as relative lock-times (BIP68).
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;

/// Standard locktime verify flags used by non-consensus code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_MEDIAN_TIME_PAST;

/// Default depth of the finalization pointer below the active tip.
pub const DEFAULT_MAX_REORG_DEPTH: i32 = 10;

/// Number of blocks a candidate may run ahead of the tip before its body
/// is ignored when unrequested.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// Sigop ceiling for a block of the given serialized size, bucketed per
/// started megabyte.
pub fn max_block_sigops(block_size: u64) -> u64 {
    let buckets = 1 + (block_size.saturating_sub(1)) / ONE_MEGABYTE;
    buckets * MAX_BLOCK_SIGOPS_PER_MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigops_bucket_per_started_megabyte() {
        assert_eq!(max_block_sigops(1), 20_000);
        assert_eq!(max_block_sigops(ONE_MEGABYTE), 20_000);
        assert_eq!(max_block_sigops(ONE_MEGABYTE + 1), 40_000);
        assert_eq!(max_block_sigops(8 * ONE_MEGABYTE), 160_000);
    }
}
