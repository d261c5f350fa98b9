//! Block and transaction validation, and the structured result model
//! the whole pipeline reports through.

use candyd_consensus::constants::{
    max_block_sigops, LEGACY_MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_SIZE, MAX_FUTURE_BLOCK_TIME,
    MAX_TX_SIGOPS_COUNT, MIN_COINBASE_SCRIPT_SIZE, MIN_TRANSACTION_SIZE,
};
use candyd_consensus::money::{money_range, MAX_MONEY};
use candyd_consensus::ConsensusParams;
use candyd_pow::difficulty::DifficultyError;
use candyd_pow::validation::{validate_pow_header, PowError};
use candyd_primitives::block::{Block, BlockHeader};
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::Transaction;
use candyd_script::sigops::tx_sigops_without_p2sh;
use candyd_script::structural::{is_commitment, starts_with_height};
use candyd_storage::StoreError;
use std::collections::HashSet;

use crate::coins::CoinsError;
use crate::flatfiles::FlatFileError;

/// How a rejection should be treated by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectionKind {
    /// Consensus violation; the source may be banned per the DoS
    /// weight.
    Invalid { dos: u32 },
    /// Policy failure; never ban.
    NonStandard,
    /// Already known; not an error for the caller.
    Duplicate,
    /// The failure may stem from local corruption; do not mark
    /// permanent and do not propagate a ban.
    CorruptionPossible,
    /// Transaction inputs are not currently available.
    MissingInputs,
    /// The submission conflicts with the finalized block.
    AgainstFinalized,
}

/// A validation verdict: kind, stable reject reason, optional debug
/// detail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: &'static str,
    pub debug: Option<String>,
}

impl Rejection {
    pub fn invalid(dos: u32, reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::Invalid { dos },
            reason,
            debug: None,
        }
    }

    pub fn non_standard(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::NonStandard,
            reason,
            debug: None,
        }
    }

    pub fn duplicate(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::Duplicate,
            reason,
            debug: None,
        }
    }

    pub fn corruption(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::CorruptionPossible,
            reason,
            debug: None,
        }
    }

    pub fn against_finalized(reason: &'static str) -> Self {
        Self {
            kind: RejectionKind::AgainstFinalized,
            reason,
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: String) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Should the block index entry be marked failed for this?
    pub fn marks_failed(&self) -> bool {
        matches!(
            self.kind,
            RejectionKind::Invalid { .. } | RejectionKind::AgainstFinalized
        )
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.debug {
            Some(debug) => write!(f, "{} ({debug})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Error type for every chain state operation. Rejections describe bad
/// input; the remaining variants are system failures that must abort
/// instead of tainting the index.
#[derive(Debug)]
pub enum ChainstateError {
    Rejected(Rejection),
    Store(StoreError),
    FlatFile(FlatFileError),
    /// Local index/state inconsistency; resync or reindex required.
    Corrupt(&'static str),
    System(String),
}

impl ChainstateError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ChainstateError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// System errors abort the node; they never mark blocks failed and
    /// never ban peers.
    pub fn is_system(&self) -> bool {
        !matches!(self, ChainstateError::Rejected(_))
    }
}

impl std::fmt::Display for ChainstateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainstateError::Rejected(rejection) => write!(f, "{rejection}"),
            ChainstateError::Store(err) => write!(f, "{err}"),
            ChainstateError::FlatFile(err) => write!(f, "{err}"),
            ChainstateError::Corrupt(message) => write!(f, "{message}"),
            ChainstateError::System(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainstateError {}

impl From<Rejection> for ChainstateError {
    fn from(rejection: Rejection) -> Self {
        ChainstateError::Rejected(rejection)
    }
}

impl From<StoreError> for ChainstateError {
    fn from(err: StoreError) -> Self {
        ChainstateError::Store(err)
    }
}

impl From<FlatFileError> for ChainstateError {
    fn from(err: FlatFileError) -> Self {
        ChainstateError::FlatFile(err)
    }
}

impl From<CoinsError> for ChainstateError {
    fn from(err: CoinsError) -> Self {
        match err {
            CoinsError::Store(err) => ChainstateError::Store(err),
            CoinsError::IllegalOverwrite => ChainstateError::Corrupt("utxo overwrite"),
        }
    }
}

impl From<DifficultyError> for ChainstateError {
    fn from(_: DifficultyError) -> Self {
        ChainstateError::Rejected(Rejection::invalid(100, "bad-diffbits"))
    }
}

fn pow_rejection(err: PowError) -> Rejection {
    match err {
        PowError::InvalidTarget | PowError::HighHash => Rejection::invalid(50, "high-hash"),
        PowError::SolutionSize { .. } => Rejection::invalid(100, "invalid-solution-size"),
        PowError::InvalidSolution => Rejection::invalid(100, "invalid-solution"),
    }
}

/// Context-free header checks: claimed PoW, and post-fork the Equihash
/// solution for the (N, K) in force at the claimed height.
pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<(), Rejection> {
    if !check_pow {
        return Ok(());
    }
    let postfork = header.height as i64 >= params.cdy_height as i64;
    validate_pow_header(header, postfork, params).map_err(pow_rejection)
}

fn check_transaction_common(tx: &Transaction) -> Result<(), Rejection> {
    if tx.vin.is_empty() {
        return Err(Rejection::invalid(10, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(Rejection::invalid(10, "bad-txns-vout-empty"));
    }

    let mut value_out: i64 = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(Rejection::invalid(100, "bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(Rejection::invalid(100, "bad-txns-vout-toolarge"));
        }
        value_out = value_out
            .checked_add(output.value)
            .filter(|total| money_range(*total))
            .ok_or_else(|| Rejection::invalid(100, "bad-txns-txouttotal-toolarge"))?;
    }

    if tx_sigops_without_p2sh(tx) > MAX_TX_SIGOPS_COUNT {
        return Err(Rejection::invalid(100, "bad-txn-sigops"));
    }

    let mut seen: HashSet<&OutPoint> = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(Rejection::invalid(100, "bad-txns-inputs-duplicate"));
        }
    }

    Ok(())
}

pub fn check_coinbase(tx: &Transaction) -> Result<(), Rejection> {
    if !tx.is_coinbase() {
        return Err(Rejection::invalid(100, "bad-cb-missing"));
    }
    check_transaction_common(tx)?;
    let script_len = tx.vin[0].script_sig.len();
    if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&script_len) {
        return Err(Rejection::invalid(100, "bad-cb-length"));
    }
    Ok(())
}

pub fn check_regular_transaction(tx: &Transaction) -> Result<(), Rejection> {
    if tx.is_coinbase() {
        return Err(Rejection::invalid(100, "bad-tx-coinbase"));
    }
    check_transaction_common(tx)?;
    for input in &tx.vin {
        if input.prevout.is_null() {
            return Err(Rejection::invalid(10, "bad-txns-prevout-null"));
        }
    }
    Ok(())
}

/// Context-free block checks: header, merkle root (with mutation
/// detection), coinbase placement, size limits, sigop ceilings, and
/// per-transaction rules.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    max_block_size: u64,
    check_pow: bool,
    check_merkle_root: bool,
) -> Result<(), Rejection> {
    check_block_header(&block.header, params, check_pow)?;

    if check_merkle_root {
        let mut mutated = false;
        let merkle_root = candyd_primitives::merkle::block_merkle_root(
            &block.transactions,
            &mut mutated,
        );
        if block.header.merkle_root != merkle_root {
            return Err(Rejection::corruption("bad-txnmrklroot"));
        }
        if mutated {
            return Err(Rejection::corruption("bad-txns-duplicate"));
        }
    }

    if block.transactions.is_empty() {
        return Err(Rejection::invalid(100, "bad-cb-missing"));
    }

    if block.transactions.len() as u64 * MIN_TRANSACTION_SIZE > max_block_size {
        return Err(Rejection::invalid(100, "bad-blk-length"));
    }
    let block_size = block.serialized_size() as u64;
    if block_size > max_block_size {
        return Err(Rejection::invalid(100, "bad-blk-length"));
    }

    check_coinbase(&block.transactions[0])?;

    let sigops_limit = max_block_sigops(block_size);
    let mut sigops = 0u64;
    for (index, tx) in block.transactions.iter().enumerate() {
        sigops += tx_sigops_without_p2sh(tx);
        if sigops > sigops_limit {
            return Err(Rejection::invalid(100, "bad-blk-sigops"));
        }
        if index > 0 {
            check_regular_transaction(tx)?;
        }
    }

    Ok(())
}

/// Summary of the block a header builds on.
#[derive(Clone, Copy, Debug)]
pub struct PrevInfo {
    pub height: i32,
    pub time: i64,
    pub median_time_past: i64,
}

/// Contextual header checks against the parent: expected difficulty,
/// post-fork height continuity, timestamp bounds, version gates.
pub fn contextual_check_header(
    header: &BlockHeader,
    prev: &PrevInfo,
    expected_bits: u32,
    adjusted_time: i64,
    params: &ConsensusParams,
) -> Result<(), Rejection> {
    let height = prev.height + 1;

    if header.bits != expected_bits {
        eprintln!(
            "bad difficulty bits at height {height}: expected {expected_bits:#x}, got {:#x}",
            header.bits
        );
        return Err(Rejection::invalid(100, "bad-diffbits"));
    }

    if params.cdy_active(height) && header.height != height as u32 {
        return Err(Rejection::invalid(0, "bad-height"));
    }

    if (header.time as i64) <= prev.median_time_past {
        return Err(Rejection::invalid(0, "time-too-old"));
    }

    let max_future = params.cdy_max_future_block_time.min(MAX_FUTURE_BLOCK_TIME);
    if header.time as i64 > adjusted_time + max_future {
        return Err(Rejection::invalid(0, "time-too-new"));
    }

    if (header.version < 2 && height >= params.bip34_height)
        || (header.version < 3 && height >= params.bip66_height)
        || (header.version < 4 && height >= params.bip65_height)
    {
        return Err(
            Rejection::invalid(0, "bad-version").with_debug(format!(
                "rejected nVersion={:#010x} block",
                header.version
            )),
        );
    }

    Ok(())
}

/// Contextual transaction checks: finality under the applicable
/// lock-time cutoff and the anti-replay commitment window.
pub fn contextual_check_transaction(
    tx: &Transaction,
    height: i32,
    lock_time_cutoff: i64,
    params: &ConsensusParams,
) -> Result<(), Rejection> {
    if !tx.is_final(height as i64, lock_time_cutoff) {
        return Err(Rejection::invalid(10, "bad-txns-nonfinal"));
    }

    if params.uahf_active(height) && height <= params.anti_replay_op_return_sunset_height {
        for output in &tx.vout {
            if is_commitment(&output.script_pubkey, &params.anti_replay_op_return_commitment) {
                return Err(Rejection::invalid(10, "bad-txn-replay"));
            }
        }
    }

    Ok(())
}

/// Contextual block checks against the parent: transaction finality
/// (BIP113 once CSV is active), the pre-monolith size ceiling, and the
/// BIP34 height commitment.
pub fn contextual_check_block(
    block: &Block,
    prev: &PrevInfo,
    monolith_active: bool,
    params: &ConsensusParams,
) -> Result<(), Rejection> {
    let height = prev.height + 1;

    // `check_block` runs first in the pipeline; this guard keeps the
    // function total when called on its own.
    let coinbase = block
        .transactions
        .first()
        .filter(|tx| !tx.vin.is_empty())
        .ok_or_else(|| Rejection::invalid(100, "bad-cb-missing"))?;

    if !monolith_active && block.serialized_size() as u64 > LEGACY_MAX_BLOCK_SIZE {
        return Err(Rejection::invalid(100, "bad-blk-length"));
    }

    let lock_time_cutoff = if params.csv_active(height) {
        prev.median_time_past
    } else {
        block.header.time as i64
    };

    for tx in &block.transactions {
        contextual_check_transaction(tx, height, lock_time_cutoff, params)?;
    }

    if height >= params.bip34_height
        && !starts_with_height(&coinbase.vin[0].script_sig, height as i64)
    {
        return Err(Rejection::invalid(100, "bad-cb-height"));
    }

    Ok(())
}
