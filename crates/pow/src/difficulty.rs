//! Difficulty and compact target utilities.
//!
//! The chain crossed several retargeting regimes: the legacy Bitcoin
//! 2016-block window, the UAHF emergency adjustment, the cash DAA, a
//! fixed-difficulty warm-up after the fork, Digishield v3, and finally
//! Zawy's LWMA. `get_next_work_required` selects the regime from the
//! candidate height and runs it over a contiguous header window.

use std::cmp::Ordering;

use candyd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    InsufficientHistory,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
            DifficultyError::InsufficientHistory => {
                write!(f, "header window too short for the active regime")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = (bits >> 24) as u32;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow =
            size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected work for a block: `(~target / (target + 1)) + 1`, the
/// 256-bit form of `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Header window length sufficient for every regime (the legacy
/// 2016-block retarget dominates).
pub fn required_history(params: &ConsensusParams) -> usize {
    let legacy = params.difficulty_adjustment_interval() + 1;
    let daa = 147 + 11;
    let digishield = params.digishield_averaging_window + 12;
    let lwma = params.zawy_lwma_averaging_window + 2;
    legacy.max(daa).max(digishield).max(lwma) as usize
}

pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if chain.is_empty() {
        return Ok(target_to_compact(params.pow_limit(false)));
    }

    ensure_contiguous(chain)?;

    let prev = chain.last().expect("checked not empty");
    let next_height = prev.height + 1;
    let postfork = next_height >= params.cdy_height as i64;

    if !postfork {
        return if prev.height >= params.daa_height as i64 {
            daa_next_work_required(chain, next_block_time, params)
        } else if prev.height >= params.uahf_height as i64 {
            eda_next_work_required(chain, next_block_time, params)
        } else {
            bitcoin_next_work_required(chain, next_block_time, params)
        };
    }

    // The fork starts out mining at the floor while hashrate migrates.
    if next_height < params.cdy_height as i64 + params.digishield_averaging_window {
        return Ok(target_to_compact(params.pow_limit(true)));
    }

    if next_height < params.cdy_zawy_lwma_height as i64 {
        return digishield_next_work_required(chain, params);
    }

    let equihash_fork = params.cdy_equihash_fork_height as i64;
    if next_height >= equihash_fork
        && next_height < equihash_fork + params.zawy_lwma_averaging_window
    {
        // New puzzle parameters reset the market: one deep difficulty
        // drop, then bits freeze until LWMA has a fresh window.
        return if next_height == equihash_fork {
            reduce_difficulty_by(prev.bits, 100, params)
        } else {
            Ok(prev.bits)
        };
    }

    lwma_next_work_required(chain, params)
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

fn index_of(chain: &[HeaderInfo], height: i64) -> Result<usize, DifficultyError> {
    let base = chain[0].height;
    if height < base || height > chain.last().expect("non-empty").height {
        return Err(DifficultyError::InsufficientHistory);
    }
    Ok((height - base) as usize)
}

fn median_time_past(chain: &[HeaderInfo], idx: usize) -> i64 {
    let start = idx.saturating_sub(10);
    let mut times: Vec<i64> = chain[start..=idx].iter().map(|header| header.time).collect();
    times.sort_unstable();
    times[times.len() / 2]
}

fn calculate_legacy_next_work(
    prev: &HeaderInfo,
    first_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(prev.bits);
    }

    let timespan_target = params.pow_target_timespan_legacy;
    let mut actual_timespan = prev.time - first_block_time;
    if actual_timespan < timespan_target / 4 {
        actual_timespan = timespan_target / 4;
    }
    if actual_timespan > timespan_target * 4 {
        actual_timespan = timespan_target * 4;
    }

    let pow_limit = U256::from_little_endian(params.pow_limit(false));
    let mut new_target = compact_to_u256(prev.bits)?;
    new_target *= U256::from(actual_timespan as u64);
    new_target /= U256::from(timespan_target as u64);

    if new_target > pow_limit {
        new_target = pow_limit;
    }
    Ok(u256_to_compact(new_target))
}

/// Walk back over min-difficulty blocks to the last real target. The
/// testnet escape hatch would otherwise stick at the floor forever.
fn last_non_minimum_bits(chain: &[HeaderInfo], limit_bits: u32, interval: i64) -> u32 {
    let mut idx = chain.len() - 1;
    while idx > 0 && chain[idx].height % interval != 0 && chain[idx].bits == limit_bits {
        idx -= 1;
    }
    chain[idx].bits
}

fn bitcoin_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let prev = chain.last().expect("non-empty");
    let interval = params.difficulty_adjustment_interval();
    let limit_bits = target_to_compact(params.pow_limit(false));

    if (prev.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if let Some(next_time) = next_block_time {
                if next_time > prev.time + params.pow_target_spacing * 2 {
                    return Ok(limit_bits);
                }
            }
            return Ok(last_non_minimum_bits(chain, limit_bits, interval));
        }
        return Ok(prev.bits);
    }

    let first_height = prev.height - (interval - 1);
    let first = chain[index_of(chain, first_height)?];
    calculate_legacy_next_work(prev, first.time, params)
}

fn eda_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let prev = chain.last().expect("non-empty");
    let next_height = prev.height + 1;
    let interval = params.difficulty_adjustment_interval();

    // Only change once per difficulty adjustment interval.
    if next_height % interval == 0 {
        let first = chain[index_of(chain, next_height - interval)?];
        return calculate_legacy_next_work(prev, first.time, params);
    }

    let limit_bits = target_to_compact(params.pow_limit(false));

    if params.pow_allow_min_difficulty_blocks {
        if let Some(next_time) = next_block_time {
            if next_time > prev.time + 2 * params.pow_target_spacing {
                return Ok(limit_bits);
            }
        }
        return Ok(last_non_minimum_bits(chain, limit_bits, interval));
    }

    // We can't go below the minimum, so bail early.
    if prev.bits == limit_bits {
        return Ok(limit_bits);
    }

    // If producing the last 6 blocks took less than 12h, keep the same
    // difficulty.
    let prev_idx = chain.len() - 1;
    let sixth_idx = index_of(chain, next_height - 7)?;
    let mtp6 = median_time_past(chain, prev_idx) - median_time_past(chain, sixth_idx);
    if mtp6 < 12 * 3600 {
        return Ok(prev.bits);
    }

    // Otherwise raise the target by a quarter (-20% difficulty) so the
    // chain does not stall after an abrupt hashrate loss.
    let mut pow = compact_to_u256(prev.bits)?;
    pow += pow >> 2;
    let limit = U256::from_little_endian(params.pow_limit(false));
    if pow > limit {
        pow = limit;
    }
    Ok(u256_to_compact(pow))
}

/// Median-of-three by timestamp around the block at `idx`, so a single
/// skewed timestamp cannot anchor the DAA window.
fn suitable_index(chain: &[HeaderInfo], idx: usize) -> Result<usize, DifficultyError> {
    if idx < 2 {
        return Err(DifficultyError::InsufficientHistory);
    }
    let mut candidates = [idx - 2, idx - 1, idx];
    if chain[candidates[0]].time > chain[candidates[2]].time {
        candidates.swap(0, 2);
    }
    if chain[candidates[0]].time > chain[candidates[1]].time {
        candidates.swap(0, 1);
    }
    if chain[candidates[1]].time > chain[candidates[2]].time {
        candidates.swap(1, 2);
    }
    Ok(candidates[1])
}

fn daa_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let prev = chain.last().expect("non-empty");

    if params.pow_allow_min_difficulty_blocks {
        if let Some(next_time) = next_block_time {
            if next_time > prev.time + 2 * params.pow_target_spacing {
                return Ok(target_to_compact(&params.pow_limit));
            }
        }
    }

    let last_idx = suitable_index(chain, chain.len() - 1)?;
    let anchor_idx = index_of(chain, prev.height - 144)?;
    let first_idx = suitable_index(chain, anchor_idx)?;

    let last = &chain[last_idx];
    let first = &chain[first_idx];

    // Work accumulated between the two suitable blocks.
    let mut work = U256::zero();
    for header in &chain[first_idx + 1..=last_idx] {
        work += block_proof(header.bits)?;
    }
    work *= U256::from(params.pow_target_spacing as u64);

    // Bound the adjustment amplitude to a factor in [0.5, 2].
    let mut actual_timespan = last.time - first.time;
    if actual_timespan > 288 * params.pow_target_spacing {
        actual_timespan = 288 * params.pow_target_spacing;
    } else if actual_timespan < 72 * params.pow_target_spacing {
        actual_timespan = 72 * params.pow_target_spacing;
    }
    work /= U256::from(actual_timespan as u64);

    // T = (2^256 / W) - 1, computed as (2^256 - W) / W.
    let (neg_work, _) = (!work).overflowing_add(U256::from(1u64));
    let next_target = neg_work / work;

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next_target > pow_limit {
        return Ok(u256_to_compact(pow_limit));
    }
    Ok(u256_to_compact(next_target))
}

fn digishield_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let prev_idx = chain.len() - 1;
    let prev = &chain[prev_idx];
    let limit_bits = target_to_compact(params.pow_limit(true));

    if params.pow_no_retargeting {
        return Ok(prev.bits);
    }

    let window = params.digishield_averaging_window as usize;
    if chain.len() <= window {
        return Ok(limit_bits);
    }

    let mut total = U256::zero();
    for header in &chain[chain.len() - window..] {
        total += compact_to_u256(header.bits)?;
    }
    let avg = total / U256::from(window as u64);

    let first_idx = prev_idx - window;
    let last_mtp = median_time_past(chain, prev_idx);
    let first_mtp = median_time_past(chain, first_idx);

    let mut actual_timespan = last_mtp - first_mtp;
    if actual_timespan < params.digishield_min_actual_timespan() {
        actual_timespan = params.digishield_min_actual_timespan();
    }
    if actual_timespan > params.digishield_max_actual_timespan() {
        actual_timespan = params.digishield_max_actual_timespan();
    }

    let pow_limit = U256::from_little_endian(params.pow_limit(true));
    let mut next = avg;
    next /= U256::from(params.digishield_averaging_window_timespan() as u64);
    next *= U256::from(actual_timespan as u64);

    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn lwma_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let prev = chain.last().expect("non-empty");

    if params.pow_no_retargeting {
        return Ok(prev.bits);
    }

    let t = params.pow_target_spacing_cdy;
    let height = prev.height + 1;
    let new_rule_height = params.new_rule_height as i64;
    let equihash_fork_height = params.cdy_equihash_fork_height as i64;

    let n = if height > new_rule_height {
        45
    } else {
        params.zawy_lwma_averaging_window
    };
    if height <= n {
        return Err(DifficultyError::InsufficientHistory);
    }

    let mut sum_target = U256::zero();
    let mut sum_last10_target = U256::zero();
    let mut sum_last5_target = U256::zero();
    let mut weighted_time: i64 = 0;
    let mut sum_last10_time: i64 = 0;
    let mut sum_last5_time: i64 = 0;
    let mut weight: i64 = 0;

    for i in (height - n)..height {
        let idx = index_of(chain, i)?;
        let prev_idx = index_of(chain, i - 1)?;
        let mut solvetime = chain[idx].time - chain[prev_idx].time;

        // Cap runaway solvetimes so difficulty cannot collapse too fast.
        if height > new_rule_height && solvetime >= 8 * t {
            solvetime = 8 * t;
        }

        weight += 1;
        weighted_time += solvetime * weight;

        let target = compact_to_u256(chain[idx].bits)?;
        sum_target += target;
        if i >= height - 10 {
            sum_last10_time += solvetime;
            sum_last10_target += target;
            if i >= height - 5 {
                sum_last5_time += solvetime;
                sum_last5_target += target;
            }
        }
    }

    // Keep the weighted time reasonable in case strange solvetimes
    // occurred.
    if weighted_time < n * n * t / 20 {
        weighted_time = n * n * t / 20;
    }

    let scalar = 2 * (weighted_time / (n * (n + 1)));
    let mut next = (sum_target / U256::from(n as u64)) * U256::from(scalar as u64)
        / U256::from(t as u64);

    // Fast-block brakes layered on over the chain's history: if recent
    // blocks came in far under schedule, hold the target well below the
    // recent average.
    if height > equihash_fork_height && sum_last5_time <= 90 {
        let avg_last5 = sum_last5_target / U256::from(5u64);
        if next > avg_last5 / U256::from(4u64) {
            next = avg_last5 / U256::from(4u64);
        }
    } else if height > new_rule_height && sum_last10_time <= 5 * 60 {
        let avg_last10 = sum_last10_target / U256::from(10u64);
        if next > avg_last10 / U256::from(2u64) {
            next = avg_last10 / U256::from(2u64);
        }
    } else if height > new_rule_height && sum_last10_time <= 10 * 60 {
        let avg_last10 = sum_last10_target / U256::from(10u64);
        if next > avg_last10 * U256::from(2u64) / U256::from(3u64) {
            next = avg_last10 * U256::from(2u64) / U256::from(3u64);
        }
    }

    if height > new_rule_height {
        let last_target = compact_to_u256(prev.bits)?;
        let rise_cap = last_target * U256::from(13u64) / U256::from(10u64);
        if next > rise_cap {
            next = rise_cap;
        }
    }

    let pow_limit = U256::from_little_endian(params.pow_limit(true));
    if next > pow_limit {
        return Ok(u256_to_compact(pow_limit));
    }
    Ok(u256_to_compact(next))
}

fn reduce_difficulty_by(
    prev_bits: u32,
    multiplier: u64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let mut target = compact_to_u256(prev_bits)?;
    target = target.saturating_mul(U256::from(multiplier));
    let pow_limit = U256::from_little_endian(params.pow_limit(true));
    if target > pow_limit {
        target = pow_limit;
    }
    Ok(u256_to_compact(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip_canonical() {
        for bits in [0x1d00_ffffu32, 0x1c0f_ffff, 0x207f_ffff, 0x1f07_ffff, 0x0301_2345] {
            let value = compact_to_u256(bits).expect("decode");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0001), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
        assert_eq!(compact_to_u256(0), Ok(U256::zero()));
    }

    #[test]
    fn compact_small_mantissa() {
        // size <= 3 keeps the value in the mantissa itself.
        let value = compact_to_u256(0x0200_1234).expect("decode");
        assert_eq!(value, U256::from(0x12u64));
    }

    #[test]
    fn block_proof_matches_formula() {
        let bits = 0x1c0f_ffff;
        let target = compact_to_u256(bits).expect("decode");
        let expected = (!target / (target + U256::from(1u64))) + U256::from(1u64);
        assert_eq!(block_proof(bits).expect("proof"), expected);
        // target + 1 = 2^220, so the proof is exactly 2^36.
        assert_eq!(expected, U256::from(1u64) << 36);
    }

    #[test]
    fn hash_target_comparison_is_little_endian() {
        let mut small = [0u8; 32];
        small[0] = 1;
        let mut big = [0u8; 32];
        big[31] = 1;
        assert!(hash_meets_target(&small, &big));
        assert!(!hash_meets_target(&big, &small));
        assert_eq!(cmp_be(&small, &big), Ordering::Less);
    }
}
