//! Header proof-of-work checks.

use candyd_consensus::ConsensusParams;
use candyd_primitives::block::BlockHeader;
use candyd_primitives::Hash256;
use primitive_types::U256;

use crate::difficulty::compact_to_u256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    /// Compact bits decode to a negative, zero, or overflowing target,
    /// or one above the applicable limit.
    InvalidTarget,
    /// Block hash does not meet the claimed target.
    HighHash,
    /// Equihash solution length does not match the (N, K) in force.
    SolutionSize { have: usize, need: usize },
    /// Equihash solution does not verify.
    InvalidSolution,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidTarget => write!(f, "compact target out of range"),
            PowError::HighHash => write!(f, "proof of work failed"),
            PowError::SolutionSize { have, need } => {
                write!(f, "equihash solution has invalid size have {have} need {need}")
            }
            PowError::InvalidSolution => write!(f, "equihash solution invalid"),
        }
    }
}

impl std::error::Error for PowError {}

/// Serialized Equihash solution width in bytes for the given parameters.
pub fn equihash_solution_width(n: u32, k: u32) -> usize {
    ((1usize << k) * (n as usize / (k as usize + 1) + 1)) / 8
}

/// Check that `hash` interpreted as a 256-bit integer meets the compact
/// target, and that the target itself is in range for the era.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    postfork: bool,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits).map_err(|_| PowError::InvalidTarget)?;
    if target.is_zero() {
        return Err(PowError::InvalidTarget);
    }
    let limit = U256::from_little_endian(params.pow_limit(postfork));
    if target > limit {
        return Err(PowError::InvalidTarget);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HighHash);
    }
    Ok(())
}

/// Verify the Equihash solution carried by a post-fork header. The
/// puzzle input is the header minus nonce and solution, followed by the
/// nonce.
pub fn check_equihash_solution(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let n = params.equihash_n(header.height);
    let k = params.equihash_k(header.height);

    let need = equihash_solution_width(n, k);
    if header.solution.len() != need {
        return Err(PowError::SolutionSize {
            have: header.solution.len(),
            need,
        });
    }

    let input = header.equihash_input();
    equihash::is_valid_solution(n, k, &input, &header.nonce, &header.solution)
        .map_err(|_| PowError::InvalidSolution)
}

/// Context-free header PoW validation. Post-fork headers additionally
/// carry an Equihash solution for the (N, K) in force at their height.
pub fn validate_pow_header(
    header: &BlockHeader,
    postfork: bool,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    if postfork {
        check_equihash_solution(header, params)?;
    }
    check_proof_of_work(&header.hash(), header.bits, postfork, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candyd_consensus::{ChainParams, Network};

    #[test]
    fn known_solution_widths() {
        assert_eq!(equihash_solution_width(200, 9), 1344);
        assert_eq!(equihash_solution_width(144, 5), 100);
        assert_eq!(equihash_solution_width(48, 5), 36);
        assert_eq!(equihash_solution_width(96, 5), 68);
    }

    #[test]
    fn pow_check_rejects_out_of_range_targets() {
        let params = ChainParams::for_network(Network::Main).consensus;
        let zero_hash = [0u8; 32];
        // Zero target.
        assert_eq!(
            check_proof_of_work(&zero_hash, 0, false, &params),
            Err(PowError::InvalidTarget)
        );
        // Overflowing compact encoding.
        assert_eq!(
            check_proof_of_work(&zero_hash, 0xff12_3456, false, &params),
            Err(PowError::InvalidTarget)
        );
        // Above the legacy limit.
        assert_eq!(
            check_proof_of_work(&zero_hash, 0x207f_ffff, false, &params),
            Err(PowError::InvalidTarget)
        );
        // In range, trivially met by the zero hash.
        assert_eq!(check_proof_of_work(&zero_hash, 0x1d00_ffff, false, &params), Ok(()));
    }

    #[test]
    fn pow_check_compares_hash_to_target() {
        let params = ChainParams::for_network(Network::Main).consensus;
        let mut high_hash = [0xffu8; 32];
        high_hash[31] = 0x00;
        assert_eq!(
            check_proof_of_work(&high_hash, 0x1d00_ffff, false, &params),
            Err(PowError::HighHash)
        );
    }

    #[test]
    fn solution_width_switches_at_equihash_fork() {
        let params = ChainParams::for_network(Network::Main).consensus;
        let before = params.cdy_equihash_fork_height as u32 - 1;
        let after = params.cdy_equihash_fork_height as u32;
        assert_eq!(params.equihash_n(before), 200);
        assert_eq!(params.equihash_n(after), 144);
        assert_eq!(
            equihash_solution_width(params.equihash_n(before), params.equihash_k(before)),
            1344
        );
        assert_eq!(
            equihash_solution_width(params.equihash_n(after), params.equihash_k(after)),
            100
        );
    }
}
