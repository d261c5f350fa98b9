//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Subsidy for the block at `height`.
///
/// Pre-fork the schedule is the Bitcoin one: 50 COIN halved every
/// interval. The fork block mints the 210_000 COIN holder distribution,
/// the compensation height mints a one-shot 1_000_000 COIN, and post-fork
/// blocks pay 10 COIN with halvings advancing at a fifth of the pre-fork
/// pace (ten times the block cadence, halved reward).
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = if height >= params.cdy_height {
        (params.cdy_height + (height - params.cdy_height) / 5) / params.subsidy_halving_interval
    } else {
        height / params.subsidy_halving_interval
    };

    if height == params.cdy_height {
        return 210_000 * COIN;
    }
    if height == params.compense_height {
        return 1_000_000 * COIN;
    }

    // Right shift past 60 is meaningless for the remaining base subsidy.
    if halvings >= 61 {
        return 0;
    }

    let base: Amount = if height >= params.cdy_height {
        10 * COIN
    } else {
        50 * COIN
    };
    base >> halvings
}
