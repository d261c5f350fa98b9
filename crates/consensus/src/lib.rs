//! Consensus rules shared across validation: money bounds, network
//! parameters, and the subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use candyd_primitives::Hash256;
pub use money::{money_range, Amount, COIN, MAX_MONEY};
pub use params::{ChainParams, Checkpoint, ConsensusParams, Network};
pub use rewards::block_subsidy;
