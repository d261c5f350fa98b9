use candyd_consensus::{ChainParams, ConsensusParams, Network};
use candyd_pow::difficulty::{
    compact_to_u256, get_next_work_required, target_to_compact, u256_to_compact, HeaderInfo,
};
use primitive_types::U256;

fn main_consensus() -> ConsensusParams {
    ChainParams::for_network(Network::Main).consensus
}

/// Contiguous window ending at `last_height`, blocks `spacing` apart,
/// all carrying `bits`.
fn uniform_chain(last_height: i64, len: usize, spacing: i64, bits: u32) -> Vec<HeaderInfo> {
    let first_height = last_height - len as i64 + 1;
    (0..len)
        .map(|i| HeaderInfo {
            height: first_height + i as i64,
            time: 1_400_000_000 + (first_height + i as i64) * spacing,
            bits,
        })
        .collect()
}

#[test]
fn prefork_non_boundary_inherits_bits() {
    let params = main_consensus();
    // One block before the UAHF activation: still plain Bitcoin rules,
    // and off the 2016 boundary the bits are inherited.
    let prev_height = params.uahf_height as i64 - 2;
    assert_ne!((prev_height + 1) % params.difficulty_adjustment_interval(), 0);
    let chain = uniform_chain(prev_height, 20, 600, 0x1a0f_fffc);
    let bits = get_next_work_required(&chain, Some(chain.last().unwrap().time + 600), &params)
        .expect("work");
    assert_eq!(bits, 0x1a0f_fffc);
}

#[test]
fn legacy_retarget_clamps_timespan() {
    let params = main_consensus();
    let interval = params.difficulty_adjustment_interval();
    // Last pre-UAHF retarget boundary.
    let boundary = (params.uahf_height as i64 / interval) * interval;
    let prev_height = boundary - 1;

    // Blocks 60s apart: actual timespan far below T/4, so the new
    // target is exactly a quarter of the old one.
    let chain = uniform_chain(prev_height, interval as usize + 1, 60, 0x1a0f_fffc);
    let bits = get_next_work_required(&chain, None, &params).expect("work");
    assert_eq!(bits, 0x1a03_ffff);

    // Blocks 3000s apart: clamped to 4x.
    let chain = uniform_chain(prev_height, interval as usize + 1, 3000, 0x1a0f_fffc);
    let bits = get_next_work_required(&chain, None, &params).expect("work");
    let expected = u256_to_compact(compact_to_u256(0x1a0f_fffc).unwrap() * U256::from(4u64));
    assert_eq!(bits, expected);
}

#[test]
fn eda_rule_takes_over_at_uahf() {
    let params = main_consensus();
    let bits = 0x1a0f_fffc;

    // prev at uahfHeight: the EDA six-block rule applies. Slow blocks
    // (MTP span over 12h) raise the target by a quarter.
    let prev_height = params.uahf_height as i64;
    let chain = uniform_chain(prev_height, 20, 7 * 3600, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 600), &params)
        .expect("work");
    let target = compact_to_u256(bits).unwrap();
    assert_eq!(next, u256_to_compact(target + (target >> 2)));

    // Fast blocks inherit.
    let chain = uniform_chain(prev_height, 20, 600, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 600), &params)
        .expect("work");
    assert_eq!(next, bits);

    // One block earlier the legacy rule still applies: off-boundary
    // blocks inherit regardless of timestamps.
    let chain = uniform_chain(prev_height - 1, 20, 7 * 3600, bits);
    assert_ne!(prev_height % params.difficulty_adjustment_interval(), 0);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 600), &params)
        .expect("work");
    assert_eq!(next, bits);
}

#[test]
fn daa_steady_state_reproduces_target() {
    let params = main_consensus();
    let prev_height = params.daa_height as i64 + 200;
    assert!(prev_height + 1 < params.cdy_height as i64);
    let chain = uniform_chain(prev_height, 160, params.pow_target_spacing, 0x1c0f_ffff);
    let bits = get_next_work_required(&chain, Some(chain.last().unwrap().time + 600), &params)
        .expect("work");
    assert_eq!(bits, 0x1c0f_ffff);
}

#[test]
fn fork_warmup_emits_pow_limit() {
    let params = main_consensus();
    let limit_bits = target_to_compact(params.pow_limit(true));
    for offset in [0i64, 1, params.digishield_averaging_window - 2] {
        let prev_height = params.cdy_height as i64 + offset;
        let chain = uniform_chain(prev_height, 4, 120, 0x1c0f_ffff);
        let bits = get_next_work_required(&chain, Some(chain.last().unwrap().time + 120), &params)
            .expect("work");
        assert_eq!(bits, limit_bits);
    }
}

#[test]
fn digishield_bounds_are_exact() {
    let params = main_consensus();
    // First block after the warm-up window.
    let prev_height = params.cdy_height as i64 + params.digishield_averaging_window - 1;
    let window_timespan = params.digishield_averaging_window_timespan();
    let bits = u256_to_compact(U256::from(window_timespan as u64) << 184);

    // Timestamps 2x spacing apart: MTP timespan doubles the window
    // timespan and clamps at +32%.
    let chain = uniform_chain(prev_height, 45, 2 * params.pow_target_spacing_cdy, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 240), &params)
        .expect("work");
    let max_timespan = params.digishield_max_actual_timespan();
    assert_eq!(max_timespan, window_timespan * 132 / 100);
    assert_eq!(next, u256_to_compact(U256::from(max_timespan as u64) << 184));

    // Zero solvetimes clamp at -16%.
    let mut chain = uniform_chain(prev_height, 45, 0, bits);
    for header in chain.iter_mut() {
        header.time = 1_500_000_000;
    }
    let next = get_next_work_required(&chain, Some(1_500_000_100), &params).expect("work");
    let min_timespan = params.digishield_min_actual_timespan();
    assert_eq!(min_timespan, window_timespan * 84 / 100);
    assert_eq!(next, u256_to_compact(U256::from(min_timespan as u64) << 184));
}

#[test]
fn lwma_steady_state_reproduces_target() {
    let params = main_consensus();
    // Inside the plain-LWMA corridor: after activation, before the
    // new-rule clamps.
    let prev_height = params.cdy_zawy_lwma_height as i64 + 400;
    assert!(prev_height + 1 < params.new_rule_height as i64);
    let bits = 0x1a7f_ffff;
    let chain = uniform_chain(prev_height, 62, params.pow_target_spacing_cdy, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 120), &params)
        .expect("work");
    assert_eq!(next, bits);
}

#[test]
fn lwma_rise_cap_after_new_rule() {
    let params = main_consensus();
    let prev_height = params.new_rule_height as i64 + 400;
    assert!(prev_height + 1 < params.cdy_equihash_fork_height as i64);
    let bits = 0x1a10_0000;
    // Very slow blocks push the raw LWMA target far up; the post-new-rule
    // cap holds it to 13/10 of the previous target.
    let chain = uniform_chain(prev_height, 62, 16 * params.pow_target_spacing_cdy, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 120), &params)
        .expect("work");
    let last_target = compact_to_u256(bits).unwrap();
    assert_eq!(
        next,
        u256_to_compact(last_target * U256::from(13u64) / U256::from(10u64))
    );
}

#[test]
fn equihash_fork_drops_difficulty_then_freezes() {
    let params = main_consensus();
    let bits = 0x1a01_0000;

    // At the fork height exactly: target x100.
    let prev_height = params.cdy_equihash_fork_height as i64 - 1;
    let chain = uniform_chain(prev_height, 4, 120, bits);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 120), &params)
        .expect("work");
    let expected = compact_to_u256(bits).unwrap() * U256::from(100u64);
    assert_eq!(next, u256_to_compact(expected));

    // Inside the freeze window: inherit.
    let chain = uniform_chain(prev_height + 10, 4, 120, 0x1a64_0000);
    let next = get_next_work_required(&chain, Some(chain.last().unwrap().time + 120), &params)
        .expect("work");
    assert_eq!(next, 0x1a64_0000);
}

#[test]
fn testnet_min_difficulty_escape() {
    let params = ChainParams::for_network(Network::Test).consensus;
    let limit_bits = target_to_compact(params.pow_limit(false));
    // Plain legacy era on testnet, next block 25 minutes late.
    let prev_height = 100_000i64;
    let chain = uniform_chain(prev_height, 20, 600, 0x1c0f_ffff);
    let next = get_next_work_required(
        &chain,
        Some(chain.last().unwrap().time + 2 * params.pow_target_spacing + 1),
        &params,
    )
    .expect("work");
    assert_eq!(next, limit_bits);
}

#[test]
fn empty_chain_yields_legacy_limit() {
    let params = main_consensus();
    let bits = get_next_work_required(&[], None, &params).expect("work");
    assert_eq!(bits, target_to_compact(params.pow_limit(false)));
}
