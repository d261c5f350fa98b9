//! Per-network consensus and chain parameters.

use candyd_primitives::block::{Block, BlockHeader};
use candyd_primitives::encoding::Encoder;
use candyd_primitives::hash::sha256d;
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use candyd_primitives::Hash256;

use crate::money::COIN;

/// Anti-replay commitment carried in OP_RETURN outputs until the sunset
/// height.
const ANTI_REPLAY_COMMITMENT: &[u8] = b"Bitcoin: A Peer-to-Peer Electronic Cash System";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Parameters that influence chain consensus.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Block height and hash at which BIP34 becomes active.
    pub bip34_height: i32,
    pub bip34_hash: Hash256,
    /// Block height at which BIP65 becomes active.
    pub bip65_height: i32,
    /// Block height at which BIP66 becomes active.
    pub bip66_height: i32,
    /// Block height at which BIP68/112/113 (the CSV deployment) is active.
    pub csv_height: i32,
    /// Block height at which UAHF kicks in.
    pub uahf_height: i32,
    /// Block height at which the cash DAA becomes active.
    pub daa_height: i32,
    /// Block height of the CDY hard fork.
    pub cdy_height: i32,
    /// Block height at which the post-LWMA clamp rules become active.
    pub new_rule_height: i32,
    /// Block height at which Zawy's LWMA difficulty algorithm activates.
    pub cdy_zawy_lwma_height: i32,
    /// Block height at which the second Equihash parameter set activates.
    pub cdy_equihash_fork_height: i32,
    /// Height of the one-shot compensation payout.
    pub compense_height: i32,
    /// Height from which coinbase outputs must pay a whitelisted pool.
    pub pool_protection_height: i32,
    /// Future-block drift allowed post-fork, in seconds.
    pub cdy_max_future_block_time: i64,
    /// MTP at which the monolith opcode/size rules activate.
    pub monolith_activation_time: i64,
    /// Block height at which OP_RETURN replay protection stops.
    pub anti_replay_op_return_sunset_height: i32,
    pub anti_replay_op_return_commitment: Vec<u8>,
    /// Proof of work parameters. Targets are stored in the uint256
    /// little-endian byte convention.
    pub pow_limit: Hash256,
    pub pow_limit_legacy: Hash256,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub pow_target_spacing: i64,
    pub pow_target_spacing_cdy: i64,
    pub pow_target_timespan_legacy: i64,
    pub digishield_averaging_window: i64,
    pub digishield_max_adjust_down: i64,
    pub digishield_max_adjust_up: i64,
    pub zawy_lwma_averaging_window: i64,
    pub equihash_n: u32,
    pub equihash_k: u32,
    pub equihash_n_new: u32,
    pub equihash_k_new: u32,
    pub minimum_chain_work: Hash256,
    pub default_assume_valid: Hash256,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn pow_limit(&self, postfork: bool) -> &Hash256 {
        if postfork {
            &self.pow_limit
        } else {
            &self.pow_limit_legacy
        }
    }

    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan_legacy / self.pow_target_spacing
    }

    pub fn digishield_averaging_window_timespan(&self) -> i64 {
        self.digishield_averaging_window * self.pow_target_spacing_cdy
    }

    pub fn digishield_min_actual_timespan(&self) -> i64 {
        self.digishield_averaging_window_timespan() * (100 - self.digishield_max_adjust_up) / 100
    }

    pub fn digishield_max_actual_timespan(&self) -> i64 {
        self.digishield_averaging_window_timespan() * (100 + self.digishield_max_adjust_down) / 100
    }

    pub fn uahf_active(&self, height: i32) -> bool {
        height >= self.uahf_height
    }

    pub fn daa_active(&self, height: i32) -> bool {
        height >= self.daa_height
    }

    pub fn cdy_active(&self, height: i32) -> bool {
        height >= self.cdy_height
    }

    pub fn csv_active(&self, height: i32) -> bool {
        height >= self.csv_height
    }

    pub fn equihash_n(&self, height: u32) -> u32 {
        if (height as i64) >= self.cdy_equihash_fork_height as i64 {
            self.equihash_n_new
        } else {
            self.equihash_n
        }
    }

    pub fn equihash_k(&self, height: u32) -> u32 {
        if (height as i64) >= self.cdy_equihash_fork_height as i64 {
            self.equihash_k_new
        } else {
            self.equihash_k
        }
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|checkpoint| checkpoint.height)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Magic prefixing records in the on-disk block and undo files.
    pub disk_magic: [u8; 4],
    pub net_magic: [u8; 4],
    pub default_port: u16,
    pub prune_after_height: u32,
    pub dns_seeds: Vec<&'static str>,
    pub base58_pubkey_prefix: u8,
    pub base58_script_prefix: u8,
    pub cashaddr_prefix: &'static str,
    /// scriptPubKeys coinbase outputs must match at/after the pool
    /// protection height.
    pub pool_whitelist: Vec<Vec<u8>>,
    pub genesis: Block,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => main_params(),
            Network::Test => testnet_params(),
            Network::Regtest => regtest_params(),
        }
    }
}

/// Parse a big-endian hex string (the display form) into the uint256
/// little-endian byte convention.
pub fn hash_from_hex(hex: &str) -> Hash256 {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    assert_eq!(hex.len(), 64, "hash literal must be 32 bytes");
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16).expect("hex digit") as u8;
        let low = (chunk[1] as char).to_digit(16).expect("hex digit") as u8;
        // Display form is big-endian; storage is little-endian.
        out[31 - i] = (high << 4) | low;
    }
    out
}

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Decode a base58check string into (version byte, payload). Returns
/// `None` on malformed input or checksum mismatch.
pub fn base58check_decode(address: &str) -> Option<(u8, Vec<u8>)> {
    let mut bytes: Vec<u8> = Vec::new();
    for ch in address.bytes() {
        let digit = BASE58_ALPHABET.iter().position(|&c| c == ch)? as u32;
        let mut carry = digit;
        for byte in bytes.iter_mut() {
            let value = (*byte as u32) * 58 + carry;
            *byte = (value & 0xff) as u8;
            carry = value >> 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    for ch in address.bytes() {
        if ch == b'1' {
            bytes.push(0);
        } else {
            break;
        }
    }
    bytes.reverse();
    if bytes.len() < 5 {
        return None;
    }
    let (data, checksum) = bytes.split_at(bytes.len() - 4);
    let digest = sha256d(data);
    if &digest[..4] != checksum {
        return None;
    }
    Some((data[0], data[1..].to_vec()))
}

/// scriptPubKey for a base58 address under the given network prefixes.
fn address_to_script(address: &str, pubkey_prefix: u8, script_prefix: u8) -> Option<Vec<u8>> {
    let (version, payload) = base58check_decode(address)?;
    if payload.len() != 20 {
        return None;
    }
    if version == pubkey_prefix {
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(&payload);
        script.extend_from_slice(&[0x88, 0xac]);
        Some(script)
    } else if version == script_prefix {
        let mut script = Vec::with_capacity(23);
        script.extend_from_slice(&[0xa9, 0x14]);
        script.extend_from_slice(&payload);
        script.push(0x87);
        Some(script)
    } else {
        None
    }
}

fn pool_whitelist(addresses: &[&str], pubkey_prefix: u8, script_prefix: u8) -> Vec<Vec<u8>> {
    addresses
        .iter()
        .filter_map(|address| address_to_script(address, pubkey_prefix, script_prefix))
        .collect()
}

const GENESIS_TIMESTAMP: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_OUTPUT_PUBKEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

fn create_genesis_block(time: u32, nonce: u32, bits: u32, version: i32, reward: i64) -> Block {
    // scriptSig: 486604799 as 4-byte push, CScriptNum(4), the timestamp.
    let mut script_sig = Encoder::new();
    script_sig.write_u8(4);
    script_sig.write_u32_le(486_604_799);
    script_sig.write_u8(1);
    script_sig.write_u8(4);
    script_sig.write_u8(GENESIS_TIMESTAMP.len() as u8);
    script_sig.write_bytes(GENESIS_TIMESTAMP);

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(65);
    script_pubkey.extend_from_slice(&GENESIS_OUTPUT_PUBKEY);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: script_sig.into_inner(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let mut mutated = false;
    let merkle_root =
        candyd_primitives::merkle::block_merkle_root(std::slice::from_ref(&coinbase), &mut mutated);

    let mut nonce_bytes = [0u8; 32];
    nonce_bytes[..4].copy_from_slice(&nonce.to_le_bytes());

    Block {
        header: BlockHeader {
            version,
            prev_block: [0u8; 32],
            merkle_root,
            height: 0,
            reserved: [0u32; 7],
            time,
            bits,
            nonce: nonce_bytes,
            solution: Vec::new(),
        },
        transactions: vec![coinbase],
    }
}

fn main_params() -> ChainParams {
    let genesis = create_genesis_block(1_231_006_505, 2_083_236_893, 0x1d00_ffff, 1, 50 * COIN);
    let consensus = ConsensusParams {
        hash_genesis_block: hash_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        subsidy_halving_interval: 210_000,
        bip34_height: 227_931,
        bip34_hash: hash_from_hex(
            "000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8",
        ),
        bip65_height: 388_381,
        bip66_height: 363_725,
        csv_height: 419_328,
        uahf_height: 478_559,
        daa_height: 504_031,
        cdy_height: 512_666,
        new_rule_height: 592_447,
        cdy_zawy_lwma_height: 573_123,
        cdy_equihash_fork_height: 656_960,
        compense_height: 758_000,
        pool_protection_height: 1_447_999,
        cdy_max_future_block_time: 240,
        monolith_activation_time: 1_526_389_200,
        anti_replay_op_return_sunset_height: 530_000,
        anti_replay_op_return_commitment: ANTI_REPLAY_COMMITMENT.to_vec(),
        pow_limit: hash_from_hex(
            "0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_limit_legacy: hash_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pow_target_spacing: 10 * 60,
        pow_target_spacing_cdy: 2 * 60,
        pow_target_timespan_legacy: 14 * 24 * 60 * 60,
        digishield_averaging_window: 30,
        digishield_max_adjust_down: 32,
        digishield_max_adjust_up: 16,
        zawy_lwma_averaging_window: 60,
        equihash_n: 200,
        equihash_k: 9,
        equihash_n_new: 144,
        equihash_k_new: 5,
        minimum_chain_work: hash_from_hex(
            "00000000000000000000000000000000000000000082d89e5b8963ba7d734c61",
        ),
        default_assume_valid: hash_from_hex(
            "000000000000000003d0f45045742bb557f1a6c633cdb9de53564eb7ec4459d0",
        ),
        checkpoints: vec![
            checkpoint(11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            checkpoint(33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            checkpoint(74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
            checkpoint(105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            checkpoint(134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            checkpoint(168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            checkpoint(193_000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
            checkpoint(210_000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            checkpoint(216_116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
            checkpoint(225_430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
            checkpoint(250_000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            checkpoint(279_000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
            checkpoint(295_000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
            // UAHF fork block.
            checkpoint(478_559, "000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec"),
            // DAA activation block.
            checkpoint(504_031, "0000000000000000011ebf65b60d0a3de80b8175be709d653b4c1a1beeb6ab9c"),
            // CDY hard fork block.
            checkpoint(512_666, "00043bfba38c60e8b283d4e507e5785b8cd5f72b8b72f66542b2e4c62bd2ed79"),
            // Rollback block for the coin inflation incident.
            checkpoint(671_663, "00000241636f7d345b239a2dd785b8e834b494de4d307535d7afb7b1cb84a641"),
            // Pool protection.
            checkpoint(1_219_400, "00024e9dba1c7b44a73775ef82664ecd75463dd508952cdb91c9a74fcc6c5ef4"),
            checkpoint(1_448_000, "00004d8dffdebd96050a51d0b0318eab6363b1289a8a8497bd8ac142c4f4c97f"),
        ],
    };

    let pool_addresses = [
        "CRxRgjnz3MPi7FCeV3oXjALLXbnesz8v3F",
        "CawyQoHbTxaprmcnJeuCnucTZ3hCCyJ1dZ",
        "CZsrKKX7y8iPjrJ4rrE4vkooFgMKNagAWV",
        "CewxiZ1kWzagDMoXPhFTwbQxkyirVibZe9",
        "CPRLv43zoswdjVeWZbnAZiL9p2xys7EyAv",
        "CcDQ4cedyzRMbckhjo3XCGFbQjPXNxiyF8",
        "Ce4KfkQZSqQbBX2i5ckD7hW22Qoabud5UC",
        "CdZWiyU9TkCneDjSokkwXohrrMeTuuijoK",
        "CbVrvUDdDuWKmRSeY6ND4v22snvG8tHG4L",
        "CHo4h1zVTrNYoZmBkC46ah2HZF8RjdWoVZ",
        "CcZ674T8iric5vbrwHvni7pMaxyBSV1gXG",
        "CMY25Y59xxo9JcLrzEcBN4zue75p4jacy1",
        "CauVZ9oFNoq8v6Mg2pqnifxpn3t3CPoNL1",
        "CLFsEBc6nZ2iFt5dKwJsgXYauaCx6HyYVW",
        "CQc8X5R78yiwtVPbcpWxyXiuTRzMx17RiT",
        "CZVcLZPHcvqUzryzGE6NBvuPB87qDbW7eN",
        "CZGTBPNvocPAtsRNY5r3g6gt5iBwEbPUe1",
        "CU3LRuHJpoGfoWr84yEMqB5uajnTJSgoUc",
    ];

    ChainParams {
        network: Network::Main,
        consensus,
        disk_magic: [0xf9, 0xbe, 0xb4, 0xd9],
        net_magic: [0xe3, 0xc3, 0xc4, 0xd9],
        default_port: 8367,
        prune_after_height: 100_000,
        dns_seeds: vec![
            "seed.cdy.one",
            "cdyseed1.awmlite.com",
            "cdyseed2.awmlite.com",
            "block.cdy.one",
            "seed.bitcdy.com",
        ],
        base58_pubkey_prefix: 0x1c,
        base58_script_prefix: 0x58,
        cashaddr_prefix: "bitcoincandy",
        pool_whitelist: pool_whitelist(&pool_addresses, 0x1c, 0x58),
        genesis,
    }
}

fn testnet_params() -> ChainParams {
    let genesis = create_genesis_block(1_296_688_602, 414_098_458, 0x1d00_ffff, 1, 50 * COIN);
    let consensus = ConsensusParams {
        hash_genesis_block: hash_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        subsidy_halving_interval: 210_000,
        bip34_height: 21_111,
        bip34_hash: hash_from_hex(
            "0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8",
        ),
        bip65_height: 581_885,
        bip66_height: 330_776,
        csv_height: 770_112,
        uahf_height: 1_155_876,
        daa_height: 1_188_697,
        cdy_height: 201_601,
        new_rule_height: 201_651,
        cdy_zawy_lwma_height: 201_641,
        cdy_equihash_fork_height: 201_671,
        compense_height: 202_136,
        pool_protection_height: i32::MAX,
        cdy_max_future_block_time: 240,
        monolith_activation_time: 1_525_609_241,
        anti_replay_op_return_sunset_height: 1_250_000,
        anti_replay_op_return_commitment: ANTI_REPLAY_COMMITMENT.to_vec(),
        pow_limit: hash_from_hex(
            "0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_limit_legacy: hash_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        pow_target_spacing: 10 * 60,
        pow_target_spacing_cdy: 2 * 60,
        pow_target_timespan_legacy: 14 * 24 * 60 * 60,
        digishield_averaging_window: 30,
        digishield_max_adjust_down: 32,
        digishield_max_adjust_up: 16,
        zawy_lwma_averaging_window: 60,
        equihash_n: 200,
        equihash_k: 9,
        equihash_n_new: 144,
        equihash_k_new: 5,
        minimum_chain_work: hash_from_hex(
            "0000000000000000000000000000000000000000000000000453e926d09ebe87",
        ),
        default_assume_valid: hash_from_hex(
            "000000000000b41f1f2ddf130df8824e2b61c0af809ff86dd5cadb361d984ca7",
        ),
        checkpoints: vec![
            checkpoint(546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
            checkpoint(1_155_876, "00000000000e38fef93ed9582a7df43815d5c2ba9fd37ef70c9a0ea4a285b8f5"),
            checkpoint(1_188_697, "0000000000170ed0918077bde7b4d36cc4c91be69fa09211f748240dabe047fb"),
        ],
    };

    ChainParams {
        network: Network::Test,
        consensus,
        disk_magic: [0x0b, 0x11, 0x09, 0x07],
        net_magic: [0xf4, 0x43, 0x44, 0x59],
        default_port: 18_367,
        prune_after_height: 1_000,
        dns_seeds: vec!["testnet-seed.bitcoincandy.one"],
        base58_pubkey_prefix: 111,
        base58_script_prefix: 196,
        cashaddr_prefix: "cdytest",
        pool_whitelist: Vec::new(),
        genesis,
    }
}

fn regtest_params() -> ChainParams {
    let genesis = create_genesis_block(1_296_688_602, 2, 0x207f_ffff, 1, 50 * COIN);
    let consensus = ConsensusParams {
        hash_genesis_block: hash_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        subsidy_halving_interval: 150,
        // BIP34 has not activated on regtest.
        bip34_height: 100_000_000,
        bip34_hash: [0u8; 32],
        bip65_height: 1_351,
        bip66_height: 1_251,
        csv_height: 0,
        uahf_height: 2_017,
        daa_height: 2_250,
        cdy_height: 2_260,
        new_rule_height: 201_836,
        cdy_zawy_lwma_height: -1,
        cdy_equihash_fork_height: 201_876,
        compense_height: 202_000,
        pool_protection_height: i32::MAX,
        cdy_max_future_block_time: 7 * 10 * 60,
        monolith_activation_time: 1_526_400_000,
        anti_replay_op_return_sunset_height: 530_000,
        anti_replay_op_return_commitment: ANTI_REPLAY_COMMITMENT.to_vec(),
        pow_limit: hash_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_limit_legacy: hash_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        pow_target_spacing: 10 * 60,
        pow_target_spacing_cdy: 2 * 60,
        pow_target_timespan_legacy: 14 * 24 * 60 * 60,
        digishield_averaging_window: 30,
        digishield_max_adjust_down: 32,
        digishield_max_adjust_up: 16,
        zawy_lwma_averaging_window: 45,
        equihash_n: 48,
        equihash_k: 5,
        equihash_n_new: 96,
        equihash_k_new: 5,
        minimum_chain_work: [0u8; 32],
        default_assume_valid: [0u8; 32],
        checkpoints: vec![checkpoint(
            0,
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )],
    };

    ChainParams {
        network: Network::Regtest,
        consensus,
        disk_magic: [0xfa, 0xbf, 0xb5, 0xda],
        net_magic: [0xda, 0xb5, 0xbf, 0xfa],
        default_port: 18_444,
        prune_after_height: 1_000,
        dns_seeds: Vec::new(),
        base58_pubkey_prefix: 111,
        base58_script_prefix: 196,
        cashaddr_prefix: "cdyreg",
        pool_whitelist: Vec::new(),
        genesis,
    }
}

fn checkpoint(height: i32, hex: &str) -> Checkpoint {
    Checkpoint {
        height,
        hash: hash_from_hex(hex),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_blocks_hash_to_known_values() {
        for network in [Network::Main, Network::Test, Network::Regtest] {
            let params = ChainParams::for_network(network);
            assert_eq!(
                params.genesis.header.hash(),
                params.consensus.hash_genesis_block,
                "genesis hash mismatch on {}",
                network.as_str()
            );
            let mut mutated = false;
            assert_eq!(
                params.genesis.merkle_root(&mut mutated),
                hash_from_hex(
                    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                )
            );
        }
    }

    #[test]
    fn mainnet_fork_schedule_is_ordered() {
        let consensus = ChainParams::for_network(Network::Main).consensus;
        assert!(consensus.uahf_height < consensus.daa_height);
        assert!(consensus.daa_height < consensus.cdy_height);
        assert!(consensus.cdy_height < consensus.cdy_zawy_lwma_height);
        assert!(consensus.cdy_zawy_lwma_height < consensus.new_rule_height);
        assert!(consensus.new_rule_height < consensus.cdy_equihash_fork_height);
        assert!(consensus.cdy_equihash_fork_height < consensus.compense_height);
    }

    #[test]
    fn mainnet_pool_whitelist_decodes() {
        let params = ChainParams::for_network(Network::Main);
        assert_eq!(params.pool_whitelist.len(), 18);
        for script in &params.pool_whitelist {
            // All published pool addresses are P2PKH.
            assert_eq!(script.len(), 25);
            assert_eq!(script[0], 0x76);
            assert_eq!(*script.last().expect("non-empty"), 0xac);
        }
    }

    #[test]
    fn base58check_rejects_bad_checksum() {
        assert!(base58check_decode("CRxRgjnz3MPi7FCeV3oXjALLXbnesz8v3G").is_none());
    }
}
