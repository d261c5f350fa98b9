use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::merkle::block_merkle_root;
use crate::transaction::Transaction;
use crate::Hash256;

/// Block header.
///
/// Headers carry both the legacy Bitcoin fields and the post-fork fields
/// (height, reserved words, 256-bit nonce, Equihash solution). Pre-fork
/// headers leave `solution` empty and only the low 32 bits of `nonce`
/// meaningful. Serialization always uses the full layout; hashing picks
/// the layout matching the header's format, so a header hashes the same
/// way the network that produced it hashed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub height: u32,
    pub reserved: [u32; 7],
    pub time: u32,
    pub bits: u32,
    pub nonce: [u8; 32],
    pub solution: Vec<u8>,
}

impl BlockHeader {
    pub fn is_postfork(&self) -> bool {
        !self.solution.is_empty()
    }

    /// Legacy 80-byte layout used for hashing pre-fork headers.
    fn encode_legacy(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(80);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        let mut nonce32 = [0u8; 4];
        nonce32.copy_from_slice(&self.nonce[..4]);
        encoder.write_u32_le(u32::from_le_bytes(nonce32));
        encoder.into_inner()
    }

    fn encode_fields(&self, encoder: &mut Encoder, with_pow: bool) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.height);
        for word in self.reserved {
            encoder.write_u32_le(word);
        }
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        if with_pow {
            encoder.write_bytes(&self.nonce);
            encoder.write_var_bytes(&self.solution);
        }
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(140 + self.solution.len());
        self.encode_fields(&mut encoder, true);
        encoder.into_inner()
    }

    /// Header bytes the Equihash puzzle commits to: the full layout minus
    /// nonce and solution.
    pub fn equihash_input(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(108);
        self.encode_fields(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let height = decoder.read_u32_le()?;
        let mut reserved = [0u32; 7];
        for word in &mut reserved {
            *word = decoder.read_u32_le()?;
        }
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_hash()?;
        let solution = decoder.read_var_bytes()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            height,
            reserved,
            time,
            bits,
            nonce,
            solution,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    pub fn hash(&self) -> Hash256 {
        if self.is_postfork() {
            sha256d(&self.consensus_encode())
        } else {
            sha256d(&self.encode_legacy())
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.encode_fields(&mut encoder, true);
        encoder.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let count = decoder.read_compact_size()?;
        if count > decoder.remaining() as u64 {
            return Err(DecodeError::OversizedAllocation);
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    pub fn merkle_root(&self, mutated: &mut bool) -> Hash256 {
        block_merkle_root(&self.transactions, mutated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn sample_header(solution: Vec<u8>) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            height: 512_667,
            reserved: [0u32; 7],
            time: 1_515_800_000,
            bits: 0x1f07_ffff,
            nonce: [5u8; 32],
            solution,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header(vec![1, 2, 3]);
        let bytes = header.consensus_encode();
        assert_eq!(BlockHeader::consensus_decode(&bytes).expect("decode"), header);
    }

    #[test]
    fn prefork_and_postfork_hash_differently() {
        let legacy = sample_header(Vec::new());
        let forked = sample_header(vec![0u8; 8]);
        assert_ne!(legacy.hash(), forked.hash());
        // The legacy hash must ignore post-fork fields.
        let mut moved = legacy.clone();
        moved.height = 1;
        moved.reserved[0] = 9;
        assert_eq!(legacy.hash(), moved.hash());
    }

    #[test]
    fn block_roundtrip() {
        let block = Block {
            header: sample_header(vec![7u8; 4]),
            transactions: vec![Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig: vec![0x01, 0x02],
                    sequence: 0xffff_ffff,
                }],
                vout: vec![TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        };
        let bytes = block.consensus_encode();
        assert_eq!(Block::consensus_decode(&bytes).expect("decode"), block);
    }
}
