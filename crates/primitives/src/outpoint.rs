use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::Hash256;

/// Reference to a transaction output.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }

    /// 36-byte key used by the UTXO column.
    pub fn key_bytes(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.hash);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}
