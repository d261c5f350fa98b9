//! Per-file metadata for the flat block/undo files.

use candyd_primitives::encoding::{DecodeError, Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";
pub const META_LAST_UNDO_FILE_KEY: &[u8] = b"last_undo_file";

const BLOCK_FILE_INFO_PREFIX: &[u8] = b"blockfile:";
const UNDO_FILE_INFO_PREFIX: &[u8] = b"undofile:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    /// Number of records stored in the file.
    pub blocks: u32,
    /// Bytes used.
    pub size: u64,
    /// Lowest and highest block heights in the file.
    pub height_first: u32,
    pub height_last: u32,
    /// Earliest and latest block times in the file.
    pub time_first: u64,
    pub time_last: u64,
}

impl FlatFileInfo {
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u32_le(self.height_first);
        encoder.write_u32_le(self.height_last);
        encoder.write_u64_le(self.time_first);
        encoder.write_u64_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            height_first: decoder.read_u32_le()?,
            height_last: decoder.read_u32_le()?,
            time_first: decoder.read_u64_le()?,
            time_last: decoder.read_u64_le()?,
        };
        decoder.finish()?;
        Ok(info)
    }
}

pub fn block_file_info_key(file_id: u32) -> Vec<u8> {
    let mut key = BLOCK_FILE_INFO_PREFIX.to_vec();
    key.extend_from_slice(&file_id.to_be_bytes());
    key
}

pub fn undo_file_info_key(file_id: u32) -> Vec<u8> {
    let mut key = UNDO_FILE_INFO_PREFIX.to_vec();
    key.extend_from_slice(&file_id.to_be_bytes());
    key
}

pub fn parse_block_file_info_key(key: &[u8]) -> Option<u32> {
    parse_file_key(key, BLOCK_FILE_INFO_PREFIX)
}

pub fn parse_undo_file_info_key(key: &[u8]) -> Option<u32> {
    parse_file_key(key, UNDO_FILE_INFO_PREFIX)
}

fn parse_file_key(key: &[u8], prefix: &[u8]) -> Option<u32> {
    let rest = key.strip_prefix(prefix)?;
    if rest.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))
}
