//! Append-only flat files for block bodies and undo records.
//!
//! Each record is framed as `magic || u32-LE length || payload`. Undo
//! records additionally append a double-SHA256 checksum of
//! `(prev_block_hash || payload)`. Files roll over when an append would
//! exceed the size cap.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candyd_primitives::hash::sha256d;
use candyd_primitives::Hash256;

/// Opaque position of a payload inside the flat file set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    /// Byte offset of the payload within the file.
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(String),
    BadMagic,
    BadLength,
    ChecksumMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(message) => write!(f, "{message}"),
            FlatFileError::BadMagic => write!(f, "record has wrong magic"),
            FlatFileError::BadLength => write!(f, "record length mismatch"),
            FlatFileError::ChecksumMismatch => write!(f, "undo checksum mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err.to_string())
    }
}

struct AppendState {
    file_id: u32,
    file_len: u64,
}

pub struct FlatFileStore {
    directory: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<AppendState>,
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;

impl FlatFileStore {
    pub fn open(
        directory: impl AsRef<Path>,
        prefix: &'static str,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        // Resume appending to the highest existing file.
        let mut file_id = 0u32;
        loop {
            let next = file_path(&directory, prefix, file_id + 1);
            if next.exists() {
                file_id += 1;
            } else {
                break;
            }
        }
        let file_len = match std::fs::metadata(file_path(&directory, prefix, file_id)) {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        Ok(Self {
            directory,
            prefix,
            magic,
            max_file_size,
            state: Mutex::new(AppendState { file_id, file_len }),
        })
    }

    fn path(&self, file_id: u32) -> PathBuf {
        file_path(&self.directory, self.prefix, file_id)
    }

    fn append_record(&self, payload: &[u8], trailer: Option<&Hash256>) -> Result<FileLocation, FlatFileError> {
        let trailer_len = trailer.map_or(0, |_| 32u64);
        let record_len = 8 + payload.len() as u64 + trailer_len;

        let mut state = self
            .state
            .lock()
            .map_err(|_| FlatFileError::Io("flat file lock poisoned".to_string()))?;

        if state.file_len > 0 && state.file_len + record_len > self.max_file_size {
            state.file_id += 1;
            state.file_len = 0;
        }

        let path = self.path(state.file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        if let Some(checksum) = trailer {
            file.write_all(checksum)?;
        }
        file.flush()?;

        let offset = state.file_len + 8;
        let location = FileLocation {
            file_id: state.file_id,
            offset,
            len: payload.len() as u32,
        };
        state.file_len += record_len;
        Ok(location)
    }

    /// Append a record and return its location.
    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        self.append_record(payload, None)
    }

    /// Append an undo record with its checksum over
    /// `(prev_block_hash || payload)`.
    pub fn append_with_checksum(
        &self,
        payload: &[u8],
        prev_block_hash: &Hash256,
    ) -> Result<FileLocation, FlatFileError> {
        let checksum = undo_checksum(prev_block_hash, payload);
        self.append_record(payload, Some(&checksum))
    }

    fn read_at(&self, location: FileLocation, extra: u64) -> Result<Vec<u8>, FlatFileError> {
        let mut file = File::open(self.path(location.file_id))?;

        // Verify the frame before trusting the payload bounds.
        file.seek(SeekFrom::Start(location.offset.saturating_sub(8)))?;
        let mut frame = [0u8; 8];
        file.read_exact(&mut frame)?;
        if frame[..4] != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let framed_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if framed_len != location.len {
            return Err(FlatFileError::BadLength);
        }

        let mut payload = vec![0u8; location.len as usize + extra as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read a record payload back.
    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.read_at(location, 0)
    }

    /// Read an undo record and verify its checksum.
    pub fn read_with_checksum(
        &self,
        location: FileLocation,
        prev_block_hash: &Hash256,
    ) -> Result<Vec<u8>, FlatFileError> {
        let mut payload = self.read_at(location, 32)?;
        let checksum: Vec<u8> = payload.split_off(location.len as usize);
        if checksum != undo_checksum(prev_block_hash, &payload) {
            return Err(FlatFileError::ChecksumMismatch);
        }
        Ok(payload)
    }

    /// Delete the given files outright. Only rolled-over files may be
    /// pruned; the active append target is refused.
    pub fn prune(&self, file_ids: &[u32]) -> Result<(), FlatFileError> {
        let state = self
            .state
            .lock()
            .map_err(|_| FlatFileError::Io("flat file lock poisoned".to_string()))?;
        for &file_id in file_ids {
            if file_id == state.file_id {
                continue;
            }
            let path = self.path(file_id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn current_file(&self) -> (u32, u64) {
        let state = self.state.lock().expect("flat file lock");
        (state.file_id, state.file_len)
    }
}

fn file_path(directory: &Path, prefix: &str, file_id: u32) -> PathBuf {
    directory.join(format!("{prefix}{file_id:05}.dat"))
}

fn undo_checksum(prev_block_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(prev_block_hash);
    data.extend_from_slice(payload);
    sha256d(&data)
}
