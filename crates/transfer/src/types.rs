use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::chunk_size::chunk_size_for;
use crate::nonce::BaseNonce;
use crate::{CHUNK_OVERHEAD, KEY_LEN, TransferError};

/// Symmetric key for every chunk of one file.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Draws a fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

/// Everything needed to move one file, fixed for the file's lifetime.
#[derive(Debug, Clone)]
pub struct FileTransferDescriptor {
    file_id: String,
    content_key: ContentKey,
    base_nonce: BaseNonce,
    chunk_size: usize,
    total_size: u64,
    chunk_overhead: usize,
}

impl FileTransferDescriptor {
    /// Builds a descriptor for an existing file.
    ///
    /// `chunk_size` must be the size the file was uploaded with.
    pub fn new(
        file_id: impl Into<String>,
        content_key: ContentKey,
        base_nonce: BaseNonce,
        chunk_size: usize,
        total_size: u64,
    ) -> Result<Self, TransferError> {
        let file_id = file_id.into();
        if file_id.is_empty() {
            return Err(TransferError::Internal("empty file id".into()));
        }
        if chunk_size == 0 {
            return Err(TransferError::Internal("chunk size must be positive".into()));
        }
        Ok(Self {
            file_id,
            content_key,
            base_nonce,
            chunk_size,
            total_size,
            chunk_overhead: CHUNK_OVERHEAD,
        })
    }

    /// Creates a descriptor for a file that has never been uploaded: fresh
    /// id, key and base nonce, chunk size from the size table.
    pub fn for_new_upload(total_size: u64) -> Result<Self, TransferError> {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            ContentKey::generate(),
            BaseNonce::generate(),
            chunk_size_for(total_size)?,
            total_size,
        )
    }

    /// Overrides the per-chunk overhead for ciphers other than the default.
    pub fn with_chunk_overhead(mut self, overhead: usize) -> Self {
        self.chunk_overhead = overhead;
        self
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn content_key(&self) -> &ContentKey {
        &self.content_key
    }

    pub fn base_nonce(&self) -> &BaseNonce {
        &self.base_nonce
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_overhead(&self) -> usize {
        self.chunk_overhead
    }

    /// Number of chunks; zero for an empty file.
    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// Index of the final chunk, `None` for an empty file.
    pub fn last_index(&self) -> Option<u64> {
        self.chunk_count().checked_sub(1)
    }

    /// Stored size of a full chunk.
    pub fn encrypted_chunk_size(&self) -> usize {
        self.chunk_size + self.chunk_overhead
    }

    /// Stored size of the whole file.
    pub fn size_with_overhead(&self) -> u64 {
        self.total_size + self.chunk_count() * self.chunk_overhead as u64
    }

    /// Plaintext length of chunk `index`, `None` past the last chunk.
    pub fn plaintext_len_of(&self, index: u64) -> Option<usize> {
        let last = self.last_index()?;
        if index > last {
            return None;
        }
        if index < last {
            return Some(self.chunk_size);
        }
        Some((self.total_size - last * self.chunk_size as u64) as usize)
    }

    /// Plaintext offset where chunk `index` starts.
    pub fn offset_of(&self, index: u64) -> u64 {
        index * self.chunk_size as u64
    }
}

/// One chunk moving through a pipeline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Where an interrupted transfer picks up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePosition {
    pub whole_chunks_completed: u64,
    /// Plaintext bytes of the next chunk already present locally.
    pub partial_chunk_plaintext_bytes: usize,
}

impl ResumePosition {
    /// Splits a local plaintext length into whole chunks and a remainder.
    pub fn from_plaintext_len(len: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size as u64;
        Self {
            whole_chunks_completed: len / chunk_size,
            partial_chunk_plaintext_bytes: (len % chunk_size) as usize,
        }
    }

    /// Plaintext bytes covered by this position.
    pub fn plaintext_len(&self, chunk_size: usize) -> u64 {
        self.whole_chunks_completed * chunk_size as u64 + self.partial_chunk_plaintext_bytes as u64
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Returns `true` for the three terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransferState::Created => "created",
            TransferState::Running => "running",
            TransferState::Succeeded => "succeeded",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        })
    }
}

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Notifications emitted while a transfer runs.
///
/// Serialized with a `type` tag so a UI bridge can forward them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    StateChanged {
        file_id: String,
        direction: TransferDirection,
        state: TransferState,
    },
    Progress {
        file_id: String,
        direction: TransferDirection,
        /// Bytes processed so far, including bytes done before a resume.
        processed: u64,
        total: u64,
        bytes_per_second: f64,
    },
}

/// Result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub file_id: String,
    /// Chunk index this session started from.
    pub resumed_from_chunk: u64,
    /// Chunks moved by this session.
    pub chunks_transferred: u64,
    /// Bytes moved by this session (ciphertext for uploads, plaintext for
    /// downloads).
    pub bytes_transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(chunk_size: usize, total_size: u64) -> FileTransferDescriptor {
        FileTransferDescriptor::new(
            "file-1",
            ContentKey::from_bytes([7; KEY_LEN]),
            BaseNonce::from_bytes([1; crate::NONCE_LEN]),
            chunk_size,
            total_size,
        )
        .unwrap()
    }

    #[test]
    fn one_million_bytes_layout() {
        let d = descriptor(192 * 1024, 1_000_000);
        assert_eq!(d.chunk_count(), 6);
        assert_eq!(d.last_index(), Some(5));
        assert_eq!(d.plaintext_len_of(0), Some(196_608));
        assert_eq!(d.plaintext_len_of(5), Some(16_960));
        assert_eq!(d.plaintext_len_of(6), None);
        assert_eq!(d.size_with_overhead(), 1_000_000 + 6 * 32);
    }

    #[test]
    fn even_division_keeps_full_last_chunk() {
        let d = descriptor(100, 300);
        assert_eq!(d.chunk_count(), 3);
        assert_eq!(d.plaintext_len_of(2), Some(100));
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let d = descriptor(100, 0);
        assert_eq!(d.chunk_count(), 0);
        assert_eq!(d.last_index(), None);
        assert_eq!(d.plaintext_len_of(0), None);
        assert_eq!(d.size_with_overhead(), 0);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = FileTransferDescriptor::new(
            "f",
            ContentKey::generate(),
            BaseNonce::generate(),
            0,
            10,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Internal(_)));
    }

    #[test]
    fn new_upload_descriptor() {
        let d = FileTransferDescriptor::for_new_upload(1_000_000).unwrap();
        assert_eq!(d.chunk_size(), 192 * 1024);
        assert_eq!(d.chunk_overhead(), CHUNK_OVERHEAD);
        assert!(uuid::Uuid::parse_str(d.file_id()).is_ok());
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = ContentKey::from_bytes([0xab; KEY_LEN]);
        let dbg = format!("{key:?}");
        assert!(!dbg.contains("ab"));
        assert!(dbg.contains("redacted"));
    }

    #[test]
    fn resume_position_splits_length() {
        let chunk = 192 * 1024;
        for n in [0u64, 1, 10_000, chunk as u64, 2 * chunk as u64 + 10_000, 999_999] {
            let pos = ResumePosition::from_plaintext_len(n, chunk);
            assert!(pos.partial_chunk_plaintext_bytes < chunk);
            assert_eq!(pos.plaintext_len(chunk), n);
        }
        let pos = ResumePosition::from_plaintext_len(2 * chunk as u64 + 10_000, chunk);
        assert_eq!(pos.whole_chunks_completed, 2);
        assert_eq!(pos.partial_chunk_plaintext_bytes, 10_000);
    }

    #[test]
    fn terminal_states() {
        assert!(!TransferState::Created.is_terminal());
        assert!(!TransferState::Running.is_terminal());
        assert!(TransferState::Succeeded.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
    }
}
