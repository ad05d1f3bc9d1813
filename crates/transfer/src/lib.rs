//! Chunked, encrypted, resumable file transfer.
//!
//! Files are split into fixed-size chunks, each sealed with an AEAD cipher
//! under a per-chunk nonce derived from the file's base nonce. Uploads run a
//! read → encrypt → send pipeline; downloads run ranged fetch → decrypt →
//! write. Both keep a resume marker in a [`ResumeLedger`] while running and
//! report state and progress through a [`TransferHandle`].

mod chunk_size;
mod cipher;
mod config;
mod download;
mod error;
mod http;
mod ledger;
mod nonce;
mod process;
mod progress;
mod queue;
mod remote;
mod retry;
mod stream;
mod types;
mod upload;

#[cfg(test)]
mod testing;

pub use chunk_size::{CHUNK_SIZE_TABLE, ChunkSizeRow, chunk_size_for, chunk_size_from_table};
pub use cipher::{ChunkCipher, XChaChaCipher};
pub use config::{ConfigError, RetryConfig, TransferConfig};
pub use download::Downloader;
pub use error::{ErrorCategory, TransferError};
pub use http::HttpRangeFetcher;
pub use ledger::{JsonFileStore, KeyValueStore, MemoryStore, ResumeLedger, ResumeMarker};
pub use nonce::{BaseNonce, ChunkNonce, NonceSequencer, chunk_index_of, nonce_at};
pub use process::TransferHandle;
pub use progress::SpeedCalculator;
pub use queue::{PipelineQueue, TransferQueue};
pub use remote::{BoxFuture, RangeFetcher, RemoteFiles};
pub use retry::RetryPolicy;
pub use stream::{FileStream, LocalStream};
pub use types::{
    Chunk, ContentKey, FileTransferDescriptor, ResumePosition, TransferDirection, TransferEvent,
    TransferState, TransferSummary,
};
pub use upload::Uploader;

/// Bytes each sealed chunk carries beyond its plaintext: the 16-byte nonce
/// tail plus the 16-byte authentication tag.
pub const CHUNK_OVERHEAD: usize = 32;

/// Content key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;
