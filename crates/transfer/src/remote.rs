//! Remote collaborators of the pipelines.
//!
//! The application implements [`RemoteFiles`] on top of whatever transport it
//! uses for remote procedures. Keeping it a trait leaves the pipelines
//! decoupled from that transport and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use vaultline_protocol::{FileStateResponse, UploadChunkRequest};

use crate::TransferError;

/// Boxed `Send` future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote procedures of the object store.
pub trait RemoteFiles: Send + Sync {
    /// `file.chunk.upload`: stores one sealed chunk. Idempotent per index.
    fn upload_chunk(&self, request: UploadChunkRequest) -> BoxFuture<'_, Result<(), TransferError>>;

    /// `file.url.get`: returns the ranged-fetch endpoint of a file.
    fn download_url(&self, file_id: &str) -> BoxFuture<'_, Result<String, TransferError>>;

    /// `file.state.get`: reports how far an upload got.
    fn file_state(&self, file_id: &str) -> BoxFuture<'_, Result<FileStateResponse, TransferError>>;
}

/// Fetches byte ranges of a stored file.
pub trait RangeFetcher: Send + Sync {
    /// Fetches `start..=end_inclusive` from `url`.
    ///
    /// Transport failures should surface as [`TransferError::Disconnected`]
    /// so callers can tell them apart.
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> BoxFuture<'_, Result<Vec<u8>, TransferError>>;
}
