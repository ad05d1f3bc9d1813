//! In-memory collaborators for pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vaultline_protocol::{FileStateResponse, FileStatus, UploadChunkRequest};

use crate::cipher::{ChunkCipher, XChaChaCipher};
use crate::ledger::{KeyValueStore, MemoryStore};
use crate::nonce::{BaseNonce, NonceSequencer};
use crate::remote::{BoxFuture, RangeFetcher, RemoteFiles};
use crate::stream::LocalStream;
use crate::types::{ContentKey, FileTransferDescriptor};
use crate::{KEY_LEN, NONCE_LEN, TransferError};

/// Deterministic file contents.
pub(crate) fn plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub(crate) fn descriptor(chunk_size: usize, total_size: u64) -> FileTransferDescriptor {
    FileTransferDescriptor::new(
        "file-under-test",
        ContentKey::from_bytes([0x5a; KEY_LEN]),
        BaseNonce::from_bytes([0x17; NONCE_LEN]),
        chunk_size,
        total_size,
    )
    .unwrap()
}

/// Seals `plaintext` chunk by chunk, the way the store holds it.
pub(crate) fn seal_file(desc: &FileTransferDescriptor, plaintext: &[u8]) -> Vec<u8> {
    let mut seq = NonceSequencer::for_chunks(*desc.base_nonce(), 0, desc.chunk_count());
    plaintext
        .chunks(desc.chunk_size())
        .flat_map(|c| {
            XChaChaCipher
                .encrypt(c, desc.content_key(), &seq.next_nonce().unwrap())
                .unwrap()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryStream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StreamState {
    data: Vec<u8>,
    position: usize,
    closed: bool,
    fail_close: bool,
    fail_write: bool,
}

/// [`LocalStream`] over a shared buffer. Clones observe the same state.
#[derive(Clone, Default)]
pub(crate) struct MemoryStream {
    state: Arc<Mutex<StreamState>>,
}

impl MemoryStream {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                data,
                ..StreamState::default()
            })),
        }
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    pub(crate) fn fail_write(&self) {
        self.state.lock().unwrap().fail_write = true;
    }
}

fn closed_error() -> TransferError {
    TransferError::Io(std::io::Error::other("stream closed"))
}

impl LocalStream for MemoryStream {
    fn read(&mut self, max: usize) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut s = self.state.lock().unwrap();
            if s.closed {
                return Err(closed_error());
            }
            let start = s.position.min(s.data.len());
            let end = (start + max).min(s.data.len());
            let out = s.data[start..end].to_vec();
            s.position = end;
            Ok(out)
        })
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut s = self.state.lock().unwrap();
            if s.closed {
                return Err(closed_error());
            }
            if s.fail_write {
                return Err(TransferError::Io(std::io::Error::other("disk full")));
            }
            let pos = s.position;
            let end = pos + data.len();
            if s.data.len() < end {
                s.data.resize(end, 0);
            }
            s.data[pos..end].copy_from_slice(data);
            s.position = end;
            Ok(())
        })
    }

    fn seek(&mut self, position: u64) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            if s.closed {
                return Err(closed_error());
            }
            s.position = position as usize;
            Ok(())
        })
    }

    fn len(&mut self) -> BoxFuture<'_, Result<u64, TransferError>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().data.len() as u64) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.closed = true;
            if s.fail_close {
                return Err(TransferError::Io(std::io::Error::other("close failed")));
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// MockRemote
// ---------------------------------------------------------------------------

/// Scripted failure of one range fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchFault {
    Disconnect,
    ShortBody,
    EmptyBody,
}

/// In-memory object store implementing [`RemoteFiles`] and [`RangeFetcher`].
#[derive(Default)]
pub(crate) struct MockRemote {
    pub uploads: Mutex<Vec<UploadChunkRequest>>,
    pub fail_upload_at: Mutex<Option<u64>>,
    pub state: Mutex<Option<FileStateResponse>>,
    pub state_failures: AtomicUsize,
    pub state_calls: AtomicUsize,
    pub url_calls: AtomicUsize,
    /// Sealed file served to range fetches.
    pub blob: Mutex<Vec<u8>>,
    pub faults: Mutex<VecDeque<FetchFault>>,
    pub fetches: Mutex<Vec<(u64, u64)>>,
    /// Delays fetches of earlier ranges longer, so they settle out of order.
    pub reverse_fetch_order: Mutex<bool>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl MockRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn serving(blob: Vec<u8>) -> Arc<Self> {
        let remote = Self::default();
        *remote.blob.lock().unwrap() = blob;
        Arc::new(remote)
    }

    pub(crate) fn with_faults(self: Arc<Self>, faults: &[FetchFault]) -> Arc<Self> {
        self.faults.lock().unwrap().extend(faults.iter().copied());
        self
    }

    /// Uploaded chunks in chunk order; acknowledgements may land out of order.
    pub(crate) fn uploaded(&self) -> Vec<UploadChunkRequest> {
        let mut uploads = self.uploads.lock().unwrap().clone();
        uploads.sort_by_key(|r| r.chunk_num);
        uploads
    }

    pub(crate) fn set_state(&self, last_chunk_num: Option<u64>, complete: bool) {
        *self.state.lock().unwrap() = Some(FileStateResponse {
            status: if complete {
                FileStatus::Ready
            } else {
                FileStatus::Uploading
            },
            last_chunk_num,
            chunks_upload_complete: complete,
        });
    }
}

impl RemoteFiles for MockRemote {
    fn upload_chunk(&self, request: UploadChunkRequest) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if *self.fail_upload_at.lock().unwrap() == Some(request.chunk_num) {
                return Err(TransferError::Disconnected(format!(
                    "connection lost sending chunk {}",
                    request.chunk_num
                )));
            }
            self.uploads.lock().unwrap().push(request);
            Ok(())
        })
    }

    fn download_url(&self, file_id: &str) -> BoxFuture<'_, Result<String, TransferError>> {
        let url = format!("mock://{file_id}");
        Box::pin(async move {
            self.url_calls.fetch_add(1, Ordering::SeqCst);
            Ok(url)
        })
    }

    fn file_state(&self, _file_id: &str) -> BoxFuture<'_, Result<FileStateResponse, TransferError>> {
        Box::pin(async move {
            self.state_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.state_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.state_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransferError::Disconnected("state query failed".into()));
            }
            self.state
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| TransferError::Remote("unknown file".into()))
        })
    }
}

impl RangeFetcher for MockRemote {
    fn fetch_range(
        &self,
        _url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            self.fetches.lock().unwrap().push((start, end_inclusive));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if *self.reverse_fetch_order.lock().unwrap() {
                let delay = 1_000_000u64.saturating_sub(start / 1024);
                tokio::time::sleep(Duration::from_micros(delay)).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fault = self.faults.lock().unwrap().pop_front();
            let blob = self.blob.lock().unwrap();
            let s = (start as usize).min(blob.len());
            let e = (end_inclusive as usize + 1).min(blob.len());
            match fault {
                Some(FetchFault::Disconnect) => {
                    Err(TransferError::Disconnected("connection reset".into()))
                }
                Some(FetchFault::ShortBody) => Ok(blob[s..e.saturating_sub(1).max(s)].to_vec()),
                Some(FetchFault::EmptyBody) => Ok(Vec::new()),
                None => Ok(blob[s..e].to_vec()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// [`KeyValueStore`] whose first calls fail.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn failing_first(n: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(n),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(TransferError::Store("store unavailable".into()));
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>, TransferError>> {
        match self.trip() {
            Ok(()) => self.inner.get(key),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<(), TransferError>> {
        match self.trip() {
            Ok(()) => self.inner.set(key, value),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), TransferError>> {
        match self.trip() {
            Ok(()) => self.inner.delete(key),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, TransferError>> {
        match self.trip() {
            Ok(()) => self.inner.keys(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}
