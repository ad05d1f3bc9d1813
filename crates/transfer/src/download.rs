//! Download pipeline: ranged fetch → decrypt → write.
//!
//! Up to `parallelism` range fetches run at once. Their bodies may arrive in
//! any order; they wait in a reorder buffer keyed by range start and are
//! split into sealed chunks strictly in file order. Decryption and writing
//! are sequential, with at most one write outstanding.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::TransferError;
use crate::cipher::{ChunkCipher, XChaChaCipher};
use crate::config::TransferConfig;
use crate::ledger::{ResumeLedger, ResumeMarker};
use crate::nonce::NonceSequencer;
use crate::process::{self, Pipeline, SharedStream, TransferHandle, TransferProcess};
use crate::queue::{PipelineQueue, TransferQueue};
use crate::remote::{BoxFuture, RangeFetcher, RemoteFiles};
use crate::retry::RetryPolicy;
use crate::stream::LocalStream;
use crate::types::{
    Chunk, FileTransferDescriptor, ResumePosition, TransferDirection, TransferEvent,
    TransferSummary,
};

/// Builds and starts the download of one file.
pub struct Downloader {
    descriptor: FileTransferDescriptor,
    stream: Box<dyn LocalStream>,
    remote: Arc<dyn RemoteFiles>,
    fetcher: Arc<dyn RangeFetcher>,
    cipher: Arc<dyn ChunkCipher>,
    config: TransferConfig,
    ledger: Option<(ResumeLedger, PathBuf)>,
    position: Option<ResumePosition>,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl Downloader {
    /// `stream` must be writable. Whatever it already holds is taken as the
    /// first bytes of the file and the download continues after them.
    pub fn new(
        descriptor: FileTransferDescriptor,
        stream: impl LocalStream + 'static,
        remote: Arc<dyn RemoteFiles>,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> Self {
        Self {
            descriptor,
            stream: Box::new(stream),
            remote,
            fetcher,
            cipher: Arc::new(XChaChaCipher),
            config: TransferConfig::default(),
            ledger: None,
            position: None,
            events: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn ChunkCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// Records a resume marker for `local_path` while the download runs.
    pub fn with_ledger(mut self, ledger: ResumeLedger, local_path: impl Into<PathBuf>) -> Self {
        self.ledger = Some((ledger, local_path.into()));
        self
    }

    /// Continues at an explicit position instead of the stream's length.
    pub fn resume_at(mut self, position: ResumePosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn start(self) -> TransferHandle {
        self.launch(None)
    }

    /// Starts the download once `queue` has a free slot.
    pub fn start_queued(self, queue: &TransferQueue) -> TransferHandle {
        self.launch(Some(queue.clone()))
    }

    fn launch(self, queue: Option<TransferQueue>) -> TransferHandle {
        let file_id = self.descriptor.file_id().to_string();
        let marker = self.ledger.map(|(ledger, local_path)| {
            (
                ledger,
                ResumeMarker {
                    file_id: file_id.clone(),
                    local_path,
                },
            )
        });
        let (process, handle) =
            TransferProcess::new(&file_id, TransferDirection::Download, self.events, marker);
        let pipeline = DownloadPipeline::new(
            self.descriptor,
            Arc::new(tokio::sync::Mutex::new(self.stream)),
            self.remote,
            self.fetcher,
            self.cipher,
            &self.config,
            self.position,
        );
        process::spawn(process, pipeline, queue);
        handle
    }
}

/// Outcome of one in-flight operation.
enum DownloadEvent {
    Fetched {
        start: u64,
        expected: usize,
        result: Result<Vec<u8>, TransferError>,
    },
    Written {
        index: u64,
        len: usize,
        result: Result<(), TransferError>,
    },
}

struct DownloadPipeline {
    descriptor: FileTransferDescriptor,
    stream: SharedStream,
    remote: Arc<dyn RemoteFiles>,
    fetcher: Arc<dyn RangeFetcher>,
    cipher: Arc<dyn ChunkCipher>,
    retry: RetryPolicy,
    parallelism: usize,
    range_len: u64,
    position: Option<ResumePosition>,
    decrypt_queue: PipelineQueue,
    /// Highest volume held by the decrypt queue, the reorder buffer and the
    /// fetches in flight together.
    peak_buffered: usize,
}

impl DownloadPipeline {
    fn new(
        descriptor: FileTransferDescriptor,
        stream: SharedStream,
        remote: Arc<dyn RemoteFiles>,
        fetcher: Arc<dyn RangeFetcher>,
        cipher: Arc<dyn ChunkCipher>,
        config: &TransferConfig,
        position: Option<ResumePosition>,
    ) -> Self {
        // A range never holds more than the decrypt queue may buffer, since
        // its whole body lands there at once.
        let enc = descriptor.encrypted_chunk_size() as u64;
        let range_cap = config.max_download_chunk_size.min(config.decrypt_ceiling()) as u64;
        let whole_chunks = (range_cap / enc).max(1);
        Self {
            descriptor,
            stream,
            remote,
            fetcher,
            cipher,
            retry: config.retry_policy(),
            parallelism: config.parallelism.max(1),
            range_len: whole_chunks * enc,
            position,
            decrypt_queue: PipelineQueue::new(config.decrypt_ceiling()),
            peak_buffered: 0,
        }
    }

    /// Fetches `start..=end` with retry. A body of the wrong length is
    /// retried; an empty body after retries is final.
    fn fetch_future(
        &self,
        url: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> BoxFuture<'static, DownloadEvent> {
        let fetcher = Arc::clone(&self.fetcher);
        let retry = self.retry.clone();
        let cancel = cancel.clone();
        let url = url.to_string();
        let expected = (end - start + 1) as usize;
        Box::pin(async move {
            let fetcher = &fetcher;
            let url = url.as_str();
            let result = retry
                .run("range fetch", &cancel, || async move {
                    let body = fetcher.fetch_range(url, start, end).await?;
                    if !body.is_empty() && body.len() != expected {
                        return Err(TransferError::Protocol(format!(
                            "range {start}-{end} returned {} bytes, expected {expected}",
                            body.len()
                        )));
                    }
                    Ok(body)
                })
                .await
                .and_then(|body| {
                    if body.is_empty() {
                        return Err(TransferError::Protocol(format!(
                            "range {start}-{end} returned no data"
                        )));
                    }
                    Ok(body)
                });
            DownloadEvent::Fetched {
                start,
                expected,
                result,
            }
        })
    }

    fn write_future(&self, index: u64, data: Vec<u8>) -> BoxFuture<'static, DownloadEvent> {
        let stream = Arc::clone(&self.stream);
        Box::pin(async move {
            let len = data.len();
            let result = stream.lock().await.write(&data).await;
            DownloadEvent::Written { index, len, result }
        })
    }

    /// Works out where to continue from what the local stream holds.
    async fn resume_position(&self) -> Result<ResumePosition, TransferError> {
        let d = &self.descriptor;
        let mut stream = self.stream.lock().await;
        let local_len = stream.len().await?;
        let position = self
            .position
            .unwrap_or_else(|| ResumePosition::from_plaintext_len(local_len, d.chunk_size()));
        let done = position.plaintext_len(d.chunk_size());
        if done > d.total_size() {
            return Err(TransferError::Protocol(format!(
                "local file holds {done} bytes of a {}-byte file",
                d.total_size()
            )));
        }
        // Writes continue at the end of the stream; append-mode files ignore
        // the seek below.
        if done != local_len {
            return Err(TransferError::Protocol(format!(
                "resume position covers {done} bytes but the local file holds {local_len}"
            )));
        }
        if done > 0 {
            stream.seek(done).await?;
        }
        Ok(position)
    }

    async fn download(
        &mut self,
        process: &mut TransferProcess,
    ) -> Result<TransferSummary, TransferError> {
        let d = self.descriptor.clone();
        if self.cipher.overhead() != d.chunk_overhead() {
            return Err(TransferError::Internal(format!(
                "cipher overhead {} does not match descriptor overhead {}",
                self.cipher.overhead(),
                d.chunk_overhead()
            )));
        }

        let position = self.resume_position().await?;
        let done = position.plaintext_len(d.chunk_size());
        let start_index = position.whole_chunks_completed;
        process.set_progress(done, d.total_size());
        if done == d.total_size() {
            info!(file_id = %d.file_id(), "local file already complete");
            return Ok(summary(&d, start_index, 0, 0));
        }
        if done > 0 {
            info!(
                file_id = %d.file_id(),
                whole_chunks = start_index,
                partial_bytes = position.partial_chunk_plaintext_bytes,
                "resuming download"
            );
        }

        let cancel = process.cancel_token().clone();
        let url = {
            let remote = &self.remote;
            let file_id = d.file_id();
            self.retry
                .run("file.url.get", &cancel, || remote.download_url(file_id))
                .await?
        };

        let enc = d.encrypted_chunk_size() as u64;
        let remote_end = d.size_with_overhead();
        let mut fetch_pos = start_index * enc;
        let mut release_pos = fetch_pos;
        let mut next_split = start_index;
        let mut reorder: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let mut reserved = 0usize;
        let mut fetching = 0usize;
        let mut writing = false;
        let mut trim = position.partial_chunk_plaintext_bytes;
        let mut sequencer = NonceSequencer::for_chunks(*d.base_nonce(), start_index, d.chunk_count());
        let mut in_flight: FuturesUnordered<BoxFuture<'static, DownloadEvent>> = FuturesUnordered::new();
        let mut chunks_written = 0u64;
        let mut bytes_written = 0u64;

        loop {
            process.check_cancelled()?;
            let mut progressed = false;

            // Ranged fetch. Bytes in flight and in the reorder buffer count
            // against the decrypt ceiling.
            while fetching < self.parallelism && fetch_pos < remote_end {
                let end = (fetch_pos + self.range_len).min(remote_end) - 1;
                let len = (end - fetch_pos + 1) as usize;
                let buffered = self.decrypt_queue.bytes() + reserved;
                if buffered > 0 && buffered + len > self.decrypt_queue.ceiling() {
                    break;
                }
                in_flight.push(self.fetch_future(&url, fetch_pos, end, &cancel));
                reserved += len;
                fetching += 1;
                fetch_pos = end + 1;
                progressed = true;
            }
            self.peak_buffered = self.peak_buffered.max(self.decrypt_queue.bytes() + reserved);

            // Decrypt, then hand the plaintext to a write.
            if !writing && let Some(chunk) = self.decrypt_queue.pop() {
                if sequencer.next_index() != chunk.index {
                    return Err(TransferError::Internal(format!(
                        "chunk {} reached decryption at nonce index {}",
                        chunk.index,
                        sequencer.next_index()
                    )));
                }
                let nonce = sequencer.next_nonce()?;
                let mut plain = self.cipher.decrypt(&chunk.data, d.content_key(), &nonce)?;
                let expected = d.plaintext_len_of(chunk.index).unwrap_or(0);
                if plain.len() != expected {
                    return Err(TransferError::Integrity(format!(
                        "chunk {} decrypted to {} bytes, expected {expected}",
                        chunk.index,
                        plain.len()
                    )));
                }
                if trim > 0 {
                    if trim >= plain.len() {
                        return Err(TransferError::Integrity(format!(
                            "cannot skip {trim} bytes of a {}-byte chunk",
                            plain.len()
                        )));
                    }
                    plain.drain(..trim);
                    trim = 0;
                }
                in_flight.push(self.write_future(chunk.index, plain));
                writing = true;
                progressed = true;
            }

            if fetch_pos >= remote_end
                && fetching == 0
                && reorder.is_empty()
                && self.decrypt_queue.is_empty()
                && !writing
            {
                if !sequencer.eof() {
                    return Err(TransferError::Internal(format!(
                        "download ended at chunk {} of {}",
                        sequencer.next_index(),
                        d.chunk_count()
                    )));
                }
                return Ok(summary(&d, start_index, chunks_written, bytes_written));
            }

            if in_flight.is_empty() {
                if !progressed {
                    return Err(TransferError::Internal("download pipeline stalled".into()));
                }
                tokio::task::yield_now().await;
                continue;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                Some(event) = in_flight.next() => event,
            };
            match event {
                DownloadEvent::Fetched {
                    start,
                    expected,
                    result,
                } => {
                    fetching -= 1;
                    reserved -= expected;
                    let body = result?;
                    reserved += body.len();
                    reorder.insert(start, body);

                    while let Some(body) = reorder.remove(&release_pos) {
                        reserved -= body.len();
                        release_pos += body.len() as u64;
                        for piece in body.chunks(enc as usize) {
                            self.decrypt_queue.push(Chunk {
                                index: next_split,
                                data: piece.to_vec(),
                            })?;
                            next_split += 1;
                        }
                    }
                }
                DownloadEvent::Written { index, len, result } => {
                    result?;
                    writing = false;
                    chunks_written += 1;
                    bytes_written += len as u64;
                    debug!(file_id = %d.file_id(), chunk = index, bytes = len, "chunk written");
                    process.add_progress(len as u64);
                }
            }
        }
    }
}

fn summary(
    d: &FileTransferDescriptor,
    resumed_from_chunk: u64,
    chunks_transferred: u64,
    bytes_transferred: u64,
) -> TransferSummary {
    TransferSummary {
        file_id: d.file_id().to_string(),
        resumed_from_chunk,
        chunks_transferred,
        bytes_transferred,
    }
}

impl Pipeline for DownloadPipeline {
    fn run<'a>(
        &'a mut self,
        process: &'a mut TransferProcess,
    ) -> BoxFuture<'a, Result<TransferSummary, TransferError>> {
        Box::pin(self.download(process))
    }

    fn stream(&self) -> &SharedStream {
        &self.stream
    }
}
