//! Upload pipeline: read → encrypt → transmit.
//!
//! Every stage has a bounded queue in front of it. Reads and chunk sends run
//! as futures in one `FuturesUnordered`; each tick runs the stages, then
//! waits for the next of those futures (or cancellation) to settle.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tracing::{debug, info};
use vaultline_protocol::UploadChunkRequest;

use crate::TransferError;
use crate::cipher::{ChunkCipher, XChaChaCipher};
use crate::config::TransferConfig;
use crate::ledger::{ResumeLedger, ResumeMarker};
use crate::nonce::NonceSequencer;
use crate::process::{self, Pipeline, SharedStream, TransferHandle, TransferProcess};
use crate::queue::{PipelineQueue, TransferQueue};
use crate::remote::{BoxFuture, RemoteFiles};
use crate::retry::RetryPolicy;
use crate::stream::LocalStream;
use crate::types::{Chunk, FileTransferDescriptor, TransferDirection, TransferEvent, TransferSummary};

/// Builds and starts the upload of one file.
pub struct Uploader {
    descriptor: FileTransferDescriptor,
    stream: Box<dyn LocalStream>,
    remote: Arc<dyn RemoteFiles>,
    cipher: Arc<dyn ChunkCipher>,
    config: TransferConfig,
    ledger: Option<(ResumeLedger, PathBuf)>,
    resume: bool,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl Uploader {
    /// `stream` must be readable and positioned at the start of the file.
    pub fn new(
        descriptor: FileTransferDescriptor,
        stream: impl LocalStream + 'static,
        remote: Arc<dyn RemoteFiles>,
    ) -> Self {
        Self {
            descriptor,
            stream: Box::new(stream),
            remote,
            cipher: Arc::new(XChaChaCipher),
            config: TransferConfig::default(),
            ledger: None,
            resume: false,
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

    /// Records a resume marker for `local_path` while the upload runs.
    pub fn with_ledger(mut self, ledger: ResumeLedger, local_path: impl Into<PathBuf>) -> Self {
        self.ledger = Some((ledger, local_path.into()));
        self
    }

    /// Continues from the chunks the server already holds.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Starts the upload right away.
    pub fn start(self) -> TransferHandle {
        self.launch(None)
    }

    /// Starts the upload once `queue` has a free slot.
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
            TransferProcess::new(&file_id, TransferDirection::Upload, self.events, marker);
        let pipeline = UploadPipeline::new(
            self.descriptor,
            Arc::new(tokio::sync::Mutex::new(self.stream)),
            self.remote,
            self.cipher,
            &self.config,
            self.resume,
        );
        process::spawn(process, pipeline, queue);
        handle
    }
}

/// Outcome of one in-flight operation.
enum UploadEvent {
    Read(Result<Vec<u8>, TransferError>),
    Sent {
        index: u64,
        len: usize,
        result: Result<(), TransferError>,
    },
}

struct UploadPipeline {
    descriptor: FileTransferDescriptor,
    stream: SharedStream,
    remote: Arc<dyn RemoteFiles>,
    cipher: Arc<dyn ChunkCipher>,
    retry: RetryPolicy,
    resume: bool,
    max_response_queue: usize,
    read_queue: PipelineQueue,
    transmit_queue: PipelineQueue,
}

impl UploadPipeline {
    fn new(
        descriptor: FileTransferDescriptor,
        stream: SharedStream,
        remote: Arc<dyn RemoteFiles>,
        cipher: Arc<dyn ChunkCipher>,
        config: &TransferConfig,
        resume: bool,
    ) -> Self {
        Self {
            descriptor,
            stream,
            remote,
            cipher,
            retry: config.retry_policy(),
            resume,
            max_response_queue: config.max_response_queue.max(1),
            read_queue: PipelineQueue::new(config.encrypt_buffer_size),
            transmit_queue: PipelineQueue::new(config.upload_buffer_size),
        }
    }

    /// Asks the server where to continue. `None` means nothing is left.
    async fn resume_point(&self, process: &TransferProcess) -> Result<Option<u64>, TransferError> {
        let d = &self.descriptor;
        let remote = &self.remote;
        let file_id = d.file_id();
        let state = self
            .retry
            .run("file.state.get", process.cancel_token(), || remote.file_state(file_id))
            .await?;
        if state.is_complete() {
            return Ok(None);
        }
        let next = state.next_chunk_num();
        let count = d.chunk_count();
        if next > count {
            return Err(TransferError::Protocol(format!(
                "server holds chunk {} of a {count}-chunk file",
                next - 1
            )));
        }
        // All chunks stored but the upload never completed: send the final
        // chunk again so the server sees `last`.
        Ok(Some(next.min(count - 1)))
    }

    fn read_future(&self, max: usize) -> BoxFuture<'static, UploadEvent> {
        let stream = Arc::clone(&self.stream);
        Box::pin(async move { UploadEvent::Read(stream.lock().await.read(max).await) })
    }

    fn send_future(&self, request: UploadChunkRequest) -> BoxFuture<'static, UploadEvent> {
        let remote = Arc::clone(&self.remote);
        Box::pin(async move {
            let index = request.chunk_num;
            let len = request.data.len();
            let result = remote.upload_chunk(request).await;
            UploadEvent::Sent { index, len, result }
        })
    }

    /// Checks a finished read against the descriptor and queues it.
    fn accept_read(&mut self, index: u64, data: Vec<u8>) -> Result<(), TransferError> {
        let d = &self.descriptor;
        let expected = d.plaintext_len_of(index).ok_or_else(|| {
            TransferError::Internal(format!("read past final chunk (index {index})"))
        })?;
        if data.len() > expected {
            return Err(TransferError::Protocol(format!(
                "local file is larger than the {} bytes being uploaded",
                d.total_size()
            )));
        }
        if data.len() < expected {
            return Err(TransferError::Protocol(format!(
                "local file ended early: chunk {index} has {} bytes, expected {expected}",
                data.len()
            )));
        }
        self.read_queue.push(Chunk { index, data })
    }

    async fn upload(&mut self, process: &mut TransferProcess) -> Result<TransferSummary, TransferError> {
        let d = self.descriptor.clone();
        if self.cipher.overhead() != d.chunk_overhead() {
            return Err(TransferError::Internal(format!(
                "cipher overhead {} does not match descriptor overhead {}",
                self.cipher.overhead(),
                d.chunk_overhead()
            )));
        }

        let chunk_count = d.chunk_count();
        let total = d.size_with_overhead();
        if chunk_count == 0 {
            process.set_progress(0, 0);
            return Ok(summary(&d, 0, 0, 0));
        }
        let start = if self.resume {
            self.resume_point(process).await?
        } else {
            Some(0)
        };
        let Some(start) = start else {
            info!(file_id = %d.file_id(), "server already holds the complete file");
            process.set_progress(total, total);
            return Ok(summary(&d, chunk_count, 0, 0));
        };

        if start > 0 {
            self.stream.lock().await.seek(d.offset_of(start)).await?;
            info!(file_id = %d.file_id(), chunk = start, chunks = chunk_count, "resuming upload");
        }
        process.set_progress(start * d.encrypted_chunk_size() as u64, total);

        let last_index = chunk_count - 1;
        let cancel = process.cancel_token().clone();
        let mut sequencer = NonceSequencer::for_chunks(*d.base_nonce(), start, chunk_count);
        let mut in_flight: FuturesUnordered<BoxFuture<'static, UploadEvent>> = FuturesUnordered::new();
        let mut next_read = start;
        let mut eof = false;
        let mut reading = false;
        let mut awaiting_ack = 0usize;
        let mut chunks_sent = 0u64;
        let mut bytes_sent = 0u64;

        loop {
            process.check_cancelled()?;
            let mut progressed = false;

            // Read. The final chunk asks for one byte more than it should
            // hold, so a file that grew is caught before `last` goes out.
            if !eof && !reading {
                let expected = d.plaintext_len_of(next_read).unwrap_or(0);
                if self.read_queue.can_accept(expected) {
                    let max = if next_read == last_index {
                        expected + 1
                    } else {
                        d.chunk_size()
                    };
                    in_flight.push(self.read_future(max));
                    reading = true;
                    progressed = true;
                }
            }

            // Encrypt.
            while let Some(len) = self.read_queue.front_len()
                && self.transmit_queue.can_accept(len + d.chunk_overhead())
            {
                let Some(chunk) = self.read_queue.pop() else {
                    break;
                };
                if sequencer.next_index() != chunk.index {
                    return Err(TransferError::Internal(format!(
                        "chunk {} reached encryption at nonce index {}",
                        chunk.index,
                        sequencer.next_index()
                    )));
                }
                let nonce = sequencer.next_nonce()?;
                let sealed = self.cipher.encrypt(&chunk.data, d.content_key(), &nonce)?;
                self.transmit_queue.push(Chunk {
                    index: chunk.index,
                    data: sealed,
                })?;
                progressed = true;
            }

            // Transmit.
            while awaiting_ack < self.max_response_queue
                && let Some(chunk) = self.transmit_queue.pop()
            {
                let last = self.transmit_queue.is_empty() && sequencer.eof();
                in_flight.push(self.send_future(UploadChunkRequest {
                    file_id: d.file_id().to_string(),
                    chunk_num: chunk.index,
                    data: chunk.data,
                    last,
                }));
                awaiting_ack += 1;
                progressed = true;
            }

            if eof
                && !reading
                && awaiting_ack == 0
                && self.read_queue.is_empty()
                && self.transmit_queue.is_empty()
            {
                return Ok(summary(&d, start, chunks_sent, bytes_sent));
            }

            if in_flight.is_empty() {
                if !progressed {
                    return Err(TransferError::Internal("upload pipeline stalled".into()));
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
                UploadEvent::Read(result) => {
                    reading = false;
                    self.accept_read(next_read, result?)?;
                    eof = next_read == last_index;
                    next_read += 1;
                }
                UploadEvent::Sent { index, len, result } => {
                    result?;
                    awaiting_ack -= 1;
                    chunks_sent += 1;
                    bytes_sent += len as u64;
                    debug!(file_id = %d.file_id(), chunk = index, bytes = len, "chunk acknowledged");
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

impl Pipeline for UploadPipeline {
    fn run<'a>(
        &'a mut self,
        process: &'a mut TransferProcess,
    ) -> BoxFuture<'a, Result<TransferSummary, TransferError>> {
        Box::pin(self.upload(process))
    }

    fn stream(&self) -> &SharedStream {
        &self.stream
    }
}
