//! Shared lifecycle of upload and download transfers.
//!
//! Each transfer runs as one spawned task. The pipeline body returns when it
//! is done, fails or observes cancellation; whatever it returns goes through
//! [`TransferProcess::finish`], the single terminal path that closes the
//! local stream, disposes of the resume marker and settles the caller.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::ledger::{ResumeLedger, ResumeMarker};
use crate::progress::SpeedCalculator;
use crate::queue::TransferQueue;
use crate::remote::BoxFuture;
use crate::stream::LocalStream;
use crate::types::{TransferDirection, TransferEvent, TransferState, TransferSummary};

/// Local stream shared between a pipeline and its in-flight I/O futures.
pub(crate) type SharedStream = Arc<tokio::sync::Mutex<Box<dyn LocalStream>>>;

type Settlement = Result<TransferSummary, TransferError>;

/// Body of a transfer, driven by [`spawn`].
pub(crate) trait Pipeline: Send + 'static {
    /// Runs the stages until the transfer is complete.
    fn run<'a>(&'a mut self, process: &'a mut TransferProcess) -> BoxFuture<'a, Settlement>;

    /// Stream closed on the terminal path.
    fn stream(&self) -> &SharedStream;
}

/// Caller's side of a running transfer.
#[derive(Debug)]
pub struct TransferHandle {
    file_id: String,
    direction: TransferDirection,
    cancel: CancellationToken,
    state: watch::Receiver<TransferState>,
    result: oneshot::Receiver<Settlement>,
}

impl TransferHandle {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Requests cancellation. Idempotent; no effect once the transfer ended.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this transfer, for callers that outlive the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    /// Waits for the transfer to settle.
    pub async fn wait(self) -> Result<TransferSummary, TransferError> {
        self.result.await.unwrap_or_else(|_| {
            Err(TransferError::Internal(
                "transfer task ended without settling".into(),
            ))
        })
    }
}

/// State one transfer carries through its lifetime.
pub(crate) struct TransferProcess {
    file_id: String,
    direction: TransferDirection,
    cancel: CancellationToken,
    state: watch::Sender<TransferState>,
    events: Option<mpsc::Sender<TransferEvent>>,
    speed: SpeedCalculator,
    processed: u64,
    total: u64,
    marker: Option<(ResumeLedger, ResumeMarker)>,
    /// Taken on settlement; `None` means the transfer has finished.
    settle: Option<oneshot::Sender<Settlement>>,
}

impl TransferProcess {
    pub(crate) fn new(
        file_id: &str,
        direction: TransferDirection,
        events: Option<mpsc::Sender<TransferEvent>>,
        marker: Option<(ResumeLedger, ResumeMarker)>,
    ) -> (Self, TransferHandle) {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TransferState::Created);
        let (settle_tx, settle_rx) = oneshot::channel();
        let process = Self {
            file_id: file_id.to_string(),
            direction,
            cancel: cancel.clone(),
            state: state_tx,
            events,
            speed: SpeedCalculator::default(),
            processed: 0,
            total: 0,
            marker,
            settle: Some(settle_tx),
        };
        let handle = TransferHandle {
            file_id: file_id.to_string(),
            direction,
            cancel,
            state: state_rx,
            result: settle_rx,
        };
        (process, handle)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails with [`TransferError::Cancelled`] once cancellation was requested.
    pub(crate) fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.settle.is_none()
    }

    /// Sets progress counters without emitting a sample, e.g. bytes already
    /// done before a resume.
    pub(crate) fn set_progress(&mut self, processed: u64, total: u64) {
        self.processed = processed;
        self.total = total;
        self.emit_progress();
    }

    /// Advances progress by `bytes` just moved.
    pub(crate) fn add_progress(&mut self, bytes: u64) {
        self.processed += bytes;
        self.speed.add_sample(bytes);
        self.emit_progress();
    }

    fn emit_progress(&self) {
        self.emit(TransferEvent::Progress {
            file_id: self.file_id.clone(),
            direction: self.direction,
            processed: self.processed,
            total: self.total,
            bytes_per_second: self.speed.bytes_per_second(),
        });
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events
            && let Err(e) = tx.try_send(event)
        {
            debug!(file_id = %self.file_id, error = %e, "dropping transfer event");
        }
    }

    fn set_state(&self, state: TransferState) {
        self.state.send_replace(state);
        self.emit(TransferEvent::StateChanged {
            file_id: self.file_id.clone(),
            direction: self.direction,
            state,
        });
    }

    /// Marks the transfer running, records its resume marker and runs the
    /// pipeline.
    async fn run<P: Pipeline>(&mut self, pipeline: &mut P) -> Settlement {
        self.set_state(TransferState::Running);
        info!(file_id = %self.file_id, direction = ?self.direction, "transfer started");
        if let Some((ledger, marker)) = &self.marker {
            ledger.save(self.direction, marker).await?;
        }
        self.check_cancelled()?;
        pipeline.run(self).await
    }

    /// Terminal path. Runs at most once; later calls are ignored.
    pub(crate) async fn finish(&mut self, result: Settlement, stream: &SharedStream) {
        if self.is_finished() {
            return;
        }

        let closed = stream.lock().await.close().await;
        let result = match (result, closed) {
            (result, Ok(())) => result,
            (Ok(summary), Err(e)) => {
                warn!(file_id = %self.file_id, error = %e, "failed to close local stream after success");
                Ok(summary)
            }
            (Err(original), Err(e)) => {
                debug!(file_id = %self.file_id, error = %e, "failed to close local stream after failure");
                Err(original)
            }
        };

        let dispose = match &result {
            Ok(_) => true,
            Err(e) => e.is_cancelled(),
        };
        if dispose && let Some((ledger, marker)) = &self.marker {
            if let Err(e) = ledger.clear(self.direction, &marker.file_id).await {
                warn!(file_id = %self.file_id, error = %e, "failed to clear resume marker");
            }
        }

        let state = match &result {
            Ok(summary) => {
                info!(
                    file_id = %self.file_id,
                    direction = ?self.direction,
                    chunks = summary.chunks_transferred,
                    bytes = summary.bytes_transferred,
                    "transfer complete"
                );
                TransferState::Succeeded
            }
            Err(e) if e.is_cancelled() => {
                info!(file_id = %self.file_id, direction = ?self.direction, "transfer cancelled");
                TransferState::Cancelled
            }
            Err(e) => {
                error!(
                    file_id = %self.file_id,
                    direction = ?self.direction,
                    category = %e.category(),
                    error = %e,
                    "transfer failed"
                );
                TransferState::Failed
            }
        };
        self.set_state(state);

        if let Some(tx) = self.settle.take() {
            let _ = tx.send(result);
        }
    }
}

/// Spawns a transfer on the tokio runtime, optionally waiting for a slot in
/// `queue` first. Waiting for the slot is cancellable.
pub(crate) fn spawn<P: Pipeline>(
    mut process: TransferProcess,
    mut pipeline: P,
    queue: Option<TransferQueue>,
) {
    tokio::spawn(async move {
        let _permit = match &queue {
            Some(q) => match q.acquire(process.cancel_token()).await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    process.finish(Err(e), pipeline.stream()).await;
                    return;
                }
            },
            None => None,
        };
        let result = process.run(&mut pipeline).await;
        process.finish(result, pipeline.stream()).await;
    });
}
