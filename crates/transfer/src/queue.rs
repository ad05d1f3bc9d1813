//! Byte-bounded pipeline queues and the caller-owned transfer queue.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::types::Chunk;

/// Ordered chunks waiting for the next pipeline stage.
///
/// A chunk is admitted when the queue is empty or when it fits under the
/// ceiling, so the buffered volume never exceeds the ceiling for chunks no
/// larger than it.
#[derive(Debug)]
pub struct PipelineQueue {
    chunks: VecDeque<Chunk>,
    bytes: usize,
    ceiling: usize,
    peak: usize,
}

impl PipelineQueue {
    pub fn new(ceiling: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            ceiling,
            peak: 0,
        }
    }

    /// Returns `true` when a chunk of `len` bytes may be pushed now.
    pub fn can_accept(&self, len: usize) -> bool {
        self.chunks.is_empty() || self.bytes + len <= self.ceiling
    }

    /// Appends a chunk. Indices must be strictly ascending.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), TransferError> {
        if let Some(back) = self.chunks.back()
            && back.index >= chunk.index
        {
            return Err(TransferError::Internal(format!(
                "chunk {} queued after chunk {}",
                chunk.index, back.index
            )));
        }
        self.bytes += chunk.data.len();
        self.peak = self.peak.max(self.bytes);
        self.chunks.push_back(chunk);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.data.len();
        Some(chunk)
    }

    /// Length of the chunk [`pop`](Self::pop) would return.
    pub fn front_len(&self) -> Option<usize> {
        self.chunks.front().map(|c| c.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes currently buffered.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Highest buffered volume seen so far.
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }
}

/// Limits how many transfers run at once.
///
/// Constructed and owned by the caller; clones share the same slots.
#[derive(Debug, Clone)]
pub struct TransferQueue {
    slots: Arc<Semaphore>,
}

impl TransferQueue {
    /// Creates a queue running at most `max_active` transfers.
    pub fn new(max_active: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_active.max(1))),
        }
    }

    /// Slots not currently held by a running transfer.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a slot, giving up when `cancel` fires.
    pub(crate) async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, TransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map_err(|_| TransferError::Internal("transfer queue closed".into())),
        }
    }
}
