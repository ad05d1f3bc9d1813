//! Per-chunk nonce derivation.
//!
//! Every chunk of a file is sealed under the same content key, so each one
//! needs its own nonce. Nonces are derived from the file's base nonce and the
//! chunk index, never drawn at random: a resumed transfer rebuilds the
//! sequencer at an arbitrary index and must land on exactly the nonce a run
//! from zero would have used there.

use rand::RngCore;

use crate::{NONCE_LEN, TransferError};

/// Bytes of the nonce the chunk index is folded into.
const COUNTER_OFFSET: usize = NONCE_LEN - 8;

/// Starting nonce of a file, chosen once at upload time.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BaseNonce([u8; NONCE_LEN]);

impl BaseNonce {
    /// Wraps raw nonce bytes.
    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Draws a fresh base nonce from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for BaseNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BaseNonce(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Nonce of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkNonce([u8; NONCE_LEN]);

impl ChunkNonce {
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Derives the nonce of chunk `index`.
///
/// The little-endian index is XORed into the last eight bytes of the base, so
/// the mapping is a bijection per base and [`chunk_index_of`] inverts it.
pub fn nonce_at(base: &BaseNonce, index: u64) -> ChunkNonce {
    let mut bytes = base.0;
    for (b, i) in bytes[COUNTER_OFFSET..].iter_mut().zip(index.to_le_bytes()) {
        *b ^= i;
    }
    ChunkNonce(bytes)
}

/// Recovers the chunk index a nonce was derived for.
///
/// Returns `None` when the nonce does not share the base's prefix.
pub fn chunk_index_of(base: &BaseNonce, nonce: &ChunkNonce) -> Option<u64> {
    if base.0[..COUNTER_OFFSET] != nonce.0[..COUNTER_OFFSET] {
        return None;
    }
    let mut counter = [0u8; 8];
    for (c, (n, b)) in counter
        .iter_mut()
        .zip(nonce.0[COUNTER_OFFSET..].iter().zip(&base.0[COUNTER_OFFSET..]))
    {
        *c = n ^ b;
    }
    Some(u64::from_le_bytes(counter))
}

/// Hands out chunk nonces in index order over `[start, end]`.
#[derive(Debug, Clone)]
pub struct NonceSequencer {
    base: BaseNonce,
    next_index: u64,
    /// One past the last index; `end_exclusive == start` means empty.
    end_exclusive: u64,
}

impl NonceSequencer {
    /// Creates a sequencer over `start_index..=end_index_inclusive`.
    pub fn new(base: BaseNonce, start_index: u64, end_index_inclusive: u64) -> Self {
        Self {
            base,
            next_index: start_index,
            end_exclusive: end_index_inclusive.saturating_add(1),
        }
    }

    /// Creates a sequencer for a file of `chunk_count` chunks, starting at
    /// `start_index`. A file without chunks yields an exhausted sequencer.
    pub fn for_chunks(base: BaseNonce, start_index: u64, chunk_count: u64) -> Self {
        Self {
            base,
            next_index: start_index,
            end_exclusive: chunk_count,
        }
    }

    /// Returns the nonce for the current index and advances.
    pub fn next_nonce(&mut self) -> Result<ChunkNonce, TransferError> {
        if self.eof() {
            return Err(TransferError::Internal(format!(
                "nonce requested past end of sequence (index {})",
                self.next_index
            )));
        }
        let nonce = nonce_at(&self.base, self.next_index);
        self.next_index += 1;
        Ok(nonce)
    }

    /// Index the next call to [`next_nonce`](Self::next_nonce) will use.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// `true` once every index in range has been handed out.
    pub fn eof(&self) -> bool {
        self.next_index >= self.end_exclusive
    }
}
