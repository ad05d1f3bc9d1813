//! Per-chunk authenticated encryption.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};

use crate::nonce::ChunkNonce;
use crate::types::ContentKey;
use crate::{CHUNK_OVERHEAD, NONCE_LEN, TransferError};

const TAG_SIZE: usize = 16;
/// Trailing nonce bytes echoed in front of each sealed chunk.
const NONCE_TAIL: usize = CHUNK_OVERHEAD - TAG_SIZE;

/// Seals and opens single chunks.
///
/// `overhead()` must be constant: stored chunk sizes and byte ranges are
/// computed from it.
pub trait ChunkCipher: Send + Sync {
    /// Bytes a sealed chunk adds to its plaintext.
    fn overhead(&self) -> usize;

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &ContentKey,
        nonce: &ChunkNonce,
    ) -> Result<Vec<u8>, TransferError>;

    fn decrypt(
        &self,
        sealed: &[u8],
        key: &ContentKey,
        nonce: &ChunkNonce,
    ) -> Result<Vec<u8>, TransferError>;
}

/// XChaCha20-Poly1305 with layout `nonce[8..24] ‖ ciphertext ‖ tag`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipher;

impl ChunkCipher for XChaChaCipher {
    fn overhead(&self) -> usize {
        CHUNK_OVERHEAD
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &ContentKey,
        nonce: &ChunkNonce,
    ) -> Result<Vec<u8>, TransferError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce_bytes = nonce.as_bytes();

        let mut sealed = Vec::with_capacity(plaintext.len() + CHUNK_OVERHEAD);
        sealed.extend_from_slice(&nonce_bytes[NONCE_LEN - NONCE_TAIL..]);
        sealed.extend_from_slice(plaintext);
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(nonce_bytes), &[], &mut sealed[NONCE_TAIL..])
            .map_err(|_| TransferError::Internal("chunk encryption failed".into()))?;
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    fn decrypt(
        &self,
        sealed: &[u8],
        key: &ContentKey,
        nonce: &ChunkNonce,
    ) -> Result<Vec<u8>, TransferError> {
        if sealed.len() < CHUNK_OVERHEAD {
            return Err(TransferError::Integrity(format!(
                "sealed chunk too short: {} bytes",
                sealed.len()
            )));
        }
        let nonce_bytes = nonce.as_bytes();
        let (tail, rest) = sealed.split_at(NONCE_TAIL);
        if tail != &nonce_bytes[NONCE_LEN - NONCE_TAIL..] {
            return Err(TransferError::Integrity("nonce mismatch".into()));
        }
        let (data, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let mut plaintext = data.to_vec();
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce_bytes),
                &[],
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| TransferError::Integrity("chunk authentication failed".into()))?;
        Ok(plaintext)
    }
}
