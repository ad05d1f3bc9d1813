//! Chunk size selection.
//!
//! A file's chunk size is picked once, when its upload starts, and stays fixed
//! for the file's lifetime. Resumed uploads reuse the size recorded in their
//! descriptor, never a fresh lookup.

use crate::TransferError;

const KIB: usize = 1024;

/// One row of the chunk size table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizeRow {
    /// Largest file size (inclusive) this row applies to; `None` is unbounded.
    pub max_file_size: Option<u64>,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
}

const fn row(max_file_size: Option<u64>, chunk_size: usize) -> ChunkSizeRow {
    ChunkSizeRow {
        max_file_size,
        chunk_size,
    }
}

/// Process-wide chunk size table, ascending, terminated by an unbounded row.
pub const CHUNK_SIZE_TABLE: &[ChunkSizeRow] = &[
    row(Some(192 * 1024 * 54), 192 * KIB),
    row(Some(256 * 1024 * 100), 256 * KIB),
    row(Some(384 * 1024 * 134), 384 * KIB),
    row(Some(512 * 1024 * 300), 512 * KIB),
    row(None, 768 * KIB),
];

/// Returns the chunk size for a file of `file_size` bytes.
pub fn chunk_size_for(file_size: u64) -> Result<usize, TransferError> {
    chunk_size_from_table(CHUNK_SIZE_TABLE, file_size)
}

/// Looks `file_size` up in an arbitrary table.
///
/// The table must be non-empty, strictly ascending by `max_file_size`, have
/// positive chunk sizes and end with exactly one unbounded row.
pub fn chunk_size_from_table(table: &[ChunkSizeRow], file_size: u64) -> Result<usize, TransferError> {
    validate_table(table)?;
    let row = table
        .iter()
        .find(|r| r.max_file_size.is_none_or(|max| max >= file_size))
        .ok_or_else(|| TransferError::Internal("chunk size table has no unbounded row".into()))?;
    Ok(row.chunk_size)
}

fn validate_table(table: &[ChunkSizeRow]) -> Result<(), TransferError> {
    let Some((last, bounded)) = table.split_last() else {
        return Err(TransferError::Internal("chunk size table is empty".into()));
    };
    if last.max_file_size.is_some() {
        return Err(TransferError::Internal(
            "chunk size table must end with an unbounded row".into(),
        ));
    }
    let mut previous: Option<u64> = None;
    for r in bounded {
        let Some(max) = r.max_file_size else {
            return Err(TransferError::Internal(
                "unbounded row before the end of the chunk size table".into(),
            ));
        };
        if previous.is_some_and(|p| p >= max) {
            return Err(TransferError::Internal(
                "chunk size table is not ascending".into(),
            ));
        }
        previous = Some(max);
    }
    if table.iter().any(|r| r.chunk_size == 0) {
        return Err(TransferError::Internal("zero chunk size in table".into()));
    }
    Ok(())
}
