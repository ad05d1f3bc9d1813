use serde::{Deserialize, Serialize};

use crate::types::FileStatus;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Stores one encrypted chunk (`file.chunk.upload`).
///
/// The `data` field is base64-encoded in JSON. The server treats the call as
/// idempotent per `chunk_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub file_id: String,
    pub chunk_num: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub last: bool,
}

/// Asks for the ranged-fetch endpoint of a file (`file.url.get`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUrlRequest {
    pub file_id: String,
}

/// Asks how far an upload got on the server (`file.state.get`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStateRequest {
    pub file_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Ranged-fetch endpoint for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUrlResponse {
    pub url: String,
}

/// Server-side view of a file's uploaded chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStateResponse {
    pub status: FileStatus,
    /// Highest chunk index stored so far; absent when nothing was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk_num: Option<u64>,
    #[serde(default)]
    pub chunks_upload_complete: bool,
}

impl FileStateResponse {
    /// Returns `true` when the server reports the upload as finished.
    pub fn is_complete(&self) -> bool {
        self.chunks_upload_complete || self.status.is_ready()
    }

    /// Index of the first chunk the server does not have yet.
    pub fn next_chunk_num(&self) -> u64 {
        self.last_chunk_num.map_or(0, |n| n + 1)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
