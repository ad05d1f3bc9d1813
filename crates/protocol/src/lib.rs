//! Wire payloads for the file chunk procedures consumed by the transfer engine.
//!
//! The transport that carries these payloads is not part of this crate; it
//! only pins their JSON shape so every client and server agrees on it.

pub mod constants;
pub mod messages;
pub mod types;

pub use constants::Method;
pub use messages::{
    FileStateRequest, FileStateResponse, FileUrlRequest, FileUrlResponse, UploadChunkRequest,
};
pub use types::FileStatus;

/// Errors produced while decoding protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}
