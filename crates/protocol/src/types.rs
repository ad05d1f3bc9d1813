use serde::{Deserialize, Serialize};

/// Server-side status of a file's chunk storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "failed")]
    Failed,
}

impl FileStatus {
    /// Returns `true` once the server holds every chunk.
    pub fn is_ready(self) -> bool {
        self == FileStatus::Ready
    }
}
