use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Remote procedure identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Stores one encrypted chunk of a file.
    #[serde(rename = "file.chunk.upload")]
    ChunkUpload,
    /// Returns the ranged-fetch endpoint for a file.
    #[serde(rename = "file.url.get")]
    UrlGet,
    /// Returns how much of a file the server already holds.
    #[serde(rename = "file.state.get")]
    StateGet,
}

impl Method {
    /// Every procedure, in declaration order.
    pub const ALL: [Method; 3] = [Method::ChunkUpload, Method::UrlGet, Method::StateGet];

    /// Returns the dotted procedure name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::ChunkUpload => "file.chunk.upload",
            Method::UrlGet => "file.url.get",
            Method::StateGet => "file.state.get",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod(s.to_string()))
    }
}
