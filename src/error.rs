use uuid::Uuid;

use crate::wg::config::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address pool {0} exhausted")]
    AllocationExhausted(String),

    #[error("wireguard unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("wg cmd fail ({exit_code:?}): {stderr}")]
    DaemonCommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("peer {0} not found")]
    PeerNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Failures worth a single retry. Setup errors (`DaemonUnavailable`)
    /// and everything else are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DaemonCommandFailed { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
