//! Error taxonomy for the scrape-and-persist pipeline.
//!
//! Remote failures are routine and recoverable inside the scrape loop,
//! storage failures are fatal at startup, and shape errors on single
//! records are skipped by the recorder.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, timeout or undecodable body from the remote source.
    #[error("remote fetch failed: {0}")]
    RemoteFetch(#[from] reqwest::Error),

    /// The remote source answered with a non-2xx status.
    #[error("remote fetch failed: HTTP {status} from {url}")]
    RemoteStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A snapshot or record does not have the fields we expect.
    #[error("data shape error: {0}")]
    DataShape(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// True for failures the scrape loop treats as an ordinary bad cycle.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteFetch(_) | Error::RemoteStatus { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
