//! Error handling in [`metastore_client`][crate].
use thiserror::Error;

/// Possible errors when talking to the metastore
#[derive(Error, Debug)]
pub enum Error {
    /// The transport cannot be reached; surfaced after retries are exhausted
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend returned an error the client refuses to retry
    #[error("backend error: {0}")]
    Unknown(String),

    /// The per-call deadline was reached
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// The health monitor has declared the backend unhealthy; the request was
    /// failed without reaching it
    #[error("fallbreak: {0}")]
    FallBreak(String),

    /// A peer reply failed to deserialize
    #[error("failed to parse reply: {0}")]
    Parse(#[from] prost::DecodeError),

    /// Caller-side malformed input
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A lease keep-alive came back with ttl == 0
    #[error("lease {0} expired")]
    LeaseExpired(i64),

    /// The owning strategy was shut down while the call was in flight
    #[error("strategy shut down: {0}")]
    Shutdown(String),

    /// Errors from assembling wire messages
    #[error(transparent)]
    Core(#[from] metastore_core::Error),
}

impl Error {
    /// Map a transport status into the retry taxonomy. `Unknown` and
    /// `DeadlineExceeded` short-circuit the retry envelope; everything else
    /// counts as the transport being unreachable.
    pub(crate) fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unknown => Error::Unknown(status.message().to_string()),
            tonic::Code::DeadlineExceeded => Error::Timeout(status.message().to_string()),
            _ => Error::Unavailable(format!("{}: {}", status.code(), status.message())),
        }
    }

    /// Whether the retry envelope should stop retrying on this error.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Error::Unknown(_) | Error::Timeout(_) | Error::FallBreak(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
