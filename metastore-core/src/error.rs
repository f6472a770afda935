//! Errors produced while building or decoding wire messages.
use thiserror::Error;

/// Possible errors when assembling requests or decoding replies
#[derive(Error, Debug)]
pub enum Error {
    /// A transaction builder was used out of order
    #[error("invalid transaction: {0}")]
    TxnOrder(&'static str),

    /// A caller supplied malformed input
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A wire message failed to deserialize
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}
