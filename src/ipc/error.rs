use std::path::PathBuf;
use thiserror::Error;

/// A single malformed or unexpected message. The offending line is answered
/// with an error response; the connection survives.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Parse(String),

    #[error("could not encode message: {0}")]
    Encode(String),

    #[error("unexpected message type on this connection")]
    UnexpectedType,
}

/// Connection-level failures. These end the affected connection; the server
/// keeps running.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to control socket `{path}`: {reason}")]
    Connect { path: PathBuf, reason: String },

    #[error("control socket `{path}` did not appear in time")]
    SocketWait { path: PathBuf },

    #[error("could not set up control socket `{path}`: {source}")]
    Listen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("request `{0}` received no response in time")]
    RequestTimeout(String),

    #[error("connection closed by peer")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("peer uid {peer} does not match server uid {server}")]
    UidMismatch { peer: u32, server: u32 },
}
