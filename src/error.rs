//! Error types for the proxy

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Backend error 0x{code:04x}: {message}")]
    Backend { code: i32, message: String },

    #[error("Backend requested authentication but none is configured")]
    AuthRequired,

    #[error("Unexpected response from backend")]
    UnexpectedResponse,

    #[error("Session has no established connections")]
    NotConnected,

    #[error("No backend host available for request")]
    NoHostAvailable,

    #[error("No contact points configured")]
    NoContactPoints,

    #[error("Session for keyspace '{keyspace}' unavailable: {reason}")]
    SessionUnavailable { keyspace: String, reason: String },
}
