//! Error types for the wsapi engine and client

use thiserror::Error;
use wsapi_types::CorrelationId;

/// Which side of a definition a function belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Get,
    Set,
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Get => f.write_str("get"),
            FunctionKind::Set => f.write_str("set"),
        }
    }
}

/// Errors raised by the server cache engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested function is not part of the definition
    #[error("unknown {kind} function `{name}`")]
    UnknownFunction { kind: FunctionKind, name: String },

    /// A user function returned an error
    #[error("{kind} function `{name}` failed: {message}")]
    FunctionFailed {
        kind: FunctionKind,
        name: String,
        message: String,
    },
}

/// Errors raised by a transport when a message cannot be handed off
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other end of the channel is gone
    #[error("transport closed")]
    Closed,
}

/// Errors observed by a client multiplexer
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the call
    #[error("request {id} rejected: {message}")]
    Rejected { id: CorrelationId, message: String },

    /// The request was dropped before a reply arrived
    #[error("request {0} was abandoned before a reply arrived")]
    Abandoned(CorrelationId),

    /// Sending failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type using ClientError
pub type ClientResult<T> = std::result::Result<T, ClientError>;
