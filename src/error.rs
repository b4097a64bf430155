//! Error taxonomy for the envelope protocol.
//!
//! Every crypto/protocol error is recovered locally at the dispatcher
//! boundary and mapped to a well-formed error envelope; only [`RpcError::Transport`]
//! bypasses envelope construction and is surfaced directly to the caller.

use thiserror::Error;

/// Integer status codes carried on the wire in the `c` field.
pub mod code {
    pub const OK: i32 = 200;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const NOT_FOUND: i32 = 5;
    pub const INTERNAL: i32 = 13;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("malformed envelope: {0}")]
    Structural(String),

    #[error("request time invalid")]
    TemporalWindow,

    #[error("request ecdsa not found")]
    UnknownPrincipal,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("replay attack detected")]
    Replay,

    #[error("route not found: {0}")]
    RouteMissing(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Map an error to the `(code, message)` pair placed on the wire,
    /// generalizing the teacher's `classify_error`.
    pub fn rpc_code(&self) -> (i32, String) {
        use code::*;
        match self {
            RpcError::Structural(msg) => (INVALID_ARGUMENT, msg.clone()),
            RpcError::TemporalWindow => (INVALID_ARGUMENT, "request time invalid".into()),
            RpcError::UnknownPrincipal => (INVALID_ARGUMENT, "request ecdsa not found".into()),
            RpcError::SignatureInvalid => (INVALID_ARGUMENT, "signature invalid".into()),
            RpcError::Replay => (INVALID_ARGUMENT, "replay attack detected".into()),
            RpcError::RouteMissing(route) => (NOT_FOUND, format!("route not found: {route}")),
            RpcError::CryptoFailure(msg) => (INTERNAL, msg.clone()),
            RpcError::HandlerError(msg) => (INTERNAL, msg.clone()),
            RpcError::Transport(msg) => (INTERNAL, msg.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
