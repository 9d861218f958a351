use resclient_core::{codes, ResError, Rid};
use thiserror::Error;

/// Errors produced by [`crate::ResClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error object. Server-originated codes
    /// are passed through verbatim, including `message` and `data`.
    #[error(transparent)]
    Res(#[from] ResError),

    /// (De)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection closed before the operation settled.
    #[error("connection closed unexpectedly")]
    UnexpectedClose,

    /// Unexpected internal channel closure. This is likely a bug. Please
    /// report via github.
    #[error("unexpected internal channel closure")]
    DeadChannel,

    /// An argument to the public API was rejected before dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The RID has no cache entry.
    #[error("resource not found: {0}")]
    NotFound(Rid),

    /// The server violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Access the underlying error object, if the error is a server
    /// error response.
    pub fn as_res_error(&self) -> Option<&ResError> {
        match self {
            ClientError::Res(err) => Some(err),
            _ => None,
        }
    }

    /// True if the error is a server error response with the given code.
    pub fn is_code(&self, code: &str) -> bool {
        self.as_res_error().map(|e| e.is(code)).unwrap_or(false)
    }

    /// The error in wire shape, for event emission and call rejection.
    pub(crate) fn to_res_error(&self) -> ResError {
        match self {
            ClientError::Res(err) => err.clone(),
            ClientError::NotFound(rid) => ResError::not_found(rid),
            ClientError::InvalidArgument(msg) => ResError::invalid_params(msg.clone()),
            ClientError::UnexpectedClose | ClientError::Transport(_) | ClientError::DeadChannel => {
                ResError::connection_error(self)
            }
            other => ResError::new(codes::UNKNOWN_ERROR, other.to_string()),
        }
    }
}
