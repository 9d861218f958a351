use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Error codes originated by the client itself. Server-originated codes
/// are passed through verbatim and may use any string.
pub mod codes {
    /// The caller requested a disconnect.
    pub const DISCONNECT: &str = "system.disconnect";
    /// The transport failed to open, or failed while open.
    pub const CONNECTION_ERROR: &str = "system.connectionError";
    /// A request carried malformed parameters.
    pub const INVALID_PARAMS: &str = "system.invalidParams";
    /// The addressed resource does not exist.
    pub const NOT_FOUND: &str = "system.notFound";
    /// Catch-all for unclassified failures.
    pub const UNKNOWN_ERROR: &str = "system.unknownError";
}

/// A RES protocol error object.
///
/// Carried in error responses and in `errors` entries of resource
/// bundles. Server-originated errors are passed through verbatim,
/// including `message` and `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
pub struct ResError {
    /// Dot-separated error code, prefixed with its source domain.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResError {
    /// Creates an error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), data: None }
    }

    /// Attaches additional data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// A `system.disconnect` error.
    pub fn disconnect() -> Self {
        Self::new(codes::DISCONNECT, "Disconnect")
    }

    /// A `system.connectionError` error, wrapping the underlying cause.
    pub fn connection_error(cause: impl fmt::Display) -> Self {
        Self::new(codes::CONNECTION_ERROR, "Connection error")
            .with_data(Value::String(cause.to_string()))
    }

    /// A `system.notFound` error for the given resource.
    pub fn not_found(rid: impl fmt::Display) -> Self {
        Self::new(codes::NOT_FOUND, format!("Not found: {rid}"))
    }

    /// A `system.invalidParams` error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// True if the code matches.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for ResError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(code: {}, message: {}, data: {:?})", self.code, self.message, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deser_error_object() {
        let err: ResError = serde_json::from_str(
            r#"{"code":"system.notFound","message":"Not found","data":{"rid":"x"}}"#,
        )
        .unwrap();
        assert_eq!(err.code, "system.notFound");
        assert_eq!(err.message, "Not found");
        assert!(err.data.is_some());

        let err: ResError =
            serde_json::from_str(r#"{"code":"custom.oops","message":"oops"}"#).unwrap();
        assert!(err.data.is_none());
        assert!(err.is("custom.oops"));
    }

    #[test]
    fn ser_skips_absent_data() {
        let err = ResError::new(codes::DISCONNECT, "Disconnect");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"code":"system.disconnect","message":"Disconnect"}"#
        );
    }
}
