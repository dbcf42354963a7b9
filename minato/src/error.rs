//! Error types for the minato runtime.
//!
//! Every fallible core operation returns [`Result`]. Errors carry a stable
//! [`ErrorCode`] so callers can branch on the kind of failure without parsing
//! messages, plus free-form metadata identifying the offending entity.
//! Errors flow as values across component boundaries; nothing in the runtime
//! panics on expected failure paths.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification used across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Bad input or schema violation.
    Validation,
    /// Missing state, manifest, or blob.
    NotFound,
    /// Invalid transition, approval mismatch, or circular manifest graph.
    BadRequest,
    /// Run is already executing under another holder.
    Conflict,
    /// Active-execution budget exceeded.
    Timeout,
    /// Execution was cancelled cooperatively.
    Cancelled,
    /// Tool exceptions, provider failures, cache or storage IO.
    Internal,
}

impl ErrorCode {
    /// Returns the string representation of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type for runtime operations.
///
/// Combines a stable [`ErrorCode`], a human-readable message, and optional
/// metadata identifying the offending entity (manifest id, run id, tool
/// name). An underlying cause is preserved for logging but never relied on
/// for control flow.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    metadata: BTreeMap<String, Value>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create an error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: BTreeMap::new(),
            source: None,
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Create a bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attach a metadata entry identifying the offending entity.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the attached metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Check whether this error carries the given code.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Serializable descriptor for persistence and run results.
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code,
            message: self.message.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("JSON error: {err}")).with_source(err)
    }
}

/// Serializable error descriptor surfaced on terminal run results and in
/// persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Metadata identifying the offending entity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ErrorDetail {
    /// Create a descriptor with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }
}

impl From<&Error> for ErrorDetail {
    fn from(err: &Error) -> Self {
        err.detail()
    }
}

impl From<Error> for ErrorDetail {
    fn from(err: Error) -> Self {
        err.detail()
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod error_code {
        use super::*;

        #[test]
        fn as_str_is_stable() {
            assert_eq!(ErrorCode::Validation.as_str(), "validation");
            assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
            assert_eq!(ErrorCode::BadRequest.as_str(), "bad_request");
            assert_eq!(ErrorCode::Conflict.as_str(), "conflict");
            assert_eq!(ErrorCode::Timeout.as_str(), "timeout");
            assert_eq!(ErrorCode::Cancelled.as_str(), "cancelled");
            assert_eq!(ErrorCode::Internal.as_str(), "internal");
        }

        #[test]
        fn serde_roundtrip() {
            let json = serde_json::to_string(&ErrorCode::BadRequest).unwrap();
            assert_eq!(json, r#""bad_request""#);
            let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, ErrorCode::BadRequest);
        }
    }

    mod error {
        use super::*;

        #[test]
        fn constructors_set_code() {
            assert_eq!(Error::validation("x").code(), ErrorCode::Validation);
            assert_eq!(Error::not_found("x").code(), ErrorCode::NotFound);
            assert_eq!(Error::bad_request("x").code(), ErrorCode::BadRequest);
            assert_eq!(Error::conflict("x").code(), ErrorCode::Conflict);
            assert_eq!(Error::timeout("x").code(), ErrorCode::Timeout);
            assert_eq!(Error::cancelled("x").code(), ErrorCode::Cancelled);
            assert_eq!(Error::internal("x").code(), ErrorCode::Internal);
        }

        #[test]
        fn display_includes_code_and_message() {
            let err = Error::bad_request("approval id not found");
            assert_eq!(err.to_string(), "bad_request: approval id not found");
        }

        #[test]
        fn metadata_is_attached() {
            let err = Error::bad_request("circular graph").with_metadata("manifest_id", "a");
            assert_eq!(
                err.metadata().get("manifest_id"),
                Some(&Value::String("a".to_owned()))
            );
        }

        #[test]
        fn source_is_preserved() {
            let json_err = serde_json::from_str::<Value>("not json").unwrap_err();
            let err = Error::internal("decode failed").with_source(json_err);
            assert!(std::error::Error::source(&err).is_some());
        }

        #[test]
        fn from_serde_json_maps_to_validation() {
            let json_err = serde_json::from_str::<Value>("{").unwrap_err();
            let err: Error = json_err.into();
            assert!(err.is(ErrorCode::Validation));
        }

        #[test]
        fn detail_roundtrips_through_serde() {
            let detail = Error::timeout("budget exceeded")
                .with_metadata("run_id", "r-1")
                .detail();
            let json = serde_json::to_string(&detail).unwrap();
            let parsed: ErrorDetail = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, detail);
        }
    }
}
