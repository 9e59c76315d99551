//! Error types for bridge operations.
//!
//! Every fallible call in this crate returns [`BridgeError`]. The variants carry
//! enough structured context to tell a lifetime bug (a handle used after it was
//! disposed) apart from an ordinary runtime failure reported by the native side.
//!
//! ## Error Categories
//!
//! - **Lifetime Errors**: use of a disposed handle, empty packets
//! - **Capacity Errors**: a bounded instance or callback table is full
//! - **Native Errors**: non-OK status objects and failed native calls
//! - **Format Errors**: payload or pixel layout mismatches
//! - **Configuration Errors**: invalid YAML or out-of-range settings
//! - **Resource Errors**: model assets that cannot be prepared or read
//!
//! ## Recovery
//!
//! ```rust
//! use mpbridge::BridgeError;
//!
//! let error = BridgeError::stream_closed("output_video");
//! if !error.is_recoverable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::native::ReturnCode;
use crate::status::StatusCode;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("{type_name} has already been disposed")]
    UseAfterFree { type_name: &'static str },

    #[error("packet is empty")]
    EmptyPacket,

    #[error("{table} is full (max size {max_size})")]
    CapacityExceeded { table: &'static str, max_size: usize },

    #[error("output stream '{stream}' is closed")]
    StreamClosed { stream: String },

    #[error("native status {code:?}: {message}")]
    BadStatus { code: StatusCode, message: String },

    #[error("format mismatch: expected {expected}, found {actual}")]
    FormatMismatch { expected: String, actual: String },

    #[error("native call {operation} failed with {code:?}")]
    NativeCall { operation: &'static str, code: ReturnCode },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("configuration error: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("resource '{name}' is unavailable")]
    Resource {
        name: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Returns whether the failed operation can reasonably be attempted again.
    ///
    /// Lifetime and format errors are programming errors and never recover.
    pub fn is_recoverable(&self) -> bool {
        match self {
            BridgeError::UseAfterFree { .. } => false,
            BridgeError::EmptyPacket => true,
            BridgeError::CapacityExceeded { .. } => true,
            BridgeError::StreamClosed { .. } => false,
            BridgeError::BadStatus { code, .. } => matches!(
                code,
                StatusCode::Unavailable
                    | StatusCode::DeadlineExceeded
                    | StatusCode::ResourceExhausted
                    | StatusCode::Aborted
            ),
            BridgeError::FormatMismatch { .. } => false,
            BridgeError::NativeCall { code, .. } => *code == ReturnCode::Aborted,
            BridgeError::InvalidArgument { .. } => false,
            BridgeError::Config { .. } => false,
            BridgeError::Resource { .. } => true,
            BridgeError::File { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::UseAfterFree { .. } => vec![
                "Do not use a handle after calling dispose()",
                "Check whether the value was moved into the graph or consumed",
            ],
            BridgeError::EmptyPacket => vec![
                "Check is_empty() before reading a packet",
                "Enable timestamp bounds only if empty packets are expected",
            ],
            BridgeError::CapacityExceeded { .. } => vec![
                "Dispose unused output streams or texture frames",
                "Raise the table size in BridgeConfig",
            ],
            BridgeError::StreamClosed { .. } => vec![
                "Create a new OutputStream after restarting the graph",
                "Check the graph status with wait_until_done()",
            ],
            BridgeError::BadStatus { .. } => vec![
                "Inspect the status message for the failing calculator",
                "Verify the graph configuration and input stream names",
            ],
            BridgeError::FormatMismatch { .. } => vec![
                "Read the payload with the type it was created with",
                "Check the image format byte depth before copying pixels",
            ],
            BridgeError::NativeCall { .. } => vec![
                "Check the log output of the native runtime",
                "Verify that pointers passed to the native side are still alive",
            ],
            BridgeError::InvalidArgument { .. } => vec!["Check the documented argument ranges"],
            BridgeError::Config { .. } => vec![
                "Validate the YAML against the documented schema",
                "Check that capacities are within the allowed range",
            ],
            BridgeError::Resource { .. } => vec![
                "Call prepare_asset() before starting the graph",
                "Check that the resource manager is installed",
            ],
            BridgeError::File { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions",
            ],
        }
    }

    /// Helper constructor for use-after-dispose errors.
    pub fn use_after_free(type_name: &'static str) -> Self {
        BridgeError::UseAfterFree { type_name }
    }

    /// Helper constructor for full tables.
    pub fn capacity_exceeded(table: &'static str, max_size: usize) -> Self {
        BridgeError::CapacityExceeded { table, max_size }
    }

    /// Helper constructor for closed output streams.
    pub fn stream_closed(stream: impl Into<String>) -> Self {
        BridgeError::StreamClosed { stream: stream.into() }
    }

    /// Helper constructor for non-OK status objects.
    pub fn bad_status(code: StatusCode, message: impl Into<String>) -> Self {
        BridgeError::BadStatus { code, message: message.into() }
    }

    /// Helper constructor for format mismatches.
    pub fn format_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BridgeError::FormatMismatch { expected: expected.into(), actual: actual.into() }
    }

    /// Helper constructor for failed native calls.
    pub fn native_call(operation: &'static str, code: ReturnCode) -> Self {
        BridgeError::NativeCall { operation, code }
    }

    /// Helper constructor for rejected arguments.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        BridgeError::InvalidArgument { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Config { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for missing resources.
    pub fn resource(name: impl Into<String>) -> Self {
        BridgeError::Resource { name: name.into(), source: None }
    }

    /// Helper constructor for resources that failed to load.
    pub fn resource_with_source(
        name: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Resource { name: name.into(), source: Some(source) }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        BridgeError::File { path, source }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_yaml_ng::Error> for BridgeError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BridgeError::config_with_source("invalid YAML", Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_errors_are_not_recoverable() {
        assert!(!BridgeError::use_after_free("Packet").is_recoverable());
        assert!(!BridgeError::stream_closed("out").is_recoverable());
        assert!(!BridgeError::format_mismatch("u8", "f32").is_recoverable());
    }

    #[test]
    fn transient_status_codes_are_recoverable() {
        assert!(BridgeError::bad_status(StatusCode::Unavailable, "busy").is_recoverable());
        assert!(!BridgeError::bad_status(StatusCode::InvalidArgument, "bad").is_recoverable());
        assert!(BridgeError::native_call("wait", ReturnCode::Aborted).is_recoverable());
        assert!(!BridgeError::native_call("wait", ReturnCode::StandardError).is_recoverable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            BridgeError::use_after_free("Packet"),
            BridgeError::EmptyPacket,
            BridgeError::capacity_exceeded("OutputStream table", 20),
            BridgeError::stream_closed("out"),
            BridgeError::bad_status(StatusCode::Internal, "boom"),
            BridgeError::format_mismatch("a", "b"),
            BridgeError::native_call("op", ReturnCode::UnknownError),
            BridgeError::invalid_argument("negative"),
            BridgeError::config("bad capacity"),
            BridgeError::resource("model.tflite"),
            BridgeError::file_error(PathBuf::from("/tmp/x"), std::io::Error::other("gone")),
        ];
        for error in errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error:?}");
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn io_error_converts_to_file_error() {
        let err: BridgeError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        match err {
            BridgeError::File { source, .. } => assert_eq!(source.to_string(), "missing"),
            other => panic!("expected File error, got {other:?}"),
        }
    }

    #[test]
    fn yaml_error_converts_to_config_error() {
        let err = serde_yaml_ng::from_str::<Vec<u32>>("{ not: [a list").unwrap_err();
        let converted: BridgeError = err.into();
        assert!(matches!(converted, BridgeError::Config { source: Some(_), .. }));
        assert!(std::error::Error::source(&converted).is_some());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_carry_their_context(
                stream in "\\w+",
                reason in ".*",
                max_size in 1usize..1000,
                message in ".*",
            ) {
                let closed = BridgeError::stream_closed(stream.clone()).to_string();
                prop_assert!(closed.contains(&stream));

                let invalid = BridgeError::invalid_argument(reason.clone()).to_string();
                prop_assert!(invalid.contains(&reason));

                let full = BridgeError::capacity_exceeded("table", max_size).to_string();
                prop_assert!(full.contains(&max_size.to_string()));

                let status = BridgeError::bad_status(StatusCode::NotFound, message.clone()).to_string();
                prop_assert!(status.contains(&message));
            }

            #[test]
            fn config_source_chain_is_preserved(base in ".*") {
                let err = BridgeError::config_with_source(
                    "outer",
                    Box::new(std::io::Error::other(base.clone())),
                );
                let source = std::error::Error::source(&err).map(|s| s.to_string());
                prop_assert_eq!(source, Some(base));
            }
        }
    }
}
