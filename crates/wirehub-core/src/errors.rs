//! Error types for the WireHub device client.

use thiserror::Error;
use wirehub_auth::AuthError;

/// Errors surfaced by transport operations.
///
/// Causes are kept as strings so a single failure can be cloned into every
/// queued caller waiting on the same transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport does not implement the requested operation
    #[error("transport does not support {0}")]
    Unsupported(&'static str),

    /// Establishing the connection failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The transport reported a spontaneous disconnect
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Unified error type for client operations.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    /// A required argument was absent or empty
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// The bound transport lacks the capability for this operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A method handler is already registered under this name
    #[error("method handler already registered for '{0}'")]
    DuplicateMethod(String),

    /// Credential rotation is not possible under x509 authentication
    #[error("credential rotation is incompatible with x509 authentication")]
    IncompatibleAuth,

    /// Credential parsing or minting failed
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// The transport reported a failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The session task has shut down and can no longer accept commands
    #[error("client closed")]
    Closed,
}
