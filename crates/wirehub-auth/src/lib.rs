#![forbid(unsafe_code)]

//! Credential handling for WireHub device clients: connection-string parsing
//! and shared-access-signature minting.

pub mod connection_string;
pub mod token;

pub use connection_string::{AuthMode, ConnectionString};
pub use token::{SharedAccessSignature, SAS_TOKEN_LIFETIME_SECS};

use thiserror::Error;

/// Errors from credential parsing and signature minting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A required connection-string or signature field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field value could not be parsed
    #[error("malformed field {field}: {reason}")]
    Malformed {
        field: &'static str,
        reason: String,
    },

    /// The shared access key is not valid base64
    #[error("invalid shared access key encoding")]
    InvalidKey,
}
