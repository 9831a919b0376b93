//! WireHub device client core.
//!
//! This crate implements:
//! - The session state machine ordering all hub operations against the
//!   connection lifecycle
//! - The controller facade with argument validation and lifecycle events
//! - Subscription management for cloud-to-device messages and direct methods
//! - Credential rotation with automatic renewal for shared-key devices
//! - Transport and receiver ports with static capability flags
//! - Test harness with a scripted in-memory transport

#![forbid(unsafe_code)]

// Core state machine
pub mod session;

// Services
pub mod client;
pub mod subscription;
pub mod transport;

// Peers
pub mod blob;
pub mod twin;

// Supporting modules
pub mod errors;
pub mod harness;
pub mod types;

pub use client::HubClient;
pub use errors::{ClientError, TransportError};
pub use session::{ClientEvent, SessionState, SAS_RENEWAL_INTERVAL};
pub use subscription::{MessageSubscription, MethodHandler};
pub use transport::{Transport, TransportCapabilities};
