//! Value types exchanged between the client, the session and the transport.

use std::collections::HashMap;

use bytes::Bytes;

/// A telemetry or cloud-to-device message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Payload bytes
    pub body: Bytes,
    /// Optional application message id
    pub message_id: Option<String>,
    /// Optional correlation id for request/response pairing
    pub correlation_id: Option<String>,
    /// Optional MIME type of the body
    pub content_type: Option<String>,
    /// Application properties
    pub properties: HashMap<String, String>,
    /// Transport lock token, present on inbound messages and required for
    /// settlement
    pub lock_token: Option<String>,
}

impl Message {
    /// Create a message carrying the given body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Set the application message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A direct method invocation received from the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodRequest {
    /// Correlates the response with the invocation
    pub request_id: String,
    /// Method name as registered on the device
    pub name: String,
    /// Request payload
    pub body: Bytes,
}

/// The device's answer to a direct method invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodResponse {
    /// Must echo the request id of the invocation
    pub request_id: String,
    /// Numeric status, HTTP-style
    pub status: i32,
    /// Response payload
    pub body: Bytes,
}

impl MethodResponse {
    /// Build a response for `request`.
    pub fn reply(request: &MethodRequest, status: i32, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            body: body.into(),
        }
    }
}

/// Completion result of `open` and `close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectResult {
    Connected,
    Disconnected,
}

/// Completion result of send operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendResult {
    Enqueued,
}

/// Which settlement was applied to an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleResult {
    Completed,
    Rejected,
    Abandoned,
}

/// Completion result of credential rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SasUpdated {
    /// Whether the transport was reconnected as part of the rotation
    pub reconnected: bool,
}

/// Opaque transport tuning options, forwarded verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Free-form key/value options understood by the bound transport
    pub values: HashMap<String, String>,
}

impl TransportOptions {
    /// Set a single option value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// Configuration derived from a connection string and handed to the
/// transport before the first connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Hub host name
    pub host_name: String,
    /// Device id
    pub device_id: String,
    /// Hub name (first host label)
    pub hub_name: String,
    /// Initial shared access signature, when one could be minted or was
    /// supplied
    pub shared_access_signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder() {
        let msg = Message::new("hello")
            .with_message_id("m-1")
            .with_property("k", "v");
        assert_eq!(msg.body, Bytes::from("hello"));
        assert_eq!(msg.message_id.as_deref(), Some("m-1"));
        assert_eq!(msg.properties.get("k").map(String::as_str), Some("v"));
        assert!(msg.lock_token.is_none());
    }

    #[test]
    fn method_reply_echoes_request_id() {
        let req = MethodRequest {
            request_id: "42".into(),
            name: "reboot".into(),
            body: Bytes::new(),
        };
        let resp = MethodResponse::reply(&req, 200, "ok");
        assert_eq!(resp.request_id, "42");
        assert_eq!(resp.status, 200);
    }
}
