//! Transport and receiver ports.
//!
//! The controller consumes a pluggable transport through the [`Transport`]
//! trait. Every operation except [`Transport::get_receiver`] is optional: the
//! transport declares what it implements through [`TransportCapabilities`],
//! and the default trait bodies fail with an unsupported error so a partial
//! implementation stays honest even when called past its declared flags.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::types::{ClientConfig, Message, MethodRequest, MethodResponse, TransportOptions};

/// Static capability flags declared by a transport.
///
/// `get_receiver` is mandatory and therefore has no flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub connect: bool,
    pub disconnect: bool,
    pub send_event: bool,
    pub send_event_batch: bool,
    pub complete: bool,
    pub reject: bool,
    pub abandon: bool,
    pub update_credential: bool,
    pub set_options: bool,
    pub send_method_response: bool,
}

impl TransportCapabilities {
    /// Everything implemented.
    pub const fn all() -> Self {
        Self {
            connect: true,
            disconnect: true,
            send_event: true,
            send_event_batch: true,
            complete: true,
            reject: true,
            abandon: true,
            update_credential: true,
            set_options: true,
            send_method_response: true,
        }
    }

    /// Nothing optional implemented (receiver-only transport).
    pub const fn none() -> Self {
        Self {
            connect: false,
            disconnect: false,
            send_event: false,
            send_event_batch: false,
            complete: false,
            reject: false,
            abandon: false,
            update_credential: false,
            set_options: false,
            send_method_response: false,
        }
    }
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Events a connected transport pushes to the session.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The link dropped without a client-initiated disconnect
    Disconnected(TransportError),
}

/// Events delivered by a live receiver.
#[derive(Clone, Debug)]
pub enum ReceiverEvent {
    /// A cloud-to-device message arrived
    Message(Message),
    /// A direct method was invoked
    Method(MethodRequest),
    /// The receiver itself failed
    Error(TransportError),
}

/// A subscription sink obtained from a connected transport.
///
/// The id identifies the underlying transport-side receiver, so the session
/// can tell a genuinely new receiver from the one it already holds. Dropping
/// the struct releases everything the session attached.
#[derive(Debug)]
pub struct TransportReceiver {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<ReceiverEvent>,
}

/// Result of applying a fresh credential to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CredentialUpdate {
    /// The transport must be reconnected for the credential to take effect
    pub needs_reconnect: bool,
}

/// The transport port.
///
/// Methods take `&self`; implementations use interior mutability, which lets
/// the session run transport calls on spawned tasks while it keeps servicing
/// commands.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Capability flags for the optional operations.
    fn capabilities(&self) -> TransportCapabilities;

    /// Receive connection-string-derived configuration (host, device id,
    /// initial signature) before the first connect.
    fn configure(&self, config: &ClientConfig) {
        let _ = config;
    }

    /// Establish the link. `events` replaces any previously installed event
    /// channel; the transport reports spontaneous disconnects on it until the
    /// next `connect` or `disconnect`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let _ = events;
        Err(TransportError::Unsupported("connect"))
    }

    /// Drop the link.
    async fn disconnect(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("disconnect"))
    }

    /// Submit one telemetry message.
    async fn send_event(&self, msg: Message) -> Result<(), TransportError> {
        let _ = msg;
        Err(TransportError::Unsupported("send_event"))
    }

    /// Submit a batch of telemetry messages.
    async fn send_event_batch(&self, msgs: Vec<Message>) -> Result<(), TransportError> {
        let _ = msgs;
        Err(TransportError::Unsupported("send_event_batch"))
    }

    /// Settle an inbound message as completed.
    async fn complete(&self, msg: Message) -> Result<(), TransportError> {
        let _ = msg;
        Err(TransportError::Unsupported("complete"))
    }

    /// Settle an inbound message as rejected.
    async fn reject(&self, msg: Message) -> Result<(), TransportError> {
        let _ = msg;
        Err(TransportError::Unsupported("reject"))
    }

    /// Settle an inbound message as abandoned (redelivery requested).
    async fn abandon(&self, msg: Message) -> Result<(), TransportError> {
        let _ = msg;
        Err(TransportError::Unsupported("abandon"))
    }

    /// Apply a fresh shared access signature.
    async fn update_credential(&self, sas: &str) -> Result<CredentialUpdate, TransportError> {
        let _ = sas;
        Err(TransportError::Unsupported("update_credential"))
    }

    /// Forward tuning options.
    async fn set_options(&self, opts: TransportOptions) -> Result<(), TransportError> {
        let _ = opts;
        Err(TransportError::Unsupported("set_options"))
    }

    /// Obtain the subscription sink for inbound messages and method
    /// invocations. Mandatory.
    async fn get_receiver(&self) -> Result<TransportReceiver, TransportError>;

    /// Send the device's answer to a direct method invocation.
    async fn send_method_response(&self, resp: MethodResponse) -> Result<(), TransportError> {
        let _ = resp;
        Err(TransportError::Unsupported("send_method_response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReceiverOnly;

    #[async_trait]
    impl Transport for ReceiverOnly {
        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities::none()
        }

        async fn get_receiver(&self) -> Result<TransportReceiver, TransportError> {
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(TransportReceiver { id: 1, events })
        }
    }

    #[tokio::test]
    async fn default_bodies_report_unsupported() {
        let t = ReceiverOnly;
        assert_eq!(
            t.send_event(Message::new("x")).await.unwrap_err(),
            TransportError::Unsupported("send_event")
        );
        assert_eq!(
            t.complete(Message::new("x")).await.unwrap_err(),
            TransportError::Unsupported("complete")
        );
        assert_eq!(
            t.update_credential("sas").await.unwrap_err(),
            TransportError::Unsupported("update_credential")
        );
        assert!(t.get_receiver().await.is_ok());
    }

    #[test]
    fn capability_presets() {
        assert!(TransportCapabilities::all().complete);
        assert!(!TransportCapabilities::none().send_event);
        assert_eq!(
            TransportCapabilities::default(),
            TransportCapabilities::all()
        );
    }
}
