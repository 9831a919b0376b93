//! The device client facade.
//!
//! `HubClient` validates arguments, enforces capability flags and feeds
//! commands into the session task. All operational outcomes arrive through
//! per-call completions; lifecycle events are published on a broadcast
//! channel obtained from [`HubClient::events`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use wirehub_auth::{AuthMode, ConnectionString, SharedAccessSignature};

use crate::blob::{BlobUploader, NoBlobUploader};
use crate::errors::ClientError;
use crate::session::{
    ClientEvent, Command, InternalEvent, Session, SettleKind,
};
use crate::subscription::{MessageSubscription, MethodHandler};
use crate::transport::{Transport, TransportCapabilities};
use crate::twin::DeviceTwin;
use crate::types::{
    ClientConfig, ConnectResult, Message, SasUpdated, SendResult, SettleResult, TransportOptions,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Device-side client for a WireHub hub.
pub struct HubClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    caps: TransportCapabilities,
    auth_mode: Option<AuthMode>,
    blob: Arc<dyn BlobUploader>,
    events: broadcast::Sender<ClientEvent>,
    internal: broadcast::Sender<InternalEvent>,
    config: Option<ClientConfig>,
}

impl HubClient {
    /// Create a client over a pre-configured transport. No credentials are
    /// cached, so automatic renewal is off and rotation is caller-driven.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport, Arc::new(NoBlobUploader), None, None)
    }

    /// Create a client with a blob-upload peer.
    pub fn with_blob_uploader(
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn BlobUploader>,
    ) -> Self {
        Self::build(transport, uploader, None, None)
    }

    /// Create a client from a device connection string.
    ///
    /// Shared-key strings get an initial signature minted here and passed to
    /// the transport through its configuration hook; rotation then renews it
    /// automatically every [`crate::session::SAS_RENEWAL_INTERVAL`].
    pub fn from_connection_string(
        transport: Arc<dyn Transport>,
        connection_string: &str,
    ) -> Result<Self, ClientError> {
        Self::from_connection_string_with(transport, connection_string, Arc::new(NoBlobUploader))
    }

    /// [`Self::from_connection_string`] with a blob-upload peer.
    pub fn from_connection_string_with(
        transport: Arc<dyn Transport>,
        connection_string: &str,
        uploader: Arc<dyn BlobUploader>,
    ) -> Result<Self, ClientError> {
        if connection_string.trim().is_empty() {
            return Err(ClientError::MissingArgument("connection string"));
        }
        let parsed = ConnectionString::parse(connection_string)?;
        let sas = match (parsed.auth_mode, parsed.shared_access_key.as_deref()) {
            (AuthMode::SharedKey, Some(key)) => {
                Some(SharedAccessSignature::mint(&parsed.resource_uri(), key)?.raw)
            }
            (AuthMode::Bearer, _) => parsed.shared_access_signature.clone(),
            _ => None,
        };
        let config = ClientConfig {
            host_name: parsed.host_name.clone(),
            device_id: parsed.device_id.clone(),
            hub_name: parsed.hub_name.clone(),
            shared_access_signature: sas,
        };
        Ok(Self::build(transport, uploader, Some(parsed), Some(config)))
    }

    /// Create a client from a raw shared access signature. The resource URI
    /// is percent-decoded and host / device id recovered from its path.
    pub fn from_shared_access_signature(
        transport: Arc<dyn Transport>,
        signature: &str,
    ) -> Result<Self, ClientError> {
        if signature.trim().is_empty() {
            return Err(ClientError::MissingArgument("shared access signature"));
        }
        let parsed = SharedAccessSignature::parse(signature)?;
        let hub_name = parsed
            .host_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        let config = ClientConfig {
            host_name: parsed.host_name,
            device_id: parsed.device_id,
            hub_name,
            shared_access_signature: Some(parsed.raw),
        };
        let mut client = Self::build(transport, Arc::new(NoBlobUploader), None, Some(config));
        client.auth_mode = Some(AuthMode::Bearer);
        Ok(client)
    }

    fn build(
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn BlobUploader>,
        conn_str: Option<ConnectionString>,
        config: Option<ClientConfig>,
    ) -> Self {
        let caps = transport.capabilities();
        if let Some(config) = &config {
            transport.configure(config);
        }
        let auth_mode = conn_str.as_ref().map(|cs| cs.auth_mode);
        let auto_renew = auth_mode == Some(AuthMode::SharedKey);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (internal, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = Session::new(
            transport,
            uploader.clone(),
            conn_str,
            auto_renew,
            cmd_rx,
            events.clone(),
            internal.clone(),
        );
        tokio::spawn(session.run());
        debug!(auto_renew, "client created");
        Self {
            cmd_tx,
            caps,
            auth_mode,
            blob: uploader,
            events,
            internal,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Open the connection to the hub.
    pub async fn open(&self) -> Result<ConnectResult, ClientError> {
        self.submit(|done| Command::Open { done }).await
    }

    /// Close the connection. Idempotent: completes with
    /// [`ConnectResult::Disconnected`] without touching the transport when
    /// already disconnected.
    pub async fn close(&self) -> Result<ConnectResult, ClientError> {
        self.submit(|done| Command::Close { done }).await
    }

    // ------------------------------------------------------------------
    // Telemetry and settlement
    // ------------------------------------------------------------------

    /// Submit one telemetry message.
    pub async fn send_event(&self, msg: Message) -> Result<SendResult, ClientError> {
        if !self.caps.send_event {
            return Err(ClientError::UnsupportedOperation("send_event"));
        }
        self.submit(|done| Command::SendEvent { msg, done }).await
    }

    /// Submit a batch of telemetry messages.
    pub async fn send_event_batch(&self, msgs: Vec<Message>) -> Result<SendResult, ClientError> {
        if msgs.is_empty() {
            return Err(ClientError::MissingArgument("messages"));
        }
        if !self.caps.send_event_batch {
            return Err(ClientError::UnsupportedOperation("send_event_batch"));
        }
        self.submit(|done| Command::SendEventBatch { msgs, done })
            .await
    }

    /// Settle an inbound message as completed.
    pub async fn complete(&self, msg: Message) -> Result<SettleResult, ClientError> {
        if !self.caps.complete {
            return Err(ClientError::UnsupportedOperation("complete"));
        }
        self.settle(SettleKind::Complete, msg).await
    }

    /// Settle an inbound message as rejected (no redelivery).
    pub async fn reject(&self, msg: Message) -> Result<SettleResult, ClientError> {
        if !self.caps.reject {
            return Err(ClientError::UnsupportedOperation("reject"));
        }
        self.settle(SettleKind::Reject, msg).await
    }

    /// Settle an inbound message as abandoned (redelivery requested).
    pub async fn abandon(&self, msg: Message) -> Result<SettleResult, ClientError> {
        if !self.caps.abandon {
            return Err(ClientError::UnsupportedOperation("abandon"));
        }
        self.settle(SettleKind::Abandon, msg).await
    }

    async fn settle(&self, kind: SettleKind, msg: Message) -> Result<SettleResult, ClientError> {
        self.submit(|done| Command::Settle { kind, msg, done }).await
    }

    // ------------------------------------------------------------------
    // Inbound subscriptions
    // ------------------------------------------------------------------

    /// Register a direct-method handler. The name is claimed permanently: a
    /// second registration under the same name fails with
    /// [`ClientError::DuplicateMethod`].
    pub async fn on_device_method(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), ClientError> {
        if name.is_empty() {
            return Err(ClientError::MissingArgument("method name"));
        }
        if !self.caps.send_method_response {
            return Err(ClientError::UnsupportedOperation("send_method_response"));
        }
        self.submit(|done| Command::RegisterMethod {
            name: name.to_string(),
            handler,
            done,
        })
        .await
    }

    /// Subscribe to cloud-to-device messages. The first subscription attaches
    /// the transport receiver (connecting first when necessary).
    pub async fn subscribe_messages(&self) -> Result<MessageSubscription, ClientError> {
        self.submit(|done| Command::SubscribeMessages { done }).await
    }

    /// Drop an inbound-message subscription. When it was the last one and no
    /// method handlers remain, the transport receiver is torn down.
    pub fn unsubscribe_messages(&self, subscription: MessageSubscription) {
        let _ = self.cmd_tx.send(Command::UnsubscribeMessages {
            id: subscription.id(),
        });
    }

    // ------------------------------------------------------------------
    // Credentials, twin, blob, options
    // ------------------------------------------------------------------

    /// Replace the shared access signature, reconnecting when the transport
    /// requires it. Rejected immediately under x509 authentication.
    pub async fn update_credential(&self, signature: &str) -> Result<SasUpdated, ClientError> {
        if signature.is_empty() {
            return Err(ClientError::MissingArgument("shared access signature"));
        }
        if !self.caps.update_credential {
            return Err(ClientError::UnsupportedOperation("update_credential"));
        }
        if self.auth_mode == Some(AuthMode::X509) {
            return Err(ClientError::IncompatibleAuth);
        }
        self.submit(|done| Command::UpdateCredential {
            sas: signature.to_string(),
            done: Some(done),
        })
        .await
    }

    /// Obtain the device twin, constructing it on first use.
    pub async fn get_twin(&self) -> Result<Arc<DeviceTwin>, ClientError> {
        self.submit(|done| Command::GetTwin {
            twin_override: None,
            done,
        })
        .await
    }

    /// Obtain the device twin, installing `twin` instead of constructing one.
    pub async fn get_twin_with(
        &self,
        twin: Arc<DeviceTwin>,
    ) -> Result<Arc<DeviceTwin>, ClientError> {
        self.submit(|done| Command::GetTwin {
            twin_override: Some(twin),
            done,
        })
        .await
    }

    /// Upload a blob through the blob-upload peer. Uploads bypass the session
    /// state machine entirely.
    pub async fn upload_to_blob(
        &self,
        blob_name: &str,
        data: Bytes,
        length: usize,
    ) -> Result<(), ClientError> {
        if blob_name.is_empty() {
            return Err(ClientError::MissingArgument("blob name"));
        }
        if data.is_empty() {
            return Err(ClientError::MissingArgument("blob data"));
        }
        if length == 0 {
            return Err(ClientError::MissingArgument("blob length"));
        }
        self.blob
            .upload(blob_name, data, length)
            .await
            .map_err(Into::into)
    }

    /// Forward tuning options to the transport.
    pub async fn set_transport_options(
        &self,
        opts: TransportOptions,
    ) -> Result<(), ClientError> {
        if !self.caps.set_options {
            return Err(ClientError::UnsupportedOperation("set_options"));
        }
        self.submit(|done| Command::SetOptions { opts, done }).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Subscribe to lifecycle events (`Disconnected`, `Error`).
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Notification channel for co-resident subsystems.
    pub(crate) fn subscribe_internal(&self) -> broadcast::Receiver<InternalEvent> {
        self.internal.subscribe()
    }

    /// Capability flags of the bound transport.
    pub fn capabilities(&self) -> TransportCapabilities {
        self.caps
    }

    /// Configuration derived from the connection string, when one was given.
    pub fn config(&self) -> Option<&ClientConfig> {
        self.config.as_ref()
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Command,
    ) -> Result<T, ClientError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(done))
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::harness::{TestTransport, TransportCall};
    use crate::types::{MethodRequest, MethodResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const CONN_STR: &str =
        "HostName=myhub.wirehub.net;DeviceId=dev-1;SharedAccessKey=c2VjcmV0LWtleQ==";

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn handle(&self, request: MethodRequest) -> MethodResponse {
            MethodResponse::reply(&request, 200, request.body.clone())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, usize)>>,
        last_credential: Mutex<Option<String>>,
    }

    #[async_trait]
    impl BlobUploader for RecordingUploader {
        async fn upload(
            &self,
            blob_name: &str,
            _data: Bytes,
            length: usize,
        ) -> Result<(), TransportError> {
            self.uploads.lock().push((blob_name.to_string(), length));
            Ok(())
        }

        fn refresh_credential(&self, sas: &str) {
            *self.last_credential.lock() = Some(sas.to_string());
        }
    }

    #[tokio::test]
    async fn settlement_on_incapable_transport_fails_synchronously() {
        let mut caps = TransportCapabilities::all();
        caps.complete = false;
        let transport = TestTransport::new().with_capabilities(caps);
        let client = HubClient::new(Arc::new(transport.clone()));

        let err = client.complete(Message::new("m")).await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedOperation("complete")));
        // Never reached the session, let alone the transport.
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn rotation_on_incapable_transport_fails_synchronously() {
        let mut caps = TransportCapabilities::all();
        caps.update_credential = false;
        let transport = TestTransport::new().with_capabilities(caps);
        let client = HubClient::new(Arc::new(transport.clone()));

        client.open().await.unwrap();
        let err = client
            .update_credential("SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnsupportedOperation("update_credential")
        ));
        // No rotation state change reached the transport.
        assert!(!transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::UpdateCredential(_))));
    }

    #[tokio::test]
    async fn method_registration_requires_method_response_support() {
        let mut caps = TransportCapabilities::all();
        caps.send_method_response = false;
        let transport = TestTransport::new().with_capabilities(caps);
        let client = HubClient::new(Arc::new(transport));

        let err = client
            .on_device_method("reboot", Arc::new(Echo))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnsupportedOperation("send_method_response")
        ));
    }

    #[tokio::test]
    async fn duplicate_method_registration_is_rejected() {
        let transport = TestTransport::new();
        let client = HubClient::new(Arc::new(transport));

        client.on_device_method("reboot", Arc::new(Echo)).await.unwrap();
        let err = client
            .on_device_method("reboot", Arc::new(Echo))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateMethod(n) if n == "reboot"));
    }

    #[tokio::test]
    async fn argument_validation_is_synchronous() {
        let transport = TestTransport::new();
        let client = HubClient::new(Arc::new(transport.clone()));

        assert!(matches!(
            client.on_device_method("", Arc::new(Echo)).await.unwrap_err(),
            ClientError::MissingArgument("method name")
        ));
        assert!(matches!(
            client.send_event_batch(vec![]).await.unwrap_err(),
            ClientError::MissingArgument("messages")
        ));
        assert!(matches!(
            client.update_credential("").await.unwrap_err(),
            ClientError::MissingArgument("shared access signature")
        ));
        assert!(matches!(
            client
                .upload_to_blob("", Bytes::from("x"), 1)
                .await
                .unwrap_err(),
            ClientError::MissingArgument("blob name")
        ));
        assert!(matches!(
            client
                .upload_to_blob("b", Bytes::from("x"), 0)
                .await
                .unwrap_err(),
            ClientError::MissingArgument("blob length")
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn x509_forbids_credential_rotation() {
        let transport = TestTransport::new();
        let client = HubClient::from_connection_string(
            Arc::new(transport.clone()),
            "HostName=myhub.wirehub.net;DeviceId=dev-1;x509=true",
        )
        .unwrap();

        let err = client
            .update_credential("SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::IncompatibleAuth));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn connection_string_config_reaches_the_transport() {
        let transport = TestTransport::new();
        let _client =
            HubClient::from_connection_string(Arc::new(transport.clone()), CONN_STR).unwrap();

        let config = transport.configured().expect("configured");
        assert_eq!(config.host_name, "myhub.wirehub.net");
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.hub_name, "myhub");
        let sas = config.shared_access_signature.expect("initial signature");
        assert!(sas.starts_with("SharedAccessSignature sr="));
    }

    #[tokio::test]
    async fn raw_signature_factory_recovers_identity() {
        let transport = TestTransport::new();
        let sas = wirehub_auth::SharedAccessSignature::mint_at(
            "myhub.wirehub.net/devices/dev-1",
            "c2VjcmV0LWtleQ==",
            4_000_000_000,
        )
        .unwrap();
        let client =
            HubClient::from_shared_access_signature(Arc::new(transport), &sas.raw).unwrap();

        let config = client.config().expect("config");
        assert_eq!(config.host_name, "myhub.wirehub.net");
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.shared_access_signature.as_deref(), Some(sas.raw.as_str()));
    }

    #[tokio::test]
    async fn unsubscribing_the_last_sink_tears_down_the_receiver() {
        let transport = TestTransport::new();
        let client = HubClient::new(Arc::new(transport.clone()));

        client.open().await.unwrap();
        let sub = client.subscribe_messages().await.unwrap();
        assert_eq!(transport.get_receiver_count(), 1);

        client.unsubscribe_messages(sub);
        // Another awaited command flushes the fire-and-forget unsubscribe.
        client.open().await.unwrap();
        assert!(!transport.inject_message(Message::new("late")));
    }

    #[tokio::test]
    async fn unsubscribe_keeps_receiver_while_methods_remain() {
        let transport = TestTransport::new();
        let client = HubClient::new(Arc::new(transport.clone()));

        client.open().await.unwrap();
        client.on_device_method("reboot", Arc::new(Echo)).await.unwrap();
        let sub = client.subscribe_messages().await.unwrap();
        assert_eq!(transport.get_receiver_count(), 1);

        client.unsubscribe_messages(sub);
        client.open().await.unwrap();
        // Method interest keeps the receiver alive.
        assert!(transport.inject_message(Message::new("still-delivered")));
    }

    #[tokio::test]
    async fn blob_uploads_bypass_the_session() {
        let transport = TestTransport::new();
        let uploader = Arc::new(RecordingUploader::default());
        let client = HubClient::with_blob_uploader(Arc::new(transport.clone()), uploader.clone());

        client
            .upload_to_blob("diagnostics.bin", Bytes::from("data"), 4)
            .await
            .unwrap();
        assert_eq!(
            uploader.uploads.lock().as_slice(),
            &[("diagnostics.bin".to_string(), 4)]
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn rotation_propagates_to_blob_peer() {
        let transport = TestTransport::new();
        let uploader = Arc::new(RecordingUploader::default());
        let client = HubClient::with_blob_uploader(Arc::new(transport), uploader.clone());

        client.open().await.unwrap();
        let sas = "SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1";
        client.update_credential(sas).await.unwrap();
        assert_eq!(uploader.last_credential.lock().as_deref(), Some(sas));
    }
}
