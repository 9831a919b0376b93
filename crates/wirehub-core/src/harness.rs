//! Test harness for the session controller.
//!
//! [`TestTransport`] is a scripted in-memory transport: it records every call,
//! serves queued results (success by default), and lets tests inject receiver
//! events and spontaneous disconnects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::transport::{
    CredentialUpdate, ReceiverEvent, Transport, TransportCapabilities, TransportEvent,
    TransportReceiver,
};
use crate::types::{ClientConfig, Message, MethodRequest, MethodResponse, TransportOptions};

/// One recorded transport invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    SendEvent(Message),
    SendEventBatch(usize),
    Complete(Message),
    Reject(Message),
    Abandon(Message),
    UpdateCredential(String),
    SetOptions(TransportOptions),
    GetReceiver,
    SendMethodResponse(MethodResponse),
}

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<TransportCall>>,
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    send_results: Mutex<VecDeque<Result<(), TransportError>>>,
    credential_results: Mutex<VecDeque<Result<CredentialUpdate, TransportError>>>,
    connect_delay: Mutex<Duration>,
    connects_in_flight: AtomicUsize,
    max_connects_in_flight: AtomicUsize,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    receiver_tx: Mutex<Option<mpsc::UnboundedSender<ReceiverEvent>>>,
    next_receiver_id: AtomicU64,
    config: Mutex<Option<ClientConfig>>,
}

/// Scripted transport for tests. Cloning shares the script and the records.
#[derive(Clone)]
pub struct TestTransport {
    caps: TransportCapabilities,
    inner: Arc<Inner>,
}

impl TestTransport {
    /// Fully capable transport.
    pub fn new() -> Self {
        Self {
            caps: TransportCapabilities::all(),
            inner: Arc::new(Inner::default()),
        }
    }

    /// Restrict the declared capabilities.
    pub fn with_capabilities(mut self, caps: TransportCapabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Delay every connect by `delay` before it resolves.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.inner.connect_delay.lock() = delay;
        self
    }

    /// Queue the result of the next connect (default: success).
    pub fn queue_connect_result(&self, result: Result<(), TransportError>) {
        self.inner.connect_results.lock().push_back(result);
    }

    /// Queue the result of the next send or settlement (default: success).
    pub fn queue_send_result(&self, result: Result<(), TransportError>) {
        self.inner.send_results.lock().push_back(result);
    }

    /// Queue the result of the next credential update (default: success, no
    /// reconnect).
    pub fn queue_credential_result(&self, result: Result<CredentialUpdate, TransportError>) {
        self.inner.credential_results.lock().push_back(result);
    }

    /// Emit a spontaneous disconnect; false when no session is listening.
    pub fn emit_disconnect(&self, cause: TransportError) -> bool {
        match self.inner.events_tx.lock().as_ref() {
            Some(tx) => tx.send(TransportEvent::Disconnected(cause)).is_ok(),
            None => false,
        }
    }

    /// Deliver a cloud-to-device message; false when no receiver is attached.
    pub fn inject_message(&self, msg: Message) -> bool {
        match self.inner.receiver_tx.lock().as_ref() {
            Some(tx) => tx.send(ReceiverEvent::Message(msg)).is_ok(),
            None => false,
        }
    }

    /// Deliver a direct method invocation; false when no receiver is attached.
    pub fn inject_method(&self, req: MethodRequest) -> bool {
        match self.inner.receiver_tx.lock().as_ref() {
            Some(tx) => tx.send(ReceiverEvent::Method(req)).is_ok(),
            None => false,
        }
    }

    /// Deliver a receiver error; false when no receiver is attached.
    pub fn inject_receiver_error(&self, err: TransportError) -> bool {
        match self.inner.receiver_tx.lock().as_ref() {
            Some(tx) => tx.send(ReceiverEvent::Error(err)).is_ok(),
            None => false,
        }
    }

    /// Everything recorded so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.calls.lock().clone()
    }

    /// How many connects were attempted.
    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Connect))
    }

    /// How many receivers were handed out.
    pub fn get_receiver_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::GetReceiver))
    }

    /// Highest number of concurrently in-flight connects observed.
    pub fn max_connects_in_flight(&self) -> usize {
        self.inner.max_connects_in_flight.load(Ordering::Relaxed)
    }

    /// Configuration received through the configure hook, if any.
    pub fn configured(&self) -> Option<ClientConfig> {
        self.inner.config.lock().clone()
    }

    fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.inner.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: TransportCall) {
        self.inner.calls.lock().push(call);
    }

    fn pop_send_result(&self) -> Result<(), TransportError> {
        self.inner
            .send_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

impl Default for TestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.caps
    }

    fn configure(&self, config: &ClientConfig) {
        *self.inner.config.lock() = Some(config.clone());
    }

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Connect);
        let in_flight = self.inner.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .max_connects_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .inner
            .connect_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            *self.inner.events_tx.lock() = Some(events);
        }
        self.inner.connects_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        *self.inner.events_tx.lock() = None;
        *self.inner.receiver_tx.lock() = None;
        Ok(())
    }

    async fn send_event(&self, msg: Message) -> Result<(), TransportError> {
        self.record(TransportCall::SendEvent(msg));
        self.pop_send_result()
    }

    async fn send_event_batch(&self, msgs: Vec<Message>) -> Result<(), TransportError> {
        self.record(TransportCall::SendEventBatch(msgs.len()));
        self.pop_send_result()
    }

    async fn complete(&self, msg: Message) -> Result<(), TransportError> {
        self.record(TransportCall::Complete(msg));
        self.pop_send_result()
    }

    async fn reject(&self, msg: Message) -> Result<(), TransportError> {
        self.record(TransportCall::Reject(msg));
        self.pop_send_result()
    }

    async fn abandon(&self, msg: Message) -> Result<(), TransportError> {
        self.record(TransportCall::Abandon(msg));
        self.pop_send_result()
    }

    async fn update_credential(&self, sas: &str) -> Result<CredentialUpdate, TransportError> {
        self.record(TransportCall::UpdateCredential(sas.to_string()));
        self.inner
            .credential_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(CredentialUpdate {
                needs_reconnect: false,
            }))
    }

    async fn set_options(&self, opts: TransportOptions) -> Result<(), TransportError> {
        self.record(TransportCall::SetOptions(opts));
        Ok(())
    }

    async fn get_receiver(&self) -> Result<TransportReceiver, TransportError> {
        self.record(TransportCall::GetReceiver);
        let id = self.inner.next_receiver_id.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();
        *self.inner.receiver_tx.lock() = Some(tx);
        Ok(TransportReceiver { id, events })
    }

    async fn send_method_response(&self, resp: MethodResponse) -> Result<(), TransportError> {
        self.record(TransportCall::SendMethodResponse(resp));
        Ok(())
    }
}
