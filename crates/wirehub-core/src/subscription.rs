//! Subscription management: method handlers, message sinks and the receiver
//! lifecycle.
//!
//! The session owns at most one live receiver, attached only while connected
//! and only while interest exists (at least one message sink or one method
//! handler). This module tracks that interest and the attached receiver; the
//! session drives when to attach and tear down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::ClientError;
use crate::transport::{ReceiverEvent, TransportReceiver};
use crate::types::{Message, MethodRequest, MethodResponse};

/// A registered direct-method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle an invocation and produce the device's response.
    async fn handle(&self, request: MethodRequest) -> MethodResponse;
}

/// A live inbound-message subscription handed to the caller.
#[derive(Debug)]
pub struct MessageSubscription {
    pub(crate) id: u64,
    /// Stream of inbound messages for this subscriber
    pub messages: mpsc::UnboundedReceiver<Message>,
}

impl MessageSubscription {
    /// Subscription id, used for explicit unsubscription.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Method map, message sinks and the cached receiver.
#[derive(Default)]
pub struct SubscriptionManager {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    message_sinks: HashMap<u64, mpsc::UnboundedSender<Message>>,
    next_sink_id: u64,
    receiver: Option<TransportReceiver>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method handler. The map is append-only: a second
    /// registration under the same name is an error.
    pub fn register_method(
        &mut self,
        name: String,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), ClientError> {
        if self.methods.contains_key(&name) {
            return Err(ClientError::DuplicateMethod(name));
        }
        debug!(method = %name, "registered method handler");
        self.methods.insert(name, handler);
        Ok(())
    }

    /// Look up the handler for an invocation.
    pub fn method_handler(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    /// Add an inbound-message sink; returns the subscription.
    pub fn add_message_sink(&mut self) -> MessageSubscription {
        let id = self.next_sink_id;
        self.next_sink_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.message_sinks.insert(id, tx);
        MessageSubscription { id, messages: rx }
    }

    /// Remove a sink by id; true when it existed.
    pub fn remove_message_sink(&mut self, id: u64) -> bool {
        self.message_sinks.remove(&id).is_some()
    }

    /// Whether anything is interested in inbound traffic.
    pub fn interest(&self) -> bool {
        !self.message_sinks.is_empty() || !self.methods.is_empty()
    }

    /// Whether any inbound-message sink is registered.
    pub fn has_message_sinks(&self) -> bool {
        !self.message_sinks.is_empty()
    }

    /// Whether a receiver is currently attached.
    pub fn has_receiver(&self) -> bool {
        self.receiver.is_some()
    }

    /// Install a receiver obtained from the transport. A receiver with the
    /// same id as the cached one is ignored; returns whether it was installed.
    pub fn install_receiver(&mut self, receiver: TransportReceiver) -> bool {
        if let Some(current) = &self.receiver {
            if current.id == receiver.id {
                debug!(id = receiver.id, "receiver already attached, ignoring");
                return false;
            }
        }
        debug!(id = receiver.id, "receiver attached");
        self.receiver = Some(receiver);
        true
    }

    /// Detach the receiver, releasing everything attached to it.
    pub fn teardown_receiver(&mut self) {
        if let Some(r) = self.receiver.take() {
            debug!(id = r.id, "receiver torn down");
        }
    }

    /// Await the next receiver event. Pends forever while no receiver is
    /// attached, which makes this directly usable as a `select!` arm.
    pub async fn next_event(&mut self) -> ReceiverEvent {
        match self.receiver.as_mut() {
            Some(r) => match r.events.recv().await {
                Some(ev) => ev,
                // Transport side dropped its sender; detach so this does not
                // resolve again, and report once as a receiver error.
                None => {
                    self.receiver = None;
                    ReceiverEvent::Error(crate::errors::TransportError::Other(
                        "receiver channel closed".into(),
                    ))
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Fan a message out to every sink, pruning sinks whose subscriber is
    /// gone.
    pub fn deliver_message(&mut self, msg: Message) {
        self.message_sinks
            .retain(|_, sink| sink.send(msg.clone()).is_ok());
    }
}
