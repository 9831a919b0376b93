//! Session state machine.
//!
//! All externally visible operations funnel through a single task owning the
//! transport, the subscription manager and the connection state. The task
//! multiplexes four inputs: commands from the facade, completions of spawned
//! transport calls, transport disconnect events, and receiver events, plus
//! the credential renewal deadline. Commands issued while the machine cannot
//! service them sit in a FIFO queue and are re-dispatched on the next
//! transition; long-running transport calls are spawned so the loop stays
//! responsive (a `close` can always be serviced mid-connect).
//!
//! Spawned transport completions carry an epoch number. A `close` bumps the
//! epoch, so a completion from an abandoned call is recognised as stale and
//! discarded instead of corrupting the state it finds.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use wirehub_auth::{ConnectionString, SharedAccessSignature};

use crate::blob::BlobUploader;
use crate::errors::{ClientError, TransportError};
use crate::subscription::{MethodHandler, SubscriptionManager};
use crate::transport::{
    CredentialUpdate, ReceiverEvent, Transport, TransportEvent,
};
use crate::twin::DeviceTwin;
use crate::types::{
    ConnectResult, Message, SasUpdated, SendResult, SettleResult, TransportOptions,
};

/// Interval between automatic credential rotations (45 minutes).
pub const SAS_RENEWAL_INTERVAL: Duration = Duration::from_millis(2_700_000);

/// Connection state of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state; also reached by `close` from anywhere
    Disconnected,
    /// A transport connect is in flight
    Connecting,
    /// Link is up; operations execute
    Connected,
    /// A transport disconnect is in flight
    Disconnecting,
    /// A credential update is in flight on the transport
    UpdatingSas,
}

/// Lifecycle events published to the client's subscribers.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The transport dropped the link without a client-initiated close
    Disconnected { cause: TransportError },
    /// An internal asynchronous failure with no waiting caller
    Error(ClientError),
}

/// Notifications for co-resident subsystems (twin).
#[derive(Clone, Debug)]
pub enum InternalEvent {
    /// The session entered a new state
    StateChanged(SessionState),
    /// A credential rotation completed successfully
    CredentialUpdated,
}

pub(crate) type Done<T> = oneshot::Sender<Result<T, ClientError>>;

/// Which settlement a settle command applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SettleKind {
    Complete,
    Reject,
    Abandon,
}

/// A user request plus its completion sink.
pub(crate) enum Command {
    Open {
        done: Done<ConnectResult>,
    },
    Close {
        done: Done<ConnectResult>,
    },
    SendEvent {
        msg: Message,
        done: Done<SendResult>,
    },
    SendEventBatch {
        msgs: Vec<Message>,
        done: Done<SendResult>,
    },
    Settle {
        kind: SettleKind,
        msg: Message,
        done: Done<SettleResult>,
    },
    RegisterMethod {
        name: String,
        handler: Arc<dyn MethodHandler>,
        done: Done<()>,
    },
    SubscribeMessages {
        done: Done<crate::subscription::MessageSubscription>,
    },
    UnsubscribeMessages {
        id: u64,
    },
    UpdateCredential {
        sas: String,
        /// `None` when the renewal timer initiated the rotation
        done: Option<Done<SasUpdated>>,
    },
    GetTwin {
        twin_override: Option<Arc<DeviceTwin>>,
        done: Done<Arc<DeviceTwin>>,
    },
    SetOptions {
        opts: TransportOptions,
        done: Done<()>,
    },
    /// Internal: attach the receiver once the state allows it
    EnsureReceiver,
}

/// Completion of a spawned transport call.
enum IoEvent {
    ConnectDone {
        epoch: u64,
        result: Result<(), TransportError>,
    },
    DisconnectDone {
        epoch: u64,
        result: Result<(), TransportError>,
    },
    CredentialDone {
        epoch: u64,
        result: Result<CredentialUpdate, TransportError>,
    },
}

/// What happens to the deferred queue on entry to *disconnected*.
enum QueueFate {
    /// Keep queued commands for the next open (close, spontaneous disconnect)
    Keep,
    /// Complete every queued command with this failure (failed connect or
    /// rotation; re-dispatching would retry, and retrying is a non-goal)
    Fail(TransportError),
}

struct PendingRotation {
    done: Option<Done<SasUpdated>>,
}

pub(crate) struct Session {
    transport: Arc<dyn Transport>,
    state: SessionState,
    deferred: VecDeque<Command>,
    subs: SubscriptionManager,
    twin: Option<Arc<DeviceTwin>>,
    blob: Arc<dyn BlobUploader>,
    conn_str: Option<ConnectionString>,
    auto_renew: bool,
    renewal_at: Option<Instant>,
    epoch: u64,
    pending_open: Vec<Done<ConnectResult>>,
    pending_close: Vec<Done<ConnectResult>>,
    pending_rotation: Option<PendingRotation>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    events: broadcast::Sender<ClientEvent>,
    internal: broadcast::Sender<InternalEvent>,
}

enum Wake {
    Cmd(Option<Command>),
    Io(IoEvent),
    Transport(Option<TransportEvent>),
    Inbound(ReceiverEvent),
    Renewal,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        blob: Arc<dyn BlobUploader>,
        conn_str: Option<ConnectionString>,
        auto_renew: bool,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
        internal: broadcast::Sender<InternalEvent>,
    ) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            state: SessionState::Disconnected,
            deferred: VecDeque::new(),
            subs: SubscriptionManager::new(),
            twin: None,
            blob,
            conn_str,
            auto_renew,
            renewal_at: None,
            epoch: 0,
            pending_open: Vec::new(),
            pending_close: Vec::new(),
            pending_rotation: None,
            cmd_rx,
            io_tx,
            io_rx,
            transport_events: None,
            events,
            internal,
        }
    }

    /// Drive the session until the facade is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            let renewal_at = self.renewal_at;
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                Some(io) = self.io_rx.recv() => Wake::Io(io),
                ev = async {
                    match self.transport_events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => Wake::Transport(ev),
                ev = self.subs.next_event() => Wake::Inbound(ev),
                _ = async {
                    match renewal_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => Wake::Renewal,
            };

            match wake {
                Wake::Cmd(Some(cmd)) => self.dispatch(cmd).await,
                Wake::Cmd(None) => break,
                Wake::Io(io) => self.handle_io(io).await,
                Wake::Transport(Some(ev)) => self.handle_transport_event(ev).await,
                Wake::Transport(None) => self.transport_events = None,
                Wake::Inbound(ev) => self.handle_receiver_event(ev),
                Wake::Renewal => self.handle_renewal().await,
            }
        }
        debug!("session task stopped");
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Boxed indirection: dispatch and transition are mutually recursive
    /// (transitions re-dispatch deferred commands).
    fn dispatch<'a>(
        &'a mut self,
        cmd: Command,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.dispatch_impl(cmd))
    }

    async fn dispatch_impl(&mut self, cmd: Command) {
        // Subscription bookkeeping is state-independent: the map and the sink
        // set mutate immediately, only the receiver-attach concern rides the
        // state machine.
        match cmd {
            Command::RegisterMethod { name, handler, done } => {
                let result = self.subs.register_method(name, handler);
                let registered = result.is_ok();
                let _ = done.send(result);
                if registered {
                    self.on_interest_created().await;
                }
                return;
            }
            Command::SubscribeMessages { done } => {
                let first_sink = !self.subs.has_message_sinks();
                let sub = self.subs.add_message_sink();
                let _ = done.send(Ok(sub));
                if first_sink {
                    self.on_interest_created().await;
                }
                return;
            }
            Command::UnsubscribeMessages { id } => {
                self.subs.remove_message_sink(id);
                if self.state == SessionState::Connected && !self.subs.interest() {
                    self.subs.teardown_receiver();
                }
                return;
            }
            cmd => self.dispatch_stateful(cmd).await,
        }
    }

    async fn dispatch_stateful(&mut self, cmd: Command) {
        match self.state {
            SessionState::Disconnected => self.dispatch_disconnected(cmd).await,
            SessionState::Connecting => match cmd {
                Command::Close { done } => {
                    for d in self.pending_open.drain(..) {
                        let _ = d.send(Err(ClientError::Closed));
                    }
                    self.begin_disconnect(done).await;
                }
                cmd => self.deferred.push_back(cmd),
            },
            SessionState::Connected => self.dispatch_connected(cmd).await,
            SessionState::Disconnecting => self.deferred.push_back(cmd),
            SessionState::UpdatingSas => match cmd {
                Command::Close { done } => {
                    if let Some(rotation) = self.pending_rotation.take() {
                        self.complete_rotation(rotation, Err(ClientError::Closed));
                    }
                    self.begin_disconnect(done).await;
                }
                cmd => self.deferred.push_back(cmd),
            },
        }
    }

    async fn dispatch_disconnected(&mut self, cmd: Command) {
        match cmd {
            Command::Open { done } => {
                self.pending_open.push(done);
                self.begin_connect().await;
            }
            // Idempotent: no transport involvement.
            Command::Close { done } => {
                let _ = done.send(Ok(ConnectResult::Disconnected));
            }
            // The transport may be a stateless client; forward without any
            // state change.
            Command::UpdateCredential { sas, done } => {
                let transport = self.transport.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = transport
                        .update_credential(&sas)
                        .await
                        .map(|_| SasUpdated { reconnected: false })
                        .map_err(ClientError::from);
                    match done {
                        Some(done) => {
                            let _ = done.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                let _ = events.send(ClientEvent::Error(e));
                            }
                        }
                    }
                });
            }
            // Only reachable through a drain; waits for the next open.
            Command::EnsureReceiver => self.deferred.push_back(Command::EnsureReceiver),
            // Everything else defers and triggers a self-open; its failure
            // completes the queued callers.
            cmd => {
                self.deferred.push_back(cmd);
                self.begin_connect().await;
            }
        }
    }

    async fn dispatch_connected(&mut self, cmd: Command) {
        match cmd {
            Command::Open { done } => {
                let _ = done.send(Ok(ConnectResult::Connected));
            }
            Command::Close { done } => {
                self.begin_disconnect(done).await;
            }
            Command::SendEvent { msg, done } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let result = transport
                        .send_event(msg)
                        .await
                        .map(|_| SendResult::Enqueued)
                        .map_err(ClientError::from);
                    let _ = done.send(result);
                });
            }
            Command::SendEventBatch { msgs, done } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let result = transport
                        .send_event_batch(msgs)
                        .await
                        .map(|_| SendResult::Enqueued)
                        .map_err(ClientError::from);
                    let _ = done.send(result);
                });
            }
            Command::Settle { kind, msg, done } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let result = match kind {
                        SettleKind::Complete => transport
                            .complete(msg)
                            .await
                            .map(|_| SettleResult::Completed),
                        SettleKind::Reject => {
                            transport.reject(msg).await.map(|_| SettleResult::Rejected)
                        }
                        SettleKind::Abandon => transport
                            .abandon(msg)
                            .await
                            .map(|_| SettleResult::Abandoned),
                    };
                    let _ = done.send(result.map_err(ClientError::from));
                });
            }
            Command::UpdateCredential { sas, done } => {
                self.begin_rotation(sas, done).await;
            }
            Command::GetTwin { twin_override, done } => {
                let twin = match twin_override {
                    Some(twin) => {
                        self.twin = Some(twin.clone());
                        twin
                    }
                    None => match &self.twin {
                        Some(twin) => twin.clone(),
                        None => {
                            let twin = DeviceTwin::attach(self.internal.subscribe());
                            self.twin = Some(twin.clone());
                            twin
                        }
                    },
                };
                let _ = done.send(Ok(twin));
            }
            Command::SetOptions { opts, done } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let result = transport
                        .set_options(opts)
                        .await
                        .map_err(ClientError::from);
                    let _ = done.send(result);
                });
            }
            Command::EnsureReceiver => self.ensure_receiver().await,
            // Subscription commands are handled before state dispatch.
            Command::RegisterMethod { .. }
            | Command::SubscribeMessages { .. }
            | Command::UnsubscribeMessages { .. } => unreachable!(),
        }
    }

    /// Interest appeared (first sink or a new method handler): attach now if
    /// connected, otherwise queue the attach and open if fully disconnected.
    async fn on_interest_created(&mut self) {
        match self.state {
            SessionState::Connected => self.ensure_receiver().await,
            SessionState::Disconnected => {
                self.deferred.push_back(Command::EnsureReceiver);
                self.begin_connect().await;
            }
            _ => self.deferred.push_back(Command::EnsureReceiver),
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Move to a non-disconnected state and re-dispatch the deferred queue.
    async fn transition(&mut self, next: SessionState) {
        debug_assert!(next != SessionState::Disconnected);
        let prev = self.state;
        if prev == SessionState::Connected {
            self.subs.teardown_receiver();
            self.renewal_at = None;
        }
        self.state = next;
        debug!(?prev, ?next, "state transition");
        let _ = self.internal.send(InternalEvent::StateChanged(next));

        if next == SessionState::Connected {
            if self.auto_renew {
                self.renewal_at = Some(Instant::now() + SAS_RENEWAL_INTERVAL);
            }
            if self.subs.interest() && !self.subs.has_receiver() {
                self.ensure_receiver().await;
            }
        }

        let drained: Vec<Command> = self.deferred.drain(..).collect();
        for cmd in drained {
            self.dispatch(cmd).await;
        }
    }

    /// Move to *disconnected*.
    ///
    /// On the `Keep` path only the commands with an executing disposition in
    /// *disconnected* (open, close, update-credential) are re-dispatched; the
    /// rest stay queued for the next open. Replaying them here would trigger
    /// a fresh self-open behind the caller's back.
    async fn enter_disconnected(&mut self, fate: QueueFate) {
        let prev = self.state;
        if prev == SessionState::Connected {
            self.subs.teardown_receiver();
        }
        self.renewal_at = None;
        self.state = SessionState::Disconnected;
        debug!(?prev, "state transition to disconnected");
        let _ = self
            .internal
            .send(InternalEvent::StateChanged(SessionState::Disconnected));
        match fate {
            QueueFate::Fail(err) => {
                let queued: Vec<Command> = self.deferred.drain(..).collect();
                for cmd in queued {
                    self.fail_command(cmd, &err);
                }
            }
            QueueFate::Keep => {
                let queued: Vec<Command> = self.deferred.drain(..).collect();
                for cmd in queued {
                    match cmd {
                        Command::Open { .. }
                        | Command::Close { .. }
                        | Command::UpdateCredential { .. } => self.dispatch(cmd).await,
                        other => self.deferred.push_back(other),
                    }
                }
            }
        }
    }

    fn fail_command(&mut self, cmd: Command, err: &TransportError) {
        match cmd {
            Command::Open { done } => {
                let _ = done.send(Err(err.clone().into()));
            }
            // The machine is disconnected, which is all close asks for.
            Command::Close { done } => {
                let _ = done.send(Ok(ConnectResult::Disconnected));
            }
            Command::SendEvent { done, .. } | Command::SendEventBatch { done, .. } => {
                let _ = done.send(Err(err.clone().into()));
            }
            Command::Settle { done, .. } => {
                let _ = done.send(Err(err.clone().into()));
            }
            Command::RegisterMethod { done, .. } => {
                let _ = done.send(Err(err.clone().into()));
            }
            Command::SubscribeMessages { done } => {
                let _ = done.send(Err(err.clone().into()));
            }
            Command::UpdateCredential { done, .. } => match done {
                Some(done) => {
                    let _ = done.send(Err(err.clone().into()));
                }
                None => {
                    let _ = self
                        .events
                        .send(ClientEvent::Error(err.clone().into()));
                }
            },
            Command::GetTwin { done, .. } => {
                let _ = done.send(Err(err.clone().into()));
            }
            Command::SetOptions { done, .. } => {
                let _ = done.send(Err(err.clone().into()));
            }
            // No caller to notify; surface as a lifecycle error.
            Command::EnsureReceiver => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(err.clone().into()));
            }
            Command::UnsubscribeMessages { id } => {
                self.subs.remove_message_sink(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport lifecycle operations
    // ------------------------------------------------------------------

    async fn begin_connect(&mut self) {
        debug_assert_eq!(self.state, SessionState::Disconnected);
        self.transition(SessionState::Connecting).await;
        // A deferred close may have been re-dispatched by the transition and
        // already moved the machine on; only proceed while still connecting.
        if self.state != SessionState::Connecting {
            return;
        }
        if self.transport.capabilities().connect {
            self.spawn_connect();
        } else {
            // Connectionless transport: reachable as soon as asked.
            self.finish_connect_success().await;
        }
    }

    fn spawn_connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let (tx, rx) = mpsc::unbounded_channel();
        // Replaces any previously installed disconnect listener.
        self.transport_events = Some(rx);
        let transport = self.transport.clone();
        let io = self.io_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(tx).await;
            let _ = io.send(IoEvent::ConnectDone { epoch, result });
        });
    }

    async fn begin_disconnect(&mut self, done: Done<ConnectResult>) {
        self.pending_close.push(done);
        // Invalidate whatever transport call is still in flight.
        self.epoch += 1;
        let epoch = self.epoch;
        self.transition(SessionState::Disconnecting).await;
        if self.state != SessionState::Disconnecting {
            return;
        }
        if self.transport.capabilities().disconnect {
            let transport = self.transport.clone();
            let io = self.io_tx.clone();
            tokio::spawn(async move {
                let result = transport.disconnect().await;
                let _ = io.send(IoEvent::DisconnectDone { epoch, result });
            });
        } else {
            self.transport_events = None;
            let closes: Vec<Done<ConnectResult>> = self.pending_close.drain(..).collect();
            self.enter_disconnected(QueueFate::Keep).await;
            for d in closes {
                let _ = d.send(Ok(ConnectResult::Disconnected));
            }
        }
    }

    async fn begin_rotation(&mut self, sas: String, done: Option<Done<SasUpdated>>) {
        debug_assert_eq!(self.state, SessionState::Connected);
        // Peers learn the fresh signature up front; completion is announced
        // separately on the internal channel.
        self.blob.refresh_credential(&sas);
        if let Some(twin) = &self.twin {
            twin.refresh_credential(&sas);
        }
        self.pending_rotation = Some(PendingRotation { done });
        self.transition(SessionState::UpdatingSas).await;
        if self.state != SessionState::UpdatingSas {
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let transport = self.transport.clone();
        let io = self.io_tx.clone();
        tokio::spawn(async move {
            let result = transport.update_credential(&sas).await;
            let _ = io.send(IoEvent::CredentialDone { epoch, result });
        });
    }

    async fn ensure_receiver(&mut self) {
        if self.subs.has_receiver() {
            return;
        }
        match self.transport.get_receiver().await {
            Ok(receiver) => {
                self.subs.install_receiver(receiver);
            }
            Err(e) => {
                warn!(error = %e, "failed to obtain receiver");
                let _ = self.events.send(ClientEvent::Error(e.into()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Completions of spawned transport calls
    // ------------------------------------------------------------------

    async fn handle_io(&mut self, io: IoEvent) {
        match io {
            IoEvent::ConnectDone { epoch, result } => {
                if epoch != self.epoch || self.state != SessionState::Connecting {
                    // A close intervened. A connect that nevertheless
                    // succeeded holds a link nobody wants; drop it.
                    if result.is_ok() && self.transport.capabilities().disconnect {
                        let transport = self.transport.clone();
                        tokio::spawn(async move {
                            let _ = transport.disconnect().await;
                        });
                    }
                    debug!("discarding stale connect completion");
                    return;
                }
                match result {
                    Ok(()) => self.finish_connect_success().await,
                    Err(e) => {
                        self.transport_events = None;
                        let opens: Vec<Done<ConnectResult>> =
                            self.pending_open.drain(..).collect();
                        let rotation = self.pending_rotation.take();
                        self.enter_disconnected(QueueFate::Fail(e.clone())).await;
                        for d in opens {
                            let _ = d.send(Err(e.clone().into()));
                        }
                        if let Some(rotation) = rotation {
                            self.complete_rotation(rotation, Err(e.into()));
                        }
                    }
                }
            }
            IoEvent::DisconnectDone { epoch, result } => {
                if epoch != self.epoch || self.state != SessionState::Disconnecting {
                    debug!("discarding stale disconnect completion");
                    return;
                }
                self.transport_events = None;
                let closes: Vec<Done<ConnectResult>> = self.pending_close.drain(..).collect();
                self.enter_disconnected(QueueFate::Keep).await;
                for d in closes {
                    let _ = d.send(match &result {
                        Ok(()) => Ok(ConnectResult::Disconnected),
                        Err(e) => Err(e.clone().into()),
                    });
                }
            }
            IoEvent::CredentialDone { epoch, result } => {
                if epoch != self.epoch || self.state != SessionState::UpdatingSas {
                    debug!("discarding stale credential completion");
                    return;
                }
                match result {
                    Ok(CredentialUpdate {
                        needs_reconnect: true,
                    }) => {
                        // The rotation stays pending across the reconnect and
                        // completes from the connect path.
                        self.transition(SessionState::Connecting).await;
                        if self.state == SessionState::Connecting {
                            if self.transport.capabilities().connect {
                                self.spawn_connect();
                            } else {
                                self.finish_connect_success().await;
                            }
                        }
                    }
                    Ok(CredentialUpdate {
                        needs_reconnect: false,
                    }) => {
                        let rotation = self.pending_rotation.take();
                        self.transition(SessionState::Connected).await;
                        if let Some(rotation) = rotation {
                            self.complete_rotation(
                                rotation,
                                Ok(SasUpdated { reconnected: false }),
                            );
                        }
                    }
                    Err(e) => {
                        self.transport_events = None;
                        let rotation = self.pending_rotation.take();
                        self.enter_disconnected(QueueFate::Fail(e.clone())).await;
                        if let Some(rotation) = rotation {
                            self.complete_rotation(rotation, Err(e.into()));
                        }
                    }
                }
            }
        }
    }

    async fn finish_connect_success(&mut self) {
        let opens: Vec<Done<ConnectResult>> = self.pending_open.drain(..).collect();
        let rotation = self.pending_rotation.take();
        self.transition(SessionState::Connected).await;
        for d in opens {
            let _ = d.send(Ok(ConnectResult::Connected));
        }
        if let Some(rotation) = rotation {
            // The result reports reconnected=false even on this path; the
            // flag mirrors what callers have always observed.
            self.complete_rotation(rotation, Ok(SasUpdated { reconnected: false }));
        }
    }

    fn complete_rotation(
        &mut self,
        rotation: PendingRotation,
        result: Result<SasUpdated, ClientError>,
    ) {
        let succeeded = result.is_ok();
        match rotation.done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(error = %e, "automatic credential rotation failed");
                    let _ = self.events.send(ClientEvent::Error(e));
                }
            }
        }
        if succeeded {
            let _ = self.internal.send(InternalEvent::CredentialUpdated);
        }
    }

    // ------------------------------------------------------------------
    // Asynchronous inputs
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, ev: TransportEvent) {
        let TransportEvent::Disconnected(cause) = ev;
        match self.state {
            SessionState::Connected => {
                debug!(error = %cause, "spontaneous transport disconnect");
                self.transport_events = None;
                // The queue survives; it replays when a later open connects.
                self.enter_disconnected(QueueFate::Keep).await;
                let _ = self.events.send(ClientEvent::Disconnected { cause });
            }
            _ => {
                // Mid-transition events resolve through the in-flight call's
                // own completion; acting here would double-transition.
                debug!(state = ?self.state, "ignoring transport disconnect event");
            }
        }
    }

    fn handle_receiver_event(&mut self, ev: ReceiverEvent) {
        match ev {
            ReceiverEvent::Message(msg) => self.subs.deliver_message(msg),
            ReceiverEvent::Method(req) => match self.subs.method_handler(&req.name) {
                Some(handler) => {
                    let transport = self.transport.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let response = handler.handle(req).await;
                        if let Err(e) = transport.send_method_response(response).await {
                            warn!(error = %e, "failed to send method response");
                            let _ = events.send(ClientEvent::Error(e.into()));
                        }
                    });
                }
                None => {
                    debug!(method = %req.name, "no handler registered, dropping invocation");
                }
            },
            ReceiverEvent::Error(e) => {
                warn!(error = %e, "receiver error");
                let _ = self.events.send(ClientEvent::Error(e.into()));
            }
        }
    }

    async fn handle_renewal(&mut self) {
        self.renewal_at = None;
        let minted = match &self.conn_str {
            Some(cs) => match cs.shared_access_key.as_deref() {
                Some(key) => SharedAccessSignature::mint(&cs.resource_uri(), key),
                None => {
                    warn!("renewal fired without a shared access key");
                    return;
                }
            },
            None => {
                warn!("renewal fired without a cached connection string");
                return;
            }
        };
        match minted {
            Ok(sas) => {
                debug!(expiry = sas.expiry, "renewal timer fired, rotating credential");
                self.dispatch(Command::UpdateCredential {
                    sas: sas.raw,
                    done: None,
                })
                .await;
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(ClientError::Auth(e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HubClient;
    use crate::harness::{TestTransport, TransportCall};

    const CONN_STR: &str =
        "HostName=myhub.wirehub.net;DeviceId=dev-1;SharedAccessKey=c2VjcmV0LWtleQ==";

    fn client_over(transport: &TestTransport) -> HubClient {
        HubClient::new(Arc::new(transport.clone()))
    }

    async fn states_until(
        rx: &mut broadcast::Receiver<InternalEvent>,
        target: SessionState,
    ) -> Vec<SessionState> {
        let mut states = Vec::new();
        loop {
            match rx.recv().await.expect("internal channel open") {
                InternalEvent::StateChanged(s) => {
                    states.push(s);
                    if s == target {
                        return states;
                    }
                }
                InternalEvent::CredentialUpdated => {}
            }
        }
    }

    #[tokio::test]
    async fn open_connects_and_installs_disconnect_listener() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        let mut internal = client.subscribe_internal();

        let result = client.open().await.unwrap();
        assert_eq!(result, ConnectResult::Connected);
        assert_eq!(transport.connect_count(), 1);

        let states = states_until(&mut internal, SessionState::Connected).await;
        assert_eq!(
            states,
            vec![SessionState::Connecting, SessionState::Connected]
        );

        // The disconnect listener is live once connected.
        assert!(transport.emit_disconnect(TransportError::Other("probe".into())));
    }

    #[tokio::test]
    async fn open_on_connectionless_transport_reports_connected() {
        let mut caps = crate::transport::TransportCapabilities::all();
        caps.connect = false;
        caps.disconnect = false;
        let transport = TestTransport::new().with_capabilities(caps);
        let client = client_over(&transport);

        assert_eq!(client.open().await.unwrap(), ConnectResult::Connected);
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_connecting_is_sent_after_connect() {
        let transport = TestTransport::new().with_connect_delay(Duration::from_millis(10));
        let client = client_over(&transport);

        let (open, sent) = tokio::join!(
            client.open(),
            client.send_event(Message::new("a").with_message_id("msg-a")),
        );
        open.unwrap();
        assert_eq!(sent.unwrap(), SendResult::Enqueued);

        let calls = transport.calls();
        let connect_at = calls
            .iter()
            .position(|c| matches!(c, TransportCall::Connect))
            .unwrap();
        let send_at = calls
            .iter()
            .position(|c| matches!(c, TransportCall::SendEvent(_)))
            .unwrap();
        assert!(connect_at < send_at);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_commands_replay_in_issue_order() {
        let transport = TestTransport::new().with_connect_delay(Duration::from_millis(10));
        let client = client_over(&transport);

        let (open, a, b) = tokio::join!(
            client.open(),
            client.send_event(Message::new("a").with_message_id("a")),
            client.send_event(Message::new("b").with_message_id("b")),
        );
        open.unwrap();
        a.unwrap();
        b.unwrap();

        let sends: Vec<String> = transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::SendEvent(m) => m.message_id,
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn close_when_disconnected_never_touches_the_transport() {
        let transport = TestTransport::new();
        let client = client_over(&transport);

        assert_eq!(client.close().await.unwrap(), ConnectResult::Disconnected);
        assert_eq!(client.close().await.unwrap(), ConnectResult::Disconnected);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_auto_open_fails_the_queued_caller_without_retry() {
        let transport = TestTransport::new();
        transport.queue_connect_result(Err(TransportError::ConnectFailed("refused".into())));
        let client = client_over(&transport);

        // send_event in disconnected defers and triggers a self-open.
        let err = client.send_event(Message::new("x")).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::ConnectFailed(_))
        ));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn open_failure_completes_the_caller_with_the_error() {
        let transport = TestTransport::new();
        transport.queue_connect_result(Err(TransportError::ConnectFailed("refused".into())));
        let client = client_over(&transport);

        assert!(client.open().await.is_err());
        // A later open with a healthy transport succeeds.
        assert_eq!(client.open().await.unwrap(), ConnectResult::Connected);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn rotation_with_reconnect_walks_the_full_state_path() {
        let transport = TestTransport::new();
        let client =
            HubClient::from_connection_string(Arc::new(transport.clone()), CONN_STR).unwrap();
        let mut internal = client.subscribe_internal();

        client.open().await.unwrap();
        states_until(&mut internal, SessionState::Connected).await;
        assert_eq!(transport.connect_count(), 1);

        transport.queue_credential_result(Ok(CredentialUpdate {
            needs_reconnect: true,
        }));
        let sas = "SharedAccessSignature sr=myhub.wirehub.net%2Fdevices%2Fdev-1&sig=abc&se=99";
        let updated = client.update_credential(sas).await.unwrap();
        assert_eq!(updated, SasUpdated { reconnected: false });

        // Exactly one extra connect happened before the rotation completed.
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.max_connects_in_flight(), 1);

        let states = states_until(&mut internal, SessionState::Connected).await;
        assert_eq!(
            states,
            vec![
                SessionState::UpdatingSas,
                SessionState::Connecting,
                SessionState::Connected
            ]
        );
    }

    #[tokio::test]
    async fn rotation_without_reconnect_stays_connected() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        client.open().await.unwrap();

        let sas = "SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1";
        let updated = client.update_credential(sas).await.unwrap();
        assert_eq!(updated, SasUpdated { reconnected: false });
        assert_eq!(transport.connect_count(), 1);
        assert!(matches!(
            transport.calls().last(),
            Some(TransportCall::UpdateCredential(s)) if s == sas
        ));
    }

    #[tokio::test]
    async fn rotation_failure_collapses_to_disconnected() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        let mut internal = client.subscribe_internal();
        client.open().await.unwrap();
        states_until(&mut internal, SessionState::Connected).await;

        transport.queue_credential_result(Err(TransportError::Other("rejected".into())));
        let err = client
            .update_credential("SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));

        let states = states_until(&mut internal, SessionState::Disconnected).await;
        assert_eq!(
            states,
            vec![SessionState::UpdatingSas, SessionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn update_credential_while_disconnected_forwards_without_transition() {
        let transport = TestTransport::new();
        let client = client_over(&transport);

        let updated = client
            .update_credential("SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1")
            .await
            .unwrap();
        assert_eq!(updated, SasUpdated { reconnected: false });
        // Only the credential call; no connect, no state changes.
        assert_eq!(transport.connect_count(), 0);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn spontaneous_disconnect_emits_event_and_tears_down_receiver() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        let mut events = client.events();

        client.open().await.unwrap();
        let _sub = client.subscribe_messages().await.unwrap();
        assert_eq!(transport.get_receiver_count(), 1);

        assert!(transport.emit_disconnect(TransportError::Disconnected("link lost".into())));
        match events.recv().await.unwrap() {
            ClientEvent::Disconnected { cause } => {
                assert_eq!(cause, TransportError::Disconnected("link lost".into()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The receiver the session held is gone.
        assert!(!transport.inject_message(Message::new("late")));
    }

    #[tokio::test]
    async fn reopen_after_spontaneous_disconnect_reattaches_receiver() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        let mut events = client.events();

        client.open().await.unwrap();
        let _sub = client.subscribe_messages().await.unwrap();
        transport.emit_disconnect(TransportError::Disconnected("link lost".into()));
        events.recv().await.unwrap();

        client.open().await.unwrap();
        // Interest survived the disconnect, so entry re-attaches.
        assert_eq!(transport.get_receiver_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_aborts_the_open() {
        let transport = TestTransport::new().with_connect_delay(Duration::from_millis(500));
        let client = client_over(&transport);

        let (open, close) = tokio::join!(client.open(), client.close());
        assert!(matches!(open.unwrap_err(), ClientError::Closed));
        assert_eq!(close.unwrap(), ConnectResult::Disconnected);

        // Let the abandoned connect resolve; its stale completion must not
        // resurrect the session, and the unwanted link is dropped.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.close().await.unwrap(), ConnectResult::Disconnected);
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Disconnect)));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_timer_rotates_automatically() {
        let transport = TestTransport::new();
        let client =
            HubClient::from_connection_string(Arc::new(transport.clone()), CONN_STR).unwrap();
        let mut internal = client.subscribe_internal();

        client.open().await.unwrap();
        states_until(&mut internal, SessionState::Connected).await;

        tokio::time::advance(SAS_RENEWAL_INTERVAL + Duration::from_secs(1)).await;

        // The timer-driven rotation completes and notifies subsystems.
        loop {
            if let InternalEvent::CredentialUpdated = internal.recv().await.unwrap() {
                break;
            }
        }
        let minted = transport.calls().into_iter().find_map(|c| match c {
            TransportCall::UpdateCredential(s) => Some(s),
            _ => None,
        });
        let minted = minted.expect("rotation reached the transport");
        assert!(minted.starts_with("SharedAccessSignature sr="));
        assert!(minted.contains("myhub.wirehub.net%2Fdevices%2Fdev-1"));
    }

    #[tokio::test]
    async fn open_issued_while_disconnecting_reopens_after_close() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        client.open().await.unwrap();

        let (close, reopen) = tokio::join!(client.close(), client.open());
        assert_eq!(close.unwrap(), ConnectResult::Disconnected);
        assert_eq!(reopen.unwrap(), ConnectResult::Connected);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_closes_both_complete() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        client.open().await.unwrap();

        let (first, second) = tokio::join!(client.close(), client.close());
        assert_eq!(first.unwrap(), ConnectResult::Disconnected);
        assert_eq!(second.unwrap(), ConnectResult::Disconnected);
        // One transport disconnect serves both callers.
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|c| matches!(c, TransportCall::Disconnect))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn get_twin_from_disconnected_auto_opens_and_caches() {
        let transport = TestTransport::new();
        let client = client_over(&transport);

        let twin = client.get_twin().await.unwrap();
        assert_eq!(transport.connect_count(), 1);

        let again = client.get_twin().await.unwrap();
        assert!(Arc::ptr_eq(&twin, &again));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn rotation_propagates_to_twin() {
        let transport = TestTransport::new();
        let client = client_over(&transport);
        client.open().await.unwrap();
        let twin = client.get_twin().await.unwrap();

        let sas = "SharedAccessSignature sr=h%2Fdevices%2Fd&sig=s&se=1";
        client.update_credential(sas).await.unwrap();
        assert_eq!(twin.last_credential().as_deref(), Some(sas));

        // Let the twin's channel listener drain the completion notice; one
        // rotation counts exactly once.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(twin.refresh_count(), 1);
    }
}
