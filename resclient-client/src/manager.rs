//! The client manager: a single task owning every piece of mutable state
//! (request table, resource cache, stale set, connection state machine).
//! Frontends talk to it over an instruction channel; timers and the
//! on-connect hook report back over an internal channel. All cache
//! mutation happens inside this task's turns, which is what makes the
//! single-writer model of the cache sound.

use std::{collections::BTreeMap, mem, sync::Arc, time::Duration};

use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, StreamExt};
use serde_json::value::{to_raw_value, RawValue};
use tracing::{debug, error, trace};

use resclient_core::{Pattern, Request, ResError, ResourceSet, Rid, ServerMessage};

use crate::{
    cache::{Cache, Factory, ListenerRemoval, NewResult},
    client::{OnConnect, ResClient},
    errors::ClientError,
    events::{ClientEvent, EventBus, ListenerId, ResourceEvent},
    resource::{Collection, Model, Resource},
    ws::{BackendDriver, Connector},
};

/// Delay before a stale resource is resubscribed, absorbing flapping.
pub(crate) const SUBSCRIBE_STALE_DELAY: Duration = Duration::from_millis(2000);
/// Delay before a reconnect attempt after a connection loss.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Instructions for the manager, from frontends and from its own timers.
pub(crate) enum Instruction {
    Get {
        rid: Rid,
        sender: oneshot::Sender<Result<Resource, ClientError>>,
    },
    Call {
        rid: Rid,
        method: String,
        params: Option<Box<RawValue>>,
        sender: oneshot::Sender<Result<serde_json::Value, ClientError>>,
    },
    Auth {
        rid: Rid,
        method: String,
        params: Option<Box<RawValue>>,
        sender: oneshot::Sender<Result<serde_json::Value, ClientError>>,
    },
    New {
        rid: Rid,
        params: Option<Box<RawValue>>,
        sender: oneshot::Sender<Result<Resource, ClientError>>,
    },
    ResourceOn {
        rid: Rid,
        filter: Option<String>,
        sender: oneshot::Sender<
            Result<(ListenerId, mpsc::UnboundedReceiver<ResourceEvent>), ClientError>,
        >,
    },
    ResourceOff {
        rid: Rid,
        id: ListenerId,
        sender: oneshot::Sender<Result<(), ClientError>>,
    },
    Connect {
        sender: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect,
    RegisterModelType {
        pattern: Pattern,
        factory: Factory<Model>,
    },
    UnregisterModelType {
        pattern: Pattern,
    },
    RegisterCollectionType {
        pattern: Pattern,
        factory: Factory<Collection>,
    },
    UnregisterCollectionType {
        pattern: Pattern,
    },
    // a stale-resubscribe timer fired; staleness is re-checked now
    SubscribeStale {
        rid: Rid,
    },
    // the reconnect timer fired
    Reconnect,
    // the on-connect hook settled
    HookDone {
        result: Result<(), ClientError>,
    },
}

enum PendingKind {
    Subscribe { rid: Rid },
    Unsubscribe { rid: Rid },
    Call { sender: oneshot::Sender<Result<serde_json::Value, ClientError>> },
    Auth { sender: oneshot::Sender<Result<serde_json::Value, ClientError>> },
    New { sender: oneshot::Sender<Result<Resource, ClientError>> },
}

/// An outbound request awaiting its response.
struct InFlight {
    method: String,
    params: Option<Box<RawValue>>,
    kind: PendingKind,
}

impl InFlight {
    fn serialize_raw(&self, id: u64) -> Result<Box<RawValue>, serde_json::Error> {
        to_raw_value(&Request::new(id, &self.method, self.params.clone()))
    }
}

enum ConnState {
    Disconnected,
    Open { backend: BackendDriver, hook_done: bool },
}

enum Turn {
    Backend(Option<ServerMessage>),
    BackendError,
    Inst(Option<Instruction>),
}

/// Owns the connection, the request table and the cache; see module docs.
pub(crate) struct ClientManager {
    // next request id
    id: u64,
    conn: ConnState,
    connector: Box<dyn Connector>,
    // requests for which a response has not been received
    reqs: BTreeMap<u64, InFlight>,
    // requests issued while disconnected, flushed once connected
    queued: Vec<u64>,
    // `connect()` calls awaiting the connect-and-hook sequence
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    cache: Cache,
    try_connect: bool,
    reconnect_scheduled: bool,
    on_connect: Option<OnConnect>,
    // frontend instructions; the manager exits when this closes
    instructions: mpsc::UnboundedReceiver<Instruction>,
    // timers and the hook report back here, so they never keep the
    // frontend channel alive
    internal: mpsc::UnboundedReceiver<Instruction>,
    internal_tx: mpsc::UnboundedSender<Instruction>,
    bus: Arc<EventBus>,
    namespace: String,
}

impl ClientManager {
    pub(crate) fn new(
        connector: Box<dyn Connector>,
        on_connect: Option<OnConnect>,
        bus: Arc<EventBus>,
        namespace: String,
        instructions: mpsc::UnboundedReceiver<Instruction>,
    ) -> Self {
        let (internal_tx, internal) = mpsc::unbounded();
        Self {
            id: 0,
            conn: ConnState::Disconnected,
            connector,
            reqs: BTreeMap::new(),
            queued: Vec::new(),
            connect_waiters: Vec::new(),
            cache: Cache::new(bus.clone(), namespace.clone()),
            try_connect: false,
            reconnect_scheduled: false,
            on_connect,
            instructions,
            internal,
            internal_tx,
            bus,
            namespace,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.id += 1;
        self.id
    }

    pub(crate) fn spawn(mut self) {
        tokio::spawn(async move {
            self.run().await;
            if let ConnState::Open { backend, .. } =
                mem::replace(&mut self.conn, ConnState::Disconnected)
            {
                backend.shutdown();
            }
        });
    }

    async fn run(&mut self) {
        loop {
            let turn = if let ConnState::Open { backend, .. } = &mut self.conn {
                select_biased! {
                    item = backend.to_handle.next() => Turn::Backend(item),
                    _ = &mut backend.error => Turn::BackendError,
                    inst = self.internal.next() => Turn::Inst(inst),
                    inst = self.instructions.next() => Turn::Inst(inst),
                }
            } else {
                select_biased! {
                    inst = self.internal.next() => Turn::Inst(inst),
                    inst = self.instructions.next() => Turn::Inst(inst),
                }
            };
            match turn {
                Turn::Backend(Some(msg)) => self.handle_message(msg),
                Turn::Backend(None) => {
                    self.handle_close(ResError::connection_error(ClientError::UnexpectedClose))
                }
                Turn::BackendError => {
                    let err = ResError::connection_error(ClientError::UnexpectedClose);
                    self.emit_error(&err);
                    self.handle_close(err);
                }
                Turn::Inst(Some(inst)) => self.handle_instruction(inst).await,
                // every frontend has dropped
                Turn::Inst(None) => break,
            }
        }
    }

    // ---- inbound frames ------------------------------------------------

    fn handle_message(&mut self, msg: ServerMessage) {
        trace!(%msg, "handling frame");
        match msg {
            ServerMessage::Result { id, result } => self.handle_result(id, result),
            ServerMessage::Error { id, error } => self.handle_error(id, error),
            ServerMessage::Event { event, data } => {
                if let Err(err) = self.cache.handle_event(&event, data.as_deref()) {
                    error!(event = %event, err = %err, "failed to apply event");
                }
                self.schedule_new_stale();
            }
        }
    }

    fn handle_result(&mut self, id: u64, result: Option<Box<RawValue>>) {
        let Some(inflight) = self.reqs.remove(&id) else {
            error!(id, "response without matching request");
            return;
        };
        match inflight.kind {
            PendingKind::Subscribe { rid } => {
                let set = match result {
                    Some(raw) => match serde_json::from_str::<ResourceSet>(raw.get()) {
                        Ok(set) => set,
                        Err(e) => {
                            error!(rid = %rid, err = %e, "malformed subscribe response");
                            self.cache.fail_subscribe(
                                &rid,
                                ResError::new(
                                    resclient_core::codes::UNKNOWN_ERROR,
                                    "malformed subscribe response",
                                ),
                            );
                            self.schedule_new_stale();
                            return;
                        }
                    },
                    None => ResourceSet::default(),
                };
                self.cache.handle_subscribe_response(&rid, set);
                self.schedule_new_stale();
            }
            PendingKind::Unsubscribe { rid } => {
                self.cache.confirm_unsubscribed(&rid);
                self.schedule_new_stale();
            }
            PendingKind::Call { sender } | PendingKind::Auth { sender } => {
                let value = match result {
                    Some(raw) => {
                        serde_json::from_str(raw.get()).map_err(ClientError::from)
                    }
                    None => Ok(serde_json::Value::Null),
                };
                let _ = sender.send(value);
            }
            PendingKind::New { sender } => {
                let outcome = match result {
                    Some(raw) => serde_json::from_str::<NewResult>(raw.get())
                        .map_err(ClientError::from)
                        .and_then(|new| self.cache.handle_new_response(new)),
                    None => Err(ClientError::Protocol(
                        "new response missing its result".to_owned(),
                    )),
                };
                let _ = sender.send(outcome);
                self.schedule_new_stale();
            }
        }
    }

    fn handle_error(&mut self, id: u64, error: ResError) {
        let Some(inflight) = self.reqs.remove(&id) else {
            error!(id, "error response without matching request");
            return;
        };
        match inflight.kind {
            // subscription failures reject the `get` but are not client
            // errors
            PendingKind::Subscribe { rid } => {
                self.cache.fail_subscribe(&rid, error);
                self.schedule_new_stale();
            }
            PendingKind::Unsubscribe { rid } => {
                // the server refused; the subscription stands
                debug!(rid = %rid, err = %error, "unsubscribe rejected");
            }
            PendingKind::Call { sender } | PendingKind::Auth { sender } => {
                self.emit_error(&error);
                let _ = sender.send(Err(ClientError::Res(error)));
            }
            PendingKind::New { sender } => {
                self.emit_error(&error);
                let _ = sender.send(Err(ClientError::Res(error)));
            }
        }
    }

    // ---- instructions --------------------------------------------------

    async fn handle_instruction(&mut self, inst: Instruction) {
        match inst {
            Instruction::Get { rid, sender } => {
                if self.cache.get_or_fetch(&rid, sender) {
                    let method = format!("subscribe.{rid}");
                    if self.queue_request(method, None, PendingKind::Subscribe { rid }) {
                        self.ensure_connected().await;
                    }
                }
            }
            Instruction::Call { rid, method, params, sender } => {
                let method = format!("call.{rid}.{method}");
                if self.queue_request(method, params, PendingKind::Call { sender }) {
                    self.ensure_connected().await;
                }
            }
            Instruction::Auth { rid, method, params, sender } => {
                let method = format!("auth.{rid}.{method}");
                if self.queue_request(method, params, PendingKind::Auth { sender }) {
                    self.ensure_connected().await;
                }
            }
            Instruction::New { rid, params, sender } => {
                let method = format!("new.{rid}");
                if self.queue_request(method, params, PendingKind::New { sender }) {
                    self.ensure_connected().await;
                }
            }
            Instruction::ResourceOn { rid, filter, sender } => {
                let _ = sender.send(self.cache.add_listener(&rid, filter.as_deref()));
            }
            Instruction::ResourceOff { rid, id, sender } => {
                match self.cache.remove_listener(&rid, id) {
                    Ok(ListenerRemoval::SendUnsubscribe) => {
                        let method = format!("unsubscribe.{rid}");
                        if self.queue_request(method, None, PendingKind::Unsubscribe { rid }) {
                            self.ensure_connected().await;
                        }
                        let _ = sender.send(Ok(()));
                    }
                    Ok(ListenerRemoval::Classified) => {
                        self.schedule_new_stale();
                        let _ = sender.send(Ok(()));
                    }
                    Ok(_) => {
                        let _ = sender.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                    }
                }
            }
            Instruction::Connect { sender } => {
                self.try_connect = true;
                match &self.conn {
                    ConnState::Open { hook_done: true, .. } => {
                        let _ = sender.send(Ok(()));
                    }
                    ConnState::Open { .. } => self.connect_waiters.push(sender),
                    ConnState::Disconnected => {
                        self.connect_waiters.push(sender);
                        self.ensure_connected().await;
                    }
                }
            }
            Instruction::Disconnect => self.disconnect(),
            Instruction::RegisterModelType { pattern, factory } => {
                self.cache.register_model_type(pattern, factory);
            }
            Instruction::UnregisterModelType { pattern } => {
                self.cache.unregister_model_type(&pattern);
            }
            Instruction::RegisterCollectionType { pattern, factory } => {
                self.cache.register_collection_type(pattern, factory);
            }
            Instruction::UnregisterCollectionType { pattern } => {
                self.cache.unregister_collection_type(&pattern);
            }
            Instruction::SubscribeStale { rid } => {
                if matches!(self.conn, ConnState::Open { .. })
                    && self.cache.begin_resubscribe(&rid)
                {
                    let method = format!("subscribe.{rid}");
                    let _ = self.queue_request(method, None, PendingKind::Subscribe { rid });
                }
            }
            Instruction::Reconnect => {
                self.reconnect_scheduled = false;
                if self.try_connect
                    && matches!(self.conn, ConnState::Disconnected)
                    && !self.cache.is_empty()
                {
                    self.ensure_connected().await;
                }
            }
            Instruction::HookDone { result } => match result {
                Ok(()) => self.finish_connect(),
                Err(err) => {
                    // consumed silently on the connect path; the close
                    // triggers another cycle
                    debug!(err = %err, "on-connect hook failed, closing transport");
                    self.handle_close(ResError::connection_error(err));
                }
            },
        }
    }

    // ---- outbound requests ---------------------------------------------

    /// Registers the request and dispatches it if the socket is open,
    /// else queues it. Returns true if a connect must be initiated.
    fn queue_request(
        &mut self,
        method: String,
        params: Option<Box<RawValue>>,
        kind: PendingKind,
    ) -> bool {
        let id = self.next_id();
        self.reqs.insert(id, InFlight { method, params, kind });
        match self.conn {
            ConnState::Open { .. } => {
                self.dispatch(id);
                false
            }
            ConnState::Disconnected => {
                self.queued.push(id);
                true
            }
        }
    }

    fn dispatch(&mut self, id: u64) {
        let Some(inflight) = self.reqs.get(&id) else { return };
        match inflight.serialize_raw(id) {
            Ok(raw) => {
                debug!(id, method = %inflight.method, "dispatching request");
                if let ConnState::Open { backend, .. } = &self.conn {
                    if backend.dispatcher.unbounded_send(raw).is_err() {
                        // backend is gone; its error notice follows
                        error!(id, "dispatch channel dead");
                    }
                }
            }
            Err(e) => {
                error!(id, err = %e, "failed to serialize request");
                if let Some(inflight) = self.reqs.remove(&id) {
                    self.fail_request(
                        inflight.kind,
                        ResError::new(resclient_core::codes::UNKNOWN_ERROR, e.to_string()),
                    );
                }
            }
        }
    }

    fn fail_request(&mut self, kind: PendingKind, err: ResError) {
        match kind {
            PendingKind::Subscribe { rid } => {
                self.cache.fail_subscribe(&rid, err);
                self.schedule_new_stale();
            }
            PendingKind::Unsubscribe { .. } => {}
            PendingKind::Call { sender } | PendingKind::Auth { sender } => {
                let _ = sender.send(Err(ClientError::Res(err)));
            }
            PendingKind::New { sender } => {
                let _ = sender.send(Err(ClientError::Res(err)));
            }
        }
    }

    // ---- connection lifecycle ------------------------------------------

    async fn ensure_connected(&mut self) {
        if !matches!(self.conn, ConnState::Disconnected) {
            return;
        }
        self.try_connect = true;
        debug!("connecting");
        match self.connector.connect().await {
            Ok(backend) => {
                self.conn = ConnState::Open { backend, hook_done: false };
                match &self.on_connect {
                    Some(hook) => {
                        let fut = hook(self.frontend());
                        let tx = self.internal_tx.clone();
                        tokio::spawn(async move {
                            let result = fut.await;
                            let _ = tx.unbounded_send(Instruction::HookDone { result });
                        });
                    }
                    None => self.finish_connect(),
                }
            }
            Err(err) => {
                error!(err = %err, "connect failed");
                let err = ResError::connection_error(err);
                self.emit_error(&err);
                self.settle_disconnected(err);
            }
        }
    }

    /// The socket is open and the hook has resolved: flush queued sends,
    /// resolve connect waiters, and resubscribe everything stale.
    fn finish_connect(&mut self) {
        match &mut self.conn {
            ConnState::Open { hook_done, .. } => *hook_done = true,
            ConnState::Disconnected => return,
        }
        debug!("connected");
        for id in mem::take(&mut self.queued) {
            self.dispatch(id);
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.bus.emit_client(&self.namespace, &ClientEvent::Connect);
        // the stale-subscribe delay does not apply here; recovery starts
        // as soon as the hook resolves
        for rid in self.cache.stale_rids() {
            if self.cache.begin_resubscribe(&rid) {
                let method = format!("subscribe.{rid}");
                let _ = self.queue_request(method, None, PendingKind::Subscribe { rid });
            }
        }
    }

    /// Tears down an open connection: fails dispatched requests, sweeps
    /// every subscription stale, and schedules recovery when warranted.
    fn handle_close(&mut self, err: ResError) {
        let was_open = match mem::replace(&mut self.conn, ConnState::Disconnected) {
            ConnState::Open { backend, .. } => {
                backend.shutdown();
                true
            }
            ConnState::Disconnected => false,
        };

        // dispatched requests are settled now; queued ones may survive
        // for the next cycle
        let reqs = mem::take(&mut self.reqs);
        for (id, inflight) in reqs {
            if self.queued.contains(&id) {
                self.reqs.insert(id, inflight);
                continue;
            }
            match inflight.kind {
                PendingKind::Subscribe { rid } => self.cache.fail_subscribe_closed(&rid, &err),
                other => self.fail_request(other, err.clone()),
            }
        }

        // every subscribed resource goes stale; classification evicts the
        // unanchored ones
        self.cache.mark_all_stale();
        // no timers while disconnected; the reconnect path resubscribes
        let _ = self.cache.take_new_stale();

        if was_open {
            self.bus.emit_client(&self.namespace, &ClientEvent::Close);
        }
        self.settle_disconnected(err);
    }

    // Decides between scheduling a reconnect and rejecting everything
    // that was waiting on this connection.
    fn settle_disconnected(&mut self, err: ResError) {
        if self.try_connect && !self.cache.is_empty() {
            if !self.reconnect_scheduled {
                self.reconnect_scheduled = true;
                self.schedule(RECONNECT_DELAY, Instruction::Reconnect);
            }
            return;
        }
        for id in mem::take(&mut self.queued) {
            if let Some(inflight) = self.reqs.remove(&id) {
                self.fail_request(inflight.kind, err.clone());
            }
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Res(err.clone())));
        }
    }

    fn disconnect(&mut self) {
        debug!("disconnect requested");
        self.try_connect = false;
        match self.conn {
            ConnState::Open { .. } => self.handle_close(ResError::disconnect()),
            ConnState::Disconnected => self.settle_disconnected(ResError::disconnect()),
        }
    }

    // ---- helpers -------------------------------------------------------

    fn frontend(&self) -> ResClient {
        ResClient::from_parts(self.internal_tx.clone(), self.bus.clone(), self.namespace.clone())
    }

    fn emit_error(&self, err: &ResError) {
        self.bus.emit_client(&self.namespace, &ClientEvent::Error(err.clone()));
    }

    fn schedule(&self, delay: Duration, inst: Instruction) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.unbounded_send(inst);
        });
    }

    // Schedules a delayed resubscription for every RID the cache staled
    // since the last turn. The timer re-checks staleness when it fires.
    fn schedule_new_stale(&mut self) {
        for rid in self.cache.take_new_stale() {
            if matches!(self.conn, ConnState::Open { .. }) {
                self.schedule(SUBSCRIBE_STALE_DELAY, Instruction::SubscribeStale { rid });
            }
        }
    }
}
