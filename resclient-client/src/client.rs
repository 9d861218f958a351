use std::{future::Future, pin::Pin, sync::Arc};

use futures_channel::{mpsc, oneshot};
use serde_json::value::{to_raw_value, RawValue};

use resclient_core::{Pattern, Rid};

use crate::{
    cache::Factory,
    errors::ClientError,
    events::{ClientEvent, EventBus, ListenerId, ResourceEvent},
    manager::{ClientManager, Instruction},
    resource::{Collection, Model, Resource},
    ws::{Connector, WsConnector},
};

/// The on-connect hook: runs after every successful transport open,
/// before connect waiters resolve and before stale resources are
/// resubscribed. Typically used to authenticate the connection.
pub type OnConnect = Arc<
    dyn Fn(ResClient) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>
        + Send
        + Sync,
>;

/// A RES-Client protocol client.
///
/// Cheap to clone; all clones drive the same connection and share the
/// same resource cache. The client is lazy: no socket is opened until an
/// operation needs one, and the connection is recovered automatically
/// while there are resources worth recovering.
///
/// ```no_run
/// # async fn example() -> Result<(), resclient_client::ClientError> {
/// use resclient_client::ResClient;
///
/// let client = ResClient::builder("ws://127.0.0.1:8080").build();
/// let resource = client.get("example.model").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResClient {
    instructions: mpsc::UnboundedSender<Instruction>,
    bus: Arc<EventBus>,
    namespace: String,
}

impl ResClient {
    /// Starts building a client for the host URL. `http`/`https` URLs
    /// are rewritten to `ws`/`wss`.
    pub fn builder(host_url: impl AsRef<str>) -> ResClientBuilder {
        ResClientBuilder {
            connector: Box::new(WsConnector::new(host_url)),
            namespace: "resclient".to_owned(),
            bus: None,
            on_connect: None,
        }
    }

    pub(crate) fn from_parts(
        instructions: mpsc::UnboundedSender<Instruction>,
        bus: Arc<EventBus>,
        namespace: String,
    ) -> Self {
        Self { instructions, bus, namespace }
    }

    /// Gets the resource, subscribing to it on first use. Repeated calls
    /// for the same RID share the in-flight subscription and resolve to
    /// the same cached handle.
    pub async fn get(&self, rid: impl Into<Rid>) -> Result<Resource, ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(Instruction::Get { rid, sender }, rx).await
    }

    /// Calls a method on the resource and resolves with the raw result.
    pub async fn call(
        &self,
        rid: impl Into<Rid>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        ensure_method(method)?;
        let params = raw_params(params)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(
            Instruction::Call { rid, method: method.to_owned(), params, sender },
            rx,
        )
        .await
    }

    /// Sends an authentication request on the resource.
    pub async fn authenticate(
        &self,
        rid: impl Into<Rid>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        ensure_method(method)?;
        let params = raw_params(params)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(
            Instruction::Auth { rid, method: method.to_owned(), params, sender },
            rx,
        )
        .await
    }

    /// Creates a resource. The response is materialized into a
    /// subscribed cache item and returned.
    pub async fn create(
        &self,
        rid: impl Into<Rid>,
        params: Option<serde_json::Value>,
    ) -> Result<Resource, ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        let params = raw_params(params)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(Instruction::New { rid, params, sender }, rx).await
    }

    /// Convenience for `call(rid, "set", props)`. A `None` prop is sent
    /// as the delete sentinel, removing the field.
    pub async fn set_model(
        &self,
        rid: impl Into<Rid>,
        props: impl IntoIterator<Item = (String, Option<serde_json::Value>)>,
    ) -> Result<serde_json::Value, ClientError> {
        let mut map = serde_json::Map::new();
        for (key, value) in props {
            let value = match value {
                Some(v) => v,
                None => serde_json::json!({ "action": "delete" }),
            };
            map.insert(key, value);
        }
        self.call(rid, "set", Some(serde_json::Value::Object(map))).await
    }

    /// Registers a listener for client events (`connect`, `close`,
    /// `error`), optionally filtered to a comma-separated list of names.
    pub fn on(
        &self,
        filter: Option<&str>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<ClientEvent>) {
        self.bus.subscribe_client(&self.namespace, filter)
    }

    /// Removes a client event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe_client(&self.namespace, id)
    }

    /// Registers a listener for the resource's events, anchoring the
    /// resource in the cache until the listener is removed with
    /// [`resource_off`](Self::resource_off). Fails with `system.notFound`
    /// semantics if the RID is not cached.
    ///
    /// Dropping the returned stream without calling `resource_off` keeps
    /// the resource anchored.
    pub async fn resource_on(
        &self,
        rid: impl Into<Rid>,
        filter: Option<&str>,
    ) -> Result<(ListenerId, mpsc::UnboundedReceiver<ResourceEvent>), ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(
            Instruction::ResourceOn { rid, filter: filter.map(str::to_owned), sender },
            rx,
        )
        .await
    }

    /// Removes a resource listener. When the last one goes, the client
    /// unsubscribes from the server and the resource becomes eligible
    /// for eviction.
    pub async fn resource_off(
        &self,
        rid: impl Into<Rid>,
        id: ListenerId,
    ) -> Result<(), ClientError> {
        let rid = rid.into();
        ensure_rid(&rid)?;
        let (sender, rx) = oneshot::channel();
        self.roundtrip(Instruction::ResourceOff { rid, id, sender }, rx).await
    }

    /// Connects explicitly. Resolves once the transport is open and the
    /// on-connect hook has run.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (sender, rx) = oneshot::channel();
        self.roundtrip(Instruction::Connect { sender }, rx).await
    }

    /// Disconnects and stops reconnecting. A pending `connect` is
    /// rejected with a `system.disconnect` error.
    pub fn disconnect(&self) {
        let _ = self.instructions.unbounded_send(Instruction::Disconnect);
    }

    /// Registers a factory constructing the model handle for RIDs
    /// matching the pattern (`*` one segment, trailing `>` the rest).
    pub fn register_model_type<F>(&self, pattern: &str, factory: F) -> Result<(), ClientError>
    where
        F: Fn(&Rid) -> Model + Send + Sync + 'static,
    {
        let pattern = parse_pattern(pattern)?;
        let factory: Factory<Model> = Arc::new(factory);
        self.send(Instruction::RegisterModelType { pattern, factory })
    }

    /// Removes a model factory registration.
    pub fn unregister_model_type(&self, pattern: &str) -> Result<(), ClientError> {
        let pattern = parse_pattern(pattern)?;
        self.send(Instruction::UnregisterModelType { pattern })
    }

    /// Registers a factory constructing the collection handle for RIDs
    /// matching the pattern.
    pub fn register_collection_type<F>(
        &self,
        pattern: &str,
        factory: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&Rid) -> Collection + Send + Sync + 'static,
    {
        let pattern = parse_pattern(pattern)?;
        let factory: Factory<Collection> = Arc::new(factory);
        self.send(Instruction::RegisterCollectionType { pattern, factory })
    }

    /// Removes a collection factory registration.
    pub fn unregister_collection_type(&self, pattern: &str) -> Result<(), ClientError> {
        let pattern = parse_pattern(pattern)?;
        self.send(Instruction::UnregisterCollectionType { pattern })
    }

    /// The event bus this client emits on.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The event-bus namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn send(&self, inst: Instruction) -> Result<(), ClientError> {
        self.instructions.unbounded_send(inst).map_err(|_| ClientError::DeadChannel)
    }

    async fn roundtrip<T>(
        &self,
        inst: Instruction,
        rx: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        self.send(inst)?;
        rx.await.map_err(|_| ClientError::DeadChannel)?
    }
}

impl std::fmt::Debug for ResClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResClient").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

/// Configures and spawns a [`ResClient`].
pub struct ResClientBuilder {
    connector: Box<dyn Connector>,
    namespace: String,
    bus: Option<Arc<EventBus>>,
    on_connect: Option<OnConnect>,
}

impl ResClientBuilder {
    /// Sets the on-connect hook, run after every successful transport
    /// open and before stale resources are resubscribed. A failing hook
    /// closes the transport and triggers another connect cycle.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ResClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |client| Box::pin(hook(client))));
        self
    }

    /// Sets the event-bus namespace. Defaults to `"resclient"`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Shares an external event bus instead of a client-owned one.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Substitutes the transport connector. Used by tests and custom
    /// framings.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Box::new(connector);
        self
    }

    /// Spawns the client manager and returns the frontend.
    pub fn build(self) -> ResClient {
        let bus = self.bus.unwrap_or_default();
        let (tx, rx) = mpsc::unbounded();
        ClientManager::new(self.connector, self.on_connect, bus.clone(), self.namespace.clone(), rx)
            .spawn();
        ResClient { instructions: tx, bus, namespace: self.namespace }
    }
}

impl std::fmt::Debug for ResClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResClientBuilder")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn ensure_rid(rid: &Rid) -> Result<(), ClientError> {
    if rid.is_empty() {
        return Err(ClientError::InvalidArgument("rid must not be empty".to_owned()));
    }
    Ok(())
}

fn ensure_method(method: &str) -> Result<(), ClientError> {
    if method.is_empty() {
        return Err(ClientError::InvalidArgument("method must not be empty".to_owned()));
    }
    Ok(())
}

fn parse_pattern(pattern: &str) -> Result<Pattern, ClientError> {
    Pattern::parse(pattern).map_err(|e| ClientError::InvalidArgument(e.to_string()))
}

fn raw_params(params: Option<serde_json::Value>) -> Result<Option<Box<RawValue>>, ClientError> {
    match params {
        Some(value) => Ok(Some(to_raw_value(&value)?)),
        None => Ok(None),
    }
}
