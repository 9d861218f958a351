//! In-process mock transport for tests.
//!
//! [`MockServer::new`] returns a connector to plug into the client
//! builder and a server handle. Each connect attempt surfaces as a
//! [`MockConn`] the test drives: pop request frames, push responses and
//! events, or drop the connection.
//!
//! ```no_run
//! # async fn example() {
//! use resclient_client::{mock::MockServer, ResClient};
//!
//! let (connector, mut server) = MockServer::new();
//! let client = ResClient::builder("ws://mock").connector(connector).build();
//!
//! let get = tokio::spawn({
//!     let client = client.clone();
//!     async move { client.get("example.model").await }
//! });
//! let mut conn = server.accept().await.unwrap();
//! let req = conn.next_request().await.unwrap();
//! conn.result(req.id, serde_json::json!({"models": {"example.model": {"msg": "hi"}}}));
//! # let _ = get;
//! # }
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::value::RawValue;

use resclient_core::{ResError, ServerMessage};

use crate::{
    errors::ClientError,
    ws::{BackendDriver, Connector},
};

/// A request frame the client put on the wire.
#[derive(Debug, Deserialize)]
pub struct MockRequest {
    /// The request id, to be echoed in the response.
    pub id: u64,
    /// The full method string, e.g. `"subscribe.example.model"`.
    pub method: String,
    /// The request parameters, if any.
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// Hands the client a fresh in-process backend per connect attempt.
pub struct MockConnector {
    conns: mpsc::UnboundedSender<MockConn>,
    fail_next: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&mut self) -> Result<BackendDriver, ClientError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Transport(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            ));
        }
        let (handle, driver) = BackendDriver::channel();
        let conn = MockConn {
            handler: handle.handler,
            error: Some(handle.error),
            to_dispatch: handle.to_dispatch,
            shutdown: handle.shutdown,
        };
        self.conns
            .unbounded_send(conn)
            .map_err(|_| ClientError::Transport(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            ))?;
        Ok(driver)
    }
}

/// The server side of the mock transport.
pub struct MockServer {
    incoming: mpsc::UnboundedReceiver<MockConn>,
    fail_next: Arc<AtomicUsize>,
}

impl MockServer {
    /// Creates a connector/server pair.
    pub fn new() -> (MockConnector, MockServer) {
        let (tx, rx) = mpsc::unbounded();
        let fail_next = Arc::new(AtomicUsize::new(0));
        (
            MockConnector { conns: tx, fail_next: fail_next.clone() },
            MockServer { incoming: rx, fail_next },
        )
    }

    /// Waits for the client's next connect attempt. `None` once the
    /// client is gone.
    pub async fn accept(&mut self) -> Option<MockConn> {
        self.incoming.next().await
    }

    /// Makes the next `n` connect attempts fail with a transport error.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

/// One accepted mock connection.
pub struct MockConn {
    handler: mpsc::UnboundedSender<ServerMessage>,
    error: Option<oneshot::Sender<()>>,
    to_dispatch: mpsc::UnboundedReceiver<Box<RawValue>>,
    shutdown: oneshot::Receiver<()>,
}

impl MockConn {
    /// Pops the next request frame the client dispatched. `None` when
    /// the client shut this connection down.
    pub async fn next_request(&mut self) -> Option<MockRequest> {
        let raw = self.to_dispatch.next().await?;
        match serde_json::from_str(raw.get()) {
            Ok(req) => Some(req),
            Err(e) => panic!("client dispatched a malformed frame {raw}: {e}"),
        }
    }

    /// Pushes a raw frame to the client, going through the real frame
    /// parser.
    pub fn send(&self, frame: serde_json::Value) {
        let msg: ServerMessage = serde_json::from_str(&frame.to_string())
            .unwrap_or_else(|e| panic!("invalid mock frame {frame}: {e}"));
        let _ = self.handler.unbounded_send(msg);
    }

    /// Responds successfully to `id` with `result`.
    pub fn result(&self, id: u64, result: serde_json::Value) {
        self.send(serde_json::json!({ "id": id, "result": result }));
    }

    /// Responds successfully to `id` with no result payload.
    pub fn ack(&self, id: u64) {
        self.send(serde_json::json!({ "id": id }));
    }

    /// Responds to `id` with an error.
    pub fn error(&self, id: u64, error: ResError) {
        self.send(serde_json::json!({ "id": id, "error": error }));
    }

    /// Pushes an event for the resource.
    pub fn event(&self, rid: &str, name: &str, data: serde_json::Value) {
        self.send(serde_json::json!({ "event": format!("{rid}.{name}"), "data": data }));
    }

    /// Drops the connection with a transport error, as a network failure
    /// would.
    pub fn close(&mut self) {
        if let Some(error) = self.error.take() {
            let _ = error.send(());
        }
    }

    /// True if the client ordered this connection shut down.
    pub fn client_shutdown(&mut self) -> bool {
        self.shutdown.try_recv().map(|r| r.is_some()).unwrap_or(true)
    }
}
