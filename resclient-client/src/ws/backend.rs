use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, sink::SinkExt, stream::StreamExt, FutureExt};
use serde_json::value::RawValue;
use tokio_tungstenite::{
    tungstenite::{self, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, trace};

use resclient_core::ServerMessage;

pub(crate) type WsStream =
    futures_util::stream::Fuse<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type WsStreamItem = Result<Message, tungstenite::Error>;

/// `BackendDriver` drives a specific transport backend. The manager uses
/// it to dispatch requests, receive inbound frames, observe terminal
/// errors, and shut the backend down.
pub struct BackendDriver {
    /// Parsed frames received from the server.
    pub to_handle: mpsc::UnboundedReceiver<ServerMessage>,
    /// Notification from the backend of a terminal error.
    pub error: oneshot::Receiver<()>,
    /// Serialized requests the backend should put on the wire.
    pub dispatcher: mpsc::UnboundedSender<Box<RawValue>>,
    // notify the backend of intentional shutdown
    shutdown: oneshot::Sender<()>,
}

impl BackendDriver {
    /// Tells the backend to stop. Failure means the backend is already
    /// gone, which is fine.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }

    /// Creates a driver wired to raw channel ends, for transports that
    /// are not a websocket (in-process test servers, custom framings).
    pub fn channel() -> (BackendHandle, BackendDriver) {
        let (handler, to_handle) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            BackendHandle { handler, error: error_tx, to_dispatch, shutdown: shutdown_rx },
            BackendDriver {
                to_handle,
                error: error_rx,
                dispatcher,
                shutdown: shutdown_tx,
            },
        )
    }
}

/// The backend's ends of the driver channels.
pub struct BackendHandle {
    /// Sends parsed inbound frames to the manager.
    pub handler: mpsc::UnboundedSender<ServerMessage>,
    /// Reports a terminal error to the manager.
    pub error: oneshot::Sender<()>,
    /// Receives serialized requests to put on the wire.
    pub to_dispatch: mpsc::UnboundedReceiver<Box<RawValue>>,
    /// Receives the manager's shutdown notice.
    pub shutdown: oneshot::Receiver<()>,
}

enum Step {
    Keepalive,
    Server(Option<WsStreamItem>),
    Dispatch(Option<Box<RawValue>>),
    Shutdown,
}

/// `WsBackend` pumps one WebSocket: outbound frames from the dispatch
/// channel onto the wire, inbound text frames parsed and handed to the
/// manager. A ping-based keepalive prevents inactivity from triggering
/// server-side closes.
///
/// The backend shuts down when instructed to by the manager, or when the
/// manager drops (closing the dispatch channel).
pub(crate) struct WsBackend {
    server: WsStream,
    handle: BackendHandle,
}

impl WsBackend {
    pub(crate) fn new(server: WsStream) -> (Self, BackendDriver) {
        let (handle, driver) = BackendDriver::channel();
        (WsBackend { server, handle }, driver)
    }

    fn handle_text(&mut self, t: String) -> Result<(), ()> {
        trace!(text = t, "received frame");
        match serde_json::from_str::<ServerMessage>(&t) {
            Ok(msg) => {
                trace!(%msg, "deserialized frame");
                if self.handle.handler.unbounded_send(msg).is_err() {
                    // manager is gone
                    return Err(())
                }
            }
            Err(e) => {
                error!(e = %e, "failed to deserialize frame");
            }
        }
        Ok(())
    }

    fn handle(&mut self, item: WsStreamItem) -> Result<(), ()> {
        match item {
            Ok(Message::Text(t)) => self.handle_text(t),
            Ok(Message::Ping(_)) => Ok(()),
            Ok(Message::Pong(_)) => Ok(()),
            Ok(Message::Frame(_)) => Ok(()),
            Ok(Message::Binary(_)) => {
                error!("unexpected binary frame");
                Err(())
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    debug!(%frame, "close frame");
                }
                Err(())
            }
            Err(e) => {
                error!(err = %e, "websocket error");
                Err(())
            }
        }
    }

    pub(crate) fn spawn(mut self) {
        let fut = async move {
            let mut err = false;
            loop {
                let step = {
                    let keepalive =
                        tokio::time::sleep(std::time::Duration::from_secs(10)).fuse();
                    tokio::pin!(keepalive);
                    select_biased! {
                        resp = self.server.next() => Step::Server(resp),
                        inst = self.handle.to_dispatch.next() => Step::Dispatch(inst),
                        _ = &mut self.handle.shutdown => Step::Shutdown,
                        _ = keepalive => Step::Keepalive,
                    }
                };
                match step {
                    Step::Keepalive => {
                        if let Err(e) = self.server.send(Message::Ping(vec![])).await {
                            error!(err = %e, "websocket connection error");
                            err = true;
                            break
                        }
                    }
                    Step::Server(Some(item)) => {
                        if self.handle(item).is_err() {
                            err = true;
                            break
                        }
                    }
                    Step::Server(None) => {
                        error!("websocket server has gone away");
                        err = true;
                        break
                    }
                    Step::Dispatch(Some(msg)) => {
                        if let Err(e) = self.server.send(Message::Text(msg.to_string())).await {
                            error!(err = %e, "websocket connection error");
                            err = true;
                            break
                        }
                    }
                    // dispatcher has gone away
                    Step::Dispatch(None) => break,
                    Step::Shutdown => break,
                }
            }
            if err {
                let _ = self.handle.error.send(());
            }
        };
        tokio::spawn(fut);
    }
}
