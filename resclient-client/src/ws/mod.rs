//! The WebSocket transport and the dial seam the manager reconnects
//! through.

mod backend;

pub use backend::{BackendDriver, BackendHandle};
pub(crate) use backend::WsBackend;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::errors::ClientError;

/// The dial seam: produces a fresh [`BackendDriver`] per connection
/// attempt. The default implementation dials a WebSocket; tests and
/// custom framings substitute their own.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Opens a new connection and returns the driver for its backend.
    async fn connect(&mut self) -> Result<BackendDriver, ClientError>;
}

/// Dials the configured host URL over a WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Creates a connector for the host URL. `http`/`https` schemes are
    /// rewritten to `ws`/`wss`; other URLs are used as-is.
    pub fn new(host_url: impl AsRef<str>) -> Self {
        Self { url: resolve_host_url(host_url.as_ref()) }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&mut self) -> Result<BackendDriver, ClientError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| ClientError::InvalidArgument(format!("host url: {e}")))?;
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (backend, driver) = WsBackend::new(ws.fuse());
        backend.spawn();
        Ok(driver)
    }
}

// There is no ambient document origin to resolve against in a process;
// scheme rewriting is all the resolution that applies.
fn resolve_host_url(host: &str) -> String {
    if let Some(rest) = host.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    if let Some(rest) = host.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    host.to_owned()
}
