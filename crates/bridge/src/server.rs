//! WebSocket accept layer.
//!
//! Accepts duplex WebSocket connections and drives one [`SessionBridge`]
//! per connection through its contract: `on_connect` once after the
//! handshake, `on_message` for each text or binary frame, `on_disconnect`
//! exactly once when the stream ends. No session logic lives here, so the
//! layer stays replaceable by any transport honoring the same contract.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::bridge::{ClientSink, Payload, SessionBridge};
use crate::config::{Config, EnvShellSource};
use crate::pty::TerminalSize;

/// Outbound WebSocket half exposed to the bridge as a [`ClientSink`].
pub struct WsSink {
    inner: tokio::sync::Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
}

impl WsSink {
    fn new(sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(sink),
        }
    }
}

impl ClientSink for WsSink {
    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        let mut sink = self.inner.lock().await;
        sink.send(Message::Text(text.to_string()))
            .await
            .map_err(Into::into)
    }

    async fn close(&self) {
        let mut sink = self.inner.lock().await;
        let _ = sink.close().await;
    }
}

/// WebSocket server bridging each connection to a shell session.
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
}

impl Server {
    /// Binds the listener at the configured address.
    pub async fn bind(config: Config) -> Result<Self> {
        let listener = TcpListener::bind(&config.network.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.network.bind_addr))?;

        info!(addr = %listener.local_addr()?, "Listening for terminal connections");

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Returns the bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails. Each connection is
    /// handled on its own task; a failing session never affects the
    /// accept loop or other sessions.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                handle_connection(stream, peer, config).await;
            });
        }
    }
}

/// Runs one connection: handshake, bridge lifecycle, inbound frame loop.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, config: Arc<Config>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (write, mut read) = ws.split();
    let sink = Arc::new(WsSink::new(write));
    let bridge = SessionBridge::new(
        Arc::clone(&sink),
        TerminalSize {
            rows: config.session.rows,
            cols: config.session.cols,
        },
    );
    let shell_source = EnvShellSource::new(config.session.shell.clone());

    debug!(peer = %peer, session_id = %bridge.id(), "Connection accepted");

    bridge.on_connect(&shell_source).await;

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => bridge.on_message(Payload::Text(text)),
            Ok(Message::Binary(data)) => bridge.on_message(Payload::Binary(data)),
            Ok(Message::Close(_)) => break,
            // Ping/pong is answered by the protocol layer.
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection error");
                break;
            }
        }
    }

    bridge.on_disconnect();
    debug!(peer = %peer, session_id = %bridge.id(), "Connection closed");
}
