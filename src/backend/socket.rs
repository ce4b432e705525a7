//! Persistent WebSocket transport for gateway backends
//!
//! The handshake runs on the raw stream (`send_json` / `recv_json`); once the
//! backend-specific handshake succeeds, `start_reader` hands the read half to
//! a background task that forwards text frames and tracks keep-alive pongs.

use crate::messages::TransportEvent;
use crate::{Result, TalkbackError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SocketTransport {
    url: String,
    sink: SplitSink<WsStream, WsMessage>,
    /// Read half until the reader task takes it
    stream: Option<SplitStream<WsStream>>,
    reader: Option<JoinHandle<()>>,
    last_pong: Arc<Mutex<Instant>>,
    /// Outstanding keep-alive probe
    probe_sent: Option<Instant>,
}

impl SocketTransport {
    /// Open the socket; fails with `Connection` on refusal or timeout
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        debug!(url, "opening gateway socket");
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| {
                TalkbackError::Connection(format!(
                    "timed out after {}ms connecting to {}",
                    timeout.as_millis(),
                    url
                ))
            })?
            .map_err(|e| TalkbackError::Connection(format!("failed to connect to {}: {}", url, e)))?;

        let (sink, stream) = ws.split();

        Ok(Self {
            url: url.to_string(),
            sink,
            stream: Some(stream),
            reader: None,
            last_pong: Arc::new(Mutex::new(Instant::now())),
            probe_sent: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serialize and write one frame
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        trace!(url = %self.url, frame = %text, "socket send");
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TalkbackError::Send(e.to_string()))
    }

    /// Read the next JSON frame during the handshake
    ///
    /// Only valid before `start_reader`.
    pub async fn recv_json(&mut self, timeout: Duration) -> Result<Value> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            TalkbackError::Connection("socket reader already started".to_string())
        })?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| TalkbackError::Connection("handshake timed out".to_string()))?;

            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        TalkbackError::Connection(format!("malformed handshake frame: {}", e))
                    });
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(TalkbackError::Connection(format!(
                        "gateway closed during handshake: {:?}",
                        frame
                    )));
                }
                // Control frames and binary payloads are not part of the handshake
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TalkbackError::Connection(
                        "gateway closed during handshake".to_string(),
                    ))
                }
            }
        }
    }

    /// Move the read half onto a background task
    pub fn start_reader(&mut self, tx: UnboundedSender<TransportEvent>) -> Result<()> {
        let mut stream = self.stream.take().ok_or_else(|| {
            TalkbackError::Connection("socket reader already started".to_string())
        })?;
        let last_pong = Arc::clone(&self.last_pong);
        let url = self.url.clone();

        self.reader = Some(tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if tx.send(TransportEvent::Message(text)).is_err() {
                            debug!(url = %url, "inbound receiver dropped, stopping socket reader");
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        *last_pong.lock() = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break format!("closed by gateway: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("socket error: {}", e),
                    None => break "socket stream ended".to_string(),
                }
            };
            warn!(url = %url, %reason, "gateway socket closed");
            let _ = tx.send(TransportEvent::Closed(reason));
        }));

        Ok(())
    }

    /// Keep-alive probe
    ///
    /// Fails with `Connection` when the previous ping went unanswered for
    /// longer than `timeout`.
    pub async fn probe(&mut self, timeout: Duration) -> Result<()> {
        if let Some(sent) = self.probe_sent {
            let answered = *self.last_pong.lock() >= sent;
            if !answered && sent.elapsed() >= timeout {
                return Err(TalkbackError::Connection(format!(
                    "no keep-alive reply within {}ms",
                    timeout.as_millis()
                )));
            }
            if !answered {
                return Ok(());
            }
        }

        self.sink
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| TalkbackError::Connection(format!("keep-alive ping failed: {}", e)))?;
        self.probe_sent = Some(Instant::now());
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(url = %self.url, error = %e, "socket close");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
