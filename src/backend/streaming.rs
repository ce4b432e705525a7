//! Streaming gateway backend
//!
//! Replies arrive incrementally: `stream` events carry deltas and a `done`
//! event closes the turn. The `chat` event shape (state `delta` / `final`)
//! emitted by older gateway builds is accepted as well.

use super::pending::PendingSet;
use super::protocol::{
    error_message, id_string, str_at, GatewayFrame, GatewayRequest, CLIENT_VERSION,
    PROTOCOL_VERSION,
};
use super::socket::SocketTransport;
use crate::messages::{CorrelationId, Normalized, ResponseEvent, TransportEvent};
use crate::{Result, TalkbackError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_GATEWAY_URL: &str = "wss://localhost:65491/ws";
pub const DEFAULT_AGENT_ID: &str = "main";

const CLIENT_ID: &str = "pipecat-voice";
const CLIENT_MODE: &str = "voice";

/// How the conversation key is chosen
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// One long-lived conversation
    #[default]
    Persistent,
    /// Fresh conversation for every connection
    PerConnection,
    /// Alias of `PerConnection`
    New,
    /// One conversation per calendar day
    Daily,
}

impl SessionStrategy {
    /// Build the session key for `agent_id` at `now`
    pub fn session_key(self, agent_id: &str, now: DateTime<Local>) -> String {
        match self {
            SessionStrategy::Persistent => format!("agent:{}:voice", agent_id),
            SessionStrategy::PerConnection | SessionStrategy::New => {
                format!("agent:{}:voice-{}", agent_id, now.timestamp())
            }
            SessionStrategy::Daily => {
                format!("agent:{}:voice-{}", agent_id, now.format("%Y-%m-%d"))
            }
        }
    }

    fn renews_per_connection(self) -> bool {
        matches!(self, SessionStrategy::PerConnection | SessionStrategy::New)
    }
}

/// Configuration for the streaming gateway
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingConfig {
    pub gateway_url: String,
    /// Optional API key sent in the connect handshake
    pub api_key: Option<String>,
    pub agent_id: String,
    /// Explicit session key; overrides `session_strategy`
    pub session_key: Option<String>,
    pub session_strategy: SessionStrategy,
    pub connect_timeout_ms: u64,
    pub platform: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            api_key: None,
            agent_id: DEFAULT_AGENT_ID.to_string(),
            session_key: None,
            session_strategy: SessionStrategy::default(),
            connect_timeout_ms: 10_000,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl StreamingConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_strategy(mut self, strategy: SessionStrategy) -> Self {
        self.session_strategy = strategy;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Session key in effect at `now`
    pub fn resolve_session_key(&self, now: DateTime<Local>) -> String {
        match &self.session_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => self.session_strategy.session_key(&self.agent_id, now),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams<'a> {
    session_key: &'a str,
    message: &'a str,
    stream: bool,
}

pub struct StreamingBackend {
    config: StreamingConfig,
    session_key: String,
    transport: Option<SocketTransport>,
    reassembler: StreamingReassembler,
    handshake_seq: u64,
}

impl StreamingBackend {
    pub fn new(config: StreamingConfig) -> Self {
        let session_key = config.resolve_session_key(Local::now());
        Self {
            config,
            session_key,
            transport: None,
            reassembler: StreamingReassembler::new(),
            handshake_seq: 0,
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn next_handshake_id(&mut self, prefix: &str) -> String {
        self.handshake_seq += 1;
        format!("{}-{}", prefix, self.handshake_seq)
    }

    fn connect_request(&mut self) -> Value {
        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": CLIENT_ID,
                "version": CLIENT_VERSION,
                "platform": self.config.platform,
                "mode": CLIENT_MODE,
            },
        });
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            params["auth"] = json!({ "apiKey": key });
        }
        json!({
            "type": "req",
            "id": self.next_handshake_id("connect"),
            "method": "connect",
            "params": params,
        })
    }

    pub async fn connect(&mut self, inbound: UnboundedSender<TransportEvent>) -> Result<()> {
        let timeout = self.config.connect_timeout();
        if self.config.session_key.is_none() && self.config.session_strategy.renews_per_connection()
        {
            self.session_key = self.config.resolve_session_key(Local::now());
        }
        info!(url = %self.config.gateway_url, session = %self.session_key, "connecting to streaming gateway");

        let mut transport = SocketTransport::connect(&self.config.gateway_url, timeout).await?;

        let request = self.connect_request();
        transport
            .send_json(&request)
            .await
            .map_err(|e| TalkbackError::Connection(e.to_string()))?;
        let reply = transport.recv_json(timeout).await?;

        if !reply.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(TalkbackError::Connection(error_message(
                &reply.get("error").cloned(),
            )));
        }

        let switch = json!({
            "type": "req",
            "id": self.next_handshake_id("switch"),
            "method": "sessions.switch",
            "params": { "key": self.session_key },
        });
        transport
            .send_json(&switch)
            .await
            .map_err(|e| TalkbackError::Connection(e.to_string()))?;

        transport.start_reader(inbound)?;
        self.transport = Some(transport);
        info!(session = %self.session_key, "connected to streaming gateway");
        Ok(())
    }

    pub async fn send(&mut self, correlation: &CorrelationId, message: &str) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| TalkbackError::Send("streaming gateway is not connected".into()))?;

        let request = GatewayRequest {
            kind: "method",
            id: correlation.as_str(),
            method: "chat.send",
            params: ChatSendParams {
                session_key: &self.session_key,
                message,
                stream: true,
            },
        };
        transport.send_json(&request).await?;
        self.reassembler.register(correlation.clone());
        debug!(%correlation, "streaming chat request sent");
        Ok(())
    }

    pub fn normalize(&mut self, raw: &str) -> Vec<Normalized> {
        self.reassembler.ingest(raw)
    }

    pub fn expire_silent(&mut self, bound: Duration) -> Vec<Normalized> {
        self.reassembler.expire(bound)
    }

    pub async fn probe(&mut self, timeout: Duration) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.probe(timeout).await,
            None => Err(TalkbackError::Connection("not connected".into())),
        }
    }

    pub fn reset(&mut self) -> Vec<CorrelationId> {
        self.transport = None;
        self.reassembler.clear()
    }

    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamingReassembler {
    pending: PendingSet,
}

impl StreamingReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, correlation: CorrelationId) {
        self.pending.register(correlation);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) -> Vec<CorrelationId> {
        self.pending.clear()
    }

    pub fn ingest(&mut self, raw: &str) -> Vec<Normalized> {
        let frame = match GatewayFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed gateway frame");
                return Vec::new();
            }
        };

        match frame {
            GatewayFrame::Res { id, ok, error, .. } => self.on_res(&id, ok, &error),
            GatewayFrame::Event { event, id, payload } => {
                let explicit = explicit_id(&id, &payload);
                match event.as_str() {
                    "stream" => self.on_delta(explicit, str_at(&payload, "/delta")),
                    "done" => self.on_done(explicit, str_at(&payload, "/text")),
                    "chat" => match str_at(&payload, "/state") {
                        Some("delta") => self.on_delta(explicit, str_at(&payload, "/text")),
                        Some("final") => self.on_done(explicit, str_at(&payload, "/text")),
                        Some("error") => self.on_error(explicit, &payload),
                        _ => Vec::new(),
                    },
                    "error" => self.on_error(explicit, &payload),
                    "health" | "tick" | "presence" => Vec::new(),
                    other => {
                        debug!(event = other, "ignoring gateway event");
                        Vec::new()
                    }
                }
            }
            GatewayFrame::Other => Vec::new(),
        }
    }

    pub fn expire(&mut self, bound: Duration) -> Vec<Normalized> {
        self.pending
            .expire(bound)
            .into_iter()
            .map(|request| {
                info!(correlation = %request.correlation, "no reply within silence bound");
                Normalized::response(request.correlation, ResponseEvent::Empty)
            })
            .collect()
    }

    fn on_res(&mut self, id: &Value, ok: bool, error: &Option<Value>) -> Vec<Normalized> {
        let Some(id) = id_string(id) else {
            return Vec::new();
        };
        let Some(correlation) = self.pending.resolve(Some(&id)) else {
            trace!(id = %id, "response for unknown request");
            return Vec::new();
        };

        if ok {
            if let Some(request) = self.pending.get_mut(&correlation) {
                request.acknowledged = true;
            }
            return Vec::new();
        }
        error!(%correlation, error = %error_message(error), "chat request failed");
        self.pending.complete(&correlation);
        vec![Normalized::response(correlation, ResponseEvent::Empty)]
    }

    fn on_delta(&mut self, explicit: Option<String>, delta: Option<&str>) -> Vec<Normalized> {
        let Some(delta) = delta.filter(|d| !d.is_empty()) else {
            return Vec::new();
        };
        let Some(correlation) = self.pending.resolve(explicit.as_deref()) else {
            trace!("delta for unknown request");
            return Vec::new();
        };
        if let Some(request) = self.pending.get_mut(&correlation) {
            request.accumulate(delta);
        }
        vec![Normalized::response(
            correlation,
            ResponseEvent::Chunk(delta.to_string()),
        )]
    }

    fn on_done(&mut self, explicit: Option<String>, full_text: Option<&str>) -> Vec<Normalized> {
        let Some(correlation) = self.pending.resolve(explicit.as_deref()) else {
            trace!("done for unknown request");
            return Vec::new();
        };
        let Some(mut request) = self.pending.complete(&correlation) else {
            return Vec::new();
        };
        let streamed = request.take_accumulated().unwrap_or_default();

        // The final text repeats what was streamed; only the unseen tail is new
        let tail = match full_text {
            Some(full) if full.len() > streamed.len() && full.starts_with(&streamed) => {
                Some(full[streamed.len()..].to_string())
            }
            _ => None,
        };

        match tail {
            Some(tail) => vec![
                Normalized::response(correlation.clone(), ResponseEvent::Chunk(tail)),
                Normalized::response(correlation, ResponseEvent::Final),
            ],
            None if streamed.is_empty() => {
                vec![Normalized::response(correlation, ResponseEvent::Empty)]
            }
            None => vec![Normalized::response(correlation, ResponseEvent::Final)],
        }
    }

    fn on_error(&mut self, explicit: Option<String>, payload: &Value) -> Vec<Normalized> {
        let Some(correlation) = self.pending.resolve(explicit.as_deref()) else {
            return Vec::new();
        };
        let Some(mut request) = self.pending.complete(&correlation) else {
            return Vec::new();
        };
        warn!(%correlation, error = %error_message(&payload.get("error").cloned()), "streaming reply failed");
        if request.take_accumulated().is_some() {
            // Already spoken text stands; the turn just ends early
            vec![Normalized::response(correlation, ResponseEvent::Final)]
        } else {
            vec![Normalized::response(correlation, ResponseEvent::Empty)]
        }
    }
}

/// Correlation hint from the envelope or the payload
fn explicit_id(envelope_id: &Value, payload: &Value) -> Option<String> {
    id_string(envelope_id)
        .or_else(|| payload.get("id").and_then(id_string))
        .or_else(|| payload.get("requestId").and_then(id_string))
        .or_else(|| payload.get("runId").and_then(id_string))
}
