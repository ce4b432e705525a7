//! Two-phase gateway backend
//!
//! Every chat request is acknowledged at once with an empty `res`. The real
//! answer, if the agent decides to give one, arrives later as a `chat` event
//! (possibly preceded by `agent` assistant deltas). Silence is a valid outcome.

use super::auth::{build_device_auth, AuthParams, DeviceIdentity};
use super::pending::{PendingRequest, PendingSet};
use super::protocol::{
    error_message, id_string, str_at, text_content, GatewayFrame, GatewayRequest, CLIENT_VERSION,
    PROTOCOL_VERSION,
};
use super::socket::SocketTransport;
use crate::messages::{CorrelationId, Normalized, ResponseEvent, TransportEvent};
use crate::{Result, TalkbackError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:18789";
pub const DEFAULT_SESSION_KEY: &str = "voice-session";

const CLIENT_ID: &str = "cli";
const CLIENT_MODE: &str = "cli";
const ROLE: &str = "operator";
const SCOPES: &[&str] = &["operator.admin", "operator.approvals", "operator.pairing"];
/// Superseded, acknowledged-but-silent requests kept awaiting their run end
const MAX_SILENT_SUPERSEDED: usize = 2;

/// Configuration for the two-phase gateway
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TwoPhaseConfig {
    pub gateway_url: String,
    pub session_key: String,
    /// Gateway auth token sent with every connect request
    pub gateway_token: Option<String>,
    /// Required when the gateway issues a connect challenge
    pub device: Option<DeviceIdentity>,
    pub connect_timeout_ms: u64,
    /// Platform reported in the client block
    pub platform: String,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            session_key: DEFAULT_SESSION_KEY.to_string(),
            gateway_token: None,
            device: None,
            connect_timeout_ms: 10_000,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl TwoPhaseConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            ..Default::default()
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.gateway_token = Some(token.into());
        self
    }

    pub fn with_device(mut self, device: DeviceIdentity) -> Self {
        self.device = Some(device);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams<'a> {
    session_key: &'a str,
    message: &'a str,
    idempotency_key: &'a str,
}

pub struct TwoPhaseBackend {
    config: TwoPhaseConfig,
    transport: Option<SocketTransport>,
    reassembler: TwoPhaseReassembler,
    handshake_seq: u64,
}

impl TwoPhaseBackend {
    pub fn new(config: TwoPhaseConfig) -> Self {
        Self {
            config,
            transport: None,
            reassembler: TwoPhaseReassembler::new(),
            handshake_seq: 0,
        }
    }

    pub fn config(&self) -> &TwoPhaseConfig {
        &self.config
    }

    pub fn session_key(&self) -> &str {
        &self.config.session_key
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn connect_request(&mut self, device: Option<Value>) -> Value {
        self.handshake_seq += 1;
        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": CLIENT_ID,
                "version": CLIENT_VERSION,
                "platform": self.config.platform,
                "mode": CLIENT_MODE,
            },
            "role": ROLE,
            "scopes": SCOPES,
            "auth": { "token": self.config.gateway_token.as_deref().unwrap_or_default() },
        });
        if let Some(device) = device {
            params["device"] = device;
        }
        json!({
            "type": "req",
            "id": format!("connect-{}", self.handshake_seq),
            "method": "connect",
            "params": params,
        })
    }

    /// Open the socket and run the (optionally challenged) connect handshake
    pub async fn connect(&mut self, inbound: UnboundedSender<TransportEvent>) -> Result<()> {
        let timeout = self.config.connect_timeout();
        info!(url = %self.config.gateway_url, "connecting to two-phase gateway");

        let mut transport = SocketTransport::connect(&self.config.gateway_url, timeout).await?;

        let request = self.connect_request(None);
        transport
            .send_json(&request)
            .await
            .map_err(|e| TalkbackError::Connection(e.to_string()))?;
        let mut reply = transport.recv_json(timeout).await?;

        let is_challenge = str_at(&reply, "/type") == Some("event")
            && str_at(&reply, "/event") == Some("connect.challenge");
        if is_challenge {
            let nonce = str_at(&reply, "/payload/nonce")
                .filter(|n| !n.is_empty())
                .ok_or_else(|| TalkbackError::Connection("no nonce in connect challenge".into()))?
                .to_string();
            let device = self.config.device.as_ref().ok_or_else(|| {
                TalkbackError::Connection(
                    "gateway requested device auth but no device identity is configured".into(),
                )
            })?;
            let key = device.signing_key()?;
            let token = self.config.gateway_token.clone().unwrap_or_default();
            let auth = build_device_auth(
                &key,
                &device.device_id,
                &AuthParams {
                    client_id: CLIENT_ID,
                    client_mode: CLIENT_MODE,
                    role: ROLE,
                    scopes: SCOPES,
                    token: &token,
                    nonce: &nonce,
                },
                Utc::now().timestamp_millis(),
            );
            debug!(device = %auth.id, "answering connect challenge");

            let request = self.connect_request(Some(serde_json::to_value(&auth)?));
            transport
                .send_json(&request)
                .await
                .map_err(|e| TalkbackError::Connection(e.to_string()))?;
            reply = transport.recv_json(timeout).await?;
        }

        if !reply.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(TalkbackError::Connection(format!(
                "gateway rejected connect: {}",
                error_message(&reply.get("error").cloned())
            )));
        }

        transport.start_reader(inbound)?;
        self.transport = Some(transport);
        info!(session = %self.config.session_key, "connected to two-phase gateway");
        Ok(())
    }

    /// Send one chat request; the correlation id doubles as idempotency key
    pub async fn send(&mut self, correlation: &CorrelationId, message: &str) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| TalkbackError::Send("two-phase gateway is not connected".into()))?;

        let request = GatewayRequest {
            kind: "req",
            id: correlation.as_str(),
            method: "chat.send",
            params: ChatSendParams {
                session_key: &self.config.session_key,
                message,
                idempotency_key: correlation.as_str(),
            },
        };
        transport.send_json(&request).await?;
        self.reassembler.register(correlation.clone());
        debug!(%correlation, "chat request sent");
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

    /// Drop the connection and every outstanding request
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

/// Classifies gateway traffic into normalized response events
#[derive(Debug, Default)]
pub struct TwoPhaseReassembler {
    pending: PendingSet,
    /// Runs already finished on our side whose lifecycle end is still due
    ends_owed: usize,
}

impl TwoPhaseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, correlation: CorrelationId) {
        self.pending.register(correlation);
        self.retire_silent();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) -> Vec<CorrelationId> {
        self.ends_owed = 0;
        self.pending.clear()
    }

    /// Remove the request and remember that its run end is still to come
    fn complete(&mut self, correlation: &CorrelationId) -> Option<PendingRequest> {
        let request = self.pending.complete(correlation)?;
        self.ends_owed += 1;
        Some(request)
    }

    fn retire_silent(&mut self) {
        for request in self.pending.retire_silent(MAX_SILENT_SUPERSEDED) {
            debug!(correlation = %request.correlation, "retiring superseded silent request");
            self.ends_owed += 1;
        }
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
            GatewayFrame::Res {
                id,
                ok,
                result,
                error,
                ..
            } => self.on_res(&id, ok, &result, &error),
            GatewayFrame::Event { event, payload, .. } => match event.as_str() {
                "chat" => self.on_chat(&payload),
                "agent" => self.on_agent(&payload),
                "health" | "tick" | "presence" => Vec::new(),
                other => {
                    debug!(event = other, "ignoring gateway event");
                    Vec::new()
                }
            },
            GatewayFrame::Other => {
                debug!("ignoring gateway frame of unknown type");
                Vec::new()
            }
        }
    }

    /// Requests with no content by the bound are treated as silence
    pub fn expire(&mut self, bound: Duration) -> Vec<Normalized> {
        let expired = self.pending.expire(bound);
        self.ends_owed += expired.len();
        expired
            .into_iter()
            .map(|request| {
                info!(correlation = %request.correlation, "no reply within silence bound");
                Normalized::response(request.correlation, ResponseEvent::Empty)
            })
            .collect()
    }

    fn on_res(
        &mut self,
        id: &Value,
        ok: bool,
        result: &Value,
        error: &Option<Value>,
    ) -> Vec<Normalized> {
        let Some(id) = id_string(id) else {
            return Vec::new();
        };
        let Some(correlation) = self.pending.resolve(Some(&id)) else {
            trace!(id = %id, "response for unknown request");
            return Vec::new();
        };

        if !ok {
            error!(%correlation, error = %error_message(error), "chat request failed");
            self.pending.complete(&correlation);
            return vec![Normalized::response(correlation, ResponseEvent::Empty)];
        }

        match str_at(result, "/response").filter(|text| !text.is_empty()) {
            Some(text) => {
                let text = text.to_string();
                self.complete(&correlation);
                finish(correlation, text)
            }
            None => {
                if let Some(request) = self.pending.get_mut(&correlation) {
                    request.acknowledged = true;
                }
                debug!(%correlation, "empty acknowledgment, waiting for chat event");
                self.retire_silent();
                Vec::new()
            }
        }
    }

    fn event_correlation(&self, payload: &Value) -> Option<CorrelationId> {
        let explicit = str_at(payload, "/runId").or_else(|| str_at(payload, "/idempotencyKey"));
        self.pending.resolve(explicit)
    }

    fn on_chat(&mut self, payload: &Value) -> Vec<Normalized> {
        let state = str_at(payload, "/state").unwrap_or_default();
        if !matches!(state, "final" | "error" | "aborted") {
            trace!(state, "chat event");
            return Vec::new();
        }

        let Some(correlation) = self.event_correlation(payload) else {
            trace!(state, "chat event for unknown request");
            return Vec::new();
        };
        let Some(mut request) = self.complete(&correlation) else {
            return Vec::new();
        };

        if state != "final" {
            warn!(%correlation, state, "chat ended without an answer");
            return vec![Normalized::response(correlation, ResponseEvent::Empty)];
        }

        let text = payload
            .get("message")
            .filter(|message| str_at(message, "/role").map_or(true, |role| role == "assistant"))
            .and_then(|message| message.get("content"))
            .map(text_content)
            .unwrap_or_default();
        let text = if text.is_empty() {
            request.take_accumulated().unwrap_or_default()
        } else {
            text
        };
        finish(correlation, text)
    }

    fn on_agent(&mut self, payload: &Value) -> Vec<Normalized> {
        match str_at(payload, "/stream") {
            Some("assistant") => {
                let Some(correlation) = self.event_correlation(payload) else {
                    return Vec::new();
                };
                let Some(delta) = str_at(payload, "/data/delta") else {
                    return Vec::new();
                };
                let Some(request) = self.pending.get_mut(&correlation) else {
                    return Vec::new();
                };

                if !delta.is_empty() {
                    request.accumulate(delta);
                    return Vec::new();
                }
                // An empty delta closes the stream when no chat event follows
                match request.take_accumulated() {
                    Some(text) => {
                        self.complete(&correlation);
                        finish(correlation, text)
                    }
                    None => Vec::new(),
                }
            }
            Some("lifecycle") if str_at(payload, "/data/phase") == Some("end") => {
                self.on_run_end(str_at(payload, "/runId"))
            }
            _ => Vec::new(),
        }
    }

    /// Run ends arrive in order; one that finds no open request belongs to a
    /// run that was already answered, expired or retired
    fn on_run_end(&mut self, run_id: Option<&str>) -> Vec<Normalized> {
        let correlation = match run_id {
            Some(run_id) => self.pending.resolve(Some(run_id)),
            None if self.ends_owed > 0 => None,
            None => self
                .pending
                .resolve(None)
                .filter(|c| self.pending.get(c).map_or(false, |r| r.acknowledged)),
        };
        let Some(mut request) = correlation.and_then(|c| self.pending.complete(&c)) else {
            self.ends_owed = self.ends_owed.saturating_sub(1);
            trace!(owed = self.ends_owed, "run end for a finished request");
            return Vec::new();
        };
        debug!(correlation = %request.correlation, "run ended");
        let text = request.take_accumulated().unwrap_or_default();
        finish(request.correlation, text)
    }
}

fn finish(correlation: CorrelationId, text: String) -> Vec<Normalized> {
    if text.is_empty() {
        vec![Normalized::response(correlation, ResponseEvent::Empty)]
    } else {
        vec![
            Normalized::response(correlation.clone(), ResponseEvent::Chunk(text)),
            Normalized::response(correlation, ResponseEvent::Final),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler_with(ids: &[&str]) -> TwoPhaseReassembler {
        let mut r = TwoPhaseReassembler::new();
        for id in ids {
            r.register((*id).into());
        }
        r
    }

    #[test]
    fn test_empty_ack_is_not_a_response() {
        let mut r = reassembler_with(&["c1"]);
        let out = r.ingest(r#"{"type":"res","id":"c1","ok":true,"result":{}}"#);
        assert!(out.is_empty());
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_chat_final_carries_content() {
        let mut r = reassembler_with(&["c1"]);
        r.ingest(r#"{"type":"res","id":"c1","ok":true,"result":{}}"#);
        let out = r.ingest(
            r#"{"type":"event","event":"chat","payload":{"runId":"c1","state":"final",
                "message":{"role":"assistant","content":[{"type":"text","text":"It's sunny"}]}}}"#,
        );
        assert_eq!(
            out,
            vec![
                Normalized::response("c1".into(), ResponseEvent::Chunk("It's sunny".into())),
                Normalized::response("c1".into(), ResponseEvent::Final),
            ]
        );
        assert_eq!(r.outstanding(), 0);
    }

    #[test]
    fn test_anonymous_chat_event_goes_to_oldest_request() {
        let mut r = reassembler_with(&["c1", "c2"]);
        let out = r.ingest(
            r#"{"type":"event","event":"chat","payload":{"state":"final",
                "message":{"role":"assistant","content":"first"}}}"#,
        );
        assert_eq!(
            out[0],
            Normalized::response("c1".into(), ResponseEvent::Chunk("first".into()))
        );
    }

    #[test]
    fn test_direct_response_in_ack() {
        let mut r = reassembler_with(&["c1"]);
        let out = r.ingest(r#"{"type":"res","id":"c1","ok":true,"result":{"response":"Hi"}}"#);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Normalized::response("c1".into(), ResponseEvent::Final));
    }

    #[test]
    fn test_agent_deltas_then_empty_delta() {
        let mut r = reassembler_with(&["c1"]);
        for delta in ["It's ", "sunny"] {
            let raw = json!({"type":"event","event":"agent","payload":{
                "runId":"c1","stream":"assistant","data":{"text":"x","delta":delta}}});
            assert!(r.ingest(&raw.to_string()).is_empty());
        }
        let out = r.ingest(
            r#"{"type":"event","event":"agent","payload":{"runId":"c1","stream":"assistant","data":{"text":"","delta":""}}}"#,
        );
        assert_eq!(
            out[0],
            Normalized::response("c1".into(), ResponseEvent::Chunk("It's sunny".into()))
        );
    }

    #[test]
    fn test_lifecycle_end_without_content_is_empty() {
        let mut r = reassembler_with(&["c1"]);
        let out = r.ingest(
            r#"{"type":"event","event":"agent","payload":{"runId":"c1","stream":"lifecycle","data":{"phase":"end"}}}"#,
        );
        assert_eq!(out, vec![Normalized::response("c1".into(), ResponseEvent::Empty)]);
    }

    const ACK_C1: &str = r#"{"type":"res","id":"c1","ok":true,"result":{}}"#;
    const ACK_C2: &str = r#"{"type":"res","id":"c2","ok":true,"result":{}}"#;
    const RUN_END: &str =
        r#"{"type":"event","event":"agent","payload":{"stream":"lifecycle","data":{"phase":"end"}}}"#;
    const JOKE: &str = r#"{"type":"event","event":"chat","payload":{"state":"final",
        "message":{"role":"assistant","content":[{"type":"text","text":"joke"}]}}}"#;

    #[test]
    fn test_silent_run_end_hands_next_answer_to_newer_request() {
        let mut r = reassembler_with(&["c1"]);
        r.ingest(ACK_C1);
        r.register("c2".into());
        r.ingest(ACK_C2);

        let out = r.ingest(RUN_END);
        assert_eq!(out, vec![Normalized::response("c1".into(), ResponseEvent::Empty)]);

        let out = r.ingest(JOKE);
        assert_eq!(
            out,
            vec![
                Normalized::response("c2".into(), ResponseEvent::Chunk("joke".into())),
                Normalized::response("c2".into(), ResponseEvent::Final),
            ]
        );
        assert_eq!(r.outstanding(), 0);
    }

    #[test]
    fn test_run_end_after_answer_is_absorbed() {
        let mut r = reassembler_with(&["c1"]);
        r.ingest(ACK_C1);
        assert_eq!(r.ingest(JOKE).len(), 2);

        r.register("c2".into());
        r.ingest(ACK_C2);
        // Belongs to c1's run, which already answered
        assert!(r.ingest(RUN_END).is_empty());
        assert_eq!(r.outstanding(), 1);

        assert_eq!(
            r.ingest(RUN_END),
            vec![Normalized::response("c2".into(), ResponseEvent::Empty)]
        );
    }

    #[test]
    fn test_run_end_before_ack_is_ignored() {
        let mut r = reassembler_with(&["c1"]);
        assert!(r.ingest(RUN_END).is_empty());
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_superseded_silent_requests_are_bounded() {
        let mut r = TwoPhaseReassembler::new();
        for i in 0..10 {
            let id = format!("c{}", i);
            r.register(id.as_str().into());
            r.ingest(&json!({"type":"res","id":id,"ok":true,"result":{}}).to_string());
        }
        assert_eq!(r.outstanding(), MAX_SILENT_SUPERSEDED + 1);

        // Retired runs still owe their ends; those must not close the newest
        for _ in 0..10 - MAX_SILENT_SUPERSEDED - 1 {
            assert!(r.ingest(RUN_END).is_empty());
        }
        assert_eq!(r.outstanding(), MAX_SILENT_SUPERSEDED + 1);
    }

    #[test]
    fn test_failed_request_is_empty() {
        let mut r = reassembler_with(&["c1"]);
        let out = r.ingest(r#"{"type":"res","id":"c1","ok":false,"error":{"message":"nope"}}"#);
        assert_eq!(out, vec![Normalized::response("c1".into(), ResponseEvent::Empty)]);
    }

    #[test]
    fn test_unknown_and_malformed_are_dropped() {
        let mut r = reassembler_with(&["c1"]);
        assert!(r
            .ingest(r#"{"type":"res","id":"other","ok":true,"result":{"response":"x"}}"#)
            .is_empty());
        assert!(r.ingest("{not json").is_empty());
        assert!(r
            .ingest(r#"{"type":"event","event":"health","payload":{}}"#)
            .is_empty());
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_silence_bound_yields_empty() {
        let mut r = reassembler_with(&["c1"]);
        r.ingest(r#"{"type":"res","id":"c1","ok":true,"result":{}}"#);
        let out = r.expire(Duration::ZERO);
        assert_eq!(out, vec![Normalized::response("c1".into(), ResponseEvent::Empty)]);
    }

    #[test]
    fn test_connect_request_shape() {
        let mut backend = TwoPhaseBackend::new(TwoPhaseConfig::default().with_token("tok"));
        let request = backend.connect_request(None);
        assert_eq!(request["method"], "connect");
        assert_eq!(request["params"]["auth"]["token"], "tok");
        assert_eq!(request["params"]["role"], "operator");
        assert!(request["params"].get("device").is_none());
    }
}
