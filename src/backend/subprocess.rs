//! Subprocess RPC backend
//!
//! The agent runs as a child process speaking newline-delimited JSON. Each
//! request carries the full conversation context; the reply is one `response`
//! object matched by id. `tool_execution_start` notifications may arrive in
//! between and are forwarded out of band.

use super::pending::PendingSet;
use super::process::ProcessTransport;
use super::protocol::{error_message, id_string, text_content};
use crate::messages::{CorrelationId, Normalized, ResponseEvent, ToolNotification, TransportEvent};
use crate::{Result, TalkbackError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_BINARY: &str = "pi";

/// Configuration for the subprocess backend
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubprocessConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overrides the voice system prompt sent in every context
    pub system_prompt: Option<String>,
    /// Conversation messages kept in the request context
    pub max_history: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            working_dir: PathBuf::from("."),
            system_prompt: None,
            max_history: 20,
        }
    }
}

impl SubprocessConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: &'static str,
    pub content: String,
}

/// Rolling conversation history sent with each request
#[derive(Clone, Debug)]
pub struct ConversationContext {
    system_prompt: String,
    messages: VecDeque<ContextMessage>,
    max_messages: usize,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: VecDeque::new(),
            max_messages: max_messages.max(1),
        }
    }

    pub fn add_user_message(&mut self, content: &str) {
        self.push("user", content);
    }

    pub fn add_assistant_message(&mut self, content: &str) {
        self.push("assistant", content);
    }

    fn push(&mut self, role: &'static str, content: &str) {
        self.messages.push_back(ContextMessage {
            role,
            content: content.to_string(),
        });
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Request params for the history followed by `next`, within the bound
    fn to_params<'a>(&'a self, next: &'a ContextMessage) -> ContextParams<'a> {
        let skip = (self.messages.len() + 1).saturating_sub(self.max_messages);
        let mut messages: Vec<&ContextMessage> = self.messages.iter().skip(skip).collect();
        messages.push(next);
        ContextParams {
            context: RequestContext {
                system_prompt: &self.system_prompt,
                messages,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ContextParams<'a> {
    context: RequestContext<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestContext<'a> {
    system_prompt: &'a str,
    messages: Vec<&'a ContextMessage>,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    method: &'static str,
    params: ContextParams<'a>,
}

/// Inbound line from the agent process
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RpcFrame {
    Response {
        #[serde(default)]
        id: Value,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<Value>,
    },
    ToolExecutionStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    AgentEnd {},
    #[serde(other)]
    Other,
}

pub struct SubprocessBackend {
    config: SubprocessConfig,
    transport: Option<ProcessTransport>,
    reassembler: SubprocessReassembler,
    context: ConversationContext,
    /// Most recent request; only its reply joins the history
    latest: Option<CorrelationId>,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig, system_prompt: &str) -> Self {
        let prompt = config.system_prompt.as_deref().unwrap_or(system_prompt);
        let context = ConversationContext::new(prompt, config.max_history);
        Self {
            config,
            transport: None,
            reassembler: SubprocessReassembler::new(),
            context,
            latest: None,
        }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn connect(&mut self, inbound: UnboundedSender<TransportEvent>) -> Result<()> {
        let mut transport =
            ProcessTransport::spawn(&self.config.binary, &self.config.args, &self.config.working_dir)?;
        transport.start_reader(inbound)?;
        self.transport = Some(transport);
        Ok(())
    }

    pub async fn send(&mut self, correlation: &CorrelationId, message: &str) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| TalkbackError::Send("backend process is not running".into()))?;

        let user = ContextMessage {
            role: "user",
            content: message.to_string(),
        };
        let request = RpcRequest {
            kind: "request",
            id: correlation.as_str(),
            method: "chat",
            params: self.context.to_params(&user),
        };
        transport.send_line(&request).await?;
        // History only records what the agent actually received
        self.context.add_user_message(message);
        self.latest = Some(correlation.clone());
        self.reassembler.register(correlation.clone());
        debug!(%correlation, history = self.context.len(), "rpc chat request sent");
        Ok(())
    }

    pub fn normalize(&mut self, raw: &str) -> Vec<Normalized> {
        let events = self.reassembler.ingest(raw);
        for event in &events {
            if let Normalized::Response {
                correlation,
                event: ResponseEvent::Chunk(text),
            } = event
            {
                if self.latest.as_ref() == Some(correlation) {
                    self.context.add_assistant_message(text);
                } else {
                    trace!(%correlation, "reply to a superseded request left out of history");
                }
            }
        }
        events
    }

    pub fn expire_silent(&mut self, bound: Duration) -> Vec<Normalized> {
        self.reassembler.expire(bound)
    }

    pub fn probe(&mut self) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.probe(),
            None => Err(TalkbackError::Connection("backend process is not running".into())),
        }
    }

    pub fn reset(&mut self) -> Vec<CorrelationId> {
        // Dropping the transport kills the child
        self.transport = None;
        self.latest = None;
        self.reassembler.clear()
    }

    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct SubprocessReassembler {
    pending: PendingSet,
}

impl SubprocessReassembler {
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
        let frame: RpcFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(line = raw, "non-JSON stdout line");
                return Vec::new();
            }
        };

        match frame {
            RpcFrame::Response { id, result, error } => {
                let explicit = id_string(&id);
                let Some(correlation) = self.pending.resolve(explicit.as_deref()) else {
                    trace!(?explicit, "response for unknown request");
                    return Vec::new();
                };
                self.pending.complete(&correlation);

                if error.is_some() {
                    warn!(%correlation, error = %error_message(&error), "rpc request failed");
                    return vec![Normalized::response(correlation, ResponseEvent::Empty)];
                }
                let text = result.get("content").map(text_content).unwrap_or_default();
                if text.is_empty() {
                    vec![Normalized::response(correlation, ResponseEvent::Empty)]
                } else {
                    vec![
                        Normalized::response(correlation.clone(), ResponseEvent::Chunk(text)),
                        Normalized::response(correlation, ResponseEvent::Final),
                    ]
                }
            }
            RpcFrame::ToolExecutionStart { tool_name, args } => {
                debug!(tool = %tool_name, "tool execution started");
                vec![Normalized::Tool {
                    correlation: self.pending.resolve(None),
                    notification: ToolNotification {
                        tool: tool_name,
                        args,
                    },
                }]
            }
            RpcFrame::AgentEnd {} => match self.pending.resolve(None) {
                Some(correlation) => {
                    info!(%correlation, "agent finished without a response");
                    self.pending.complete(&correlation);
                    vec![Normalized::response(correlation, ResponseEvent::Final)]
                }
                None => Vec::new(),
            },
            RpcFrame::Other => Vec::new(),
        }
    }

    pub fn expire(&mut self, bound: Duration) -> Vec<Normalized> {
        self.pending
            .expire(bound)
            .into_iter()
            .map(|request| Normalized::response(request.correlation, ResponseEvent::Empty))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_matched_by_id() {
        let mut r = SubprocessReassembler::new();
        r.register("a".into());
        r.register("b".into());

        let out = r.ingest(r#"{"type":"response","id":"b","result":{"content":"hi"}}"#);
        assert_eq!(
            out,
            vec![
                Normalized::response("b".into(), ResponseEvent::Chunk("hi".into())),
                Normalized::response("b".into(), ResponseEvent::Final),
            ]
        );
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_tool_notification_is_not_an_answer() {
        let mut r = SubprocessReassembler::new();
        r.register("a".into());

        let out = r.ingest(r#"{"type":"tool_execution_start","toolName":"read","args":{"path":"x"}}"#);
        assert_eq!(
            out,
            vec![Normalized::Tool {
                correlation: Some("a".into()),
                notification: ToolNotification {
                    tool: "read".into(),
                    args: json!({"path": "x"}),
                },
            }]
        );
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_agent_end_terminates_outstanding() {
        let mut r = SubprocessReassembler::new();
        r.register("a".into());
        let out = r.ingest(r#"{"type":"agent_end","messages":[]}"#);
        assert_eq!(out, vec![Normalized::response("a".into(), ResponseEvent::Final)]);
        assert!(r.ingest(r#"{"type":"agent_end"}"#).is_empty());
    }

    #[test]
    fn test_error_response_is_empty() {
        let mut r = SubprocessReassembler::new();
        r.register("a".into());
        let out = r.ingest(r#"{"type":"response","id":"a","error":"model overloaded"}"#);
        assert_eq!(out, vec![Normalized::response("a".into(), ResponseEvent::Empty)]);
    }

    #[test]
    fn test_non_json_lines_are_skipped() {
        let mut r = SubprocessReassembler::new();
        r.register("a".into());
        assert!(r.ingest("loading model...").is_empty());
        assert!(r.ingest(r#"{"type":"message_update"}"#).is_empty());
        assert_eq!(r.outstanding(), 1);
    }

    #[test]
    fn test_context_is_bounded() {
        let mut context = ConversationContext::new("system", 2);
        context.add_user_message("one");
        context.add_assistant_message("two");
        context.add_user_message("three");
        assert_eq!(context.len(), 2);

        let next = ContextMessage {
            role: "user",
            content: "four".into(),
        };
        let params = serde_json::to_value(context.to_params(&next)).unwrap();
        assert_eq!(params["context"]["systemPrompt"], "system");
        let messages = params["context"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "three");
        assert_eq!(messages[1]["content"], "four");
    }

    #[tokio::test]
    async fn test_failed_send_leaves_history_untouched() {
        let mut backend = SubprocessBackend::new(SubprocessConfig::default(), "system");
        let err = backend.send(&"a".into(), "hello").await;
        assert!(matches!(err, Err(TalkbackError::Send(_))));
        assert!(backend.context().is_empty());
        assert_eq!(backend.reassembler.outstanding(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sent_utterance_recorded_once() {
        let config = SubprocessConfig::new("sh")
            .with_args(vec!["-c".into(), "cat > /dev/null".into()]);
        let mut backend = SubprocessBackend::new(config, "system");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        backend.connect(tx).await.unwrap();

        backend.send(&"a".into(), "hello").await.unwrap();
        assert_eq!(backend.context().len(), 1);
        backend.close().await;
    }

    #[test]
    fn test_only_latest_reply_joins_history() {
        let mut backend = SubprocessBackend::new(SubprocessConfig::default(), "system");
        for (id, text) in [("a", "weather?"), ("b", "a joke")] {
            backend.context.add_user_message(text);
            backend.reassembler.register(id.into());
            backend.latest = Some(id.into());
        }

        // Late reply to the superseded request
        let out = backend.normalize(r#"{"type":"response","id":"a","result":{"content":"sunny"}}"#);
        assert_eq!(out.len(), 2);
        assert_eq!(backend.context().len(), 2);

        backend.normalize(r#"{"type":"response","id":"b","result":{"content":"knock knock"}}"#);
        let next = ContextMessage {
            role: "user",
            content: "next".into(),
        };
        let params = serde_json::to_value(backend.context().to_params(&next)).unwrap();
        let roles: Vec<&str> = params["context"]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "user", "assistant", "user"]);
        assert_eq!(params["context"]["messages"][2]["content"], "knock knock");
    }
}
