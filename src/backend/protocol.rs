//! Wire envelopes shared by the socket backends

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version negotiated during the connect handshake
pub const PROTOCOL_VERSION: u32 = 3;

/// Client version reported in handshakes
pub const CLIENT_VERSION: &str = "1.0.0";

/// Inbound frame from a gateway socket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    /// Response to a request (acks included)
    Res {
        #[serde(default)]
        id: Value,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        error: Option<Value>,
    },
    /// Asynchronous event
    Event {
        event: String,
        #[serde(default)]
        id: Value,
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Other,
}

impl GatewayFrame {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Outbound request envelope
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest<'a, P: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: P,
}

/// Read an id that may arrive as a string or a number
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// String at a JSON pointer, if present
pub fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Flatten message content into plain text
///
/// Accepts a bare string, an object with `text`, or a list of content items
/// where only `type: "text"` items contribute.
pub fn text_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter(|item| {
                item.get("type")
                    .and_then(Value::as_str)
                    .map_or(true, |kind| kind == "text")
            })
            .map(text_content)
            .collect(),
        Value::Object(map) => map.get("text").map(text_content).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Human readable error message from an `error` object
pub fn error_message(error: &Option<Value>) -> String {
    match error {
        Some(Value::String(s)) => s.clone(),
        Some(value) => str_at(value, "/message")
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        None => "unknown error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ack() {
        let frame = GatewayFrame::parse(r#"{"type":"res","id":"7","ok":true,"result":{}}"#).unwrap();
        match frame {
            GatewayFrame::Res { id, ok, .. } => {
                assert_eq!(id_string(&id), Some("7".to_string()));
                assert!(ok);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_other() {
        let frame = GatewayFrame::parse(r#"{"type":"hello","x":1}"#).unwrap();
        assert!(matches!(frame, GatewayFrame::Other));
    }

    #[test]
    fn test_numeric_id() {
        assert_eq!(id_string(&json!(42)), Some("42".to_string()));
        assert_eq!(id_string(&Value::Null), None);
    }

    #[test]
    fn test_text_content_filters_non_text_items() {
        let content = json!([
            {"type": "text", "text": "It's "},
            {"type": "image", "url": "x"},
            {"type": "text", "text": "sunny"}
        ]);
        assert_eq!(text_content(&content), "It's sunny");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(&Some(json!({"message": "bad token"}))),
            "bad token"
        );
        assert_eq!(error_message(&None), "unknown error");
    }
}
