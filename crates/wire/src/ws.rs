//! Worker WebSocket progress protocol.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Value,
}

/// One decoded progress-stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    ExecutionStart { prompt_id: String },
    /// `node == None` marks end-of-execution for the worker's current task.
    Executing { node: Option<String> },
    Progress { value: i64, max: i64 },
    Executed { node: Option<String> },
    ExecutionCached { prompt_id: Option<String> },
    ExecutionError { prompt_id: Option<String>, exception_message: String },
    Status,
    /// Recognised envelope, unrecognised `type` — informational, ignored.
    Unknown,
}

impl WsMessage {
    /// `int(value / max * 100)`, clamped; `max <= 0` yields 0.
    pub fn progress_percent(value: i64, max: i64) -> u8 {
        if max <= 0 {
            return 0;
        }
        ((value as f64 / max as f64) * 100.0).clamp(0.0, 100.0) as u8
    }
}

/// Parse one WebSocket text frame. Returns `None` on malformed JSON or a
/// missing envelope `type`; a well-formed envelope with an unrecognised
/// `type` still returns `Some(WsMessage::Unknown)`.
pub fn parse_ws_message(text: &str) -> Option<WsMessage> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    let data = &envelope.data;
    Some(match envelope.msg_type.as_str() {
        "execution_start" => {
            WsMessage::ExecutionStart { prompt_id: data.get("prompt_id")?.as_str()?.to_string() }
        }
        "executing" => WsMessage::Executing {
            node: data.get("node").and_then(|v| v.as_str()).map(String::from),
        },
        "progress" => WsMessage::Progress {
            value: data.get("value").and_then(|v| v.as_i64()).unwrap_or(0),
            max: data.get("max").and_then(|v| v.as_i64()).unwrap_or(100),
        },
        "executed" => {
            WsMessage::Executed { node: data.get("node").and_then(|v| v.as_str()).map(String::from) }
        }
        "execution_cached" => WsMessage::ExecutionCached {
            prompt_id: data.get("prompt_id").and_then(|v| v.as_str()).map(String::from),
        },
        "execution_error" => WsMessage::ExecutionError {
            prompt_id: data.get("prompt_id").and_then(|v| v.as_str()).map(String::from),
            exception_message: data
                .get("exception_message")
                .or_else(|| data.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        },
        "status" => WsMessage::Status,
        _ => WsMessage::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execution_start() {
        let msg = parse_ws_message(r#"{"type":"execution_start","data":{"prompt_id":"P1"}}"#).unwrap();
        assert_eq!(msg, WsMessage::ExecutionStart { prompt_id: "P1".to_string() });
    }

    #[test]
    fn progress_percent_rounds_down() {
        assert_eq!(WsMessage::progress_percent(5, 10), 50);
        assert_eq!(WsMessage::progress_percent(1, 3), 33);
        assert_eq!(WsMessage::progress_percent(1, 0), 0);
    }

    #[test]
    fn executing_with_null_node_signals_end_of_execution() {
        let msg = parse_ws_message(r#"{"type":"executing","data":{"node":null}}"#).unwrap();
        assert_eq!(msg, WsMessage::Executing { node: None });
    }

    #[test]
    fn execution_error_falls_back_to_error_field() {
        let msg = parse_ws_message(r#"{"type":"execution_error","data":{"error":"boom"}}"#).unwrap();
        assert_eq!(
            msg,
            WsMessage::ExecutionError { prompt_id: None, exception_message: "boom".to_string() }
        );
    }

    #[test]
    fn malformed_json_returns_none() {
        assert_eq!(parse_ws_message("not json"), None);
    }

    #[test]
    fn unrecognised_type_is_unknown_not_none() {
        assert_eq!(parse_ws_message(r#"{"type":"future_event","data":{}}"#), Some(WsMessage::Unknown));
    }
}
