use serde::{Deserialize, Serialize};

use crate::ipc::error::ProtocolError;
use crate::state::{AppState, ProcessView};
use crate::supervisor::contract::{Action, ListedProcess};

/// One wire message. The protocol is newline-delimited UTF-8 JSON, one object
/// per line, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Command(CommandMessage),
    Response(ResponseMessage),
    State(StateMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub request_id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_list: Option<Vec<ListedProcess>>,
}

impl ResponseMessage {
    pub fn ok(request_id: String) -> Self {
        Self {
            request_id,
            success: true,
            error: None,
            process_list: None,
        }
    }

    pub fn ok_with_list(request_id: String, list: Vec<ListedProcess>) -> Self {
        Self {
            request_id,
            success: true,
            error: None,
            process_list: Some(list),
        }
    }

    pub fn failure(request_id: String, error: String) -> Self {
        Self {
            request_id,
            success: false,
            error: Some(error),
            process_list: None,
        }
    }
}

/// State broadcast envelope. Sensitive process settings (env maps, paths)
/// never enter [AppState], so marshaling it is safe by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: AppState,
    pub process_views: Vec<ProcessView>,
}

/// Encodes one message as a single JSON line, newline included. Compact JSON
/// contains no embedded newlines.
pub fn encode_line(message: &Message) -> Result<String, ProtocolError> {
    let mut line =
        serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Result<Message, ProtocolError> {
    serde_json::from_str(line).map_err(|err| ProtocolError::Parse(err.to_string()))
}

/// Best-effort request id recovery from a line that failed strict decoding,
/// so the error response can still be correlated.
pub fn salvage_request_id(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("request_id").and_then(|id| id.as_str().map(String::from)))
        .unwrap_or_default()
}
