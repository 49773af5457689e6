//! Named-channel messages exchanged over the WebSocket.
//!
//! Every text frame carries one JSON object tagged by its `event` field.
//! Terminal bytes travel as binary frames and never appear here except for
//! `terminal:write`, which lets text-only clients send input.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;
use crate::workspace::tree::TreeNode;

/// Encoding of the `data` field of `terminal:write`.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ClientMessage {
    #[serde(rename = "terminal:write")]
    TerminalWrite {
        data: String,
        #[serde(default)]
        encoding: InputEncoding,
    },
    #[serde(rename = "terminal:resize")]
    TerminalResize { rows: u16, cols: u16 },
    #[serde(rename = "file:change")]
    FileChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        path: String,
        content: String,
    },
    #[serde(rename = "file:read")]
    FileRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        path: String,
    },
    #[serde(rename = "tree:get")]
    TreeGet {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(text).map_err(|e| BrokerError::InvalidMessage(e.to_string()))
    }
}

/// Decode the payload of a `terminal:write` message.
pub fn decode_input(data: String, encoding: InputEncoding) -> Result<Bytes, BrokerError> {
    match encoding {
        InputEncoding::Utf8 => Ok(Bytes::from(data)),
        InputEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(&data)
            .map(Bytes::from)
            .map_err(|e| BrokerError::InvalidMessage(format!("invalid base64: {e}"))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "tree:snapshot")]
    TreeSnapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        tree: TreeNode,
    },
    #[serde(rename = "tree:changed")]
    TreeChanged,
    #[serde(rename = "file:content")]
    FileContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        path: String,
        content: String,
    },
    #[serde(rename = "file:written")]
    FileWritten {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        path: String,
    },
    #[serde(rename = "session:exited")]
    SessionExited { code: Option<u32> },
    #[serde(rename = "transport:lagged")]
    TransportLagged { dropped: u64 },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(id: Option<Value>, err: &BrokerError) -> Self {
        ServerEvent::Error {
            id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server event");
            String::from(r#"{"event":"error","code":"internal","message":"serialization failed"}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_file_change_with_id() {
        let msg = ClientMessage::parse(
            r#"{"event":"file:change","id":7,"path":"/src/a.rs","content":"fn main() {}"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::FileChange {
                id: Some(json!(7)),
                path: "/src/a.rs".into(),
                content: "fn main() {}".into(),
            }
        );
    }

    #[test]
    fn id_is_optional() {
        let msg = ClientMessage::parse(r#"{"event":"tree:get"}"#).unwrap();
        assert_eq!(msg, ClientMessage::TreeGet { id: None });
    }

    #[test]
    fn terminal_write_defaults_to_utf8() {
        let msg = ClientMessage::parse(r#"{"event":"terminal:write","data":"ls\n"}"#).unwrap();
        match msg {
            ClientMessage::TerminalWrite { data, encoding } => {
                assert_eq!(encoding, InputEncoding::Utf8);
                assert_eq!(decode_input(data, encoding).unwrap(), Bytes::from("ls\n"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn base64_input_is_decoded() {
        let bytes = decode_input("AwQ=".into(), InputEncoding::Base64).unwrap();
        assert_eq!(&bytes[..], &[0x03, 0x04]);
    }

    #[test]
    fn bad_base64_is_invalid_message() {
        let err = decode_input("!!!".into(), InputEncoding::Base64).unwrap_err();
        assert_eq!(err.code(), "invalid_message");
    }

    #[test]
    fn unknown_event_is_rejected() {
        let err = ClientMessage::parse(r#"{"event":"shell:restart"}"#).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidMessage(_)));
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn server_events_use_channel_names() {
        assert_eq!(
            serde_json::to_value(ServerEvent::TreeChanged).unwrap(),
            json!({ "event": "tree:changed" })
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::FileWritten {
                id: None,
                path: "a.txt".into()
            })
            .unwrap(),
            json!({ "event": "file:written", "path": "a.txt" })
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::SessionExited { code: Some(0) }).unwrap(),
            json!({ "event": "session:exited", "code": 0 })
        );
    }

    #[test]
    fn error_event_carries_code_and_request_id() {
        let event = ServerEvent::error(
            Some(json!("req-1")),
            &BrokerError::PathEscape("../x".into()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["code"], "path_escape");
    }

    #[test]
    fn snapshot_event_round_trips_through_json() {
        let tree: TreeNode = serde_json::from_value(json!({ "a": { "b": null } })).unwrap();
        let event = ServerEvent::TreeSnapshot { id: None, tree };
        let back: ServerEvent = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(back, event);
    }
}
