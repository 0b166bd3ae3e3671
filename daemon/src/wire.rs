//! Tagged JSON message surface for the transport adapter. Every client event is
//! a tagged variant dispatched on its `type` field — never parsed by duck-typing, per
//! the design note about the wire mixing legacy and multi-terminal shapes on one name.
//! Streaming PTY output uses a small length-prefixed binary frame instead of JSON, so
//! arbitrary bytes survive without a lossy string re-encoding; one-shot payloads
//! (history, errors) are small enough that base64-in-JSON is the simpler, still
//! byte-transparent, choice.

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "terminal:create")]
    Create {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cols: u16,
        rows: u16,
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    #[serde(rename = "terminal:destroy")]
    Destroy {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    #[serde(rename = "terminal:restore")]
    Restore { terminals: Vec<RestoreItem> },
    #[serde(rename = "terminal:input")]
    Input {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    #[serde(rename = "terminal:resize")]
    Resize {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal:request-history")]
    RequestHistory {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    #[serde(rename = "terminal:replica-attach")]
    ReplicaAttach {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "terminal:replica-leave")]
    ReplicaLeave {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "terminal:replica-input")]
    ReplicaInput {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    #[serde(rename = "terminal:replica-resize")]
    ReplicaResize {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "tabs:add")]
    TabsAdd {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename = "tabs:remove")]
    TabsRemove { id: String },
    #[serde(rename = "tabs:rename")]
    TabsRename { id: String, name: String },
    #[serde(rename = "favorites:add")]
    FavoritesAdd { item: serde_json::Value },
    #[serde(rename = "favorites:remove")]
    FavoritesRemove { id: String },
    #[serde(rename = "commands:add")]
    CommandsAdd { item: serde_json::Value },
    #[serde(rename = "commands:remove")]
    CommandsRemove { id: String },
}

#[derive(Debug, Deserialize)]
pub struct RestoreItem {
    #[serde(rename = "terminalId")]
    pub terminal_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(s: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .unwrap_or_default()
}

#[derive(Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent<'a> {
    #[serde(rename = "terminal:created")]
    Created {
        #[serde(rename = "terminalId")]
        terminal_id: &'a str,
        #[serde(rename = "sessionId")]
        session_id: String,
        restored: bool,
    },
    #[serde(rename = "terminal:destroyed")]
    Destroyed {
        #[serde(rename = "terminalId")]
        terminal_id: &'a str,
    },
    #[serde(rename = "terminal:history")]
    History {
        #[serde(rename = "terminalId")]
        terminal_id: &'a str,
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal:replica-history")]
    ReplicaHistory {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal:dimensions")]
    Dimensions {
        #[serde(rename = "terminalId", skip_serializing_if = "Option::is_none")]
        terminal_id: Option<&'a str>,
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal:error")]
    Error {
        #[serde(rename = "terminalId", skip_serializing_if = "Option::is_none")]
        terminal_id: Option<&'a str>,
        error: String,
        tag: &'static str,
    },
    #[serde(rename = "terminal:replica-error")]
    ReplicaError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
        tag: &'static str,
    },
    #[serde(rename = "tabs:sync")]
    TabsSync {
        tabs: Vec<shellhub_core::tabs::Tab>,
        #[serde(rename = "lastModified")]
        last_modified: u64,
    },
    #[serde(rename = "favorites:sync")]
    FavoritesSync { items: Vec<serde_json::Value> },
    #[serde(rename = "commands:sync")]
    CommandsSync { items: Vec<serde_json::Value> },
}

/// Binary frame kinds for the hot streaming path: `terminal:data` and its replica
/// equivalent. Layout: `[kind:u8][id_len:u16 BE][id bytes][payload...]`.
pub const FRAME_KIND_TERMINAL_DATA: u8 = 1;
pub const FRAME_KIND_REPLICA_DATA: u8 = 2;

pub fn encode_data_frame(kind: u8, id: &str, payload: &[u8]) -> Vec<u8> {
    let id_bytes = id.as_bytes();
    let mut out = Vec::with_capacity(1 + 2 + id_bytes.len() + payload.len());
    out.push(kind);
    out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(payload);
    out
}
