//! The transport adapter: maps the wire message set to hub calls and maintains
//! a per-client "room" membership so fanout is one task-forward per (connection,
//! session) pair, fed by the hub's one-send-per-session broadcast. On disconnect,
//! detaches all of the client's terminals but never kills a session.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use shellhub_core::error::HubError;
use shellhub_core::session::{RoomEvent, SessionId, TerminalId};

use crate::state::AppState;
use crate::wire::{self, ClientEvent, ServerEvent};

/// The delay before an unsolicited history push, long enough for a client to wire its
/// data handler after `terminal:created`. Clients that send
/// `terminal:request-history` get it immediately instead.
const DELAYED_HISTORY_MS: u64 = 50;

struct ConnState {
    client_id: String,
    /// This connection's local view of `(terminal_id -> session_id)`, used to tag
    /// incoming room broadcasts with the right terminal_id(s) for `terminal:data`.
    terminal_sessions: Mutex<HashMap<TerminalId, SessionId>>,
    replica_sessions: Mutex<HashSet<SessionId>>,
    history_sent: Mutex<HashSet<TerminalId>>,
    forwarders: Mutex<HashMap<SessionId, tokio::task::JoinHandle<()>>>,
    out_tx: mpsc::UnboundedSender<Message>,
}

impl ConnState {
    fn terminals_for_session(&self, session_id: SessionId) -> Vec<TerminalId> {
        self.terminal_sessions
            .lock()
            .expect("terminal_sessions mutex")
            .iter()
            .filter(|(_, sid)| **sid == session_id)
            .map(|(tid, _)| tid.clone())
            .collect()
    }

    fn is_replica_of(&self, session_id: SessionId) -> bool {
        self.replica_sessions.lock().expect("replica_sessions mutex").contains(&session_id)
    }

    fn session_still_in_use(&self, session_id: SessionId) -> bool {
        self.is_replica_of(session_id) || !self.terminals_for_session(session_id).is_empty()
    }

    fn send_json(&self, event: &ServerEvent) {
        if let Ok(text) = serde_json::to_string(event) {
            let _ = self.out_tx.send(Message::Text(text.into()));
        }
    }

    fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.out_tx.send(Message::Binary(bytes.into()));
    }
}

/// Ensure a forwarder task is running for `session_id`, fanning its room events out to
/// this connection tagged for whichever terminal_ids and/or replica membership apply at
/// delivery time. One forwarder per (connection, session) regardless of how many
/// terminal_ids on this connection point at it.
fn ensure_forwarder(conn: &std::sync::Arc<ConnState>, state: &AppState, session_id: SessionId) {
    let mut forwarders = conn.forwarders.lock().expect("forwarders mutex");
    if forwarders.contains_key(&session_id) {
        return;
    }
    let Some(session) = state.hub.get_session(session_id) else {
        return;
    };
    let mut rx = session.subscribe();
    let conn = std::sync::Arc::clone(conn);
    let handle = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                RoomEvent::Data(bytes) => {
                    for terminal_id in conn.terminals_for_session(session_id) {
                        let frame = wire::encode_data_frame(
                            wire::FRAME_KIND_TERMINAL_DATA,
                            &terminal_id,
                            &bytes,
                        );
                        conn.send_binary(frame);
                    }
                    if conn.is_replica_of(session_id) {
                        let frame = wire::encode_data_frame(
                            wire::FRAME_KIND_REPLICA_DATA,
                            &session_id.to_string(),
                            &bytes,
                        );
                        conn.send_binary(frame);
                    }
                }
                RoomEvent::Dimensions(cols, rows) => {
                    for terminal_id in conn.terminals_for_session(session_id) {
                        conn.send_json(&ServerEvent::Dimensions {
                            terminal_id: Some(&terminal_id),
                            session_id: session_id.to_string(),
                            cols,
                            rows,
                        });
                    }
                    if conn.is_replica_of(session_id) {
                        conn.send_json(&ServerEvent::Dimensions {
                            terminal_id: None,
                            session_id: session_id.to_string(),
                            cols,
                            rows,
                        });
                    }
                }
            }
        }
    });
    forwarders.insert(session_id, handle);
}

fn maybe_drop_forwarder(conn: &ConnState, session_id: SessionId) {
    if !conn.session_still_in_use(session_id) {
        if let Some(handle) = conn.forwarders.lock().expect("forwarders mutex").remove(&session_id) {
            handle.abort();
        }
    }
}

async fn send_history(conn: &std::sync::Arc<ConnState>, state: &AppState, terminal_id: &str, session_id: SessionId) {
    {
        let mut sent = conn.history_sent.lock().expect("history_sent mutex");
        if sent.contains(terminal_id) {
            return;
        }
        sent.insert(terminal_id.to_string());
    }
    let Some(session) = state.hub.get_session(session_id) else {
        return;
    };
    let (cols, rows) = session.dims();
    conn.send_json(&ServerEvent::History {
        terminal_id,
        session_id: session_id.to_string(),
        data: wire::encode_base64(&session.snapshot()),
        cols,
        rows,
    });
}

fn parse_session_id(s: &str) -> Result<SessionId, HubError> {
    uuid::Uuid::parse_str(s)
        .map(SessionId)
        .map_err(|_| HubError::BadRequest(format!("invalid sessionId {s}")))
}

async fn handle_event(conn: &std::sync::Arc<ConnState>, state: &AppState, event: ClientEvent) {
    match event {
        ClientEvent::Create { terminal_id, cols, rows, session_id } => {
            let hint = session_id.as_deref().and_then(|s| uuid::Uuid::parse_str(s).ok()).map(SessionId);
            match state.hub.create_terminal(conn.client_id.clone(), terminal_id.clone(), cols, rows, hint, None) {
                Ok(outcome) => {
                    conn.terminal_sessions
                        .lock()
                        .expect("terminal_sessions mutex")
                        .insert(terminal_id.clone(), outcome.session_id);
                    // `terminal:created` MUST precede any `terminal:data`/`terminal:history`
                    // for this terminal_id (spec §5) — enqueue it before the forwarder
                    // subscribes to the room, since the forwarder runs as its own task and
                    // could otherwise race ahead of this one on the multi-thread runtime.
                    conn.send_json(&ServerEvent::Created {
                        terminal_id: &terminal_id,
                        session_id: outcome.session_id.to_string(),
                        restored: outcome.restored,
                    });
                    ensure_forwarder(conn, state, outcome.session_id);
                    let conn = std::sync::Arc::clone(conn);
                    let state = state.clone();
                    let session_id = outcome.session_id;
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(DELAYED_HISTORY_MS)).await;
                        send_history(&conn, &state, &terminal_id, session_id).await;
                    });
                }
                Err(e) => conn.send_json(&ServerEvent::Error {
                    terminal_id: Some(&terminal_id),
                    error: e.to_string(),
                    tag: e.tag(),
                }),
            }
        }
        ClientEvent::Restore { terminals } => {
            for item in terminals {
                let Ok(hint) = uuid::Uuid::parse_str(&item.session_id) else { continue };
                let hint = SessionId(hint);
                match state.hub.create_terminal(
                    conn.client_id.clone(),
                    item.terminal_id.clone(),
                    80,
                    24,
                    Some(hint),
                    None,
                ) {
                    Ok(outcome) => {
                        conn.terminal_sessions
                            .lock()
                            .expect("terminal_sessions mutex")
                            .insert(item.terminal_id.clone(), outcome.session_id);
                        // Same ordering requirement as the `Create` path: `terminal:created`
                        // must be enqueued before the forwarder can push any `terminal:data`.
                        conn.send_json(&ServerEvent::Created {
                            terminal_id: &item.terminal_id,
                            session_id: outcome.session_id.to_string(),
                            restored: outcome.restored,
                        });
                        ensure_forwarder(conn, state, outcome.session_id);
                        send_history(conn, state, &item.terminal_id, outcome.session_id).await;
                    }
                    Err(e) => conn.send_json(&ServerEvent::Error {
                        terminal_id: Some(&item.terminal_id),
                        error: e.to_string(),
                        tag: e.tag(),
                    }),
                }
            }
        }
        ClientEvent::Destroy { terminal_id } => {
            let session_id = conn
                .terminal_sessions
                .lock()
                .expect("terminal_sessions mutex")
                .remove(&terminal_id);
            state.hub.destroy_terminal(&conn.client_id, &terminal_id);
            conn.history_sent.lock().expect("history_sent mutex").remove(&terminal_id);
            if let Some(session_id) = session_id {
                maybe_drop_forwarder(conn, session_id);
            }
            conn.send_json(&ServerEvent::Destroyed { terminal_id: &terminal_id });
        }
        ClientEvent::Input { terminal_id, data } => {
            state.hub.input(&conn.client_id, &terminal_id, &wire::decode_base64(&data));
        }
        ClientEvent::Resize { terminal_id, cols, rows } => {
            state.hub.resize(&conn.client_id, &terminal_id, cols, rows);
        }
        ClientEvent::RequestHistory { terminal_id } => {
            let session_id = conn.terminal_sessions.lock().expect("terminal_sessions mutex").get(&terminal_id).copied();
            if let Some(session_id) = session_id {
                send_history(conn, state, &terminal_id, session_id).await;
            }
        }
        ClientEvent::ReplicaAttach { session_id } => match parse_session_id(&session_id) {
            Ok(sid) => match state.hub.replica_attach(&conn.client_id, sid) {
                Ok(outcome) => {
                    conn.replica_sessions.lock().expect("replica_sessions mutex").insert(sid);
                    ensure_forwarder(conn, state, sid);
                    conn.send_json(&ServerEvent::ReplicaHistory {
                        session_id: sid.to_string(),
                        data: wire::encode_base64(&outcome.scrollback),
                        cols: outcome.cols,
                        rows: outcome.rows,
                    });
                }
                Err(e) => conn.send_json(&ServerEvent::ReplicaError { session_id, error: e.to_string(), tag: e.tag() }),
            },
            Err(e) => conn.send_json(&ServerEvent::ReplicaError { session_id, error: e.to_string(), tag: e.tag() }),
        },
        ClientEvent::ReplicaLeave { session_id } => {
            if let Ok(sid) = parse_session_id(&session_id) {
                state.hub.replica_leave(&conn.client_id, sid);
                conn.replica_sessions.lock().expect("replica_sessions mutex").remove(&sid);
                maybe_drop_forwarder(conn, sid);
            }
        }
        ClientEvent::ReplicaInput { session_id, data } => {
            if let Ok(sid) = parse_session_id(&session_id) {
                state.hub.replica_input(&conn.client_id, sid, &wire::decode_base64(&data));
            }
        }
        ClientEvent::ReplicaResize { .. } => {
            // No-op by design: replica resize events never mutate PTY state.
        }
        ClientEvent::TabsAdd { id, name } => match state.tabs.add(id, name) {
            Ok(_) => broadcast_tabs(conn, state),
            Err(e) => warn!(event = "ws.tabs_add_failed", error = %e),
        },
        ClientEvent::TabsRemove { id } => match state.tabs.remove(&id) {
            Ok(_) => broadcast_tabs(conn, state),
            Err(e) => warn!(event = "ws.tabs_remove_failed", error = %e),
        },
        ClientEvent::TabsRename { id, name } => match state.tabs.rename(&id, name) {
            Ok(_) => broadcast_tabs(conn, state),
            Err(e) => warn!(event = "ws.tabs_rename_failed", error = %e),
        },
        ClientEvent::FavoritesAdd { item } => match state.favorites.add(item) {
            Ok(_) => conn.send_json(&ServerEvent::FavoritesSync { items: state.favorites.list() }),
            Err(e) => warn!(event = "ws.favorites_add_failed", error = %e),
        },
        ClientEvent::FavoritesRemove { id } => {
            let _ = state.favorites.remove_where(|v| v.get("id").and_then(|x| x.as_str()) == Some(id.as_str()));
            conn.send_json(&ServerEvent::FavoritesSync { items: state.favorites.list() });
        }
        ClientEvent::CommandsAdd { item } => match state.commands.add(item) {
            Ok(_) => conn.send_json(&ServerEvent::CommandsSync { items: state.commands.list() }),
            Err(e) => warn!(event = "ws.commands_add_failed", error = %e),
        },
        ClientEvent::CommandsRemove { id } => {
            let _ = state.commands.remove_where(|v| v.get("id").and_then(|x| x.as_str()) == Some(id.as_str()));
            conn.send_json(&ServerEvent::CommandsSync { items: state.commands.list() });
        }
    }
}

fn broadcast_tabs(conn: &ConnState, state: &AppState) {
    conn.send_json(&ServerEvent::TabsSync {
        tabs: state.tabs.get(),
        last_modified: state.tabs.last_modified(),
    });
}

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn = std::sync::Arc::new(ConnState {
        client_id: client_id.clone(),
        terminal_sessions: Mutex::new(HashMap::new()),
        replica_sessions: Mutex::new(HashSet::new()),
        history_sent: Mutex::new(HashSet::new()),
        forwarders: Mutex::new(HashMap::new()),
        out_tx,
    });

    info!(event = "ws.connected", client_id = %client_id);
    broadcast_tabs(&conn, &state);
    conn.send_json(&ServerEvent::FavoritesSync { items: state.favorites.list() });
    conn.send_json(&ServerEvent::CommandsSync { items: state.commands.list() });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&conn, &state, event).await,
            Err(e) => warn!(event = "ws.bad_message", client_id = %client_id, error = %e),
        }
    }

    info!(event = "ws.disconnected", client_id = %client_id);
    state.hub.client_disconnect(&client_id);
    for (_, handle) in conn.forwarders.lock().expect("forwarders mutex").drain() {
        handle.abort();
    }
    writer.abort();
}
