//! The policy layer: registry of sessions keyed by session-id and by logical
//! terminal-id-per-client; drives creation, attach/detach, input routing, resize
//! arbitration, idle eviction, and shutdown. Two maps, each serialized independently
//! via `DashMap` so a lock is held only for map operations, never across PTY/transport
//! I/O.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::HubError;
use crate::pty::PtyRunState;
use crate::session::{unix_now_secs, ClientId, Session, SessionId, TerminalId};

/// Result of `create_terminal`: whether an existing session was restored, plus
/// everything the caller needs to reply to the requesting client.
pub struct CreateOutcome {
    pub session_id: SessionId,
    pub restored: bool,
    pub scrollback: Vec<u8>,
    pub cols: u16,
    pub rows: u16,
}

pub struct ReplicaAttachOutcome {
    pub scrollback: Vec<u8>,
    pub cols: u16,
    pub rows: u16,
}

/// What happened to a resize request, so the transport adapter knows whether to
/// broadcast a `dimensions` event (always) and whether it actually took effect.
pub struct ResizeOutcome {
    pub applied: bool,
    pub cols: u16,
    pub rows: u16,
}

pub struct SessionHub {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// `(client_id, terminal_id) -> session_id`. A client may hold several logical
    /// terminals, each bound to at most one session.
    client_terminals: DashMap<(ClientId, TerminalId), SessionId>,
    config: DaemonConfig,
}

impl SessionHub {
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            client_terminals: DashMap::new(),
            config,
        })
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Race-proof lookup: any live session already associated with this terminal_id
    /// from *any* client, used by step 2 of create-or-restore.
    fn find_session_by_terminal_id(&self, terminal_id: &str) -> Option<SessionId> {
        self.client_terminals
            .iter()
            .find(|e| e.key().1 == terminal_id)
            .map(|e| *e.value())
    }

    /// `create_terminal(client_id, terminal_id, cols, rows, hint_session_id?)`.
    pub fn create_terminal(
        &self,
        client_id: ClientId,
        terminal_id: TerminalId,
        cols: u16,
        rows: u16,
        hint_session_id: Option<SessionId>,
        cwd: Option<std::path::PathBuf>,
    ) -> Result<CreateOutcome, HubError> {
        if cols == 0 || rows == 0 {
            return Err(HubError::BadRequest("cols/rows must be > 0".into()));
        }

        if let Some(hint) = hint_session_id {
            if let Some(session) = self.get_session(hint) {
                session.attach(&client_id);
                self.client_terminals
                    .insert((client_id, terminal_id), hint);
                let (c, r) = session.dims();
                return Ok(CreateOutcome {
                    session_id: hint,
                    restored: true,
                    scrollback: session.snapshot(),
                    cols: c,
                    rows: r,
                });
            }
        }

        if let Some(existing) = self.find_session_by_terminal_id(&terminal_id) {
            if let Some(session) = self.get_session(existing) {
                session.attach(&client_id);
                self.client_terminals
                    .insert((client_id, terminal_id), existing);
                let (c, r) = session.dims();
                return Ok(CreateOutcome {
                    session_id: existing,
                    restored: true,
                    scrollback: session.snapshot(),
                    cols: c,
                    rows: r,
                });
            }
        }

        let session = Session::create(client_id.clone(), cols, rows, cwd, self.config.scrollback_bytes)
            .map_err(|e| HubError::Transient(format!("failed to spawn pty: {e}")))?;
        let session_id = session.id;
        session.attach(&client_id);
        self.sessions.insert(session_id, Arc::clone(&session));
        self.client_terminals
            .insert((client_id, terminal_id), session_id);

        info!(event = "hub.session.created", session_id = %session_id);

        Ok(CreateOutcome {
            session_id,
            restored: false,
            scrollback: Vec::new(),
            cols,
            rows,
        })
    }

    /// `input(client_id, terminal_id, bytes)`. Unknown mapping is a silent no-op with a
    /// warning log.
    pub fn input(&self, client_id: &str, terminal_id: &str, bytes: &[u8]) {
        let key = (client_id.to_string(), terminal_id.to_string());
        match self.client_terminals.get(&key) {
            Some(session_id) => {
                if let Some(session) = self.get_session(*session_id) {
                    session.write(bytes);
                }
            }
            None => {
                warn!(event = "hub.input.unknown_mapping", client_id, terminal_id);
            }
        }
    }

    /// Resize arbitration: only the creating client's resize is authoritative.
    /// Replica resizes (and non-creator resizes generally) are ignored but the caller
    /// still gets back the session's *actual* dimensions to broadcast as `dimensions`.
    pub fn resize(&self, client_id: &str, terminal_id: &str, cols: u16, rows: u16) -> Option<ResizeOutcome> {
        let key = (client_id.to_string(), terminal_id.to_string());
        let session_id = *self.client_terminals.get(&key)?;
        let session = self.get_session(session_id)?;
        if session.creator_client_id == client_id {
            session.resize(cols, rows);
            let (c, r) = session.dims();
            Some(ResizeOutcome { applied: true, cols: c, rows: r })
        } else {
            let (c, r) = session.dims();
            session.broadcast_dimensions(c, r);
            Some(ResizeOutcome { applied: false, cols: c, rows: r })
        }
    }

    /// `replica_attach(client_id, session_id)`: joins a client to a session's room
    /// without placing it in the `(client_id, terminal_id)` map.
    pub fn replica_attach(&self, client_id: &str, session_id: SessionId) -> Result<ReplicaAttachOutcome, HubError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| HubError::NotFound(format!("session {session_id}")))?;
        session.attach_replica(client_id);
        let (cols, rows) = session.dims();
        Ok(ReplicaAttachOutcome {
            scrollback: session.snapshot(),
            cols,
            rows,
        })
    }

    pub fn replica_leave(&self, client_id: &str, session_id: SessionId) {
        if let Some(session) = self.get_session(session_id) {
            session.detach_replica(client_id);
        }
    }

    /// Replica input is accepted and written to the PTY; replica resize is a no-op
    /// (enforced by the transport adapter never calling `resize` for a replica path).
    pub fn replica_input(&self, client_id: &str, session_id: SessionId, bytes: &[u8]) {
        if let Some(session) = self.get_session(session_id) {
            if session.is_replica(client_id) {
                session.write(bytes);
            }
        }
    }

    /// `destroy_terminal(client_id, terminal_id)`: removes the mapping, detaches from
    /// the session. The session is only killed if it now has no attachments AND was
    /// created by this client AND this was an explicit destroy (not a disconnect).
    pub fn destroy_terminal(&self, client_id: &str, terminal_id: &str) {
        let key = (client_id.to_string(), terminal_id.to_string());
        let Some((_, session_id)) = self.client_terminals.remove(&key) else {
            return;
        };
        let Some(session) = self.get_session(session_id) else {
            return;
        };
        session.detach(client_id);
        if !session.has_attachments() && session.creator_client_id == client_id {
            session.kill();
            self.sessions.remove(&session_id);
            info!(event = "hub.session.destroyed", session_id = %session_id);
        }
    }

    /// On plain client disconnect: detach all of the client's terminals and replica
    /// memberships, but never kill a session — only reconnection or explicit destroy
    /// does that.
    pub fn client_disconnect(&self, client_id: &str) {
        let keys: Vec<_> = self
            .client_terminals
            .iter()
            .filter(|e| e.key().0 == client_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, session_id)) = self.client_terminals.remove(&key) {
                if let Some(session) = self.get_session(session_id) {
                    session.detach(client_id);
                }
            }
        }
        for entry in self.sessions.iter() {
            entry.value().detach_replica(client_id);
        }
    }

    pub fn session_running(&self, id: SessionId) -> bool {
        self.get_session(id)
            .map(|s| matches!(s.run_state(), PtyRunState::Running))
            .unwrap_or(false)
    }

    /// Periodic sweep: kill any session with empty attachments whose last activity is
    /// older than the idle TTL, or whose PTY has already exited.
    pub fn sweep_idle_and_dead(&self) {
        let now = unix_now_secs();
        let ttl = self.config.idle_ttl_secs;
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                matches!(s.run_state(), PtyRunState::Exited { .. })
                    || (!s.has_attachments() && now.saturating_sub(s.last_activity_at()) > ttl)
            })
            .map(|e| *e.key())
            .collect();
        for id in dead {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.kill();
                info!(event = "hub.session.idle_evicted", session_id = %id);
            }
        }
    }

    /// Spawn the background idle-eviction task. Returns its `JoinHandle` so the caller
    /// can abort it on shutdown.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = std::time::Duration::from_secs(hub.config.idle_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                hub.sweep_idle_and_dead();
            }
        })
    }

    /// Kill every session. Called on daemon shutdown.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().kill();
        }
        self.sessions.clear();
        self.client_terminals.clear();
    }
}
