//! A session is a PTY + its scrollback + attached viewers: one PTY handle, a bounded
//! scrollback ring, the set of clients currently bound to it, and a single long-lived
//! fanout subscription on the PTY's data stream. This is the hub's unit of ownership.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::pty::{self, PtyHandle, PtyRunState};

/// Opaque unique session identifier, assigned on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-assigned client identifier (one per WebSocket connection's lifetime).
pub type ClientId = String;

/// Per-client logical handle for a session; lets one client hold several terminals.
pub type TerminalId = String;

/// Output broadcast capacity (messages buffered per subscriber before it starts
/// lagging and misses chunks — subscribers are expected to drain promptly).
pub const LIVE_BROADCAST_CAP: usize = 256;

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What a session broadcasts to its room. One channel carries both so "one outbound
/// emit per session event, regardless of viewer count" covers dimension changes too,
/// not just PTY output.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Data(Bytes),
    Dimensions(u16, u16),
}

/// A PTY + scrollback ring + attachment set + last-activity clock + data-fanout
/// subscription list, as spec's Data Model names it.
pub struct Session {
    pub id: SessionId,
    pty: PtyHandle,
    resize_tx: pty::ResizeSender,
    scrollback: crate::scrollback::ScrollbackRing,
    dims: Mutex<(u16, u16)>,
    /// Clients bound via a `(client_id, terminal_id)` mapping (spec's "attachments").
    attachments: Mutex<HashSet<ClientId>>,
    /// Clients joined via `replica_attach` — in the room, not in the terminal-id map.
    replicas: Mutex<HashSet<ClientId>>,
    /// The client whose `create_terminal` call allocated this session. Only this
    /// client's resize events are authoritative (resize arbitration).
    pub creator_client_id: ClientId,
    pub created_at: u64,
    last_activity_at: AtomicU64,
    state: RwLock<PtyRunState>,
    /// Single fanout subscription point for PTY output (and dimension changes).
    /// Subscribing to it never re-subscribes the underlying PTY reader — there is
    /// exactly one of those, started once in `Session::create`.
    data_tx: broadcast::Sender<RoomEvent>,
}

impl Session {
    /// Allocates a PTY and starts its one long-lived fanout subscription: each output
    /// chunk is appended to scrollback, bumps `last_activity_at`, and is broadcast to
    /// whatever subscribers exist at the time.
    pub fn create(
        creator_client_id: ClientId,
        cols: u16,
        rows: u16,
        cwd: Option<std::path::PathBuf>,
        scrollback_cap: usize,
    ) -> anyhow::Result<Arc<Session>> {
        let (pty, mut data_rx, resize_tx, mut state_rx) = pty::spawn(cols, rows, cwd)?;
        let id = SessionId::new();
        let (data_tx, _) = broadcast::channel::<RoomEvent>(LIVE_BROADCAST_CAP);

        let session = Arc::new(Session {
            id,
            pty,
            resize_tx,
            scrollback: crate::scrollback::ScrollbackRing::new(scrollback_cap),
            dims: Mutex::new((cols, rows)),
            attachments: Mutex::new(HashSet::new()),
            replicas: Mutex::new(HashSet::new()),
            creator_client_id,
            created_at: unix_now_secs(),
            last_activity_at: AtomicU64::new(unix_now_secs()),
            state: RwLock::new(PtyRunState::Running),
            data_tx,
        });

        tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                while let Some(chunk) = data_rx.recv().await {
                    session.scrollback.append(&chunk);
                    session
                        .last_activity_at
                        .store(unix_now_secs(), Ordering::Relaxed);
                    let _ = session.data_tx.send(RoomEvent::Data(Bytes::from(chunk)));
                }
            }
        });

        tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                while let Some(s) = state_rx.recv().await {
                    let exited = matches!(s, PtyRunState::Exited { .. });
                    if let Ok(mut g) = session.state.write() {
                        *g = s;
                    }
                    if exited {
                        session.pty.mark_exited();
                        break;
                    }
                }
            }
        });

        Ok(session)
    }

    pub fn attach(&self, client_id: &str) {
        self.attachments.lock().expect("attachments mutex").insert(client_id.to_string());
    }

    pub fn detach(&self, client_id: &str) {
        self.attachments.lock().expect("attachments mutex").remove(client_id);
    }

    pub fn attach_replica(&self, client_id: &str) {
        self.replicas.lock().expect("replicas mutex").insert(client_id.to_string());
    }

    pub fn detach_replica(&self, client_id: &str) {
        self.replicas.lock().expect("replicas mutex").remove(client_id);
    }

    pub fn is_replica(&self, client_id: &str) -> bool {
        self.replicas.lock().expect("replicas mutex").contains(client_id)
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.lock().expect("attachments mutex").is_empty()
            || !self.replicas.lock().expect("replicas mutex").is_empty()
    }

    pub fn write(&self, bytes: &[u8]) {
        self.pty.write(bytes);
        self.last_activity_at.store(unix_now_secs(), Ordering::Relaxed);
    }

    /// Resize the PTY. Only the creator's resize is authoritative; callers are
    /// responsible for deciding whether `client_id` is the creator (see `hub.rs`) —
    /// this method always applies, by design, so the hub can also apply a restore.
    pub fn resize(&self, cols: u16, rows: u16) {
        *self.dims.lock().expect("dims mutex") = (cols, rows);
        let _ = self.resize_tx.send((cols, rows));
        self.last_activity_at.store(unix_now_secs(), Ordering::Relaxed);
        self.broadcast_dimensions(cols, rows);
    }

    pub fn dims(&self) -> (u16, u16) {
        *self.dims.lock().expect("dims mutex")
    }

    /// Broadcast the session's effective dimensions to the room, without changing the
    /// PTY size. Used by the hub to inform replica viewers of a resize they cannot
    /// themselves apply (resize arbitration).
    pub fn broadcast_dimensions(&self, cols: u16, rows: u16) {
        let _ = self.data_tx.send(RoomEvent::Dimensions(cols, rows));
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.scrollback.snapshot()
    }

    pub fn run_state(&self) -> PtyRunState {
        self.state.read().expect("state lock").clone()
    }

    pub fn last_activity_at(&self) -> u64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.data_tx.subscribe()
    }

    /// Dispose the PTY. The session is expected to be removed from the hub's registry
    /// by the caller right after this; `kill` itself does not touch any registry.
    pub fn kill(&self) {
        let _ = self.pty.kill();
        self.pty.mark_exited();
    }
}
