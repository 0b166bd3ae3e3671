//! Thin wrapper over OS pseudo-terminal spawning. Owns one OS process: spawn a login
//! shell, write, resize, stream output, report exit. Delivers bytes verbatim — no
//! line-buffering, no newline translation beyond what the shell itself produces.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

/// Login shell on Unix, cmd on Windows. Injects TERM/COLORTERM/LANG so the session is
/// seen as a modern 256-color, UTF-8 terminal by whatever shell starts up.
#[cfg(unix)]
fn shell_command() -> CommandBuilder {
    let mut c = CommandBuilder::new("bash");
    c.arg("-l");
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    c.env("LANG", "en_US.UTF-8");
    c
}

#[cfg(windows)]
fn shell_command() -> CommandBuilder {
    let mut c = CommandBuilder::new("cmd.exe");
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    c
}

/// The user's home directory, falling back to /tmp if it cannot be resolved — a PTY
/// always needs a cwd to spawn into.
fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Run state of the PTY child. Sent once as `Running`, then once more as `Exited` when
/// the shell process ends; never more than these two transitions.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyRunState {
    Running,
    Exited { exit_code: u32 },
}

/// Sender to request a PTY resize (cols, rows). A dedicated thread applies these via
/// `master.resize()` so resize never blocks the async runtime.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Writer + child handle for a live PTY. The reader side is consumed by `spawn()`'s
/// background thread and is not exposed here.
pub struct PtyHandle {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    exited: std::sync::atomic::AtomicBool,
}

impl PtyHandle {
    /// Write bytes to the shell's stdin. Silently dropped if the process has exited —
    /// callers never see an I/O error for a dead PTY.
    pub fn write(&self, bytes: &[u8]) {
        if self.exited.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        if let Ok(mut guard) = self.writer.lock() {
            let _ = guard.write_all(bytes);
            let _ = guard.flush();
        }
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Kill the PTY child process.
    pub fn kill(&self) -> std::io::Result<()> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }
}

/// Spawn a login shell in a PTY of the given size, in `cwd` (defaulting to the user's
/// home directory). Returns the handle, a receiver of raw output chunks, a resize
/// sender, and a receiver of run-state transitions.
pub fn spawn(
    cols: u16,
    rows: u16,
    cwd: Option<PathBuf>,
) -> anyhow::Result<(
    PtyHandle,
    mpsc::Receiver<Vec<u8>>,
    ResizeSender,
    mpsc::Receiver<PtyRunState>,
)> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut cmd = shell_command();
    cmd.cwd(cwd.unwrap_or_else(home_or_tmp));
    let child = pair.slave.spawn_command(cmd)?;

    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (state_tx, state_rx) = mpsc::channel::<PtyRunState>(4);

    let child = Arc::new(Mutex::new(child));

    // Blocking thread: read PTY stdout and forward to async land. Exactly one such
    // thread per session, started here and never restarted.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resize requests as they arrive.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            let _ = master.resize(size);
        }
    });

    // Poll try_wait(); report Running once, then Exited with the exit code.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || {
        let mut sent_running = false;
        loop {
            let exit_status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(s)) => Some(s.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(code) = exit_status {
                let _ = state_tx.blocking_send(PtyRunState::Exited { exit_code: code });
                break;
            }
            if !sent_running {
                sent_running = true;
                let _ = state_tx.blocking_send(PtyRunState::Running);
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
    });

    let handle = PtyHandle {
        writer: Arc::new(Mutex::new(writer)),
        child,
        exited: std::sync::atomic::AtomicBool::new(false),
    };
    Ok((handle, rx, resize_tx, state_rx))
}
