//! Path-prefixed reverse proxy to localhost dev-servers. Framework-agnostic: this
//! module resolves which port a request targets and forwards it with `reqwest`; the
//! daemon's HTTP layer adapts axum request/response types to the small structs here.
//! WebSocket upgrade forwarding is handled in the daemon crate, which owns the WS framing.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::HubError;

/// Absolute dev-server prefixes resolved via Referer / last-active-port instead of an
/// explicit `/preview/{port}` segment.
pub const ABSOLUTE_DEV_PREFIXES: &[&str] = &[
    "/_next",
    "/@vite",
    "/@fs",
    "/@id",
    "/__vite",
    "/__webpack_hmr",
    "/node_modules/.vite",
];

pub fn is_absolute_dev_prefix(path: &str) -> bool {
    ABSOLUTE_DEV_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Parse `/preview/{port}/...` into `(port, rest_with_leading_slash)`.
pub fn parse_prefixed(path: &str) -> Option<(u16, String)> {
    let rest = path.strip_prefix("/preview/")?;
    let (port_str, tail) = rest.split_once('/').unwrap_or((rest, ""));
    let port: u16 = port_str.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((port, format!("/{tail}")))
}

/// Extract a port from a `Referer` header matching `.../preview/{port}/...`.
pub fn port_from_referer(referer: &str) -> Option<u16> {
    let idx = referer.find("/preview/")?;
    let rest = &referer[idx + "/preview/".len()..];
    let port_str = rest.split('/').next()?;
    port_str.parse().ok()
}

pub struct ProxyRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// CORS-permissive headers stamped on every proxied response so the dev-server can be
/// iframed cross-origin.
pub fn cors_headers() -> Vec<(String, String)> {
    vec![
        ("Access-Control-Allow-Origin".into(), "*".into()),
        ("Access-Control-Allow-Headers".into(), "*".into()),
        (
            "Access-Control-Allow-Methods".into(),
            "GET, POST, PUT, PATCH, DELETE, OPTIONS".into(),
        ),
    ]
}

pub struct PortProxyState {
    last_active_preview_port: Mutex<Option<u16>>,
    client: reqwest::Client,
    pub daemon_port: u16,
}

impl PortProxyState {
    pub fn new(daemon_port: u16, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            last_active_preview_port: Mutex::new(None),
            client,
            daemon_port,
        }
    }

    pub fn note_active_port(&self, port: u16) {
        *self.last_active_preview_port.lock().expect("proxy state mutex") = Some(port);
    }

    pub fn last_active_port(&self) -> Option<u16> {
        *self.last_active_preview_port.lock().expect("proxy state mutex")
    }

    /// Resolution order for absolute dev-server prefixes: Referer first, then the
    /// process-wide last-active-port.
    pub fn resolve_absolute_port(&self, referer: Option<&str>) -> Option<u16> {
        referer.and_then(port_from_referer).or_else(|| self.last_active_port())
    }

    pub async fn forward(&self, port: u16, req: ProxyRequest) -> Result<ProxyResponse, HubError> {
        let url = format!("http://127.0.0.1:{port}{}", req.path_and_query);
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| HubError::BadRequest(format!("invalid method {}", req.method)))?;
        let mut builder = self.client.request(method, &url);
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        let resp = builder
            .body(req.body)
            .send()
            .await
            .map_err(|e| HubError::UpstreamUnavailable(format!("port {port}: {e}")))?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| HubError::UpstreamUnavailable(format!("port {port}: {e}")))?
            .to_vec();
        Ok(ProxyResponse { status, headers, body })
    }
}

/// Terminate any process listening on `port`. Refuses the daemon's own port and ports
/// below 1024. Returns the PIDs killed, or `NotFound` if nothing is listening.
pub fn kill_port(state: &PortProxyState, port: u16) -> Result<Vec<u32>, HubError> {
    if port == state.daemon_port {
        return Err(HubError::Forbidden("refusing to kill the daemon's own port".into()));
    }
    if port < 1024 {
        return Err(HubError::Forbidden("refusing to kill a privileged port".into()));
    }
    let killed = kill_listeners(port)?;
    if killed.is_empty() {
        Err(HubError::NotFound(format!("no process listening on port {port}")))
    } else {
        Ok(killed)
    }
}

/// Unconditional version of the kill-port mechanism, used only by the daemon's own
/// startup path to clear a stale process still holding its configured bind port before
/// the first `TcpListener::bind` attempt — at that point the port is not yet "the
/// daemon's own port" in the sense `kill_port`'s guard means (nothing is bound to it
/// yet), so the guard does not apply.
pub fn force_free_port(port: u16) -> Vec<u32> {
    kill_listeners(port).unwrap_or_default()
}

fn kill_listeners(port: u16) -> Result<Vec<u32>, HubError> {
    use sysinfo::System;
    let pids = pids_listening_on(port)?;
    if pids.is_empty() {
        return Ok(Vec::new());
    }
    let mut system = System::new_all();
    system.refresh_all();
    let mut killed = Vec::new();
    for pid in pids {
        if let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) {
            if process.kill() {
                killed.push(pid);
            }
        }
    }
    Ok(killed)
}

/// Enumerate PIDs with a listening socket on `port`. `sysinfo` does not expose socket
/// tables directly, so this reads `/proc/net/tcp{,6}` for the listening inode and maps
/// it back to a PID via `/proc/{pid}/fd`, the same approach command-line tools like
/// `fuser` use on Linux.
#[cfg(target_os = "linux")]
fn pids_listening_on(port: u16) -> Result<Vec<u32>, HubError> {
    let mut inodes = std::collections::HashSet::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(local), Some(state), Some(inode)) = (fields.first(), fields.get(3), fields.get(9)) else {
                continue;
            };
            // state 0A = TCP_LISTEN
            if *state != "0A" {
                continue;
            }
            let Some((_, port_hex)) = local.split_once(':') else {
                continue;
            };
            if u16::from_str_radix(port_hex, 16) == Ok(port) {
                if let Ok(ino) = inode.parse::<u64>() {
                    inodes.insert(ino);
                }
            }
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut pids = Vec::new();
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return Ok(pids);
    };
    for entry in proc_entries.filter_map(|e| e.ok()) {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.filter_map(|f| f.ok()) {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                let target = target.to_string_lossy();
                if let Some(ino_str) = target.strip_prefix("socket:[").and_then(|s| s.strip_suffix(']')) {
                    if let Ok(ino) = ino_str.parse::<u64>() {
                        if inodes.contains(&ino) {
                            pids.push(pid);
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(pids)
}

#[cfg(not(target_os = "linux"))]
fn pids_listening_on(_port: u16) -> Result<Vec<u32>, HubError> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_path() {
        assert_eq!(parse_prefixed("/preview/5173/x/y"), Some((5173, "/x/y".to_string())));
        assert_eq!(parse_prefixed("/preview/5173"), Some((5173, "/".to_string())));
        assert_eq!(parse_prefixed("/preview/5173/"), Some((5173, "/".to_string())));
        assert_eq!(parse_prefixed("/preview/abc/"), None);
        assert_eq!(parse_prefixed("/other"), None);
    }

    #[test]
    fn extracts_port_from_referer() {
        assert_eq!(port_from_referer("http://host/preview/5173/"), Some(5173));
        assert_eq!(port_from_referer("http://host/preview/5173/sub/path"), Some(5173));
        assert_eq!(port_from_referer("http://host/nope"), None);
    }

    #[test]
    fn recognizes_absolute_dev_prefixes() {
        assert!(is_absolute_dev_prefix("/@vite/client"));
        assert!(is_absolute_dev_prefix("/_next/static/chunk.js"));
        assert!(!is_absolute_dev_prefix("/api/sessions"));
    }

    #[test]
    fn resolves_absolute_port_referer_then_last_active() {
        let state = PortProxyState::new(3456, Duration::from_secs(1));
        assert_eq!(state.resolve_absolute_port(None), None);
        state.note_active_port(5173);
        assert_eq!(state.resolve_absolute_port(None), Some(5173));
        assert_eq!(
            state.resolve_absolute_port(Some("http://host/preview/4000/")),
            Some(4000)
        );
    }

    #[test]
    fn kill_port_refuses_daemon_port() {
        let state = PortProxyState::new(3456, Duration::from_secs(1));
        let err = kill_port(&state, 3456).unwrap_err();
        assert!(matches!(err, HubError::Forbidden(_)));
    }

    #[test]
    fn kill_port_refuses_privileged_port() {
        let state = PortProxyState::new(3456, Duration::from_secs(1));
        let err = kill_port(&state, 80).unwrap_err();
        assert!(matches!(err, HubError::Forbidden(_)));
    }
}
