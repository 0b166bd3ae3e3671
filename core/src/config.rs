//! Daemon configuration: an optional `config.toml` under the data directory, overridable
//! by CLI flags and the `PORT` env var. Falls back to documented defaults when absent.

use std::path::PathBuf;

/// Reference default bind port (spec's "reference default 3456").
pub const DEFAULT_PORT: u16 = 3456;

/// Scrollback capacity. Spec leaves this an open question and recommends >= 256 KiB.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;

/// Idle sessions (no attachments) are evicted after this long with no I/O.
pub const DEFAULT_IDLE_TTL_SECS: u64 = 30 * 60;

/// How often the idle-eviction sweep runs.
pub const DEFAULT_IDLE_SWEEP_SECS: u64 = 120;

/// Timeout for port-proxy upstream requests.
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;

/// Hard cap on tab count.
pub const DEFAULT_MAX_TABS: usize = 10;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
struct FileConfig {
    port: Option<u16>,
    scrollback_bytes: Option<usize>,
    idle_ttl_secs: Option<u64>,
    idle_sweep_secs: Option<u64>,
    proxy_timeout_secs: Option<u64>,
    max_tabs: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: std::net::IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub scrollback_bytes: usize,
    pub idle_ttl_secs: u64,
    pub idle_sweep_secs: u64,
    pub proxy_timeout_secs: u64,
    pub max_tabs: usize,
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
            idle_sweep_secs: DEFAULT_IDLE_SWEEP_SECS,
            proxy_timeout_secs: DEFAULT_PROXY_TIMEOUT_SECS,
            max_tabs: DEFAULT_MAX_TABS,
            log_file: None,
        }
    }
}

/// `$HOME/.terminal-tunnel/`, the fixed location for persisted tab/settings documents.
pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".terminal-tunnel")
}

impl DaemonConfig {
    /// Load `config.toml` from `data_dir` if present, falling back to defaults for any
    /// field it does not set. A missing or unparsable file just means "use defaults" —
    /// this is a convenience layer, not a hard requirement.
    pub fn load(data_dir: PathBuf) -> Self {
        let mut cfg = Self {
            data_dir: data_dir.clone(),
            ..Self::default()
        };
        let path = data_dir.join("config.toml");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return cfg;
        };
        let Ok(file) = toml::from_str::<FileConfig>(&raw) else {
            tracing::warn!(event = "config.parse_failed", path = %path.display());
            return cfg;
        };
        if let Some(v) = file.port {
            cfg.port = v;
        }
        if let Some(v) = file.scrollback_bytes {
            cfg.scrollback_bytes = v;
        }
        if let Some(v) = file.idle_ttl_secs {
            cfg.idle_ttl_secs = v;
        }
        if let Some(v) = file.idle_sweep_secs {
            cfg.idle_sweep_secs = v;
        }
        if let Some(v) = file.proxy_timeout_secs {
            cfg.proxy_timeout_secs = v;
        }
        if let Some(v) = file.max_tabs {
            cfg.max_tabs = v;
        }
        cfg
    }

    /// Apply the `PORT` env var, matching spec's documented override.
    pub fn apply_port_env(mut self) -> Self {
        if let Ok(s) = std::env::var("PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.port = p;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load(dir.path().to_path_buf());
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.scrollback_bytes, DEFAULT_SCROLLBACK_BYTES);
    }

    #[test]
    fn overrides_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9000\nmax_tabs = 3\n").unwrap();
        let cfg = DaemonConfig::load(dir.path().to_path_buf());
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_tabs, 3);
        assert_eq!(cfg.idle_ttl_secs, DEFAULT_IDLE_TTL_SECS);
    }

    #[test]
    fn port_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 9000\n").unwrap();
        std::env::set_var("PORT", "4242");
        let cfg = DaemonConfig::load(dir.path().to_path_buf()).apply_port_env();
        std::env::remove_var("PORT");
        assert_eq!(cfg.port, 4242);
    }
}
