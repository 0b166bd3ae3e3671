//! Standalone terminal-tunnel daemon binary.

use clap::Parser;
use shellhub_core::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "shellhubd", about = "Self-hosted multi-client remote-terminal bridge daemon")]
struct Cli {
    /// Bind port (overrides config.toml and the PORT env var).
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for tabs.json, pin-settings.json, favorites.json, commands.json,
    /// and config.toml. Defaults to `$HOME/.terminal-tunnel`.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Log file path. Defaults to stderr only.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(shellhub_core::config::default_data_dir);
    let mut config = DaemonConfig::load(data_dir).apply_port_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ref log_file) = cli.log_file {
        config.log_file = Some(log_file.clone());
    }

    let _guard = init_tracing(config.log_file.as_deref());

    tracing::info!(event = "daemon.starting", port = config.port, data_dir = %config.data_dir.display());

    match shellhub_daemon::run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(event = "daemon.fatal", error = %e);
            std::process::ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging to stderr, plus a rolling daily file appender when a log
/// path is configured. Returns the guard that must stay alive for the file writer to flush.
fn init_tracing(log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("shellhubd.log"));
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}
