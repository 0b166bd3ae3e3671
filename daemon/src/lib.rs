//! Terminal-tunnel daemon: thin HTTP surface plus a tagged-JSON/binary WebSocket
//! transport over `shellhub-core`'s session hub.

pub mod http;
pub mod state;
pub mod wire;
pub mod ws;

use std::sync::Arc;

use shellhub_core::config::DaemonConfig;
use shellhub_core::hub::SessionHub;
use shellhub_core::pin_settings::PinSettingsStore;
use shellhub_core::portproxy::PortProxyState;
use shellhub_core::tabs::{ItemListStore, TabStore};

use crate::state::AppState;

/// Build every collaborator from `config` and hand back the state the HTTP/WS layers
/// share, plus the hub so the caller can spawn the idle sweeper and wire up shutdown.
pub fn build_state(config: &DaemonConfig) -> (AppState, Arc<SessionHub>) {
    shellhub_core::tabs::ensure_data_dir(&config.data_dir).ok();

    let hub = SessionHub::new(config.clone());
    let tabs = Arc::new(TabStore::load(&config.data_dir, config.max_tabs));
    let favorites = Arc::new(ItemListStore::load(&config.data_dir, "favorites.json"));
    let commands = Arc::new(ItemListStore::load(&config.data_dir, "commands.json"));
    let pin_settings = Arc::new(PinSettingsStore::load(&config.data_dir));
    let proxy = Arc::new(PortProxyState::new(
        config.port,
        std::time::Duration::from_secs(config.proxy_timeout_secs),
    ));

    let state = AppState {
        hub: Arc::clone(&hub),
        tabs,
        favorites,
        commands,
        pin_settings,
        proxy,
    };
    (state, hub)
}

/// Run the daemon until SIGTERM/SIGINT, then kill every session and clear tab
/// `sessionId`s before returning. Never outlives the sessions it owns past process exit.
pub async fn run(config: DaemonConfig) -> std::io::Result<()> {
    let (state, hub) = build_state(&config);
    let sweeper = hub.spawn_idle_sweeper();

    let serve = http::serve(state.clone(), config.bind_addr, config.port);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!(event = "daemon.shutting_down");
        }
    }

    sweeper.abort();
    hub.shutdown();
    state.tabs.reset_sessions();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
