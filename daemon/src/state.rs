//! Shared application state handed to every Axum handler: the session hub plus the four
//! persistent stores and the port-proxy state, generalized from a single session
//! registry to the full set of collaborators the transport and HTTP layers need.

use std::sync::Arc;

use shellhub_core::hub::SessionHub;
use shellhub_core::pin_settings::PinSettingsStore;
use shellhub_core::portproxy::PortProxyState;
use shellhub_core::tabs::{ItemListStore, TabStore};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub tabs: Arc<TabStore>,
    pub favorites: Arc<ItemListStore>,
    pub commands: Arc<ItemListStore>,
    pub pin_settings: Arc<PinSettingsStore>,
    pub proxy: Arc<PortProxyState>,
}
