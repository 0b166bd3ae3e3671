//! The thin HTTP surface: health, pin-settings, kill-port, and the localhost
//! dev-server reverse proxy including WebSocket-upgrade forwarding. Tab/favorites/commands
//! CRUD is reflect-and-broadcast over the WebSocket transport in `ws.rs`, not HTTP —
//! every mutation already needs to broadcast a sync event to other connected clients,
//! so the socket path covers both without a second code path.

use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as TMessage;
use tracing::warn;

use shellhub_core::pin_settings::PinSettingsPatch;
use shellhub_core::portproxy::{self, ProxyRequest};

use crate::state::AppState;
use crate::ws::handle_socket;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/api/pin-settings", get(get_pin_settings).put(put_pin_settings))
        .route("/api/kill-port/{port}", post(kill_port_handler))
        .route("/preview/{port}", any(proxy_prefixed_handler))
        .route("/preview/{port}/{*rest}", any(proxy_prefixed_handler))
        .fallback(any(proxy_fallback_handler))
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": shellhub_core::session::unix_now_secs(),
    }))
}

async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn get_pin_settings(State(state): State<AppState>) -> Json<shellhub_core::pin_settings::PinSettings> {
    Json(state.pin_settings.get())
}

async fn put_pin_settings(
    State(state): State<AppState>,
    Json(patch): Json<PinSettingsPatch>,
) -> Result<Json<shellhub_core::pin_settings::PinSettings>, (StatusCode, String)> {
    state
        .pin_settings
        .update(patch)
        .map(Json)
        .map_err(hub_error_response)
}

async fn kill_port_handler(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    portproxy::kill_port(&state.proxy, port)
        .map(|pids| Json(serde_json::json!({ "killed": pids })))
        .map_err(hub_error_response)
}

fn hub_error_response(e: shellhub_core::error::HubError) -> (StatusCode, String) {
    use shellhub_core::error::HubError::*;
    let status = match e {
        BadRequest(_) => StatusCode::BAD_REQUEST,
        Forbidden(_) => StatusCode::FORBIDDEN,
        NotFound(_) => StatusCode::NOT_FOUND,
        Conflict(_) => StatusCode::CONFLICT,
        UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn options_response() -> Response {
    let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
    for (k, v) in portproxy::cors_headers() {
        builder = builder.header(k, v);
    }
    builder.body(axum::body::Body::empty()).unwrap()
}

fn proxy_response_into(resp: shellhub_core::portproxy::ProxyResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    for (k, v) in resp.headers.into_iter().chain(portproxy::cors_headers()) {
        builder = builder.header(k, v);
    }
    builder.body(axum::body::Body::from(resp.body)).unwrap()
}

async fn do_forward(state: &AppState, port: u16, path_and_query: String, parts: &axum::http::request::Parts, body: axum::body::Body) -> Response {
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let proxy_req = ProxyRequest {
        method: parts.method.to_string(),
        path_and_query,
        headers: header_pairs(&parts.headers),
        body: body_bytes,
    };
    match state.proxy.forward(port, proxy_req).await {
        Ok(resp) => proxy_response_into(resp),
        Err(e) => {
            let (status, msg) = hub_error_response(e);
            (status, Json(serde_json::json!({ "error": msg, "port": port }))).into_response()
        }
    }
}

/// `/preview/{port}/...`: strip the prefix, note the active port, forward. A plain
/// `Request` extractor must be last in the handler signature since it consumes the body;
/// `ws` is `Option<WebSocketUpgrade>` so non-upgrade requests fall through untouched.
async fn proxy_prefixed_handler(
    State(state): State<AppState>,
    Path(_port): Path<u16>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let Some((port, rest)) = portproxy::parse_prefixed(parts.uri.path()) else {
        return (StatusCode::NOT_FOUND, "not a preview path").into_response();
    };
    state.proxy.note_active_port(port);

    if parts.method == axum::http::Method::OPTIONS {
        return options_response();
    }
    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| forward_ws(socket, port, rest));
    }
    do_forward(&state, port, format!("{rest}{query}"), &parts, body).await
}

/// Catch-all for absolute dev-server prefixes (`/@vite`, `/_next`, ...), resolved via
/// Referer then `last_active_preview_port`. Anything else not otherwise routed is 404.
async fn proxy_fallback_handler(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    if !portproxy::is_absolute_dev_prefix(&path) {
        return (StatusCode::NOT_FOUND, "no route").into_response();
    }
    if parts.method == axum::http::Method::OPTIONS {
        return options_response();
    }

    let referer = parts.headers.get("referer").and_then(|v| v.to_str().ok());
    let Some(port) = state.proxy.resolve_absolute_port(referer) else {
        return (StatusCode::BAD_REQUEST, "No active preview").into_response();
    };

    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| forward_ws(socket, port, path));
    }
    do_forward(&state, port, format!("{path}{query}"), &parts, body).await
}

/// Pipe an already-upgraded client WebSocket to `ws://127.0.0.1:{port}{rest}`, forwarding
/// frames in both directions until either side closes. Upstream refusal just ends the
/// connection — the daemon itself never panics on a bad proxy target.
async fn forward_ws(client_socket: axum::extract::ws::WebSocket, port: u16, rest: String) {
    let upstream_url = format!("ws://127.0.0.1:{port}{rest}");
    let upstream = match tokio_tungstenite::connect_async(&upstream_url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(event = "portproxy.ws_upstream_unavailable", port, error = %e);
            return;
        }
    };
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client_socket.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                axum::extract::ws::Message::Text(t) => TMessage::Text(t.to_string().into()),
                axum::extract::ws::Message::Binary(b) => TMessage::Binary(b.to_vec().into()),
                axum::extract::ws::Message::Ping(p) => TMessage::Ping(p.to_vec().into()),
                axum::extract::ws::Message::Pong(p) => TMessage::Pong(p.to_vec().into()),
                axum::extract::ws::Message::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };
    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                TMessage::Text(t) => axum::extract::ws::Message::Text(t.to_string().into()),
                TMessage::Binary(b) => axum::extract::ws::Message::Binary(b.to_vec().into()),
                TMessage::Ping(p) => axum::extract::ws::Message::Ping(p.to_vec().into()),
                TMessage::Pong(p) => axum::extract::ws::Message::Pong(p.to_vec().into()),
                TMessage::Close(_) => break,
                TMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = to_upstream => {}
        _ = to_client => {}
    }
}

/// Bind the listening socket, retrying once after an attempted cleanup if the port is
/// already occupied by a stale process from a previous run. A second failure is fatal
/// (spec: "1 on fatal startup failure (port unavailable after cleanup attempt)").
async fn bind_with_cleanup(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let killed = portproxy::force_free_port(addr.port());
            if killed.is_empty() {
                return Err(e);
            }
            warn!(event = "daemon.bind_cleanup", port = addr.port(), ?killed);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            tokio::net::TcpListener::bind(addr).await
        }
        Err(e) => Err(e),
    }
}

pub async fn serve(state: AppState, bind_addr: std::net::IpAddr, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::new(bind_addr, port);
    let app = router(state);
    let listener = bind_with_cleanup(addr).await?;
    tracing::info!(event = "daemon.listening", %addr);
    axum::serve(listener, app).await
}
