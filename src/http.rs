//! HTTP surface of the room: the socket upgrade, the read-only canvas and
//! config endpoints, and static client assets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::session;

const SERVER_IDENT: &str = concat!("reichat-server/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let router = Router::new()
        .route("/socket", get(socket))
        .route("/config", get(get_config))
        .route("/canvas", get(get_canvas))
        .route("/layers/:n", get(get_layer));
    let router = match state.config.client_dir.as_deref() {
        Some(dir) if !dir.is_empty() => router.fallback_service(ServeDir::new(dir)),
        _ => router.fallback(|| async { StatusCode::NOT_FOUND }),
    };
    router
        .layer(middleware::from_fn(policy))
        .with_state(state)
}

/// Method policy plus the headers every response carries.
async fn policy(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let mut res = if method == Method::GET || method == Method::HEAD {
        next.run(req).await
    } else if method == Method::OPTIONS {
        let mut res = StatusCode::OK.into_response();
        res.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("HEAD, GET, OPTIONS"));
        res
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    };
    let headers = res.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_IDENT));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    res
}

async fn socket(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let remote = remote_addr(&state.config, &headers, peer);
    let engine = state.engine.clone();
    let config = state.config.clone();
    ws.on_upgrade(move |socket| session::serve(socket, engine, config, remote))
}

async fn get_config(State(state): State<AppState>) -> Response {
    Json(state.config.distributable()).into_response()
}

async fn get_canvas(State(state): State<AppState>) -> Response {
    match state.engine.flatten().await {
        Some(blob) => png_response(blob),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn get_layer(State(state): State<AppState>, Path(n): Path<String>) -> Response {
    let n: usize = match n.parse() {
        Ok(n) => n,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if n >= state.config.layer_count {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.engine.layer_snapshot(n).await {
        Some(blob) => png_response(blob),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn png_response(blob: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], blob).into_response()
}

/// The address logged for a connection. `X-Forwarded-For` is trusted only
/// when `forwardedHeaderType` is `XFF`, and only its first hop counts.
fn remote_addr(config: &Config, headers: &HeaderMap, peer: SocketAddr) -> String {
    if config.trusts_forwarded_for() {
        let first = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first) = first {
            return first.to_string();
        }
    }
    peer.to_string()
}
