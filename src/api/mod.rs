pub mod error;
mod handlers;
pub mod origin;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::GatewayHandle;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;
use origin::OriginPolicy;

#[derive(Clone)]
pub struct AppState {
    pub gateway: GatewayHandle,
    pub shutdown: ShutdownCoordinator,
}

/// Configuration for the HTTP/WS router.
///
/// `origins` gates WebSocket upgrades only; the read-only HTTP routes answer
/// any origin. Use `RouterConfig::default()` in tests to accept every origin.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub origins: OriginPolicy,
}

impl RouterConfig {
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            origins: OriginPolicy::from_patterns(patterns),
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let policy = config.origins.clone();
    let ws = Router::new()
        .route("/ws", get(ws_collab))
        .layer(axum::middleware::from_fn(move |req, next| {
            origin::check_ws_origin(policy.clone(), req, next)
        }));

    let router = Router::new()
        .route("/health", get(health))
        .route("/sessions", get(session_list))
        .route("/sessions/{id}", get(session_get))
        .merge(ws)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ));

    router.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]),
    )
}
