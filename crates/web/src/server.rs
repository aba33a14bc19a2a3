//! Provisioning API server

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use sixtun_common::BrokerConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::tunnels::{routes, TunnelService};

/// Shared API state
pub struct AppState {
    pub service: TunnelService,
    pub config: BrokerConfig,
}

/// Every API route requires the pre-shared key in `X-API-Key`
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != state.config.api.key {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid API key" })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": sixtun_common::VERSION }))
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/tunnels", post(routes::create_tunnel).get(routes::list_tunnels))
        .route(
            "/tunnels/:id",
            get(routes::get_tunnel).delete(routes::delete_tunnel),
        )
        .route("/tunnels/:id/ip", patch(routes::update_client_ip))
        .route("/tunnels/:id/suspend", post(routes::suspend_tunnel))
        .route("/tunnels/:id/activate", post(routes::activate_tunnel))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state);

    Router::new()
        .route("/healthz", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
}
