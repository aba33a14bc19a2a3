//! Provisioning API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sixtun_common::{parse_user_id, Error, TunnelType, TunnelWithCommands};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::error;

use crate::server::AppState;

/// API error with a status reflecting the error class
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::TunnelLimitReached { .. } => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidUserId(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    #[serde(rename = "type")]
    tunnel_type: TunnelType,
    user_id: String,
    client_ipv4: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientIpRequest {
    client_ipv4: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    user_id: Option<String>,
}

fn validate_ipv4(address: &str) -> Result<(), ApiError> {
    address
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ApiError::bad_request(format!("invalid IPv4 address: {}", address)))
}

/// POST /api/v1/tunnels
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<Json<TunnelWithCommands>, ApiError> {
    parse_user_id(&req.user_id)?;
    validate_ipv4(&req.client_ipv4)?;

    let server_ipv4 = state.config.server.ipv4.clone();
    if server_ipv4.is_empty() {
        return Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "server_ipv4 is not configured".to_string(),
        });
    }

    let (tunnel, commands) = state
        .service
        .create(req.tunnel_type, &req.user_id, &req.client_ipv4, &server_ipv4)
        .await?;
    Ok(Json(TunnelWithCommands { tunnel, commands }))
}

/// GET /api/v1/tunnels[?user_id=]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TunnelWithCommands>>, ApiError> {
    let tunnels = state.service.list(query.user_id.as_deref())?;
    Ok(Json(tunnels))
}

/// GET /api/v1/tunnels/:id
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelWithCommands>, ApiError> {
    Ok(Json(state.service.get(&id)?))
}

/// PATCH /api/v1/tunnels/:id/ip
pub async fn update_client_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateClientIpRequest>,
) -> Result<Json<TunnelWithCommands>, ApiError> {
    validate_ipv4(&req.client_ipv4)?;
    Ok(Json(state.service.update_client_ip(&id, &req.client_ipv4).await?))
}

/// DELETE /api/v1/tunnels/:id
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/tunnels/:id/suspend
pub async fn suspend_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelWithCommands>, ApiError> {
    Ok(Json(state.service.suspend(&id).await?))
}

/// POST /api/v1/tunnels/:id/activate
pub async fn activate_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelWithCommands>, ApiError> {
    Ok(Json(state.service.activate(&id).await?))
}
