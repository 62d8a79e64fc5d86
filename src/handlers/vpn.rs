use axum::{
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    models::{
        session::AuthUser,
        vpn_session::{SessionStatus, VpnSession},
    },
    state::AppState,
};

/// Envelope shared by every VPN endpoint.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: T,
}

/// Serializes `data` inside a success envelope.
fn success<T: Serialize>(data: T) -> Result<Response> {
    let body = sonic_rs::to_string(&ApiResponse { status: "success", data })
        .map_err(|e| AppError::Internal(format!("Response serialization failed: {}", e)))?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// An active session as shown to its owner.
#[derive(Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub client_ip: String,
    pub server_address: String,
    pub server_port: i32,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Base64 client configuration, only on connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl SessionView {
    fn new(session: &VpnSession, config: Option<String>) -> Self {
        Self {
            status: session.status,
            client_ip: session.client_ip.clone(),
            server_address: session.server_address.clone(),
            server_port: session.server_port,
            bytes_sent: session.bytes_sent,
            bytes_received: session.bytes_received,
            connected_at: session.connected_at,
            disconnected_at: session.disconnected_at,
            config,
        }
    }
}

/// Counters reported once no session is active. The timestamps are those of
/// the session just closed, or `null` when there was none.
#[derive(Serialize)]
pub struct DisconnectedView {
    pub status: SessionStatus,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl DisconnectedView {
    fn idle() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            bytes_sent: 0,
            bytes_received: 0,
            connected_at: None,
            disconnected_at: None,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum StatusView {
    Connected(SessionView),
    Disconnected(DisconnectedView),
}

/// The request payload for a statistics update. Both counters are required.
#[derive(Deserialize, Debug, Validate)]
pub struct UpdateStatsRequest {
    #[garde(range(min = 0))]
    pub bytes_sent: i64,
    #[garde(range(min = 0))]
    pub bytes_received: i64,
}

#[derive(Serialize)]
pub struct StatsView {
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

/// Handles `POST /api/vpn/connect`.
///
/// Runs on its own task so a dropped client connection cannot interrupt the
/// peer registration / persistence sequence halfway.
pub async fn connect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response> {
    tracing::info!("🔌 VPN connect requested by user {}", user.user_id);

    let sessions = Arc::clone(&state.sessions);
    let client_address = addr.ip().to_string();
    let outcome = tokio::spawn(async move { sessions.connect(user.user_id, &client_address).await })
        .await
        .map_err(|e| AppError::Internal(format!("Connect task failed: {}", e)))??;

    let config = general_purpose::STANDARD.encode(outcome.client_config.as_bytes());
    success(SessionView::new(&outcome.session, Some(config)))
}

/// Handles `POST /api/vpn/disconnect`.
pub async fn disconnect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response> {
    tracing::info!("🔌 VPN disconnect requested by user {}", user.user_id);

    let sessions = Arc::clone(&state.sessions);
    let outcome = tokio::spawn(async move { sessions.disconnect(user.user_id).await })
        .await
        .map_err(|e| AppError::Internal(format!("Disconnect task failed: {}", e)))??;

    success(DisconnectedView {
        status: SessionStatus::Disconnected,
        bytes_sent: outcome.bytes_sent,
        bytes_received: outcome.bytes_received,
        connected_at: outcome.session.as_ref().map(|s| s.connected_at),
        disconnected_at: outcome.session.as_ref().and_then(|s| s.disconnected_at),
    })
}

/// Handles `POST /api/vpn/stats`.
pub async fn update_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<UpdateStatsRequest>,
) -> Result<Response> {
    payload
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let session = state
        .sessions
        .update_stats(
            user.user_id,
            payload.bytes_sent.unsigned_abs(),
            payload.bytes_received.unsigned_abs(),
        )
        .await?;

    success(StatsView {
        bytes_sent: session.bytes_sent,
        bytes_received: session.bytes_received,
    })
}

/// Handles `GET /api/vpn/status`.
pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response> {
    let view = match state.sessions.status(user.user_id).await? {
        Some(session) => StatusView::Connected(SessionView::new(&session, None)),
        None => StatusView::Disconnected(DisconnectedView::idle()),
    };
    success(view)
}
