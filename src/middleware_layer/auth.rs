use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use redis::AsyncCommands;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    models::session::{AuthSession, AuthUser},
    state::AppState,
};

/// Extracts the session token from the request cookies.
fn extract_session_token(cookies: &Cookies) -> Option<Uuid> {
    cookies
        .get("session_id")
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

/// A middleware that requires a valid login session.
///
/// Resolves the `session_id` cookie against `session:<id>` in Redis and
/// places the caller's [`AuthUser`] in the request extensions.
pub async fn require_auth(
    State(mut state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    tracing::debug!("🔐 Checking authentication...");

    let session_id = extract_session_token(&cookies)
        .ok_or_else(|| {
            tracing::warn!("❌ No session_id cookie found");
            StatusCode::FORBIDDEN
        })?;

    let session_json: Option<String> = state
        .redis
        .get(format!("session:{}", session_id))
        .await
        .map_err(|e| {
            tracing::warn!("❌ Redis error while loading session: {}", e);
            StatusCode::FORBIDDEN
        })?;

    let session_json = session_json.ok_or_else(|| {
        tracing::warn!("❌ Session {} not found", session_id);
        StatusCode::FORBIDDEN
    })?;

    let session: AuthSession = sonic_rs::from_str(&session_json)
        .map_err(|e| {
            tracing::warn!("❌ Invalid session JSON: {}", e);
            StatusCode::FORBIDDEN
        })?;

    if chrono::Utc::now() > session.expires_at {
        tracing::warn!("❌ Session expired for user: {}", session.user_id);

        let _: () = state
            .redis
            .del(format!("session:{}", session_id))
            .await
            .unwrap_or(());

        return Err(StatusCode::FORBIDDEN);
    }

    tracing::debug!("✅ User authenticated: {}", session.user_id);

    request.extensions_mut().insert(AuthUser { user_id: session.user_id });

    Ok(next.run(request).await)
}
