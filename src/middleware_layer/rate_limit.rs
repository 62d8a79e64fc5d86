use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    error::AppError,
    models::session::AuthUser,
    state::AppState,
};

/// Connect attempts allowed per user within one window.
pub const CONNECT_ATTEMPTS_PER_WINDOW: i64 = 10;
/// Length of the connect rate-limit window in seconds.
pub const CONNECT_WINDOW_SECS: i64 = 60;

/// A middleware that rate limits VPN connect attempts per user.
///
/// Must run after `require_auth`. Redis failures let the request through.
pub async fn rate_limit_connect(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(user) = req.extensions().get::<AuthUser>().copied() else {
        return AppError::Unauthorized.into_response();
    };

    let key = format!("rate_limit:vpn_connect:{}", user.user_id);

    let attempts: i64 = redis::cmd("INCR")
        .arg(&key)
        .query_async(&mut state.redis.clone())
        .await
        .unwrap_or(0);

    if attempts == 1 {
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(CONNECT_WINDOW_SECS)
            .query_async(&mut state.redis.clone())
            .await
            .unwrap_or(());
    }

    if attempts > CONNECT_ATTEMPTS_PER_WINDOW {
        let ttl: Option<i64> = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut state.redis.clone())
            .await
            .unwrap_or(None);

        return AppError::RateLimitExceeded(format!(
            "Too many connect attempts. Try again in {} seconds",
            ttl.unwrap_or(CONNECT_WINDOW_SECS).max(1)
        ))
        .into_response();
    }

    next.run(req).await
}
