use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A login session issued by the authentication service and stored in Redis
/// under `session:<session_id>`. Only the fields this service reads are modelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    /// The ID of the user this session belongs to.
    pub user_id: Uuid,
    /// The timestamp when the session expires.
    pub expires_at: DateTime<Utc>,
}

/// The authenticated caller, placed in request extensions by `require_auth`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}
