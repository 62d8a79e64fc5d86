use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle state of a VPN session. The only transition is
/// `Active -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "disconnected" => Ok(SessionStatus::Disconnected),
            other => Err(AppError::MissingData(format!("status: {}", other))),
        }
    }
}

/// Represents a VPN session.
///
/// ⚠️ IMPORTANT: `client_private_key_encrypted` is `ciphertext || 12-byte nonce`
/// sealed with the master key. It is never serialized to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnSession {
    /// The unique identifier for the session.
    pub id: Uuid,
    /// The ID of the user who owns the session.
    pub user_id: Uuid,
    /// The session's lifecycle state.
    pub status: SessionStatus,
    /// The tunnel address assigned to the client.
    pub client_ip: String,
    /// The endpoint host at the time of creation.
    pub server_address: String,
    /// The endpoint port at the time of creation.
    pub server_port: i32,
    /// The client's base64 WireGuard public key.
    pub client_public_key: String,
    /// The sealed client private key.
    #[serde(skip_serializing)]
    pub client_private_key_encrypted: Vec<u8>,
    /// Bytes sent, as last reported by the client.
    pub bytes_sent: i64,
    /// Bytes received, as last reported by the client.
    pub bytes_received: i64,
    /// The timestamp when the session was created.
    pub connected_at: DateTime<Utc>,
    /// The timestamp when the session was disconnected.
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl VpnSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Fields supplied when a session row is created.
#[derive(Debug, Clone)]
pub struct NewVpnSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub client_ip: String,
    pub server_address: String,
    pub server_port: i32,
    pub client_public_key: String,
    pub client_private_key_encrypted: Vec<u8>,
    pub connected_at: DateTime<Utc>,
}

impl NewVpnSession {
    /// The record as it looks once persisted: active with zeroed counters.
    pub fn into_session(self) -> VpnSession {
        VpnSession {
            id: self.id,
            user_id: self.user_id,
            status: SessionStatus::Active,
            client_ip: self.client_ip,
            server_address: self.server_address,
            server_port: self.server_port,
            client_public_key: self.client_public_key,
            client_private_key_encrypted: self.client_private_key_encrypted,
            bytes_sent: 0,
            bytes_received: 0,
            connected_at: self.connected_at,
            disconnected_at: None,
        }
    }
}
