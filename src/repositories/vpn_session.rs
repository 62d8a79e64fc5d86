use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::net::Ipv4Addr;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::vpn_session::{NewVpnSession, SessionStatus, VpnSession},
    services::ip_allocator::parse_client_ip,
};

/// Persistence for VPN session records.
///
/// Records are never deleted. Mutations that target a session only apply while
/// it is still active and return `None` otherwise.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new active session.
    async fn create(&self, session: NewVpnSession) -> Result<VpnSession>;

    /// Finds a session by its ID regardless of status.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<VpnSession>>;

    /// Finds the user's most recent active session.
    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Option<VpnSession>>;

    /// Counts the user's active sessions.
    async fn count_active_by_user(&self, user_id: Uuid) -> Result<usize>;

    /// Lists the client addresses of every active session.
    async fn active_client_ips(&self) -> Result<Vec<Ipv4Addr>>;

    /// Moves an active session to `disconnected`, stamping `disconnected_at`.
    async fn mark_disconnected(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<VpnSession>>;

    /// Overwrites the byte counters of an active session.
    async fn update_stats(
        &self,
        id: Uuid,
        bytes_sent: i64,
        bytes_received: i64,
    ) -> Result<Option<VpnSession>>;
}

const SESSION_COLUMNS: &str = "id, user_id, status, client_ip, server_address, server_port, \
    client_public_key, client_private_key_encrypted, bytes_sent, bytes_received, \
    connected_at, disconnected_at";

/// A helper function to map a `tokio_postgres::Row` to a `VpnSession`.
fn row_to_session(row: &Row) -> Result<VpnSession> {
    let status: String = row.try_get("status").map_err(|_| AppError::MissingData("status".to_string()))?;
    Ok(VpnSession {
        id: row.try_get("id").map_err(|_| AppError::MissingData("id".to_string()))?,
        user_id: row.try_get("user_id").map_err(|_| AppError::MissingData("user_id".to_string()))?,
        status: status.parse()?,
        client_ip: row.try_get("client_ip").map_err(|_| AppError::MissingData("client_ip".to_string()))?,
        server_address: row.try_get("server_address").map_err(|_| AppError::MissingData("server_address".to_string()))?,
        server_port: row.try_get("server_port").map_err(|_| AppError::MissingData("server_port".to_string()))?,
        client_public_key: row.try_get("client_public_key").map_err(|_| AppError::MissingData("client_public_key".to_string()))?,
        client_private_key_encrypted: row.try_get("client_private_key_encrypted").map_err(|_| AppError::MissingData("client_private_key_encrypted".to_string()))?,
        bytes_sent: row.try_get("bytes_sent").map_err(|_| AppError::MissingData("bytes_sent".to_string()))?,
        bytes_received: row.try_get("bytes_received").map_err(|_| AppError::MissingData("bytes_received".to_string()))?,
        connected_at: row.try_get("connected_at").map_err(|_| AppError::MissingData("connected_at".to_string()))?,
        disconnected_at: row.try_get("disconnected_at").map_err(|_| AppError::MissingData("disconnected_at".to_string()))?,
    })
}

/// PostgreSQL-backed [`SessionStore`].
///
/// The `vpn_sessions_active_client_ip` partial unique index rejects a second
/// active row for the same address at commit time.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: Pool,
}

impl PgSessionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: NewVpnSession) -> Result<VpnSession> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO vpn_sessions (
                id, user_id, status, client_ip, server_address, server_port,
                client_public_key, client_private_key_encrypted, connected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = client
            .query_one(
                query.as_str(),
                &[
                    &session.id,
                    &session.user_id,
                    &SessionStatus::Active.as_str(),
                    &session.client_ip,
                    &session.server_address,
                    &session.server_port,
                    &session.client_public_key,
                    &session.client_private_key_encrypted,
                    &session.connected_at,
                ],
            )
            .await?;
        row_to_session(&row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VpnSession>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {} FROM vpn_sessions WHERE id = $1", SESSION_COLUMNS);
        let row = client
            .query_opt(query.as_str(), &[&id])
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Option<VpnSession>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            SELECT {}
            FROM vpn_sessions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY connected_at DESC
            LIMIT 1
            "#,
            SESSION_COLUMNS
        );
        let row = client
            .query_opt(query.as_str(), &[&user_id])
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn count_active_by_user(&self, user_id: Uuid) -> Result<usize> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS active FROM vpn_sessions WHERE user_id = $1 AND status = 'active'",
                &[&user_id],
            )
            .await?;
        let active: i64 = row.try_get("active").map_err(|_| AppError::MissingData("active".to_string()))?;
        usize::try_from(active).map_err(|_| AppError::MissingData("active".to_string()))
    }

    async fn active_client_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT client_ip FROM vpn_sessions WHERE status = 'active'", &[])
            .await?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("client_ip").map_err(|_| AppError::MissingData("client_ip".to_string()))?;
                parse_client_ip(&raw)
            })
            .collect()
    }

    async fn mark_disconnected(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<VpnSession>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            UPDATE vpn_sessions
            SET status = 'disconnected', disconnected_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = client
            .query_opt(query.as_str(), &[&id, &at])
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn update_stats(
        &self,
        id: Uuid,
        bytes_sent: i64,
        bytes_received: i64,
    ) -> Result<Option<VpnSession>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            UPDATE vpn_sessions
            SET bytes_sent = $2, bytes_received = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = client
            .query_opt(query.as_str(), &[&id, &bytes_sent, &bytes_received])
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }
}
