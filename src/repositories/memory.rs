use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::vpn_session::{NewVpnSession, SessionStatus, VpnSession},
    repositories::vpn_session::SessionStore,
    services::ip_allocator::parse_client_ip,
};

/// In-process [`SessionStore`] for tests and local runs.
///
/// Mirrors the database's unique index on active `client_ip`, and can be told
/// to fail upcoming `create` calls.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, VpnSession>>,
    failing_creates: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `create` fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Every stored session, oldest first.
    pub async fn all(&self) -> Vec<VpnSession> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<VpnSession> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.connected_at);
        all
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewVpnSession) -> Result<VpnSession> {
        let should_fail = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::Internal("Injected session store failure".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        if sessions
            .values()
            .any(|s| s.is_active() && s.client_ip == session.client_ip)
        {
            return Err(AppError::Internal(format!(
                "Duplicate active client_ip {}",
                session.client_ip
            )));
        }

        let session = session.into_session();
        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VpnSession>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Option<VpnSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active())
            .max_by_key(|s| s.connected_at)
            .cloned())
    }

    async fn count_active_by_user(&self, user_id: Uuid) -> Result<usize> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active())
            .count())
    }

    async fn active_client_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| parse_client_ip(&s.client_ip))
            .collect()
    }

    async fn mark_disconnected(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<VpnSession>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(&id).filter(|s| s.is_active()).map(|s| {
            s.status = SessionStatus::Disconnected;
            s.disconnected_at = Some(at);
            s.clone()
        }))
    }

    async fn update_stats(
        &self,
        id: Uuid,
        bytes_sent: i64,
        bytes_received: i64,
    ) -> Result<Option<VpnSession>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(&id).filter(|s| s.is_active()).map(|s| {
            s.bytes_sent = bytes_sent;
            s.bytes_received = bytes_received;
            s.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(user_id: Uuid, client_ip: &str) -> NewVpnSession {
        NewVpnSession {
            id: Uuid::new_v4(),
            user_id,
            client_ip: client_ip.to_string(),
            server_address: "vpn.pubwifi.com".to_string(),
            server_port: 51820,
            client_public_key: "pk".to_string(),
            client_private_key_encrypted: vec![0; 40],
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn active_client_ip_is_unique() {
        let store = MemorySessionStore::new();
        store.create(new_session(Uuid::new_v4(), "10.0.0.2")).await.unwrap();
        assert!(store.create(new_session(Uuid::new_v4(), "10.0.0.2")).await.is_err());
    }

    #[tokio::test]
    async fn disconnected_sessions_are_immutable() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        let session = store.create(new_session(user, "10.0.0.2")).await.unwrap();

        let first = Utc::now();
        let closed = store.mark_disconnected(session.id, first).await.unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Disconnected);
        assert_eq!(closed.disconnected_at, Some(first));

        assert!(store.mark_disconnected(session.id, Utc::now()).await.unwrap().is_none());
        assert!(store.update_stats(session.id, 1, 1).await.unwrap().is_none());

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.disconnected_at, Some(first));
        assert_eq!(store.count_active_by_user(user).await.unwrap(), 0);
        assert!(store.active_client_ips().await.unwrap().is_empty());

        // The address is free again once the session is closed.
        store.create(new_session(user, "10.0.0.2")).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemorySessionStore::new();
        store.fail_next_creates(1);
        assert!(store.create(new_session(Uuid::new_v4(), "10.0.0.2")).await.is_err());
        assert!(store.create(new_session(Uuid::new_v4(), "10.0.0.2")).await.is_ok());
    }
}
