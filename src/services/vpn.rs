use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    config::VpnSettings,
    crypto::keypair::ServerKeypair,
    error::{AppError, Result},
    models::vpn_session::{NewVpnSession, VpnSession},
    repositories::vpn_session::SessionStore,
    services::{
        admission::AdmissionController,
        audit::AuditLog,
        config_renderer::{render_client_config, ClientConfigParams},
        key_manager::KeyManager,
        peer_registrar::PeerRegistrar,
    },
};

/// Result of a successful `connect`.
pub struct ConnectOutcome {
    /// The caller's active session.
    pub session: VpnSession,
    /// WireGuard configuration for the device. Contains the private key.
    pub client_config: Zeroizing<String>,
    /// `false` when an already active session was returned.
    pub created: bool,
}

impl std::fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOutcome")
            .field("session", &self.session)
            .field("client_config", &"<redacted>")
            .field("created", &self.created)
            .finish()
    }
}

/// Result of a `disconnect`.
#[derive(Debug)]
pub struct DisconnectOutcome {
    /// The closed session, or `None` when there was nothing to close.
    pub session: Option<VpnSession>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

/// Connect attempts that passed admission but are not persisted yet.
#[derive(Default)]
struct ReservationBook {
    users: HashMap<Uuid, usize>,
    ips: HashSet<Ipv4Addr>,
}

fn lock_book(book: &Mutex<ReservationBook>) -> MutexGuard<'_, ReservationBook> {
    book.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A user slot plus a client address held for one in-flight connect.
/// Released on drop, whichever way the connect ends.
struct Reservation {
    book: Arc<Mutex<ReservationBook>>,
    user_id: Uuid,
    ip: Ipv4Addr,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut book = lock_book(&self.book);
        if let Some(count) = book.users.get_mut(&self.user_id) {
            *count -= 1;
            if *count == 0 {
                book.users.remove(&self.user_id);
            }
        }
        book.ips.remove(&self.ip);
    }
}

/// Orchestrates the VPN session lifecycle.
///
/// Keeps three sources of truth consistent: the session store, the external
/// WireGuard peer table and the generated key material.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    registrar: Arc<dyn PeerRegistrar>,
    keys: KeyManager,
    settings: VpnSettings,
    server_public_key: String,
    admission: AdmissionController,
    audit: AuditLog,
    /// Serializes admission and allocation across all users.
    allocation_lock: tokio::sync::Mutex<()>,
    reservations: Arc<Mutex<ReservationBook>>,
}

impl SessionManager {
    pub fn new(
        settings: VpnSettings,
        server_keys: &ServerKeypair,
        keys: KeyManager,
        store: Arc<dyn SessionStore>,
        registrar: Arc<dyn PeerRegistrar>,
    ) -> Self {
        Self {
            store,
            registrar,
            keys,
            server_public_key: server_keys.public_key().to_string(),
            admission: AdmissionController::new(settings.max_connections),
            audit: AuditLog::new(settings.logging_enabled),
            settings,
            allocation_lock: tokio::sync::Mutex::new(()),
            reservations: Arc::new(Mutex::new(ReservationBook::default())),
        }
    }

    /// Connects `user_id`, or returns their active session unchanged.
    ///
    /// `client_address` is the caller's public address, recorded for audit.
    pub async fn connect(&self, user_id: Uuid, client_address: &str) -> Result<ConnectOutcome> {
        if let Some(existing) = self.store.find_active_by_user(user_id).await? {
            tracing::debug!("🔁 User {} already connected as {}", user_id, existing.client_ip);
            let private_key = self.keys.decrypt_private_key(&existing.client_private_key_encrypted)?;
            let client_config = self.render(&existing, &private_key);
            return Ok(ConnectOutcome { session: existing, client_config, created: false });
        }

        let reservation = self.reserve(user_id).await?;
        let client_ip = reservation.ip.to_string();

        let keypair = self.keys.generate();
        let sealed_private_key = self.keys.encrypt_private_key(&keypair.private_key)?;

        if let Err(e) = self.registrar.add_peer(&keypair.public_key, &client_ip).await {
            tracing::error!("❌ Failed to add WireGuard peer for user {}: {}", user_id, e);
            // A killed process may already have installed the peer.
            if matches!(e, AppError::RegistrationTimeout(_)) {
                self.compensate_peer(user_id, &keypair.public_key, &client_ip, &e).await;
            }
            return Err(e);
        }

        let new_session = NewVpnSession {
            id: Uuid::new_v4(),
            user_id,
            client_ip: client_ip.clone(),
            server_address: self.settings.server_address.clone(),
            server_port: i32::from(self.settings.server_port),
            client_public_key: keypair.public_key.clone(),
            client_private_key_encrypted: sealed_private_key,
            connected_at: Utc::now(),
        };

        let session = match self.store.create(new_session).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("❌ Failed to persist VPN session for user {}: {}", user_id, e);
                self.compensate_peer(user_id, &keypair.public_key, &client_ip, &e).await;
                return Err(e);
            }
        };
        drop(reservation);

        self.audit.session_created(&session, client_address);
        tracing::info!("✅ VPN session {} created for user {} at {}", session.id, user_id, client_ip);

        let client_config = self.render(&session, &keypair.private_key);
        Ok(ConnectOutcome { session, client_config, created: true })
    }

    /// Disconnects `user_id`. Without an active session this is a no-op.
    pub async fn disconnect(&self, user_id: Uuid) -> Result<DisconnectOutcome> {
        let Some(session) = self.store.find_active_by_user(user_id).await? else {
            tracing::debug!("User {} has no active VPN session to disconnect", user_id);
            return Ok(DisconnectOutcome { session: None, bytes_sent: 0, bytes_received: 0 });
        };

        if let Err(e) = self.registrar.remove_peer(&session.client_public_key).await {
            // A concurrent disconnect may have removed the peer and closed the row.
            if let Some(closed) = self.store.find_by_id(session.id).await?.filter(|s| !s.is_active()) {
                tracing::debug!("Session {} was already disconnected: {}", closed.id, e);
                return Ok(DisconnectOutcome {
                    bytes_sent: closed.bytes_sent,
                    bytes_received: closed.bytes_received,
                    session: Some(closed),
                });
            }
            tracing::error!("❌ Failed to remove WireGuard peer for session {}: {}", session.id, e);
            return Err(e);
        }

        let closed = match self.store.mark_disconnected(session.id, Utc::now()).await {
            Ok(Some(closed)) => closed,
            // Another disconnect got there first.
            Ok(None) => self.store.find_by_id(session.id).await?.unwrap_or(session),
            Err(e) => {
                self.audit.peer_table_inconsistent(
                    user_id,
                    &session.client_public_key,
                    &session.client_ip,
                    &format!("peer removed but session still active: {}", e),
                );
                return Err(e);
            }
        };

        self.audit.session_disconnected(&closed);
        tracing::info!("✅ VPN session {} disconnected for user {}", closed.id, user_id);

        Ok(DisconnectOutcome {
            bytes_sent: closed.bytes_sent,
            bytes_received: closed.bytes_received,
            session: Some(closed),
        })
    }

    /// Overwrites the byte counters of the user's active session.
    pub async fn update_stats(
        &self,
        user_id: Uuid,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<VpnSession> {
        let bytes_sent = i64::try_from(bytes_sent)
            .map_err(|_| AppError::Validation("bytes_sent is out of range".to_string()))?;
        let bytes_received = i64::try_from(bytes_received)
            .map_err(|_| AppError::Validation("bytes_received is out of range".to_string()))?;

        let session = self
            .store
            .find_active_by_user(user_id)
            .await?
            .ok_or(AppError::SessionNotFound)?;

        let updated = self
            .store
            .update_stats(session.id, bytes_sent, bytes_received)
            .await?
            .ok_or(AppError::SessionNotFound)?;

        self.audit.stats_updated(&updated);
        Ok(updated)
    }

    /// The user's active session, if any.
    pub async fn status(&self, user_id: Uuid) -> Result<Option<VpnSession>> {
        self.store.find_active_by_user(user_id).await
    }

    /// Admission and allocation under the allocation lock. The peer call that
    /// follows runs without the lock; the reservation keeps the slot and the
    /// address taken until the session row exists.
    async fn reserve(&self, user_id: Uuid) -> Result<Reservation> {
        let _serialized = self.allocation_lock.lock().await;

        let stored = self.store.count_active_by_user(user_id).await?;
        let mut in_use = self.store.active_client_ips().await?;

        let mut book = lock_book(&self.reservations);
        let pending = book.users.get(&user_id).copied().unwrap_or(0);
        if let Err(e) = self.admission.check(stored + pending) {
            tracing::warn!(
                "⚠️  User {} refused: {} active, {} pending, max {}",
                user_id,
                stored,
                pending,
                self.admission.max_connections()
            );
            return Err(e);
        }

        in_use.extend(book.ips.iter().copied());
        let ip = self.settings.subnet.allocate(in_use)?;

        *book.users.entry(user_id).or_default() += 1;
        book.ips.insert(ip);

        Ok(Reservation { book: Arc::clone(&self.reservations), user_id, ip })
    }

    async fn compensate_peer(&self, user_id: Uuid, public_key: &str, client_ip: &str, cause: &AppError) {
        match self.registrar.remove_peer(public_key).await {
            Ok(()) => tracing::warn!(
                "↩️  Removed WireGuard peer {} after failed connect: {}",
                client_ip,
                cause
            ),
            Err(e) => self.audit.peer_table_inconsistent(user_id, public_key, client_ip, &e.to_string()),
        }
    }

    fn render(&self, session: &VpnSession, private_key: &str) -> Zeroizing<String> {
        let server_port = u16::try_from(session.server_port).unwrap_or(self.settings.server_port);
        Zeroizing::new(render_client_config(&ClientConfigParams {
            private_key,
            client_ip: &session.client_ip,
            server_public_key: &self.server_public_key,
            server_address: &session.server_address,
            server_port,
            dns_servers: &self.settings.dns_servers,
        }))
    }
}
