use redis::aio::ConnectionManager;
use std::sync::Arc;
use crate::config::Config;
use crate::error::Result;
use crate::repositories::vpn_session::PgSessionStore;
use crate::services::key_manager::KeyManager;
use crate::services::peer_registrar::SubprocessPeerRegistrar;
use crate::services::vpn::SessionManager;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The Redis connection manager (authentication sessions, rate limits).
    pub redis: ConnectionManager,
    /// The VPN session lifecycle manager.
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Creates a new `AppState`, connecting to PostgreSQL and Redis.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        crate::db::ensure_schema(&db).await?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");

        let keys = KeyManager::new(&config.master_key)?;
        let registrar = SubprocessPeerRegistrar::new(config.peer_registrar.clone());
        tracing::info!(
            "✅ Peer registrar bound to {} (timeout {:?})",
            config.peer_registrar.program.display(),
            config.peer_registrar.timeout
        );

        let sessions = SessionManager::new(
            config.vpn.clone(),
            &config.server_keys,
            keys,
            Arc::new(PgSessionStore::new(db)),
            Arc::new(registrar),
        );
        tracing::info!(
            "✅ Session manager ready (max {} per user, pool from {})",
            config.vpn.max_connections,
            config.vpn.subnet.first()
        );

        Ok(AppState {
            redis,
            sessions: Arc::new(sessions),
        })
    }
}
