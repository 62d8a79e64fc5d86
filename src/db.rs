use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use tokio_postgres::NoTls;
use crate::error::{AppError, Result};
use std::time::Duration;

/// Maximum number of pooled PostgreSQL connections.
pub const MAX_POOL_SIZE: usize = 32;

/// Schema for the `vpn_sessions` table; safe to apply repeatedly.
const SCHEMA: &str = include_str!("../migrations/0001_create_vpn_sessions.sql");

/// Creates a new database connection pool.
///
/// Connections are opened lazily; call [`ensure_schema`] to verify the
/// database is reachable at startup.
pub fn create_pool(database_url: &str) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.url = Some(database_url.to_string());

    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_cfg = PoolConfig::new(MAX_POOL_SIZE);
    pool_cfg.timeouts = Timeouts {
        wait: Some(Duration::from_secs(5)),
        create: Some(Duration::from_secs(2)),
        recycle: Some(Duration::from_secs(1)),
    };
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(AppError::from)
}

/// Applies the session schema.
pub async fn ensure_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::info!("✅ vpn_sessions schema verified");
    Ok(())
}
