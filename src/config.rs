use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::keypair::ServerKeypair;
use crate::error::AppError;
use crate::services::ip_allocator::IpPool;

/// Default location of `server_private.key` and `server_public.key`.
pub const DEFAULT_KEY_PATH: &str = "/var/www/wireguard";
/// Default peer-management executable.
pub const DEFAULT_WG_MANAGE_BIN: &str = "/usr/local/bin/wg-manage";

/// Settings that shape every VPN session handed out by this process.
#[derive(Clone, Debug)]
pub struct VpnSettings {
    /// Maximum number of concurrent active sessions per user.
    pub max_connections: usize,
    /// Host clients dial; copied into each session.
    pub server_address: String,
    /// UDP port clients dial; copied into each session.
    pub server_port: u16,
    /// Client address pool.
    pub subnet: IpPool,
    /// DNS servers pushed to clients.
    pub dns_servers: Vec<String>,
    /// Whether audit events are emitted.
    pub logging_enabled: bool,
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            max_connections: 1,
            server_address: "vpn.pubwifi.com".to_string(),
            server_port: 51820,
            subnet: IpPool::new(Ipv4Addr::new(10, 0, 0, 0)),
            dns_servers: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            logging_enabled: true,
        }
    }
}

/// How the external peer-management process is invoked.
#[derive(Clone, Debug)]
pub struct PeerRegistrarSettings {
    /// Executable that owns the WireGuard peer table.
    pub program: PathBuf,
    /// Extra arguments passed before the request is written to stdin.
    pub args: Vec<String>,
    /// Hard limit for a single invocation.
    pub timeout: Duration,
}

impl Default for PeerRegistrarSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_WG_MANAGE_BIN),
            args: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server holding authentication sessions.
    pub redis_url: String,
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// The master key used to encrypt client private keys.
    pub master_key: Zeroizing<Vec<u8>>,
    /// The server's WireGuard keypair, loaded once at startup.
    pub server_keys: ServerKeypair,
    /// VPN session settings.
    pub vpn: VpnSettings,
    /// Peer-management process settings.
    pub peer_registrar: PeerRegistrarSettings,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// Fails when a secret is missing or malformed, when the subnet is not an
    /// IPv4 `/24`, or when the server key files are missing or disagree.
    pub fn from_env() -> Result<Self> {
        let mut master_key_hex = env::var("MASTER_KEY")
            .context("MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes = hex::decode(&master_key_hex)
            .context("MASTER_KEY must be valid hexadecimal")?;

        master_key_hex.zeroize();

        if master_key_bytes.len() != 32 {
            anyhow::bail!("MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let max_connections: usize = env::var("VPN_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("Invalid VPN_MAX_CONNECTIONS")?;
        if max_connections == 0 {
            return Err(AppError::InvalidConfiguration(
                "VPN_MAX_CONNECTIONS must be at least 1".to_string(),
            )
            .into());
        }

        let subnet = IpPool::from_cidr(
            &env::var("VPN_SUBNET").unwrap_or_else(|_| "10.0.0.0/24".to_string()),
        )?;

        let dns_servers = parse_dns_servers(
            &env::var("VPN_DNS_SERVERS").unwrap_or_else(|_| "1.1.1.1,1.0.0.1".to_string()),
        )?;

        let key_path = PathBuf::from(
            env::var("WG_KEY_PATH").unwrap_or_else(|_| DEFAULT_KEY_PATH.to_string()),
        );
        let server_keys = ServerKeypair::load(&key_path)?;

        let timeout_secs: u64 = env::var("WG_MANAGE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid WG_MANAGE_TIMEOUT_SECS")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
                .parse()
                .context("Invalid BIND_ADDR")?,
            master_key: Zeroizing::new(master_key_bytes),
            server_keys,
            vpn: VpnSettings {
                max_connections,
                server_address: env::var("VPN_SERVER_ADDRESS")
                    .unwrap_or_else(|_| "vpn.pubwifi.com".to_string()),
                server_port: env::var("VPN_PORT")
                    .unwrap_or_else(|_| "51820".to_string())
                    .parse()
                    .context("Invalid VPN_PORT")?,
                subnet,
                dns_servers,
                logging_enabled: parse_bool(
                    &env::var("VPN_LOGGING_ENABLED").unwrap_or_else(|_| "true".to_string()),
                )?,
            },
            peer_registrar: PeerRegistrarSettings {
                program: PathBuf::from(
                    env::var("WG_MANAGE_BIN").unwrap_or_else(|_| DEFAULT_WG_MANAGE_BIN.to_string()),
                ),
                args: Vec::new(),
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }
}

/// Parses a comma separated list of IPv4 DNS servers.
pub fn parse_dns_servers(raw: &str) -> crate::error::Result<Vec<String>> {
    let servers: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Addr>()
                .map(|ip| ip.to_string())
                .map_err(|_| AppError::InvalidConfiguration(format!("Invalid DNS server: {}", s)))
        })
        .collect::<crate::error::Result<_>>()?;

    if servers.is_empty() {
        return Err(AppError::InvalidConfiguration(
            "VPN_DNS_SERVERS must list at least one server".to_string(),
        ));
    }
    Ok(servers)
}

fn parse_bool(raw: &str) -> crate::error::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::InvalidConfiguration(format!("Invalid boolean: {}", other))),
    }
}
