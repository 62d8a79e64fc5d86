use uuid::Uuid;

use crate::models::vpn_session::VpnSession;

/// Structured audit trail for session lifecycle events, emitted on the
/// `vpn_audit` tracing target. Emitting never fails.
#[derive(Clone, Copy, Debug)]
pub struct AuditLog {
    enabled: bool,
}

impl AuditLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn session_created(&self, session: &VpnSession, client_address: &str) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "vpn_audit",
            event = "session_created",
            user_id = %session.user_id,
            session_id = %session.id,
            client_ip = %session.client_ip,
            client_address = %client_address,
            "VPN session created"
        );
    }

    pub fn session_disconnected(&self, session: &VpnSession) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "vpn_audit",
            event = "session_disconnected",
            user_id = %session.user_id,
            session_id = %session.id,
            bytes_sent = session.bytes_sent,
            bytes_received = session.bytes_received,
            "VPN session disconnected"
        );
    }

    pub fn stats_updated(&self, session: &VpnSession) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "vpn_audit",
            event = "session_stats_updated",
            user_id = %session.user_id,
            session_id = %session.id,
            bytes_sent = session.bytes_sent,
            bytes_received = session.bytes_received,
            "VPN session stats updated"
        );
    }

    /// Logged regardless of `enabled`: the external peer table may no longer
    /// match stored state and needs an operator.
    pub fn peer_table_inconsistent(&self, user_id: Uuid, public_key: &str, client_ip: &str, reason: &str) {
        tracing::error!(
            target: "vpn_audit",
            event = "peer_table_inconsistent",
            user_id = %user_id,
            public_key = %public_key,
            client_ip = %client_ip,
            reason = %reason,
            "🚨 Compensating peer removal failed; orphaned WireGuard peer"
        );
    }
}
