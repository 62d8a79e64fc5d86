use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use vpn_lifecycle::{
    config::VpnSettings,
    crypto::{aes, keypair},
    error::AppError,
    models::vpn_session::SessionStatus,
    repositories::{memory::MemorySessionStore, vpn_session::SessionStore},
    services::{
        ip_allocator::IpPool,
        key_manager::KeyManager,
        peer_registrar::{PeerCall, ScriptedOutcome, ScriptedPeerRegistrar},
        vpn::SessionManager,
    },
};

// Shared test context
struct TestContext {
    store: Arc<MemorySessionStore>,
    registrar: Arc<ScriptedPeerRegistrar>,
    keys: KeyManager,
    manager: Arc<SessionManager>,
}

impl TestContext {
    fn new() -> Self {
        Self::build(VpnSettings::default(), ScriptedPeerRegistrar::new())
    }

    fn build(settings: VpnSettings, registrar: ScriptedPeerRegistrar) -> Self {
        let server = keypair::generate();
        let server_keys =
            keypair::ServerKeypair::from_base64(&server.private_key, &server.public_key).unwrap();
        let keys = KeyManager::new(aes::generate_key().as_bytes()).unwrap();
        let store = Arc::new(MemorySessionStore::new());
        let registrar = Arc::new(registrar);

        let manager = SessionManager::new(
            settings,
            &server_keys,
            keys.clone(),
            store.clone(),
            registrar.clone(),
        );

        Self { store, registrar, keys, manager: Arc::new(manager) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "203.0.113.7";

    #[tokio::test]
    async fn test_fresh_connect_creates_session_and_peer() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();

        let outcome = ctx.manager.connect(user, CLIENT).await.unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.session.user_id, user);
        assert_eq!(outcome.session.status, SessionStatus::Active);
        assert_eq!(outcome.session.client_ip, "10.0.0.2");
        assert_eq!(outcome.session.server_address, "vpn.pubwifi.com");
        assert_eq!(outcome.session.server_port, 51820);
        assert_eq!(outcome.session.bytes_sent, 0);
        assert_eq!(outcome.session.bytes_received, 0);
        assert!(outcome.session.disconnected_at.is_none());

        assert_eq!(
            ctx.registrar.calls(),
            vec![PeerCall::Add {
                public_key: outcome.session.client_public_key.clone(),
                client_ip: "10.0.0.2".to_string(),
            }]
        );

        // The stored key is sealed and opens to the key in the rendered config.
        let private_key = ctx
            .keys
            .decrypt_private_key(&outcome.session.client_private_key_encrypted)
            .unwrap();
        assert_eq!(keypair::public_key_for(&private_key).unwrap(), outcome.session.client_public_key);
        assert!(outcome.client_config.contains(&format!("PrivateKey = {}", *private_key)));
        assert!(outcome.client_config.contains("Address = 10.0.0.2/24"));
        assert!(outcome.client_config.contains("Endpoint = vpn.pubwifi.com:51820"));
        assert!(outcome.client_config.contains("DNS = 1.1.1.1, 1.0.0.1"));
    }

    #[tokio::test]
    async fn test_second_connect_returns_existing_session() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();

        let first = ctx.manager.connect(user, CLIENT).await.unwrap();
        let second = ctx.manager.connect(user, CLIENT).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.client_ip, first.session.client_ip);
        assert_eq!(*second.client_config, *first.client_config);
        assert_eq!(ctx.registrar.add_count(), 1);
        assert_eq!(ctx.store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_session_is_returned_when_limit_is_higher() {
        let settings = VpnSettings { max_connections: 3, ..VpnSettings::default() };
        let ctx = TestContext::build(settings, ScriptedPeerRegistrar::new());
        let user = Uuid::new_v4();

        let first = ctx.manager.connect(user, CLIENT).await.unwrap();
        let second = ctx.manager.connect(user, CLIENT).await.unwrap();

        assert_eq!(second.session.id, first.session.id);
        assert_eq!(ctx.registrar.add_count(), 1);
    }

    #[tokio::test]
    async fn test_addresses_advance_past_released_ones() {
        let ctx = TestContext::new();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(ctx.manager.connect(a, CLIENT).await.unwrap().session.client_ip, "10.0.0.2");
        assert_eq!(ctx.manager.connect(b, CLIENT).await.unwrap().session.client_ip, "10.0.0.3");
        assert_eq!(ctx.manager.connect(c, CLIENT).await.unwrap().session.client_ip, "10.0.0.4");

        ctx.manager.disconnect(b).await.unwrap();

        // Allocation continues after the highest address in use.
        assert_eq!(ctx.manager.connect(d, CLIENT).await.unwrap().session.client_ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_concurrent_users_get_distinct_addresses() {
        let ctx = TestContext::build(
            VpnSettings::default(),
            ScriptedPeerRegistrar::with_latency(Duration::from_millis(20)),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = ctx.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.connect(Uuid::new_v4(), CLIENT).await
            }));
        }

        let mut ips = HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(ips.insert(outcome.session.client_ip));
        }

        assert_eq!(ips.len(), 8);
        assert_eq!(ctx.registrar.add_count(), 8);
        assert_eq!(ctx.store.all().await.len(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_connects_for_one_user_respect_limit() {
        let ctx = TestContext::build(
            VpnSettings::default(),
            ScriptedPeerRegistrar::with_latency(Duration::from_millis(50)),
        );
        let user = Uuid::new_v4();

        let (first, second) = tokio::join!(
            ctx.manager.connect(user, CLIENT),
            ctx.manager.connect(user, CLIENT)
        );

        let results = [first, second];
        let created = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::ConnectionLimitExceeded)))
            .count();

        assert_eq!(created, 1);
        assert_eq!(refused, 1);
        assert_eq!(ctx.registrar.add_count(), 1);
        assert_eq!(ctx.store.count_active_by_user(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_stores_nothing() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        ctx.registrar.push_add_outcome(ScriptedOutcome::Fail("wg: device busy".to_string()));

        let err = ctx.manager.connect(user, CLIENT).await.unwrap_err();

        assert!(matches!(err, AppError::RegistrationFailed(msg) if msg == "wg: device busy"));
        assert!(ctx.store.all().await.is_empty());
        assert_eq!(ctx.registrar.remove_count(), 0);

        // The reserved slot and address are free again.
        let retry = ctx.manager.connect(user, CLIENT).await.unwrap();
        assert_eq!(retry.session.client_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_registration_timeout_stores_nothing() {
        let ctx = TestContext::new();
        ctx.registrar.push_add_outcome(ScriptedOutcome::TimeOut);

        let err = ctx.manager.connect(Uuid::new_v4(), CLIENT).await.unwrap_err();

        assert!(matches!(err, AppError::RegistrationTimeout(_)));
        assert!(ctx.store.all().await.is_empty());

        // The killed process may have installed the peer, so it is removed once.
        let calls = ctx.registrar.calls();
        assert_eq!(calls.len(), 2);
        let PeerCall::Add { public_key: added, .. } = &calls[0] else {
            panic!("expected add first, got {:?}", calls[0]);
        };
        assert_eq!(calls[1], PeerCall::Remove { public_key: added.clone() });
    }

    #[tokio::test]
    async fn test_timeout_with_failed_cleanup_keeps_timeout_error() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        ctx.registrar.push_add_outcome(ScriptedOutcome::TimeOut);
        ctx.registrar.push_remove_outcome(ScriptedOutcome::Fail("peer not found".to_string()));

        let err = ctx.manager.connect(user, CLIENT).await.unwrap_err();

        assert!(matches!(err, AppError::RegistrationTimeout(_)));
        assert_eq!(ctx.registrar.remove_count(), 1);

        let retry = ctx.manager.connect(user, CLIENT).await.unwrap();
        assert_eq!(retry.session.client_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_both_succeed() {
        let ctx = TestContext::build(
            VpnSettings::default(),
            ScriptedPeerRegistrar::with_latency(Duration::from_millis(20)),
        );
        let user = Uuid::new_v4();
        let connected = ctx.manager.connect(user, CLIENT).await.unwrap();
        ctx.manager.update_stats(user, 300, 400).await.unwrap();

        // The second removal finds the peer already gone.
        ctx.registrar.push_remove_outcome(ScriptedOutcome::Succeed);
        ctx.registrar.push_remove_outcome(ScriptedOutcome::Fail("peer not found".to_string()));

        let (first, second) = tokio::join!(ctx.manager.disconnect(user), ctx.manager.disconnect(user));

        for outcome in [first.unwrap(), second.unwrap()] {
            let closed = outcome.session.unwrap();
            assert_eq!(closed.id, connected.session.id);
            assert_eq!(closed.status, SessionStatus::Disconnected);
            assert_eq!((outcome.bytes_sent, outcome.bytes_received), (300, 400));
        }
        assert_eq!(ctx.registrar.remove_count(), 2);
        assert!(ctx.manager.status(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_removes_peer_once() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        ctx.store.fail_next_creates(1);

        let err = ctx.manager.connect(user, CLIENT).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        let calls = ctx.registrar.calls();
        assert_eq!(calls.len(), 2);
        let PeerCall::Add { public_key: added, .. } = &calls[0] else {
            panic!("expected add first, got {:?}", calls[0]);
        };
        assert_eq!(calls[1], PeerCall::Remove { public_key: added.clone() });
        assert!(ctx.store.all().await.is_empty());

        let retry = ctx.manager.connect(user, CLIENT).await.unwrap();
        assert_eq!(retry.session.client_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_failed_compensation_keeps_original_error() {
        let ctx = TestContext::new();
        ctx.store.fail_next_creates(1);
        ctx.registrar.push_remove_outcome(ScriptedOutcome::Fail("peer not found".to_string()));

        let err = ctx.manager.connect(Uuid::new_v4(), CLIENT).await.unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(ctx.registrar.remove_count(), 1);
        assert!(ctx.store.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes_session_and_removes_peer() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        let connected = ctx.manager.connect(user, CLIENT).await.unwrap();
        ctx.manager.update_stats(user, 1_024, 4_096).await.unwrap();

        let outcome = ctx.manager.disconnect(user).await.unwrap();

        let closed = outcome.session.unwrap();
        assert_eq!(closed.id, connected.session.id);
        assert_eq!(closed.status, SessionStatus::Disconnected);
        assert!(closed.disconnected_at.is_some());
        assert_eq!(outcome.bytes_sent, 1_024);
        assert_eq!(outcome.bytes_received, 4_096);
        assert_eq!(
            ctx.registrar.calls().last(),
            Some(&PeerCall::Remove { public_key: connected.session.client_public_key.clone() })
        );
        assert!(ctx.manager.status(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let ctx = TestContext::new();

        let outcome = ctx.manager.disconnect(Uuid::new_v4()).await.unwrap();

        assert!(outcome.session.is_none());
        assert_eq!(outcome.bytes_sent, 0);
        assert_eq!(outcome.bytes_received, 0);
        assert!(ctx.registrar.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_peer_removal_keeps_session_active() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        let connected = ctx.manager.connect(user, CLIENT).await.unwrap();
        ctx.registrar.push_remove_outcome(ScriptedOutcome::Fail("wg: permission denied".to_string()));

        let err = ctx.manager.disconnect(user).await.unwrap_err();

        assert!(matches!(err, AppError::RegistrationFailed(_)));
        let still_active = ctx.manager.status(user).await.unwrap().unwrap();
        assert_eq!(still_active.id, connected.session.id);
        assert!(still_active.is_active());

        // A retry goes through once the registrar recovers.
        assert!(ctx.manager.disconnect(user).await.unwrap().session.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_creates_new_session() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();

        let first = ctx.manager.connect(user, CLIENT).await.unwrap();
        ctx.manager.disconnect(user).await.unwrap();
        let second = ctx.manager.connect(user, CLIENT).await.unwrap();

        assert!(second.created);
        assert_ne!(second.session.id, first.session.id);
        assert_ne!(second.session.client_public_key, first.session.client_public_key);
        assert_eq!(ctx.registrar.add_count(), 2);
        assert_eq!(ctx.store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_update_stats_overwrites_counters() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        ctx.manager.connect(user, CLIENT).await.unwrap();

        let updated = ctx.manager.update_stats(user, 100, 200).await.unwrap();
        assert_eq!((updated.bytes_sent, updated.bytes_received), (100, 200));

        let updated = ctx.manager.update_stats(user, 50, 60).await.unwrap();
        assert_eq!((updated.bytes_sent, updated.bytes_received), (50, 60));

        let status = ctx.manager.status(user).await.unwrap().unwrap();
        assert_eq!((status.bytes_sent, status.bytes_received), (50, 60));
    }

    #[tokio::test]
    async fn test_update_stats_without_session_fails() {
        let ctx = TestContext::new();

        let err = ctx.manager.update_stats(Uuid::new_v4(), 1, 1).await.unwrap_err();

        assert!(matches!(err, AppError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_update_stats_rejects_out_of_range_counters() {
        let ctx = TestContext::new();
        let user = Uuid::new_v4();
        ctx.manager.connect(user, CLIENT).await.unwrap();

        let err = ctx.manager.update_stats(user, u64::MAX, 0).await.unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_exhausted_pool_refuses_connect() {
        let settings = VpnSettings {
            subnet: IpPool::new(Ipv4Addr::new(10, 0, 254, 0)),
            ..VpnSettings::default()
        };
        let ctx = TestContext::build(settings, ScriptedPeerRegistrar::new());

        // Fill the last block so the next address would leave the pool.
        for _ in 2..=254 {
            ctx.manager.connect(Uuid::new_v4(), CLIENT).await.unwrap();
        }

        let err = ctx.manager.connect(Uuid::new_v4(), CLIENT).await.unwrap_err();

        assert!(matches!(err, AppError::PoolExhausted));
        assert_eq!(ctx.registrar.add_count(), 253);
    }
}
