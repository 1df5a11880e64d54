//! DNS synchronizer integration tests: persisted bindings across restarts.

mod common;

use std::sync::Arc;

use common::*;
use haproxy_sync::dns::{RecordKind, SyncOutcome};
use haproxy_sync::store::{CoordinationStore, MemoryStore};

fn binding_key(kind: &str) -> String {
    format!("{DNS_NS}/{kind}/{INSTANCE_ID}")
}

// =========================================================================
// Bindings
// =========================================================================

#[tokio::test]
async fn first_start_creates_one_record_per_kind() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeDnsProvider::default());
    let sync = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );

    sync.start().await.unwrap();

    assert_eq!(
        provider.calls(),
        vec![
            ProviderCall::Create(RecordKind::A, "203.0.113.10".to_string()),
            ProviderCall::Create(RecordKind::Aaaa, "2001:db8::10".to_string()),
        ]
    );
    assert_eq!(store.get(&binding_key("ipv4")).await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.get(&binding_key("ipv6")).await.unwrap().as_deref(), Some("2"));
    assert_eq!(store.keys_under(DNS_NS).len(), 2);
}

#[tokio::test]
async fn restart_reuses_persisted_records() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeDnsProvider::default());

    let first = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );
    first.start().await.unwrap();
    provider.clear_calls();

    // A fresh process over the same store
    let second = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );
    let outcomes = second.dns().unwrap().sync().await.unwrap();

    assert_eq!(provider.creates(), 0);
    assert_eq!(provider.calls(), vec![ProviderCall::Get(1), ProviderCall::Get(2)]);
    assert_eq!(
        outcomes,
        vec![
            (RecordKind::A, SyncOutcome::Unchanged(1)),
            (RecordKind::Aaaa, SyncOutcome::Unchanged(2)),
        ]
    );
    assert_eq!(store.keys_under(DNS_NS).len(), 2);
}

#[tokio::test]
async fn changed_address_updates_existing_record() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeDnsProvider::default());

    let first = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );
    first.dns().unwrap().sync().await.unwrap();
    provider.clear_calls();

    let mut config = test_config(dir.path());
    config.instance.public_ipv4 = "198.51.100.7".parse().unwrap();
    let moved = build_sync(
        config,
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );
    let outcome = moved.dns().unwrap().reconcile(RecordKind::A).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Updated(1));
    assert_eq!(provider.record(1).as_deref(), Some("198.51.100.7"));
    assert_eq!(
        provider.calls(),
        vec![
            ProviderCall::Get(1),
            ProviderCall::Update(1, "198.51.100.7".to_string())
        ]
    );
}

#[tokio::test]
async fn repeated_sync_in_one_process_does_not_reread_bindings() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeDnsProvider::default());
    let sync = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );
    let dns = sync.dns().unwrap();

    dns.sync().await.unwrap();
    // Losing the stored binding does not matter once it is cached
    store.delete(&binding_key("ipv4"));
    dns.sync().await.unwrap();

    assert_eq!(provider.creates(), 2);
    assert_eq!(dns.binding(RecordKind::A).await, Some(1));
}

// =========================================================================
// Failures
// =========================================================================

#[tokio::test]
async fn provider_failure_aborts_startup() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeDnsProvider::failing());
    let sync = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        Some(provider.clone()),
    );

    assert!(sync.start().await.is_err());
    // Not retried within the same invocation
    assert_eq!(provider.calls().len(), 1);
    assert!(store.keys_under(DNS_NS).is_empty());
}

#[tokio::test]
async fn disabled_dns_skips_provider() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let sync = build_sync(
        test_config(dir.path()),
        &store,
        Arc::new(RecordingReloader::default()),
        None,
    );

    sync.start().await.unwrap();
    assert!(sync.dns().is_none());
    assert!(store.keys_under(DNS_NS).is_empty());
}
