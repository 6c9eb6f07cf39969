// crates/live-server/tests/state_store.rs
use std::time::Duration;

use live_server::{shutdown, MemoryStateStore, SessionId, SocketId, StateStore, StoreError, StoredState};
use serde_json::json;

fn id(name: &str) -> SocketId {
    SocketId::from(&SessionId::new(name))
}

fn state(value: i64) -> StoredState {
    StoredState {
        render: format!("<p>{value}</p>"),
        assigns: json!({ "value": value }),
    }
}

#[tokio::test(start_paused = true)]
async fn entry_is_readable_until_its_ttl_passes() {
    let store = MemoryStateStore::spawn(Duration::from_secs(5), shutdown::Shutdown::never());
    store.set(id("a"), state(1), Duration::from_secs(2)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.get(id("a")).await.unwrap(), state(1));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.get(id("a")).await, Err(StoreError::NoState));
}

#[tokio::test(start_paused = true)]
async fn expiry_and_absence_look_the_same() {
    let store = MemoryStateStore::spawn(Duration::from_secs(5), shutdown::Shutdown::never());
    store.set(id("a"), state(1), Duration::from_millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.get(id("a")).await, store.get(id("never-set")).await);
}

#[tokio::test]
async fn set_overwrites_and_delete_removes() {
    let store = MemoryStateStore::spawn(Duration::from_secs(5), shutdown::Shutdown::never());
    let ttl = Duration::from_secs(60);
    store.set(id("a"), state(1), ttl).await.unwrap();
    store.set(id("a"), state(2), ttl).await.unwrap();
    assert_eq!(store.get(id("a")).await.unwrap(), state(2));

    store.delete(id("a")).await.unwrap();
    assert_eq!(store.get(id("a")).await, Err(StoreError::NoState));
    // Deleting a missing key is fine.
    store.delete(id("a")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn janitor_evicts_expired_entries_without_reads() {
    let store = MemoryStateStore::spawn(Duration::from_secs(5), shutdown::Shutdown::never());
    store.set(id("short"), state(1), Duration::from_secs(1)).await.unwrap();
    store.set(id("long"), state(2), Duration::from_secs(60)).await.unwrap();
    assert_eq!(store.len().await.unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(store.len().await.unwrap(), 1);
    assert!(store.get(id("long")).await.is_ok());
}

#[tokio::test]
async fn store_stops_on_shutdown() {
    let (trigger, signal) = shutdown::channel();
    let store = MemoryStateStore::spawn(Duration::from_secs(5), signal);
    store.set(id("a"), state(1), Duration::from_secs(60)).await.unwrap();

    trigger.trigger();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.get(id("a")).await, Err(StoreError::Closed));
}
