// Integration tests for the in-memory session store
//
// These tests verify merge-patch updates, expiry, prefix scans and the
// compare-and-set primitive the session state machine is built on.

use anyhow::Result;
use scribe_stream::store::{fields, MemoryStore, SessionStore};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_put_and_update_merge_fields() -> Result<()> {
    let store = MemoryStore::new();

    store
        .put("session_status:s1", &fields([("status", "queued"), ("file_size", "10")]), HOUR)
        .await?;
    store
        .update("session_status:s1", &fields([("status", "processing")]))
        .await?;

    let record = store.get("session_status:s1").await?.expect("record should exist");
    assert_eq!(record.get("status").map(String::as_str), Some("processing"));
    assert_eq!(
        record.get("file_size").map(String::as_str),
        Some("10"),
        "Fields not named in an update must survive"
    );

    Ok(())
}

#[tokio::test]
async fn test_get_missing_record() -> Result<()> {
    let store = MemoryStore::new();
    assert!(store.get("session_status:nope").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_records_expire() -> Result<()> {
    let store = MemoryStore::new();

    store
        .put("session_status:short", &fields([("status", "queued")]), Duration::from_millis(30))
        .await?;
    assert!(store.get("session_status:short").await?.is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(store.get("session_status:short").await?.is_none(), "Expired record should be gone");
    assert!(store.scan("session_status:").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_update_keeps_expiry() -> Result<()> {
    let store = MemoryStore::new();

    store
        .put("session_status:s1", &fields([("status", "queued")]), Duration::from_millis(40))
        .await?;
    store
        .update("session_status:s1", &fields([("warning", "late")]))
        .await?;

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(store.get("session_status:s1").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_scan_by_prefix() -> Result<()> {
    let store = MemoryStore::new();
    for key in ["session_status:a", "session_status:b", "chunk_status:a-chunk-000"] {
        store.put(key, &fields([("status", "queued")]), HOUR).await?;
    }

    let sessions = store.scan("session_status:").await?;
    assert_eq!(sessions, vec!["session_status:a".to_string(), "session_status:b".to_string()]);

    let chunks = store.scan("chunk_status:").await?;
    assert_eq!(chunks.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_delete_counts_existing_records() -> Result<()> {
    let store = MemoryStore::new();
    store.put("k1", &fields([("a", "1")]), HOUR).await?;
    store.put("k2", &fields([("a", "1")]), HOUR).await?;

    let removed = store
        .delete(&["k1".to_string(), "k2".to_string(), "k3".to_string()])
        .await?;
    assert_eq!(removed, 2);
    assert!(store.get("k1").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_compare_and_set() -> Result<()> {
    let store = MemoryStore::new();
    store.put("session_status:s1", &fields([("status", "queued")]), HOUR).await?;

    // Wrong expectation: no write
    let moved = store
        .compare_and_set("session_status:s1", "status", &["processing"], "completed")
        .await?;
    assert!(!moved);

    let moved = store
        .compare_and_set("session_status:s1", "status", &["queued", "recording"], "processing")
        .await?;
    assert!(moved);

    // The same edge can only be taken once
    let again = store
        .compare_and_set("session_status:s1", "status", &["queued", "recording"], "processing")
        .await?;
    assert!(!again);

    let record = store.get("session_status:s1").await?.expect("record should exist");
    assert_eq!(record.get("status").map(String::as_str), Some("processing"));

    Ok(())
}

#[tokio::test]
async fn test_compare_and_set_on_missing_record() -> Result<()> {
    let store = MemoryStore::new();

    let moved = store
        .compare_and_set("session_status:ghost", "status", &["queued"], "processing")
        .await?;
    assert!(!moved);
    assert!(store.get("session_status:ghost").await?.is_none(), "CAS must not create records");

    Ok(())
}

#[tokio::test]
async fn test_update_never_creates_records() -> Result<()> {
    let store = MemoryStore::new();

    store
        .update("session_status:ghost", &fields([("transcript_text", "late")]))
        .await?;
    assert!(store.get("session_status:ghost").await?.is_none());
    assert!(store.scan("session_status:").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_update_after_expiry_stays_gone() -> Result<()> {
    let store = MemoryStore::new();

    store
        .put("session_status:s1", &fields([("status", "processing")]), Duration::from_millis(30))
        .await?;
    tokio::time::sleep(Duration::from_millis(60)).await;

    store
        .update("session_status:s1", &fields([("status", "completed")]))
        .await?;
    assert!(store.get("session_status:s1").await?.is_none());

    Ok(())
}
