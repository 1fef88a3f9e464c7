use chrono::{TimeDelta, Utc};
use trawl_core::error::AppError;
use trawl_core::models::ChangeKind;
use trawl_core::testutil::make_record;
use trawl_core::traits::ListingStore;
use trawl_db::PgListingStore;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn upsert_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);
    let batch = vec![make_record("1", "Backend Intern"), make_record("2", "Data Intern")];

    let first = store.upsert(&batch).await.unwrap();
    assert_eq!((first.inserted, first.updated, first.skipped), (2, 0, 0));
    assert_eq!(first.changes.len(), 2);
    let before = store.get("test-board", "1").await.unwrap().unwrap();

    let second = store.upsert(&batch).await.unwrap();
    assert_eq!((second.inserted, second.updated, second.skipped), (0, 0, 2));
    assert!(second.changes.is_empty());

    let after = store.get("test-board", "1").await.unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.updated_at, before.updated_at);
    assert!(after.last_seen_at >= before.last_seen_at);
}

#[tokio::test]
async fn changed_fields_update_and_emit_event() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);
    store.upsert(&[make_record("1", "Backend Intern")]).await.unwrap();
    let before = store.get("test-board", "1").await.unwrap().unwrap();

    let mut changed = make_record("1", "Backend Intern");
    changed.compensation = Some(20_000);
    let report = store.upsert(&[changed]).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.changes[0].kind, ChangeKind::Updated);
    assert_eq!(report.changes[0].listing_id, before.id);

    let after = store.get("test-board", "1").await.unwrap().unwrap();
    assert_eq!(after.record.compensation, Some(20_000));
    assert_ne!(after.content_hash, before.content_hash);
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
async fn skill_order_is_not_a_change() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);
    store.upsert(&[make_record("1", "Backend Intern")]).await.unwrap();

    let mut reordered = make_record("1", "Backend Intern");
    reordered.skills.reverse();
    let report = store.upsert(&[reordered]).await.unwrap();
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn natural_key_is_scoped_by_source() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);

    let mut other = make_record("1", "Backend Intern");
    other.source = "other-board".into();
    let report = store
        .upsert(&[make_record("1", "Backend Intern"), other])
        .await
        .unwrap();

    assert_eq!(report.inserted, 2);
    assert!(store.get("test-board", "1").await.unwrap().is_some());
    assert!(store.get("other-board", "1").await.unwrap().is_some());
}

#[tokio::test]
async fn failing_record_rolls_back_whole_batch() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);

    let mut bad = make_record("2", "Data Intern");
    bad.duration_months = Some(0);
    let err = store
        .upsert(&[make_record("1", "Backend Intern"), bad])
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::TransactionError(_)));
    assert!(store.get("test-board", "1").await.unwrap().is_none());
}

#[tokio::test]
async fn full_sweep_deactivates_unseen_listings() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool);
    let batch: Vec<_> = (1..=5)
        .map(|i| make_record(&i.to_string(), &format!("Intern {i}")))
        .collect();
    store.upsert(&batch).await.unwrap();

    let seen: Vec<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
    let deactivated = store.mark_inactive("test-board", &seen).await.unwrap();
    assert_eq!(deactivated, 2);

    let active = store.list_active("test-board", 10).await.unwrap();
    assert_eq!(active.len(), 3);
    let gone = store.get("test-board", "5").await.unwrap().unwrap();
    assert!(!gone.record.active);

    // Seen again: back to active.
    store.upsert(&[make_record("5", "Intern 5")]).await.unwrap();
    assert!(store.get("test-board", "5").await.unwrap().unwrap().record.active);
}

#[tokio::test]
async fn purge_deletes_only_stale_inactive_listings() {
    let (pool, _container) = setup_test_db().await;
    let store = PgListingStore::new(pool.clone());
    store
        .upsert(&[
            make_record("1", "Backend Intern"),
            make_record("2", "Data Intern"),
            make_record("3", "Design Intern"),
        ])
        .await
        .unwrap();
    store
        .mark_inactive("test-board", &["1".to_string()])
        .await
        .unwrap();

    sqlx::query(
        "UPDATE listings SET last_seen_at = NOW() - INTERVAL '90 days' WHERE external_id IN ('1', '2')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let purged = store
        .purge_inactive(Utc::now() - TimeDelta::days(30))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.get("test-board", "1").await.unwrap().is_some());
    assert!(store.get("test-board", "2").await.unwrap().is_none());
    assert!(store.get("test-board", "3").await.unwrap().is_some());
}
