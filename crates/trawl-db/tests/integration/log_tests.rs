use chrono::{TimeDelta, Utc};
use trawl_core::logsink::{LogEntry, LogLevel, LogQuery};
use trawl_core::traits::LogStore;
use trawl_db::PgLogStore;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn entry(level: LogLevel, source: &str, minutes_ago: i64) -> LogEntry {
    let mut entry = LogEntry::new(level, source, format!("{level} from {source}"));
    entry.timestamp = Utc::now() - TimeDelta::minutes(minutes_ago);
    entry
}

#[tokio::test]
async fn insert_batch_and_query_newest_first() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLogStore::new(pool);
    let job_id = Uuid::new_v4();

    let written = store
        .insert_batch(&[
            entry(LogLevel::Info, "board-a", 3).for_job(job_id),
            entry(LogLevel::Error, "board-a", 2)
                .with_metadata(serde_json::json!({"status": 503})),
            entry(LogLevel::Info, "board-b", 1),
        ])
        .await
        .unwrap();
    assert_eq!(written, 3);

    let all = store.query(&LogQuery::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

    let board_a = store
        .query(&LogQuery {
            source: Some("board-a".into()),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(board_a.len(), 2);
    assert_eq!(board_a[1].job_id, Some(job_id));

    let errors = store
        .query(&LogQuery {
            level: Some(LogLevel::Error),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].metadata["status"], 503);
}

#[tokio::test]
async fn query_pages_and_time_bounds() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLogStore::new(pool);
    let batch: Vec<_> = (0..10).map(|i| entry(LogLevel::Debug, "board", i)).collect();
    store.insert_batch(&batch).await.unwrap();

    let page = store
        .query(&LogQuery {
            limit: 3,
            offset: 3,
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(page[0].id, batch[3].id);

    let recent = store
        .query(&LogQuery {
            since: Some(Utc::now() - TimeDelta::seconds(150)),
            ..LogQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 3);
}

#[tokio::test]
async fn reinserting_same_entries_is_harmless() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLogStore::new(pool);
    let batch = vec![entry(LogLevel::Warn, "board", 0)];

    assert_eq!(store.insert_batch(&batch).await.unwrap(), 1);
    assert_eq!(store.insert_batch(&batch).await.unwrap(), 0);
    assert_eq!(store.insert_batch(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn stats_aggregate_since_cutoff() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLogStore::new(pool);
    store
        .insert_batch(&[
            entry(LogLevel::Info, "board-a", 5),
            entry(LogLevel::Error, "board-a", 4),
            entry(LogLevel::Error, "board-b", 3),
            entry(LogLevel::Error, "board-b", 600),
        ])
        .await
        .unwrap();

    let stats = store.stats(Utc::now() - TimeDelta::hours(1)).await.unwrap();
    assert_eq!(stats.by_level.get("error"), Some(&2));
    assert_eq!(stats.by_level.get("info"), Some(&1));
    assert_eq!(stats.by_source.get("board-a"), Some(&2));
    assert_eq!(stats.by_source.get("board-b"), Some(&1));
    assert_eq!(stats.recent_errors.len(), 2);
    assert_eq!(stats.recent_errors[0].source, "board-b");
}
