use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as DayDelta, Local};
use tokio_util::sync::CancellationToken;

use assessment_stats::cache::{daily_counter_key, questionnaire_snapshot_key};
use assessment_stats::model::{StatKey, StatType};
use assessment_stats::{
    BatchOptions, CounterCache, Database, MemoryCounterCache, QueryGateway, RawAggregator,
    RollupStore, SqliteRollupStore, Synchronizer, Validator,
};

struct Stack {
    db: Database,
    cache: Arc<MemoryCounterCache>,
    rollups: Arc<SqliteRollupStore>,
    sync: Synchronizer,
    validator: Validator,
    gateway: QueryGateway,
}

async fn stack() -> Stack {
    let db = Database::in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    let cache = Arc::new(MemoryCounterCache::new(Duration::from_secs(300)));
    let rollups = Arc::new(SqliteRollupStore::new(db.pool().clone()));
    let raw = RawAggregator::new(db.pool().clone());
    Stack {
        sync: Synchronizer::new(cache.clone(), rollups.clone(), raw.clone(), BatchOptions::default()),
        validator: Validator::new(cache.clone(), rollups.clone(), raw.clone(), BatchOptions::default()),
        gateway: QueryGateway::new(cache.clone(), rollups.clone(), raw, Duration::from_secs(300)),
        db,
        cache,
        rollups,
    }
}

#[tokio::test]
async fn counters_flow_through_rollups_to_cached_view() {
    let s = stack().await;
    let key = StatKey::new(1, StatType::Questionnaire, "Q001");
    let today = Local::now().date_naive();
    for back in 1..=10 {
        let date = today - DayDelta::days(back);
        s.cache
            .incr_daily_counter(&daily_counter_key(&key, date), 5, 3, None)
            .await;
    }
    let cancel = CancellationToken::new();

    let daily = s.sync.sync_daily_statistics(&cancel).await.unwrap().completed().unwrap();
    assert_eq!(daily.processed, 10);
    let rows = s
        .rollups
        .get_daily_range(&key, today - DayDelta::days(30), today)
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);

    s.sync.sync_accumulated_statistics(&cancel).await.unwrap();
    let acc = s.rollups.get_accumulated(&key).await.unwrap().unwrap();
    assert_eq!((acc.total_submissions, acc.total_completions), (50, 30));

    let view = s
        .gateway
        .get_questionnaire_statistics(&cancel, 1, "Q001")
        .await
        .unwrap();
    assert_eq!(view.total_submissions, 50);
    assert_eq!(view.completion_rate, 60.0);
    assert_eq!(view.last_7_days, 30);
    assert_eq!(view.last_30_days, 50);
    assert_eq!(view.daily_trend.len(), 30);
    assert!(s
        .cache
        .get_snapshot(&questionnaire_snapshot_key(1, "Q001"))
        .await
        .unwrap()
        .is_some());

    let report = s
        .validator
        .validate_consistency(&cancel)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!((report.checked, report.consistent), (1, 1));
}

#[tokio::test]
async fn raw_fallback_serves_orgs_without_rollups() {
    let s = stack().await;
    let now = Local::now().timestamp_millis();
    for status in ["interpreted", "submitted", "interpreted"] {
        sqlx::query(
            r#"
            INSERT INTO assessment
                (org_id, testee_id, questionnaire_code, origin_type, status, created_at, submitted_at)
            VALUES (7, 1, 'Q9', 'screening', ?, ?, ?)
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(s.db.pool())
        .await
        .unwrap();
    }

    let view = s
        .gateway
        .get_questionnaire_statistics(&CancellationToken::new(), 7, "Q9")
        .await
        .unwrap();
    assert_eq!(view.total_submissions, 3);
    assert_eq!(view.total_completions, 2);
    assert_eq!(view.origin.screening, 3);
}
