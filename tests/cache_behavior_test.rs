//! Cache laws: TTL round trip, tag invalidation exactness, pattern
//! invalidation, and partial-failure isolation during warm-up.

mod common;

use common::{initialized_pool, quiet_settings, FakeDatabase};
use dbpulse::cache::{CacheOptions, QueryResultCache, WarmCacheEntry};
use dbpulse::config::CacheSettings;
use dbpulse::error::PoolError;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handler that answers domain queries with a per-query execution counter
/// and treats the durable cache tier as always empty.
fn counting_handler() -> (
    Arc<Mutex<HashMap<String, u64>>>,
    impl Fn(&str, &[serde_json::Value]) -> Result<Vec<serde_json::Value>, PoolError>
        + Send
        + Sync
        + 'static,
) {
    let executions: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let counter = Arc::clone(&executions);
    let handler = move |sql: &str, _params: &[serde_json::Value]| {
        if sql.contains("query_result_cache") {
            return Ok(vec![]);
        }
        if sql.contains("boom") {
            return Err(PoolError::Query("injected failure".to_string()));
        }
        let mut map = counter.lock().unwrap();
        let count = map.entry(sql.to_string()).or_insert(0);
        *count += 1;
        Ok(vec![json!({ "value": *count })])
    };
    (executions, handler)
}

async fn cache_over(db: &Arc<FakeDatabase>) -> Arc<QueryResultCache> {
    let pool = initialized_pool(db, quiet_settings(3)).await;
    Arc::new(QueryResultCache::new(pool, CacheSettings::default()))
}

fn executions_of(map: &Arc<Mutex<HashMap<String, u64>>>, sql: &str) -> u64 {
    map.lock().unwrap().get(sql).copied().unwrap_or(0)
}

#[tokio::test]
async fn test_ttl_round_trip() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let sql = "SELECT * FROM leaderboards WHERE week = $1";
    let options = CacheOptions::with_ttl(Duration::from_millis(100));

    let first = cache
        .cached_query(sql, &[json!(31)], options.clone())
        .await
        .unwrap();
    let second = cache
        .cached_query(sql, &[json!(31)], options.clone())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(executions_of(&executions, sql), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let third = cache.cached_query(sql, &[json!(31)], options).await.unwrap();
    assert_eq!(executions_of(&executions, sql), 2);
    assert_ne!(first, third);
}

#[tokio::test]
async fn test_different_params_do_not_collide() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let sql = "SELECT * FROM goals WHERE team_id = $1";
    cache
        .cached_query(sql, &[json!(1)], CacheOptions::default())
        .await
        .unwrap();
    cache
        .cached_query(sql, &[json!(2)], CacheOptions::default())
        .await
        .unwrap();
    assert_eq!(executions_of(&executions, sql), 2);
}

#[tokio::test]
async fn test_equivalent_query_texts_share_an_entry() {
    let (_executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    cache
        .cached_query("SELECT id FROM teams", &[], CacheOptions::default())
        .await
        .unwrap();
    cache
        .cached_query("select   id\n from teams;", &[], CacheOptions::default())
        .await
        .unwrap();

    let stats = cache.get_stats().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_tag_invalidation_removes_exactly_tagged_entries() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let leaderboard_sql = "SELECT * FROM leaderboards";
    let teams_sql = "SELECT * FROM teams";
    cache
        .cached_query(
            leaderboard_sql,
            &[],
            CacheOptions::with_tags(&["leaderboard"]),
        )
        .await
        .unwrap();
    cache
        .cached_query(teams_sql, &[], CacheOptions::with_tags(&["teams"]))
        .await
        .unwrap();

    cache
        .invalidate_by_tags(&["leaderboard".to_string()])
        .await
        .unwrap();

    // The tagged entry re-executes; the untagged one is still cached.
    cache
        .cached_query(
            leaderboard_sql,
            &[],
            CacheOptions::with_tags(&["leaderboard"]),
        )
        .await
        .unwrap();
    cache
        .cached_query(teams_sql, &[], CacheOptions::with_tags(&["teams"]))
        .await
        .unwrap();
    assert_eq!(executions_of(&executions, leaderboard_sql), 2);
    assert_eq!(executions_of(&executions, teams_sql), 1);
}

#[tokio::test]
async fn test_pattern_invalidation_matches_query_text() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let activities_sql = "SELECT * FROM activities WHERE team_id = $1";
    let goals_sql = "SELECT * FROM goals";
    cache
        .cached_query(activities_sql, &[json!(1)], CacheOptions::default())
        .await
        .unwrap();
    cache
        .cached_query(goals_sql, &[], CacheOptions::default())
        .await
        .unwrap();

    cache.invalidate_by_pattern("activities").await.unwrap();

    cache
        .cached_query(activities_sql, &[json!(1)], CacheOptions::default())
        .await
        .unwrap();
    cache
        .cached_query(goals_sql, &[], CacheOptions::default())
        .await
        .unwrap();
    assert_eq!(executions_of(&executions, activities_sql), 2);
    assert_eq!(executions_of(&executions, goals_sql), 1);
}

#[tokio::test]
async fn test_invalid_pattern_is_rejected() {
    let (_executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;
    assert!(cache.invalidate_by_pattern("(unclosed").await.is_err());
}

#[tokio::test]
async fn test_warm_cache_isolates_one_failure() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let mut entries: Vec<WarmCacheEntry> = (0..4)
        .map(|i| WarmCacheEntry {
            query: format!("SELECT * FROM teams WHERE id = {i}"),
            params: vec![],
            options: CacheOptions::default(),
        })
        .collect();
    entries.push(WarmCacheEntry {
        query: "SELECT boom".to_string(),
        params: vec![],
        options: CacheOptions::default(),
    });

    let report = cache.warm_cache(&entries).await;
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.contains("boom"));

    // The four good entries are present: re-reads hit the cache.
    for i in 0..4 {
        let sql = format!("SELECT * FROM teams WHERE id = {i}");
        cache
            .cached_query(&sql, &[], CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(executions_of(&executions, &sql), 1);
    }
}

#[tokio::test]
async fn test_execution_errors_propagate_but_cache_errors_do_not() {
    let (_executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    // The query itself failing must reach the caller.
    assert!(cache
        .cached_query("SELECT boom", &[], CacheOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_explicit_logical_key() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let options = CacheOptions {
        key: Some("weekly-board".to_string()),
        ..Default::default()
    };
    let a = "SELECT * FROM leaderboards WHERE week = 1";
    let b = "SELECT * FROM leaderboards WHERE week = 2";
    cache.cached_query(a, &[], options.clone()).await.unwrap();
    // Same logical key: served from cache even though the text differs.
    cache.cached_query(b, &[], options).await.unwrap();
    assert_eq!(executions_of(&executions, a), 1);
    assert_eq!(executions_of(&executions, b), 0);
}

#[tokio::test]
async fn test_clear_empties_the_cache() {
    let (executions, handler) = counting_handler();
    let db = FakeDatabase::new(handler);
    let cache = cache_over(&db).await;

    let sql = "SELECT * FROM teams";
    cache
        .cached_query(sql, &[], CacheOptions::default())
        .await
        .unwrap();
    cache.clear().await;
    cache
        .cached_query(sql, &[], CacheOptions::default())
        .await
        .unwrap();
    assert_eq!(executions_of(&executions, sql), 2);
}
