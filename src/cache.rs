//! Two-tier query result cache with tag- and pattern-based invalidation.
//!
//! Results live in a fast in-process map and a durable table reached
//! through the pool. The cache is a disposable optimization: storage-tier
//! failures degrade silently to direct execution, and every read path
//! re-checks expiry so correctness never depends on the sweep running.

use crate::config::CacheSettings;
use crate::error::{CacheError, PoolError};
use crate::pool::ConnectionPoolManager;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

const RESPONSE_SAMPLE_CAP: usize = 1000;
const RESPONSE_SAMPLE_KEEP: usize = 100;

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS query_result_cache (
        cache_key TEXT PRIMARY KEY,
        query_text TEXT NOT NULL DEFAULT '',
        payload JSONB NOT NULL,
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        hit_count BIGINT NOT NULL DEFAULT 0
    )
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub tags: Vec<String>,
    /// Original query text, kept for pattern invalidation
    pub query_text: String,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Explicit logical key; otherwise derived from query + params
    pub key: Option<String>,
    /// TTL override; otherwise the configured default applies
    pub ttl: Option<Duration>,
    /// Labels enabling bulk invalidation of related entries
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn with_tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub local_entries: usize,
    pub average_response_ms: f64,
}

#[derive(Debug, Clone)]
pub struct WarmCacheEntry {
    pub query: String,
    pub params: Vec<Value>,
    pub options: CacheOptions,
}

#[derive(Debug, Default)]
pub struct WarmCacheReport {
    pub succeeded: usize,
    pub failed: Vec<(String, String)>,
}

pub struct QueryResultCache {
    pool: Arc<ConnectionPoolManager>,
    settings: CacheSettings,
    local: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    response_samples_ms: Mutex<Vec<f64>>,
    sweeper_running: Arc<AtomicBool>,
}

impl QueryResultCache {
    pub fn new(pool: Arc<ConnectionPoolManager>, settings: CacheSettings) -> Self {
        Self {
            pool,
            settings,
            local: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            response_samples_ms: Mutex::new(Vec::new()),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create the durable tier's table. Safe to call repeatedly.
    pub async fn ensure_schema(&self) -> Result<(), CacheError> {
        self.pool
            .execute_update(SCHEMA_SQL, &[])
            .await
            .map_err(|e| CacheError::StorageTier(e.to_string()))?;
        Ok(())
    }

    /// Collapse whitespace and case/punctuation variance so textually
    /// equivalent queries collide to the same key.
    pub fn normalize_query(sql: &str) -> String {
        let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut normalized = collapsed.to_lowercase();
        normalized = normalized.replace(" ,", ",");
        normalized = normalized.replace("( ", "(");
        normalized = normalized.replace(" )", ")");
        normalized.trim_end_matches(';').trim().to_string()
    }

    /// Cache key: caller-supplied logical key, or a digest of the
    /// normalized query and serialized params.
    pub fn derive_key(sql: &str, params: &[Value], options: &CacheOptions) -> String {
        if let Some(key) = &options.key {
            return key.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize_query(sql).as_bytes());
        hasher.update([0x1f]);
        hasher.update(
            serde_json::to_string(params)
                .unwrap_or_default()
                .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }

    /// Read-through cached execution: fast tier, then durable tier, then
    /// the database, storing fresh results in both tiers.
    pub async fn cached_query(
        &self,
        sql: &str,
        params: &[Value],
        options: CacheOptions,
    ) -> Result<Value, PoolError> {
        let started = Instant::now();
        let key = Self::derive_key(sql, params, &options);
        let now = Utc::now();

        if let Some(payload) = self.local_lookup(&key, now).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.record_response(started).await;
            return Ok(payload);
        }

        if let Some(entry) = self.durable_lookup(&key, now).await {
            let payload = entry.payload.clone();
            self.promote_local(entry).await;
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.record_response(started).await;
            return Ok(payload);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rows = self.pool.execute(sql, params).await?;
        let payload = Value::Array(rows);

        let ttl = options
            .ttl
            .unwrap_or(Duration::from_secs(self.settings.default_ttl_secs))
            .max(Duration::from_millis(1));
        let entry = CacheEntry {
            key: key.clone(),
            payload: payload.clone(),
            created_at: now,
            expires_at: now
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300)),
            hit_count: 0,
            tags: options.tags.clone(),
            query_text: sql.to_string(),
        };

        self.store_durable(&entry).await;
        self.promote_local(entry).await;
        self.record_response(started).await;
        Ok(payload)
    }

    async fn local_lookup(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let mut local = self.local.write().await;
        match local.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                Some(entry.payload.clone())
            }
            Some(_) => {
                // Expired entries are absent on every read path, sweep or not.
                local.remove(key);
                None
            }
            None => None,
        }
    }

    async fn durable_lookup(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let rows = match self
            .pool
            .execute(
                "SELECT payload, tags, query_text, created_at, expires_at, hit_count \
                 FROM query_result_cache WHERE cache_key = $1 AND expires_at > now()",
                &[json!(key)],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!("Durable cache tier degraded on read: {}", e);
                return None;
            }
        };

        let row = rows.first()?;
        let expires_at = row
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))?;
        if expires_at <= now {
            return None;
        }

        let tags = row
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let entry = CacheEntry {
            key: key.to_string(),
            payload: row.get("payload").cloned().unwrap_or(Value::Null),
            created_at: row
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now),
            expires_at,
            hit_count: row.get("hit_count").and_then(|v| v.as_u64()).unwrap_or(0),
            tags,
            query_text: row
                .get("query_text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        };

        // Hit accounting in the durable tier is best effort.
        let _ = self
            .pool
            .execute_update(
                "UPDATE query_result_cache SET hit_count = hit_count + 1 WHERE cache_key = $1",
                &[json!(key)],
            )
            .await;

        Some(entry)
    }

    async fn promote_local(&self, entry: CacheEntry) {
        let mut local = self.local.write().await;
        local.insert(entry.key.clone(), entry);

        // Bound the fast tier; entries closest to expiry go first.
        while local.len() > self.settings.max_local_entries {
            let evict = local
                .values()
                .min_by_key(|e| e.expires_at)
                .map(|e| e.key.clone());
            match evict {
                Some(key) => {
                    local.remove(&key);
                }
                None => break,
            }
        }
    }

    async fn store_durable(&self, entry: &CacheEntry) {
        let result = self
            .pool
            .execute_update(
                "INSERT INTO query_result_cache \
                 (cache_key, query_text, payload, tags, created_at, expires_at, hit_count) \
                 VALUES ($1, $2, $3, $4, now(), now() + ($5 || ' milliseconds')::interval, 0) \
                 ON CONFLICT (cache_key) DO UPDATE SET \
                 payload = EXCLUDED.payload, tags = EXCLUDED.tags, \
                 created_at = now(), expires_at = EXCLUDED.expires_at, hit_count = 0",
                &[
                    json!(entry.key),
                    json!(entry.query_text),
                    entry.payload.clone(),
                    json!(entry.tags),
                    json!((entry.expires_at - entry.created_at).num_milliseconds().to_string()),
                ],
            )
            .await;
        if let Err(e) = result {
            debug!("Durable cache tier degraded on write: {}", e);
        }
    }

    /// Remove every entry whose tag set intersects `tags`, in both tiers.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        let mut removed = {
            let mut local = self.local.write().await;
            let before = local.len();
            local.retain(|_, entry| !entry.tags.iter().any(|t| tags.contains(t)));
            (before - local.len()) as u64
        };

        for tag in tags {
            match self
                .pool
                .execute_update(
                    "DELETE FROM query_result_cache WHERE tags @> $1",
                    &[json!([tag])],
                )
                .await
            {
                Ok(count) => removed += count,
                Err(e) => debug!("Durable cache tier degraded on tag invalidation: {}", e),
            }
        }

        info!("Invalidated {} cache entries by tags {:?}", removed, tags);
        Ok(removed)
    }

    /// Remove entries whose original query text matches `pattern`.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let matcher =
            Regex::new(pattern).map_err(|e| CacheError::InvalidPattern(e.to_string()))?;

        let mut removed = {
            let mut local = self.local.write().await;
            let before = local.len();
            local.retain(|_, entry| !matcher.is_match(&entry.query_text));
            (before - local.len()) as u64
        };

        match self
            .pool
            .execute_update(
                "DELETE FROM query_result_cache WHERE query_text ~ $1",
                &[json!(pattern)],
            )
            .await
        {
            Ok(count) => removed += count,
            Err(e) => debug!("Durable cache tier degraded on pattern invalidation: {}", e),
        }

        info!("Invalidated {} cache entries by pattern {}", removed, pattern);
        Ok(removed)
    }

    /// Drop expired entries in both tiers. Reads never depend on this.
    pub async fn purge_expired(&self) -> (u64, u64) {
        let now = Utc::now();
        let local_removed = {
            let mut local = self.local.write().await;
            let before = local.len();
            local.retain(|_, entry| !entry.is_expired(now));
            (before - local.len()) as u64
        };

        let durable_removed = match self
            .pool
            .execute_update(
                "DELETE FROM query_result_cache WHERE expires_at <= now()",
                &[],
            )
            .await
        {
            Ok(count) => count,
            Err(e) => {
                debug!("Durable cache tier degraded on sweep: {}", e);
                0
            }
        };

        if local_removed > 0 || durable_removed > 0 {
            debug!(
                "Cache sweep removed {} local and {} durable entries",
                local_removed, durable_removed
            );
        }
        (local_removed, durable_removed)
    }

    /// Start the periodic expiry sweep as a background task.
    pub fn start_sweeper(self: Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Starting cache sweeper with {}s interval",
            self.settings.sweep_interval_secs
        );

        let cache = self;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(cache.settings.sweep_interval_secs));
            ticker.tick().await;
            while cache.sweeper_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !cache.sweeper_running.load(Ordering::SeqCst) {
                    break;
                }
                cache.purge_expired().await;
            }
            info!("Cache sweeper stopped");
        });
    }

    pub fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
    }

    /// Pre-populate the cache. One entry's failure never blocks the others.
    pub async fn warm_cache(&self, entries: &[WarmCacheEntry]) -> WarmCacheReport {
        let tasks: Vec<_> = entries
            .iter()
            .map(|entry| async {
                self.cached_query(&entry.query, &entry.params, entry.options.clone())
                    .await
                    .map_err(|e| (entry.query.clone(), e.to_string()))
            })
            .collect();

        let mut report = WarmCacheReport::default();
        for result in join_all(tasks).await {
            match result {
                Ok(_) => report.succeeded += 1,
                Err((query, error)) => {
                    warn!("Cache warm-up failed for '{}': {}", query, error);
                    report.failed.push((query, error));
                }
            }
        }
        info!(
            "Cache warm-up: {} populated, {} failed",
            report.succeeded,
            report.failed.len()
        );
        report
    }

    /// Empty both tiers. Used by remediation before a rewarm.
    pub async fn clear(&self) {
        self.local.write().await.clear();
        if let Err(e) = self
            .pool
            .execute_update("DELETE FROM query_result_cache", &[])
            .await
        {
            debug!("Durable cache tier degraded on clear: {}", e);
        }
        info!("Query result cache cleared");
    }

    async fn record_response(&self, started: Instant) {
        let mut samples = self.response_samples_ms.lock().await;
        samples.push(started.elapsed().as_secs_f64() * 1000.0);
        if samples.len() > RESPONSE_SAMPLE_CAP {
            let keep_from = samples.len() - RESPONSE_SAMPLE_KEEP;
            samples.drain(..keep_from);
        }
    }

    pub async fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let average_response_ms = {
            let samples = self.response_samples_ms.lock().await;
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            local_entries: self.local.read().await.len(),
            average_response_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalization_collapses_variance() {
        let a = QueryResultCache::normalize_query("SELECT  *\n FROM teams  WHERE id = $1;");
        let b = QueryResultCache::normalize_query("select * from teams where id = $1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalization_strips_paren_spacing() {
        let a = QueryResultCache::normalize_query("SELECT count( * ) FROM goals");
        let b = QueryResultCache::normalize_query("select count(*) from goals");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_derivation_distinguishes_params() {
        let options = CacheOptions::default();
        let k1 = QueryResultCache::derive_key("SELECT 1", &[json!(1)], &options);
        let k2 = QueryResultCache::derive_key("SELECT 1", &[json!(2)], &options);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_explicit_key_wins() {
        let options = CacheOptions {
            key: Some("leaderboard:weekly".to_string()),
            ..Default::default()
        };
        let key = QueryResultCache::derive_key("SELECT 1", &[], &options);
        assert_eq!(key, "leaderboard:weekly");
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".to_string(),
            payload: Value::Null,
            created_at: now - ChronoDuration::seconds(10),
            expires_at: now - ChronoDuration::seconds(1),
            hit_count: 0,
            tags: vec![],
            query_text: String::new(),
        };
        assert!(entry.is_expired(now));
    }

    proptest! {
        #[test]
        fn prop_normalization_is_whitespace_insensitive(
            gaps in proptest::collection::vec("[ \t\n]{1,4}", 4..8)
        ) {
            let words = ["SELECT", "name", "FROM", "activities", "WHERE", "id", "=", "$1"];
            let mut spaced = String::new();
            for (i, word) in words.iter().enumerate() {
                spaced.push_str(word);
                spaced.push_str(&gaps[i % gaps.len()]);
            }
            let reference = words.join(" ");
            prop_assert_eq!(
                QueryResultCache::normalize_query(&spaced),
                QueryResultCache::normalize_query(&reference)
            );
        }
    }
}
