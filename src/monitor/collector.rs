//! Per-tick metric collection with per-source failure isolation.

use super::{
    CacheTierMetrics, ConnectionMetrics, MetricsSnapshot, QueryMetrics, StorageMetrics,
    SystemMetrics,
};
use crate::cache::QueryResultCache;
use crate::config::AlertThresholds;
use crate::error::MonitorError;
use crate::pool::ConnectionPoolManager;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MetricsCollector {
    pool: Arc<ConnectionPoolManager>,
    cache: Arc<QueryResultCache>,
    thresholds: AlertThresholds,
}

impl MetricsCollector {
    pub fn new(
        pool: Arc<ConnectionPoolManager>,
        cache: Arc<QueryResultCache>,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            pool,
            cache,
            thresholds,
        }
    }

    /// Assemble one snapshot. A failing source is logged and reported as
    /// its zeroed default; it never fails the snapshot.
    pub async fn collect(&self) -> MetricsSnapshot {
        let connections = match self.collect_connections().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("{}", e);
                ConnectionMetrics::default()
            }
        };
        let queries = match self.collect_queries().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("{}", e);
                QueryMetrics::default()
            }
        };
        let storage = match self.collect_storage().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("{}", e);
                StorageMetrics::default()
            }
        };
        let system = match self.collect_system().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("{}", e);
                SystemMetrics::default()
            }
        };
        let cache = self.collect_cache().await;

        MetricsSnapshot {
            timestamp: Utc::now(),
            connections,
            queries,
            storage,
            cache,
            system,
        }
    }

    async fn collect_connections(&self) -> Result<ConnectionMetrics, MonitorError> {
        let metrics = self.pool.get_metrics().await.map_err(|e| {
            MonitorError::CollectionFailed {
                metric_source: "connection_pool".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(ConnectionMetrics {
            active: metrics.active_connections,
            idle: metrics.idle_connections,
            total: metrics.total_connections,
            max: metrics.max_connections,
            waiting: metrics.waiting_requests,
            utilization_percent: metrics.utilization_percent,
            average_wait_ms: metrics.average_wait_ms,
        })
    }

    async fn collect_queries(&self) -> Result<QueryMetrics, MonitorError> {
        // pg_stat_statements is optional; its absence degrades to zeros
        // rather than failing the group.
        let (avg_query_time_ms, slow_queries) = match self
            .pool
            .execute(
                &format!(
                    "SELECT COALESCE(avg(mean_exec_time), 0)::float8 AS avg_time, \
                     count(*) FILTER (WHERE mean_exec_time > {}) AS slow \
                     FROM pg_stat_statements",
                    self.thresholds.query_time_warning_ms
                ),
                &[],
            )
            .await
        {
            Ok(rows) => {
                let row = rows.first();
                (
                    row.and_then(|r| r.get("avg_time"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    row.and_then(|r| r.get("slow"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                )
            }
            Err(e) => {
                debug!("pg_stat_statements unavailable: {}", e);
                (0.0, 0)
            }
        };

        let blocked_queries = self
            .pool
            .execute(
                "SELECT count(*) AS blocked FROM pg_stat_activity \
                 WHERE wait_event_type = 'Lock'",
                &[],
            )
            .await
            .map_err(|e| MonitorError::CollectionFailed {
                metric_source: "pg_stat_activity".to_string(),
                reason: e.to_string(),
            })?
            .first()
            .and_then(|row| row.get("blocked"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let buffer_cache_hit_ratio = self
            .pool
            .execute(
                "SELECT COALESCE(sum(blks_hit)::float8 / \
                 NULLIF(sum(blks_hit + blks_read), 0)::float8, 0) AS ratio \
                 FROM pg_stat_database WHERE datname = current_database()",
                &[],
            )
            .await
            .map_err(|e| MonitorError::CollectionFailed {
                metric_source: "pg_stat_database".to_string(),
                reason: e.to_string(),
            })?
            .first()
            .and_then(|row| row.get("ratio"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        Ok(QueryMetrics {
            avg_query_time_ms,
            slow_queries,
            blocked_queries,
            buffer_cache_hit_ratio,
        })
    }

    async fn collect_storage(&self) -> Result<StorageMetrics, MonitorError> {
        let database_size_bytes = self
            .pool
            .execute(
                "SELECT pg_database_size(current_database()) AS size_bytes",
                &[],
            )
            .await
            .map_err(|e| MonitorError::CollectionFailed {
                metric_source: "pg_database_size".to_string(),
                reason: e.to_string(),
            })?
            .first()
            .and_then(|row| row.get("size_bytes"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let index_hit_ratio = self
            .pool
            .execute(
                "SELECT COALESCE(sum(idx_blks_hit)::float8 / \
                 NULLIF(sum(idx_blks_hit + idx_blks_read), 0)::float8, 0) AS ratio \
                 FROM pg_statio_user_indexes",
                &[],
            )
            .await
            .map_err(|e| MonitorError::CollectionFailed {
                metric_source: "pg_statio_user_indexes".to_string(),
                reason: e.to_string(),
            })?
            .first()
            .and_then(|row| row.get("ratio"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        Ok(StorageMetrics {
            database_size_bytes,
            index_hit_ratio,
        })
    }

    async fn collect_system(&self) -> Result<SystemMetrics, MonitorError> {
        let rows = self
            .pool
            .execute(
                "SELECT (SELECT count(*) FROM pg_stat_activity) AS backends, \
                 (SELECT COALESCE(sum(deadlocks), 0) FROM pg_stat_database) AS deadlocks, \
                 EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))::float8 AS uptime",
                &[],
            )
            .await
            .map_err(|e| MonitorError::CollectionFailed {
                metric_source: "pg_stat_activity".to_string(),
                reason: e.to_string(),
            })?;

        let row = rows.first();
        Ok(SystemMetrics {
            active_backends: row
                .and_then(|r| r.get("backends"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            deadlocks: row
                .and_then(|r| r.get("deadlocks"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            uptime_seconds: row
                .and_then(|r| r.get("uptime"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as u64,
        })
    }

    async fn collect_cache(&self) -> CacheTierMetrics {
        let stats = self.cache.get_stats().await;
        CacheTierMetrics {
            hit_rate: stats.hit_rate,
            lookups: stats.hits + stats.misses,
            entries: stats.local_entries,
            average_response_ms: stats.average_response_ms,
        }
    }
}
