//! The monitoring service: periodic sampling, rolling history, alerting,
//! and dashboard assembly with structured, tabular, and text renderers.

use super::alerts::AlertEngine;
use super::collector::MetricsCollector;
use super::{
    health, trends, Alert, AlertCategory, AlertSeverity, EffortTier, HealthSummary, MetricRow,
    MetricSample, MetricsSnapshot, Recommendation, TrendSummary,
};
use crate::config::{AlertThresholds, MonitorSettings};
use crate::error::MonitorError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info};

/// The assembled dashboard: all read-only derived views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceDashboard {
    pub generated_at: DateTime<Utc>,
    pub health: HealthSummary,
    pub snapshot: MetricsSnapshot,
    pub active_alerts: Vec<Alert>,
    pub recommendations: Vec<Recommendation>,
    pub trends: Vec<TrendSummary>,
}

impl PerformanceDashboard {
    /// Flat (metric, value, unit, severity) rows for tabular consumers.
    pub fn as_rows(&self) -> Vec<MetricRow> {
        let thresholds_severity = |breached: bool, critical: bool| {
            if critical {
                AlertSeverity::Critical
            } else if breached {
                AlertSeverity::Warning
            } else {
                AlertSeverity::Info
            }
        };
        let connections = &self.snapshot.connections;
        let queries = &self.snapshot.queries;
        let cache = &self.snapshot.cache;

        vec![
            MetricRow {
                metric: "health_score".to_string(),
                value: self.health.score as f64,
                unit: "score".to_string(),
                severity: thresholds_severity(self.health.score < 90, self.health.score < 70),
            },
            MetricRow {
                metric: "pool_utilization_percent".to_string(),
                value: connections.utilization_percent,
                unit: "%".to_string(),
                severity: thresholds_severity(
                    connections.utilization_percent >= 70.0,
                    connections.utilization_percent >= 90.0,
                ),
            },
            MetricRow {
                metric: "pool_active_connections".to_string(),
                value: connections.active as f64,
                unit: "connections".to_string(),
                severity: AlertSeverity::Info,
            },
            MetricRow {
                metric: "avg_query_time_ms".to_string(),
                value: queries.avg_query_time_ms,
                unit: "ms".to_string(),
                severity: thresholds_severity(
                    queries.avg_query_time_ms >= 100.0,
                    queries.avg_query_time_ms >= 500.0,
                ),
            },
            MetricRow {
                metric: "slow_queries".to_string(),
                value: queries.slow_queries as f64,
                unit: "queries".to_string(),
                severity: thresholds_severity(queries.slow_queries > 0, false),
            },
            MetricRow {
                metric: "blocked_queries".to_string(),
                value: queries.blocked_queries as f64,
                unit: "queries".to_string(),
                severity: thresholds_severity(queries.blocked_queries > 0, false),
            },
            MetricRow {
                metric: "cache_hit_rate".to_string(),
                value: cache.hit_rate,
                unit: "ratio".to_string(),
                severity: thresholds_severity(
                    cache.lookups > 0 && cache.hit_rate < 0.9,
                    false,
                ),
            },
            MetricRow {
                metric: "database_size_bytes".to_string(),
                value: self.snapshot.storage.database_size_bytes as f64,
                unit: "bytes".to_string(),
                severity: AlertSeverity::Info,
            },
        ]
    }

    /// Minimal rendered report for terminals and logs.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Database performance dashboard ({})\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!(
            "Health: {:?} (score {}/100)\n\n",
            self.health.status, self.health.score
        ));

        out.push_str("Metrics:\n");
        for row in self.as_rows() {
            out.push_str(&format!(
                "  {:<28} {:>14.2} {}\n",
                row.metric, row.value, row.unit
            ));
        }

        out.push_str(&format!("\nActive alerts: {}\n", self.active_alerts.len()));
        for alert in &self.active_alerts {
            out.push_str(&format!("  [{:?}] {}\n", alert.severity, alert.message));
        }

        out.push_str(&format!(
            "\nRecommendations: {}\n",
            self.recommendations.len()
        ));
        for rec in &self.recommendations {
            out.push_str(&format!(
                "  - {} (impact {:?}, effort {:?})\n",
                rec.title, rec.impact, rec.effort
            ));
        }
        out
    }
}

/// Owns the cancellable sampling task, the rolling metric history, and the
/// alert engine.
pub struct PerformanceMonitor {
    collector: MetricsCollector,
    settings: MonitorSettings,
    history: RwLock<HashMap<String, VecDeque<MetricSample>>>,
    engine: RwLock<AlertEngine>,
    latest: RwLock<Option<MetricsSnapshot>>,
    running: Arc<AtomicBool>,
    registry: Registry,
    health_score_gauge: Gauge,
    pool_utilization_gauge: Gauge,
    cache_hit_rate_gauge: Gauge,
    avg_query_time_gauge: Gauge,
    tick_counter: Counter,
}

impl PerformanceMonitor {
    pub fn new(
        collector: MetricsCollector,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let registry = Registry::new();
        let health_score_gauge = Gauge::new("dbpulse_health_score", "Composite health score")
            .map_err(|e| MonitorError::Registry(e.to_string()))?;
        let pool_utilization_gauge = Gauge::new(
            "dbpulse_pool_utilization_percent",
            "Connection pool utilization",
        )
        .map_err(|e| MonitorError::Registry(e.to_string()))?;
        let cache_hit_rate_gauge =
            Gauge::new("dbpulse_cache_hit_rate", "Query result cache hit rate")
                .map_err(|e| MonitorError::Registry(e.to_string()))?;
        let avg_query_time_gauge =
            Gauge::new("dbpulse_avg_query_time_ms", "Average query time")
                .map_err(|e| MonitorError::Registry(e.to_string()))?;
        let tick_counter = Counter::new("dbpulse_monitor_ticks_total", "Sampling ticks")
            .map_err(|e| MonitorError::Registry(e.to_string()))?;

        for collectable in [
            Box::new(health_score_gauge.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(pool_utilization_gauge.clone()),
            Box::new(cache_hit_rate_gauge.clone()),
            Box::new(avg_query_time_gauge.clone()),
            Box::new(tick_counter.clone()),
        ] {
            registry
                .register(collectable)
                .map_err(|e| MonitorError::Registry(e.to_string()))?;
        }

        Ok(Self {
            collector,
            settings,
            history: RwLock::new(HashMap::new()),
            engine: RwLock::new(AlertEngine::new()),
            latest: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            registry,
            health_score_gauge,
            pool_utilization_gauge,
            cache_hit_rate_gauge,
            avg_query_time_gauge,
            tick_counter,
        })
    }

    /// Start the periodic sampling task.
    pub fn start_monitoring(
        self: Arc<Self>,
        interval_ms: Option<u64>,
    ) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }
        let period = Duration::from_millis(interval_ms.unwrap_or(self.settings.interval_ms));
        info!("Starting performance monitor with {:?} interval", period);

        let monitor = self;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !monitor.running.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot = monitor.collector.collect().await;
                monitor.record_snapshot(snapshot).await;
            }
            info!("Performance monitor stopped");
        });
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fold one snapshot into history, then derive alerts. Samples are
    /// fully appended before alert evaluation reads the snapshot.
    pub async fn record_snapshot(&self, snapshot: MetricsSnapshot) {
        let samples = samples_from(&snapshot, &self.settings.thresholds);
        {
            let mut history = self.history.write().await;
            let cutoff =
                snapshot.timestamp - ChronoDuration::hours(self.settings.history_hours as i64);
            for mut sample in samples {
                let series = history.entry(sample.metric.clone()).or_default();
                if let Some(previous) = series.back() {
                    sample.trend = Some(trends::classify_step(
                        previous.value,
                        sample.value,
                        trends::is_lower_better(&sample.metric),
                    ));
                }
                series.push_back(sample);
                while series
                    .front()
                    .map(|s| s.timestamp <= cutoff)
                    .unwrap_or(false)
                {
                    series.pop_front();
                }
            }
        }

        self.tick_counter.inc();
        self.pool_utilization_gauge
            .set(snapshot.connections.utilization_percent);
        self.cache_hit_rate_gauge.set(snapshot.cache.hit_rate);
        self.avg_query_time_gauge
            .set(snapshot.queries.avg_query_time_ms);

        *self.latest.write().await = Some(snapshot.clone());

        let mut engine = self.engine.write().await;
        let raised = engine.evaluate(&snapshot, &self.settings.thresholds, snapshot.timestamp);
        if !raised.is_empty() {
            debug!("Raised {} alerts this tick", raised.len());
        }

        let score = health::health_score(
            &snapshot,
            &self.settings.thresholds,
            &engine.active(snapshot.timestamp),
        );
        self.health_score_gauge.set(score as f64);
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.engine.read().await.active(Utc::now())
    }

    pub async fn acknowledge_alert(&self, id: &str) -> bool {
        self.engine.write().await.acknowledge(id)
    }

    /// Assemble the full dashboard from the latest snapshot (collecting a
    /// fresh one when the monitor has not ticked yet).
    pub async fn get_dashboard(&self) -> PerformanceDashboard {
        let now = Utc::now();
        let snapshot = match self.latest.read().await.clone() {
            Some(snapshot) => snapshot,
            None => self.collector.collect().await,
        };
        let active_alerts = self.engine.read().await.active(now);
        let score = health::health_score(&snapshot, &self.settings.thresholds, &active_alerts);
        let trends = trends::compute_trends(&*self.history.read().await, now);
        let recommendations =
            generate_recommendations(&snapshot, &self.settings.thresholds, &active_alerts);

        PerformanceDashboard {
            generated_at: now,
            health: HealthSummary {
                status: health::health_status(&active_alerts),
                score,
            },
            snapshot,
            active_alerts,
            recommendations,
            trends,
        }
    }

    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub async fn history_depth(&self, metric: &str) -> usize {
        self.history
            .read()
            .await
            .get(metric)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Break a snapshot into individually classified samples.
fn samples_from(snapshot: &MetricsSnapshot, thresholds: &AlertThresholds) -> Vec<MetricSample> {
    let at = snapshot.timestamp;
    let tiered = |value: f64, warning: f64, critical: f64| {
        if value >= critical {
            AlertSeverity::Critical
        } else if value >= warning {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Info
        }
    };
    let sample = |metric: &str, value: f64, unit: &str, severity: AlertSeverity| MetricSample {
        metric: metric.to_string(),
        value,
        unit: unit.to_string(),
        timestamp: at,
        severity,
        trend: None,
    };

    vec![
        sample(
            "pool_utilization_percent",
            snapshot.connections.utilization_percent,
            "%",
            tiered(
                snapshot.connections.utilization_percent,
                thresholds.utilization_warning_percent,
                thresholds.utilization_critical_percent,
            ),
        ),
        sample(
            "pool_active_connections",
            snapshot.connections.active as f64,
            "connections",
            AlertSeverity::Info,
        ),
        sample(
            "pool_waiting_requests",
            snapshot.connections.waiting as f64,
            "requests",
            AlertSeverity::Info,
        ),
        sample(
            "avg_query_time_ms",
            snapshot.queries.avg_query_time_ms,
            "ms",
            tiered(
                snapshot.queries.avg_query_time_ms,
                thresholds.query_time_warning_ms,
                thresholds.query_time_critical_ms,
            ),
        ),
        sample(
            "slow_queries",
            snapshot.queries.slow_queries as f64,
            "queries",
            AlertSeverity::Info,
        ),
        sample(
            "blocked_queries",
            snapshot.queries.blocked_queries as f64,
            "queries",
            tiered(
                snapshot.queries.blocked_queries as f64,
                thresholds.blocked_query_count as f64,
                (thresholds.blocked_query_count * 2) as f64,
            ),
        ),
        sample(
            "db_buffer_hit_ratio",
            snapshot.queries.buffer_cache_hit_ratio,
            "ratio",
            AlertSeverity::Info,
        ),
        sample(
            "cache_hit_rate",
            snapshot.cache.hit_rate,
            "ratio",
            if snapshot.cache.lookups > 0
                && snapshot.cache.hit_rate < thresholds.cache_hit_ratio_floor
            {
                AlertSeverity::Warning
            } else {
                AlertSeverity::Info
            },
        ),
        sample(
            "cache_avg_response_ms",
            snapshot.cache.average_response_ms,
            "ms",
            AlertSeverity::Info,
        ),
        sample(
            "database_size_bytes",
            snapshot.storage.database_size_bytes as f64,
            "bytes",
            AlertSeverity::Info,
        ),
        sample(
            "index_hit_ratio",
            snapshot.storage.index_hit_ratio,
            "ratio",
            AlertSeverity::Info,
        ),
        sample(
            "active_backends",
            snapshot.system.active_backends as f64,
            "backends",
            AlertSeverity::Info,
        ),
        sample(
            "deadlocks",
            snapshot.system.deadlocks as f64,
            "deadlocks",
            AlertSeverity::Info,
        ),
    ]
}

/// Fresh dashboard-level recommendations from current metrics; never
/// persisted.
fn generate_recommendations(
    snapshot: &MetricsSnapshot,
    thresholds: &AlertThresholds,
    active_alerts: &[Alert],
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    let cache = &snapshot.cache;
    if cache.lookups > 0 && cache.hit_rate < thresholds.cache_hit_ratio_floor {
        recommendations.push(Recommendation {
            category: AlertCategory::Cache,
            title: "Raise the cache hit rate".to_string(),
            description: format!(
                "Hit rate {:.2} is below the {:.2} floor; most lookups fall through to the database",
                cache.hit_rate, thresholds.cache_hit_ratio_floor
            ),
            impact: EffortTier::High,
            effort: EffortTier::Low,
            estimated_improvement: "Each recovered hit saves a round trip".to_string(),
            implementation_steps: vec![
                "Extend the TTL for stable result sets".to_string(),
                "Add the hottest queries to the warm-up list".to_string(),
                "Review tag invalidation for over-broad tags".to_string(),
            ],
        });
    }

    let utilization = snapshot.connections.utilization_percent;
    if utilization >= thresholds.utilization_warning_percent {
        recommendations.push(Recommendation {
            category: AlertCategory::Connections,
            title: "Scale the connection pool".to_string(),
            description: format!("Pool utilization is at {utilization:.1}%"),
            impact: EffortTier::High,
            effort: EffortTier::Low,
            estimated_improvement: "Headroom removes lease waits under burst load".to_string(),
            implementation_steps: vec![
                "Apply the pool sizing recommendation".to_string(),
                "Re-check utilization after the next sampling window".to_string(),
            ],
        });
    }

    if snapshot.queries.avg_query_time_ms >= thresholds.query_time_warning_ms
        || snapshot.queries.slow_queries > 0
    {
        recommendations.push(Recommendation {
            category: AlertCategory::QueryPerformance,
            title: "Analyze slow queries".to_string(),
            description: format!(
                "Average query time {:.1}ms with {} slow statements",
                snapshot.queries.avg_query_time_ms, snapshot.queries.slow_queries
            ),
            impact: EffortTier::High,
            effort: EffortTier::Medium,
            estimated_improvement: "Plan analysis surfaces missing indexes and rewrites"
                .to_string(),
            implementation_steps: vec![
                "Run plan analysis on the slowest statements".to_string(),
                "Apply the resulting index recommendations".to_string(),
            ],
        });
    }

    const PARTITION_SIZE_FLOOR: u64 = 10 * 1024 * 1024 * 1024;
    if snapshot.storage.database_size_bytes > PARTITION_SIZE_FLOOR {
        recommendations.push(Recommendation {
            category: AlertCategory::Storage,
            title: "Partition large append-heavy tables".to_string(),
            description: "Database size suggests time-ordered tables would benefit from monthly partitions".to_string(),
            impact: EffortTier::Medium,
            effort: EffortTier::High,
            estimated_improvement: "Partition pruning bounds scans to touched months".to_string(),
            implementation_steps: vec![
                "Identify the largest time-ordered tables".to_string(),
                "Bootstrap monthly partitions and migrate in batches".to_string(),
            ],
        });
    }

    if active_alerts
        .iter()
        .any(|alert| alert.metric == "blocked_queries")
    {
        recommendations.push(Recommendation {
            category: AlertCategory::QueryPerformance,
            title: "Investigate lock contention".to_string(),
            description: "Queries are blocking on locks".to_string(),
            impact: EffortTier::Medium,
            effort: EffortTier::Medium,
            estimated_improvement: "Shorter lock waits reduce tail latency".to_string(),
            implementation_steps: vec![
                "Inspect the blocking session tree".to_string(),
                "Shorten or split long-running transactions".to_string(),
            ],
        });
    }

    recommendations
}
