//! Continuous performance monitoring: metric collection, rolling history,
//! threshold alerting, trend regression, and dashboard assembly.

pub mod alerts;
pub mod collector;
pub mod dashboard;
pub mod health;
pub mod trends;

pub use alerts::AlertEngine;
pub use collector::MetricsCollector;
pub use dashboard::{PerformanceDashboard, PerformanceMonitor};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Connections,
    QueryPerformance,
    Cache,
    Storage,
    System,
}

/// A threshold breach. The id is derived from (type, metric, coarse time
/// bucket) so repeated breaches in one window deduplicate instead of
/// flooding the active list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    /// Acknowledged alerts leave the active list but keep their history.
    pub acknowledged: bool,
}

/// One reading appended to a metric's rolling 24h history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    /// Step classification against the previous sample; None for the
    /// first reading of a series.
    pub trend: Option<TrendDirection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendWindow {
    LastHour,
    LastDay,
    LastWeek,
    LastMonth,
}

impl TrendWindow {
    pub const ALL: [TrendWindow; 4] = [
        TrendWindow::LastHour,
        TrendWindow::LastDay,
        TrendWindow::LastWeek,
        TrendWindow::LastMonth,
    ];

    pub fn hours(self) -> i64 {
        match self {
            TrendWindow::LastHour => 1,
            TrendWindow::LastDay => 24,
            TrendWindow::LastWeek => 24 * 7,
            TrendWindow::LastMonth => 24 * 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSummary {
    pub metric: String,
    pub window: TrendWindow,
    pub slope_per_hour: f64,
    pub direction: TrendDirection,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    /// 0-100 composite from live metrics
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortTier {
    Low,
    Medium,
    High,
}

/// Dashboard-level recommendation, recomputed fresh from current metrics
/// on every dashboard request; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: AlertCategory,
    pub title: String,
    pub description: String,
    pub impact: EffortTier,
    pub effort: EffortTier,
    pub estimated_improvement: String,
    pub implementation_steps: Vec<String>,
}

/// Connection-level metric group, mirrored from the pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionMetrics {
    pub active: u32,
    pub idle: u32,
    pub total: u32,
    pub max: u32,
    pub waiting: u64,
    pub utilization_percent: f64,
    pub average_wait_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryMetrics {
    pub avg_query_time_ms: f64,
    pub slow_queries: u64,
    pub blocked_queries: u64,
    pub buffer_cache_hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageMetrics {
    pub database_size_bytes: u64,
    pub index_hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheTierMetrics {
    pub hit_rate: f64,
    pub lookups: u64,
    pub entries: usize,
    pub average_response_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemMetrics {
    pub active_backends: u64,
    pub deadlocks: u64,
    pub uptime_seconds: u64,
}

/// One fully assembled sampling tick. A failed source leaves its group at
/// the zeroed default while the rest of the snapshot stays populated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connections: ConnectionMetrics,
    pub queries: QueryMetrics,
    pub storage: StorageMetrics,
    pub cache: CacheTierMetrics,
    pub system: SystemMetrics,
}

/// Flat tabular dashboard row for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub severity: AlertSeverity,
}
