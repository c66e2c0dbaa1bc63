//! Threshold evaluation with time-bucketed deduplication and
//! acknowledgement.

use super::{Alert, AlertCategory, AlertSeverity, MetricsSnapshot};
use crate::config::AlertThresholds;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

/// Alerts are retained for this trailing window.
const RETENTION_HOURS: i64 = 24;

/// Holds the rolling alert list; samples are fully assembled into a
/// snapshot before evaluation runs against it.
#[derive(Debug, Default)]
pub struct AlertEngine {
    alerts: Vec<Alert>,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate static thresholds against one snapshot, raising
    /// deduplicated alerts. Returns the alerts newly raised this call.
    pub fn evaluate(
        &mut self,
        snapshot: &MetricsSnapshot,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut raised = Vec::new();

        let query_time = snapshot.queries.avg_query_time_ms;
        if query_time >= thresholds.query_time_critical_ms {
            self.raise(
                &mut raised,
                "slow_queries",
                "avg_query_time_ms",
                AlertSeverity::Critical,
                AlertCategory::QueryPerformance,
                format!(
                    "Average query time {query_time:.1}ms exceeds critical threshold {:.0}ms",
                    thresholds.query_time_critical_ms
                ),
                query_time,
                thresholds.query_time_critical_ms,
                now,
            );
        } else if query_time >= thresholds.query_time_warning_ms {
            self.raise(
                &mut raised,
                "slow_queries",
                "avg_query_time_ms",
                AlertSeverity::Warning,
                AlertCategory::QueryPerformance,
                format!(
                    "Average query time {query_time:.1}ms exceeds warning threshold {:.0}ms",
                    thresholds.query_time_warning_ms
                ),
                query_time,
                thresholds.query_time_warning_ms,
                now,
            );
        }

        let utilization = snapshot.connections.utilization_percent;
        if utilization >= thresholds.utilization_critical_percent {
            self.raise(
                &mut raised,
                "pool_saturation",
                "pool_utilization_percent",
                AlertSeverity::Critical,
                AlertCategory::Connections,
                format!(
                    "Pool utilization {utilization:.1}% exceeds critical threshold {:.0}%",
                    thresholds.utilization_critical_percent
                ),
                utilization,
                thresholds.utilization_critical_percent,
                now,
            );
        } else if utilization >= thresholds.utilization_warning_percent {
            self.raise(
                &mut raised,
                "pool_saturation",
                "pool_utilization_percent",
                AlertSeverity::Warning,
                AlertCategory::Connections,
                format!(
                    "Pool utilization {utilization:.1}% exceeds warning threshold {:.0}%",
                    thresholds.utilization_warning_percent
                ),
                utilization,
                thresholds.utilization_warning_percent,
                now,
            );
        }

        // Inverse threshold: a low hit rate alerts, but only once the
        // cache has seen traffic.
        let cache = &snapshot.cache;
        if cache.lookups > 0 && cache.hit_rate < thresholds.cache_hit_ratio_floor {
            self.raise(
                &mut raised,
                "cache_effectiveness",
                "cache_hit_rate",
                AlertSeverity::Warning,
                AlertCategory::Cache,
                format!(
                    "Cache hit rate {:.2} below floor {:.2}",
                    cache.hit_rate, thresholds.cache_hit_ratio_floor
                ),
                cache.hit_rate,
                thresholds.cache_hit_ratio_floor,
                now,
            );
        }

        let blocked = snapshot.queries.blocked_queries;
        if blocked >= thresholds.blocked_query_count {
            self.raise(
                &mut raised,
                "blocked_queries",
                "blocked_queries",
                AlertSeverity::Critical,
                AlertCategory::QueryPerformance,
                format!(
                    "{blocked} queries blocked on locks (threshold {})",
                    thresholds.blocked_query_count
                ),
                blocked as f64,
                thresholds.blocked_query_count as f64,
                now,
            );
        }

        self.prune(now);
        raised
    }

    #[allow(clippy::too_many_arguments)]
    fn raise(
        &mut self,
        raised: &mut Vec<Alert>,
        alert_type: &str,
        metric: &str,
        severity: AlertSeverity,
        category: AlertCategory,
        message: String,
        value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) {
        let id = alert_id(alert_type, metric, now);
        if self.alerts.iter().any(|alert| alert.id == id) {
            return;
        }

        let alert = Alert {
            id,
            severity,
            category,
            message,
            metric: metric.to_string(),
            value,
            threshold,
            timestamp: now,
            acknowledged: false,
        };
        match alert.severity {
            AlertSeverity::Critical => error!("ALERT: {}", alert.message),
            _ => warn!("ALERT: {}", alert.message),
        }
        raised.push(alert.clone());
        self.alerts.push(alert);
    }

    /// Unacknowledged alerts inside the retention window.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        self.alerts
            .iter()
            .filter(|alert| !alert.acknowledged && alert.timestamp > cutoff)
            .cloned()
            .collect()
    }

    /// Mark an alert inactive without deleting its history.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.alerts.iter_mut().find(|alert| alert.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        self.alerts.retain(|alert| alert.timestamp > cutoff);
    }
}

/// Id derived from type, metric, and a one-hour bucket.
fn alert_id(alert_type: &str, metric: &str, now: DateTime<Utc>) -> String {
    format!("{alert_type}_{metric}_{}", now.format("%Y%m%d%H"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{CacheTierMetrics, ConnectionMetrics, QueryMetrics};

    fn snapshot_with_utilization(utilization: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: ConnectionMetrics {
                utilization_percent: utilization,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_utilization_breach_raises_once_per_bucket() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let now = Utc::now();

        for utilization in [45.0, 95.0, 40.0] {
            engine.evaluate(&snapshot_with_utilization(utilization), &thresholds, now);
        }

        let active = engine.active(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metric, "pool_utilization_percent");
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert_eq!(active[0].value, 95.0);
    }

    #[test]
    fn test_repeated_breaches_deduplicate_in_bucket() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let now = Utc::now();

        engine.evaluate(&snapshot_with_utilization(92.0), &thresholds, now);
        engine.evaluate(&snapshot_with_utilization(96.0), &thresholds, now);
        assert_eq!(engine.active(now).len(), 1);

        // The next hour bucket raises a fresh alert.
        let later = now + Duration::hours(1);
        engine.evaluate(&snapshot_with_utilization(96.0), &thresholds, later);
        assert_eq!(engine.active(later).len(), 2);
    }

    #[test]
    fn test_acknowledge_removes_from_active_keeps_history() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let now = Utc::now();

        engine.evaluate(&snapshot_with_utilization(95.0), &thresholds, now);
        let id = engine.active(now)[0].id.clone();

        assert!(engine.acknowledge(&id));
        assert!(engine.active(now).is_empty());
        assert_eq!(engine.all().len(), 1);
        assert!(!engine.acknowledge("missing"));
    }

    #[test]
    fn test_cache_alert_requires_traffic() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let now = Utc::now();

        let quiet = MetricsSnapshot {
            cache: CacheTierMetrics {
                hit_rate: 0.1,
                lookups: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        engine.evaluate(&quiet, &thresholds, now);
        assert!(engine.active(now).is_empty());

        let busy = MetricsSnapshot {
            cache: CacheTierMetrics {
                hit_rate: 0.1,
                lookups: 500,
                ..Default::default()
            },
            ..Default::default()
        };
        engine.evaluate(&busy, &thresholds, now);
        assert_eq!(engine.active(now).len(), 1);
    }

    #[test]
    fn test_query_time_tiers() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let now = Utc::now();

        let snapshot = MetricsSnapshot {
            queries: QueryMetrics {
                avg_query_time_ms: 600.0,
                ..Default::default()
            },
            ..Default::default()
        };
        engine.evaluate(&snapshot, &thresholds, now);
        let active = engine.active(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_old_alerts_pruned() {
        let mut engine = AlertEngine::new();
        let thresholds = AlertThresholds::default();
        let old = Utc::now() - Duration::hours(30);

        engine.evaluate(&snapshot_with_utilization(95.0), &thresholds, old);
        assert_eq!(engine.all().len(), 1);

        engine.evaluate(&snapshot_with_utilization(10.0), &thresholds, Utc::now());
        assert!(engine.all().is_empty());
    }
}
