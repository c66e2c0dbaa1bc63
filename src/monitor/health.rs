//! Health status and composite score derivation from alerts and metrics.

use super::{Alert, AlertSeverity, HealthStatus, MetricsSnapshot};
use crate::config::AlertThresholds;

/// Overall status from the active alert list: critical on any critical
/// alert or more than two high-severity alerts; degraded on any
/// high-severity alert or more than five total.
pub fn health_status(active_alerts: &[Alert]) -> HealthStatus {
    let critical = active_alerts
        .iter()
        .filter(|alert| alert.severity == AlertSeverity::Critical)
        .count();
    let high = active_alerts
        .iter()
        .filter(|alert| alert.severity == AlertSeverity::Warning)
        .count();

    if critical > 0 || high > 2 {
        HealthStatus::Critical
    } else if high > 0 || active_alerts.len() > 5 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// 0-100 composite: starts at 100, penalized per poor metric and active
/// alert, bonused for excellent metrics, clamped.
pub fn health_score(
    snapshot: &MetricsSnapshot,
    thresholds: &AlertThresholds,
    active_alerts: &[Alert],
) -> u32 {
    let mut score: i64 = 100;

    let alert_penalty: i64 = active_alerts
        .iter()
        .map(|alert| match alert.severity {
            AlertSeverity::Critical => 10,
            AlertSeverity::Warning => 5,
            AlertSeverity::Info => 1,
        })
        .sum();
    score -= alert_penalty.min(30);

    let query_time = snapshot.queries.avg_query_time_ms;
    if query_time >= thresholds.query_time_critical_ms {
        score -= 30;
    } else if query_time >= thresholds.query_time_warning_ms {
        score -= 15;
    } else if query_time > 0.0 && query_time < thresholds.query_time_warning_ms / 2.0 {
        score += 5;
    }

    let cache = &snapshot.cache;
    if cache.lookups > 0 {
        if cache.hit_rate < thresholds.cache_hit_ratio_floor {
            score -= 15;
        } else if cache.hit_rate >= 0.95 {
            score += 5;
        }
    }

    let utilization = snapshot.connections.utilization_percent;
    if utilization >= thresholds.utilization_critical_percent {
        score -= 20;
    } else if utilization >= thresholds.utilization_warning_percent {
        score -= 10;
    }

    if snapshot.queries.slow_queries > 0 {
        score -= (snapshot.queries.slow_queries as i64).min(10);
    }
    if snapshot.queries.blocked_queries >= thresholds.blocked_query_count {
        score -= 15;
    }

    score.clamp(0, 100) as u32
}
