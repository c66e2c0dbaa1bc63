//! Trend classification via least-squares linear regression over each
//! window's samples.

use super::{MetricSample, TrendDirection, TrendSummary, TrendWindow};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Projected change under 5% of the window mean classifies as stable.
const STABLE_FRACTION: f64 = 0.05;

/// Metrics where a falling value is an improvement; their slope sign is
/// inverted before classification.
const LOWER_IS_BETTER: &[&str] = &[
    "avg_query_time_ms",
    "slow_queries",
    "blocked_queries",
    "pool_waiting_requests",
    "cache_avg_response_ms",
    "deadlocks",
];

pub fn is_lower_better(metric: &str) -> bool {
    LOWER_IS_BETTER.contains(&metric)
}

/// Least-squares slope in value units per hour. None with fewer than two
/// points or no time spread.
pub fn linear_slope_per_hour(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }
    // x is in hours already.
    Some((n * sum_xy - sum_x * sum_y) / denominator)
}

/// Single-step classification of one sample against its predecessor.
pub fn classify_step(previous: f64, current: f64, lower_is_better: bool) -> TrendDirection {
    let change = current - previous;
    let scale = previous.abs().max(f64::EPSILON);
    if (change / scale).abs() < STABLE_FRACTION {
        return TrendDirection::Stable;
    }
    let effective = if lower_is_better { -change } else { change };
    if effective > 0.0 {
        TrendDirection::Improving
    } else {
        TrendDirection::Degrading
    }
}

pub fn classify(
    slope_per_hour: f64,
    mean: f64,
    window: TrendWindow,
    lower_is_better: bool,
) -> TrendDirection {
    let projected_change = slope_per_hour * window.hours() as f64;
    let scale = mean.abs().max(f64::EPSILON);
    if (projected_change / scale).abs() < STABLE_FRACTION {
        return TrendDirection::Stable;
    }

    let effective = if lower_is_better {
        -slope_per_hour
    } else {
        slope_per_hour
    };
    if effective > 0.0 {
        TrendDirection::Improving
    } else {
        TrendDirection::Degrading
    }
}

/// Multi-window trend summaries over the rolling history.
pub fn compute_trends(
    history: &HashMap<String, VecDeque<MetricSample>>,
    now: DateTime<Utc>,
) -> Vec<TrendSummary> {
    let mut summaries = Vec::new();

    for (metric, samples) in history {
        for window in TrendWindow::ALL {
            let cutoff = now - Duration::hours(window.hours());
            let points: Vec<(f64, f64)> = samples
                .iter()
                .filter(|sample| sample.timestamp > cutoff)
                .map(|sample| {
                    let hours = (sample.timestamp - cutoff).num_milliseconds() as f64
                        / 3_600_000.0;
                    (hours, sample.value)
                })
                .collect();

            let Some(slope) = linear_slope_per_hour(&points) else {
                continue;
            };
            let mean = points.iter().map(|(_, y)| y).sum::<f64>() / points.len() as f64;
            summaries.push(TrendSummary {
                metric: metric.clone(),
                window,
                slope_per_hour: slope,
                direction: classify(slope, mean, window, is_lower_better(metric)),
                sample_count: points.len(),
            });
        }
    }

    summaries.sort_by(|a, b| a.metric.cmp(&b.metric));
    summaries
}
