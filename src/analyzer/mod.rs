//! Execution plan analysis: annotated plan retrieval, tree classification,
//! heuristic index suggestion, and advisory query rewrites.

pub mod indexes;
pub mod plan;
pub mod recommend;
pub mod rewrite;

pub use indexes::{IndexKind, IndexRecommendation};
pub use plan::{ParsedPlan, PlanNode};
pub use rewrite::QueryRewrite;

use crate::error::AnalysisError;
use crate::pool::ConnectionPoolManager;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Analyses are cached in-process for this long, keyed by exact query
/// text. Stale-tolerant: only expiry invalidates, never data changes.
const ANALYSIS_CACHE_TTL_SECS: i64 = 3600;

/// EXPLAIN ANALYZE executes the statement, so the request is bounded.
const EXPLAIN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    Index,
    Rewrite,
    Partition,
    Statistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Ephemeral advisory output of one plan classification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub category: RecommendationCategory,
    pub severity: Severity,
    pub description: String,
    pub estimated_improvement: String,
    pub implementation_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query: String,
    pub root: PlanNode,
    pub execution_time_ms: f64,
    pub planning_time_ms: f64,
    pub total_time_ms: f64,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub analyzed_at: DateTime<Utc>,
}

pub struct QueryPlanAnalyzer {
    pool: Arc<ConnectionPoolManager>,
    cache: RwLock<HashMap<String, QueryAnalysis>>,
}

impl QueryPlanAnalyzer {
    pub fn new(pool: Arc<ConnectionPoolManager>) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Request an annotated plan for a read-only statement, parse it into
    /// a tree, and classify it. Results are cached for an hour.
    pub async fn analyze(&self, query: &str) -> Result<QueryAnalysis, AnalysisError> {
        let now = Utc::now();
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(query) {
                if cached.analyzed_at + ChronoDuration::seconds(ANALYSIS_CACHE_TTL_SECS) > now {
                    debug!("Returning cached plan analysis");
                    return Ok(cached.clone());
                }
            }
        }

        ensure_safe_for_explain(query)?;

        let explain_sql = format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {query}");
        let rows = timeout(
            Duration::from_secs(EXPLAIN_TIMEOUT_SECS),
            self.pool.execute(&explain_sql, &[]),
        )
        .await
        .map_err(|_| AnalysisError::Timeout {
            seconds: EXPLAIN_TIMEOUT_SECS,
        })?
        .map_err(|e| AnalysisError::PlanRetrieval(e.to_string()))?;

        let plan_value = rows
            .first()
            .and_then(|row| row.get("QUERY PLAN"))
            .ok_or_else(|| AnalysisError::PlanParse("no QUERY PLAN column".to_string()))?;

        let parsed = plan::parse_explain_output(plan_value)?;
        let recommendations = recommend::generate_recommendations(&parsed.root);

        let analysis = QueryAnalysis {
            query: query.to_string(),
            total_time_ms: parsed.execution_time_ms + parsed.planning_time_ms,
            execution_time_ms: parsed.execution_time_ms,
            planning_time_ms: parsed.planning_time_ms,
            root: parsed.root,
            recommendations,
            analyzed_at: now,
        };

        info!(
            "Analyzed plan for query ({} recommendations, {:.1}ms execution)",
            analysis.recommendations.len(),
            analysis.execution_time_ms
        );

        let mut cache = self.cache.write().await;
        cache.retain(|_, cached| {
            cached.analyzed_at + ChronoDuration::seconds(ANALYSIS_CACHE_TTL_SECS) > now
        });
        cache.insert(query.to_string(), analysis.clone());
        Ok(analysis)
    }

    /// Analyze several queries; one failure never aborts the batch.
    pub async fn analyze_batch(
        &self,
        queries: &[String],
    ) -> Vec<(String, Result<QueryAnalysis, AnalysisError>)> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let result = self.analyze(query).await;
            if let Err(e) = &result {
                warn!("Analysis failed for one query in batch: {}", e);
            }
            results.push((query.clone(), result));
        }
        results
    }

    /// Heuristic missing-index candidates for one query.
    pub async fn suggest_indexes(
        &self,
        query: &str,
    ) -> Result<Vec<IndexRecommendation>, AnalysisError> {
        indexes::suggest_indexes(&self.pool, query).await
    }

    /// Advisory textual rewrite; None when no transform applies.
    pub fn rewrite_query(&self, query: &str) -> Option<QueryRewrite> {
        rewrite::rewrite_query(query)
    }

    pub async fn cached_analysis_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// EXPLAIN ANALYZE executes the statement; anything that mutates is
/// refused outright.
fn ensure_safe_for_explain(query: &str) -> Result<(), AnalysisError> {
    const DANGEROUS: &[&str] = &[
        "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE", "INSERT", "UPDATE",
    ];
    let upper = query.to_uppercase();
    for keyword in DANGEROUS {
        if upper.contains(keyword) {
            return Err(AnalysisError::UnsafeQuery {
                reason: format!("statement contains {keyword}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_guard_rejects_mutations() {
        assert!(ensure_safe_for_explain("DELETE FROM teams").is_err());
        assert!(ensure_safe_for_explain("UPDATE goals SET done = true").is_err());
        assert!(ensure_safe_for_explain("SELECT * FROM teams").is_ok());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_analyzer_is_shareable() {
        assert_send_sync::<QueryPlanAnalyzer>();
    }
}
