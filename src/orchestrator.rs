//! Bootstrap sequencing and the auto-optimization loop.
//!
//! Bootstrap phases run independently: a phase's failure is captured as a
//! per-phase result and never halts the phases after it. The optimization
//! loop reacts to monitor output with per-category remediations, each
//! attempted and logged on its own.

use crate::advisor::IndexAdvisor;
use crate::analyzer::QueryPlanAnalyzer;
use crate::cache::{QueryResultCache, WarmCacheEntry};
use crate::config::PerformanceConfig;
use crate::database::{ConnectionFactory, PgConnectionFactory};
use crate::error::PerformanceError;
use crate::monitor::{
    AlertCategory, HealthStatus, MetricsCollector, PerformanceMonitor,
};
use crate::partition::PartitionManager;
use crate::pool::ConnectionPoolManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub detail: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub phases: Vec<PhaseResult>,
}

impl BootstrapReport {
    pub fn succeeded(&self) -> bool {
        self.phases
            .iter()
            .all(|phase| phase.status == PhaseStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action: String,
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationPassReport {
    pub triggered: bool,
    pub health_score: u32,
    pub actions: Vec<RemediationAction>,
}

/// Composes the performance components and owns their shared lifecycle.
pub struct PerformanceOrchestrator {
    config: PerformanceConfig,
    pool: Arc<ConnectionPoolManager>,
    cache: Arc<QueryResultCache>,
    advisor: IndexAdvisor,
    analyzer: QueryPlanAnalyzer,
    partitions: PartitionManager,
    monitor: Arc<PerformanceMonitor>,
    optimizing: Arc<AtomicBool>,
}

impl PerformanceOrchestrator {
    pub fn new(config: PerformanceConfig) -> Result<Self, PerformanceError> {
        let factory: Arc<dyn ConnectionFactory> = Arc::new(PgConnectionFactory::new(
            config.database_url.clone(),
            config.pool.statement_timeout_ms,
        ));
        Self::with_factory(config, factory)
    }

    /// Wire the components around an injected connection factory.
    pub fn with_factory(
        config: PerformanceConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, PerformanceError> {
        let pool = Arc::new(ConnectionPoolManager::new(factory));
        let cache = Arc::new(QueryResultCache::new(
            Arc::clone(&pool),
            config.cache.clone(),
        ));
        let advisor = IndexAdvisor::new(Arc::clone(&pool));
        let analyzer = QueryPlanAnalyzer::new(Arc::clone(&pool));
        let partitions = PartitionManager::new(Arc::clone(&pool), config.partition.clone());
        let collector = MetricsCollector::new(
            Arc::clone(&pool),
            Arc::clone(&cache),
            config.monitor.thresholds.clone(),
        );
        let monitor = Arc::new(PerformanceMonitor::new(collector, config.monitor.clone())?);

        Ok(Self {
            config,
            pool,
            cache,
            advisor,
            analyzer,
            partitions,
            monitor,
            optimizing: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        &self.cache
    }

    pub fn advisor(&self) -> &IndexAdvisor {
        &self.advisor
    }

    pub fn analyzer(&self) -> &QueryPlanAnalyzer {
        &self.analyzer
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// One-time bootstrap. The pool comes up first since every later
    /// phase reaches the database through it; all phases are non-aborting.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Starting performance layer bootstrap");

        let mut phases = Vec::with_capacity(7);

        phases.push(
            self.run_phase("pool_initialization", async {
                self.pool.initialize(self.config.pool.clone()).await?;
                Ok("pool initialized".to_string())
            })
            .await,
        );

        phases.push(
            self.run_phase("index_analysis", async {
                let report = self.advisor.analyze_usage().await?;
                Ok(format!(
                    "{} unused, {} redundant indexes",
                    report.unused_indexes.len(),
                    report.redundant_indexes.len()
                ))
            })
            .await,
        );

        phases.push(
            self.run_phase("partition_maintenance", async {
                let mut ensured = 0;
                for table in &self.config.partition.tables {
                    let outcomes = self
                        .partitions
                        .ensure_future_partitions(
                            &table.table,
                            self.config.partition.premake_months,
                        )
                        .await?;
                    ensured += outcomes.iter().filter(|o| o.created).count();
                }
                Ok(format!("{ensured} partitions created"))
            })
            .await,
        );

        phases.push(
            self.run_phase("cache_setup", async {
                self.cache.ensure_schema().await?;
                Arc::clone(&self.cache).start_sweeper();
                Ok("cache schema ensured, sweeper started".to_string())
            })
            .await,
        );

        phases.push(
            self.run_phase("statistics_refresh", async {
                self.pool.execute_update("ANALYZE", &[]).await?;
                Ok("statistics refreshed".to_string())
            })
            .await,
        );

        phases.push(
            self.run_phase("monitor_start", async {
                Arc::clone(&self.monitor).start_monitoring(None)?;
                Ok("monitor started".to_string())
            })
            .await,
        );

        phases.push(
            self.run_phase("cache_warmup", async {
                let report = self.warm_configured_queries().await;
                Ok(format!(
                    "{} warmed, {} failed",
                    report.0, report.1
                ))
            })
            .await,
        );

        let report = BootstrapReport {
            started_at,
            total_duration_ms: start.elapsed().as_millis() as u64,
            phases,
        };
        info!(
            "Bootstrap finished in {}ms ({}/{} phases succeeded)",
            report.total_duration_ms,
            report
                .phases
                .iter()
                .filter(|p| p.status == PhaseStatus::Succeeded)
                .count(),
            report.phases.len()
        );
        report
    }

    async fn run_phase<F>(&self, name: &str, phase: F) -> PhaseResult
    where
        F: Future<Output = Result<String, PerformanceError>>,
    {
        let start = Instant::now();
        match phase.await {
            Ok(detail) => {
                info!("Bootstrap phase {} succeeded: {}", name, detail);
                PhaseResult {
                    name: name.to_string(),
                    status: PhaseStatus::Succeeded,
                    duration_ms: start.elapsed().as_millis() as u64,
                    detail,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Bootstrap phase {} failed: {}", name, e);
                PhaseResult {
                    name: name.to_string(),
                    status: PhaseStatus::Failed,
                    duration_ms: start.elapsed().as_millis() as u64,
                    detail: String::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn warm_configured_queries(&self) -> (usize, usize) {
        let entries: Vec<WarmCacheEntry> = self
            .config
            .auto_optimize
            .warmup_queries
            .iter()
            .map(|query| WarmCacheEntry {
                query: query.clone(),
                params: Vec::new(),
                options: Default::default(),
            })
            .collect();
        if entries.is_empty() {
            return (0, 0);
        }
        let report = self.cache.warm_cache(&entries).await;
        (report.succeeded, report.failed.len())
    }

    /// Start the periodic auto-optimization loop.
    pub fn start_auto_optimization(self: Arc<Self>) {
        if !self.config.auto_optimize.enabled {
            info!("Auto-optimization disabled by configuration");
            return;
        }
        if self.optimizing.swap(true, Ordering::SeqCst) {
            return;
        }
        let period = Duration::from_secs(self.config.auto_optimize.interval_secs);
        info!("Starting auto-optimization loop with {:?} interval", period);

        let orchestrator = self;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            while orchestrator.optimizing.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !orchestrator.optimizing.load(Ordering::SeqCst) {
                    break;
                }
                let report = orchestrator.optimize_once().await;
                if report.triggered {
                    info!(
                        "Auto-optimization pass ran {} actions (score {})",
                        report.actions.len(),
                        report.health_score
                    );
                }
            }
            info!("Auto-optimization loop stopped");
        });
    }

    pub fn stop_auto_optimization(&self) {
        self.optimizing.store(false, Ordering::SeqCst);
    }

    /// One optimization pass: remediate per alert category, then apply the
    /// safe subset of dashboard recommendations. Every action is attempted
    /// independently; nothing here is transactional as a whole.
    pub async fn optimize_once(&self) -> OptimizationPassReport {
        let dashboard = self.monitor.get_dashboard().await;
        let healthy = dashboard.health.status != HealthStatus::Critical
            && dashboard.health.score >= self.config.auto_optimize.min_health_score;
        if healthy {
            debug!(
                "Health score {} above remediation floor; skipping pass",
                dashboard.health.score
            );
            return OptimizationPassReport {
                triggered: false,
                health_score: dashboard.health.score,
                actions: Vec::new(),
            };
        }

        let mut actions = Vec::new();
        let mut categories: Vec<AlertCategory> = dashboard
            .active_alerts
            .iter()
            .map(|alert| alert.category)
            .collect();
        categories.extend(dashboard.recommendations.iter().map(|rec| rec.category));
        categories.dedup_by(|a, b| a == b);

        let mut handled_cache = false;
        let mut handled_pool = false;
        let mut handled_queries = false;
        for category in categories {
            match category {
                AlertCategory::Cache if !handled_cache => {
                    handled_cache = true;
                    actions.push(self.remediate_cache().await);
                }
                AlertCategory::Connections if !handled_pool => {
                    handled_pool = true;
                    actions.push(self.remediate_pool().await);
                }
                AlertCategory::QueryPerformance if !handled_queries => {
                    handled_queries = true;
                    actions.push(self.remediate_queries().await);
                    actions.push(self.drop_unused_indexes().await);
                }
                _ => {}
            }
        }

        for action in &actions {
            if action.succeeded {
                info!("Remediation {}: {}", action.action, action.detail);
            } else {
                warn!("Remediation {} failed: {}", action.action, action.detail);
            }
        }

        OptimizationPassReport {
            triggered: true,
            health_score: dashboard.health.score,
            actions,
        }
    }

    /// Cache remediation: clear both tiers and rewarm the configured
    /// queries.
    async fn remediate_cache(&self) -> RemediationAction {
        self.cache.clear().await;
        let (warmed, failed) = self.warm_configured_queries().await;
        RemediationAction {
            action: "cache_clear_and_rewarm".to_string(),
            succeeded: true,
            detail: format!("cleared; {warmed} warmed, {failed} failed"),
        }
    }

    /// Pool remediation: apply the sizing recommendation when it proposes
    /// a change.
    async fn remediate_pool(&self) -> RemediationAction {
        match self.pool.optimize_pool_configuration().await {
            Ok(recommendation) if recommendation.is_change() => {
                let mut settings = self.config.pool.clone();
                settings.min_connections = recommendation.recommended_min;
                settings.max_connections = recommendation.recommended_max;
                settings.idle_timeout_ms = recommendation.recommended_idle_timeout_ms;
                match self.pool.reconfigure(settings).await {
                    Ok(()) => RemediationAction {
                        action: "pool_reconfiguration".to_string(),
                        succeeded: true,
                        detail: format!(
                            "max {} -> {} ({})",
                            recommendation.current_max,
                            recommendation.recommended_max,
                            recommendation.reason
                        ),
                    },
                    Err(e) => RemediationAction {
                        action: "pool_reconfiguration".to_string(),
                        succeeded: false,
                        detail: e.to_string(),
                    },
                }
            }
            Ok(recommendation) => RemediationAction {
                action: "pool_reconfiguration".to_string(),
                succeeded: true,
                detail: format!("no change needed ({})", recommendation.reason),
            },
            Err(e) => RemediationAction {
                action: "pool_reconfiguration".to_string(),
                succeeded: false,
                detail: e.to_string(),
            },
        }
    }

    /// Query remediation: analyze the currently slowest statements and log
    /// their recommendations.
    async fn remediate_queries(&self) -> RemediationAction {
        let slow = self.fetch_slow_queries(5).await;
        if slow.is_empty() {
            return RemediationAction {
                action: "slow_query_analysis".to_string(),
                succeeded: true,
                detail: "no slow queries visible".to_string(),
            };
        }

        let results = self.analyzer.analyze_batch(&slow).await;
        let analyzed = results.iter().filter(|(_, r)| r.is_ok()).count();
        let recommendations: usize = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|analysis| analysis.recommendations.len())
            .sum();
        RemediationAction {
            action: "slow_query_analysis".to_string(),
            succeeded: true,
            detail: format!(
                "{analyzed}/{} analyzed, {recommendations} recommendations",
                slow.len()
            ),
        }
    }

    async fn drop_unused_indexes(&self) -> RemediationAction {
        match self.advisor.drop_unused_indexes(false).await {
            Ok(outcomes) => RemediationAction {
                action: "unused_index_drop".to_string(),
                succeeded: true,
                detail: format!(
                    "{} dropped of {} candidates",
                    outcomes
                        .iter()
                        .filter(|o| o.action == crate::advisor::DropAction::Dropped)
                        .count(),
                    outcomes.len()
                ),
            },
            Err(e) => RemediationAction {
                action: "unused_index_drop".to_string(),
                succeeded: false,
                detail: e.to_string(),
            },
        }
    }

    /// Top slow statements from pg_stat_statements; absent extension
    /// degrades to an empty list.
    async fn fetch_slow_queries(&self, limit: u32) -> Vec<String> {
        match self
            .pool
            .execute(
                &format!(
                    "SELECT query FROM pg_stat_statements \
                     WHERE mean_exec_time > {} \
                     AND query ILIKE 'select%' \
                     ORDER BY mean_exec_time DESC LIMIT {limit}",
                    self.config.monitor.thresholds.query_time_warning_ms
                ),
                &[],
            )
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.get("query").and_then(Value::as_str).map(str::to_string))
                .collect(),
            Err(e) => {
                debug!("pg_stat_statements unavailable for slow-query fetch: {}", e);
                Vec::new()
            }
        }
    }

    /// Stop background work and drain the pool, in dependency order.
    pub async fn shutdown(&self) {
        info!("Shutting down performance layer");
        self.stop_auto_optimization();
        self.monitor.stop_monitoring();
        self.cache.stop_sweeper();
        self.pool.shutdown().await;
    }
}
