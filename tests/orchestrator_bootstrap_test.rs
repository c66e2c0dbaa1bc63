//! Orchestrator laws: non-aborting bootstrap phases and alert-driven
//! remediation.

mod common;

use chrono::Utc;
use common::{FakeDatabase, FakeFactory};
use dbpulse::config::{PerformanceConfig, PoolSettings};
use dbpulse::error::PoolError;
use dbpulse::monitor::{ConnectionMetrics, MetricsSnapshot};
use dbpulse::orchestrator::{PerformanceOrchestrator, PhaseStatus};
use serial_test::serial;
use std::sync::Arc;

fn test_config() -> PerformanceConfig {
    PerformanceConfig {
        pool: PoolSettings {
            min_connections: 0,
            ..PoolSettings::short_lived()
        },
        ..Default::default()
    }
}

fn orchestrator_over(db: &Arc<FakeDatabase>) -> Arc<PerformanceOrchestrator> {
    let factory = Arc::new(FakeFactory {
        db: Arc::clone(db),
    });
    Arc::new(PerformanceOrchestrator::with_factory(test_config(), factory).unwrap())
}

#[tokio::test]
#[serial]
async fn test_bootstrap_runs_all_phases() {
    let db = FakeDatabase::new(|_, _| Ok(vec![]));
    let orchestrator = orchestrator_over(&db);

    let report = orchestrator.bootstrap().await;
    assert_eq!(report.phases.len(), 7);
    assert!(report.succeeded());

    let names: Vec<&str> = report.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "pool_initialization",
            "index_analysis",
            "partition_maintenance",
            "cache_setup",
            "statistics_refresh",
            "monitor_start",
            "cache_warmup",
        ]
    );

    assert!(orchestrator.monitor().is_running());
    orchestrator.shutdown().await;
    assert!(!orchestrator.monitor().is_running());
}

#[tokio::test]
#[serial]
async fn test_phase_failure_does_not_halt_later_phases() {
    // Statistics refresh fails; everything else succeeds.
    let db = FakeDatabase::new(|sql, _| {
        if sql.starts_with("ANALYZE") {
            return Err(PoolError::Query("permission denied".to_string()));
        }
        Ok(vec![])
    });
    let orchestrator = orchestrator_over(&db);

    let report = orchestrator.bootstrap().await;
    assert!(!report.succeeded());

    let failed: Vec<&str> = report
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Failed)
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(failed, vec!["statistics_refresh"]);

    // Phases after the failure still ran.
    let monitor_phase = report
        .phases
        .iter()
        .find(|p| p.name == "monitor_start")
        .unwrap();
    assert_eq!(monitor_phase.status, PhaseStatus::Succeeded);
    assert!(orchestrator.monitor().is_running());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_optimize_pass_skips_when_healthy() {
    let db = FakeDatabase::new(|_, _| Ok(vec![]));
    let orchestrator = orchestrator_over(&db);
    orchestrator
        .pool()
        .initialize(test_config().pool)
        .await
        .unwrap();

    let report = orchestrator.optimize_once().await;
    assert!(!report.triggered);
    assert!(report.actions.is_empty());
}

#[tokio::test]
async fn test_optimize_pass_remediates_connection_alerts() {
    let db = FakeDatabase::new(|_, _| Ok(vec![]));
    let orchestrator = orchestrator_over(&db);
    orchestrator
        .pool()
        .initialize(test_config().pool)
        .await
        .unwrap();

    // Feed a saturated snapshot so a critical connection alert is active.
    orchestrator
        .monitor()
        .record_snapshot(MetricsSnapshot {
            timestamp: Utc::now(),
            connections: ConnectionMetrics {
                active: 3,
                total: 3,
                max: 3,
                utilization_percent: 95.0,
                ..Default::default()
            },
            ..Default::default()
        })
        .await;

    let report = orchestrator.optimize_once().await;
    assert!(report.triggered);
    assert!(report
        .actions
        .iter()
        .any(|action| action.action == "pool_reconfiguration"));
    // Every action is attempted and reported independently.
    assert!(report.actions.iter().all(|action| action.succeeded));
}
