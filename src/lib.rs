pub mod advisor;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod pool;

pub use config::{
    AlertThresholds, CacheSettings, MonitorSettings, PartitionSettings, PerformanceConfig,
    PoolProfile, PoolSettings,
};
pub use error::{
    AnalysisError, CacheError, IndexOperationError, MonitorError, PartitionError,
    PerformanceError, PoolError, Result,
};

// Re-export the collaborator seam
pub use database::{ConnectionFactory, DatabaseConnection, PgConnectionFactory};

// Re-export component services for convenience
pub use advisor::{IndexAdvisor, IndexUsageReport};
pub use analyzer::{
    OptimizationRecommendation, QueryAnalysis, QueryPlanAnalyzer, QueryRewrite,
    RecommendationCategory, Severity,
};
pub use cache::{CacheEntry, CacheOptions, CacheStats, QueryResultCache, WarmCacheEntry};
pub use monitor::{
    Alert, AlertSeverity, HealthStatus, MetricsCollector, MetricsSnapshot, PerformanceDashboard,
    PerformanceMonitor,
};
pub use orchestrator::{BootstrapReport, PerformanceOrchestrator, PhaseStatus};
pub use partition::{PartitionDescriptor, PartitionManager, PartitionState};
pub use pool::{ConnectionPoolManager, PoolMetrics, PoolSizingRecommendation};
