use thiserror::Error;

/// Plan retrieval or plan parsing failure.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Plan retrieval failed: {0}")]
    PlanRetrieval(String),

    #[error("Plan output could not be parsed: {0}")]
    PlanParse(String),

    #[error("Query is not safe to analyze: {reason}")]
    UnsafeQuery { reason: String },

    #[error("Plan request timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Index catalog read or create/drop failure.
#[derive(Error, Debug)]
pub enum IndexOperationError {
    #[error("Index catalog read failed: {0}")]
    CatalogRead(String),

    #[error("Failed to drop index {index}: {reason}")]
    DropFailed { index: String, reason: String },

    #[error("Failed to create index on {table}: {reason}")]
    CreateFailed { table: String, reason: String },
}

/// Partition create or migrate failure.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Failed to create partition {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to drop partition {name}: {reason}")]
    DropFailed { name: String, reason: String },

    #[error("Migration of {table} failed: {reason}")]
    MigrationFailed { table: String, reason: String },

    #[error("Invalid partition range: {0}")]
    InvalidRange(String),

    #[error("Catalog read failed: {0}")]
    CatalogRead(String),
}

/// Connection acquisition or query execution failure.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Connection pool is not initialized")]
    NotInitialized,

    #[error("Connection pool is shutting down")]
    ShuttingDown,

    #[error("Timed out after {ms}ms waiting for a connection")]
    AcquireTimeout { ms: u64 },

    #[error("Failed to open connection: {0}")]
    Connection(String),

    #[error("Query execution failed: {0}")]
    Query(String),

    #[error("Transaction failed and was rolled back: {0}")]
    TransactionRolledBack(String),
}

/// Cache storage-tier failure. Always degradable to direct execution.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage tier failed: {0}")]
    StorageTier(String),

    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    #[error("Cache entry could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single metric source failed to collect.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Metric source '{metric_source}' failed: {reason}")]
    CollectionFailed { metric_source: String, reason: String },

    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Metrics registry error: {0}")]
    Registry(String),
}

#[derive(Error, Debug)]
pub enum PerformanceError {
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Index operation error: {0}")]
    IndexOperation(#[from] IndexOperationError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PerformanceError>;
