//! Bounded leaseable connection pool.
//!
//! A connection is leased exclusively for one unit of work and released on
//! every exit path. Capacity is bounded by a semaphore whose permit lives
//! inside the lease, so an abandoned lease can never leak capacity.

use crate::config::PoolSettings;
use crate::database::{ConnectionFactory, DatabaseConnection};
use crate::error::PoolError;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Wait samples are capped here and truncated to the most recent
/// [`WAIT_SAMPLE_KEEP`] once exceeded, to bound memory.
const WAIT_SAMPLE_CAP: usize = 1000;
const WAIT_SAMPLE_KEEP: usize = 100;

struct PooledConnection {
    conn: Box<dyn DatabaseConnection>,
    idle_since: Instant,
    use_count: u64,
    id: u64,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    removed: AtomicU64,
    errors: AtomicU64,
    waiting: AtomicU64,
}

struct PoolShared {
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    /// Live connections, leased plus idle. Never exceeds `max_connections`.
    open: AtomicU32,
    next_id: AtomicU64,
    counters: PoolCounters,
    wait_samples_ms: Mutex<Vec<f64>>,
    shutting_down: AtomicBool,
}

impl PoolShared {
    fn new(settings: PoolSettings) -> Self {
        let max = settings.max_connections as usize;
        Self {
            settings,
            semaphore: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::new()),
            open: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
            wait_samples_ms: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn is_stale(&self, pooled: &PooledConnection) -> bool {
        if pooled.idle_since.elapsed() > Duration::from_millis(self.settings.idle_timeout_ms) {
            return true;
        }
        let max_uses = self.settings.max_uses_per_connection;
        max_uses > 0 && pooled.use_count >= max_uses
    }

    async fn record_wait_sample(&self, waited: Duration) {
        let mut samples = self.wait_samples_ms.lock().await;
        samples.push(waited.as_secs_f64() * 1000.0);
        if samples.len() > WAIT_SAMPLE_CAP {
            let keep_from = samples.len() - WAIT_SAMPLE_KEEP;
            samples.drain(..keep_from);
        }
    }

    /// Reserve a slot for a new connection; fails when the pool is full.
    fn try_reserve_slot(&self) -> bool {
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                if open < self.settings.max_connections {
                    Some(open + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn discard(&self, pooled: PooledConnection) {
        drop(pooled);
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.counters.removed.fetch_add(1, Ordering::Relaxed);
    }
}

/// An exclusively held connection. The semaphore permit is embedded, so
/// dropping the lease always frees pool capacity.
pub struct ConnectionLease {
    conn: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub fn connection(&mut self) -> &mut dyn DatabaseConnection {
        self.conn
            .as_mut()
            .expect("lease used after release")
            .conn
            .as_mut()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(pooled) = self.conn.take() {
            // Dropped without an explicit release: close the connection but
            // keep the lease ledger balanced.
            self.shared.counters.released.fetch_add(1, Ordering::Relaxed);
            self.shared.discard(pooled);
        }
    }
}

/// Live pool metrics. Counters are mutated on lifecycle events; derived
/// values are computed on read.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolMetrics {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub max_connections: u32,
    pub waiting_requests: u64,
    pub connections_created: u64,
    pub acquires: u64,
    pub releases: u64,
    pub removed: u64,
    pub errors: u64,
    pub utilization_percent: f64,
    pub average_wait_ms: f64,
}

/// Sizing proposal only; applying it is the caller's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizingRecommendation {
    pub current_min: u32,
    pub current_max: u32,
    pub recommended_min: u32,
    pub recommended_max: u32,
    pub recommended_idle_timeout_ms: u64,
    pub utilization_percent: f64,
    pub reason: String,
}

impl PoolSizingRecommendation {
    pub fn is_change(&self) -> bool {
        self.recommended_max != self.current_max || self.recommended_min != self.current_min
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthReport {
    /// `SELECT 1` through a freshly opened direct connection
    pub direct_path_ok: bool,
    /// `SELECT 1` through the lease/execute path
    pub pooled_path_ok: bool,
}

/// Process-wide pool of database connections with an explicit
/// initialize/shutdown lifecycle. Constructed once and shared by all
/// callers; `initialize` is guarded so repeated calls never create a
/// second pool.
pub struct ConnectionPoolManager {
    factory: Arc<dyn ConnectionFactory>,
    inner: RwLock<Option<Arc<PoolShared>>>,
}

impl ConnectionPoolManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            inner: RwLock::new(None),
        }
    }

    /// Create the pool state and eagerly warm `min_connections`. Repeated
    /// calls are logged no-ops.
    pub async fn initialize(&self, settings: PoolSettings) -> Result<(), PoolError> {
        {
            let mut guard = self.inner.write().await;
            if guard.is_some() {
                info!("Connection pool already initialized; ignoring repeated initialize");
                return Ok(());
            }
            info!(
                "Initializing connection pool ({:?} profile, {}..{} connections)",
                settings.profile, settings.min_connections, settings.max_connections
            );
            *guard = Some(Arc::new(PoolShared::new(settings.clone())));
        }

        if settings.min_connections > 0 {
            self.warm_connections(settings.min_connections).await;
        }
        Ok(())
    }

    /// Tear down the current pool state and apply new settings. In-flight
    /// leases drain into the old state and are closed on release.
    pub async fn reconfigure(&self, settings: PoolSettings) -> Result<(), PoolError> {
        {
            let mut guard = self.inner.write().await;
            if let Some(old) = guard.take() {
                old.shutting_down.store(true, Ordering::SeqCst);
                old.semaphore.close();
                let mut idle = old.idle.lock().await;
                while let Some(pooled) = idle.pop_front() {
                    old.discard(pooled);
                }
            }
            info!(
                "Reconfiguring connection pool to {}..{} connections",
                settings.min_connections, settings.max_connections
            );
            *guard = Some(Arc::new(PoolShared::new(settings.clone())));
        }

        if settings.min_connections > 0 {
            self.warm_connections(settings.min_connections).await;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.write().await;
        if let Some(shared) = guard.take() {
            shared.shutting_down.store(true, Ordering::SeqCst);
            shared.semaphore.close();
            let mut idle = shared.idle.lock().await;
            let drained = idle.len();
            while let Some(pooled) = idle.pop_front() {
                shared.discard(pooled);
            }
            info!("Connection pool shut down ({} idle connections closed)", drained);
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_some()
    }

    async fn shared(&self) -> Result<Arc<PoolShared>, PoolError> {
        match self.inner.read().await.as_ref() {
            Some(shared) if !shared.shutting_down.load(Ordering::SeqCst) => Ok(Arc::clone(shared)),
            Some(_) => Err(PoolError::ShuttingDown),
            None => Err(PoolError::NotInitialized),
        }
    }

    /// Lease one connection, reusing a live idle connection when possible.
    pub async fn acquire(&self) -> Result<ConnectionLease, PoolError> {
        let shared = self.shared().await?;
        let acquire_timeout = Duration::from_millis(shared.settings.acquire_timeout_ms);
        let wait_start = Instant::now();

        shared.counters.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = match timeout(
            acquire_timeout,
            Arc::clone(&shared.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => {
                shared.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                permit
            }
            Ok(Err(_)) => {
                shared.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                return Err(PoolError::ShuttingDown);
            }
            Err(_) => {
                shared.counters.waiting.fetch_sub(1, Ordering::Relaxed);
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::AcquireTimeout {
                    ms: shared.settings.acquire_timeout_ms,
                });
            }
        };
        shared.record_wait_sample(wait_start.elapsed()).await;

        let reused = {
            let mut idle = shared.idle.lock().await;
            let mut found = None;
            while let Some(pooled) = idle.pop_front() {
                if shared.is_stale(&pooled) {
                    debug!("Discarding stale pooled connection {}", pooled.id);
                    shared.discard(pooled);
                    continue;
                }
                found = Some(pooled);
                break;
            }
            found
        };

        let mut pooled = match reused {
            Some(pooled) => pooled,
            None => {
                if !shared.try_reserve_slot() {
                    // All slots are live yet none were idle; the permit bound
                    // makes this unreachable outside reconfigure races.
                    return Err(PoolError::Connection(
                        "no capacity for a new connection".to_string(),
                    ));
                }
                match self.factory.connect().await {
                    Ok(conn) => {
                        shared.counters.created.fetch_add(1, Ordering::Relaxed);
                        PooledConnection {
                            conn,
                            idle_since: Instant::now(),
                            use_count: 0,
                            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
                        }
                    }
                    Err(e) => {
                        shared.open.fetch_sub(1, Ordering::SeqCst);
                        shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }
        };

        pooled.use_count += 1;
        shared.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionLease {
            conn: Some(pooled),
            shared,
            _permit: permit,
        })
    }

    /// Return a leased connection, recycling it when it has uses left.
    pub async fn release(&self, mut lease: ConnectionLease) {
        let shared = Arc::clone(&lease.shared);
        let Some(mut pooled) = lease.conn.take() else {
            return;
        };
        shared.counters.released.fetch_add(1, Ordering::Relaxed);

        let max_uses = shared.settings.max_uses_per_connection;
        let exhausted = max_uses > 0 && pooled.use_count >= max_uses;
        if shared.shutting_down.load(Ordering::SeqCst) || exhausted {
            shared.discard(pooled);
            return;
        }

        pooled.idle_since = Instant::now();
        shared.idle.lock().await.push_back(pooled);
        // The permit drops with the lease, freeing capacity for waiters.
    }

    async fn note_error(&self) {
        if let Ok(shared) = self.shared().await {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run one query on a leased connection; the lease is released on every
    /// exit path.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, PoolError> {
        let mut lease = self.acquire().await?;
        let result = lease.connection().query(sql, params).await;
        if result.is_err() {
            self.note_error().await;
        }
        self.release(lease).await;
        result
    }

    /// Run one statement and return the affected row count.
    pub async fn execute_update(&self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        let mut lease = self.acquire().await?;
        let result = lease.connection().execute(sql, params).await;
        if result.is_err() {
            self.note_error().await;
        }
        self.release(lease).await;
        result
    }

    /// Run a unit of work inside BEGIN/COMMIT on one leased connection.
    /// A failing unit of work is rolled back before the error reaches the
    /// caller; the lease is released on every exit path.
    pub async fn execute_transaction<T, F>(&self, work: F) -> Result<T, PoolError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut dyn DatabaseConnection) -> BoxFuture<'a, Result<T, PoolError>>
            + Send,
    {
        let mut lease = self.acquire().await?;

        let begun = lease.connection().execute("BEGIN", &[]).await;
        if let Err(e) = begun {
            self.note_error().await;
            self.release(lease).await;
            return Err(e);
        }

        let outcome = work(lease.connection()).await;
        match outcome {
            Ok(value) => {
                let committed = lease.connection().execute("COMMIT", &[]).await;
                match committed {
                    Ok(_) => {
                        self.release(lease).await;
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = lease.connection().execute("ROLLBACK", &[]).await;
                        self.note_error().await;
                        self.release(lease).await;
                        Err(PoolError::TransactionRolledBack(e.to_string()))
                    }
                }
            }
            Err(e) => {
                let _ = lease.connection().execute("ROLLBACK", &[]).await;
                self.note_error().await;
                self.release(lease).await;
                Err(PoolError::TransactionRolledBack(e.to_string()))
            }
        }
    }

    /// Run several queries on one leased connection, in order.
    pub async fn execute_batch(
        &self,
        queries: &[(String, Vec<Value>)],
    ) -> Result<Vec<Vec<Value>>, PoolError> {
        let mut lease = self.acquire().await?;
        let mut results = Vec::with_capacity(queries.len());
        for (sql, params) in queries {
            let result = lease.connection().query(sql, params).await;
            match result {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    self.note_error().await;
                    self.release(lease).await;
                    return Err(e);
                }
            }
        }
        self.release(lease).await;
        Ok(results)
    }

    /// Eagerly open up to `n` idle connections to absorb cold starts.
    /// Best-effort and parallel; returns how many were opened.
    pub async fn warm_connections(&self, n: u32) -> u32 {
        let shared = match self.shared().await {
            Ok(shared) => shared,
            Err(_) => return 0,
        };

        let tasks: Vec<_> = (0..n)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let factory = Arc::clone(&self.factory);
                async move {
                    if !shared.try_reserve_slot() {
                        return false;
                    }
                    match factory.connect().await {
                        Ok(conn) => {
                            shared.counters.created.fetch_add(1, Ordering::Relaxed);
                            let pooled = PooledConnection {
                                conn,
                                idle_since: Instant::now(),
                                use_count: 0,
                                id: shared.next_id.fetch_add(1, Ordering::Relaxed),
                            };
                            shared.idle.lock().await.push_back(pooled);
                            true
                        }
                        Err(e) => {
                            shared.open.fetch_sub(1, Ordering::SeqCst);
                            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                            warn!("Connection warm-up failed: {}", e);
                            false
                        }
                    }
                }
            })
            .collect();

        let warmed = join_all(tasks).await.into_iter().filter(|ok| *ok).count() as u32;
        debug!("Warmed {}/{} connections", warmed, n);
        warmed
    }

    pub async fn get_metrics(&self) -> Result<PoolMetrics, PoolError> {
        let shared = self.shared().await?;
        let idle = shared.idle.lock().await.len() as u32;
        let total = shared.open.load(Ordering::SeqCst);
        let active = total.saturating_sub(idle);

        let average_wait_ms = {
            let samples = shared.wait_samples_ms.lock().await;
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        let utilization_percent = if total > 0 {
            (active as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Ok(PoolMetrics {
            active_connections: active,
            idle_connections: idle,
            total_connections: total,
            max_connections: shared.settings.max_connections,
            waiting_requests: shared.counters.waiting.load(Ordering::Relaxed),
            connections_created: shared.counters.created.load(Ordering::Relaxed),
            acquires: shared.counters.acquired.load(Ordering::Relaxed),
            releases: shared.counters.released.load(Ordering::Relaxed),
            removed: shared.counters.removed.load(Ordering::Relaxed),
            errors: shared.counters.errors.load(Ordering::Relaxed),
            utilization_percent,
            average_wait_ms,
        })
    }

    pub async fn settings(&self) -> Result<PoolSettings, PoolError> {
        Ok(self.shared().await?.settings.clone())
    }

    /// Propose new sizing from current utilization. Returns a
    /// recommendation only; the pool is never reinitialized here.
    pub async fn optimize_pool_configuration(
        &self,
    ) -> Result<PoolSizingRecommendation, PoolError> {
        let shared = self.shared().await?;
        let metrics = self.get_metrics().await?;
        let settings = &shared.settings;
        let utilization = metrics.utilization_percent;

        let (recommended_max, recommended_idle_timeout_ms, reason) = if utilization > 80.0 {
            (
                ((settings.max_connections as f64) * 1.5).ceil() as u32,
                settings.idle_timeout_ms,
                format!("Utilization {utilization:.1}% exceeds 80%; scale the pool up"),
            )
        } else if utilization < 20.0 && metrics.total_connections > settings.min_connections {
            (
                (((settings.max_connections as f64) * 0.7).floor() as u32)
                    .max(settings.min_connections.max(1)),
                settings.idle_timeout_ms.min(60_000),
                format!("Utilization {utilization:.1}% below 20%; shrink the pool"),
            )
        } else {
            (
                settings.max_connections,
                settings.idle_timeout_ms,
                format!("Utilization {utilization:.1}% within target range"),
            )
        };

        Ok(PoolSizingRecommendation {
            current_min: settings.min_connections,
            current_max: settings.max_connections,
            recommended_min: settings.min_connections.min(recommended_max),
            recommended_max,
            recommended_idle_timeout_ms,
            utilization_percent: utilization,
            reason,
        })
    }

    /// Round-trip a trivial query over both the direct and the pooled path,
    /// reporting each independently.
    pub async fn health_check(&self) -> PoolHealthReport {
        let direct_path_ok = match self.factory.connect().await {
            Ok(mut conn) => conn.query("SELECT 1", &[]).await.is_ok(),
            Err(e) => {
                warn!("Direct connection health check failed: {}", e);
                false
            }
        };

        let pooled_path_ok = self.execute("SELECT 1", &[]).await.is_ok();

        PoolHealthReport {
            direct_path_ok,
            pooled_path_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullConnection;

    #[async_trait]
    impl DatabaseConnection for NullConnection {
        async fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Value>, PoolError> {
            Ok(Vec::new())
        }

        async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64, PoolError> {
            Ok(0)
        }
    }

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory for NullFactory {
        async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError> {
            Ok(Box::new(NullConnection))
        }
    }

    fn test_settings() -> PoolSettings {
        PoolSettings {
            min_connections: 0,
            ..PoolSettings::short_lived()
        }
    }

    #[tokio::test]
    async fn test_uninitialized_pool_rejects_leases() {
        let pool = ConnectionPoolManager::new(Arc::new(NullFactory));
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let pool = ConnectionPoolManager::new(Arc::new(NullFactory));
        pool.initialize(test_settings()).await.unwrap();
        pool.initialize(PoolSettings::long_running()).await.unwrap();

        // The second call must not have replaced the first pool's settings.
        let settings = pool.settings().await.unwrap();
        assert_eq!(settings.max_connections, 3);
    }

    #[tokio::test]
    async fn test_execute_recycles_connection() {
        let pool = ConnectionPoolManager::new(Arc::new(NullFactory));
        pool.initialize(test_settings()).await.unwrap();

        pool.execute("SELECT 1", &[]).await.unwrap();
        pool.execute("SELECT 1", &[]).await.unwrap();

        let metrics = pool.get_metrics().await.unwrap();
        assert_eq!(metrics.connections_created, 1);
        assert_eq!(metrics.acquires, 2);
        assert_eq!(metrics.releases, 2);
        assert_eq!(metrics.active_connections, 0);
        assert_eq!(metrics.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_wait_sample_truncation() {
        let shared = PoolShared::new(test_settings());
        for _ in 0..(WAIT_SAMPLE_CAP + 1) {
            shared.record_wait_sample(Duration::from_millis(1)).await;
        }
        assert_eq!(shared.wait_samples_ms.lock().await.len(), WAIT_SAMPLE_KEEP);
    }

    #[tokio::test]
    async fn test_sizing_recommendation_scales_up_under_pressure() {
        let pool = ConnectionPoolManager::new(Arc::new(NullFactory));
        pool.initialize(test_settings()).await.unwrap();

        // Hold all three leases so utilization reads 100%.
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        let rec = pool.optimize_pool_configuration().await.unwrap();
        assert!(rec.recommended_max > rec.current_max);
        assert!(rec.is_change());

        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_leases() {
        let pool = ConnectionPoolManager::new(Arc::new(NullFactory));
        pool.initialize(test_settings()).await.unwrap();
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NotInitialized)
        ));
    }
}
