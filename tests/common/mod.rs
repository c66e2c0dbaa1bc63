//! In-memory database collaborator for exercising the performance layer
//! without a live engine.

#![allow(dead_code)]

use async_trait::async_trait;
use dbpulse::config::PoolSettings;
use dbpulse::database::{ConnectionFactory, DatabaseConnection};
use dbpulse::error::PoolError;
use dbpulse::pool::ConnectionPoolManager;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Handler = dyn Fn(&str, &[Value]) -> Result<Vec<Value>, PoolError> + Send + Sync;

/// Scripted fake engine shared by every connection a factory hands out.
pub struct FakeDatabase {
    handler: Box<Handler>,
    pub delay: Option<Duration>,
    pub queries: AtomicU64,
    pub connects: AtomicU64,
    in_flight: AtomicI64,
    pub max_in_flight: AtomicI64,
}

impl FakeDatabase {
    pub fn new(
        handler: impl Fn(&str, &[Value]) -> Result<Vec<Value>, PoolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: None,
            queries: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            max_in_flight: AtomicI64::new(0),
        })
    }

    pub fn with_delay(
        delay: Duration,
        handler: impl Fn(&str, &[Value]) -> Result<Vec<Value>, PoolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: Some(delay),
            queries: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            max_in_flight: AtomicI64::new(0),
        })
    }

    async fn run(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, PoolError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        let result = (self.handler)(sql, params);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct FakeConnection {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl DatabaseConnection for FakeConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, PoolError> {
        self.db.run(sql, params).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        self.db.run(sql, params).await.map(|rows| rows.len() as u64)
    }
}

pub struct FakeFactory {
    pub db: Arc<FakeDatabase>,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError> {
        self.db.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            db: Arc::clone(&self.db),
        }))
    }
}

/// Pool over a fake engine, initialized with the given settings.
pub async fn initialized_pool(
    db: &Arc<FakeDatabase>,
    settings: PoolSettings,
) -> Arc<ConnectionPoolManager> {
    let pool = Arc::new(ConnectionPoolManager::new(Arc::new(FakeFactory {
        db: Arc::clone(db),
    })));
    pool.initialize(settings)
        .await
        .expect("pool initialization");
    pool
}

/// Short-lived settings without eager warm-up, so connection counters
/// reflect the test's own activity.
pub fn quiet_settings(max_connections: u32) -> PoolSettings {
    PoolSettings {
        min_connections: 0,
        max_connections,
        ..PoolSettings::short_lived()
    }
}
