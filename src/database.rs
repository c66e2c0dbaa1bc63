//! Collaborator seam over the external database engine.
//!
//! The pool, advisor, analyzer, and partition manager all reach the engine
//! through these traits, so every component can be exercised against an
//! injected in-memory collaborator.

use crate::error::PoolError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, ConnectOptions, Row, TypeInfo};
use std::str::FromStr;
use tracing::debug;

/// One live connection to the engine. Leased exclusively to a single caller
/// for the duration of one unit of work; never shared.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Run a statement and fetch all rows, each decoded to a JSON object.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, PoolError>;

    /// Run a statement and return the number of rows affected.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PoolError>;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError>;
}

/// PostgreSQL connection over sqlx.
pub struct PgDatabaseConnection {
    conn: sqlx::PgConnection,
}

#[async_trait]
impl DatabaseConnection for PgDatabaseConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, PoolError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| PoolError::Query(e.to_string()))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut self.conn)
            .await
            .map_err(|e| PoolError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

/// Factory producing single PostgreSQL connections. The crate owns its own
/// pooling discipline, so connections are opened individually rather than
/// through a driver-level pool.
pub struct PgConnectionFactory {
    database_url: String,
    statement_timeout_ms: u64,
}

impl PgConnectionFactory {
    pub fn new(database_url: impl Into<String>, statement_timeout_ms: u64) -> Self {
        Self {
            database_url: database_url.into(),
            statement_timeout_ms,
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, PoolError> {
        let options = PgConnectOptions::from_str(&self.database_url)
            .map_err(|e| PoolError::Connection(e.to_string()))?
            .application_name("dbpulse")
            .options([("statement_timeout", self.statement_timeout_ms.to_string())]);

        let conn = options
            .connect()
            .await
            .map_err(|e| PoolError::Connection(e.to_string()))?;

        debug!("Opened database connection");
        Ok(Box::new(PgDatabaseConnection { conn }))
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

/// Bind heterogeneous JSON params positionally, mapping scalar kinds onto
/// native Postgres types and structured values onto jsonb.
fn bind_params<'q>(mut query: PgQuery<'q>, params: &'q [Value]) -> PgQuery<'q> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}

/// Decode a row into a JSON object keyed by column name. Columns with types
/// the decoder does not recognize come back as text, or null when even that
/// fails, so one odd column never sinks a whole row.
fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" | "OID" => row
                .try_get::<Option<i32>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)
                .ok()
                .flatten()
                .map(|v| Value::from(v as f64)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).ok().flatten(),
            "TIMESTAMPTZ" | "TIMESTAMP" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(i)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_string())),
            _ => row
                .try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}
