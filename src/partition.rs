//! Monthly range partition lifecycle for large time-ordered tables.
//!
//! Partition names are deterministic (`{parent}_pYYYYMM`), so creation is
//! idempotent and racing schedulers degrade to benign duplicate no-ops.
//! Each partition owns the half-open range `[first-of-month,
//! first-of-next-month)`; siblings of one parent are disjoint and
//! contiguous by construction.

use crate::config::PartitionSettings;
use crate::error::PartitionError;
use crate::pool::ConnectionPoolManager;
use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    NotPartitioned,
    Bootstrapping,
    Steady,
}

/// One physical partition of a logical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub name: String,
    pub parent: String,
    pub range_start: NaiveDate,
    /// Exclusive upper bound
    pub range_end: NaiveDate,
    pub row_count: i64,
    pub size_bytes: u64,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionCreateOutcome {
    pub name: String,
    pub created: bool,
    pub indexes_created: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDropOutcome {
    pub name: String,
    pub dropped: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionBootstrapReport {
    pub parent: String,
    pub months_covered: usize,
    pub outcomes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub migration_id: Uuid,
    pub table: String,
    pub target: String,
    pub total_rows: u64,
    pub copied_rows: u64,
    pub batches: u64,
    pub percent_complete: f64,
}

fn index_def_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"USING\s+(\w+)\s+\((.+)\)\s*$").expect("static pattern")
    })
}

pub struct PartitionManager {
    pool: Arc<ConnectionPoolManager>,
    settings: PartitionSettings,
    states: RwLock<HashMap<String, PartitionState>>,
}

impl PartitionManager {
    pub fn new(pool: Arc<ConnectionPoolManager>, settings: PartitionSettings) -> Self {
        Self {
            pool,
            settings,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state(&self, table: &str) -> PartitionState {
        self.states
            .read()
            .await
            .get(table)
            .copied()
            .unwrap_or(PartitionState::NotPartitioned)
    }

    async fn set_state(&self, table: &str, state: PartitionState) {
        self.states.write().await.insert(table.to_string(), state);
    }

    async fn relation_exists(&self, name: &str) -> Result<bool, PartitionError> {
        let rows = self
            .pool
            .execute(
                "SELECT to_regclass($1)::text AS oid_name",
                &[json!(name)],
            )
            .await
            .map_err(|e| PartitionError::CatalogRead(e.to_string()))?;
        Ok(rows
            .first()
            .and_then(|row| row.get("oid_name"))
            .map(|v| !v.is_null())
            .unwrap_or(false))
    }

    /// Create the partition holding `date`'s month. Idempotent: the name
    /// is derived from (table, year, month), and an existing partition
    /// makes this a no-op.
    pub async fn create_partition(
        &self,
        parent: &str,
        date: NaiveDate,
    ) -> Result<PartitionCreateOutcome, PartitionError> {
        let name = partition_name(parent, date.year(), date.month());
        if self.relation_exists(&name).await? {
            debug!("Partition {} already exists", name);
            return Ok(PartitionCreateOutcome {
                name,
                created: false,
                indexes_created: 0,
            });
        }

        let start = month_start(date);
        let end = next_month_start(date);
        // IF NOT EXISTS keeps a racing scheduler's duplicate create benign.
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF {parent} \
             FOR VALUES FROM ('{start}') TO ('{end}')"
        );
        self.pool
            .execute_update(&statement, &[])
            .await
            .map_err(|e| PartitionError::CreateFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let indexes_created = self.mirror_indexes(parent, &name).await;
        info!(
            "Created partition {} for [{}, {}) with {} indexes",
            name, start, end, indexes_created
        );
        Ok(PartitionCreateOutcome {
            name,
            created: true,
            indexes_created,
        })
    }

    /// Mirror the source table's index definitions onto one partition.
    /// Best effort per index.
    async fn mirror_indexes(&self, source: &str, partition: &str) -> usize {
        let rows = match self
            .pool
            .execute(
                "SELECT indexdef FROM pg_indexes WHERE tablename = $1",
                &[json!(source)],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Index lookup failed for {}: {}", source, e);
                return 0;
            }
        };

        let mut created = 0;
        for (i, row) in rows.iter().enumerate() {
            let Some(indexdef) = row.get("indexdef").and_then(Value::as_str) else {
                continue;
            };
            let Some(captures) = index_def_pattern().captures(indexdef) else {
                continue;
            };
            let method = &captures[1];
            let columns = &captures[2];
            let statement = format!(
                "CREATE INDEX IF NOT EXISTS {partition}_idx{i} ON {partition} \
                 USING {method} ({columns})"
            );
            match self.pool.execute_update(&statement, &[]).await {
                Ok(_) => created += 1,
                Err(e) => warn!("Index creation on {} failed: {}", partition, e),
            }
        }
        created
    }

    /// Build the partitioned parent and one partition per calendar month
    /// spanning the table's existing data plus the configured future
    /// months. Per-month failures are recorded and do not abort the rest.
    pub async fn bootstrap(
        &self,
        table: &str,
        date_column: &str,
    ) -> Result<PartitionBootstrapReport, PartitionError> {
        self.set_state(table, PartitionState::Bootstrapping).await;
        let parent = partitioned_parent_name(table);

        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {parent} \
             (LIKE {table} INCLUDING DEFAULTS INCLUDING CONSTRAINTS) \
             PARTITION BY RANGE ({date_column})"
        );
        self.pool
            .execute_update(&statement, &[])
            .await
            .map_err(|e| PartitionError::CreateFailed {
                name: parent.clone(),
                reason: e.to_string(),
            })?;

        let bounds = self
            .pool
            .execute(
                &format!(
                    "SELECT min({date_column})::date AS min_date, \
                     max({date_column})::date AS max_date FROM {table}"
                ),
                &[],
            )
            .await
            .map_err(|e| PartitionError::CatalogRead(e.to_string()))?;

        let today = Utc::now().date_naive();
        let parse = |key: &str| -> Option<NaiveDate> {
            bounds
                .first()
                .and_then(|row| row.get(key))
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        };
        let min_date = parse("min_date").unwrap_or(today);
        let max_date = parse("max_date").unwrap_or(today).max(today);

        let months = months_between(month_start(min_date), month_start(max_date))
            + self.settings.premake_months as usize
            + 1;

        let mut outcomes = Vec::with_capacity(months);
        let mut cursor = month_start(min_date);
        for _ in 0..months {
            match self.create_partition(&parent, cursor).await {
                Ok(outcome) => outcomes.push((
                    outcome.name,
                    if outcome.created {
                        "created".to_string()
                    } else {
                        "already existed".to_string()
                    },
                )),
                Err(e) => {
                    warn!("Partition creation failed during bootstrap: {}", e);
                    outcomes.push((
                        partition_name(&parent, cursor.year(), cursor.month()),
                        format!("failed: {e}"),
                    ));
                }
            }
            cursor = next_month_start(cursor);
        }

        self.set_state(table, PartitionState::Steady).await;
        info!(
            "Bootstrapped {} with {} monthly partitions",
            parent, months
        );
        Ok(PartitionBootstrapReport {
            parent,
            months_covered: months,
            outcomes,
        })
    }

    /// Create partitions for the current month plus the next `months`, so
    /// inserts never land without a target.
    pub async fn ensure_future_partitions(
        &self,
        parent: &str,
        months: u32,
    ) -> Result<Vec<PartitionCreateOutcome>, PartitionError> {
        let mut outcomes = Vec::with_capacity(months as usize + 1);
        let mut cursor = month_start(Utc::now().date_naive());
        for _ in 0..=months {
            outcomes.push(self.create_partition(parent, cursor).await?);
            cursor = next_month_start(cursor);
        }
        Ok(outcomes)
    }

    /// Drop partitions whose entire range precedes `now - retention`.
    /// A partition overlapping the retention boundary is never dropped.
    pub async fn drop_old_partitions(
        &self,
        parent: &str,
        retention_months: u32,
    ) -> Result<Vec<PartitionDropOutcome>, PartitionError> {
        let cutoff = subtract_months(Utc::now().date_naive(), retention_months);
        let partitions = self.list_partitions(parent).await?;

        let mut outcomes = Vec::new();
        for partition in partitions {
            if !entirely_before(partition.range_end, cutoff) {
                continue;
            }
            let statement = format!("DROP TABLE IF EXISTS {}", partition.name);
            match self.pool.execute_update(&statement, &[]).await {
                Ok(_) => {
                    info!(
                        "Dropped partition {} ([{}, {}) past retention)",
                        partition.name, partition.range_start, partition.range_end
                    );
                    outcomes.push(PartitionDropOutcome {
                        name: partition.name,
                        dropped: true,
                        detail: "dropped".to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to drop partition {}: {}", partition.name, e);
                    outcomes.push(PartitionDropOutcome {
                        name: partition.name,
                        dropped: false,
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Current partitions of a parent with ranges recovered from their
    /// deterministic names.
    pub async fn list_partitions(
        &self,
        parent: &str,
    ) -> Result<Vec<PartitionDescriptor>, PartitionError> {
        let rows = self
            .pool
            .execute(
                "SELECT c.relname AS name, COALESCE(c.reltuples, 0)::float8 AS row_count, \
                 pg_relation_size(c.oid) AS size_bytes \
                 FROM pg_inherits i \
                 JOIN pg_class c ON c.oid = i.inhrelid \
                 JOIN pg_class p ON p.oid = i.inhparent \
                 WHERE p.relname = $1 ORDER BY c.relname",
                &[json!(parent)],
            )
            .await
            .map_err(|e| PartitionError::CatalogRead(e.to_string()))?;

        let mut descriptors = Vec::new();
        for row in &rows {
            let Some(name) = row.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some((year, month)) = parse_partition_month(parent, name) else {
                warn!("Partition {} does not follow the naming scheme", name);
                continue;
            };
            let Some(range_start) = NaiveDate::from_ymd_opt(year, month, 1) else {
                continue;
            };

            let indexes: Vec<String> = self
                .pool
                .execute(
                    "SELECT indexname FROM pg_indexes WHERE tablename = $1",
                    &[json!(name)],
                )
                .await
                .unwrap_or_default()
                .iter()
                .filter_map(|r| r.get("indexname").and_then(Value::as_str).map(str::to_string))
                .collect();

            descriptors.push(PartitionDescriptor {
                name: name.to_string(),
                parent: parent.to_string(),
                range_start,
                range_end: next_month_start(range_start),
                row_count: row
                    .get("row_count")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as i64,
                size_bytes: row.get("size_bytes").and_then(Value::as_u64).unwrap_or(0),
                indexes,
            });
        }

        descriptors.sort_by_key(|d| d.range_start);
        for pair in descriptors.windows(2) {
            debug_assert!(
                pair[1].range_start >= pair[0].range_end,
                "sibling partitions must not overlap"
            );
            if pair[1].range_start > pair[0].range_end {
                warn!(
                    "Gap between partitions {} and {}",
                    pair[0].name, pair[1].name
                );
            }
        }
        Ok(descriptors)
    }

    /// Copy rows into the partitioned parent in fixed-size batches ordered
    /// by the partition key, with insert-if-absent semantics so an
    /// interrupted migration restarts safely.
    pub async fn migrate_to_partitioned(
        &self,
        table: &str,
        date_column: &str,
        batch_size: Option<u64>,
    ) -> Result<MigrationProgress, PartitionError> {
        let target = partitioned_parent_name(table);
        let batch = batch_size.unwrap_or(self.settings.migration_batch_size).max(1);

        let total_rows = self
            .pool
            .execute(&format!("SELECT count(*) AS total FROM {table}"), &[])
            .await
            .map_err(|e| PartitionError::MigrationFailed {
                table: table.to_string(),
                reason: e.to_string(),
            })?
            .first()
            .and_then(|row| row.get("total"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut copied_rows = 0u64;
        let mut batches = 0u64;
        let mut last = "-infinity".to_string();

        loop {
            let boundary = self
                .pool
                .execute(
                    &format!(
                        "SELECT max({date_column})::text AS hi FROM ( \
                         SELECT {date_column} FROM {table} \
                         WHERE {date_column} > CAST($1 AS timestamptz) \
                         ORDER BY {date_column} LIMIT {batch}) b"
                    ),
                    &[json!(last)],
                )
                .await
                .map_err(|e| PartitionError::MigrationFailed {
                    table: table.to_string(),
                    reason: e.to_string(),
                })?;

            let Some(hi) = boundary
                .first()
                .and_then(|row| row.get("hi"))
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                break;
            };

            let affected = self
                .pool
                .execute_update(
                    &format!(
                        "INSERT INTO {target} SELECT * FROM {table} \
                         WHERE {date_column} > CAST($1 AS timestamptz) \
                         AND {date_column} <= CAST($2 AS timestamptz) \
                         ON CONFLICT DO NOTHING"
                    ),
                    &[json!(last), json!(hi)],
                )
                .await
                .map_err(|e| PartitionError::MigrationFailed {
                    table: table.to_string(),
                    reason: e.to_string(),
                })?;

            copied_rows += affected;
            batches += 1;
            last = hi;
            debug!(
                "Migration batch {} copied {} rows (through {})",
                batches, affected, last
            );
        }

        info!(
            "Migration of {} complete: {} rows over {} batches",
            table, copied_rows, batches
        );
        Ok(MigrationProgress {
            migration_id: Uuid::new_v4(),
            table: table.to_string(),
            target,
            total_rows,
            copied_rows,
            batches,
            percent_complete: 100.0,
        })
    }

    pub fn settings(&self) -> &PartitionSettings {
        &self.settings
    }
}

pub(crate) fn partitioned_parent_name(table: &str) -> String {
    format!("{table}_partitioned")
}

/// Deterministic partition name: `{parent}_pYYYYMM`.
pub(crate) fn partition_name(parent: &str, year: i32, month: u32) -> String {
    format!("{parent}_p{year:04}{month:02}")
}

pub(crate) fn parse_partition_month(parent: &str, name: &str) -> Option<(i32, u32)> {
    let suffix = name.strip_prefix(parent)?.strip_prefix("_p")?;
    if suffix.len() != 6 {
        return None;
    }
    let year: i32 = suffix[..4].parse().ok()?;
    let month: u32 = suffix[4..].parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

pub(crate) fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

pub(crate) fn next_month_start(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// Whole months from `from` to `to`, both month-aligned.
pub(crate) fn months_between(from: NaiveDate, to: NaiveDate) -> usize {
    if to < from {
        return 0;
    }
    ((to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32).max(0) as usize
}

pub(crate) fn subtract_months(date: NaiveDate, months: u32) -> NaiveDate {
    let total = date.year() * 12 + date.month() as i32 - 1 - months as i32;
    let year = total.div_euclid(12);
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = date.day().min(last_day_of_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    for day in [31, 30, 29, 28] {
        if NaiveDate::from_ymd_opt(year, month, day).is_some() {
            return day;
        }
    }
    28
}

/// True when the half-open range ending at `range_end` lies entirely
/// before `cutoff`.
pub(crate) fn entirely_before(range_end: NaiveDate, cutoff: NaiveDate) -> bool {
    range_end <= cutoff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn test_partition_name_is_deterministic() {
        assert_eq!(partition_name("activities", 2026, 3), "activities_p202603");
        assert_eq!(partition_name("activities", 2026, 11), "activities_p202611");
    }

    #[test]
    fn test_parse_partition_month_round_trip() {
        let name = partition_name("activities", 2025, 12);
        assert_eq!(parse_partition_month("activities", &name), Some((2025, 12)));
        assert_eq!(parse_partition_month("activities", "activities_old"), None);
        assert_eq!(parse_partition_month("activities", "activities_p20261"), None);
        assert_eq!(parse_partition_month("goals", &name), None);
    }

    #[test]
    fn test_month_boundaries() {
        assert_eq!(month_start(date(2026, 8, 7)), date(2026, 8, 1));
        assert_eq!(next_month_start(date(2026, 12, 15)), date(2027, 1, 1));
        assert_eq!(next_month_start(date(2026, 1, 31)), date(2026, 2, 1));
    }

    #[test]
    fn test_months_between() {
        assert_eq!(months_between(date(2026, 1, 1), date(2026, 1, 1)), 0);
        assert_eq!(months_between(date(2025, 11, 1), date(2026, 2, 1)), 3);
        assert_eq!(months_between(date(2026, 2, 1), date(2026, 1, 1)), 0);
    }

    #[test]
    fn test_subtract_months_clamps_day() {
        assert_eq!(subtract_months(date(2026, 3, 31), 1), date(2026, 2, 28));
        assert_eq!(subtract_months(date(2026, 1, 15), 2), date(2025, 11, 15));
        assert_eq!(subtract_months(date(2026, 1, 1), 12), date(2025, 1, 1));
    }

    #[test]
    fn test_retention_boundary_is_never_crossed() {
        let cutoff = date(2026, 5, 7);
        // Range [2026-04-01, 2026-05-01) ends before the cutoff: droppable.
        assert!(entirely_before(date(2026, 5, 1), cutoff));
        // Range [2026-05-01, 2026-06-01) straddles the cutoff: kept.
        assert!(!entirely_before(date(2026, 6, 1), cutoff));
        // Exact boundary counts as entirely before (half-open range).
        assert!(entirely_before(cutoff, cutoff));
    }

    #[test]
    fn test_index_def_pattern_extracts_method_and_columns() {
        let def = "CREATE INDEX idx ON public.activities USING btree (team_id, occurred_at)";
        let captures = index_def_pattern().captures(def).unwrap();
        assert_eq!(&captures[1], "btree");
        assert_eq!(&captures[2], "team_id, occurred_at");
    }
}
