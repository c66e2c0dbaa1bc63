//! Catalog-driven index advisory: unused and redundant index detection,
//! size estimation, and idempotent cleanup of unused indexes.

use crate::error::{IndexOperationError, PoolError};
use crate::pool::ConnectionPoolManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// B-tree page and item overhead on top of raw column widths.
const BTREE_OVERHEAD_FACTOR: f64 = 1.4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedIndex {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundantIndexPair {
    pub table: String,
    /// Index kept (first by name)
    pub kept: String,
    /// Index with the identical ordered column set; the drop candidate
    pub duplicate: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingIndexCandidate {
    pub table: String,
    pub seq_scans: i64,
    pub rows_read: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexUsageReport {
    pub unused_indexes: Vec<UnusedIndex>,
    pub redundant_indexes: Vec<RedundantIndexPair>,
    pub missing_indexes: Vec<MissingIndexCandidate>,
    pub index_hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DropAction {
    Dropped,
    DryRun,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDropOutcome {
    pub index: String,
    pub table: String,
    pub action: DropAction,
    pub detail: String,
}

pub struct IndexAdvisor {
    pool: Arc<ConnectionPoolManager>,
}

impl IndexAdvisor {
    pub fn new(pool: Arc<ConnectionPoolManager>) -> Self {
        Self { pool }
    }

    /// Read catalog usage counters and classify indexes. A catalog read
    /// failure surfaces as `IndexOperationError`; callers treat it as
    /// non-fatal and report zero suggestions.
    pub async fn analyze_usage(&self) -> Result<IndexUsageReport, IndexOperationError> {
        let unused_indexes = self.find_unused_indexes().await?;
        let redundant_indexes = self.find_redundant_indexes().await?;
        let missing_indexes = self.find_missing_index_candidates().await?;
        let index_hit_ratio = self.index_hit_ratio().await?;

        info!(
            "Index usage: {} unused, {} redundant, {} missing candidates, hit ratio {:.3}",
            unused_indexes.len(),
            redundant_indexes.len(),
            missing_indexes.len(),
            index_hit_ratio
        );

        Ok(IndexUsageReport {
            unused_indexes,
            redundant_indexes,
            missing_indexes,
            index_hit_ratio,
        })
    }

    /// An index with zero scans since statistics reset is unused.
    /// Primary-key and unique-backing indexes are never candidates.
    async fn find_unused_indexes(&self) -> Result<Vec<UnusedIndex>, IndexOperationError> {
        let rows = self
            .catalog_query(
                "SELECT s.schemaname, s.relname, s.indexrelname, \
                 pg_relation_size(s.indexrelid) AS size_bytes \
                 FROM pg_stat_user_indexes s \
                 JOIN pg_index i ON i.indexrelid = s.indexrelid \
                 WHERE s.idx_scan = 0 AND NOT i.indisunique AND NOT i.indisprimary \
                 ORDER BY pg_relation_size(s.indexrelid) DESC",
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(UnusedIndex {
                    schema: row.get("schemaname")?.as_str()?.to_string(),
                    table: row.get("relname")?.as_str()?.to_string(),
                    index: row.get("indexrelname")?.as_str()?.to_string(),
                    size_bytes: row.get("size_bytes").and_then(Value::as_u64).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn find_redundant_indexes(&self) -> Result<Vec<RedundantIndexPair>, IndexOperationError> {
        let rows = self
            .catalog_query(
                "SELECT tablename, indexname, indexdef FROM pg_indexes \
                 WHERE schemaname = 'public' ORDER BY tablename, indexname",
            )
            .await?;

        let defs: Vec<(String, String, String)> = rows
            .iter()
            .filter_map(|row| {
                Some((
                    row.get("tablename")?.as_str()?.to_string(),
                    row.get("indexname")?.as_str()?.to_string(),
                    row.get("indexdef")?.as_str()?.to_string(),
                ))
            })
            .collect();

        Ok(find_redundant_pairs(&defs))
    }

    /// Tables scanned sequentially far more than through indexes.
    async fn find_missing_index_candidates(
        &self,
    ) -> Result<Vec<MissingIndexCandidate>, IndexOperationError> {
        let rows = self
            .catalog_query(
                "SELECT relname, seq_scan, seq_tup_read, COALESCE(idx_scan, 0) AS idx_scan \
                 FROM pg_stat_user_tables \
                 WHERE seq_scan > 0 AND seq_tup_read > 100000 \
                 AND (idx_scan IS NULL OR idx_scan < seq_scan / 10) \
                 ORDER BY seq_tup_read DESC LIMIT 10",
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let table = row.get("relname")?.as_str()?.to_string();
                let seq_scans = row.get("seq_scan").and_then(Value::as_i64).unwrap_or(0);
                let rows_read = row.get("seq_tup_read").and_then(Value::as_i64).unwrap_or(0);
                Some(MissingIndexCandidate {
                    reason: format!(
                        "{seq_scans} sequential scans reading {rows_read} rows with little index use"
                    ),
                    table,
                    seq_scans,
                    rows_read,
                })
            })
            .collect())
    }

    async fn index_hit_ratio(&self) -> Result<f64, IndexOperationError> {
        let rows = self
            .catalog_query(
                "SELECT COALESCE(sum(idx_blks_hit)::float8 / \
                 NULLIF(sum(idx_blks_hit + idx_blks_read), 0)::float8, 0) AS ratio \
                 FROM pg_statio_user_indexes",
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("ratio"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0))
    }

    /// Advisory size estimate for a prospective index.
    pub async fn estimate_index_size(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<u64, IndexOperationError> {
        let rows = self
            .pool
            .execute(
                "SELECT COALESCE(reltuples, 0)::float8 AS row_count \
                 FROM pg_class WHERE relname = $1",
                &[json!(table)],
            )
            .await
            .map_err(|e| map_catalog_error(e))?;
        let row_count = rows
            .first()
            .and_then(|row| row.get("row_count"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0);

        let types = self
            .pool
            .execute(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = $1",
                &[json!(table)],
            )
            .await
            .map_err(|e| map_catalog_error(e))?;
        let widths: HashMap<String, u64> = types
            .iter()
            .filter_map(|row| {
                Some((
                    row.get("column_name")?.as_str()?.to_string(),
                    column_width(row.get("data_type")?.as_str()?),
                ))
            })
            .collect();

        Ok(estimate_btree_size(row_count, columns, &widths))
    }

    /// Drop every unused-index candidate, one at a time; one failure does
    /// not abort the rest, and re-runs are no-ops for already-dropped
    /// indexes.
    pub async fn drop_unused_indexes(
        &self,
        dry_run: bool,
    ) -> Result<Vec<IndexDropOutcome>, IndexOperationError> {
        let unused = self.find_unused_indexes().await?;
        let mut outcomes = Vec::with_capacity(unused.len());

        for candidate in unused {
            if dry_run {
                outcomes.push(IndexDropOutcome {
                    index: candidate.index,
                    table: candidate.table,
                    action: DropAction::DryRun,
                    detail: "dry run, no drop issued".to_string(),
                });
                continue;
            }

            let exists = self
                .pool
                .execute(
                    "SELECT to_regclass($1)::text AS oid_name",
                    &[json!(format!("{}.{}", candidate.schema, candidate.index))],
                )
                .await
                .ok()
                .and_then(|rows| rows.first().cloned())
                .map(|row| {
                    row.get("oid_name")
                        .map(|v| !v.is_null())
                        .unwrap_or(false)
                })
                .unwrap_or(true);
            if !exists {
                outcomes.push(IndexDropOutcome {
                    index: candidate.index,
                    table: candidate.table,
                    action: DropAction::Skipped,
                    detail: "already dropped".to_string(),
                });
                continue;
            }

            let statement = format!(
                "DROP INDEX IF EXISTS {}.{}",
                quote_ident(&candidate.schema),
                quote_ident(&candidate.index)
            );
            match self.pool.execute_update(&statement, &[]).await {
                Ok(_) => {
                    info!("Dropped unused index {}", candidate.index);
                    outcomes.push(IndexDropOutcome {
                        index: candidate.index,
                        table: candidate.table,
                        action: DropAction::Dropped,
                        detail: "dropped".to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to drop index {}: {}", candidate.index, e);
                    outcomes.push(IndexDropOutcome {
                        index: candidate.index,
                        table: candidate.table,
                        action: DropAction::Failed,
                        detail: e.to_string(),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    async fn catalog_query(&self, sql: &str) -> Result<Vec<Value>, IndexOperationError> {
        self.pool
            .execute(sql, &[])
            .await
            .map_err(map_catalog_error)
    }
}

fn map_catalog_error(e: PoolError) -> IndexOperationError {
    IndexOperationError::CatalogRead(e.to_string())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Ordered column list from a `CREATE INDEX ... (col, col)` definition.
pub(crate) fn index_columns(indexdef: &str) -> Vec<String> {
    indexdef
        .rfind('(')
        .and_then(|start| indexdef[start..].find(')').map(|end| (start, start + end)))
        .map(|(start, end)| {
            indexdef[start + 1..end]
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Two indexes with identical ordered column sets are redundant; the
/// later-named one is the drop candidate so reports are deterministic.
fn find_redundant_pairs(defs: &[(String, String, String)]) -> Vec<RedundantIndexPair> {
    let mut by_columns: HashMap<(String, Vec<String>), Vec<String>> = HashMap::new();
    for (table, index, indexdef) in defs {
        let columns = index_columns(indexdef);
        if columns.is_empty() {
            continue;
        }
        by_columns
            .entry((table.clone(), columns))
            .or_default()
            .push(index.clone());
    }

    let mut pairs = Vec::new();
    for ((table, columns), mut indexes) in by_columns {
        if indexes.len() < 2 {
            continue;
        }
        indexes.sort();
        let kept = indexes[0].clone();
        for duplicate in indexes.into_iter().skip(1) {
            pairs.push(RedundantIndexPair {
                table: table.clone(),
                kept: kept.clone(),
                duplicate,
                columns: columns.clone(),
            });
        }
    }
    pairs.sort_by(|a, b| (&a.table, &a.duplicate).cmp(&(&b.table, &b.duplicate)));
    pairs
}

/// Typical on-disk width per catalog data type.
pub(crate) fn column_width(data_type: &str) -> u64 {
    match data_type {
        "uuid" => 16,
        "bigint" | "double precision" | "timestamp with time zone"
        | "timestamp without time zone" | "time without time zone" => 8,
        "integer" => 4,
        "smallint" => 2,
        "boolean" => 1,
        "date" => 4,
        "real" => 4,
        "numeric" => 12,
        "json" | "jsonb" => 128,
        "text" | "character varying" | "character" => 36,
        _ => 16,
    }
}

/// rows × total column width × B-tree overhead.
pub(crate) fn estimate_btree_size(
    row_count: f64,
    columns: &[String],
    widths: &HashMap<String, u64>,
) -> u64 {
    let entry_width: u64 = columns
        .iter()
        .map(|c| widths.get(c).copied().unwrap_or(16))
        .sum();
    (row_count * entry_width as f64 * BTREE_OVERHEAD_FACTOR) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_columns_parsing() {
        let def = "CREATE INDEX idx_activities_team ON public.activities USING btree (team_id, occurred_at)";
        assert_eq!(index_columns(def), vec!["team_id", "occurred_at"]);
    }

    #[test]
    fn test_redundancy_is_order_sensitive() {
        let defs = vec![
            (
                "activities".to_string(),
                "idx_a".to_string(),
                "CREATE INDEX idx_a ON activities (team_id, occurred_at)".to_string(),
            ),
            (
                "activities".to_string(),
                "idx_b".to_string(),
                "CREATE INDEX idx_b ON activities (occurred_at, team_id)".to_string(),
            ),
        ];
        assert!(find_redundant_pairs(&defs).is_empty());
    }

    #[test]
    fn test_redundant_pair_detected() {
        let defs = vec![
            (
                "goals".to_string(),
                "idx_new".to_string(),
                "CREATE INDEX idx_new ON goals (team_id)".to_string(),
            ),
            (
                "goals".to_string(),
                "idx_old".to_string(),
                "CREATE INDEX idx_old ON goals (team_id)".to_string(),
            ),
        ];
        let pairs = find_redundant_pairs(&defs);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].kept, "idx_new");
        assert_eq!(pairs[0].duplicate, "idx_old");
    }

    #[test]
    fn test_size_estimate_applies_overhead() {
        let mut widths = HashMap::new();
        widths.insert("team_id".to_string(), 16u64);
        widths.insert("occurred_at".to_string(), 8u64);
        let size = estimate_btree_size(
            1000.0,
            &["team_id".to_string(), "occurred_at".to_string()],
            &widths,
        );
        assert_eq!(size, (1000.0 * 24.0 * 1.4) as u64);
    }

    #[test]
    fn test_unknown_column_width_defaults() {
        assert_eq!(column_width("interval"), 16);
        assert_eq!(column_width("uuid"), 16);
        assert_eq!(column_width("boolean"), 1);
    }
}
