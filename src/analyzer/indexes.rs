//! Heuristic index suggestion from query text.
//!
//! Best-effort token scanning, not a SQL parser: table names come from
//! FROM/JOIN clauses, filter columns from the WHERE clause, and the
//! resulting candidates are diffed against existing index column sets.
//! Advisory only and deliberately non-exhaustive.

use crate::advisor::{column_width, estimate_btree_size, index_columns};
use crate::error::AnalysisError;
use crate::pool::ConnectionPoolManager;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// SELECT lists at or below this width qualify for covering indexes.
const COVERING_SELECT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Plain,
    Partial,
    Covering,
    Expression,
}

/// A prospective index. Ephemeral, recomputed per call; the improvement
/// estimate is a coarse text bucket, not a measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecommendation {
    pub table: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub condition: Option<String>,
    pub estimated_size_bytes: u64,
    pub estimated_improvement: String,
}

fn table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:from|join)\s+([a-z_][a-z0-9_]*)(?:\s+(?:as\s+)?([a-z_][a-z0-9_]*))?")
            .expect("static pattern")
    })
}

fn qualified_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b([a-z_][a-z0-9_]*)\.([a-z_][a-z0-9_]*)\s*(?:=|<>|!=|<=|>=|<|>|\bin\b|\blike\b|\bis\b)")
            .expect("static pattern")
    })
}

fn bare_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:^|\(|\s)([a-z_][a-z0-9_]*)\s*(?:=|<>|!=|<=|>=|<|>|\bin\b|\blike\b|\bis\b)")
            .expect("static pattern")
    })
}

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(lower|upper)\(\s*([a-z_][a-z0-9_.]*)\s*\)|\bdate_trunc\(\s*'[a-z]+'\s*,\s*([a-z_][a-z0-9_.]*)\s*\)|([a-z_][a-z0-9_.]*)\s*->>\s*'([a-z0-9_]+)'",
        )
        .expect("static pattern")
    })
}

fn partial_predicate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b([a-z_][a-z0-9_]*)\s+is\s+(?:not\s+)?null\b|\b(deleted_at|archived_at|is_[a-z_]+|active)\s*(?:=|is)\s*(?:true|false|null)|\b(expires_at|valid_until)\s*(?:>|>=)\s*",
        )
        .expect("static pattern")
    })
}

/// Aliased tables referenced by FROM/JOIN, keyed by alias (or name when
/// unaliased). Keywords that trail a table reference are not aliases.
pub(crate) fn extract_tables(query: &str) -> HashMap<String, String> {
    const KEYWORDS: &[&str] = &[
        "where", "on", "inner", "left", "right", "full", "cross", "join", "group", "order",
        "limit", "having", "union", "select", "set",
    ];
    let mut tables = HashMap::new();
    for captures in table_pattern().captures_iter(query) {
        let table = captures[1].to_lowercase();
        if KEYWORDS.contains(&table.as_str()) {
            continue;
        }
        let alias = captures
            .get(2)
            .map(|a| a.as_str().to_lowercase())
            .filter(|a| !KEYWORDS.contains(&a.as_str()));
        tables.insert(alias.unwrap_or_else(|| table.clone()), table);
    }
    tables
}

fn where_clause(query: &str) -> Option<String> {
    let lowered = query.to_lowercase();
    let start = lowered.find(" where ")? + " where ".len();
    let end = ["group by", "order by", "limit", "having", "window"]
        .iter()
        .filter_map(|kw| lowered[start..].find(kw))
        .min()
        .map(|offset| start + offset)
        .unwrap_or(lowered.len());
    Some(lowered[start..end].to_string())
}

/// Filter columns per table, resolved through aliases, in order of first
/// appearance.
pub(crate) fn extract_filter_columns(query: &str) -> HashMap<String, Vec<String>> {
    let tables = extract_tables(query);
    let Some(clause) = where_clause(query) else {
        return HashMap::new();
    };

    let mut columns: HashMap<String, Vec<String>> = HashMap::new();
    let mut push = |table: &str, column: String| {
        let entry = columns.entry(table.to_string()).or_default();
        if !entry.contains(&column) {
            entry.push(column);
        }
    };

    for captures in qualified_column_pattern().captures_iter(&clause) {
        let alias = captures[1].to_lowercase();
        if let Some(table) = tables.get(&alias) {
            push(table, captures[2].to_lowercase());
        }
    }

    // Bare columns only resolve unambiguously with a single table in play.
    if tables.len() == 1 {
        if let Some(table) = tables.values().next() {
            let table = table.clone();
            for captures in bare_column_pattern().captures_iter(&clause) {
                let column = captures[1].to_lowercase();
                if !["and", "or", "not", "in", "is", "like", "exists", "select", "from"]
                    .contains(&column.as_str())
                {
                    push(&table, column);
                }
            }
        }
    }

    columns
}

/// Explicit SELECT-list columns, or None for `*` / expressions too wide to
/// cover.
pub(crate) fn select_list_columns(query: &str) -> Option<Vec<String>> {
    let lowered = query.to_lowercase();
    let start = lowered.find("select ")? + "select ".len();
    let end = lowered[start..].find(" from ")? + start;
    let list = &lowered[start..end];
    if list.contains('*') || list.contains('(') {
        return None;
    }
    let columns: Vec<String> = list
        .split(',')
        .map(|c| {
            c.trim()
                .split_whitespace()
                .next()
                .unwrap_or("")
                .split('.')
                .next_back()
                .unwrap_or("")
                .to_lowercase()
        })
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() || columns.len() > COVERING_SELECT_LIMIT {
        return None;
    }
    Some(columns)
}

pub(crate) async fn suggest_indexes(
    pool: &ConnectionPoolManager,
    query: &str,
) -> Result<Vec<IndexRecommendation>, AnalysisError> {
    let filter_columns = extract_filter_columns(query);
    if filter_columns.is_empty() {
        return Ok(Vec::new());
    }

    let select_columns = select_list_columns(query);
    let mut recommendations = Vec::new();

    for (table, columns) in &filter_columns {
        let existing = existing_index_columns(pool, table).await;
        let (row_count, widths) = table_statistics(pool, table).await;

        // Composite candidate for the filter columns, unless an existing
        // index already leads with them.
        let covered = existing.iter().any(|index| {
            index.len() >= columns.len() && index[..columns.len()] == columns[..]
        });
        if !covered {
            recommendations.push(IndexRecommendation {
                table: table.clone(),
                columns: columns.clone(),
                kind: IndexKind::Plain,
                condition: None,
                estimated_size_bytes: estimate_btree_size(row_count, columns, &widths),
                estimated_improvement: "50-90% reduction in scan time".to_string(),
            });

            // A small, stable SELECT list upgrades the candidate to a
            // covering index that can satisfy the query alone.
            if let Some(select) = &select_columns {
                let mut covering = columns.clone();
                for column in select {
                    if !covering.contains(column) {
                        covering.push(column.clone());
                    }
                }
                if covering.len() > columns.len() && covering.len() <= COVERING_SELECT_LIMIT + 2 {
                    recommendations.push(IndexRecommendation {
                        table: table.clone(),
                        columns: covering.clone(),
                        kind: IndexKind::Covering,
                        condition: None,
                        estimated_size_bytes: estimate_btree_size(row_count, &covering, &widths),
                        estimated_improvement: "Index-only scans avoid heap fetches".to_string(),
                    });
                }
            }
        }

        if let Some(captures) = partial_predicate_pattern().captures(query) {
            let column = captures
                .get(1)
                .or(captures.get(2))
                .or(captures.get(3))
                .map(|m| m.as_str().to_lowercase());
            if let Some(column) = column {
                let condition = captures.get(0).map(|m| m.as_str().trim().to_string());
                recommendations.push(IndexRecommendation {
                    table: table.clone(),
                    columns: vec![column.clone()],
                    kind: IndexKind::Partial,
                    condition,
                    estimated_size_bytes: estimate_btree_size(
                        row_count / 4.0,
                        &[column],
                        &widths,
                    ),
                    estimated_improvement: "A partial index stays small and hot".to_string(),
                });
            }
        }
    }

    for captures in expression_pattern().captures_iter(query) {
        let expression = captures.get(0).map(|m| m.as_str().to_string());
        let column = captures
            .get(2)
            .or(captures.get(3))
            .or(captures.get(4))
            .map(|m| m.as_str().to_lowercase());
        if let (Some(expression), Some(column)) = (expression, column) {
            let table = filter_columns
                .keys()
                .next()
                .cloned()
                .unwrap_or_default();
            let (row_count, widths) = table_statistics(pool, &table).await;
            recommendations.push(IndexRecommendation {
                table,
                columns: vec![column.split('.').next_back().unwrap_or(&column).to_string()],
                kind: IndexKind::Expression,
                condition: Some(expression),
                estimated_size_bytes: estimate_btree_size(
                    row_count,
                    &["expression".to_string()],
                    &widths,
                ),
                estimated_improvement: "Function-wrapped predicates become indexable".to_string(),
            });
        }
    }

    Ok(recommendations)
}

/// Existing index column sets for a table. Catalog failures degrade to an
/// empty set so suggestion stays best-effort.
async fn existing_index_columns(pool: &ConnectionPoolManager, table: &str) -> Vec<Vec<String>> {
    match pool
        .execute(
            "SELECT indexdef FROM pg_indexes WHERE tablename = $1",
            &[json!(table)],
        )
        .await
    {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| row.get("indexdef").and_then(Value::as_str))
            .map(index_columns)
            .collect(),
        Err(e) => {
            debug!("Existing-index lookup degraded for {}: {}", table, e);
            Vec::new()
        }
    }
}

async fn table_statistics(
    pool: &ConnectionPoolManager,
    table: &str,
) -> (f64, HashMap<String, u64>) {
    let row_count = match pool
        .execute(
            "SELECT COALESCE(reltuples, 0)::float8 AS row_count FROM pg_class WHERE relname = $1",
            &[json!(table)],
        )
        .await
    {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.get("row_count"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0),
        Err(_) => 0.0,
    };

    let widths = match pool
        .execute(
            "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = $1",
            &[json!(table)],
        )
        .await
    {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| {
                Some((
                    row.get("column_name")?.as_str()?.to_string(),
                    column_width(row.get("data_type")?.as_str()?),
                ))
            })
            .collect(),
        Err(_) => HashMap::new(),
    };

    (row_count, widths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tables_with_aliases() {
        let tables =
            extract_tables("SELECT * FROM activities a JOIN teams t ON t.id = a.team_id");
        assert_eq!(tables.get("a").map(String::as_str), Some("activities"));
        assert_eq!(tables.get("t").map(String::as_str), Some("teams"));
    }

    #[test]
    fn test_extract_tables_skips_keywords() {
        let tables = extract_tables("SELECT * FROM goals WHERE status = $1");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables.get("goals").map(String::as_str), Some("goals"));
    }

    #[test]
    fn test_filter_columns_resolve_aliases() {
        let columns = extract_filter_columns(
            "SELECT * FROM activities a JOIN teams t ON t.id = a.team_id \
             WHERE a.team_id = $1 AND a.occurred_at > $2",
        );
        assert_eq!(
            columns.get("activities"),
            Some(&vec!["team_id".to_string(), "occurred_at".to_string()])
        );
    }

    #[test]
    fn test_bare_columns_resolve_with_single_table() {
        let columns =
            extract_filter_columns("SELECT id FROM goals WHERE status = $1 AND team_id = $2");
        assert_eq!(
            columns.get("goals"),
            Some(&vec!["status".to_string(), "team_id".to_string()])
        );
    }

    #[test]
    fn test_select_list_rejects_star_and_wide_lists() {
        assert!(select_list_columns("SELECT * FROM teams").is_none());
        assert!(
            select_list_columns("SELECT a, b, c, d, e, f, g FROM teams WHERE a = 1").is_none()
        );
        assert_eq!(
            select_list_columns("SELECT id, name FROM teams WHERE id = 1"),
            Some(vec!["id".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn test_where_clause_stops_at_group_by() {
        let clause =
            where_clause("SELECT team_id FROM activities WHERE team_id = 1 GROUP BY team_id");
        assert_eq!(clause.as_deref().map(str::trim), Some("team_id = 1"));
    }

    #[test]
    fn test_partial_predicate_detection() {
        assert!(partial_predicate_pattern().is_match("WHERE deleted_at IS NULL"));
        assert!(partial_predicate_pattern().is_match("WHERE is_active = true"));
        assert!(partial_predicate_pattern().is_match("WHERE expires_at > now()"));
    }

    #[test]
    fn test_expression_predicate_detection() {
        assert!(expression_pattern().is_match("WHERE lower(email) = $1"));
        assert!(expression_pattern().is_match("WHERE date_trunc('day', occurred_at) = $1"));
        assert!(expression_pattern().is_match("WHERE payload->>'kind' = $1"));
    }
}
