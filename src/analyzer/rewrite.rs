//! Best-effort textual query rewrites. Advisory only, never auto-applied:
//! each transform fires on a narrow, recognizable shape and leaves
//! anything else untouched. The rewritten text is returned only when it
//! differs from the input.

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// How many literal IN-list items before the VALUES form pays off.
const LARGE_IN_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRewrite {
    pub original: String,
    pub rewritten: String,
    pub notes: Vec<String>,
}

fn exists_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)EXISTS\s*\(\s*SELECT\s+1\s+FROM\s+([a-z_][a-z0-9_]*)\s+([a-z_][a-z0-9_]*)\s+WHERE\s+([a-z_][a-z0-9_]*)\.([a-z_][a-z0-9_]*)\s*=\s*([a-z_][a-z0-9_]*)\.([a-z_][a-z0-9_]*)\s*\)",
        )
        .expect("static pattern")
    })
}

fn in_list_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bIN\s*\(\s*([^()]+?)\s*\)").expect("static pattern")
    })
}

fn simple_subquery_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // One level of nested parens covers aggregate calls in the list.
        Regex::new(r"(?is)\(\s*SELECT\s+(?:[^()]|\([^()]*\))+\)").expect("static pattern")
    })
}

fn count_subquery_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\(\s*SELECT\s+count\(\*\)\s+FROM\s+([a-z_][a-z0-9_]*)\s*\)\s+AS\s+([a-z_][a-z0-9_]*)")
            .expect("static pattern")
    })
}

fn pushdown_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)FROM\s*\(\s*SELECT\s+\*\s+FROM\s+([a-z_][a-z0-9_]*)\s*\)\s+([a-z_][a-z0-9_]*)\s+WHERE\s+([a-z_][a-z0-9_]*)\.([a-z_][a-z0-9_]*)\s*(<=|>=|<>|!=|=|<|>)\s*('[^']*'|[0-9]+|\$[0-9]+)",
        )
        .expect("static pattern")
    })
}

/// Apply every transform in order; None when nothing changed.
pub fn rewrite_query(query: &str) -> Option<QueryRewrite> {
    let mut current = query.to_string();
    let mut notes = Vec::new();

    let transforms: [(&str, fn(&str) -> Option<String>); 5] = [
        (
            "Correlated EXISTS flattened into a semi-join IN form",
            exists_to_semijoin,
        ),
        (
            "Large IN list rewritten to a VALUES list for hashable matching",
            large_in_to_values,
        ),
        (
            "Repeated identical subquery hoisted into a named subquery",
            repeated_subquery_to_cte,
        ),
        (
            "Scalar count(*) subquery replaced with a window aggregate",
            scalar_count_to_window,
        ),
        (
            "Outer predicate pushed down into the FROM subquery",
            predicate_pushdown,
        ),
    ];

    for (note, transform) in transforms {
        if let Some(next) = transform(&current) {
            if next != current {
                current = next;
                notes.push(note.to_string());
            }
        }
    }

    if current == query {
        return None;
    }
    Some(QueryRewrite {
        original: query.to_string(),
        rewritten: current,
        notes,
    })
}

/// `EXISTS (SELECT 1 FROM t i WHERE i.k = outer.k)` becomes
/// `outer.k IN (SELECT k FROM t)`.
fn exists_to_semijoin(query: &str) -> Option<String> {
    let captures = exists_pattern().captures(query)?;
    let table = &captures[1];
    let inner_alias = captures[2].to_lowercase();

    // Work out which side of the correlation belongs to the inner table.
    let (left_alias, left_col) = (captures[3].to_lowercase(), &captures[4]);
    let (right_alias, right_col) = (captures[5].to_lowercase(), &captures[6]);
    let (inner_col, outer_alias, outer_col) = if left_alias == inner_alias {
        (left_col, right_alias, right_col)
    } else if right_alias == inner_alias {
        (right_col, left_alias, left_col)
    } else {
        return None;
    };

    let replacement = format!("{outer_alias}.{outer_col} IN (SELECT {inner_col} FROM {table})");
    Some(
        exists_pattern()
            .replace(query, NoExpand(replacement.as_str()))
            .into_owned(),
    )
}

fn large_in_to_values(query: &str) -> Option<String> {
    let captures = in_list_pattern().captures(query)?;
    let list = captures.get(1)?.as_str();
    if list.to_lowercase().contains("select") || list.to_lowercase().contains("values") {
        return None;
    }
    let items: Vec<&str> = list.split(',').map(str::trim).filter(|i| !i.is_empty()).collect();
    if items.len() <= LARGE_IN_THRESHOLD {
        return None;
    }

    let values = items
        .iter()
        .map(|item| format!("({item})"))
        .collect::<Vec<_>>()
        .join(", ");
    let replacement = format!("IN (VALUES {values})");
    Some(
        in_list_pattern()
            .replace(query, NoExpand(replacement.as_str()))
            .into_owned(),
    )
}

/// An identical simple subquery appearing more than once is hoisted into a
/// leading CTE and referenced by name.
fn repeated_subquery_to_cte(query: &str) -> Option<String> {
    if query.trim_start().to_lowercase().starts_with("with") {
        return None;
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for matched in simple_subquery_pattern().find_iter(query) {
        *counts.entry(matched.as_str().to_string()).or_default() += 1;
    }
    let (subquery, _) = counts.into_iter().find(|(_, count)| *count > 1)?;

    let body = subquery[1..subquery.len() - 1].trim();
    let rewritten = format!(
        "WITH common_subquery AS ({body}) {}",
        query.replace(&subquery, "(SELECT * FROM common_subquery)")
    );
    Some(rewritten)
}

/// `(SELECT count(*) FROM t) AS total` in a query selecting from the same
/// table becomes `count(*) OVER () AS total`.
fn scalar_count_to_window(query: &str) -> Option<String> {
    let captures = count_subquery_pattern().captures(query)?;
    let table = captures[1].to_lowercase();
    let alias = &captures[2];

    let from_same_table = Regex::new(&format!(r"(?i)\bFROM\s+{table}\b"))
        .ok()?
        .find_iter(query)
        .count()
        > 1;
    if !from_same_table {
        return None;
    }

    let replacement = format!("count(*) OVER () AS {alias}");
    Some(
        count_subquery_pattern()
            .replace(query, NoExpand(replacement.as_str()))
            .into_owned(),
    )
}

/// `FROM (SELECT * FROM t) s WHERE s.col = x` becomes
/// `FROM (SELECT * FROM t WHERE col = x) s`.
fn predicate_pushdown(query: &str) -> Option<String> {
    let captures = pushdown_pattern().captures(query)?;
    let table = &captures[1];
    let alias = captures[2].to_lowercase();
    let qualifier = captures[3].to_lowercase();
    let column = &captures[4];
    let op = &captures[5];
    let literal = &captures[6];
    if qualifier != alias {
        return None;
    }

    let replacement =
        format!("FROM (SELECT * FROM {table} WHERE {column} {op} {literal}) {alias} WHERE true");
    Some(
        pushdown_pattern()
            .replace(query, NoExpand(replacement.as_str()))
            .into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists_rewrite() {
        let query = "SELECT t.name FROM teams t WHERE EXISTS (SELECT 1 FROM activities a WHERE a.team_id = t.id)";
        let rewrite = rewrite_query(query).unwrap();
        assert!(rewrite.rewritten.contains("t.id IN (SELECT team_id FROM activities)"));
        assert!(!rewrite.rewritten.to_lowercase().contains("exists"));
    }

    #[test]
    fn test_small_in_list_untouched() {
        let query = "SELECT * FROM teams WHERE id IN (1, 2, 3)";
        assert!(rewrite_query(query).is_none());
    }

    #[test]
    fn test_large_in_list_becomes_values() {
        let query =
            "SELECT * FROM teams WHERE id IN (1,2,3,4,5,6,7,8,9,10,11,12)";
        let rewrite = rewrite_query(query).unwrap();
        assert!(rewrite.rewritten.contains("IN (VALUES (1), (2)"));
    }

    #[test]
    fn test_in_subquery_untouched() {
        let query = "SELECT * FROM teams WHERE id IN (SELECT team_id FROM goals)";
        assert!(rewrite_query(query).is_none());
    }

    #[test]
    fn test_repeated_subquery_hoisted() {
        let query = "SELECT (SELECT max(score) FROM leaderboards) AS a, \
                     (SELECT max(score) FROM leaderboards) AS b FROM teams";
        let rewrite = rewrite_query(query).unwrap();
        assert!(rewrite.rewritten.starts_with("WITH common_subquery AS"));
        assert!(rewrite.rewritten.matches("common_subquery").count() >= 3);
    }

    #[test]
    fn test_scalar_count_to_window() {
        let query =
            "SELECT name, (SELECT count(*) FROM activities) AS total FROM activities WHERE kind = 'run'";
        let rewrite = rewrite_query(query).unwrap();
        assert!(rewrite.rewritten.contains("count(*) OVER () AS total"));
    }

    #[test]
    fn test_scalar_count_on_other_table_untouched() {
        let query = "SELECT name, (SELECT count(*) FROM goals) AS total FROM activities";
        assert!(rewrite_query(query).is_none());
    }

    #[test]
    fn test_predicate_pushdown() {
        let query = "SELECT * FROM (SELECT * FROM activities) recent WHERE recent.team_id = 42";
        let rewrite = rewrite_query(query).unwrap();
        assert!(rewrite
            .rewritten
            .contains("(SELECT * FROM activities WHERE team_id = 42) recent"));
    }

    #[test]
    fn test_plain_query_returns_none() {
        assert!(rewrite_query("SELECT id, name FROM teams WHERE id = $1").is_none());
    }
}
