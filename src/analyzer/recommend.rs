//! Recursive plan-tree classification into optimization recommendations.

use super::plan::PlanNode;
use super::{OptimizationRecommendation, RecommendationCategory, Severity};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Relations producing at least this many rows count as large.
pub(crate) const LARGE_SCAN_ROWS: u64 = 1000;

/// Actual/planned row ratio outside [1/MISESTIMATE_FACTOR, MISESTIMATE_FACTOR]
/// indicates stale statistics.
const MISESTIMATE_FACTOR: f64 = 10.0;

fn date_predicate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(_at\b|_date\b|_time\b|\bdate\b|date_trunc|::date|::timestamp)",
        )
        .expect("static pattern")
    })
}

/// Walk the tree and emit index/rewrite/partition/statistics
/// recommendations. Advisory only; duplicates per (category, relation)
/// are collapsed.
pub fn generate_recommendations(root: &PlanNode) -> Vec<OptimizationRecommendation> {
    let mut recommendations = Vec::new();
    let mut seen: HashSet<(RecommendationCategory, String)> = HashSet::new();

    let mut aggregate_count = 0usize;
    let mut misestimated = false;

    let mut nodes = Vec::new();
    root.walk(&mut |node| nodes.push(node));

    for node in &nodes {
        if node.is_aggregate() {
            aggregate_count += 1;
        }

        if node.node_type == "Seq Scan" && node.actual_rows >= LARGE_SCAN_ROWS {
            let relation = node.relation_name.clone().unwrap_or_default();
            if seen.insert((RecommendationCategory::Index, relation.clone())) {
                recommendations.push(OptimizationRecommendation {
                    category: RecommendationCategory::Index,
                    severity: Severity::High,
                    description: format!(
                        "Sequential scan over {} produced {} rows{}",
                        display_relation(&relation),
                        node.actual_rows,
                        node.filter
                            .as_ref()
                            .map(|f| format!(" with filter {f}"))
                            .unwrap_or_default()
                    ),
                    estimated_improvement: "50-90% reduction in scan time".to_string(),
                    implementation_steps: vec![
                        format!(
                            "Identify the filter columns used against {}",
                            display_relation(&relation)
                        ),
                        "Create a B-tree index covering those columns".to_string(),
                        "Re-run the query and confirm an index scan in the plan".to_string(),
                    ],
                });
            }
        }

        if node.is_join() && !node.uses_index() {
            let relation = join_relations(node);
            if seen.insert((RecommendationCategory::Index, relation.clone())) {
                recommendations.push(OptimizationRecommendation {
                    category: RecommendationCategory::Index,
                    severity: Severity::High,
                    description: format!(
                        "{} over {} runs without an associated index",
                        node.node_type,
                        display_relation(&relation)
                    ),
                    estimated_improvement: "An indexed join avoids repeated full scans"
                        .to_string(),
                    implementation_steps: vec![
                        "Index the join key on the inner relation".to_string(),
                        "Verify the planner switches to an indexed join".to_string(),
                    ],
                });
            }
        }

        let looks_dated = node
            .filter
            .as_deref()
            .or(node.index_cond.as_deref())
            .map(|cond| date_predicate_pattern().is_match(cond))
            .unwrap_or(false);
        if looks_dated && node.actual_rows.max(node.plan_rows) >= LARGE_SCAN_ROWS {
            let relation = node.relation_name.clone().unwrap_or_default();
            if seen.insert((RecommendationCategory::Partition, relation.clone())) {
                recommendations.push(OptimizationRecommendation {
                    category: RecommendationCategory::Partition,
                    severity: Severity::Medium,
                    description: format!(
                        "Date-range predicate against large relation {}",
                        display_relation(&relation)
                    ),
                    estimated_improvement: "Partition pruning reads only the touched months"
                        .to_string(),
                    implementation_steps: vec![
                        format!(
                            "Partition {} by month on the date column",
                            display_relation(&relation)
                        ),
                        "Migrate historical rows into the partitions".to_string(),
                    ],
                });
            }
        }

        if node.plan_rows > 0 && node.actual_rows > 0 {
            let ratio = node.actual_rows as f64 / node.plan_rows as f64;
            if !(1.0 / MISESTIMATE_FACTOR..=MISESTIMATE_FACTOR).contains(&ratio) {
                misestimated = true;
            }
        }
    }

    if aggregate_count > 1 {
        recommendations.push(OptimizationRecommendation {
            category: RecommendationCategory::Rewrite,
            severity: Severity::Medium,
            description: format!(
                "Plan contains {aggregate_count} aggregation steps; a window function may consolidate them"
            ),
            estimated_improvement: "One pass over the data instead of several".to_string(),
            implementation_steps: vec![
                "Replace per-group subquery aggregates with aggregates OVER ()".to_string(),
                "Compare plans before and after the rewrite".to_string(),
            ],
        });
    }

    if misestimated {
        recommendations.push(OptimizationRecommendation {
            category: RecommendationCategory::Statistics,
            severity: Severity::Low,
            description:
                "Planned and actual row counts diverge by more than 10x; statistics look stale"
                    .to_string(),
            estimated_improvement: "Accurate estimates let the planner pick better plans"
                .to_string(),
            implementation_steps: vec![
                "Run ANALYZE on the affected tables".to_string(),
                "Consider raising the statistics target for skewed columns".to_string(),
            ],
        });
    }

    recommendations
}

fn display_relation(relation: &str) -> String {
    if relation.is_empty() {
        "the relation".to_string()
    } else {
        relation.to_string()
    }
}

/// Relations touched beneath a join node, comma-joined for reporting.
fn join_relations(node: &PlanNode) -> String {
    let mut relations = Vec::new();
    node.walk(&mut |n| {
        if let Some(relation) = &n.relation_name {
            if !relations.contains(relation) {
                relations.push(relation.clone());
            }
        }
    });
    relations.join(", ")
}
