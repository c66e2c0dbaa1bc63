//! Execution plan tree parsing from `EXPLAIN (FORMAT JSON)` output.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of an execution plan. Transient: produced per analysis call,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub node_type: String,
    pub relation_name: Option<String>,
    pub index_name: Option<String>,
    pub filter: Option<String>,
    pub index_cond: Option<String>,
    pub total_cost: f64,
    /// Planner's row estimate
    pub plan_rows: u64,
    /// Rows actually produced
    pub actual_rows: u64,
    pub actual_loops: u64,
    pub actual_total_time_ms: f64,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn from_json(plan: &Value) -> Result<Self, AnalysisError> {
        let obj = plan
            .as_object()
            .ok_or_else(|| AnalysisError::PlanParse("plan node is not an object".to_string()))?;

        let children = obj
            .get("Plans")
            .and_then(Value::as_array)
            .map(|plans| {
                plans
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            node_type: obj
                .get("Node Type")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            relation_name: obj
                .get("Relation Name")
                .and_then(Value::as_str)
                .map(str::to_string),
            index_name: obj
                .get("Index Name")
                .and_then(Value::as_str)
                .map(str::to_string),
            filter: obj.get("Filter").and_then(Value::as_str).map(str::to_string),
            index_cond: obj
                .get("Index Cond")
                .and_then(Value::as_str)
                .map(str::to_string),
            total_cost: obj.get("Total Cost").and_then(Value::as_f64).unwrap_or(0.0),
            plan_rows: obj.get("Plan Rows").and_then(Value::as_u64).unwrap_or(0),
            actual_rows: obj.get("Actual Rows").and_then(Value::as_u64).unwrap_or(0),
            actual_loops: obj.get("Actual Loops").and_then(Value::as_u64).unwrap_or(1),
            actual_total_time_ms: obj
                .get("Actual Total Time")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            children,
        })
    }

    /// Depth-first walk over the tree, self included.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a PlanNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// True when this subtree reaches the relation through any index.
    pub fn uses_index(&self) -> bool {
        if matches!(
            self.node_type.as_str(),
            "Index Scan" | "Index Only Scan" | "Bitmap Index Scan"
        ) {
            return true;
        }
        self.children.iter().any(PlanNode::uses_index)
    }

    pub fn is_join(&self) -> bool {
        matches!(
            self.node_type.as_str(),
            "Nested Loop" | "Hash Join" | "Merge Join"
        )
    }

    pub fn is_aggregate(&self) -> bool {
        self.node_type.contains("Aggregate")
    }
}

/// Parsed top-level EXPLAIN output: the plan tree plus timing annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPlan {
    pub root: PlanNode,
    pub execution_time_ms: f64,
    pub planning_time_ms: f64,
}

/// Parse the `QUERY PLAN` value returned by
/// `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)`.
pub fn parse_explain_output(value: &Value) -> Result<ParsedPlan, AnalysisError> {
    let entry = match value {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| AnalysisError::PlanParse("empty EXPLAIN output".to_string()))?,
        other => other,
    };

    let obj = entry
        .as_object()
        .ok_or_else(|| AnalysisError::PlanParse("EXPLAIN output is not an object".to_string()))?;

    let plan = obj
        .get("Plan")
        .ok_or_else(|| AnalysisError::PlanParse("EXPLAIN output has no Plan".to_string()))?;

    Ok(ParsedPlan {
        root: PlanNode::from_json(plan)?,
        execution_time_ms: obj
            .get("Execution Time")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        planning_time_ms: obj
            .get("Planning Time")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> Value {
        json!([{
            "Plan": {
                "Node Type": "Hash Join",
                "Total Cost": 250.5,
                "Plan Rows": 100,
                "Actual Rows": 95,
                "Actual Loops": 1,
                "Plans": [
                    {
                        "Node Type": "Seq Scan",
                        "Relation Name": "activities",
                        "Total Cost": 155.0,
                        "Plan Rows": 5000,
                        "Actual Rows": 4800,
                        "Actual Loops": 1,
                        "Filter": "(team_id = 7)"
                    },
                    {
                        "Node Type": "Index Scan",
                        "Relation Name": "teams",
                        "Index Name": "teams_pkey",
                        "Total Cost": 8.3,
                        "Plan Rows": 1,
                        "Actual Rows": 1,
                        "Actual Loops": 1
                    }
                ]
            },
            "Planning Time": 0.42,
            "Execution Time": 12.9
        }])
    }

    #[test]
    fn test_parse_explain_output_builds_tree() {
        let parsed = parse_explain_output(&sample_plan()).unwrap();
        assert_eq!(parsed.root.node_type, "Hash Join");
        assert_eq!(parsed.root.children.len(), 2);
        assert_eq!(parsed.execution_time_ms, 12.9);

        let scan = &parsed.root.children[0];
        assert_eq!(scan.relation_name.as_deref(), Some("activities"));
        assert_eq!(scan.actual_rows, 4800);
    }

    #[test]
    fn test_uses_index_looks_through_subtree() {
        let parsed = parse_explain_output(&sample_plan()).unwrap();
        assert!(parsed.root.uses_index());
        assert!(!parsed.root.children[0].uses_index());
    }

    #[test]
    fn test_parse_rejects_malformed_output() {
        assert!(parse_explain_output(&json!([{"no_plan": true}])).is_err());
        assert!(parse_explain_output(&json!("text")).is_err());
    }

    #[test]
    fn test_walk_visits_every_node() {
        let parsed = parse_explain_output(&sample_plan()).unwrap();
        let mut count = 0;
        parsed.root.walk(&mut |_| count += 1);
        assert_eq!(count, 3);
    }
}
