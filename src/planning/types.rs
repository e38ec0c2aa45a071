// Plan types — PlanStep, StepKind and the keyword fallback classifier

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a step is executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Generate/patch application code
    Code,
    /// Generate and run SQL against the project backend
    Sql,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Code => "code",
            StepKind::Sql => "sql",
        }
    }

    /// Keyword heuristic used when the oracle did not tag a step.
    ///
    /// Known gap: steps like "Add user authentication" that need storage but
    /// name no storage keyword are classified as code.
    pub fn infer(description: &str) -> Self {
        if SQL_KEYWORDS.is_match(description) || CREATE_PREFIX.is_match(description) {
            StepKind::Sql
        } else {
            StepKind::Code
        }
    }
}

static SQL_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(sql|database|tables?|schemas?)\b").expect("valid regex"));

static CREATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*create\s").expect("valid regex"));

/// One unit of plan execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    pub description: String,
    pub kind: StepKind,
}

impl PlanStep {
    pub fn new(description: impl Into<String>, kind: StepKind) -> Self {
        Self {
            description: description.into(),
            kind,
        }
    }

    /// Step whose kind comes from the keyword heuristic
    pub fn inferred(description: impl Into<String>) -> Self {
        let description = description.into();
        let kind = StepKind::infer(&description);
        Self { description, kind }
    }

    pub fn is_sql(&self) -> bool {
        self.kind == StepKind::Sql
    }
}

/// Plan used when the oracle's plan cannot be read
pub fn fallback_plan() -> Vec<PlanStep> {
    vec![
        PlanStep::new("Analyze request", StepKind::Code),
        PlanStep::new("Implement changes", StepKind::Code),
    ]
}

/// Whether any step needs a backend
pub fn requires_backend(plan: &[PlanStep]) -> bool {
    plan.iter().any(PlanStep::is_sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_sql_keywords() {
        assert_eq!(StepKind::infer("SQL: create submissions table"), StepKind::Sql);
        assert_eq!(StepKind::infer("Add a Database migration"), StepKind::Sql);
        assert_eq!(StepKind::infer("Define the schema for posts"), StepKind::Sql);
        assert_eq!(StepKind::infer("create the users store"), StepKind::Sql);
    }

    #[test]
    fn test_infer_code_steps() {
        assert_eq!(StepKind::infer("Add contact form"), StepKind::Code);
        assert_eq!(StepKind::infer("Style header"), StepKind::Code);
        // word boundaries: "editable" is not "table"
        assert_eq!(StepKind::infer("Make the title editable"), StepKind::Code);
    }

    #[test]
    fn test_infer_misses_implicit_storage() {
        assert_eq!(StepKind::infer("Add user authentication"), StepKind::Code);
    }

    #[test]
    fn test_fallback_plan_is_two_code_steps() {
        let plan = fallback_plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].description, "Analyze request");
        assert!(!requires_backend(&plan));
    }

    #[test]
    fn test_step_kind_serializes_lowercase() {
        let step = PlanStep::new("x", StepKind::Sql);
        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(json, r#"{"description":"x","kind":"sql"}"#);
    }
}
