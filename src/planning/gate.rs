// Database gate — halts a plan that needs a backend the project does not have

use super::types::{requires_backend, PlanStep};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// The plan has SQL steps and no backend is active
    BackendRequired { sql_steps: Vec<String> },
}

pub fn check(plan: &[PlanStep], backend_active: bool) -> GateDecision {
    if backend_active || !requires_backend(plan) {
        return GateDecision::Proceed;
    }

    let sql_steps = plan
        .iter()
        .filter(|step| step.is_sql())
        .map(|step| step.description.clone())
        .collect();
    GateDecision::BackendRequired { sql_steps }
}

/// Message recorded instead of the plan when the gate halts a build
pub fn provisioning_redirect_message() -> &'static str {
    "This request needs a database to store data. Connect or create a backend \
     for this project, then send your request again."
}
