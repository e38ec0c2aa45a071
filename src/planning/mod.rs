// Build planning
//
// The compiler asks the oracle for an ordered list of typed steps, and the
// gate refuses plans that need a database the project does not have.

pub mod compiler;
pub mod gate;
pub mod types;

pub use compiler::{PlanCompiler, PlanError, PlanInput};
pub use gate::{provisioning_redirect_message, GateDecision};
pub use types::{fallback_plan, requires_backend, PlanStep, StepKind};
