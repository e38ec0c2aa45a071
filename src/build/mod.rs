// Build orchestration
//
// `BuildEngine` turns one user instruction into a checkpointed multi-step job.
// `BuildSupervisor` owns the running jobs, one per project.

mod checkpoint;
mod engine;
mod events;
mod executor;
mod prompts;
mod repair;
mod supervisor;

pub use checkpoint::Checkpointer;
pub use engine::{BuildEngine, BuildOutcome, BuildRequest, BuildSettings};
pub use events::{BuildEvent, BuildFailure, BuildObserver, NoopObserver};
pub use executor::{StepExecutor, StepResult};
pub use repair::{RepairOutcome, SelfHealer};
pub use supervisor::{BuildJob, BuildSupervisor};
