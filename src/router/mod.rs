// Router module
// Public interface for intent routing

mod decision;

pub use decision::{Intent, IntentRouter, RouteDecision};
