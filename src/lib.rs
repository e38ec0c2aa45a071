// Appweaver - resumable build orchestration for generated web apps
// Library exports

pub mod backend;
pub mod build;
pub mod config;
pub mod oracle;
pub mod planning;
pub mod project;
pub mod router;
pub mod store;
