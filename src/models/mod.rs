//! Domain models shared across the runner
//!
//! Entities owned by the store (instances, databases, tasks, projects,
//! principals, issues) and the migration-history descriptors handed to drivers.

pub mod database;
pub mod instance;
pub mod migration;
pub mod project;
pub mod task;

// Re-export commonly used types
pub use database::*;
pub use instance::*;
pub use migration::*;
pub use project::*;
pub use task::*;
