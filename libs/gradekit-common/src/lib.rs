pub mod types;
pub mod redis;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{Exec, Job, Results, RunData, RunReport, RunStatus, Score};
pub use config::{Config, RunnerKind};
