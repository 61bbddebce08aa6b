pub mod config;
pub mod engine;
pub mod error;

pub use config::BackupConfig;
pub use engine::job::{BackupJob, StepOutcome};
pub use error::{BackupError, Result};
