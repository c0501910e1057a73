use std::time::Duration;

/// Process exit codes reported by the bootstrap entry point.
pub mod exit_code {
    pub const READY: i32 = 0;
    pub const STEP_FATAL: i32 = 1;
    pub const DEPENDENCY_UNREACHABLE: i32 = 2;
    pub const CONFIG: i32 = 78;
    pub const HANDOFF_FAILED: i32 = 127;
    pub const ABORTED: i32 = 130;
}

/// Errors that end a bootstrap run. Everything here is fatal; tolerated step
/// failures are recorded in [`crate::steps::StepStatus`] instead.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Dependency unreachable after {attempts} attempts ({waited:?}): {last_error}")]
    DependencyUnreachable {
        attempts: u32,
        waited: Duration,
        last_error: String,
    },

    #[error("Bootstrap aborted by cancellation")]
    Aborted,

    #[error("Step '{step}' failed: {source:#}")]
    StepFatal {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BootstrapError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::DependencyUnreachable { .. } => exit_code::DEPENDENCY_UNREACHABLE,
            BootstrapError::Aborted => exit_code::ABORTED,
            BootstrapError::StepFatal { .. } => exit_code::STEP_FATAL,
            BootstrapError::Config(_) => exit_code::CONFIG,
        }
    }
}

/// Failures raised while seeding a single record.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("Seed store error: {0:#}")]
    Store(#[from] anyhow::Error),

    /// The record was absent at check time but the insert found it present.
    /// With a correct store this never happens.
    #[error("Seed conflict on {domain} '{key}': record appeared between existence check and insert")]
    Conflict { domain: &'static str, key: String },
}
