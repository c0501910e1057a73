pub mod cancel;
pub mod command;
pub mod error;
pub mod phase;
pub mod readiness;
pub mod seed;
pub mod steps;

// Configuration
pub mod config;

// Database layer
pub mod db;

// Wiring
pub mod orchestrator;
pub mod plan;

pub use cancel::{CancelToken, Cancellation};
pub use config::{Config, HandoffMode, LogFormat};
pub use error::{exit_code, BootstrapError, SeedError};
pub use orchestrator::{run_bootstrap, Orchestrator, ServerHandoff};
pub use phase::{BootstrapPhase, PhaseTracker, PhaseWatch};
pub use steps::{BootstrapResult, FailurePolicy, ProvisioningStep, StepStatus};
