//! Composes the readiness gate, the step plan and the server handoff into one
//! forward-only run.
//!
//! AWAITING_DEPENDENCY -> PROVISIONING -> READY, or FAILED from either of the
//! first two. A run never retries itself; restarting the whole bootstrap is
//! the outer supervisor's job, and re-running converges because every step
//! is idempotent.

use crate::cancel::CancelToken;
use crate::command::ManageCommand;
use crate::config::Config;
use crate::db::{lazy_pool, PgReadinessProbe, PgSeedStore};
use crate::error::BootstrapError;
use crate::phase::{BootstrapPhase, PhaseTracker};
use crate::plan::{provisioning_steps, PlanDeps};
use crate::readiness::{await_ready, ReadinessProbe, ReadinessTarget};
use crate::steps::{BootstrapResult, ProvisioningStep, StepRunner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Starts the long-running server once provisioning reached READY.
#[async_trait]
pub trait ServerHandoff: Send + Sync {
    /// Returns the process exit code. Implementations that replace the
    /// current process only return on failure.
    async fn hand_off(&self, cancel: &CancelToken) -> i32;
}

pub struct Orchestrator {
    target: ReadinessTarget,
    probe: Arc<dyn ReadinessProbe>,
    steps: Vec<ProvisioningStep>,
    phase: PhaseTracker,
}

impl Orchestrator {
    pub fn new(target: ReadinessTarget, probe: Arc<dyn ReadinessProbe>, steps: Vec<ProvisioningStep>) -> Self {
        Self {
            target,
            probe,
            steps,
            phase: PhaseTracker::new(),
        }
    }

    /// Production wiring: Postgres probe, Postgres seed store, management
    /// commands from `config.steps.manage_command`.
    pub fn from_config(config: &Config) -> Result<Self, BootstrapError> {
        let pool = lazy_pool(config)?;
        let manage = ManageCommand::parse(&config.steps.manage_command, config.command_timeout())
            .map_err(|e| BootstrapError::Config(format!("{:#}", e)))?;
        let seed_store = Arc::new(PgSeedStore::new(pool.clone(), manage.clone()));
        let steps = provisioning_steps(
            config,
            PlanDeps {
                pool,
                manage,
                seed_store,
            },
        );
        let probe = Arc::new(PgReadinessProbe::new(config.connect_options()?));
        Ok(Self::new(ReadinessTarget::from_config(config), probe, steps))
    }

    pub fn phase(&self) -> &PhaseTracker {
        &self.phase
    }

    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    /// Gate on readiness, then run every step. The phase ends at READY or
    /// FAILED.
    pub async fn provision(&self, cancel: &CancelToken) -> BootstrapResult {
        let mut result = BootstrapResult::new();
        let started = Instant::now();
        info!(run_id = %result.run_id, phase = %self.phase.current(), "🚀 bootstrap starting");

        if let Err(e) = await_ready(&self.target, self.probe.as_ref(), cancel).await {
            error!(run_id = %result.run_id, "❌ readiness gate failed: {}", e);
            self.phase.advance(BootstrapPhase::Failed);
            result.fatal_failure = Some(e);
            return result;
        }

        self.phase.advance(BootstrapPhase::Provisioning);
        StepRunner::new(cancel.clone())
            .run_into(&self.steps, &mut result)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if result.is_success() {
            self.phase.advance(BootstrapPhase::Ready);
            info!(run_id = %result.run_id, elapsed_ms, "✅ bootstrap READY");
        } else {
            self.phase.advance(BootstrapPhase::Failed);
            error!(run_id = %result.run_id, elapsed_ms, "❌ bootstrap FAILED, server will not start");
        }
        result
    }
}

/// Provision, then hand off to the server on success. Returns the exit code
/// for the process.
pub async fn run_bootstrap(orchestrator: &Orchestrator, handoff: &dyn ServerHandoff, cancel: &CancelToken) -> i32 {
    let result = orchestrator.provision(cancel).await;

    for outcome in &result.completed_steps {
        info!(
            run_id = %result.run_id,
            step = %outcome.name,
            marker = outcome.status.marker(),
            "summary"
        );
    }

    match &result.fatal_failure {
        Some(e) => {
            let code = e.exit_code();
            error!(run_id = %result.run_id, exit_code = code, "{}", e);
            code
        }
        None => {
            info!(run_id = %result.run_id, "handing off to server");
            handoff.hand_off(cancel).await
        }
    }
}
