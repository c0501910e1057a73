//! Ordered provisioning steps and the runner that executes them.

use crate::cancel::CancelToken;
use crate::error::BootstrapError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What a failing step does to the rest of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Halt the sequence; the server never starts.
    Fatal,
    /// Record a warning and continue.
    Tolerated,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fatal => write!(f, "fatal"),
            FailurePolicy::Tolerated => write!(f, "tolerated"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(FailurePolicy::Fatal),
            "tolerated" | "tolerate" => Ok(FailurePolicy::Tolerated),
            other => Err(format!(
                "unknown failure policy '{}' (expected fatal or tolerated)",
                other
            )),
        }
    }
}

/// The work a step performs. Returns an optional human-readable detail
/// (e.g. "2 created, 4 already existed") for the step's log line.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self) -> anyhow::Result<Option<String>>;
}

/// Adapter so plain async closures can be used as step actions.
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<Option<String>> {
        (self.0)().await
    }
}

pub struct ProvisioningStep {
    pub name: String,
    pub policy: FailurePolicy,
    pub enabled: bool,
    action: Box<dyn StepAction>,
}

impl ProvisioningStep {
    pub fn new(name: impl Into<String>, policy: FailurePolicy, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            policy,
            enabled: true,
            action: Box::new(action),
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, policy: FailurePolicy, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        Self::new(name, policy, FnAction(f))
    }

    pub fn fatal(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::new(name, FailurePolicy::Fatal, action)
    }

    pub fn tolerated(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::new(name, FailurePolicy::Tolerated, action)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl fmt::Debug for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningStep")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded { detail: Option<String> },
    ToleratedFailure { error: String },
    FatalFailure { error: String },
    Skipped,
}

impl StepStatus {
    pub fn marker(&self) -> &'static str {
        match self {
            StepStatus::Succeeded { .. } => "ok",
            StepStatus::ToleratedFailure { .. } => "tolerated",
            StepStatus::FatalFailure { .. } => "fatal",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub policy: FailurePolicy,
    #[serde(flatten)]
    pub status: StepStatus,
    pub duration: Duration,
}

/// Counts per status, for the final summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub tolerated: usize,
    pub fatal: usize,
    pub skipped: usize,
}

/// The record of one run of the step sequence.
#[derive(Debug)]
pub struct BootstrapResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_steps: Vec<StepOutcome>,
    pub fatal_failure: Option<BootstrapError>,
}

impl BootstrapResult {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_steps: Vec::new(),
            fatal_failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.fatal_failure.is_none()
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.completed_steps.iter().find(|o| o.name == name)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for outcome in &self.completed_steps {
            match outcome.status {
                StepStatus::Succeeded { .. } => summary.succeeded += 1,
                StepStatus::ToleratedFailure { .. } => summary.tolerated += 1,
                StepStatus::FatalFailure { .. } => summary.fatal += 1,
                StepStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

impl Default for BootstrapResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs steps strictly in declared order. Never reorders, never runs two
/// steps at once.
pub struct StepRunner {
    cancel: CancelToken,
}

impl StepRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub async fn run(&self, steps: &[ProvisioningStep]) -> BootstrapResult {
        let mut result = BootstrapResult::new();
        self.run_into(steps, &mut result).await;
        result
    }

    /// Run `steps`, appending outcomes to an existing result.
    pub async fn run_into(&self, steps: &[ProvisioningStep], result: &mut BootstrapResult) {
        let total = steps.len();
        info!(run_id = %result.run_id, steps = total, "starting provisioning");

        for (index, step) in steps.iter().enumerate() {
            let position = format!("{}/{}", index + 1, total);

            // A step already in flight finishes; no new step starts after cancellation.
            if self.cancel.is_cancelled() {
                error!(run_id = %result.run_id, step = %step.name, %position, "cancelled before step, halting");
                result.fatal_failure = Some(BootstrapError::Aborted);
                break;
            }

            if !step.enabled {
                info!(run_id = %result.run_id, step = %step.name, %position, marker = "skipped", "step disabled");
                result.completed_steps.push(StepOutcome {
                    name: step.name.clone(),
                    policy: step.policy,
                    status: StepStatus::Skipped,
                    duration: Duration::ZERO,
                });
                continue;
            }

            info!(run_id = %result.run_id, step = %step.name, %position, policy = %step.policy, "running step");
            let started = Instant::now();
            let outcome = step.action.run().await;
            let duration = started.elapsed();

            match outcome {
                Ok(detail) => {
                    info!(
                        run_id = %result.run_id,
                        step = %step.name,
                        %position,
                        marker = "ok",
                        elapsed_ms = duration.as_millis() as u64,
                        detail = detail.as_deref().unwrap_or(""),
                        "✅ step succeeded"
                    );
                    result.completed_steps.push(StepOutcome {
                        name: step.name.clone(),
                        policy: step.policy,
                        status: StepStatus::Succeeded { detail },
                        duration,
                    });
                }
                Err(e) => match step.policy {
                    FailurePolicy::Tolerated => {
                        warn!(
                            run_id = %result.run_id,
                            step = %step.name,
                            %position,
                            marker = "tolerated",
                            elapsed_ms = duration.as_millis() as u64,
                            "⚠️  step failed, continuing: {:#}",
                            e
                        );
                        result.completed_steps.push(StepOutcome {
                            name: step.name.clone(),
                            policy: step.policy,
                            status: StepStatus::ToleratedFailure {
                                error: format!("{:#}", e),
                            },
                            duration,
                        });
                    }
                    FailurePolicy::Fatal => {
                        error!(
                            run_id = %result.run_id,
                            step = %step.name,
                            %position,
                            marker = "fatal",
                            elapsed_ms = duration.as_millis() as u64,
                            "❌ step failed, halting: {:#}",
                            e
                        );
                        result.completed_steps.push(StepOutcome {
                            name: step.name.clone(),
                            policy: step.policy,
                            status: StepStatus::FatalFailure {
                                error: format!("{:#}", e),
                            },
                            duration,
                        });
                        result.fatal_failure = Some(BootstrapError::StepFatal {
                            step: step.name.clone(),
                            source: e,
                        });
                        break;
                    }
                },
            }
        }

        let summary = result.summary();
        let not_run = total.saturating_sub(result.completed_steps.len());
        if result.is_success() {
            info!(
                run_id = %result.run_id,
                succeeded = summary.succeeded,
                tolerated = summary.tolerated,
                skipped = summary.skipped,
                "provisioning finished"
            );
        } else {
            error!(
                run_id = %result.run_id,
                succeeded = summary.succeeded,
                tolerated = summary.tolerated,
                skipped = summary.skipped,
                not_run,
                "provisioning halted"
            );
        }
    }
}
