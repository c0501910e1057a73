//! Readiness gate: block until a dependency answers a probe.
//!
//! A successful probe is a point-in-time observation. The poller returns on
//! the first success and does not re-verify; a dependency that drops right
//! after answering is caught by the steps that use it, not here.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::BootstrapError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// A dependency that must answer before provisioning starts.
#[derive(Clone)]
pub struct ReadinessTarget {
    pub host: String,
    pub port: u16,
    /// The credential principal the probe authenticates as.
    pub principal: String,
    pub database: String,
    pub poll_interval: Duration,
    pub attempt_timeout: Duration,
    /// `None` waits until success or cancellation.
    pub max_wait: Option<Duration>,
}

impl ReadinessTarget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.database.host.clone(),
            port: config.database.port,
            principal: config.database.username.clone(),
            database: config.database.database.clone(),
            poll_interval: config.poll_interval(),
            attempt_timeout: config.attempt_timeout(),
            max_wait: config.max_wait(),
        }
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.principal, self.host, self.port, self.database)
    }
}

impl fmt::Debug for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessTarget")
            .field("target", &self.to_string())
            .field("poll_interval", &self.poll_interval)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

/// One connectivity check against a target.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, target: &ReadinessTarget) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyReport {
    pub attempts: u32,
    pub waited: Duration,
}

/// Poll `probe` every `target.poll_interval` until it succeeds.
///
/// Fails with [`BootstrapError::Aborted`] when `cancel` fires (observed both
/// mid-probe and mid-sleep) and with [`BootstrapError::DependencyUnreachable`]
/// once `target.max_wait` has elapsed.
pub async fn await_ready(
    target: &ReadinessTarget,
    probe: &dyn ReadinessProbe,
    cancel: &CancelToken,
) -> Result<ReadyReport, BootstrapError> {
    let started = Instant::now();
    let deadline = target.max_wait.map(|max| started + max);
    let mut attempts: u32 = 0;

    info!(target = %target, interval_ms = target.poll_interval.as_millis() as u64, "⏳ waiting for dependency");

    loop {
        if cancel.is_cancelled() {
            return Err(BootstrapError::Aborted);
        }

        attempts += 1;
        // An attempt never runs past the overall deadline.
        let budget = match deadline {
            Some(deadline) => target
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => target.attempt_timeout,
        };
        let attempt = tokio::time::timeout(budget, probe.probe(target));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BootstrapError::Aborted),
            outcome = attempt => outcome,
        };

        let last_error = match outcome {
            Ok(Ok(())) => {
                let waited = started.elapsed();
                info!(target = %target, attempts, waited_ms = waited.as_millis() as u64, "✅ dependency is ready");
                return Ok(ReadyReport { attempts, waited });
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("probe timed out after {:?}", budget),
        };

        let now = Instant::now();
        let waited = now - started;
        if let Some(deadline) = deadline {
            if now >= deadline {
                warn!(target = %target, attempts, "dependency still unreachable, giving up");
                return Err(BootstrapError::DependencyUnreachable {
                    attempts,
                    waited,
                    last_error,
                });
            }
        }

        info!(
            target = %target,
            attempt = attempts,
            waited_ms = waited.as_millis() as u64,
            "dependency unavailable, retrying: {}",
            last_error
        );

        let mut wake = now + target.poll_interval;
        if let Some(deadline) = deadline {
            wake = wake.min(deadline);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BootstrapError::Aborted),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
