//! The bootstrap state machine, observable by the liveness endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapPhase {
    AwaitingDependency,
    Provisioning,
    Ready,
    Failed,
}

impl BootstrapPhase {
    /// Transitions only move forward; `Ready` and `Failed` are terminal.
    pub fn can_advance_to(self, next: BootstrapPhase) -> bool {
        use BootstrapPhase::*;
        matches!(
            (self, next),
            (AwaitingDependency, Provisioning)
                | (AwaitingDependency, Failed)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
        )
    }

    /// Whether a liveness check may report healthy in this phase.
    pub fn is_healthy(self) -> bool {
        self == BootstrapPhase::Ready
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapPhase::AwaitingDependency => "AWAITING_DEPENDENCY",
            BootstrapPhase::Provisioning => "PROVISIONING",
            BootstrapPhase::Ready => "READY",
            BootstrapPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Writer side of the phase. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    tx: Arc<watch::Sender<BootstrapPhase>>,
}

/// Read-only view for observers such as the liveness endpoint.
#[derive(Debug, Clone)]
pub struct PhaseWatch {
    rx: watch::Receiver<BootstrapPhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BootstrapPhase::AwaitingDependency);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> BootstrapPhase {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> PhaseWatch {
        PhaseWatch {
            rx: self.tx.subscribe(),
        }
    }

    /// Move to `next`. Backward or repeated transitions are refused and
    /// leave the phase unchanged.
    pub fn advance(&self, next: BootstrapPhase) -> bool {
        let mut from = None;
        let advanced = self.tx.send_if_modified(|phase| {
            from = Some(*phase);
            if phase.can_advance_to(next) {
                *phase = next;
                true
            } else {
                false
            }
        });

        let from = from.unwrap_or(next);
        if advanced {
            tracing::info!(from = %from, to = %next, "phase transition");
        } else {
            tracing::warn!(from = %from, to = %next, "refused non-forward phase transition");
        }
        advanced
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseWatch {
    pub fn current(&self) -> BootstrapPhase {
        *self.rx.borrow()
    }

    /// Wait until the phase is terminal and return it.
    pub async fn settled(&mut self) -> BootstrapPhase {
        let result = self
            .rx
            .wait_for(|phase| matches!(phase, BootstrapPhase::Ready | BootstrapPhase::Failed))
            .await
            .map(|phase| *phase);
        result.unwrap_or_else(|_| *self.rx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BootstrapPhase::*;

    #[test]
    fn test_forward_path_to_ready() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.current(), AwaitingDependency);
        assert!(tracker.advance(Provisioning));
        assert!(tracker.advance(Ready));
        assert_eq!(tracker.current(), Ready);
    }

    #[test]
    fn test_backward_and_terminal_transitions_refused() {
        let tracker = PhaseTracker::new();
        assert!(tracker.advance(Provisioning));
        assert!(!tracker.advance(AwaitingDependency));
        assert!(tracker.advance(Failed));
        assert!(!tracker.advance(Ready));
        assert!(!tracker.advance(Provisioning));
        assert_eq!(tracker.current(), Failed);
    }

    #[test]
    fn test_cannot_skip_provisioning_to_ready() {
        let tracker = PhaseTracker::new();
        assert!(!tracker.advance(Ready));
        assert_eq!(tracker.current(), AwaitingDependency);
    }

    #[test]
    fn test_only_ready_is_healthy() {
        assert!(Ready.is_healthy());
        for phase in [AwaitingDependency, Provisioning, Failed] {
            assert!(!phase.is_healthy(), "{} must not be healthy", phase);
        }
    }

    #[tokio::test]
    async fn test_watchers_observe_transitions() {
        let tracker = PhaseTracker::new();
        let mut watch = tracker.watch();
        assert_eq!(watch.current(), AwaitingDependency);

        let settled = tokio::spawn(async move { watch.settled().await });
        tracker.advance(Provisioning);
        tracker.advance(Ready);

        assert_eq!(settled.await.unwrap(), Ready);
    }
}
