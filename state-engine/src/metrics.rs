//! Engine runtime metrics.
//!
//! The engine exports metrics on a stable interval through a watch channel.
//! Metrics may be used for observability or to react to engine progress, and
//! the [`Wait`] utility lets callers await a metrics condition with a
//! timeout, which the integration tests lean on heavily.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

/// The target operating state of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Applying entries.
    Running,
    /// Halted, either by request or by a fatal structural error.
    Shutdown,
}

/// A set of metrics describing the current state of the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    /// The configured cluster name.
    pub cluster_name: String,
    /// The engine's target operating state.
    pub state: EngineState,
    /// The highest entry index applied to the state machine.
    pub last_applied: u64,
    /// The highest index whose events every session has acknowledged.
    pub last_completed: u64,
    /// The index of the last finalized snapshot.
    pub snapshot_index: u64,
    /// The number of live sessions.
    pub sessions: u64,
}

impl EngineMetrics {
    pub(crate) fn new_initial(cluster_name: String) -> Self {
        Self {
            cluster_name,
            state: EngineState::Running,
            last_applied: 0,
            last_completed: 0,
            snapshot_index: 0,
            sessions: 0,
        }
    }
}

/// Error variants from waiting for a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when waiting for condition: {1}")]
    Timeout(Duration, String),
    #[error("the engine is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on the metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<EngineMetrics>,
}

impl Wait {
    /// Wait until `func` returns true, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<EngineMetrics, WaitError>
    where T: Fn(&EngineMetrics) -> bool {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            tracing::debug!("wait {:} latest: {:?}", msg.to_string(), latest);

            if func(&latest) {
                return Ok(latest);
            }

            let delay = tokio::time::sleep(self.timeout);
            tokio::select! {
                _ = delay => {
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_applied` to reach `index`, or timeout.
    pub async fn applied(&self, index: u64, msg: impl ToString) -> Result<EngineMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= index,
            format!("{} last_applied >= {}", msg.to_string(), index),
        )
        .await
    }

    /// Wait for `last_completed` to reach `index`, or timeout.
    pub async fn completed(&self, index: u64, msg: impl ToString) -> Result<EngineMetrics, WaitError> {
        self.metrics(
            |m| m.last_completed >= index,
            format!("{} last_completed >= {}", msg.to_string(), index),
        )
        .await
    }

    /// Wait for the snapshot index to reach `index`, or timeout.
    pub async fn snapshot(&self, index: u64, msg: impl ToString) -> Result<EngineMetrics, WaitError> {
        self.metrics(
            |m| m.snapshot_index >= index,
            format!("{} snapshot_index >= {}", msg.to_string(), index),
        )
        .await
    }

    /// Wait for the live session count to equal `want`, or timeout.
    pub async fn sessions(&self, want: u64, msg: impl ToString) -> Result<EngineMetrics, WaitError> {
        self.metrics(|m| m.sessions == want, format!("{} sessions == {}", msg.to_string(), want)).await
    }
}
