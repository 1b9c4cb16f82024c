use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Rebalancing,
}

impl LoopState {
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;

        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Rebalancing)
                | (Running, Stopped)
                | (Rebalancing, Running)
                | (Rebalancing, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Stopped => "stopped",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Rebalancing => "rebalancing",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote control for a consumer running on another task
///
/// Cheap to clone. Shutdown is cooperative: the loop finishes the batch in
/// hand, commits, and leaves the group.
#[derive(Clone)]
pub struct ConsumerHandle {
    state: watch::Receiver<LoopState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConsumerHandle {
    pub(crate) fn new(state: watch::Receiver<LoopState>, shutdown: Arc<watch::Sender<bool>>) -> Self {
        Self { state, shutdown }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Ask the consumer to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until the loop reaches `target`
    ///
    /// Returns false if the consumer was dropped first.
    pub async fn wait_for(&self, target: LoopState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();
        reached
    }
}
