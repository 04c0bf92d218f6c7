/// Engine status publication
///
/// Last-value broadcast: subscribers see the current value on
/// subscription and the latest value after any burst of changes.
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    WaitingForNetwork,
    Reconnecting,
    ReconnectingNetworkError,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::WaitingForNetwork => "waiting-for-network",
            EngineState::Reconnecting => "reconnecting",
            EngineState::ReconnectingNetworkError => "reconnecting-network-error",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Status {
    pub state: EngineState,
    /// Why the engine stopped, when it stopped abnormally.
    pub reason: Option<String>,
    /// Most recent non-fatal warning; not a state change.
    pub warning: Option<String>,
}

/// Publishes engine state transitions to any number of observers.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: watch::Sender<Status>,
}

impl StatusReporter {
    pub fn new() -> (Self, watch::Receiver<Status>) {
        let (tx, rx) = watch::channel(Status::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.tx.borrow().state
    }

    /// Publish a state change.
    pub fn transition(&self, state: EngineState) {
        info!("Engine state: {} -> {}", self.state(), state);
        self.tx.send_modify(|status| {
            status.state = state;
            status.reason = None;
        });
    }

    /// Publish a state change carrying a reason, e.g. a stop caused by
    /// invalid configuration.
    pub fn transition_with_reason(&self, state: EngineState, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Engine state: {} -> {} ({})", self.state(), state, reason);
        self.tx.send_modify(|status| {
            status.state = state;
            status.reason = Some(reason);
        });
    }

    /// Publish a warning without changing state.
    pub fn warn(&self, warning: impl Into<String>) {
        self.tx.send_modify(|status| {
            status.warning = Some(warning.into());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_current_value() {
        let (reporter, _rx) = StatusReporter::new();
        reporter.transition(EngineState::Running);

        let rx = reporter.subscribe();
        assert_eq!(rx.borrow().state, EngineState::Running);
    }

    #[tokio::test]
    async fn test_changes_are_observed() {
        let (reporter, mut rx) = StatusReporter::new();

        reporter.transition(EngineState::Starting);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, EngineState::Starting);

        reporter.transition(EngineState::Running);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, EngineState::Running);
    }

    #[tokio::test]
    async fn test_slow_subscriber_coalesces_to_latest() {
        let (reporter, mut rx) = StatusReporter::new();

        reporter.transition(EngineState::Starting);
        reporter.transition(EngineState::Running);
        reporter.transition(EngineState::Stopping);
        reporter.transition(EngineState::Stopped);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_warning_keeps_state() {
        let (reporter, rx) = StatusReporter::new();
        reporter.transition(EngineState::Running);
        reporter.warn("block log write failed");

        let status = rx.borrow().clone();
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.warning.as_deref(), Some("block log write failed"));
    }
}
