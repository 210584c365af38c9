//! Run state of the processing loop.

use std::fmt;

use tokio::sync::watch;

use crate::protocol::ControlCommand;

/// Lifecycle state of an agent.
///
/// ```text
/// stopped ──run()──► running ◄──resume── paused
///    ▲                  │ └─────pause────►  │
///    └──────stop()──────┴───────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Shared, observable run state.
///
/// Loops hold a receiver and react to transitions without polling.
pub(crate) struct RunControl {
    tx: watch::Sender<RunState>,
}

impl RunControl {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(RunState::Stopped),
        }
    }

    pub(crate) fn current(&self) -> RunState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// `stopped → running`. Returns false if the agent was not stopped.
    pub(crate) fn start(&self) -> bool {
        self.transition(|state| (state == RunState::Stopped).then_some(RunState::Running))
    }

    /// Move to `stopped` from any state. Returns false if already stopped.
    pub(crate) fn stop(&self) -> bool {
        self.transition(|state| (state != RunState::Stopped).then_some(RunState::Stopped))
    }

    /// Apply a control command. Returns whether the state changed.
    ///
    /// Pause and resume are ignored while stopped.
    pub(crate) fn apply(&self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Stop => self.stop(),
            ControlCommand::Pause => {
                self.transition(|state| (state == RunState::Running).then_some(RunState::Paused))
            }
            ControlCommand::Resume => {
                self.transition(|state| (state == RunState::Paused).then_some(RunState::Running))
            }
        }
    }

    fn transition(&self, next: impl FnOnce(RunState) -> Option<RunState>) -> bool {
        self.tx.send_if_modified(|state| match next(*state) {
            Some(new_state) => {
                tracing::debug!(from = %state, to = %new_state, "Run state transition");
                *state = new_state;
                true
            }
            None => false,
        })
    }
}

/// Snapshot of the state a receiver currently sees.
pub(crate) fn observed(rx: &watch::Receiver<RunState>) -> RunState {
    *rx.borrow()
}

/// Resolves once the state becomes `stopped` (immediately if it already is).
pub(crate) async fn stopped(rx: &mut watch::Receiver<RunState>) {
    let _ = rx.wait_for(|state| *state == RunState::Stopped).await;
}
