use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorState {
    #[default]
    Idle,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl SupervisorState {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// States in which the controller owns a backend handle.
    pub fn holds_handle(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Guarded lifecycle transitions.
///
/// Every start attempt gets a fresh epoch. Leaving an attempt (stop or failure)
/// advances the epoch again, so asynchronous work still carrying the old value
/// is recognised as stale and dropped.
#[derive(Debug, Default)]
pub struct SupervisorStateMachine {
    state: SupervisorState,
    epoch: u64,
}

impl SupervisorStateMachine {
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
            && matches!(
                self.state,
                SupervisorState::Starting | SupervisorState::Ready
            )
    }

    /// `Idle -> Starting`. A `Failed` controller is reset to `Idle` first.
    pub fn try_begin_start(&mut self) -> Option<u64> {
        match self.state {
            SupervisorState::Idle => {}
            SupervisorState::Failed => self.state = SupervisorState::Idle,
            _ => return None,
        }
        self.epoch += 1;
        self.state = SupervisorState::Starting;
        Some(self.epoch)
    }

    pub fn mark_ready(&mut self, epoch: u64) -> bool {
        if self.state == SupervisorState::Starting && self.epoch == epoch {
            self.state = SupervisorState::Ready;
            return true;
        }
        false
    }

    pub fn mark_failed(&mut self, epoch: u64) -> bool {
        if self.is_current(epoch) {
            self.epoch += 1;
            self.state = SupervisorState::Failed;
            return true;
        }
        false
    }

    pub fn try_begin_stop(&mut self) -> bool {
        if matches!(self.state, SupervisorState::Starting | SupervisorState::Ready) {
            self.epoch += 1;
            self.state = SupervisorState::Stopping;
            return true;
        }
        false
    }

    pub fn finish_stop(&mut self) {
        if self.state == SupervisorState::Stopping {
            self.state = SupervisorState::Idle;
        }
    }

    pub fn reset_failed(&mut self) -> bool {
        if self.state == SupervisorState::Failed {
            self.state = SupervisorState::Idle;
            return true;
        }
        false
    }
}
