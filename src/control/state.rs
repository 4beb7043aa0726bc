use serde::Serialize;
use std::fmt;

/// Lifecycle of the experiment Control is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    Provisioning,
    AwaitingBoot,
    Streaming,
    RestartBarrier,
    Resetting,
    AwaitingCompletion,
    Done,
    Aborted,
    Failed,
}

impl ControlState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControlState::Done | ControlState::Aborted | ControlState::Failed
        )
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Idle => "idle",
            ControlState::Provisioning => "provisioning",
            ControlState::AwaitingBoot => "awaiting_boot",
            ControlState::Streaming => "streaming",
            ControlState::RestartBarrier => "restart_barrier",
            ControlState::Resetting => "resetting",
            ControlState::AwaitingCompletion => "awaiting_completion",
            ControlState::Done => "done",
            ControlState::Aborted => "aborted",
            ControlState::Failed => "failed",
        };
        f.write_str(name)
    }
}
