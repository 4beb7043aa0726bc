use super::Role;
use tracing::debug;

/// Rendezvous between Source and Sink at the end of a round.
///
/// Each role marks itself ready for a given round. The barrier is released
/// only once both marks for the current round are present; taking the
/// release clears both marks and moves on to the next round.
#[derive(Debug, Default)]
pub struct RestartBarrier {
    round: u32,
    source_ready: bool,
    sink_ready: bool,
}

impl RestartBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round the barrier is currently collecting marks for.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Returns false when the mark is for another round or from Control.
    pub fn arrive(&mut self, role: Role, round: u32) -> bool {
        if round != self.round {
            debug!(%role, round, current = self.round, "ignoring ready mark for other round");
            return false;
        }
        match role {
            Role::Source => self.source_ready = true,
            Role::Sink => self.sink_ready = true,
            Role::Control => return false,
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.source_ready && self.sink_ready
    }

    /// Consumes the release if both marks are present.
    pub fn take_release(&mut self) -> bool {
        if !self.is_released() {
            return false;
        }
        self.source_ready = false;
        self.sink_ready = false;
        self.round += 1;
        true
    }
}
