use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an ingestor.
///
/// Polling ingestors cycle `Idle -> Running -> Stopping -> Idle`; event-driven
/// ones go `Idle -> Running -> Stopped` once and are never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IngestorState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl IngestorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IngestorState::Idle,
            1 => IngestorState::Running,
            2 => IngestorState::Stopping,
            _ => IngestorState::Stopped,
        }
    }
}

impl fmt::Display for IngestorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomically updated state shared between the controlling thread and the worker
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: IngestorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> IngestorState {
        IngestorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: IngestorState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to`; on mismatch returns the actual state.
    pub fn transition(&self, from: IngestorState, to: IngestorState) -> Result<(), IngestorState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(IngestorState::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_checks_current_state() {
        let cell = StateCell::new(IngestorState::Idle);
        assert_eq!(cell.transition(IngestorState::Idle, IngestorState::Running), Ok(()));
        assert_eq!(
            cell.transition(IngestorState::Idle, IngestorState::Running),
            Err(IngestorState::Running)
        );
        cell.set(IngestorState::Stopped);
        assert_eq!(cell.get(), IngestorState::Stopped);
    }
}
