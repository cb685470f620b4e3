// Single-outstanding-command gate
//
// A receive event arms the gate; the tick that consumes it decodes and dispatches
// once and clears it, whether or not the decode succeeded. The receive buffer is
// left untouched, so an idle gate is the only thing keeping stale bytes from
// being dispatched again.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Idle,
    Pending,
}

#[derive(Debug, Default)]
pub struct JobGate {
    state: GateState,
}

impl JobGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Pending on receipt of a new frame
    pub fn arm(&mut self) {
        self.state = GateState::Pending;
    }

    /// Pending -> Idle after a decode attempt
    pub fn clear(&mut self) {
        self.state = GateState::Idle;
    }

    pub fn is_pending(&self) -> bool {
        self.state == GateState::Pending
    }

    pub fn state(&self) -> GateState {
        self.state
    }
}
