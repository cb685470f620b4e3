// Actuation worker
//
// Motions can take seconds. They run on a blocking worker fed through a bounded
// queue so the control loop keeps sampling the safety lines, reading input and
// refreshing the display while the motor turns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Motor, MotorAction, MoveOutcome, perform};
use crate::safety::SafetySignals;

/// What the worker is doing right now
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Idle = 0,
    Moving = 1,
    Homing = 2,
    Ramping = 3,
    PowerCycling = 4,
}

impl MotorState {
    fn of(action: &MotorAction) -> Self {
        match action {
            MotorAction::Drive(_) => MotorState::Moving,
            MotorAction::Home(_) => MotorState::Homing,
            MotorAction::Ramp { .. } => MotorState::Ramping,
            MotorAction::PowerCycle => MotorState::PowerCycling,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => MotorState::Moving,
            2 => MotorState::Homing,
            3 => MotorState::Ramping,
            4 => MotorState::PowerCycling,
            _ => MotorState::Idle,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Actuator busy, dropped {0:?}")]
    Busy(MotorAction),

    #[error("Actuation worker stopped, dropped {0:?}")]
    Stopped(MotorAction),
}

/// Where the control loop sends dispatched actions
pub trait Actuator {
    /// Hand over an action without blocking
    fn submit(&mut self, action: MotorAction) -> Result<(), SubmitError>;

    fn state(&self) -> MotorState;
}

/// Sending side of the actuation worker
pub struct ActuatorHandle {
    tx: mpsc::Sender<MotorAction>,
    state: Arc<AtomicU8>,
}

impl ActuatorHandle {
    /// Start the worker. It owns the motor until every handle is dropped, then
    /// hands it back through the join handle.
    pub fn spawn<M>(motor: M, safety: SafetySignals, depth: usize) -> (Self, JoinHandle<M>)
    where
        M: Motor + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let state = Arc::new(AtomicU8::new(MotorState::Idle as u8));
        let worker_state = state.clone();

        let worker =
            tokio::task::spawn_blocking(move || run_worker(motor, rx, safety, worker_state));

        (Self { tx, state }, worker)
    }
}

impl Actuator for ActuatorHandle {
    fn submit(&mut self, action: MotorAction) -> Result<(), SubmitError> {
        self.tx.try_send(action).map_err(|e| match e {
            TrySendError::Full(action) => SubmitError::Busy(action),
            TrySendError::Closed(action) => SubmitError::Stopped(action),
        })
    }

    fn state(&self) -> MotorState {
        MotorState::from_raw(self.state.load(Ordering::Acquire))
    }
}

fn run_worker<M: Motor>(
    mut motor: M,
    mut rx: mpsc::Receiver<MotorAction>,
    safety: SafetySignals,
    state: Arc<AtomicU8>,
) -> M {
    info!("Actuation worker started");

    while let Some(action) = rx.blocking_recv() {
        state.store(MotorState::of(&action) as u8, Ordering::Release);
        debug!("Executing {:?}", action);

        match perform(&mut motor, &action, &safety) {
            Ok(Some(MoveOutcome::Stopped { steps, reason })) => {
                warn!("{:?} stopped after {} steps: {:?}", action, steps, reason);
            }
            Ok(Some(outcome)) => debug!("{:?} finished: {:?}", action, outcome),
            Ok(None) => debug!("{:?} finished", action),
            Err(e) => error!("{:?} failed: {}", action, e),
        }

        state.store(MotorState::Idle as u8, Ordering::Release);
    }

    info!("Actuation worker stopped");
    motor
}
