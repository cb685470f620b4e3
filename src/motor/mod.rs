// Motor contract for a single stepper axis
//
// Provides:
// - The operations the dispatcher can trigger (drive, home, ramp, power cycle)
// - An actuation worker that runs them off the control loop
// - A simulated motor for running without a driver attached

pub mod actuator;
pub mod sim;

use crate::safety::SafetySignals;

pub use actuator::{Actuator, ActuatorHandle, MotorState, SubmitError};
pub use sim::SimulatedMotor;

/// Highest microstep code the driver understands (two mode-select pins)
pub const MAX_STEP_MODE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl From<bool> for Direction {
    fn from(forward: bool) -> Self {
        if forward {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

/// Parameters shared by every motion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    /// Pulses to emit; for homing, the maximum search distance
    pub steps: u32,
    /// Pulses per second
    pub speed: u32,
    pub direction: Direction,
    /// Microstepping resolution code
    pub step_mode: u8,
    /// Keep holding torque after the move completes
    pub hold: bool,
}

/// One motor operation, produced by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorAction {
    Drive(MoveRequest),
    Home(MoveRequest),
    Ramp { request: MoveRequest, slope: u32 },
    PowerCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmergencyStop,
    /// Homing travelled the full search distance without reaching the end stop
    SearchExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Completed { steps: u32 },
    Homed { steps: u32 },
    Stopped { steps: u32, reason: StopReason },
}

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Invalid speed {speed}: must be at least one step per second")]
    InvalidSpeed { speed: u32 },

    #[error("Invalid step mode {code}: driver supports 0..={max}", max = MAX_STEP_MODE)]
    InvalidStepMode { code: u8 },
}

/// A stepper driver. Motions block until finished and must watch `safety`
/// while they run.
pub trait Motor {
    /// Move exactly `request.steps` pulses
    fn drive(
        &mut self,
        request: &MoveRequest,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError>;

    /// Drive toward the end stop, at most `request.steps` pulses
    fn home(
        &mut self,
        request: &MoveRequest,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError>;

    /// Like `drive`, easing in and out over `slope` pulses
    fn ramp(
        &mut self,
        request: &MoveRequest,
        slope: u32,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError>;

    /// Disable then re-enable the driver
    fn power_cycle(&mut self) -> Result<(), MotorError>;

    /// Cut driver current
    fn disable(&mut self) -> Result<(), MotorError>;
}

/// Run one action against a motor. Power cycles have no move outcome.
pub fn perform<M: Motor + ?Sized>(
    motor: &mut M,
    action: &MotorAction,
    safety: &SafetySignals,
) -> Result<Option<MoveOutcome>, MotorError> {
    match action {
        MotorAction::Drive(request) => motor.drive(request, safety).map(Some),
        MotorAction::Home(request) => motor.home(request, safety).map(Some),
        MotorAction::Ramp { request, slope } => motor.ramp(request, *slope, safety).map(Some),
        MotorAction::PowerCycle => motor.power_cycle().map(|_| None),
    }
}
