// Decoded command -> motor action
use crate::codec::{Command, DriveMode};
use crate::motor::{MotorAction, MoveRequest};

/// Maps a command's mode to exactly one motor operation.
///
/// Unrecognized modes map to nothing and are not an error; the control loop
/// drops them without logging.
#[derive(Debug, Default)]
pub struct ActionDispatcher;

impl ActionDispatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn dispatch(&self, cmd: &Command) -> Option<MotorAction> {
        let request = MoveRequest {
            steps: cmd.steps,
            speed: cmd.speed,
            direction: cmd.direction.into(),
            step_mode: cmd.step_mode,
            hold: cmd.hold,
        };

        match cmd.mode {
            DriveMode::Steps => Some(MotorAction::Drive(request)),
            DriveMode::Home => Some(MotorAction::Home(request)),
            DriveMode::Ramp => Some(MotorAction::Ramp {
                request,
                slope: cmd.slope,
            }),
            DriveMode::PowerCycle => Some(MotorAction::PowerCycle),
            DriveMode::Unrecognized(_) => None,
        }
    }
}
