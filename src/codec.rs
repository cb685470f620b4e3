// Inbound command record: JSON over serial or UDP -> Command
//
// Wire record: {"mode":0,"steps":200,"speed":500,"slope":0,"direction":true,"stepMode":1,"hold":false}

use serde::Deserialize;
use serde_json::Value;

use crate::config::BUFFER_SIZE;

/// Which motor action a command triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Steps,
    Home,
    Ramp,
    PowerCycle,
    /// Any other mode code; dispatches nothing
    Unrecognized(i64),
}

impl DriveMode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DriveMode::Steps,
            1 => DriveMode::Home,
            2 => DriveMode::Ramp,
            3 => DriveMode::PowerCycle,
            other => DriveMode::Unrecognized(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            DriveMode::Steps => 0,
            DriveMode::Home => 1,
            DriveMode::Ramp => 2,
            DriveMode::PowerCycle => 3,
            DriveMode::Unrecognized(code) => *code,
        }
    }

    /// Whether the motion fields carry meaning for this mode
    fn uses_motion_fields(&self) -> bool {
        matches!(self, DriveMode::Steps | DriveMode::Home | DriveMode::Ramp)
    }
}

/// A decoded command. Motion fields are zeroed for modes that ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub mode: DriveMode,
    pub steps: u32,
    pub speed: u32,
    pub slope: u32,
    pub direction: bool,
    pub step_mode: u8,
    pub hold: bool,
}

impl Command {
    fn bare(mode: DriveMode) -> Self {
        Self {
            mode,
            steps: 0,
            speed: 0,
            slope: 0,
            direction: false,
            step_mode: 0,
            hold: false,
        }
    }
}

/// Raw record as it appears on the wire. Every field is required; motion
/// fields are type-checked only once the mode is known.
#[derive(Debug, Deserialize)]
struct WireCommand {
    #[serde(alias = "drivemode")]
    mode: i64,
    steps: Value,
    speed: Value,
    slope: Value,
    direction: Value,
    #[serde(rename = "stepMode", alias = "stepmode")]
    step_mode: Value,
    hold: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed command record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Empty command record")]
    Empty,

    #[error("Field `{field}` {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Decode a raw payload, truncating it to `BUFFER_SIZE` first.
///
/// Only the first JSON value is read. Whatever follows it (a C client's NUL
/// terminator, a second record, line noise) is ignored.
pub fn decode(payload: &[u8]) -> Result<Command, DecodeError> {
    let bounded = &payload[..payload.len().min(BUFFER_SIZE)];
    let wire = serde_json::Deserializer::from_slice(bounded)
        .into_iter::<WireCommand>()
        .next()
        .ok_or(DecodeError::Empty)??;

    let mode = DriveMode::from_code(wire.mode);
    if !mode.uses_motion_fields() {
        return Ok(Command::bare(mode));
    }

    Ok(Command {
        mode,
        steps: as_u32("steps", &wire.steps)?,
        speed: as_u32("speed", &wire.speed)?,
        slope: as_u32("slope", &wire.slope)?,
        direction: as_bool("direction", &wire.direction)?,
        step_mode: as_u8("stepMode", &wire.step_mode)?,
        hold: as_bool("hold", &wire.hold)?,
    })
}

fn as_u32(field: &'static str, value: &Value) -> Result<u32, DecodeError> {
    let raw = value.as_u64().ok_or(DecodeError::InvalidField {
        field,
        reason: "must be a non-negative integer",
    })?;
    u32::try_from(raw).map_err(|_| DecodeError::InvalidField {
        field,
        reason: "is out of range",
    })
}

fn as_u8(field: &'static str, value: &Value) -> Result<u8, DecodeError> {
    let raw = as_u32(field, value)?;
    u8::try_from(raw).map_err(|_| DecodeError::InvalidField {
        field,
        reason: "is out of range",
    })
}

fn as_bool(field: &'static str, value: &Value) -> Result<bool, DecodeError> {
    value.as_bool().ok_or(DecodeError::InvalidField {
        field,
        reason: "must be a boolean",
    })
}
