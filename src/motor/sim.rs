// Simulated stepper driver
//
// Tracks position and enable state and paces pulses in real time, so the rest of
// the node behaves as it would with a driver attached.

use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info};

use super::{Direction, MAX_STEP_MODE, Motor, MotorError, MoveOutcome, MoveRequest, StopReason};
use crate::safety::SafetySignals;

#[derive(Debug, Default)]
pub struct SimulatedMotor {
    position: i64,
    enabled: bool,
    power_cycles: u32,
}

impl SimulatedMotor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute position in pulses; zeroed by a successful home
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Whether the driver is energised (holding torque)
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn power_cycles(&self) -> u32 {
        self.power_cycles
    }

    fn validate(request: &MoveRequest) -> Result<(), MotorError> {
        if request.speed == 0 {
            return Err(MotorError::InvalidSpeed {
                speed: request.speed,
            });
        }
        if request.step_mode > MAX_STEP_MODE {
            return Err(MotorError::InvalidStepMode {
                code: request.step_mode,
            });
        }
        Ok(())
    }

    fn pulse(&mut self, direction: Direction, speed: u32) {
        sleep(Duration::from_secs_f64(1.0 / f64::from(speed)));
        self.position += match direction {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        };
    }

    /// Emit up to `request.steps` pulses, with the speed of each pulse picked by `speed_at`
    fn run(
        &mut self,
        request: &MoveRequest,
        safety: &SafetySignals,
        speed_at: impl Fn(u32) -> u32,
    ) -> MoveOutcome {
        self.enabled = true;
        for step in 0..request.steps {
            if safety.emergency_stop() {
                self.enabled = false;
                return MoveOutcome::Stopped {
                    steps: step,
                    reason: StopReason::EmergencyStop,
                };
            }
            self.pulse(request.direction, speed_at(step));
        }
        self.enabled = request.hold;
        MoveOutcome::Completed {
            steps: request.steps,
        }
    }
}

/// Speed of pulse `step` in a move of `steps` pulses: linear from half speed at
/// either end up to full speed `slope` pulses in
pub fn ramp_speed(speed: u32, slope: u32, step: u32, steps: u32) -> u32 {
    let from_end = step.min(steps.saturating_sub(1).saturating_sub(step));
    if slope == 0 || from_end >= slope {
        return speed;
    }
    let floor = speed / 2;
    let gained = u64::from(speed - floor) * u64::from(from_end) / u64::from(slope);
    (u64::from(floor) + gained).max(1) as u32
}

impl Motor for SimulatedMotor {
    fn drive(
        &mut self,
        request: &MoveRequest,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError> {
        Self::validate(request)?;
        debug!("Drive {:?}", request);
        Ok(self.run(request, safety, |_| request.speed))
    }

    fn home(
        &mut self,
        request: &MoveRequest,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError> {
        Self::validate(request)?;
        debug!("Home {:?}", request);
        self.enabled = true;

        for step in 0..request.steps {
            if safety.emergency_stop() {
                self.enabled = false;
                return Ok(MoveOutcome::Stopped {
                    steps: step,
                    reason: StopReason::EmergencyStop,
                });
            }
            if safety.end_stop() {
                self.position = 0;
                self.enabled = request.hold;
                info!("Homed after {} steps", step);
                return Ok(MoveOutcome::Homed { steps: step });
            }
            self.pulse(request.direction, request.speed);
        }

        self.enabled = request.hold;
        Ok(MoveOutcome::Stopped {
            steps: request.steps,
            reason: StopReason::SearchExhausted,
        })
    }

    fn ramp(
        &mut self,
        request: &MoveRequest,
        slope: u32,
        safety: &SafetySignals,
    ) -> Result<MoveOutcome, MotorError> {
        Self::validate(request)?;
        debug!("Ramp {:?} slope {}", request, slope);
        Ok(self.run(request, safety, |step| {
            ramp_speed(request.speed, slope, step, request.steps)
        }))
    }

    fn power_cycle(&mut self) -> Result<(), MotorError> {
        info!("Power cycling driver");
        self.disable()?;
        self.enabled = true;
        self.power_cycles += 1;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), MotorError> {
        self.enabled = false;
        Ok(())
    }
}
