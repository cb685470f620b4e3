// Emergency-stop and end-stop sampling
//
// The control loop polls the sensor lines every tick, before any command work.
// Each sample is published into `SafetySignals`, which the actuation worker reads
// while a move is in flight, so a long move never starves the e-stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// Physical safety inputs
pub trait SensorLines {
    /// True while the emergency stop is engaged
    fn emergency_stop(&mut self) -> bool;

    /// True while the limit (end) switch is triggered
    fn end_stop(&mut self) -> bool;

    /// Boot-time check of the attached sensors
    fn self_check(&mut self) -> bool {
        true
    }
}

/// One tick's worth of sensor state. Not stored beyond the latest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorSnapshot {
    pub emergency_stop: bool,
    pub end_stop: bool,
}

#[derive(Debug, Default)]
struct Signals {
    emergency_stop: AtomicBool,
    end_stop: AtomicBool,
}

/// Latest snapshot, shared read-only with the actuation worker
#[derive(Debug, Clone, Default)]
pub struct SafetySignals {
    inner: Arc<Signals>,
}

impl SafetySignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emergency_stop(&self) -> bool {
        self.inner.emergency_stop.load(Ordering::Acquire)
    }

    pub fn end_stop(&self) -> bool {
        self.inner.end_stop.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            emergency_stop: self.emergency_stop(),
            end_stop: self.end_stop(),
        }
    }

    pub(crate) fn publish(&self, snapshot: SensorSnapshot) {
        self.inner
            .emergency_stop
            .store(snapshot.emergency_stop, Ordering::Release);
        self.inner.end_stop.store(snapshot.end_stop, Ordering::Release);
    }
}

/// Owns the sensor lines; the only writer of `SafetySignals`
pub struct SafetyMonitor<S> {
    lines: S,
    signals: SafetySignals,
    last: SensorSnapshot,
}

impl<S: SensorLines> SafetyMonitor<S> {
    pub fn new(lines: S, signals: SafetySignals) -> Self {
        Self {
            lines,
            signals,
            last: SensorSnapshot::default(),
        }
    }

    /// Sample both lines and publish the result
    pub fn poll(&mut self) -> SensorSnapshot {
        let snapshot = SensorSnapshot {
            emergency_stop: self.lines.emergency_stop(),
            end_stop: self.lines.end_stop(),
        };
        self.signals.publish(snapshot);

        // Only log edges, not every tick
        if snapshot.emergency_stop != self.last.emergency_stop {
            if snapshot.emergency_stop {
                warn!("Emergency stop engaged");
            } else {
                info!("Emergency stop released");
            }
        }
        if snapshot.end_stop != self.last.end_stop {
            if snapshot.end_stop {
                warn!("End stop triggered");
            } else {
                info!("End stop cleared");
            }
        }

        self.last = snapshot;
        snapshot
    }

    /// Most recent sample
    pub fn snapshot(&self) -> SensorSnapshot {
        self.last
    }

    pub fn signals(&self) -> &SafetySignals {
        &self.signals
    }

    pub fn lines_mut(&mut self) -> &mut S {
        &mut self.lines
    }
}

/// Sensor lines with fixed states, for running without hardware
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSensors {
    pub emergency_stop: bool,
    pub end_stop: bool,
}

impl SensorLines for SimulatedSensors {
    fn emergency_stop(&mut self) -> bool {
        self.emergency_stop
    }

    fn end_stop(&mut self) -> bool {
        self.end_stop
    }
}
