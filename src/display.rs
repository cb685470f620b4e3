// Status display and its refresh cadence
//
// The scheduler is time-gated only: it never looks at command traffic, so the
// display refreshes at the same rate whether the node is idle or busy.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::motor::MotorState;
use crate::runtime::LoopStats;
use crate::safety::SensorSnapshot;
use crate::transport::ConnectionInfo;

/// Everything a status frame shows
#[derive(Debug, Clone, Copy)]
pub struct StatusView {
    pub sensors: SensorSnapshot,
    pub connection: ConnectionInfo,
    pub motor: MotorState,
    pub stats: LoopStats,
}

pub trait StatusDisplay {
    /// Boot splash with the connection the node listens on
    fn init(&mut self, connection: &ConnectionInfo);

    fn render(&mut self, view: &StatusView);
}

/// Renders status frames into the log
#[derive(Debug, Default)]
pub struct LogDisplay {
    frames: u64,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

fn flag(on: bool) -> &'static str {
    if on { "ON" } else { "off" }
}

impl StatusDisplay for LogDisplay {
    fn init(&mut self, connection: &ConnectionInfo) {
        info!("Display ready: {}", connection);
    }

    fn render(&mut self, view: &StatusView) {
        self.frames += 1;
        debug!(
            "[{}] e-stop {} | end-stop {} | motor {:?} | cmds {} | errs {}",
            view.connection,
            flag(view.sensors.emergency_stop),
            flag(view.sensors.end_stop),
            view.motor,
            view.stats.dispatched,
            view.stats.decode_errors,
        );
    }
}

/// Fixed-interval refresh timer
#[derive(Debug)]
pub struct DisplayScheduler {
    interval: Duration,
    last_refresh: Instant,
}

impl DisplayScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_refresh: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_refresh) >= self.interval
    }

    /// Render if the interval has elapsed; returns whether a frame was drawn
    pub fn maybe_refresh<D: StatusDisplay + ?Sized>(
        &mut self,
        now: Instant,
        display: &mut D,
        view: &StatusView,
    ) -> bool {
        if !self.is_due(now) {
            return false;
        }
        display.render(view);

        // Keep the cadence aligned to the interval; after a stall, restart from now
        self.last_refresh += self.interval;
        if self.is_due(now) {
            self.last_refresh = now;
        }
        true
    }
}
