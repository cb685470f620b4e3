// Cooperative control loop
//
// Every tick runs, in order:
// 1. safety poll (unconditional)
// 2. receive; a new frame arms the job gate
// 3. display refresh if the interval elapsed
// 4. if the gate is armed: decode, dispatch to the actuator, clear the gate
//
// The tick never blocks on a motion: dispatched actions go to the actuation
// worker, which reads the safety signals published in step 1.

use std::time::Instant;

use serialport::SerialPort;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::NodeConfig;
use crate::dispatch::ActionDispatcher;
use crate::display::{DisplayScheduler, LogDisplay, StatusDisplay, StatusView};
use crate::gate::{GateState, JobGate};
use crate::motor::{Actuator, ActuatorHandle, Motor, MotorAction, SimulatedMotor};
use crate::safety::{SafetyMonitor, SafetySignals, SensorLines, SimulatedSensors};
use crate::transport::{
    ActiveTransport, CommandChannel, Frame, NetworkConfig, SerialChannel, TransportSelector,
    UdpChannel, udp,
};

/// Running counters, shown on the display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub frames: u64,
    pub receive_errors: u64,
    pub dispatched: u64,
    pub decode_errors: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub display_refreshes: u64,
}

/// What the decode/dispatch stage did this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Gate was idle; nothing decoded
    Idle,
    Dispatched(MotorAction),
    /// Decoded, but the mode maps to no action
    Ignored(i64),
    DecodeFailed,
    /// Decoded and mapped, but the actuator would not take it
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub display_refreshed: bool,
}

/// Control-loop context: owns every component and the receive buffer
pub struct ControlLoop<C, S, D, A> {
    channel: C,
    safety: SafetyMonitor<S>,
    display: D,
    scheduler: DisplayScheduler,
    actuator: A,
    gate: JobGate,
    dispatcher: ActionDispatcher,
    buffer: Frame,
    stats: LoopStats,
    receive_failing: bool,
}

impl<C, S, D, A> ControlLoop<C, S, D, A>
where
    C: CommandChannel,
    S: SensorLines,
    D: StatusDisplay,
    A: Actuator,
{
    pub fn new(
        channel: C,
        safety: SafetyMonitor<S>,
        display: D,
        scheduler: DisplayScheduler,
        actuator: A,
    ) -> Self {
        Self {
            channel,
            safety,
            display,
            scheduler,
            actuator,
            gate: JobGate::new(),
            dispatcher: ActionDispatcher::new(),
            buffer: Frame::new(),
            stats: LoopStats::default(),
            receive_failing: false,
        }
    }

    /// Run one pass of the loop
    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.stats.ticks += 1;

        let sensors = self.safety.poll();

        match self.channel.try_receive() {
            Ok(received) => {
                if self.receive_failing {
                    info!("Receive recovered");
                    self.receive_failing = false;
                }
                if let Some(frame) = received {
                    self.buffer = frame;
                    self.gate.arm();
                    self.stats.frames += 1;
                }
            }
            // Logged once per outage, not once per tick
            Err(e) => {
                if !self.receive_failing {
                    warn!("Receive failed: {}", e);
                    self.receive_failing = true;
                }
                self.stats.receive_errors += 1;
            }
        }

        let view = StatusView {
            sensors,
            connection: self.channel.connection(),
            motor: self.actuator.state(),
            stats: self.stats,
        };
        let display_refreshed = self
            .scheduler
            .maybe_refresh(now, &mut self.display, &view);
        if display_refreshed {
            self.stats.display_refreshes += 1;
        }

        let outcome = if self.gate.is_pending() {
            let outcome = self.process_buffer();
            self.gate.clear();
            outcome
        } else {
            TickOutcome::Idle
        };

        TickReport {
            outcome,
            display_refreshed,
        }
    }

    fn process_buffer(&mut self) -> TickOutcome {
        let cmd = match codec::decode(&self.buffer) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!("JSON error: {}", e);
                self.stats.decode_errors += 1;
                return TickOutcome::DecodeFailed;
            }
        };
        debug!("Decoded {:?}", cmd);

        let Some(action) = self.dispatcher.dispatch(&cmd) else {
            self.stats.ignored += 1;
            return TickOutcome::Ignored(cmd.mode.code());
        };

        match self.actuator.submit(action) {
            Ok(()) => {
                self.stats.dispatched += 1;
                TickOutcome::Dispatched(action)
            }
            Err(e) => {
                error!("{}", e);
                self.stats.rejected += 1;
                TickOutcome::Rejected
            }
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Bytes of the most recent frame; kept until the next one arrives
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn safety_mut(&mut self) -> &mut SafetyMonitor<S> {
        &mut self.safety
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// True from a receive error until the next successful receive
    pub fn receive_failing(&self) -> bool {
        self.receive_failing
    }
}

/// Bring the node up in boot order: sensor self-check, motor disable,
/// transport selection, display init. The actuation worker is spawned last,
/// so nothing reaches the motor before it has been disabled.
///
/// Must run inside a tokio runtime. `select_transport` may block.
pub fn boot<C, S, M, D, F>(
    config: &NodeConfig,
    mut sensors: S,
    mut motor: M,
    mut display: D,
    select_transport: F,
) -> (ControlLoop<C, S, D, ActuatorHandle>, JoinHandle<M>)
where
    C: CommandChannel,
    S: SensorLines,
    M: Motor + Send + 'static,
    D: StatusDisplay,
    F: FnOnce() -> C,
{
    info!("Ethersweep runtime v{}", env!("CARGO_PKG_VERSION"));

    if sensors.self_check() {
        info!("Sensors OK");
    } else {
        error!("Sensor fail");
    }

    if let Err(e) = motor.disable() {
        error!("Failed to disable motor: {}", e);
    }

    let transport = select_transport();
    let connection = transport.connection();
    display.init(&connection);
    info!("Listening: {}, port {}", connection, config.port);
    info!("done");

    let signals = SafetySignals::new();
    let (actuator, worker) =
        ActuatorHandle::spawn(motor, signals.clone(), config.action_queue_depth);
    let control = ControlLoop::new(
        transport,
        SafetyMonitor::new(sensors, signals),
        display,
        DisplayScheduler::new(config.display_refresh, Instant::now()),
        actuator,
    );

    (control, worker)
}

type NodeTransport = ActiveTransport<SerialChannel<Box<dyn SerialPort>>, UdpChannel>;

/// Serial if it is talking within the detection window, otherwise UDP
fn select_transport(config: &NodeConfig) -> NodeTransport {
    let serial = match SerialChannel::open(&config.serial_device, config.baud) {
        Ok(channel) => Some(channel),
        Err(e) => {
            info!("Serial device {} unavailable: {}", config.serial_device, e);
            None
        }
    };
    let network = NetworkConfig::from(config);
    TransportSelector::new(config.serial_detect_window)
        .select(serial, || udp::bring_up(&network))
}

/// Boot the node and run the control loop forever
pub async fn run(config: NodeConfig) {
    // Serial detection sleeps through its window and socket setup is blocking
    let (mut control, _worker) = tokio::task::block_in_place(|| {
        boot(
            &config,
            SimulatedSensors::default(),
            SimulatedMotor::new(),
            LogDisplay::new(),
            || select_transport(&config),
        )
    });

    let mut tick = interval(config.loop_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "Control loop started: {}ms tick, display every {}ms",
        config.loop_period.as_millis(),
        config.display_refresh.as_millis()
    );

    loop {
        tick.tick().await;
        control.tick(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Direction, MotorError, MotorState, MoveOutcome, MoveRequest, SubmitError};
    use crate::transport::{ConnectionInfo, SerialLink};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::Level;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    const STEPS_200: &[u8] = br#"{"mode":0,"steps":200,"speed":500,"slope":0,"direction":true,"stepMode":1,"hold":false}"#;

    #[derive(Default)]
    struct Inbox {
        frames: VecDeque<Frame>,
    }

    impl Inbox {
        fn push(&mut self, bytes: &[u8]) {
            self.frames.push_back(bytes.to_vec());
        }
    }

    impl CommandChannel for Inbox {
        fn try_receive(&mut self) -> io::Result<Option<Frame>> {
            Ok(self.frames.pop_front())
        }

        fn connection(&self) -> ConnectionInfo {
            ConnectionInfo::serial()
        }
    }

    #[derive(Default)]
    struct Lines {
        emergency_stop: bool,
        reads: u64,
    }

    impl SensorLines for Lines {
        fn emergency_stop(&mut self) -> bool {
            self.reads += 1;
            self.emergency_stop
        }

        fn end_stop(&mut self) -> bool {
            false
        }
    }

    // Records submissions along with the e-stop state the worker would see
    struct Recorder {
        signals: SafetySignals,
        submitted: Vec<(MotorAction, bool)>,
        accept: bool,
    }

    impl Actuator for Recorder {
        fn submit(&mut self, action: MotorAction) -> Result<(), SubmitError> {
            if !self.accept {
                return Err(SubmitError::Busy(action));
            }
            self.submitted.push((action, self.signals.emergency_stop()));
            Ok(())
        }

        fn state(&self) -> MotorState {
            MotorState::Idle
        }
    }

    // Fails the first `failures` receives, then goes quiet
    struct Unplugged {
        failures: u64,
    }

    impl CommandChannel for Unplugged {
        fn try_receive(&mut self) -> io::Result<Option<Frame>> {
            if self.failures == 0 {
                return Ok(None);
            }
            self.failures -= 1;
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn connection(&self) -> ConnectionInfo {
            ConnectionInfo::serial()
        }
    }

    // Counts warn and error events on the current thread
    #[derive(Clone, Default)]
    struct Warnings(Arc<AtomicUsize>);

    impl Warnings {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Warnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() <= Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    type TestLoop = ControlLoop<Inbox, Lines, LogDisplay, Recorder>;

    fn control_loop(start: Instant, refresh: Duration) -> TestLoop {
        control_loop_on(Inbox::default(), start, refresh)
    }

    fn control_loop_on<C: CommandChannel>(
        channel: C,
        start: Instant,
        refresh: Duration,
    ) -> ControlLoop<C, Lines, LogDisplay, Recorder> {
        let signals = SafetySignals::new();
        let recorder = Recorder {
            signals: signals.clone(),
            submitted: Vec::new(),
            accept: true,
        };
        ControlLoop::new(
            channel,
            SafetyMonitor::new(Lines::default(), signals),
            LogDisplay::new(),
            DisplayScheduler::new(refresh, start),
            recorder,
        )
    }

    #[test]
    fn test_steps_command_dispatches_exactly_once() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(STEPS_200);

        let report = control.tick(start);
        let expected = MotorAction::Drive(MoveRequest {
            steps: 200,
            speed: 500,
            direction: Direction::Forward,
            step_mode: 1,
            hold: false,
        });
        assert_eq!(report.outcome, TickOutcome::Dispatched(expected));
        assert_eq!(control.gate_state(), GateState::Idle);
        assert_eq!(control.actuator().submitted, vec![(expected, false)]);
    }

    #[test]
    fn test_stale_buffer_is_never_redispatched() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(STEPS_200);
        control.tick(start);

        for i in 1..100 {
            let report = control.tick(start + Duration::from_millis(i));
            assert_eq!(report.outcome, TickOutcome::Idle);
        }

        // Old bytes are still there, just not reprocessed
        assert_eq!(control.buffer(), STEPS_200);
        assert_eq!(control.actuator().submitted.len(), 1);
        assert_eq!(control.stats().dispatched, 1);
    }

    #[test]
    fn test_repeated_identical_frames_dispatch_each_time() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(STEPS_200);
        control.channel_mut().push(STEPS_200);

        control.tick(start);
        control.tick(start);
        control.tick(start);
        assert_eq!(control.actuator().submitted.len(), 2);
    }

    #[test]
    fn test_malformed_payload_logs_one_error_and_clears_gate() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(b"\x01\x02not json at all");

        assert_eq!(control.tick(start).outcome, TickOutcome::DecodeFailed);
        assert_eq!(control.gate_state(), GateState::Idle);
        assert_eq!(control.tick(start).outcome, TickOutcome::Idle);

        assert_eq!(control.stats().decode_errors, 1);
        assert!(control.actuator().submitted.is_empty());
    }

    #[test]
    fn test_unrecognized_mode_is_silent_noop() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(
            br#"{"mode":7,"steps":200,"speed":500,"slope":0,"direction":true,"stepMode":1,"hold":false}"#,
        );

        assert_eq!(control.tick(start).outcome, TickOutcome::Ignored(7));
        let stats = control.stats();
        assert_eq!(stats.decode_errors, 0);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.dispatched, 0);
        assert!(control.actuator().submitted.is_empty());
        assert_eq!(control.gate_state(), GateState::Idle);
    }

    #[test]
    fn test_power_cycle_ignores_garbage_fields() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.channel_mut().push(
            br#"{"mode":3,"steps":-42,"speed":"??","slope":1e9,"direction":0,"stepMode":999,"hold":{}}"#,
        );

        assert_eq!(
            control.tick(start).outcome,
            TickOutcome::Dispatched(MotorAction::PowerCycle)
        );
        assert_eq!(
            control.actuator().submitted,
            vec![(MotorAction::PowerCycle, false)]
        );
    }

    #[test]
    fn test_safety_poll_precedes_dispatch() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.safety_mut().lines_mut().emergency_stop = true;
        control.channel_mut().push(STEPS_200);

        control.tick(start);
        // The actuator already saw this tick's e-stop sample when the action arrived
        assert!(control.actuator().submitted[0].1);
    }

    #[test]
    fn test_safety_polled_every_tick() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        for i in 0..50 {
            if i % 10 == 0 {
                control.channel_mut().push(STEPS_200);
            }
            control.tick(start + Duration::from_millis(i));
        }
        assert_eq!(control.safety_mut().lines_mut().reads, 50);
    }

    #[test]
    fn test_rejected_action_still_clears_gate() {
        let start = Instant::now();
        let mut control = control_loop(start, Duration::from_secs(1));
        control.actuator.accept = false;
        control.channel_mut().push(STEPS_200);

        assert_eq!(control.tick(start).outcome, TickOutcome::Rejected);
        assert_eq!(control.gate_state(), GateState::Idle);
        assert_eq!(control.tick(start).outcome, TickOutcome::Idle);
        assert_eq!(control.stats().rejected, 1);
    }

    #[test]
    fn test_display_cadence_independent_of_traffic() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let mut quiet = control_loop(start, interval);
        let mut busy = control_loop(start, interval);

        for ms in 0..=2_000u64 {
            let now = start + Duration::from_millis(ms);
            if ms % 3 == 0 {
                busy.channel_mut().push(STEPS_200);
            }
            if ms % 7 == 0 {
                busy.channel_mut().push(b"garbage");
            }
            quiet.tick(now);
            busy.tick(now);
        }

        let expected = 2_000 / 100;
        for control in [&quiet, &busy] {
            let refreshes = control.stats().display_refreshes;
            assert!(refreshes.abs_diff(expected) <= 1, "{} refreshes", refreshes);
            assert_eq!(control.display().frames(), refreshes);
        }
        assert!(busy.stats().dispatched > 0);
    }

    #[test]
    fn test_persistent_receive_error_logs_once() {
        let warnings = Warnings::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());

        tracing::subscriber::with_default(subscriber, || {
            let start = Instant::now();
            let mut control =
                control_loop_on(Unplugged { failures: 200 }, start, Duration::from_secs(60));

            for ms in 0..200 {
                control.tick(start + Duration::from_millis(ms));
            }
            assert!(control.receive_failing());
            assert_eq!(control.stats().receive_errors, 200);

            control.tick(start + Duration::from_millis(200));
            assert!(!control.receive_failing());

            // A second outage is reported again
            control.channel_mut().failures = 5;
            for ms in 201..210 {
                control.tick(start + Duration::from_millis(ms));
            }
        });

        assert_eq!(warnings.count(), 2);
    }

    type Events = Arc<Mutex<Vec<&'static str>>>;

    struct BenchSensors {
        events: Events,
        healthy: bool,
    }

    impl SensorLines for BenchSensors {
        fn emergency_stop(&mut self) -> bool {
            false
        }

        fn end_stop(&mut self) -> bool {
            false
        }

        fn self_check(&mut self) -> bool {
            self.events.lock().unwrap().push("self_check");
            self.healthy
        }
    }

    struct BenchMotor {
        events: Events,
    }

    impl Motor for BenchMotor {
        fn drive(
            &mut self,
            request: &MoveRequest,
            _safety: &SafetySignals,
        ) -> Result<MoveOutcome, MotorError> {
            self.events.lock().unwrap().push("drive");
            Ok(MoveOutcome::Completed {
                steps: request.steps,
            })
        }

        fn home(
            &mut self,
            _request: &MoveRequest,
            _safety: &SafetySignals,
        ) -> Result<MoveOutcome, MotorError> {
            self.events.lock().unwrap().push("home");
            Ok(MoveOutcome::Homed { steps: 0 })
        }

        fn ramp(
            &mut self,
            request: &MoveRequest,
            _slope: u32,
            _safety: &SafetySignals,
        ) -> Result<MoveOutcome, MotorError> {
            self.events.lock().unwrap().push("ramp");
            Ok(MoveOutcome::Completed {
                steps: request.steps,
            })
        }

        fn power_cycle(&mut self) -> Result<(), MotorError> {
            self.events.lock().unwrap().push("power_cycle");
            Ok(())
        }

        fn disable(&mut self) -> Result<(), MotorError> {
            self.events.lock().unwrap().push("disable");
            Ok(())
        }
    }

    struct BenchPanel {
        events: Events,
    }

    impl StatusDisplay for BenchPanel {
        fn init(&mut self, _connection: &ConnectionInfo) {
            self.events.lock().unwrap().push("display_init");
        }

        fn render(&mut self, _view: &StatusView) {}
    }

    fn bench(events: &Events, healthy: bool) -> (BenchSensors, BenchMotor, BenchPanel) {
        (
            BenchSensors {
                events: events.clone(),
                healthy,
            },
            BenchMotor {
                events: events.clone(),
            },
            BenchPanel {
                events: events.clone(),
            },
        )
    }

    #[tokio::test]
    async fn test_boot_disables_motor_before_transport_and_commands() {
        let events = Events::default();
        let (sensors, motor, panel) = bench(&events, true);

        let (mut control, worker) = boot(&NodeConfig::default(), sensors, motor, panel, || {
            events.lock().unwrap().push("transport");
            Inbox::default()
        });

        control.channel_mut().push(STEPS_200);
        assert!(matches!(
            control.tick(Instant::now()).outcome,
            TickOutcome::Dispatched(MotorAction::Drive(_))
        ));

        // Dropping the loop closes the queue; the worker finishes and returns the motor
        drop(control);
        worker.await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["self_check", "disable", "transport", "display_init", "drive"]
        );
    }

    #[tokio::test]
    async fn test_failed_self_check_is_logged_and_boot_continues() {
        let events = Events::default();
        let (sensors, motor, panel) = bench(&events, false);
        let warnings = Warnings::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());

        let (control, _worker) = tracing::subscriber::with_default(subscriber, || {
            boot(
                &NodeConfig::default(),
                sensors,
                motor,
                panel,
                Inbox::default,
            )
        });

        assert_eq!(warnings.count(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["self_check", "disable", "display_init"]
        );
        assert_eq!(control.gate_state(), GateState::Idle);
    }

    // Serial link with nothing to say; detection waits out its whole window
    struct QuietLink;

    impl SerialLink for QuietLink {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(0)
        }

        fn read_available(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_boot_probe_does_not_stall_other_tasks() {
        let progress = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let progress = progress.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    progress.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Boot on the only worker thread, as `run` does
        let events = Events::default();
        let (sensors, motor, panel) = bench(&events, true);
        let (mut control, _worker) = tokio::spawn(async move {
            tokio::task::block_in_place(|| {
                boot(&NodeConfig::default(), sensors, motor, panel, || {
                    TransportSelector::new(Duration::from_millis(50))
                        .select(Some(SerialChannel::new(QuietLink)), Inbox::default)
                })
            })
        })
        .await
        .unwrap();

        assert!(progress.load(Ordering::SeqCst) > 0);
        assert!(matches!(control.channel_mut(), ActiveTransport::Network(_)));
        ticker.abort();
    }
}
