//! The clock/counter task pair, reconfigured and driven as one unit.
//!
//! [`DualTaskController`] owns exactly two [`TaskHandle`]s. The counter is only correct while it is
//! gated by the *current* clock's internal output, so the tasks are never reconfigured one at a
//! time: [`DualTaskController::rebuild`] closes both and recreates both, clock first.
//!
//! Ordering:
//! - rebuild: close counter, close clock, configure clock, configure counter
//! - start: clock, then counter
//! - stop / close: counter, then clock
//!
//! Every rebuild bumps a generation number carried by both tasks and by the clock's
//! [`ClockOutput`](crate::sync::ClockOutput), which the counter checks before wiring itself.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::channel::{ChannelRole, ChannelSpec};
use crate::driver::DaqDriver;
use crate::error::{PlCounterError, Result};
use crate::sync::SyncWiring;
use crate::task::{SampleBatch, TaskHandle, TaskState};
use crate::timing::{ClockConfig, StreamReadPolicy, TimingPolicy};
use crate::utils::{same_terminal, TickTimer};

pub struct DualTaskController<D: DaqDriver> {
    driver: Arc<D>,
    clock: TaskHandle<D>,
    counter: TaskHandle<D>,
    generation: u64,
    timing: TimingPolicy,
    read_policy: StreamReadPolicy,
}

impl<D: DaqDriver> DualTaskController<D> {
    /// Continuous timing with the default buffer depth, sequential non-overwriting reads.
    pub fn new(driver: Arc<D>) -> Self {
        Self::with_policies(driver, TimingPolicy::default(), StreamReadPolicy::default())
    }

    pub fn with_policies(driver: Arc<D>, timing: TimingPolicy, read_policy: StreamReadPolicy) -> Self {
        Self {
            clock: TaskHandle::new(driver.clone(), ChannelRole::Clock, 0),
            counter: TaskHandle::new(driver.clone(), ChannelRole::Counter, 0),
            driver,
            generation: 0,
            timing,
            read_policy,
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Number of rebuilds attempted so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn clock_state(&self) -> TaskState {
        self.clock.state()
    }

    pub fn counter_state(&self) -> TaskState {
        self.counter.state()
    }

    pub fn is_running(&self) -> bool {
        self.clock.state() == TaskState::Running && self.counter.state() == TaskState::Running
    }

    /// Gate terminal the counter is currently wired to, if it is configured.
    pub fn gate_terminal(&self) -> Option<&str> {
        self.counter.wiring().map(|wiring| wiring.gate_terminal())
    }

    /// Closes any held tasks and configures a fresh pair: the clock generating `clock_cfg` on
    /// `clock_spec`, the counter on `counter_spec` gated by the clock and timed by `photon_source`.
    ///
    /// On failure both tasks are left closed.
    pub fn rebuild(
        &mut self,
        clock_spec: &ChannelSpec,
        clock_cfg: &ClockConfig,
        counter_spec: &ChannelSpec,
        photon_source: &str,
    ) -> Result<()> {
        let mut timer = TickTimer::new();
        self.close_both();
        if same_terminal(&clock_spec.terminal, &counter_spec.terminal) {
            return Err(PlCounterError::invalid_channel(
                &counter_spec.terminal,
                "clock and counter must use different counters",
            ));
        }

        self.generation += 1;
        self.clock = TaskHandle::new(self.driver.clone(), ChannelRole::Clock, self.generation);
        self.counter = TaskHandle::new(self.driver.clone(), ChannelRole::Counter, self.generation);

        if let Err(e) = self.configure_pair(clock_spec, clock_cfg, counter_spec, photon_source) {
            error!("rebuild #{} failed: {}", self.generation, e);
            self.close_both();
            return Err(e);
        }
        timer.tick_log("rebuild clock + counter");
        info!(
            "rebuild #{}: clock {} at {} Hz, counter {} gated by {:?}, timebase {}",
            self.generation,
            clock_spec.terminal,
            clock_cfg.frequency_hz,
            counter_spec.terminal,
            self.gate_terminal(),
            photon_source
        );
        Ok(())
    }

    fn configure_pair(
        &mut self,
        clock_spec: &ChannelSpec,
        clock_cfg: &ClockConfig,
        counter_spec: &ChannelSpec,
        photon_source: &str,
    ) -> Result<()> {
        let sources = self
            .driver
            .triggering_sources()
            .map_err(|e| PlCounterError::hardware_config("listing of triggering sources", e))?;

        self.clock.create()?;
        let output = self.clock.configure_as_clock(clock_spec, clock_cfg, &self.timing)?;
        let wiring = SyncWiring::new(&output, photon_source, &sources)?;

        self.counter.create()?;
        self.counter
            .configure_as_counter(counter_spec, &self.timing, &self.read_policy, &wiring)
    }

    /// Starts the clock, then the counter. If the counter fails to start the clock is stopped again.
    pub fn start_both(&mut self) -> Result<()> {
        let mut timer = TickTimer::new();
        self.clock.start()?;
        if let Err(e) = self.counter.start() {
            if let Err(stop_err) = self.clock.stop() {
                warn!("stopping clock after failed counter start: {}", stop_err);
            }
            return Err(e);
        }
        timer.tick_log("start clock + counter");
        Ok(())
    }

    /// Stops the counter, then the clock. Both are attempted; the first error is returned.
    pub fn stop_both(&mut self) -> Result<()> {
        let counter = self.counter.stop();
        let clock = self.clock.stop();
        counter.and(clock)
    }

    /// Releases both tasks, counter first. Never fails.
    pub fn close_both(&mut self) {
        self.counter.close();
        self.clock.close();
    }

    /// Buffered read of `sample_count` raw ticks from the counter task.
    pub fn read(&mut self, sample_count: usize, timeout: f64) -> Result<SampleBatch> {
        self.counter.read(sample_count, timeout)
    }
}

impl<D: DaqDriver> Drop for DualTaskController<D> {
    fn drop(&mut self) {
        self.close_both();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Edge, DEFAULT_MAX_COUNT};
    use crate::sim::{SimCall, SimDriver, SimFault};

    struct Rig {
        sim: Arc<SimDriver>,
        ctrl: DualTaskController<SimDriver>,
    }

    fn rig() -> Rig {
        let sim = Arc::new(SimDriver::new());
        Rig {
            ctrl: DualTaskController::new(sim.clone()),
            sim,
        }
    }

    impl Rig {
        fn rebuild(&mut self, clock: &str, counter: &str, photon: &str) -> Result<()> {
            let counters = self.sim.counter_channels().unwrap();
            let cfg = ClockConfig::new(200.).unwrap();
            let clock_spec = ChannelSpec::clock(clock, 200., &counters).unwrap();
            let counter_spec =
                ChannelSpec::counter(counter, Edge::Rising, DEFAULT_MAX_COUNT, &counters).unwrap();
            self.ctrl.rebuild(&clock_spec, &cfg, &counter_spec, photon)
        }

        fn position(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
            self.sim.calls().iter().position(pred).unwrap()
        }
    }

    #[test]
    fn rebuild_configures_clock_first() {
        let mut rig = rig();
        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        let pulse = rig.position(|c| matches!(c, SimCall::CreateCoPulseChan { .. }));
        let semi = rig.position(|c| matches!(c, SimCall::CreateCiSemiPeriodChan { .. }));
        assert!(pulse < semi);

        let gate = rig
            .sim
            .calls()
            .into_iter()
            .find_map(|c| match c {
                SimCall::SetSemiPeriodTerm { terminal, .. } => Some(terminal),
                _ => None,
            })
            .unwrap();
        assert_eq!(gate, "/Dev1/ctr1InternalOutput");
        assert_eq!(rig.ctrl.clock_state(), TaskState::Configured);
        assert_eq!(rig.ctrl.counter_state(), TaskState::Configured);
        assert_eq!(rig.sim.open_tasks(), 2);
    }

    #[test]
    fn start_and_stop_order() {
        let mut rig = rig();
        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        rig.ctrl.start_both().unwrap();
        assert!(rig.ctrl.is_running());
        let start_clock = rig.position(|c| *c == SimCall::Start { task: "clock1".into() });
        let start_counter = rig.position(|c| *c == SimCall::Start { task: "counter1".into() });
        assert!(start_clock < start_counter);

        rig.ctrl.stop_both().unwrap();
        let stop_clock = rig.position(|c| *c == SimCall::Stop { task: "clock1".into() });
        let stop_counter = rig.position(|c| *c == SimCall::Stop { task: "counter1".into() });
        assert!(stop_counter < stop_clock);

        rig.ctrl.close_both();
        let clear_clock = rig.position(|c| *c == SimCall::Clear { task: "clock1".into() });
        let clear_counter = rig.position(|c| *c == SimCall::Clear { task: "counter1".into() });
        assert!(clear_counter < clear_clock);
        assert_eq!(rig.sim.open_tasks(), 0);
    }

    #[test]
    fn gate_follows_the_clock_across_rebuilds() {
        let mut rig = rig();
        for (generation, clock) in [(1, "Dev1/ctr1"), (2, "Dev1/ctr2"), (3, "Dev1/ctr3")] {
            rig.rebuild(clock, "Dev1/ctr0", "/Dev1/PFI0").unwrap();
            assert_eq!(rig.ctrl.generation(), generation);
            assert_eq!(
                rig.ctrl.gate_terminal(),
                Some(format!("/{}InternalOutput", clock).as_str())
            );
            // Previous pair was released before the new one was created
            assert_eq!(rig.sim.open_tasks(), 2);
        }
    }

    #[test]
    fn rebuild_closes_running_pair_first() {
        let mut rig = rig();
        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        rig.ctrl.start_both().unwrap();
        rig.sim.clear_calls();

        rig.rebuild("Dev1/ctr2", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        let calls = rig.sim.calls();
        assert_eq!(calls[0], SimCall::Stop { task: "counter1".into() });
        assert_eq!(calls[1], SimCall::Clear { task: "counter1".into() });
        assert_eq!(calls[2], SimCall::Stop { task: "clock1".into() });
        assert_eq!(calls[3], SimCall::Clear { task: "clock1".into() });
        assert_eq!(calls[4], SimCall::CreateTask { task: "clock2".into() });
    }

    #[test]
    fn shared_counter_is_rejected() {
        let mut rig = rig();
        let err = rig.rebuild("Dev1/ctr0", "/Dev1/ctr0", "/Dev1/PFI0").unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidChannelSpec { .. }));
        assert_eq!(rig.sim.open_tasks(), 0);
    }

    #[test]
    fn failed_rebuild_leaves_both_closed() {
        let mut rig = rig();
        let err = rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev9/PFI0").unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidChannelSpec { .. }));
        assert_eq!(rig.ctrl.clock_state(), TaskState::Closed);
        assert_eq!(rig.ctrl.counter_state(), TaskState::Closed);
        assert_eq!(rig.sim.open_tasks(), 0);
        assert_eq!(rig.ctrl.gate_terminal(), None);
    }

    #[test]
    fn rejected_counter_channel_releases_the_clock() {
        let mut rig = rig();
        rig.sim.inject(SimFault::ConfigFailure(ChannelRole::Counter));
        let err = rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap_err();
        assert!(err.is_configuration());
        // The clock was configured before the counter failed
        rig.position(|c| matches!(c, SimCall::CreateCoPulseChan { .. }));
        assert_eq!(rig.ctrl.clock_state(), TaskState::Closed);
        assert_eq!(rig.ctrl.counter_state(), TaskState::Closed);
        assert_eq!(rig.sim.open_tasks(), 0);

        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        assert_eq!(rig.sim.open_tasks(), 2);
    }

    #[test]
    fn failed_counter_start_stops_the_clock() {
        let mut rig = rig();
        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        rig.sim.inject(SimFault::StartFailure(ChannelRole::Counter));
        let err = rig.ctrl.start_both().unwrap_err();
        assert!(matches!(err, PlCounterError::Driver { op: "start task", .. }));
        assert_eq!(rig.ctrl.clock_state(), TaskState::Stopped);
        assert_eq!(rig.ctrl.counter_state(), TaskState::Configured);
        assert!(!rig.ctrl.is_running());
        assert!(rig.sim.running_tasks().is_empty());

        let start_clock = rig.position(|c| *c == SimCall::Start { task: "clock1".into() });
        let stop_clock = rig.position(|c| *c == SimCall::Stop { task: "clock1".into() });
        assert!(start_clock < stop_clock);

        // The pair can still be started once the fault is gone
        rig.ctrl.start_both().unwrap();
        assert!(rig.ctrl.is_running());
    }

    #[test]
    fn drop_releases_both_tasks() {
        let mut rig = rig();
        rig.rebuild("Dev1/ctr1", "Dev1/ctr0", "/Dev1/PFI0").unwrap();
        rig.ctrl.start_both().unwrap();
        let sim = rig.sim.clone();
        drop(rig);
        assert_eq!(sim.open_tasks(), 0);
        assert!(sim.running_tasks().is_empty());
    }
}
