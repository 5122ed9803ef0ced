//! Owns one hardware counter task through its lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//!  Closed --create--> Unbound --configure_as_*--> Configured --start--> Running
//!                                                      ^                   |
//!                                                      |                 stop
//!                                                      +---- Stopped <-----+
//!  any state --close--> Closed
//! ```
//!
//! A [`TaskHandle`] is bound to a [`ChannelRole`] at construction. Clock-role handles can only be
//! configured as pulse generators, counter-role handles only as semi-period counters, and only
//! counter-role handles can be read. Misuse yields [`PlCounterError::InvalidState`] and leaves the
//! task untouched.
//!
//! Closing is idempotent and never fails; driver errors during teardown are logged. Dropping a
//! handle closes it.

use ndarray::Array1;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::channel::{ChannelRole, ChannelSpec, Edge, DEFAULT_MAX_COUNT};
use crate::driver::DaqDriver;
use crate::error::{PlCounterError, Result};
use crate::sync::{ClockOutput, SyncWiring};
use crate::timing::{ClockConfig, StreamReadPolicy, TimingPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Unbound,
    Configured,
    Running,
    Stopped,
    Closed,
}

/// Raw tick counts returned by one buffered read, as consecutive (low, high) semi-period pairs.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBatch {
    ticks: Array1<u32>,
}

impl SampleBatch {
    pub fn new(ticks: Vec<u32>) -> Result<Self> {
        if ticks.is_empty() || ticks.len() % 2 != 0 {
            return Err(PlCounterError::MisalignedBatch { len: ticks.len() });
        }
        Ok(Self {
            ticks: Array1::from(ticks),
        })
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn ticks(&self) -> &Array1<u32> {
        &self.ticks
    }

    /// (low, high) tick pairs, one per clock period.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.ticks.exact_chunks(2).into_iter().map(|pair| (pair[0], pair[1]))
    }
}

pub struct TaskHandle<D: DaqDriver> {
    driver: Arc<D>,
    role: ChannelRole,
    generation: u64,
    raw: Option<D::Task>,
    state: TaskState,
    wiring: Option<SyncWiring>,
    // Ticks consumed by a read that timed out, delivered first by the next read
    carry: Vec<u32>,
}

impl<D: DaqDriver> TaskHandle<D> {
    /// A closed handle: no hardware task is allocated until [`TaskHandle::create`].
    pub fn new(driver: Arc<D>, role: ChannelRole, generation: u64) -> Self {
        Self {
            driver,
            role,
            generation,
            raw: None,
            state: TaskState::Closed,
            wiring: None,
            carry: Vec::new(),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Counter wiring applied by the last [`TaskHandle::configure_as_counter`].
    pub fn wiring(&self) -> Option<&SyncWiring> {
        self.wiring.as_ref()
    }

    fn invalid(&self, op: &'static str) -> PlCounterError {
        warn!("{} task: {} refused in state {:?}", self.role, op, self.state);
        PlCounterError::InvalidState {
            task: self.role.to_string(),
            op,
            state: self.state,
        }
    }

    fn expect_configurable(&self, role: ChannelRole, spec: &ChannelSpec, op: &'static str) -> Result<()> {
        if self.role != role || spec.role != role || self.state != TaskState::Unbound {
            return Err(self.invalid(op));
        }
        Ok(())
    }

    /// Allocates a fresh, unbound hardware task. Only valid on a closed handle.
    pub fn create(&mut self) -> Result<()> {
        if self.state != TaskState::Closed {
            return Err(self.invalid("create"));
        }
        let name = format!("{}{}", self.role, self.generation);
        let raw = self
            .driver
            .create_task(&name)
            .map_err(|e| PlCounterError::hardware_config(format!("creation of task {}", name), e))?;
        self.raw = Some(raw);
        self.wiring = None;
        self.state = TaskState::Unbound;
        debug!("created {} task '{}'", self.role, name);
        Ok(())
    }

    /// Binds the task to a continuous pulse train on the clock counter and returns its resolved
    /// internal output terminal.
    pub fn configure_as_clock(
        &mut self,
        spec: &ChannelSpec,
        cfg: &ClockConfig,
        timing: &TimingPolicy,
    ) -> Result<ClockOutput> {
        self.expect_configurable(ChannelRole::Clock, spec, "configure as clock")?;
        if spec.frequency_hz != Some(cfg.frequency_hz) {
            return Err(PlCounterError::invalid_channel(
                &spec.terminal,
                format!(
                    "clock spec frequency {:?} disagrees with clock config {} Hz",
                    spec.frequency_hz, cfg.frequency_hz
                ),
            ));
        }
        let driver = self.driver.clone();
        let raw = self.raw.as_mut().ok_or_else(|| PlCounterError::InvalidState {
            task: ChannelRole::Clock.to_string(),
            op: "configure as clock",
            state: TaskState::Closed,
        })?;
        let context = |what: &str| format!("{} of clock {}", what, spec.terminal);

        driver
            .create_co_pulse_chan_freq(
                raw,
                &spec.terminal,
                cfg.frequency_hz,
                cfg.duty_cycle,
                cfg.idle_state,
                cfg.initial_delay,
            )
            .map_err(|e| PlCounterError::hardware_config(context("pulse channel"), e))?;
        driver
            .cfg_implicit_timing(raw, timing.mode, timing.buffer_depth)
            .map_err(|e| PlCounterError::hardware_config(context("implicit timing"), e))?;
        let internal_output = driver
            .internal_output_terminal(raw)
            .map_err(|e| PlCounterError::hardware_config(context("internal output"), e))?;

        self.state = TaskState::Configured;
        debug!(
            "clock {} at {} Hz exposes {}",
            spec.terminal, cfg.frequency_hz, internal_output
        );
        Ok(ClockOutput::new(internal_output, self.generation))
    }

    /// Binds the task to a semi-period measurement gated by the clock and timed by the photon
    /// source described in `wiring`.
    pub fn configure_as_counter(
        &mut self,
        spec: &ChannelSpec,
        timing: &TimingPolicy,
        read_policy: &StreamReadPolicy,
        wiring: &SyncWiring,
    ) -> Result<()> {
        self.expect_configurable(ChannelRole::Counter, spec, "configure as counter")?;
        if wiring.generation() != self.generation {
            warn!(
                "counter task (generation {}) offered wiring from clock generation {}",
                self.generation,
                wiring.generation()
            );
            return Err(self.invalid("wire to a stale clock"));
        }
        let driver = self.driver.clone();
        let raw = self.raw.as_mut().ok_or_else(|| PlCounterError::InvalidState {
            task: ChannelRole::Counter.to_string(),
            op: "configure as counter",
            state: TaskState::Closed,
        })?;
        let context = |what: &str| format!("{} of counter {}", what, spec.terminal);

        driver
            .create_ci_semi_period_chan(
                raw,
                &spec.terminal,
                spec.max_count.unwrap_or(DEFAULT_MAX_COUNT),
                spec.edge_polarity.unwrap_or(Edge::Rising),
            )
            .map_err(|e| PlCounterError::hardware_config(context("semi-period channel"), e))?;
        driver
            .set_ci_semi_period_term(raw, wiring.gate_terminal())
            .map_err(|e| PlCounterError::hardware_config(context("gate terminal"), e))?;
        driver
            .set_ci_ctr_timebase_src(raw, wiring.timebase_source())
            .map_err(|e| PlCounterError::hardware_config(context("timebase source"), e))?;
        driver
            .cfg_implicit_timing(raw, timing.mode, timing.buffer_depth)
            .map_err(|e| PlCounterError::hardware_config(context("implicit timing"), e))?;
        driver
            .set_read_policy(raw, read_policy)
            .map_err(|e| PlCounterError::hardware_config(context("read policy"), e))?;

        self.wiring = Some(wiring.clone());
        self.state = TaskState::Configured;
        debug!(
            "counter {} gated by {} counting {}",
            spec.terminal,
            wiring.gate_terminal(),
            wiring.timebase_source()
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, TaskState::Configured | TaskState::Stopped) {
            return Err(self.invalid("start"));
        }
        let driver = self.driver.clone();
        if let Some(raw) = self.raw.as_mut() {
            driver
                .start_task(raw)
                .map_err(|source| PlCounterError::Driver { op: "start task", source })?;
        }
        self.carry.clear();
        self.state = TaskState::Running;
        debug!("{} task started", self.role);
        Ok(())
    }

    /// Stops a running task; the task keeps its configuration and can be started again.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            TaskState::Running => {
                let driver = self.driver.clone();
                if let Some(raw) = self.raw.as_mut() {
                    driver
                        .stop_task(raw)
                        .map_err(|source| PlCounterError::Driver { op: "stop task", source })?;
                }
                self.state = TaskState::Stopped;
                debug!("{} task stopped", self.role);
            }
            TaskState::Configured => self.state = TaskState::Stopped,
            _ => {}
        }
        Ok(())
    }

    /// Releases the hardware task. Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if let Some(mut raw) = self.raw.take() {
            if self.state == TaskState::Running {
                if let Err(e) = self.driver.stop_task(&mut raw) {
                    warn!("{} task: stop before clear failed: {}", self.role, e);
                }
            }
            if let Err(e) = self.driver.clear_task(raw) {
                warn!("{} task: clear failed: {}", self.role, e);
            }
            debug!("{} task closed", self.role);
        }
        self.wiring = None;
        self.carry.clear();
        self.state = TaskState::Closed;
    }

    /// Reads `sample_count` raw tick counts from the acquisition buffer, waiting at most `timeout`
    /// seconds. `sample_count` must be a positive even number.
    ///
    /// Ticks already consumed by a read that timed out are kept and returned first by the next
    /// read, so the (low, high) pairing survives partial reads. An overrun discards them.
    pub fn read(&mut self, sample_count: usize, timeout: f64) -> Result<SampleBatch> {
        if self.role != ChannelRole::Counter || self.state != TaskState::Running {
            return Err(self.invalid("read"));
        }
        if sample_count == 0 || sample_count % 2 != 0 {
            return Err(PlCounterError::MisalignedBatch { len: sample_count });
        }
        let driver = self.driver.clone();
        let raw = self.raw.as_mut().ok_or_else(|| PlCounterError::InvalidState {
            task: ChannelRole::Counter.to_string(),
            op: "read",
            state: TaskState::Closed,
        })?;
        let mut ticks = std::mem::take(&mut self.carry);
        if ticks.len() > sample_count {
            self.carry = ticks.split_off(sample_count);
        } else if ticks.len() < sample_count {
            let missing = sample_count - ticks.len();
            if let Err(source) = driver.read_counter_u32(raw, missing, timeout, &mut ticks) {
                if source.is_overrun() {
                    return Err(PlCounterError::BufferOverrun(source));
                }
                if !ticks.is_empty() {
                    debug!("counter task: keeping {} ticks from an incomplete read", ticks.len());
                }
                self.carry = ticks;
                return Err(if source.is_timeout() {
                    PlCounterError::AcquisitionTimeout { timeout, source }
                } else {
                    PlCounterError::Driver { op: "read counter", source }
                });
            }
        }
        SampleBatch::new(ticks)
    }
}

impl<D: DaqDriver> Drop for TaskHandle<D> {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DAQMX_ERR_RESOURCE_RESERVED;
    use crate::sim::{SimCall, SimDriver, SimFault};

    fn clock_spec(sim: &SimDriver, freq: f64) -> ChannelSpec {
        ChannelSpec::clock("Dev1/ctr1", freq, &sim.counter_channels().unwrap()).unwrap()
    }

    fn counter_spec(sim: &SimDriver) -> ChannelSpec {
        ChannelSpec::counter("Dev1/ctr0", Edge::Rising, DEFAULT_MAX_COUNT, &sim.counter_channels().unwrap())
            .unwrap()
    }

    fn configured_clock(sim: &Arc<SimDriver>, generation: u64) -> (TaskHandle<SimDriver>, ClockOutput) {
        let mut clock = TaskHandle::new(sim.clone(), ChannelRole::Clock, generation);
        clock.create().unwrap();
        let cfg = ClockConfig::new(200.).unwrap();
        let output = clock
            .configure_as_clock(&clock_spec(sim, 200.), &cfg, &TimingPolicy::default())
            .unwrap();
        (clock, output)
    }

    #[test]
    fn create_only_from_closed() {
        let sim = Arc::new(SimDriver::new());
        let mut task = TaskHandle::new(sim.clone(), ChannelRole::Clock, 1);
        assert_eq!(task.state(), TaskState::Closed);
        task.create().unwrap();
        assert_eq!(task.state(), TaskState::Unbound);
        assert!(matches!(task.create(), Err(PlCounterError::InvalidState { .. })));

        task.close();
        task.create().unwrap();
        assert_eq!(task.state(), TaskState::Unbound);
        assert_eq!(sim.created_tasks(), 2);
    }

    #[test]
    fn clock_lifecycle() {
        let sim = Arc::new(SimDriver::new());
        let (mut clock, output) = configured_clock(&sim, 7);
        assert_eq!(output.internal_output(), "Dev1/ctr1InternalOutput");
        assert_eq!(output.generation(), 7);
        assert_eq!(clock.state(), TaskState::Configured);

        clock.start().unwrap();
        assert_eq!(clock.state(), TaskState::Running);
        // Starting twice is refused and leaves the task running
        assert!(matches!(clock.start(), Err(PlCounterError::InvalidState { .. })));
        assert_eq!(clock.state(), TaskState::Running);

        clock.stop().unwrap();
        assert_eq!(clock.state(), TaskState::Stopped);
        clock.start().unwrap();
        clock.close();
        assert_eq!(clock.state(), TaskState::Closed);
        assert_eq!(sim.open_tasks(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let sim = Arc::new(SimDriver::new());
        let (mut clock, _) = configured_clock(&sim, 1);
        clock.close();
        clock.close();
        assert_eq!(clock.state(), TaskState::Closed);
        let clears = sim
            .calls()
            .iter()
            .filter(|call| matches!(call, SimCall::Clear { .. }))
            .count();
        assert_eq!(clears, 1);
    }

    #[test]
    fn role_mismatch_is_refused() {
        let sim = Arc::new(SimDriver::new());
        let mut counter = TaskHandle::new(sim.clone(), ChannelRole::Counter, 1);
        counter.create().unwrap();
        let cfg = ClockConfig::new(200.).unwrap();
        let err = counter
            .configure_as_clock(&clock_spec(&sim, 200.), &cfg, &TimingPolicy::default())
            .unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidState { .. }));
        assert_eq!(counter.state(), TaskState::Unbound);

        let (mut clock, _) = configured_clock(&sim, 1);
        clock.start().unwrap();
        assert!(matches!(clock.read(2, 1.), Err(PlCounterError::InvalidState { .. })));
    }

    #[test]
    fn counter_refuses_wiring_from_another_generation() {
        let sim = Arc::new(SimDriver::new());
        let (_clock, output) = configured_clock(&sim, 1);
        let wiring = SyncWiring::new(&output, "/Dev1/PFI0", &sim.triggering_sources().unwrap()).unwrap();

        let mut counter = TaskHandle::new(sim.clone(), ChannelRole::Counter, 2);
        counter.create().unwrap();
        let err = counter
            .configure_as_counter(
                &counter_spec(&sim),
                &TimingPolicy::default(),
                &StreamReadPolicy::default(),
                &wiring,
            )
            .unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidState { .. }));
        assert!(counter.wiring().is_none());
    }

    #[test]
    fn counter_reads_pairs() {
        let sim = Arc::new(SimDriver::new());
        let (mut clock, output) = configured_clock(&sim, 1);
        let wiring = SyncWiring::new(&output, "/Dev1/PFI0", &sim.triggering_sources().unwrap()).unwrap();
        let mut counter = TaskHandle::new(sim.clone(), ChannelRole::Counter, 1);
        counter.create().unwrap();
        counter
            .configure_as_counter(
                &counter_spec(&sim),
                &TimingPolicy::default(),
                &StreamReadPolicy::default(),
                &wiring,
            )
            .unwrap();
        assert_eq!(counter.wiring().unwrap().gate_terminal(), "/Dev1/ctr1InternalOutput");

        // Reading before start is refused
        assert!(matches!(counter.read(2, 1.), Err(PlCounterError::InvalidState { .. })));

        clock.start().unwrap();
        counter.start().unwrap();
        sim.push_samples(&[10, 20, 30, 40]);
        let batch = counter.read(4, 1.).unwrap();
        assert_eq!(batch.pairs().collect::<Vec<_>>(), vec![(10, 20), (30, 40)]);

        assert!(matches!(counter.read(3, 1.), Err(PlCounterError::MisalignedBatch { len: 3 })));
        assert!(matches!(
            counter.read(2, 0.01),
            Err(PlCounterError::AcquisitionTimeout { .. })
        ));
        assert_eq!(counter.state(), TaskState::Running);

        sim.inject(SimFault::Overrun);
        assert!(matches!(counter.read(2, 1.), Err(PlCounterError::BufferOverrun(_))));
    }

    #[test]
    fn incomplete_read_keeps_pairs_aligned() {
        let sim = Arc::new(SimDriver::new());
        let (mut clock, output) = configured_clock(&sim, 1);
        let wiring = SyncWiring::new(&output, "/Dev1/PFI0", &sim.triggering_sources().unwrap()).unwrap();
        let mut counter = TaskHandle::new(sim.clone(), ChannelRole::Counter, 1);
        counter.create().unwrap();
        counter
            .configure_as_counter(
                &counter_spec(&sim),
                &TimingPolicy::default(),
                &StreamReadPolicy::default(),
                &wiring,
            )
            .unwrap();
        clock.start().unwrap();
        counter.start().unwrap();

        // Only the low half of the first window has arrived
        sim.push_samples(&[11]);
        assert!(matches!(
            counter.read(2, 0.01),
            Err(PlCounterError::AcquisitionTimeout { .. })
        ));
        sim.push_samples(&[12, 21, 22]);
        let batch = counter.read(2, 1.).unwrap();
        assert_eq!(batch.pairs().collect::<Vec<_>>(), vec![(11, 12)]);
        assert_eq!(counter.read(2, 1.).unwrap().pairs().collect::<Vec<_>>(), vec![(21, 22)]);
        assert_eq!(
            sim.calls().last(),
            Some(&SimCall::Read { task: "counter1".into(), num_samps: 2 })
        );

        // A restart drops held ticks
        sim.push_samples(&[5]);
        assert!(counter.read(2, 0.01).is_err());
        counter.stop().unwrap();
        counter.start().unwrap();
        sim.push_samples(&[6, 7]);
        assert_eq!(counter.read(2, 1.).unwrap().pairs().collect::<Vec<_>>(), vec![(6, 7)]);
    }

    #[test]
    fn busy_counter_is_a_config_error() {
        let sim = Arc::new(SimDriver::new());
        sim.reserve_counter("Dev1/ctr1");
        let mut clock = TaskHandle::new(sim.clone(), ChannelRole::Clock, 1);
        clock.create().unwrap();
        let err = clock
            .configure_as_clock(
                &clock_spec(&sim, 200.),
                &ClockConfig::new(200.).unwrap(),
                &TimingPolicy::default(),
            )
            .unwrap_err();
        match err {
            PlCounterError::HardwareConfig { source, .. } => {
                assert_eq!(source.code, DAQMX_ERR_RESOURCE_RESERVED)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn batch_must_hold_pairs() {
        assert!(SampleBatch::new(vec![1, 2]).is_ok());
        assert_eq!(
            SampleBatch::new(vec![1, 2, 3]),
            Err(PlCounterError::MisalignedBatch { len: 3 })
        );
        assert_eq!(SampleBatch::new(vec![]), Err(PlCounterError::MisalignedBatch { len: 0 }));
    }
}
