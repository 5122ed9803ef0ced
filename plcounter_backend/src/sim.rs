//! A simulated NI counter/timer card implementing [`DaqDriver`].
//!
//! [`SimDriver`] behaves like a DAQmx driver with one or more devices, each exposing counters
//! (`Dev1/ctr0`, ...) and PFI terminals (`/Dev1/PFI0`, ...). It is used by the test suites and the
//! demo binary, so the acquisition logic can be exercised without hardware.
//!
//! ## What is simulated
//!
//! - **Resource reservation**: a counter used by one task cannot be used by another until the
//!   first task is cleared (DAQmx error `-50103`).
//! - **Routing**: a semi-period gate must be an existing PFI line or the internal output of an
//!   existing counter.
//! - **Circular buffer**: every semi-period task owns a buffer of the depth given to
//!   [`DaqDriver::cfg_implicit_timing`]. Samples pushed with [`SimDriver::push_samples`] fill it;
//!   under [`OverwriteMode::DoNotOverwriteUnread`] a full buffer flags an overrun reported by the
//!   next read, under [`OverwriteMode::OverwriteUnread`] the oldest samples are dropped.
//! - **Photon source**: with [`SimDriver::set_photon_rate`], a read that finds too few buffered
//!   samples synthesizes (low, high) pairs from the frequency and duty cycle of the *running clock
//!   whose internal output is wired to the gate*. A counter gated by the wrong terminal, or by a
//!   stopped clock, never receives data and times out.
//! - **Faults**: [`SimDriver::inject`] queues one-shot failures.
//!
//! Reads never block: a read that cannot be satisfied fails immediately with the DAQmx timeout
//! code, whatever timeout was requested.
//!
//! Every driver call is appended to a call log ([`SimDriver::calls`]) so tests can assert on
//! ordering.

use indexmap::IndexMap;
use maplit::hashmap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

use crate::channel::{ChannelRole, Edge, Level};
use crate::driver::*;
use crate::timing::{
    OverwriteMode, ReadRelativeTo, SampleMode, StreamReadPolicy, DEFAULT_BUFFER_DEPTH,
};
use crate::utils::same_terminal;

/// Requested value is not supported for this property.
pub const SIM_ERR_UNSUPPORTED_VALUE: i32 = -200077;
/// Source terminal to be routed could not be found on the device.
pub const SIM_ERR_INVALID_ROUTE: i32 = -89120;

fn daqmx_err(code: i32, detail: &str) -> DAQmxError {
    let messages = hashmap! {
        DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE =>
            "Some or all of the samples requested have not yet been acquired.",
        DAQMX_ERR_READ_OVERRUN =>
            "The application is not able to keep up with the hardware acquisition.",
        DAQMX_ERR_WAIT_TIMEOUT => "Wait Until Done did not indicate that the task was done within the specified timeout.",
        DAQMX_ERR_RESOURCE_RESERVED => "The specified resource is reserved.",
        DAQMX_ERR_INVALID_PHYS_CHAN => "Physical channel specified does not exist on this device.",
        DAQMX_ERR_INVALID_TASK => "Task specified is invalid or does not exist.",
        SIM_ERR_UNSUPPORTED_VALUE => "Requested value is not a supported value for this property.",
        SIM_ERR_INVALID_ROUTE => "Source terminal to be routed could not be found on the device.",
    };
    let base = messages.get(&code).copied().unwrap_or("Simulated driver error.");
    DAQmxError::new(code, format!("{} {}", base, detail).trim_end().to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimCall {
    CreateTask { task: String },
    CreateCoPulseChan { task: String, counter: String, freq: f64 },
    CreateCiSemiPeriodChan { task: String, counter: String },
    SetSemiPeriodTerm { task: String, terminal: String },
    SetTimebaseSrc { task: String, terminal: String },
    CfgImplicitTiming { task: String, mode: SampleMode, samps_per_chan: u64 },
    SetReadPolicy { task: String, policy: StreamReadPolicy },
    Start { task: String },
    Stop { task: String },
    Clear { task: String },
    Read { task: String, num_samps: usize },
}

impl SimCall {
    /// Name of the task the call acted on.
    pub fn task(&self) -> &str {
        match self {
            SimCall::CreateTask { task }
            | SimCall::CreateCoPulseChan { task, .. }
            | SimCall::CreateCiSemiPeriodChan { task, .. }
            | SimCall::SetSemiPeriodTerm { task, .. }
            | SimCall::SetTimebaseSrc { task, .. }
            | SimCall::CfgImplicitTiming { task, .. }
            | SimCall::SetReadPolicy { task, .. }
            | SimCall::Start { task }
            | SimCall::Stop { task }
            | SimCall::Clear { task }
            | SimCall::Read { task, .. } => task,
        }
    }
}

/// One-shot failures consumed by the next matching driver call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFault {
    /// Next read fails with `-200284`
    ReadTimeout,
    /// Next read fails with `-200279`
    Overrun,
    /// Next start of a task with this role fails
    StartFailure(ChannelRole),
    /// Next channel creation of this role is rejected
    ConfigFailure(ChannelRole),
}

/// Raw task handed out by [`SimDriver::create_task`].
#[derive(Debug)]
pub struct SimTask {
    id: u64,
}

enum SimChan {
    Pulse {
        counter: String,
        freq: f64,
        duty_cycle: f64,
    },
    SemiPeriod {
        gate: Option<String>,
        timebase: Option<String>,
    },
}

struct TaskSlot {
    name: String,
    chan: Option<SimChan>,
    running: bool,
    buffer: VecDeque<u32>,
    depth: usize,
    policy: StreamReadPolicy,
    overrun: bool,
}

impl TaskSlot {
    fn is_counter(&self) -> bool {
        matches!(self.chan, Some(SimChan::SemiPeriod { .. }))
    }

    fn role(&self) -> Option<ChannelRole> {
        match self.chan {
            Some(SimChan::Pulse { .. }) => Some(ChannelRole::Clock),
            Some(SimChan::SemiPeriod { .. }) => Some(ChannelRole::Counter),
            None => None,
        }
    }

    fn fill(&mut self, ticks: &[u32]) {
        for &tick in ticks {
            if self.buffer.len() >= self.depth {
                match self.policy.overwrite_mode {
                    OverwriteMode::OverwriteUnread => {
                        self.buffer.pop_front();
                    }
                    OverwriteMode::DoNotOverwriteUnread => {
                        self.overrun = true;
                        continue;
                    }
                }
            }
            self.buffer.push_back(tick);
        }
    }
}

struct SimDevice {
    counters: usize,
    pfi_lines: usize,
}

struct SimState {
    devices: IndexMap<String, SimDevice>,
    tasks: IndexMap<u64, TaskSlot>,
    next_id: u64,
    calls: Vec<SimCall>,
    faults: VecDeque<SimFault>,
    // counter -> owning task; `None` when reserved outside of this driver
    reserved: IndexMap<String, Option<u64>>,
    photon_rate_kcps: Option<f64>,
    pending: Vec<u32>,
}

impl SimState {
    fn slot(&self, id: u64) -> Result<&TaskSlot, DAQmxError> {
        self.tasks
            .get(&id)
            .ok_or_else(|| daqmx_err(DAQMX_ERR_INVALID_TASK, &format!("(task id {})", id)))
    }

    fn slot_mut(&mut self, id: u64) -> Result<&mut TaskSlot, DAQmxError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| daqmx_err(DAQMX_ERR_INVALID_TASK, &format!("(task id {})", id)))
    }

    fn log(&mut self, id: u64, call: impl FnOnce(String) -> SimCall) -> Result<(), DAQmxError> {
        let name = self.slot(id)?.name.clone();
        let call = call(name);
        trace!("sim driver: {:?}", call);
        self.calls.push(call);
        Ok(())
    }

    fn take_fault(&mut self, fault: SimFault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    fn counter_channels(&self) -> Vec<String> {
        self.devices
            .iter()
            .flat_map(|(dev, spec)| (0..spec.counters).map(move |i| format!("{}/ctr{}", dev, i)))
            .collect()
    }

    fn triggering_sources(&self) -> Vec<String> {
        self.devices
            .iter()
            .flat_map(|(dev, spec)| (0..spec.pfi_lines).map(move |i| format!("/{}/PFI{}", dev, i)))
            .collect()
    }

    fn routable(&self, terminal: &str) -> bool {
        let outputs = self
            .counter_channels()
            .into_iter()
            .map(|ctr| format!("{}InternalOutput", ctr));
        self.triggering_sources()
            .into_iter()
            .chain(outputs)
            .any(|known| same_terminal(&known, terminal))
    }

    fn reserve(&mut self, counter: &str, id: u64) -> Result<String, DAQmxError> {
        let counter = counter.trim_start_matches('/').to_string();
        if !self.counter_channels().contains(&counter) {
            return Err(daqmx_err(DAQMX_ERR_INVALID_PHYS_CHAN, &counter));
        }
        match self.reserved.get(&counter) {
            Some(Some(owner)) if *owner == id => {}
            Some(_) => return Err(daqmx_err(DAQMX_ERR_RESOURCE_RESERVED, &counter)),
            None => {
                self.reserved.insert(counter.clone(), Some(id));
            }
        }
        Ok(counter)
    }

    // Frequency and duty cycle of the running clock whose internal output is `gate`
    fn clock_behind(&self, gate: &str) -> Option<(f64, f64)> {
        self.tasks.values().find_map(|slot| match &slot.chan {
            Some(SimChan::Pulse {
                counter,
                freq,
                duty_cycle,
            }) if slot.running && same_terminal(&format!("{}InternalOutput", counter), gate) => {
                Some((*freq, *duty_cycle))
            }
            _ => None,
        })
    }
}

pub struct SimDriver {
    state: Mutex<SimState>,
}

impl SimDriver {
    /// A single device `Dev1` with 4 counters and 16 PFI lines.
    pub fn new() -> Self {
        Self::with_devices(&[("Dev1", 4, 16)])
    }

    /// Devices given as `(name, number of counters, number of PFI lines)`.
    pub fn with_devices(devices: &[(&str, usize, usize)]) -> Self {
        let devices = devices
            .iter()
            .map(|(name, counters, pfi_lines)| {
                (
                    name.to_string(),
                    SimDevice {
                        counters: *counters,
                        pfi_lines: *pfi_lines,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                devices,
                tasks: IndexMap::new(),
                next_id: 0,
                calls: Vec::new(),
                faults: VecDeque::new(),
                reserved: IndexMap::new(),
                photon_rate_kcps: None,
                pending: Vec::new(),
            }),
        }
    }

    /// Synthetic photon rate seen by every correctly wired counter; `None` disables it.
    pub fn set_photon_rate(&self, kcps: Option<f64>) {
        self.state.lock().photon_rate_kcps = kcps;
    }

    /// Feeds raw tick counts into the running counter task, or holds them until one starts.
    pub fn push_samples(&self, ticks: &[u32]) {
        let mut st = self.state.lock();
        match st.tasks.values_mut().rev().find(|slot| slot.running && slot.is_counter()) {
            Some(slot) => slot.fill(ticks),
            None => st.pending.extend_from_slice(ticks),
        }
    }

    pub fn inject(&self, fault: SimFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Marks `counter` as used by another application.
    pub fn reserve_counter(&self, counter: &str) {
        self.state
            .lock()
            .reserved
            .insert(counter.trim_start_matches('/').to_string(), None);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of tasks ever created.
    pub fn created_tasks(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, SimCall::CreateTask { .. }))
            .count()
    }

    /// Number of tasks created and not yet cleared.
    pub fn open_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Names of the running tasks, in creation order.
    pub fn running_tasks(&self) -> Vec<String> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|slot| slot.running)
            .map(|slot| slot.name.clone())
            .collect()
    }

    /// Samples waiting in the buffer of the running counter task.
    pub fn buffered_samples(&self) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .rev()
            .find(|slot| slot.running && slot.is_counter())
            .map_or(0, |slot| slot.buffer.len())
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for SimDriver {
    type Task = SimTask;

    fn create_task(&self, name: &str) -> Result<SimTask, DAQmxError> {
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        st.tasks.insert(
            id,
            TaskSlot {
                name: name.to_string(),
                chan: None,
                running: false,
                buffer: VecDeque::new(),
                depth: DEFAULT_BUFFER_DEPTH as usize,
                policy: StreamReadPolicy::default(),
                overrun: false,
            },
        );
        st.log(id, |task| SimCall::CreateTask { task })?;
        Ok(SimTask { id })
    }

    fn create_co_pulse_chan_freq(
        &self,
        task: &mut SimTask,
        counter: &str,
        freq: f64,
        duty_cycle: f64,
        _idle_state: Level,
        _initial_delay: f64,
    ) -> Result<String, DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::CreateCoPulseChan {
            task,
            counter: counter.to_string(),
            freq,
        })?;
        if st.take_fault(SimFault::ConfigFailure(ChannelRole::Clock)) || !(freq > 0.) {
            return Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, &format!("(freq {})", freq)));
        }
        let counter = st.reserve(counter, task.id)?;
        st.slot_mut(task.id)?.chan = Some(SimChan::Pulse {
            counter: counter.clone(),
            freq,
            duty_cycle,
        });
        Ok(counter)
    }

    fn internal_output_terminal(&self, task: &SimTask) -> Result<String, DAQmxError> {
        let st = self.state.lock();
        match &st.slot(task.id)?.chan {
            Some(SimChan::Pulse { counter, .. }) => Ok(format!("{}InternalOutput", counter)),
            _ => Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, "(task has no pulse channel)")),
        }
    }

    fn create_ci_semi_period_chan(
        &self,
        task: &mut SimTask,
        counter: &str,
        max_count: f64,
        _edge: Edge,
    ) -> Result<String, DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::CreateCiSemiPeriodChan {
            task,
            counter: counter.to_string(),
        })?;
        if st.take_fault(SimFault::ConfigFailure(ChannelRole::Counter)) || !(max_count > 0.) {
            return Err(daqmx_err(
                SIM_ERR_UNSUPPORTED_VALUE,
                &format!("(max_count {})", max_count),
            ));
        }
        let counter = st.reserve(counter, task.id)?;
        st.slot_mut(task.id)?.chan = Some(SimChan::SemiPeriod {
            gate: None,
            timebase: None,
        });
        Ok(counter)
    }

    fn set_ci_semi_period_term(&self, task: &mut SimTask, terminal: &str) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::SetSemiPeriodTerm {
            task,
            terminal: terminal.to_string(),
        })?;
        if !st.routable(terminal) {
            return Err(daqmx_err(SIM_ERR_INVALID_ROUTE, terminal));
        }
        match &mut st.slot_mut(task.id)?.chan {
            Some(SimChan::SemiPeriod { gate, .. }) => {
                *gate = Some(terminal.to_string());
                Ok(())
            }
            _ => Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, "(task has no semi-period channel)")),
        }
    }

    fn set_ci_ctr_timebase_src(&self, task: &mut SimTask, terminal: &str) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::SetTimebaseSrc {
            task,
            terminal: terminal.to_string(),
        })?;
        if !st.routable(terminal) {
            return Err(daqmx_err(SIM_ERR_INVALID_ROUTE, terminal));
        }
        match &mut st.slot_mut(task.id)?.chan {
            Some(SimChan::SemiPeriod { timebase, .. }) => {
                *timebase = Some(terminal.to_string());
                Ok(())
            }
            _ => Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, "(task has no semi-period channel)")),
        }
    }

    fn cfg_implicit_timing(
        &self,
        task: &mut SimTask,
        mode: SampleMode,
        samps_per_chan: u64,
    ) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::CfgImplicitTiming {
            task,
            mode,
            samps_per_chan,
        })?;
        if samps_per_chan == 0 {
            return Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, "(samps_per_chan 0)"));
        }
        st.slot_mut(task.id)?.depth = samps_per_chan as usize;
        Ok(())
    }

    fn set_read_policy(&self, task: &mut SimTask, policy: &StreamReadPolicy) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::SetReadPolicy {
            task,
            policy: *policy,
        })?;
        st.slot_mut(task.id)?.policy = *policy;
        Ok(())
    }

    fn start_task(&self, task: &mut SimTask) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::Start { task })?;
        let role = st.slot(task.id)?.role();
        if role.map_or(false, |role| st.take_fault(SimFault::StartFailure(role))) {
            return Err(daqmx_err(DAQMX_ERR_RESOURCE_RESERVED, "(injected start failure)"));
        }
        let pending = std::mem::take(&mut st.pending);
        let slot = st.slot_mut(task.id)?;
        slot.running = true;
        slot.overrun = false;
        slot.buffer.clear();
        if slot.is_counter() {
            slot.fill(&pending);
        } else {
            st.pending = pending;
        }
        Ok(())
    }

    fn stop_task(&self, task: &mut SimTask) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::Stop { task })?;
        st.slot_mut(task.id)?.running = false;
        Ok(())
    }

    fn clear_task(&self, task: SimTask) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::Clear { task })?;
        st.tasks.shift_remove(&task.id);
        st.reserved.retain(|_, owner| *owner != Some(task.id));
        Ok(())
    }

    fn read_counter_u32(
        &self,
        task: &mut SimTask,
        num_samps: usize,
        timeout: f64,
        out: &mut Vec<u32>,
    ) -> Result<(), DAQmxError> {
        let mut st = self.state.lock();
        st.log(task.id, |task| SimCall::Read { task, num_samps })?;
        let timed_out = || {
            daqmx_err(
                DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE,
                &format!("(requested {} samples, timeout {} s)", num_samps, timeout),
            )
        };
        if st.take_fault(SimFault::Overrun) {
            return Err(daqmx_err(DAQMX_ERR_READ_OVERRUN, ""));
        }
        if st.take_fault(SimFault::ReadTimeout) {
            return Err(timed_out());
        }

        let (running, gate, timebase) = {
            let slot = st.slot(task.id)?;
            match &slot.chan {
                Some(SimChan::SemiPeriod { gate, timebase }) => {
                    (slot.running, gate.clone(), timebase.clone())
                }
                _ => return Err(daqmx_err(SIM_ERR_UNSUPPORTED_VALUE, "(not a counter input task)")),
            }
        };
        if !running {
            return Err(daqmx_err(DAQMX_ERR_INVALID_TASK, "(task is not running)"));
        }

        // Synthesize photon counts for the missing windows
        let synthetic = match (st.photon_rate_kcps, gate, timebase) {
            (Some(kcps), Some(gate), Some(_)) => st.clock_behind(&gate).map(|(freq, duty)| {
                let total = kcps * 1e3 / freq;
                let high = (total * duty).round() as u32;
                let low = (total * (1. - duty)).round() as u32;
                (low, high)
            }),
            _ => None,
        };

        let slot = st.slot_mut(task.id)?;
        if slot.overrun {
            slot.overrun = false;
            slot.buffer.clear();
            return Err(daqmx_err(DAQMX_ERR_READ_OVERRUN, ""));
        }
        if let Some((low, high)) = synthetic {
            while slot.buffer.len() < num_samps && slot.buffer.len() + 2 <= slot.depth {
                slot.buffer.push_back(low);
                slot.buffer.push_back(high);
            }
        }
        if slot.buffer.len() < num_samps {
            // Whatever arrived before the timeout is consumed and handed back
            out.extend(slot.buffer.drain(..));
            return Err(timed_out());
        }
        if slot.policy.reference_point == ReadRelativeTo::MostRecentSample {
            let stale = slot.buffer.len() - num_samps;
            slot.buffer.drain(..stale);
        }
        out.extend(slot.buffer.drain(..num_samps));
        Ok(())
    }

    fn counter_channels(&self) -> Result<Vec<String>, DAQmxError> {
        Ok(self.state.lock().counter_channels())
    }

    fn triggering_sources(&self) -> Result<Vec<String>, DAQmxError> {
        Ok(self.state.lock().triggering_sources())
    }
}
