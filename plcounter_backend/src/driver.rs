//! Hardware abstraction over the NI-DAQmx counter/timer primitives used by the photon counter.
//!
//! ## Overview
//!
//! The [`DaqDriver`] trait is the seam between the counting logic of this crate and a concrete
//! driver backend. Each method maps onto one (or a small group of) DAQmx C-functions, e.g.
//! [`DaqDriver::create_co_pulse_chan_freq`] corresponds to `DAQmxCreateCOPulseChanFreq` and
//! [`DaqDriver::set_ci_semi_period_term`] to `DAQmxSetCISemiPeriodTerm`.
//!
//! Two implementations exist:
//! - [`crate::sim::SimDriver`], a simulated card used by tests and demos.
//! - `NiDaqmxDriver` in `plcounterctrl_backend` (feature `daqmx`), which links against the NI-DAQmx
//!   C library.
//!
//! ## Error codes
//!
//! Every driver call reports failure as a [`DAQmxError`], carrying the (negative) DAQmx status code
//! and the extended error string. The handful of codes that the acquisition logic reacts to are
//! exported as constants and classified by [`DAQmxError::is_timeout`] and [`DAQmxError::is_overrun`].

use thiserror::Error;

use crate::channel::{Edge, Level};
use crate::timing::{SampleMode, StreamReadPolicy};

/// Some or all of the requested samples have not yet been acquired within the read timeout.
pub const DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
/// The application is not able to keep up with the hardware acquisition: unread samples
/// would have been overwritten.
pub const DAQMX_ERR_READ_OVERRUN: i32 = -200279;
/// The operation did not complete because the specified timeout expired.
pub const DAQMX_ERR_WAIT_TIMEOUT: i32 = -200474;
/// The specified resource is reserved by another task.
pub const DAQMX_ERR_RESOURCE_RESERVED: i32 = -50103;
/// The physical channel or terminal does not exist on the device.
pub const DAQMX_ERR_INVALID_PHYS_CHAN: i32 = -200170;
/// The task handle is not valid (e.g. already cleared).
pub const DAQMX_ERR_INVALID_TASK: i32 = -200088;

/// Error reported by a DAQmx driver call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("DAQmx error {code}: {message}")]
pub struct DAQmxError {
    pub code: i32,
    pub message: String,
}

impl DAQmxError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The read returned before enough samples were available.
    pub fn is_timeout(&self) -> bool {
        self.code == DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE || self.code == DAQMX_ERR_WAIT_TIMEOUT
    }

    /// The circular acquisition buffer wrapped before the samples were read.
    pub fn is_overrun(&self) -> bool {
        self.code == DAQMX_ERR_READ_OVERRUN
    }
}

/// The hardware operations needed to pair a pulse-train clock with a semi-period counter.
///
/// A driver owns no task state itself: every call receives the raw task (`Self::Task`) it acts on.
/// Raw tasks are created by [`DaqDriver::create_task`] and must be released with
/// [`DaqDriver::clear_task`]; [`crate::task::TaskHandle`] enforces that lifecycle.
pub trait DaqDriver {
    /// Raw task object owned by a [`crate::task::TaskHandle`].
    type Task;

    /// `DAQmxCreateTask`: allocates an empty task.
    fn create_task(&self, name: &str) -> Result<Self::Task, DAQmxError>;

    /// `DAQmxCreateCOPulseChanFreq`: adds a pulse-train generation channel on `counter` and
    /// returns the virtual channel name assigned by the driver.
    fn create_co_pulse_chan_freq(
        &self,
        task: &mut Self::Task,
        counter: &str,
        freq: f64,
        duty_cycle: f64,
        idle_state: Level,
        initial_delay: f64,
    ) -> Result<String, DAQmxError>;

    /// Name of the internal output terminal exposed by the pulse channel of `task`, without the
    /// leading `/` (e.g. `Dev1/ctr1InternalOutput`). Only valid after the pulse channel exists.
    fn internal_output_terminal(&self, task: &Self::Task) -> Result<String, DAQmxError>;

    /// `DAQmxCreateCISemiPeriodChan` in tick units: adds a semi-period measurement channel on
    /// `counter` able to measure up to `max_count` ticks.
    fn create_ci_semi_period_chan(
        &self,
        task: &mut Self::Task,
        counter: &str,
        max_count: f64,
        edge: Edge,
    ) -> Result<String, DAQmxError>;

    /// `DAQmxSetCISemiPeriodTerm`: the terminal whose semi-periods are measured (the gate).
    fn set_ci_semi_period_term(&self, task: &mut Self::Task, terminal: &str)
        -> Result<(), DAQmxError>;

    /// `DAQmxSetCICtrTimebaseSrc`: the signal whose edges are counted (the timebase).
    fn set_ci_ctr_timebase_src(&self, task: &mut Self::Task, terminal: &str)
        -> Result<(), DAQmxError>;

    /// `DAQmxCfgImplicitTiming`
    fn cfg_implicit_timing(
        &self,
        task: &mut Self::Task,
        mode: SampleMode,
        samps_per_chan: u64,
    ) -> Result<(), DAQmxError>;

    /// `DAQmxSetReadRelativeTo`, `DAQmxSetReadOffset` and `DAQmxSetReadOverWrite`.
    fn set_read_policy(
        &self,
        task: &mut Self::Task,
        policy: &StreamReadPolicy,
    ) -> Result<(), DAQmxError>;

    fn start_task(&self, task: &mut Self::Task) -> Result<(), DAQmxError>;
    fn stop_task(&self, task: &mut Self::Task) -> Result<(), DAQmxError>;
    /// `DAQmxClearTask`: releases the task and every resource reserved by it.
    fn clear_task(&self, task: Self::Task) -> Result<(), DAQmxError>;

    /// `DAQmxReadCounterU32`: blocks until `num_samps` samples are available or `timeout`
    /// (seconds) elapses, appending the samples read to `out`.
    ///
    /// Samples read before a timeout have left the acquisition buffer: they are appended to `out`
    /// even when the call fails.
    fn read_counter_u32(
        &self,
        task: &mut Self::Task,
        num_samps: usize,
        timeout: f64,
        out: &mut Vec<u32>,
    ) -> Result<(), DAQmxError>;

    /// Physical counter channels available on the system (e.g. `Dev1/ctr0`).
    fn counter_channels(&self) -> Result<Vec<String>, DAQmxError>;

    /// Terminals usable as a counter timebase or trigger source (e.g. `/Dev1/PFI0`).
    fn triggering_sources(&self) -> Result<Vec<String>, DAQmxError>;
}
