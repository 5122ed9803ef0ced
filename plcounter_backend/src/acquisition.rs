//! Acquisition loop and rate conversion.
//!
//! ## States
//!
//! - `Idle`: no tasks configured.
//! - `Armed`: both tasks configured (and possibly running), no continuous stream established.
//! - `Live`: a continuous grab started both tasks; further continuous grabs only read.
//!
//! A continuous grab while `Live` with both tasks running reuses the stream. Any other grab
//! rebuilds and restarts the pair first. Setting changes are handled by
//! [`AcquisitionLoop::commit_setting`]: `clock_freq` restarts the pair with the new counting time
//! and keeps the current state; every other key stops the pair and rebuilds it (`Armed`).
//!
//! ## Conversion
//!
//! A buffered read returns consecutive (low, high) semi-period tick counts. Both halves of one
//! clock period together make one counting window of `counting_time = 1 / clock_freq` seconds:
//!
//! ```text
//! rate_kcps = 1e-3 * (low + high) / counting_time
//! ```
//!
//! ## Read errors
//!
//! A timeout keeps the loop `Live`: the next grab reads again. An overrun downgrades `Live` to
//! `Armed`, so the next grab rebuilds and restarts the stream from a clean buffer.

use ndarray::Array1;
use tracing::{debug, error, info, warn};

use crate::controller::DualTaskController;
use crate::driver::DaqDriver;
use crate::error::{PlCounterError, Result};
use crate::settings::{CounterSettings, Reaction, SettingKey, SettingValue};
use crate::task::SampleBatch;
use crate::timing::ClockConfig;

/// Counting window assumed before the clock has ever been configured, in seconds.
pub const DEFAULT_COUNTING_TIME: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcqState {
    Idle,
    Armed,
    Live,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateConverter {
    counting_time: f64,
}

impl RateConverter {
    pub fn new(counting_time: f64) -> Self {
        Self { counting_time }
    }

    pub fn from_clock(cfg: &ClockConfig) -> Self {
        Self::new(cfg.counting_time())
    }

    pub fn counting_time(&self) -> f64 {
        self.counting_time
    }

    /// One rate in kcounts/s per (low, high) pair of the batch.
    pub fn convert(&self, batch: &SampleBatch) -> Array1<f64> {
        Array1::from_iter(
            batch
                .pairs()
                .map(|(low, high)| 1e-3 * (low as f64 + high as f64) / self.counting_time),
        )
    }
}

impl Default for RateConverter {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTING_TIME)
    }
}

pub struct AcquisitionLoop {
    settings: CounterSettings,
    state: AcqState,
    converter: RateConverter,
}

impl AcquisitionLoop {
    pub fn new(settings: CounterSettings) -> Self {
        Self {
            settings,
            state: AcqState::Idle,
            converter: RateConverter::default(),
        }
    }

    pub fn settings(&self) -> &CounterSettings {
        &self.settings
    }

    pub fn state(&self) -> AcqState {
        self.state
    }

    pub fn counting_time(&self) -> f64 {
        self.converter.counting_time()
    }

    pub fn converter(&self) -> &RateConverter {
        &self.converter
    }

    /// Rebuilds the task pair from the current settings (`Armed` on success, `Idle` on failure).
    pub fn configure<D: DaqDriver>(&mut self, ctrl: &mut DualTaskController<D>) -> Result<()> {
        let clock_cfg = self.settings.clock_config()?;
        let result = ctrl
            .driver()
            .counter_channels()
            .map_err(|e| PlCounterError::hardware_config("listing of counter channels", e))
            .and_then(|counters| {
                let clock_spec = self.settings.clock_spec(&counters)?;
                let counter_spec = self.settings.counter_spec(&counters)?;
                ctrl.rebuild(&clock_spec, &clock_cfg, &counter_spec, &self.settings.photon_channel)
            });
        match result {
            Ok(()) => {
                self.converter = RateConverter::from_clock(&clock_cfg);
                self.state = AcqState::Armed;
                Ok(())
            }
            Err(e) => {
                ctrl.close_both();
                self.state = AcqState::Idle;
                Err(e)
            }
        }
    }

    /// Stores a new setting value and brings the hardware in line with it.
    ///
    /// While `Idle` only the stored settings change. Invalid values are rejected without touching
    /// the hardware.
    pub fn commit_setting<D: DaqDriver>(
        &mut self,
        ctrl: &mut DualTaskController<D>,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<()> {
        self.settings.apply(key, value)?;
        info!("setting {} = {}", key, self.settings.get(key));
        if self.state == AcqState::Idle {
            return Ok(());
        }
        match key.reaction() {
            Reaction::Restart => {
                let previous = self.state;
                self.configure(ctrl)?;
                if let Err(e) = ctrl.start_both() {
                    error!("restart after {} change failed: {}", key, e);
                    return Err(e);
                }
                self.state = previous;
                debug!("counting time is now {} s", self.counting_time());
            }
            Reaction::Rebind => {
                if let Err(e) = ctrl.stop_both() {
                    warn!("stopping tasks before rebind: {}", e);
                }
                self.state = AcqState::Idle;
                self.configure(ctrl)?;
            }
        }
        Ok(())
    }

    /// Reads one batch and converts it to rates in kcounts/s.
    ///
    /// A continuous grab while `Live` reuses the running stream; any other grab rebuilds and
    /// restarts the pair first.
    pub fn grab<D: DaqDriver>(
        &mut self,
        ctrl: &mut DualTaskController<D>,
        continuous: bool,
    ) -> Result<Array1<f64>> {
        let reuse = continuous && self.state == AcqState::Live && ctrl.is_running();
        if !reuse {
            self.configure(ctrl)?;
            ctrl.start_both()?;
            self.state = if continuous {
                AcqState::Live
            } else {
                AcqState::Armed
            };
        }

        let batch = match ctrl.read(self.settings.samples_per_read, self.settings.read_timeout) {
            Ok(batch) => batch,
            Err(e) => {
                match &e {
                    PlCounterError::BufferOverrun(_) => {
                        warn!("{}; stream will be rebuilt on the next grab", e);
                        if self.state == AcqState::Live {
                            self.state = AcqState::Armed;
                        }
                    }
                    PlCounterError::AcquisitionTimeout { .. } => warn!("{}", e),
                    _ => error!("read failed: {}", e),
                }
                return Err(e);
            }
        };
        let rates = self.converter.convert(&batch);
        debug!("ticks {:?} -> {:?} kcts/s", batch.ticks().to_vec(), rates.to_vec());
        Ok(rates)
    }

    /// Tears down both tasks. Always succeeds.
    pub fn stop<D: DaqDriver>(&mut self, ctrl: &mut DualTaskController<D>) {
        ctrl.close_both();
        self.state = AcqState::Idle;
    }
}
