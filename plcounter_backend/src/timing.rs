//! Clock generation parameters and the timing/read policies applied to both counter tasks.

use crate::channel::Level;
use crate::error::{PlCounterError, Result};

/// Depth, in samples, of the circular buffer backing each continuous task.
pub const DEFAULT_BUFFER_DEPTH: u64 = 1000;

/// Pulse-train parameters of the clock task. Built from the user settings on every
/// (re)configuration; never modified once bound to a task.
#[derive(Clone, Debug, PartialEq)]
pub struct ClockConfig {
    pub frequency_hz: f64,
    pub duty_cycle: f64,
    pub idle_state: Level,
    pub initial_delay: f64,
}

impl ClockConfig {
    /// 50% duty cycle, idle low, no initial delay.
    pub fn new(frequency_hz: f64) -> Result<Self> {
        Self::with_shape(frequency_hz, 0.5, Level::Low, 0.)
    }

    pub fn with_shape(
        frequency_hz: f64,
        duty_cycle: f64,
        idle_state: Level,
        initial_delay: f64,
    ) -> Result<Self> {
        let invalid = |reason: String| PlCounterError::invalid_channel("clock", reason);
        if !(frequency_hz > 0. && frequency_hz.is_finite()) {
            return Err(invalid(format!("frequency must be > 0 Hz, got {}", frequency_hz)));
        }
        if !(duty_cycle > 0. && duty_cycle <= 1.) {
            return Err(invalid(format!("duty cycle must lie in (0, 1], got {}", duty_cycle)));
        }
        if !(initial_delay >= 0.) {
            return Err(invalid(format!("initial delay must be >= 0, got {}", initial_delay)));
        }
        Ok(Self {
            frequency_hz,
            duty_cycle,
            idle_state,
            initial_delay,
        })
    }

    /// Duration of one counting window: one full clock period, in seconds.
    pub fn counting_time(&self) -> f64 {
        1. / self.frequency_hz
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleMode {
    Finite,
    Continuous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingPolicy {
    pub mode: SampleMode,
    pub buffer_depth: u64,
}

impl TimingPolicy {
    pub fn continuous(buffer_depth: u64) -> Self {
        Self {
            mode: SampleMode::Continuous,
            buffer_depth,
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::continuous(DEFAULT_BUFFER_DEPTH)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadRelativeTo {
    FirstSample,
    CurrentReadPosition,
    MostRecentSample,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwriteMode {
    OverwriteUnread,
    DoNotOverwriteUnread,
}

/// How reads walk the circular acquisition buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamReadPolicy {
    pub reference_point: ReadRelativeTo,
    pub offset: i32,
    pub overwrite_mode: OverwriteMode,
}

impl Default for StreamReadPolicy {
    /// Read sequentially from where the last read stopped, never skip, and fail rather than
    /// overwrite samples that were not read yet.
    fn default() -> Self {
        Self {
            reference_point: ReadRelativeTo::CurrentReadPosition,
            offset: 0,
            overwrite_mode: OverwriteMode::DoNotOverwriteUnread,
        }
    }
}
