//! Synchronization wiring between the clock task and the counter task.
//!
//! The counter task measures semi-periods of the clock's pulse train and counts photon-detector
//! edges as its timebase:
//!
//! - gate (semi-period terminal) = `"/" + <clock internal output>`
//! - timebase source = the user-selected photon terminal
//!
//! The clock's internal output name only exists once the clock task has been configured, and it
//! changes whenever the clock is moved to another counter. To make a stale or guessed name
//! impossible, the name is only available through a [`ClockOutput`], which can only be produced by
//! [`crate::task::TaskHandle::configure_as_clock`]. A [`SyncWiring`] can only be derived from a
//! `ClockOutput`, and [`crate::task::TaskHandle::configure_as_counter`] requires a `SyncWiring` from
//! the same rebuild generation as the counter task itself.

use crate::error::{PlCounterError, Result};
use crate::utils::same_terminal;

/// Resolved internal output terminal of a configured clock task.
#[derive(Debug, PartialEq)]
pub struct ClockOutput {
    internal_output: String,
    generation: u64,
}

impl ClockOutput {
    pub(crate) fn new(internal_output: String, generation: u64) -> Self {
        Self {
            internal_output,
            generation,
        }
    }

    /// Terminal name as reported by the driver, without a leading `/`.
    pub fn internal_output(&self) -> &str {
        &self.internal_output
    }

    /// Rebuild generation of the clock task that produced this terminal.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Gate and timebase terminals of the counter task.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncWiring {
    gate: String,
    timebase: String,
    generation: u64,
}

impl SyncWiring {
    /// Derives the counter wiring from a freshly configured clock and the photon-source terminal.
    ///
    /// `sources` lists the terminals the driver accepts as a timebase; the photon source must be
    /// one of them.
    pub fn new(clock: &ClockOutput, photon_source: &str, sources: &[String]) -> Result<Self> {
        if photon_source.is_empty() {
            return Err(PlCounterError::invalid_channel(
                photon_source,
                "photon source terminal is empty",
            ));
        }
        if !sources.iter().any(|src| same_terminal(src, photon_source)) {
            return Err(PlCounterError::invalid_channel(
                photon_source,
                format!("not among the triggering sources {:?}", sources),
            ));
        }
        Ok(Self {
            gate: format!("/{}", clock.internal_output().trim_start_matches('/')),
            timebase: photon_source.to_string(),
            generation: clock.generation(),
        })
    }

    pub fn gate_terminal(&self) -> &str {
        &self.gate
    }

    pub fn timebase_source(&self) -> &str {
        &self.timebase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
