//! Describes the logical counter channels taking part in a photon-counting measurement.
//!
//! A measurement uses two counters of the same card:
//! 1. A **clock** counter (`ChannelRole::Clock`) generating a continuous pulse train at
//!    `frequency_hz`. Each full clock period is one counting window.
//! 2. A **counter** counter (`ChannelRole::Counter`) measuring the semi-periods of that pulse train,
//!    counting photon-detector edges as its timebase.
//!
//! A [`ChannelSpec`] is pure data. Its constructors validate the terminal against the list of
//! physical counters reported by the driver for the requested [`SourceKind`], so a spec that exists
//! is always bindable to a real resource.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{PlCounterError, Result};
use crate::utils::same_terminal;

/// Largest semi-period the counter channel is configured to measure, in ticks.
pub const DEFAULT_MAX_COUNT: f64 = 2e7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    Clock,
    Counter,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ChannelRole::Clock => "clock",
                ChannelRole::Counter => "counter",
            }
        )
    }
}

/// Hardware resource class a channel is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Counter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Output level of a pulse channel while idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    pub role: ChannelRole,
    pub terminal: String,
    pub source_kind: SourceKind,
    /// Counter only
    pub edge_polarity: Option<Edge>,
    /// Clock only
    pub frequency_hz: Option<f64>,
    /// Counter only
    pub max_count: Option<f64>,
}

impl ChannelSpec {
    /// Describes the pulse-train clock on `terminal`, generating at `frequency_hz`.
    ///
    /// `available` is the list of physical channels the driver reports for [`SourceKind::Counter`].
    pub fn clock(terminal: &str, frequency_hz: f64, available: &[String]) -> Result<Self> {
        if !(frequency_hz > 0. && frequency_hz.is_finite()) {
            return Err(PlCounterError::invalid_channel(
                terminal,
                format!("clock frequency must be a positive number of Hz, got {}", frequency_hz),
            ));
        }
        validate_terminal(terminal, SourceKind::Counter, available)?;
        Ok(Self {
            role: ChannelRole::Clock,
            terminal: terminal.to_string(),
            source_kind: SourceKind::Counter,
            edge_polarity: None,
            frequency_hz: Some(frequency_hz),
            max_count: None,
        })
    }

    /// Describes the semi-period counter on `terminal`.
    pub fn counter(terminal: &str, edge: Edge, max_count: f64, available: &[String]) -> Result<Self> {
        if !(max_count > 0. && max_count.is_finite()) {
            return Err(PlCounterError::invalid_channel(
                terminal,
                format!("max_count must be positive, got {}", max_count),
            ));
        }
        validate_terminal(terminal, SourceKind::Counter, available)?;
        Ok(Self {
            role: ChannelRole::Counter,
            terminal: terminal.to_string(),
            source_kind: SourceKind::Counter,
            edge_polarity: Some(edge),
            frequency_hz: None,
            max_count: Some(max_count),
        })
    }

    /// Device part of the terminal, e.g. `Dev1` for `Dev1/ctr0`.
    pub fn device(&self) -> Option<&str> {
        self.terminal.trim_start_matches('/').split('/').next()
    }
}

// Counter channels are named `<device>/ctr<n>`, optionally with a leading slash
fn counter_name_regex() -> &'static Regex {
    static COUNTER_NAME: OnceLock<Regex> = OnceLock::new();
    COUNTER_NAME.get_or_init(|| Regex::new(r"^/?[A-Za-z0-9_]+/ctr\d+$").expect("static regex"))
}

fn validate_terminal(terminal: &str, kind: SourceKind, available: &[String]) -> Result<()> {
    if terminal.is_empty() {
        return Err(PlCounterError::invalid_channel(terminal, "terminal name is empty"));
    }
    match kind {
        SourceKind::Counter => {
            if !counter_name_regex().is_match(terminal) {
                return Err(PlCounterError::invalid_channel(
                    terminal,
                    "expected a counter channel of the form <device>/ctr<number>",
                ));
            }
        }
    }
    if !available.iter().any(|chan| same_terminal(chan, terminal)) {
        return Err(PlCounterError::invalid_channel(
            terminal,
            format!("not among the {:?} resources {:?}", kind, available),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> Vec<String> {
        vec!["Dev1/ctr0".to_string(), "Dev1/ctr1".to_string()]
    }

    #[test]
    fn builds_clock_and_counter_specs() {
        let clock = ChannelSpec::clock("Dev1/ctr1", 200., &counters()).unwrap();
        assert_eq!(clock.role, ChannelRole::Clock);
        assert_eq!(clock.frequency_hz, Some(200.));
        assert_eq!(clock.edge_polarity, None);
        assert_eq!(clock.device(), Some("Dev1"));

        let counter =
            ChannelSpec::counter("/Dev1/ctr0", Edge::Rising, DEFAULT_MAX_COUNT, &counters()).unwrap();
        assert_eq!(counter.role, ChannelRole::Counter);
        assert_eq!(counter.max_count, Some(2e7));
        assert_eq!(counter.device(), Some("Dev1"));
    }

    #[test]
    fn rejects_bad_frequency() {
        for freq in [0., -5., f64::NAN, f64::INFINITY] {
            let err = ChannelSpec::clock("Dev1/ctr1", freq, &counters()).unwrap_err();
            assert!(matches!(err, PlCounterError::InvalidChannelSpec { .. }));
        }
    }

    #[test]
    fn rejects_unknown_or_malformed_terminals() {
        let empty = ChannelSpec::clock("", 100., &counters()).unwrap_err();
        assert!(empty.to_string().contains("empty"));

        let pfi = ChannelSpec::counter("/Dev1/PFI0", Edge::Rising, 1e3, &counters()).unwrap_err();
        assert!(pfi.to_string().contains("ctr<number>"));

        let missing = ChannelSpec::counter("Dev2/ctr0", Edge::Rising, 1e3, &counters()).unwrap_err();
        assert!(missing.to_string().contains("not among"));
    }

    #[test]
    fn counter_name_pattern_is_compiled_once() {
        assert!(std::ptr::eq(counter_name_regex(), counter_name_regex()));
        assert!(counter_name_regex().is_match("/Dev1/ctr12"));
        assert!(!counter_name_regex().is_match("Dev1/PFI0"));
    }

    #[test]
    fn rejects_non_positive_max_count() {
        let err = ChannelSpec::counter("Dev1/ctr0", Edge::Falling, 0., &counters()).unwrap_err();
        assert!(matches!(err, PlCounterError::InvalidChannelSpec { .. }));
    }
}
