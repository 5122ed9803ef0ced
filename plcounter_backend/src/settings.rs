//! Typed user settings of the photon counter.
//!
//! The host delivers every edit as a `(key, value)` pair. Keys are parsed into a [`SettingKey`]
//! and values are checked by [`CounterSettings::apply`] before they are stored, so a
//! [`CounterSettings`] always holds values that can be turned into a [`ClockConfig`] and a pair of
//! [`ChannelSpec`]s. Whether a terminal actually exists on the card is only known to the driver and
//! is checked when the specs are built.
//!
//! | key                | value | default               | on change |
//! |--------------------|-------|-----------------------|-----------|
//! | `counter_channel`  | text  | first counter         | rebind    |
//! | `photon_channel`   | text  | first trigger source  | rebind    |
//! | `clock_freq`       | float | 200 Hz (min 1 Hz)     | restart   |
//! | `clock_channel`    | text  | second counter        | rebind    |
//! | `samples_per_read` | int   | 2 (even, max 1000)    | rebind    |
//! | `read_timeout`     | float | 10 s                  | rebind    |

use std::fmt;
use std::str::FromStr;

use crate::channel::{ChannelSpec, Edge, DEFAULT_MAX_COUNT};
use crate::driver::DaqDriver;
use crate::error::{PlCounterError, Result};
use crate::timing::{ClockConfig, DEFAULT_BUFFER_DEPTH};

pub const DEFAULT_CLOCK_FREQ: f64 = 200.;
pub const MIN_CLOCK_FREQ: f64 = 1.;
pub const DEFAULT_SAMPLES_PER_READ: usize = 2;
/// A read can never wait for more samples than the acquisition buffer holds.
pub const MAX_SAMPLES_PER_READ: usize = DEFAULT_BUFFER_DEPTH as usize;
pub const DEFAULT_READ_TIMEOUT: f64 = 10.;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SettingKey {
    CounterChannel,
    PhotonChannel,
    ClockFreq,
    ClockChannel,
    SamplesPerRead,
    ReadTimeout,
}

/// What a running acquisition has to do after a setting changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reaction {
    /// Recompute the counting time and restart both tasks
    Restart,
    /// Stop, then rebuild both tasks
    Rebind,
}

impl SettingKey {
    pub const ALL: [SettingKey; 6] = [
        SettingKey::CounterChannel,
        SettingKey::PhotonChannel,
        SettingKey::ClockFreq,
        SettingKey::ClockChannel,
        SettingKey::SamplesPerRead,
        SettingKey::ReadTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::CounterChannel => "counter_channel",
            SettingKey::PhotonChannel => "photon_channel",
            SettingKey::ClockFreq => "clock_freq",
            SettingKey::ClockChannel => "clock_channel",
            SettingKey::SamplesPerRead => "samples_per_read",
            SettingKey::ReadTimeout => "read_timeout",
        }
    }

    /// Label shown by the host settings tree.
    pub fn title(&self) -> &'static str {
        match self {
            SettingKey::CounterChannel => "Counter channel:",
            SettingKey::PhotonChannel => "Photon source:",
            SettingKey::ClockFreq => "Clock frequency (Hz):",
            SettingKey::ClockChannel => "Clock channel:",
            SettingKey::SamplesPerRead => "Samples per read:",
            SettingKey::ReadTimeout => "Read timeout (s):",
        }
    }

    pub fn reaction(&self) -> Reaction {
        match self {
            SettingKey::ClockFreq => Reaction::Restart,
            _ => Reaction::Rebind,
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = PlCounterError;

    fn from_str(s: &str) -> Result<Self> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| PlCounterError::UnknownSetting(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    Text(String),
    Float(f64),
    Int(i64),
}

impl SettingValue {
    fn as_text(&self, key: SettingKey) -> Result<&str> {
        match self {
            SettingValue::Text(text) => Ok(text),
            other => Err(type_mismatch(key, "a terminal name", other)),
        }
    }

    fn as_f64(&self, key: SettingKey) -> Result<f64> {
        match self {
            SettingValue::Float(v) => Ok(*v),
            SettingValue::Int(v) => Ok(*v as f64),
            other => Err(type_mismatch(key, "a number", other)),
        }
    }

    fn as_int(&self, key: SettingKey) -> Result<i64> {
        match self {
            SettingValue::Int(v) => Ok(*v),
            SettingValue::Float(v) if v.fract() == 0. && v.is_finite() => Ok(*v as i64),
            other => Err(type_mismatch(key, "an integer", other)),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SettingValue::Text(text) => write!(f, "{}", text),
            SettingValue::Float(v) => write!(f, "{}", v),
            SettingValue::Int(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

fn invalid(key: SettingKey, reason: impl Into<String>) -> PlCounterError {
    PlCounterError::InvalidSetting {
        key: key.as_str().to_string(),
        reason: reason.into(),
    }
}

fn type_mismatch(key: SettingKey, expected: &str, got: &SettingValue) -> PlCounterError {
    invalid(key, format!("expected {}, got {:?}", expected, got))
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterSettings {
    pub counter_channel: String,
    pub photon_channel: String,
    pub clock_freq: f64,
    pub clock_channel: String,
    pub samples_per_read: usize,
    pub read_timeout: f64,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            counter_channel: String::new(),
            photon_channel: String::new(),
            clock_freq: DEFAULT_CLOCK_FREQ,
            clock_channel: String::new(),
            samples_per_read: DEFAULT_SAMPLES_PER_READ,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl CounterSettings {
    /// Defaults drawn from the resources a driver reports: the first counter counts, the second
    /// one clocks, and the first triggering source carries the photon pulses.
    pub fn from_resources(counters: &[String], sources: &[String]) -> Self {
        let first = counters.first().cloned().unwrap_or_default();
        Self {
            clock_channel: counters.get(1).cloned().unwrap_or_else(|| first.clone()),
            counter_channel: first,
            photon_channel: sources.first().cloned().unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn from_driver<D: DaqDriver>(driver: &D) -> Result<Self> {
        let counters = driver
            .counter_channels()
            .map_err(|source| PlCounterError::Driver { op: "list counter channels", source })?;
        let sources = driver
            .triggering_sources()
            .map_err(|source| PlCounterError::Driver { op: "list triggering sources", source })?;
        Ok(Self::from_resources(&counters, &sources))
    }

    /// Validates `value` for `key` and stores it. Invalid values leave the settings unchanged.
    pub fn apply(&mut self, key: SettingKey, value: SettingValue) -> Result<()> {
        match key {
            SettingKey::CounterChannel | SettingKey::PhotonChannel | SettingKey::ClockChannel => {
                let terminal = value.as_text(key)?.trim();
                if terminal.is_empty() {
                    return Err(invalid(key, "terminal name is empty"));
                }
                let slot = match key {
                    SettingKey::CounterChannel => &mut self.counter_channel,
                    SettingKey::PhotonChannel => &mut self.photon_channel,
                    _ => &mut self.clock_channel,
                };
                *slot = terminal.to_string();
            }
            SettingKey::ClockFreq => {
                let freq = value.as_f64(key)?;
                if !(freq >= MIN_CLOCK_FREQ && freq.is_finite()) {
                    return Err(invalid(key, format!("must be at least {} Hz, got {}", MIN_CLOCK_FREQ, freq)));
                }
                self.clock_freq = freq;
            }
            SettingKey::SamplesPerRead => {
                let n = value.as_int(key)?;
                if n < 2 || n % 2 != 0 {
                    return Err(invalid(key, format!("must be a positive even number, got {}", n)));
                }
                if n > MAX_SAMPLES_PER_READ as i64 {
                    return Err(invalid(
                        key,
                        format!("must not exceed the {} sample buffer, got {}", MAX_SAMPLES_PER_READ, n),
                    ));
                }
                self.samples_per_read = n as usize;
            }
            SettingKey::ReadTimeout => {
                let timeout = value.as_f64(key)?;
                if !(timeout > 0. && timeout.is_finite()) {
                    return Err(invalid(key, format!("must be > 0 s, got {}", timeout)));
                }
                self.read_timeout = timeout;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::CounterChannel => self.counter_channel.as_str().into(),
            SettingKey::PhotonChannel => self.photon_channel.as_str().into(),
            SettingKey::ClockFreq => self.clock_freq.into(),
            SettingKey::ClockChannel => self.clock_channel.as_str().into(),
            SettingKey::SamplesPerRead => (self.samples_per_read as i64).into(),
            SettingKey::ReadTimeout => self.read_timeout.into(),
        }
    }

    /// 50% duty cycle pulse train at `clock_freq`.
    pub fn clock_config(&self) -> Result<ClockConfig> {
        ClockConfig::new(self.clock_freq)
    }

    pub fn clock_spec(&self, counters: &[String]) -> Result<ChannelSpec> {
        ChannelSpec::clock(&self.clock_channel, self.clock_freq, counters)
    }

    /// Rising-edge semi-period counter measuring up to [`DEFAULT_MAX_COUNT`] ticks.
    pub fn counter_spec(&self, counters: &[String]) -> Result<ChannelSpec> {
        ChannelSpec::counter(&self.counter_channel, Edge::Rising, DEFAULT_MAX_COUNT, counters)
    }
}
