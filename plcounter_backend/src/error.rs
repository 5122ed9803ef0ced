//! Error taxonomy of the photon counter.
//!
//! Configuration-time failures ([`PlCounterError::InvalidChannelSpec`],
//! [`PlCounterError::HardwareConfig`]) abort (re)configuration and leave the task pair closed.
//! Runtime read failures ([`PlCounterError::BufferOverrun`], [`PlCounterError::AcquisitionTimeout`])
//! are reported to the caller of a grab without tearing down the stream.
//! [`PlCounterError::InvalidState`] marks a misuse of the task lifecycle; the offending call has
//! no effect.

use thiserror::Error;

use crate::driver::DAQmxError;
use crate::task::TaskState;

pub type Result<T, E = PlCounterError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlCounterError {
    #[error("invalid channel '{terminal}': {reason}")]
    InvalidChannelSpec { terminal: String, reason: String },

    #[error("hardware rejected {context}: {source}")]
    HardwareConfig {
        context: String,
        #[source]
        source: DAQmxError,
    },

    #[error("task '{task}' cannot {op} while {state:?}")]
    InvalidState {
        task: String,
        op: &'static str,
        state: TaskState,
    },

    #[error("acquisition buffer overrun: {0}")]
    BufferOverrun(#[source] DAQmxError),

    #[error("no counter data within {timeout}s: {source}")]
    AcquisitionTimeout {
        timeout: f64,
        #[source]
        source: DAQmxError,
    },

    #[error("sample batch of length {len} is not made of (low, high) pairs")]
    MisalignedBatch { len: usize },

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("invalid value for setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("driver failed to {op}: {source}")]
    Driver {
        op: &'static str,
        #[source]
        source: DAQmxError,
    },
}

impl PlCounterError {
    pub(crate) fn invalid_channel(terminal: &str, reason: impl Into<String>) -> Self {
        Self::InvalidChannelSpec {
            terminal: terminal.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn hardware_config(context: impl Into<String>, source: DAQmxError) -> Self {
        Self::HardwareConfig {
            context: context.into(),
            source,
        }
    }

    /// Errors that can be retried by grabbing again, without rebuilding the tasks.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AcquisitionTimeout { .. })
    }

    /// Errors raised while (re)configuring the task pair.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannelSpec { .. } | Self::HardwareConfig { .. } | Self::InvalidSetting { .. }
        )
    }
}
