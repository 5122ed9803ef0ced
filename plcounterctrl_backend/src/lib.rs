//! Host-facing side of the photon counter: the [`plugin::PlCounter`] driven by an acquisition
//! framework, the NI-DAQmx backend (feature `daqmx`) and the Python extension module (feature
//! `python`).

pub mod plugin;

#[cfg(feature = "daqmx")]
pub mod nidaqmx;
#[cfg(feature = "python")]
pub mod python;

pub use crate::plugin::*;
#[cfg(feature = "daqmx")]
pub use crate::nidaqmx::NiDaqmxDriver;
