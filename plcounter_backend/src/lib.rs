//! # Photon counter backend
//!
//! Hardware-agnostic core of a photon counter built from two counters of an NI counter/timer card:
//! one generates a continuous pulse train (the clock), the other measures the semi-periods of that
//! pulse train while counting photon-detector edges as its timebase. Every full clock period
//! yields a (low, high) pair of tick counts that converts to a rate in kcounts/s.
//!
//! ## Layers
//!
//! - [`channel`] and [`timing`]: validated descriptions of the two counters and the timing and
//!   buffer-read policies applied to them.
//! - [`driver`]: the [`DaqDriver`] trait over the DAQmx primitives. [`sim::SimDriver`] is a
//!   simulated card; the NI-DAQmx implementation lives in `plcounterctrl_backend`.
//! - [`task`]: [`TaskHandle`], one hardware task and its lifecycle.
//! - [`sync`]: the wiring of the counter to the clock's internal output and the photon source.
//! - [`controller`]: [`DualTaskController`], the clock/counter pair managed as one unit.
//! - [`acquisition`] and [`settings`]: the grab/commit/stop state machine, rate conversion and
//!   the typed user settings.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use plcounter_backend::*;
//!
//! let sim = Arc::new(SimDriver::new());
//! sim.set_photon_rate(Some(50.));
//!
//! let mut ctrl = DualTaskController::new(sim.clone());
//! let mut acq = AcquisitionLoop::new(CounterSettings::from_driver(sim.as_ref()).unwrap());
//! let rates = acq.grab(&mut ctrl, true).unwrap();
//! assert!((rates[0] - 50.).abs() < 1e-9);
//! assert_eq!(acq.state(), AcqState::Live);
//!
//! acq.stop(&mut ctrl);
//! assert_eq!(acq.state(), AcqState::Idle);
//! ```

pub mod acquisition;
pub mod channel;
pub mod controller;
pub mod driver;
pub mod error;
pub mod settings;
pub mod sim;
pub mod sync;
pub mod task;
pub mod timing;
pub mod utils;

pub use acquisition::*;
pub use channel::*;
pub use controller::*;
pub use driver::*;
pub use error::*;
pub use settings::*;
pub use sim::{SimCall, SimDriver, SimFault};
pub use sync::*;
pub use task::*;
pub use timing::*;
pub use utils::*;
