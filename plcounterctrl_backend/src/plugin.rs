//! # Photon counter plugin
//!
//! [`PlCounter`] is the object a host acquisition framework drives. It owns the clock/counter
//! task pair ([`DualTaskController`]) and the acquisition state machine ([`AcquisitionLoop`]) and
//! exposes the five lifecycle entry points the host calls:
//!
//! - [`PlCounter::initialize`]: configures the task pair and reports `(info, ok)`.
//! - [`PlCounter::commit_settings`]: applies one edited setting.
//! - [`PlCounter::grab`]: reads and converts one batch.
//! - [`PlCounter::stop`]: tears the task pair down.
//! - [`PlCounter::close`]: releases everything.
//!
//! Results flow back to the host as [`PluginSignal`]s on a `crossbeam` channel: data packets
//! labelled `PL (kcts/s)` and human-readable status strings. Read errors never escape
//! [`PlCounter::grab`]; they are reported as a status message and the next grab may retry.
//!
//! The plugin is generic over the [`DaqDriver`], so it runs unchanged against the simulated card
//! ([`plcounter_backend::SimDriver`]) or NI-DAQmx (`NiDaqmxDriver`, feature `daqmx`).

use crossbeam::channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;
use ndarray::Array1;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use plcounter_backend::*;

pub const PLUGIN_INFO: &str = "NI card based PL counter";
pub const DATA_NAME: &str = "PL";
pub const DATA_LABEL: &str = "PL (kcts/s)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDim {
    Data0D,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSource {
    Raw,
}

/// One named data packet handed to the host display.
#[derive(Clone, Debug, PartialEq)]
pub struct DataExport {
    pub name: String,
    pub label: String,
    pub dim: DataDim,
    pub source: DataSource,
    pub values: Array1<f64>,
}

impl DataExport {
    /// Photon rates in kcounts/s.
    pub fn pl(values: Array1<f64>) -> Self {
        Self {
            name: DATA_NAME.to_string(),
            label: DATA_LABEL.to_string(),
            dim: DataDim::Data0D,
            source: DataSource::Raw,
            values,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PluginSignal {
    /// Result of a grab
    Data(DataExport),
    /// Placeholder shown before the first grab
    TempData(DataExport),
    Status(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    List,
    Float,
    Int,
}

/// One entry of the host settings tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub key: SettingKey,
    pub title: &'static str,
    pub kind: ParamKind,
    pub value: SettingValue,
    /// Allowed values of a `List` parameter
    pub limits: Vec<String>,
    pub min: Option<f64>,
}

pub struct PlCounter<D: DaqDriver> {
    driver: Arc<D>,
    controller: DualTaskController<D>,
    acquisition: AcquisitionLoop,
    initialized: bool,
    signals: Sender<PluginSignal>,
}

impl<D: DaqDriver> PlCounter<D> {
    /// A plugin with default settings drawn from the driver's resources, and the receiving end of
    /// its signal channel.
    pub fn new(driver: Arc<D>) -> (Self, Receiver<PluginSignal>) {
        let settings = CounterSettings::from_driver(driver.as_ref()).unwrap_or_else(|e| {
            warn!("no hardware resources for default settings: {}", e);
            CounterSettings::default()
        });
        let (tx, rx) = unbounded();
        let plugin = Self {
            controller: DualTaskController::new(driver.clone()),
            acquisition: AcquisitionLoop::new(settings),
            driver,
            initialized: false,
            signals: tx,
        };
        (plugin, rx)
    }

    pub fn settings(&self) -> &CounterSettings {
        self.acquisition.settings()
    }

    pub fn state(&self) -> AcqState {
        self.acquisition.state()
    }

    pub fn controller(&self) -> &DualTaskController<D> {
        &self.controller
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn emit(&self, signal: PluginSignal) {
        if self.signals.send(signal).is_err() {
            debug!("signal receiver dropped");
        }
    }

    fn status(&self, msg: String) {
        self.emit(PluginSignal::Status(msg));
    }

    /// Settings tree: one entry per [`SettingKey`], in table order. Terminal choices are the
    /// counters and triggering sources the driver reports.
    pub fn params(&self) -> IndexMap<SettingKey, Param> {
        let list = |what: &str, listed: std::result::Result<Vec<String>, DAQmxError>| {
            listed.unwrap_or_else(|e| {
                warn!("cannot list {}: {}", what, e);
                Vec::new()
            })
        };
        let counters = list("counter channels", self.driver.counter_channels());
        let sources = list("triggering sources", self.driver.triggering_sources());

        SettingKey::ALL
            .into_iter()
            .map(|key| {
                let (kind, limits, min) = match key {
                    SettingKey::CounterChannel | SettingKey::ClockChannel => {
                        (ParamKind::List, counters.clone(), None)
                    }
                    SettingKey::PhotonChannel => (ParamKind::List, sources.clone(), None),
                    SettingKey::ClockFreq => (ParamKind::Float, Vec::new(), Some(MIN_CLOCK_FREQ)),
                    SettingKey::SamplesPerRead => (ParamKind::Int, Vec::new(), Some(2.)),
                    SettingKey::ReadTimeout => (ParamKind::Float, Vec::new(), Some(0.)),
                };
                let param = Param {
                    key,
                    title: key.title(),
                    kind,
                    value: self.settings().get(key),
                    limits,
                    min,
                };
                (key, param)
            })
            .collect()
    }

    /// Configures the task pair from the current settings. Always emits a zero placeholder packet.
    pub fn initialize(&mut self) -> (String, bool) {
        let result = self.acquisition.configure(&mut self.controller);
        self.emit(PluginSignal::TempData(DataExport::pl(Array1::zeros(1))));
        match result {
            Ok(()) => {
                self.initialized = true;
                info!("{} initialized", PLUGIN_INFO);
                (PLUGIN_INFO.to_string(), true)
            }
            Err(e) => {
                self.initialized = false;
                error!("initialization failed: {}", e);
                self.status(format!("Exception caught: {}", e));
                ("Error".to_string(), false)
            }
        }
    }

    /// Applies one edited setting given by its host key.
    pub fn commit_settings(&mut self, key: &str, value: SettingValue) -> Result<()> {
        let result = key
            .parse::<SettingKey>()
            .and_then(|key| self.acquisition.commit_setting(&mut self.controller, key, value));
        if let Err(e) = &result {
            self.status(format!("Exception caught: {}", e));
        }
        result
    }

    /// Grabs one batch and emits it. Errors are reported as status messages.
    pub fn grab(&mut self, continuous: bool) {
        match self.acquisition.grab(&mut self.controller, continuous) {
            Ok(rates) => {
                let shown = format!("Data Output: {:?}", rates.to_vec());
                self.emit(PluginSignal::Data(DataExport::pl(rates)));
                self.status(shown);
            }
            Err(e) => self.status(format!("Exception caught: {}", e)),
        }
    }

    pub fn stop(&mut self) -> String {
        self.acquisition.stop(&mut self.controller);
        self.status("Acquisition stopped.".to_string());
        String::new()
    }

    pub fn close(&mut self) {
        self.acquisition.stop(&mut self.controller);
        self.initialized = false;
        debug!("plugin closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_table_order_and_limits() {
        let (plugin, _rx) = PlCounter::new(Arc::new(SimDriver::with_devices(&[("Dev1", 2, 2)])));
        let params = plugin.params();
        let keys: Vec<&str> = params.keys().map(|key| key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "counter_channel",
                "photon_channel",
                "clock_freq",
                "clock_channel",
                "samples_per_read",
                "read_timeout"
            ]
        );
        let photon = &params[&SettingKey::PhotonChannel];
        assert_eq!(photon.kind, ParamKind::List);
        assert_eq!(photon.limits, vec!["/Dev1/PFI0", "/Dev1/PFI1"]);
        assert_eq!(photon.value, SettingValue::Text("/Dev1/PFI0".to_string()));

        let clock = &params[&SettingKey::ClockChannel];
        assert_eq!(clock.limits, vec!["Dev1/ctr0", "Dev1/ctr1"]);
        assert_eq!(clock.value, SettingValue::Text("Dev1/ctr1".to_string()));

        let freq = &params[&SettingKey::ClockFreq];
        assert_eq!(freq.value, SettingValue::Float(200.));
        assert_eq!(freq.min, Some(1.));
        assert_eq!(freq.title, "Clock frequency (Hz):");
    }

    #[test]
    fn data_packets_are_0d_pl() {
        let packet = DataExport::pl(Array1::from(vec![1.5]));
        assert_eq!(packet.name, "PL");
        assert_eq!(packet.label, "PL (kcts/s)");
        assert_eq!(packet.dim, DataDim::Data0D);
        assert_eq!(packet.source, DataSource::Raw);
    }
}
