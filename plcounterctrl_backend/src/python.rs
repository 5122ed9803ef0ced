//! Python bindings: exposes [`PlCounter`] on NI-DAQmx hardware to a Python acquisition host.
//!
//! The host calls the lifecycle methods and drains emitted signals with `poll_signals`, which
//! returns `(kind, payload)` tuples: `("data", dict)`, `("temp_data", dict)` or `("status", str)`.
//! Data dicts carry `name`, `label`, `dim`, `source` and `values` (a numpy array of kcounts/s).

use crossbeam::channel::Receiver;
use numpy::IntoPyArray;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyFloat, PyString};
use std::sync::Arc;

use plcounter_backend::SettingValue;

use crate::nidaqmx::NiDaqmxDriver;
use crate::plugin::*;

#[pyclass(unsendable, name = "PlCounter")]
pub struct PyPlCounter {
    inner: PlCounter<NiDaqmxDriver>,
    signals: Receiver<PluginSignal>,
}

fn export_to_py(py: Python, export: DataExport) -> PyResult<PyObject> {
    let dict = PyDict::new(py);
    dict.set_item("name", export.name)?;
    dict.set_item("label", export.label)?;
    dict.set_item("dim", format!("{:?}", export.dim))?;
    dict.set_item("source", format!("{:?}", export.source).to_lowercase())?;
    dict.set_item("values", export.values.into_pyarray(py))?;
    Ok(dict.to_object(py))
}

#[pymethods]
impl PyPlCounter {
    #[new]
    fn new() -> Self {
        let (inner, signals) = PlCounter::new(Arc::new(NiDaqmxDriver::new()));
        Self { inner, signals }
    }

    fn initialize(&mut self) -> (String, bool) {
        self.inner.initialize()
    }

    fn commit_settings(&mut self, key: &str, value: &PyAny) -> PyResult<()> {
        let value = if let Ok(text) = value.downcast::<PyString>() {
            SettingValue::Text(text.to_str()?.to_string())
        } else if let Ok(float) = value.downcast::<PyFloat>() {
            SettingValue::Float(float.value())
        } else {
            SettingValue::Int(value.extract::<i64>()?)
        };
        self.inner
            .commit_settings(key, value)
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    fn grab(&mut self, continuous: bool) {
        self.inner.grab(continuous)
    }

    fn stop(&mut self) -> String {
        self.inner.stop()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    /// Settings tree as a list of dicts with `name`, `title`, `type`, `value` and `limits`.
    fn params(&self, py: Python) -> PyResult<Vec<PyObject>> {
        self.inner
            .params()
            .into_values()
            .map(|param| {
                let dict = PyDict::new(py);
                dict.set_item("name", param.key.as_str())?;
                dict.set_item("title", param.title)?;
                let kind = match param.kind {
                    ParamKind::List => "list",
                    ParamKind::Float => "float",
                    ParamKind::Int => "int",
                };
                dict.set_item("type", kind)?;
                match param.value {
                    SettingValue::Text(text) => dict.set_item("value", text)?,
                    SettingValue::Float(v) => dict.set_item("value", v)?,
                    SettingValue::Int(v) => dict.set_item("value", v)?,
                }
                dict.set_item("limits", param.limits)?;
                if let Some(min) = param.min {
                    dict.set_item("min", min)?;
                }
                Ok(dict.to_object(py))
            })
            .collect()
    }

    /// Drains the signals emitted since the previous call.
    fn poll_signals(&self, py: Python) -> PyResult<Vec<(String, PyObject)>> {
        self.signals
            .try_iter()
            .map(|signal| match signal {
                PluginSignal::Data(export) => Ok(("data".to_string(), export_to_py(py, export)?)),
                PluginSignal::TempData(export) => {
                    Ok(("temp_data".to_string(), export_to_py(py, export)?))
                }
                PluginSignal::Status(msg) => Ok(("status".to_string(), msg.to_object(py))),
            })
            .collect()
    }
}

#[pymodule]
fn plcounterctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyPlCounter>()?;
    Ok(())
}
