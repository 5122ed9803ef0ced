//! Provides a minimal rust wrapper for the counter/timer parts of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! The core of this module is the [`NiTask`] struct which represents an NI-DAQmx task. It encapsulates
//! a handle to an NI-DAQmx task and provides methods that map to DAQmx C-functions: creating pulse
//! generation and semi-period measurement channels, routing their terminals, configuring implicit
//! timing, setting the read policy of the acquisition buffer and reading tick counts.
//!
//! [`NiDaqmxDriver`] implements [`DaqDriver`] on top of [`NiTask`], so the acquisition logic of
//! `plcounter_backend` can run against real hardware.
//!
//! **Refer to implementations of the [`NiTask`] struct to see the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Safety and Error Handling
//!
//! Every DAQmx C-function returns an `int32` which, if negative, indicates an error. [`daqmx_call`]
//! wraps each call, fetches the extended error information on failure and returns it as a
//! [`DAQmxError`]. ***In addition to logging, NI-DAQmx driver errors are saved in
//! `nidaqmx_error.logs` file in the directory of the calling shell.
//!
//! ## Cleanup and Resource Management
//!
//! `NiTask` implements `Drop`: a task that was not cleared explicitly is cleared when it goes out of
//! scope, releasing the counters it reserved.
//!
//! ## Example
//!
//! ```ignore
//! # use plcounterctrl_backend::nidaqmx::*;
//! let mut task = NiTask::new("clock")?;
//! task.create_co_pulse_chan_freq("Dev1/ctr1", 200., 0.5, Level::Low, 0.)?;
//! task.cfg_implicit_timing(SampleMode::Continuous, 1000)?;
//! task.start()?;
//! // ... the pulse train is available on "/Dev1/ctr1InternalOutput" ...
//! task.stop()?;
//! ```

use libc;
use std::ffi::{CStr, CString};
use std::fs::OpenOptions;
use std::io::Write;
use tracing::{error, warn};

use plcounter_backend::{
    DAQmxError, DaqDriver, Edge, Level, OverwriteMode, ReadRelativeTo, SampleMode,
    StreamReadPolicy, DAQMX_ERR_INVALID_PHYS_CHAN,
};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type NiTaskHandle = *mut libc::c_void;

const DAQMX_ERR_INVALID_ATTRIBUTE_VALUE: i32 = -200077;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_FALLING: CInt32 = 10171;
pub const DAQMX_VAL_LOW: CInt32 = 10214;
pub const DAQMX_VAL_HIGH: CInt32 = 10192;
pub const DAQMX_VAL_HZ: CInt32 = 10373;
pub const DAQMX_VAL_TICKS: CInt32 = 10304;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_CONTSAMPS: CInt32 = 10123;
pub const DAQMX_VAL_FIRSTSAMPLE: CInt32 = 10424;
pub const DAQMX_VAL_CURRREADPOS: CInt32 = 10425;
pub const DAQMX_VAL_MOSTRECENTSAMP: CInt32 = 10428;
pub const DAQMX_VAL_OVERWRITEUNREADSAMPS: CInt32 = 10252;
pub const DAQMX_VAL_DONOTOVERWRITEUNREADSAMPS: CInt32 = 10159;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut NiTaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: NiTaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: NiTaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: NiTaskHandle) -> CInt32;

    fn DAQmxCreateCOPulseChanFreq(
        handle: NiTaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        units: CInt32,
        idleState: CInt32,
        initialDelay: CFloat64,
        freq: CFloat64,
        dutyCycle: CFloat64,
    ) -> CInt32;
    fn DAQmxCreateCISemiPeriodChan(
        handle: NiTaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxSetCISemiPeriodStartingEdge(
        handle: NiTaskHandle,
        channel: CConstStr,
        data: CInt32,
    ) -> CInt32;
    fn DAQmxSetCISemiPeriodTerm(handle: NiTaskHandle, channel: CConstStr, data: CConstStr)
        -> CInt32;
    fn DAQmxSetCICtrTimebaseSrc(handle: NiTaskHandle, channel: CConstStr, data: CConstStr)
        -> CInt32;
    fn DAQmxGetNthTaskChannel(
        handle: NiTaskHandle,
        index: CUint32,
        buffer: CCharBuf,
        bufferSize: CInt32,
    ) -> CInt32;

    fn DAQmxCfgImplicitTiming(handle: NiTaskHandle, sampleMode: CInt32, sampsPerChan: CUint64)
        -> CInt32;
    fn DAQmxSetReadRelativeTo(handle: NiTaskHandle, data: CInt32) -> CInt32;
    fn DAQmxSetReadOffset(handle: NiTaskHandle, data: CInt32) -> CInt32;
    fn DAQmxSetReadOverWrite(handle: NiTaskHandle, data: CInt32) -> CInt32;

    fn DAQmxReadCounterU32(
        handle: NiTaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        readArray: *mut u32,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxGetSysDevNames(data: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevCIPhysicalChans(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevTerminals(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;
}

/// Calls a DAQmx C-function and converts a negative return code into a [`DAQmxError`].
///
/// On failure the extended error information is fetched with `DAQmxGetExtendedErrorInfo`, logged,
/// and appended to `nidaqmx_error.logs`.
///
/// ```ignore
/// daqmx_call(|| unsafe { DAQmxSomeFunction(param1, param2) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DAQmxError> {
    let err_code = func();
    if err_code < 0 {
        return Err(last_error(err_code));
    }
    Ok(())
}

fn last_error(code: CInt32) -> DAQmxError {
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    error!("DAQmx Error {}: {}", code, error_string);

    // Write the error to log file
    match OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
    {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "DAQmx Error {}: {}", code, error_string) {
                warn!("failed to write to nidaqmx_error.logs: {}", e);
            }
        }
        Err(e) => warn!("failed to open nidaqmx_error.logs: {}", e),
    }
    DAQmxError::new(code, error_string)
}

fn cstring(s: &str) -> Result<CString, DAQmxError> {
    CString::new(s).map_err(|_| {
        DAQmxError::new(
            DAQMX_ERR_INVALID_PHYS_CHAN,
            format!("name contains a NUL byte: {:?}", s),
        )
    })
}

// String properties: query the required size first, then fetch
fn query_string<F: FnMut(CCharBuf, CUint32) -> CInt32>(mut f: F) -> Result<String, DAQmxError> {
    let size = f(std::ptr::null_mut(), 0);
    if size < 0 {
        return Err(last_error(size));
    }
    let mut buf = vec![0 as libc::c_char; size.max(1) as usize];
    daqmx_call(|| f(buf.as_mut_ptr(), buf.len() as CUint32))?;
    Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Represents a National Instruments (NI) DAQmx task.
///
/// Creating an instance corresponds to creating a new NI-DAQmx task; methods invoke the associated
/// DAQmx C-functions on it. All counter channels created here are addressed by the task's single
/// channel, so channel-scoped properties are set with an empty channel name.
pub struct NiTask {
    handle: NiTaskHandle,
}

impl NiTask {
    pub fn new(name: &str) -> Result<Self, DAQmxError> {
        let mut taskhandle: NiTaskHandle = std::ptr::null_mut();
        let task_name_cstr = cstring(name)?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self { handle: taskhandle })
    }

    pub fn clear(&mut self) -> Result<(), DAQmxError> {
        if self.handle.is_null() {
            return Ok(());
        }
        let handle = std::mem::replace(&mut self.handle, std::ptr::null_mut());
        daqmx_call(|| unsafe { DAQmxClearTask(handle) })
    }
    pub fn start(&self) -> Result<(), DAQmxError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }
    pub fn stop(&self) -> Result<(), DAQmxError> {
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }

    pub fn create_co_pulse_chan_freq(
        &self,
        counter: &str,
        freq: f64,
        duty_cycle: f64,
        idle_state: Level,
        initial_delay: f64,
    ) -> Result<(), DAQmxError> {
        let counter_cstr = cstring(counter)?;
        let assigned_name_cstr = cstring("")?;
        let idle = match idle_state {
            Level::Low => DAQMX_VAL_LOW,
            Level::High => DAQMX_VAL_HIGH,
        };
        daqmx_call(|| unsafe {
            DAQmxCreateCOPulseChanFreq(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_HZ,
                idle,
                initial_delay as CFloat64,
                freq as CFloat64,
                duty_cycle as CFloat64,
            )
        })
    }

    pub fn create_ci_semi_period_chan(
        &self,
        counter: &str,
        max_count: f64,
        edge: Edge,
    ) -> Result<(), DAQmxError> {
        let counter_cstr = cstring(counter)?;
        let assigned_name_cstr = cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateCISemiPeriodChan(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                0.,
                max_count as CFloat64,
                DAQMX_VAL_TICKS,
                std::ptr::null(),
            )
        })?;
        let edge = match edge {
            Edge::Rising => DAQMX_VAL_RISING,
            Edge::Falling => DAQMX_VAL_FALLING,
        };
        daqmx_call(|| unsafe {
            DAQmxSetCISemiPeriodStartingEdge(self.handle, assigned_name_cstr.as_ptr(), edge)
        })
    }

    pub fn set_ci_semi_period_term(&self, terminal: &str) -> Result<(), DAQmxError> {
        let channel_cstr = cstring("")?;
        let terminal_cstr = cstring(terminal)?;
        daqmx_call(|| unsafe {
            DAQmxSetCISemiPeriodTerm(self.handle, channel_cstr.as_ptr(), terminal_cstr.as_ptr())
        })
    }

    pub fn set_ci_ctr_timebase_src(&self, terminal: &str) -> Result<(), DAQmxError> {
        let channel_cstr = cstring("")?;
        let terminal_cstr = cstring(terminal)?;
        daqmx_call(|| unsafe {
            DAQmxSetCICtrTimebaseSrc(self.handle, channel_cstr.as_ptr(), terminal_cstr.as_ptr())
        })
    }

    /// Name of the first channel of the task, e.g. `Dev1/ctr1`.
    pub fn first_channel(&self) -> Result<String, DAQmxError> {
        let handle = self.handle;
        query_string(|buf, size| unsafe { DAQmxGetNthTaskChannel(handle, 1, buf, size as CInt32) })
    }

    pub fn cfg_implicit_timing(&self, mode: SampleMode, samps_per_chan: u64) -> Result<(), DAQmxError> {
        let mode = match mode {
            SampleMode::Finite => DAQMX_VAL_FINITESAMPS,
            SampleMode::Continuous => DAQMX_VAL_CONTSAMPS,
        };
        daqmx_call(|| unsafe { DAQmxCfgImplicitTiming(self.handle, mode, samps_per_chan as CUint64) })
    }

    pub fn set_read_policy(&self, policy: &StreamReadPolicy) -> Result<(), DAQmxError> {
        let relative_to = match policy.reference_point {
            ReadRelativeTo::FirstSample => DAQMX_VAL_FIRSTSAMPLE,
            ReadRelativeTo::CurrentReadPosition => DAQMX_VAL_CURRREADPOS,
            ReadRelativeTo::MostRecentSample => DAQMX_VAL_MOSTRECENTSAMP,
        };
        let overwrite = match policy.overwrite_mode {
            OverwriteMode::OverwriteUnread => DAQMX_VAL_OVERWRITEUNREADSAMPS,
            OverwriteMode::DoNotOverwriteUnread => DAQMX_VAL_DONOTOVERWRITEUNREADSAMPS,
        };
        daqmx_call(|| unsafe { DAQmxSetReadRelativeTo(self.handle, relative_to) })?;
        daqmx_call(|| unsafe { DAQmxSetReadOffset(self.handle, policy.offset as CInt32) })?;
        daqmx_call(|| unsafe { DAQmxSetReadOverWrite(self.handle, overwrite) })
    }

    /// Appends the samples read to `out`. On a timeout the samples read so far have already
    /// left the device buffer and are appended as well.
    pub fn read_counter_u32(
        &self,
        num_samps: usize,
        timeout: f64,
        out: &mut Vec<u32>,
    ) -> Result<(), DAQmxError> {
        let requested = samps_arg(num_samps)?;
        let mut buf = vec![0u32; num_samps];
        let mut nread: CInt32 = 0;
        let status = daqmx_call(|| unsafe {
            DAQmxReadCounterU32(
                self.handle,
                requested,
                timeout as CFloat64,
                buf.as_mut_ptr(),
                requested as CUint32,
                &mut nread as *mut CInt32,
                std::ptr::null_mut(),
            )
        });
        append_read(out, buf, nread);
        status
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!("clearing task on drop: {}", e);
        }
    }
}

fn samps_arg(num_samps: usize) -> Result<CInt32, DAQmxError> {
    CInt32::try_from(num_samps).map_err(|_| {
        DAQmxError::new(
            DAQMX_ERR_INVALID_ATTRIBUTE_VALUE,
            format!("cannot read {} samples in one call", num_samps),
        )
    })
}

fn append_read(out: &mut Vec<u32>, mut buf: Vec<u32>, nread: CInt32) {
    buf.truncate(nread.max(0) as usize);
    out.extend_from_slice(&buf);
}

/// Names of the NI devices installed on the system.
pub fn sys_dev_names() -> Result<Vec<String>, DAQmxError> {
    query_string(|buf, size| unsafe { DAQmxGetSysDevNames(buf, size) }).map(|s| split_list(&s))
}

/// [`DaqDriver`] backed by the NI-DAQmx C library.
#[derive(Default)]
pub struct NiDaqmxDriver;

impl NiDaqmxDriver {
    pub fn new() -> Self {
        Self
    }

    fn per_device<F>(&self, mut query: F) -> Result<Vec<String>, DAQmxError>
    where
        F: FnMut(CConstStr, CCharBuf, CUint32) -> CInt32,
    {
        let mut all = Vec::new();
        for dev in sys_dev_names()? {
            let dev_cstr = cstring(&dev)?;
            let list = query_string(|buf, size| query(dev_cstr.as_ptr(), buf, size))?;
            all.extend(split_list(&list));
        }
        Ok(all)
    }
}

impl DaqDriver for NiDaqmxDriver {
    type Task = NiTask;

    fn create_task(&self, name: &str) -> Result<NiTask, DAQmxError> {
        NiTask::new(name)
    }

    fn create_co_pulse_chan_freq(
        &self,
        task: &mut NiTask,
        counter: &str,
        freq: f64,
        duty_cycle: f64,
        idle_state: Level,
        initial_delay: f64,
    ) -> Result<String, DAQmxError> {
        task.create_co_pulse_chan_freq(counter, freq, duty_cycle, idle_state, initial_delay)?;
        task.first_channel()
    }

    fn internal_output_terminal(&self, task: &NiTask) -> Result<String, DAQmxError> {
        let channel = task.first_channel()?;
        Ok(format!("{}InternalOutput", channel.trim_start_matches('/')))
    }

    fn create_ci_semi_period_chan(
        &self,
        task: &mut NiTask,
        counter: &str,
        max_count: f64,
        edge: Edge,
    ) -> Result<String, DAQmxError> {
        task.create_ci_semi_period_chan(counter, max_count, edge)?;
        task.first_channel()
    }

    fn set_ci_semi_period_term(&self, task: &mut NiTask, terminal: &str) -> Result<(), DAQmxError> {
        task.set_ci_semi_period_term(terminal)
    }

    fn set_ci_ctr_timebase_src(&self, task: &mut NiTask, terminal: &str) -> Result<(), DAQmxError> {
        task.set_ci_ctr_timebase_src(terminal)
    }

    fn cfg_implicit_timing(
        &self,
        task: &mut NiTask,
        mode: SampleMode,
        samps_per_chan: u64,
    ) -> Result<(), DAQmxError> {
        task.cfg_implicit_timing(mode, samps_per_chan)
    }

    fn set_read_policy(&self, task: &mut NiTask, policy: &StreamReadPolicy) -> Result<(), DAQmxError> {
        task.set_read_policy(policy)
    }

    fn start_task(&self, task: &mut NiTask) -> Result<(), DAQmxError> {
        task.start()
    }

    fn stop_task(&self, task: &mut NiTask) -> Result<(), DAQmxError> {
        task.stop()
    }

    fn clear_task(&self, mut task: NiTask) -> Result<(), DAQmxError> {
        task.clear()
    }

    fn read_counter_u32(
        &self,
        task: &mut NiTask,
        num_samps: usize,
        timeout: f64,
        out: &mut Vec<u32>,
    ) -> Result<(), DAQmxError> {
        task.read_counter_u32(num_samps, timeout, out)
    }

    fn counter_channels(&self) -> Result<Vec<String>, DAQmxError> {
        self.per_device(|dev, buf, size| unsafe { DAQmxGetDevCIPhysicalChans(dev, buf, size) })
    }

    /// PFI lines of every device, e.g. `/Dev1/PFI0`.
    fn triggering_sources(&self) -> Result<Vec<String>, DAQmxError> {
        let terminals =
            self.per_device(|dev, buf, size| unsafe { DAQmxGetDevTerminals(dev, buf, size) })?;
        Ok(terminals
            .into_iter()
            .filter(|terminal| terminal.contains("/PFI"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_driver_lists() {
        assert_eq!(
            split_list("Dev1/ctr0, Dev1/ctr1,Dev1/ctr2"),
            vec!["Dev1/ctr0", "Dev1/ctr1", "Dev1/ctr2"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn partial_reads_are_kept() {
        let mut out = vec![7];
        append_read(&mut out, vec![11, 0, 0, 0], 1);
        assert_eq!(out, vec![7, 11]);
        append_read(&mut out, vec![0, 0], -1);
        assert_eq!(out, vec![7, 11]);
    }

    #[test]
    fn oversized_reads_are_rejected() {
        assert_eq!(samps_arg(1000).unwrap(), 1000);
        let err = samps_arg(usize::MAX).unwrap_err();
        assert_eq!(err.code, DAQMX_ERR_INVALID_ATTRIBUTE_VALUE);
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert_eq!(cstring("Dev1\0/ctr0").unwrap_err().code, DAQMX_ERR_INVALID_PHYS_CHAN);
    }
}
