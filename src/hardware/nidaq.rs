//! NI-DAQmx backend, linked against the NIDAQmx C library (see `build.rs`).
//!
//! Tasks are software timed: every `read`/`write` transfers exactly one sample per channel.

use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::VoltRange;
use crate::hardware::{
    AnalogInput, AnalogOutput, AnalogTask, DaqBackend, HardwareError, Reading, check_ranges,
};

type TaskHandle = *mut c_void;

const DAQMX_VAL_CFG_DEFAULT: i32 = -1;
const DAQMX_VAL_VOLTS: i32 = 10348;
const DAQMX_VAL_GROUP_BY_CHANNEL: u32 = 0;
/// Read/write timeout of a single on-demand transfer
const COMMS_WAIT_TIME: Duration = Duration::from_secs(1);

/// Read or write did not complete within the timeout
const DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
const DAQMX_ERR_WAIT_UNTIL_DONE_TIMEOUT: i32 = -200560;
/// Device unplugged or unreachable
const DAQMX_ERR_DEVICE_NOT_AVAILABLE: i32 = -201003;
const DAQMX_ERR_DEVICE_REMOVED: i32 = -88705;

#[allow(non_snake_case)]
unsafe extern "C" {
    fn DAQmxCreateTask(taskName: *const c_char, taskHandle: *mut TaskHandle) -> i32;
    fn DAQmxCreateAIVoltageChan(
        taskHandle: TaskHandle,
        physicalChannel: *const c_char,
        nameToAssignToChannel: *const c_char,
        terminalConfig: i32,
        minVal: f64,
        maxVal: f64,
        units: i32,
        customScaleName: *const c_char,
    ) -> i32;
    fn DAQmxCreateAOVoltageChan(
        taskHandle: TaskHandle,
        physicalChannel: *const c_char,
        nameToAssignToChannel: *const c_char,
        minVal: f64,
        maxVal: f64,
        units: i32,
        customScaleName: *const c_char,
    ) -> i32;
    fn DAQmxStartTask(taskHandle: TaskHandle) -> i32;
    fn DAQmxStopTask(taskHandle: TaskHandle) -> i32;
    fn DAQmxClearTask(taskHandle: TaskHandle) -> i32;
    fn DAQmxReadAnalogF64(
        taskHandle: TaskHandle,
        numSampsPerChan: i32,
        timeout: f64,
        fillMode: u32,
        readArray: *mut f64,
        arraySizeInSamps: u32,
        sampsPerChanRead: *mut i32,
        reserved: *mut u32,
    ) -> i32;
    fn DAQmxWriteAnalogF64(
        taskHandle: TaskHandle,
        numSampsPerChan: i32,
        autoStart: u32,
        timeout: f64,
        dataLayout: u32,
        writeArray: *const f64,
        sampsPerChanWritten: *mut i32,
        reserved: *mut u32,
    ) -> i32;
    fn DAQmxGetExtendedErrorInfo(errorString: *mut c_char, bufferSize: u32) -> i32;
}

/// Safety wrapper for the NIDAQ TaskHandle
#[derive(Debug)]
struct TaskHandleWrapper {
    inner: TaskHandle,
}

// The handle is only ever used by the task that owns it, from one thread at a time
unsafe impl Send for TaskHandleWrapper {}

#[derive(Debug, Default)]
pub struct Nidaq;

impl DaqBackend for Nidaq {
    fn open_input(&self, device: &str) -> Result<Box<dyn AnalogInput>, HardwareError> {
        Ok(Box::new(NidaqInput(NidaqTask::create(device, "espray_ai")?)))
    }

    fn open_output(&self, device: &str) -> Result<Box<dyn AnalogOutput>, HardwareError> {
        Ok(Box::new(NidaqOutput(NidaqTask::create(device, "espray_ao")?)))
    }
}

#[derive(Debug)]
struct NidaqTask {
    device: String,
    handle: Option<TaskHandleWrapper>,
    channels: Vec<(u32, VoltRange)>,
}

impl NidaqTask {
    fn create(device: &str, name: &str) -> Result<Self, HardwareError> {
        info!("creating nidaq task {name} on {device}");
        let c_name = c_string(name)?;
        let mut handle: TaskHandle = ptr::null_mut();
        check_err(device, unsafe { DAQmxCreateTask(c_name.as_ptr(), &mut handle) })?;
        Ok(Self {
            device: device.to_owned(),
            handle: Some(TaskHandleWrapper { inner: handle }),
            channels: Vec::new(),
        })
    }

    fn handle(&self) -> Result<TaskHandle, HardwareError> {
        self.handle
            .as_ref()
            .map(|h| h.inner)
            .ok_or_else(|| HardwareError::Closed(format!("nidaq task on {}", self.device)))
    }

    fn physical_channel(&self, kind: &str, index: u32) -> Result<CString, HardwareError> {
        c_string(&format!("{}/{kind}{index}", self.device))
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        info!("starting nidaq task on {}", self.device);
        check_err(&self.device, unsafe { DAQmxStartTask(self.handle()?) })
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        let Some(handle) = self.handle.take() else {
            return Err(HardwareError::Closed(format!("nidaq task on {}", self.device)));
        };
        info!("clearing nidaq task on {}", self.device);
        // Stop may legitimately fail on a task that never started, clearing still releases it
        if let Err(err) = check_err(&self.device, unsafe { DAQmxStopTask(handle.inner) }) {
            warn!("stopping nidaq task on {} failed: {err}", self.device);
        }
        check_err(&self.device, unsafe { DAQmxClearTask(handle.inner) })
    }
}

impl Drop for NidaqTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe {
                DAQmxClearTask(handle.inner);
            }
        }
    }
}

#[derive(Debug)]
struct NidaqInput(NidaqTask);

impl AnalogTask for NidaqInput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        let task = &mut self.0;
        let physical = task.physical_channel("ai", index)?;
        info!("nidaqmx-sys: adding analog input channel: {:?}", physical);
        check_err(&task.device, unsafe {
            DAQmxCreateAIVoltageChan(
                task.handle()?,
                physical.as_ptr(),
                ptr::null(),
                DAQMX_VAL_CFG_DEFAULT,
                range.min,
                range.max,
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        })?;
        task.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        self.0.start()
    }

    fn channel_count(&self) -> usize {
        self.0.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.0.close()
    }
}

impl AnalogInput for NidaqInput {
    fn read(&mut self) -> Result<Reading, HardwareError> {
        let task = &self.0;
        let mut data = vec![0.0f64; task.channels.len()];
        let mut read_samples_per_channel: i32 = 0;
        check_err(&task.device, unsafe {
            DAQmxReadAnalogF64(
                task.handle()?,
                1,
                COMMS_WAIT_TIME.as_secs_f64(),
                DAQMX_VAL_GROUP_BY_CHANNEL,
                data.as_mut_ptr(),
                data.len() as u32,
                &mut read_samples_per_channel,
                ptr::null_mut(),
            )
        })?;

        if read_samples_per_channel != 1 {
            return Err(HardwareError::Timeout {
                task: format!("nidaq input task on {}", task.device),
                after: COMMS_WAIT_TIME,
            });
        }
        Ok(Reading::Channels(data))
    }
}

#[derive(Debug)]
struct NidaqOutput(NidaqTask);

impl AnalogTask for NidaqOutput {
    fn add_channel(&mut self, index: u32, range: VoltRange) -> Result<(), HardwareError> {
        let task = &mut self.0;
        let physical = task.physical_channel("ao", index)?;
        info!("nidaqmx-sys: adding analog output channel: {:?}", physical);
        check_err(&task.device, unsafe {
            DAQmxCreateAOVoltageChan(
                task.handle()?,
                physical.as_ptr(),
                ptr::null(),
                range.min,
                range.max,
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        })?;
        task.channels.push((index, range));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        self.0.start()
    }

    fn channel_count(&self) -> usize {
        self.0.channels.len()
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.0.close()
    }
}

impl AnalogOutput for NidaqOutput {
    fn write(&mut self, values: &[f64]) -> Result<(), HardwareError> {
        let task = &self.0;
        check_ranges("nidaq output task", &task.channels, values)?;

        let mut written_samples_per_channel: i32 = 0;
        check_err(&task.device, unsafe {
            DAQmxWriteAnalogF64(
                task.handle()?,
                1,
                1,
                COMMS_WAIT_TIME.as_secs_f64(),
                DAQMX_VAL_GROUP_BY_CHANNEL,
                values.as_ptr(),
                &mut written_samples_per_channel,
                ptr::null_mut(),
            )
        })?;

        if written_samples_per_channel != 1 {
            return Err(HardwareError::Timeout {
                task: format!("nidaq output task on {}", task.device),
                after: COMMS_WAIT_TIME,
            });
        }
        Ok(())
    }
}

fn c_string(value: &str) -> Result<CString, HardwareError> {
    CString::new(value).map_err(|e| HardwareError::Driver {
        code: 0,
        message: format!("invalid name {value:?}: {e}"),
    })
}

/// Translate a DAQmx status code, logging warnings (positive codes) and mapping errors
fn check_err(device: &str, err: i32) -> Result<(), HardwareError> {
    if err == 0 {
        return Ok(());
    }

    // Fetch latest error information
    let mut buf = [0 as c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(buf.as_mut_ptr(), buf.len() as u32);
    }
    let message = unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    if err > 0 {
        warn!("nidaq returns warning code: {err} -> {message}");
        return Ok(());
    }

    error!("{message}");
    Err(match err {
        DAQMX_ERR_SAMPLES_NOT_YET_AVAILABLE | DAQMX_ERR_WAIT_UNTIL_DONE_TIMEOUT => {
            HardwareError::Timeout {
                task: format!("nidaq task on {device}"),
                after: COMMS_WAIT_TIME,
            }
        }
        DAQMX_ERR_DEVICE_NOT_AVAILABLE | DAQMX_ERR_DEVICE_REMOVED => {
            HardwareError::Disconnected {
                device: device.to_owned(),
                detail: message,
            }
        }
        code => HardwareError::Driver { code, message },
    })
}
