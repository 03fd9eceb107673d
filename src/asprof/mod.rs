// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::capture::{EventType, ProfilerEngine};
use std::{
    ffi::{c_char, CStr, CString},
    path::Path,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

pub(crate) mod raw;

/// Error from async-profiler.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AsProfError {
    /// async-profiler rejected a command.
    #[error("async-profiler error: {0}")]
    AsyncProfilerError(String),
    /// I/O error around the profiler's output file.
    #[error("async-profiler i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// `libasyncProfiler.so` could not be loaded.
    #[error("error loading libasyncProfiler: {0}")]
    LibraryError(#[from] Arc<libloading::Error>),
}

/// The process-wide async-profiler, dlopen'd on first use.
#[derive(Debug, Default)]
pub struct AsProf {}

impl AsProf {
    /// The handle is free; the library loads on [`ProfilerEngine::init`].
    pub fn new() -> Self {
        AsProf {}
    }
}

fn start_args(output: &Path, event: EventType, period: Duration) -> String {
    format!(
        "start,event={},interval={},file={}",
        event.as_asprof(),
        period.as_nanos(),
        output.display()
    )
}

fn stop_args(output: &Path) -> String {
    format!("stop,file={},collapsed", output.display())
}

impl ProfilerEngine for AsProf {
    fn init(&self) -> Result<(), AsProfError> {
        unsafe {
            (raw::async_profiler()?.asprof_init)();
        };
        Ok(())
    }

    fn start(&self, output: &Path, event: EventType, period: Duration) -> Result<(), AsProfError> {
        tracing::debug!("starting the async-profiler with output path: {output:?}");
        Self::asprof_execute(&start_args(output, event, period))?;
        tracing::debug!("async-profiler started successfully");
        Ok(())
    }

    fn stop(&self, output: &Path) -> Result<(), AsProfError> {
        Self::asprof_execute(&stop_args(output))?;
        tracing::debug!("async-profiler stopped successfully");
        Ok(())
    }
}

impl AsProf {
    /// convert an asprof_error_t to a Result
    ///
    /// SAFETY: response must be a valid asprof_error_t
    unsafe fn asprof_error(response: raw::asprof_error_t) -> Result<(), AsProfError> {
        if !response.is_null() {
            let response = (raw::async_profiler()?.asprof_error_str)(response);
            if response.is_null() {
                return Ok(());
            }
            let response = unsafe { CStr::from_ptr(response) };
            let response_str = response.to_string_lossy();
            tracing::error!("received error from async-profiler: {}", response_str);
            Err(AsProfError::AsyncProfilerError(response_str.to_string()))
        } else {
            Ok(())
        }
    }

    fn asprof_execute(args: &str) -> Result<(), AsProfError> {
        unsafe extern "C" fn callback(buf: *const c_char, size: usize) {
            unsafe {
                if !buf.is_null() {
                    let parts = std::slice::from_raw_parts(buf as *const u8, size);
                    tracing::debug!(
                        "response from async-profiler: {}",
                        String::from_utf8_lossy(parts)
                    );
                } else {
                    tracing::debug!("invalid pointer or size");
                }
            }
        }

        let args_compatible = CString::new(args).map_err(|_| {
            AsProfError::AsyncProfilerError(format!("command contains a NUL byte: {args:?}"))
        })?;
        unsafe {
            Self::asprof_error((raw::async_profiler()?.asprof_execute)(
                args_compatible.as_ptr(),
                Some(callback),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_strings() {
        let output = Path::new("/proc/self/fd/7");
        assert_eq!(
            start_args(output, EventType::Wall, Duration::from_millis(1)),
            "start,event=wall,interval=1000000,file=/proc/self/fd/7"
        );
        assert_eq!(
            start_args(output, EventType::Cpu, Duration::from_micros(250)),
            "start,event=cpu,interval=250000,file=/proc/self/fd/7"
        );
        assert_eq!(stop_args(output), "stop,file=/proc/self/fd/7,collapsed");
    }
}
