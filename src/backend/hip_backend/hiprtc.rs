//! HIP runtime compilation (HIPRTC)

use std::ffi::{c_char, CString};
use std::ptr;

use super::ffi::{self, HiprtcProgram, HIPRTC_SUCCESS};
use crate::backend::driver::KernelCompiler;
use crate::backend::error::{BackendError, BackendResult};

/// HIPRTC-backed [`KernelCompiler`] producing code objects for `hipModuleLoadData`
#[derive(Debug, Clone)]
pub struct Hiprtc {
    options: Vec<String>,
}

impl Default for Hiprtc {
    fn default() -> Self {
        Hiprtc {
            options: vec!["--std=c++17".to_string()],
        }
    }
}

impl Hiprtc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a compiler option such as `--offload-arch=gfx1100`
    pub fn with_option(mut self, option: &str) -> Self {
        self.options.push(option.to_string());
        self
    }
}

impl KernelCompiler for Hiprtc {
    fn compile(&self, name: &str, source: &str) -> BackendResult<Vec<u8>> {
        let name_c = CString::new(name).map_err(|e| BackendError::CompilationFailed {
            name: name.to_string(),
            log: format!("invalid program name: {}", e),
        })?;
        let source_c = CString::new(source).map_err(|e| BackendError::CompilationFailed {
            name: name.to_string(),
            log: format!("invalid source: {}", e),
        })?;
        let options_c = self
            .options
            .iter()
            .map(|o| CString::new(o.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::CompilationFailed {
                name: name.to_string(),
                log: format!("invalid compiler option: {}", e),
            })?;
        let option_ptrs: Vec<*const c_char> = options_c.iter().map(|o| o.as_ptr()).collect();

        let mut program: HiprtcProgram = ptr::null_mut();
        let create_result = unsafe {
            ffi::hiprtcCreateProgram(
                &mut program,
                source_c.as_ptr(),
                name_c.as_ptr(),
                0,
                ptr::null(),
                ptr::null(),
            )
        };
        if create_result != HIPRTC_SUCCESS {
            return Err(BackendError::CompilationFailed {
                name: name.to_string(),
                log: format!("hiprtcCreateProgram failed with code {}", create_result),
            });
        }

        let compile_result = unsafe {
            ffi::hiprtcCompileProgram(program, option_ptrs.len() as i32, option_ptrs.as_ptr())
        };
        if compile_result != HIPRTC_SUCCESS {
            let log = program_log(program);
            unsafe { ffi::hiprtcDestroyProgram(&mut program) };
            return Err(BackendError::CompilationFailed {
                name: name.to_string(),
                log: log.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        let mut code_size: usize = 0;
        let size_result = unsafe { ffi::hiprtcGetCodeSize(program, &mut code_size) };
        if size_result != HIPRTC_SUCCESS {
            unsafe { ffi::hiprtcDestroyProgram(&mut program) };
            return Err(BackendError::CompilationFailed {
                name: name.to_string(),
                log: "hiprtcGetCodeSize failed".to_string(),
            });
        }

        let mut code = vec![0u8; code_size];
        let code_result = unsafe { ffi::hiprtcGetCode(program, code.as_mut_ptr() as *mut c_char) };
        unsafe { ffi::hiprtcDestroyProgram(&mut program) };
        if code_result != HIPRTC_SUCCESS {
            return Err(BackendError::CompilationFailed {
                name: name.to_string(),
                log: "hiprtcGetCode failed".to_string(),
            });
        }

        tracing::debug!("hiprtc compiled '{}' into {} bytes", name, code.len());
        Ok(code)
    }
}

fn program_log(program: HiprtcProgram) -> Option<String> {
    let mut size: usize = 0;
    if unsafe { ffi::hiprtcGetProgramLogSize(program, &mut size) } != HIPRTC_SUCCESS || size == 0 {
        return None;
    }
    let mut buffer = vec![0u8; size];
    if unsafe { ffi::hiprtcGetProgramLog(program, buffer.as_mut_ptr() as *mut c_char) }
        != HIPRTC_SUCCESS
    {
        return None;
    }
    Some(String::from_utf8_lossy(&buffer).into_owned())
}
