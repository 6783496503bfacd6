//! [`DeviceDriver`] over the HIP runtime
//!
//! **CRITICAL:** the HIP current device is PER-THREAD. Every entry point that
//! touches a specific device selects it first; the selection is cached in a
//! thread-local to avoid redundant `hipSetDevice` calls.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Mutex;

use super::device::{get_error_string, HipDeviceProp};
use super::ffi;
use crate::backend::driver::{
    DeviceDriver, DeviceId, DevicePtr, DeviceProperties, FunctionHandle, KernelArg, LaunchConfig,
    MemoryInfo, ModuleHandle, RawBlasHandle,
};
use crate::backend::error::{BackendError, BackendResult};

thread_local! {
    static THREAD_DEVICE_ID: Cell<i32> = Cell::new(-1);
}

fn check(result: i32, what: impl FnOnce() -> String) -> BackendResult<()> {
    if result == ffi::HIP_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::DeviceError(format!(
            "{} failed: {}",
            what(),
            get_error_string(result)
        )))
    }
}

/// HIP driver with one stream per device
#[derive(Debug)]
pub struct HipDriver {
    // Raw hipStream_t per device, created on first use
    streams: Mutex<HashMap<DeviceId, usize>>,
}

impl HipDriver {
    /// Initialize the HIP runtime
    pub fn new() -> BackendResult<Self> {
        let result = unsafe { ffi::hipInit(0) };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::InitializationFailed(format!(
                "hipInit failed with code {}",
                result
            )));
        }
        Ok(HipDriver {
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Whether HIP reports at least one device
    pub fn gpu_available() -> bool {
        let mut count: i32 = 0;
        unsafe {
            ffi::hipInit(0) == ffi::HIP_SUCCESS
                && ffi::hipGetDeviceCount(&mut count) == ffi::HIP_SUCCESS
                && count > 0
        }
    }

    fn ensure_device(&self, device: DeviceId) -> BackendResult<()> {
        let expected = device as i32;
        let current = THREAD_DEVICE_ID.with(|c| c.get());
        if current != expected {
            let result = unsafe { ffi::hipSetDevice(expected) };
            check(result, || format!("hipSetDevice({})", expected))?;
            THREAD_DEVICE_ID.with(|c| c.set(expected));
        }
        Ok(())
    }

    fn stream(&self, device: DeviceId) -> BackendResult<*mut c_void> {
        let mut streams = self.streams.lock()?;
        if let Some(&stream) = streams.get(&device) {
            return Ok(stream as *mut c_void);
        }
        self.ensure_device(device)?;
        let mut stream: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::hipStreamCreate(&mut stream) };
        check(result, || format!("hipStreamCreate on device {}", device))?;
        if stream.is_null() {
            return Err(BackendError::DeviceError(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }
        tracing::debug!("Created HIP stream {:?} for device {}", stream, device);
        streams.insert(device, stream as usize);
        Ok(stream)
    }
}

impl Drop for HipDriver {
    fn drop(&mut self) {
        if let Ok(streams) = self.streams.get_mut() {
            for (device, stream) in streams.drain() {
                if self.ensure_device(device).is_ok() {
                    unsafe { ffi::hipStreamDestroy(stream as *mut c_void) };
                }
            }
        }
    }
}

impl DeviceDriver for HipDriver {
    fn name(&self) -> &str {
        "hip"
    }

    fn device_count(&self) -> BackendResult<u32> {
        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        check(result, || "hipGetDeviceCount".to_string())?;
        Ok(count.max(0) as u32)
    }

    fn properties(&self, device: DeviceId) -> BackendResult<DeviceProperties> {
        let mut props = HipDeviceProp::default();
        let result = unsafe { ffi::hipGetDeviceProperties(&mut props, device as i32) };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::DeviceNotFound(device));
        }
        Ok(DeviceProperties {
            name: props.name(),
            total_memory: props.total_global_mem() as usize,
            multiprocessor_count: props.multi_processor_count().max(0) as u32,
            max_threads_per_block: props.max_threads_per_block().max(0) as u32,
            shared_mem_per_block: props.shared_mem_per_block(),
            warp_size: props.warp_size().max(0) as u32,
        })
    }

    fn memory_info(&self, device: DeviceId) -> BackendResult<MemoryInfo> {
        self.ensure_device(device)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::MemoryQueryFailed(get_error_string(result)));
        }
        Ok(MemoryInfo { free, total })
    }

    fn current_device(&self) -> BackendResult<DeviceId> {
        let cached = THREAD_DEVICE_ID.with(|c| c.get());
        if cached >= 0 {
            return Ok(cached as DeviceId);
        }
        let mut device: i32 = -1;
        let result = unsafe { ffi::hipGetDevice(&mut device) };
        check(result, || "hipGetDevice".to_string())?;
        THREAD_DEVICE_ID.with(|c| c.set(device));
        Ok(device as DeviceId)
    }

    fn set_device(&self, device: DeviceId) -> BackendResult<()> {
        self.ensure_device(device)
    }

    fn malloc(&self, device: DeviceId, bytes: usize) -> BackendResult<DevicePtr> {
        self.ensure_device(device)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut ptr, bytes) };
        if result != ffi::HIP_SUCCESS || ptr.is_null() {
            return Err(BackendError::MemoryAllocationFailed(format!(
                "hipMalloc of {} bytes on device {}: {}",
                bytes,
                device,
                get_error_string(result)
            )));
        }
        Ok(DevicePtr(ptr as u64))
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> BackendResult<()> {
        self.ensure_device(device)?;
        let result = unsafe { ffi::hipFree(ptr.addr() as *mut c_void) };
        check(result, || format!("hipFree({})", ptr))
    }

    fn synchronize(&self, device: DeviceId) -> BackendResult<()> {
        let stream = self.stream(device)?;
        let result = unsafe { ffi::hipStreamSynchronize(stream) };
        check(result, || format!("hipStreamSynchronize on device {}", device))
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> BackendResult<()> {
        self.ensure_device(device)?;
        let result = unsafe { ffi::hipDeviceEnablePeerAccess(peer as i32, 0) };
        match result {
            ffi::HIP_SUCCESS | ffi::HIP_ERROR_PEER_ACCESS_ALREADY_ENABLED => Ok(()),
            code => Err(BackendError::PeerAccessFailed {
                device,
                peer,
                reason: get_error_string(code),
            }),
        }
    }

    fn create_blas_handle(&self, device: DeviceId) -> BackendResult<RawBlasHandle> {
        let stream = self.stream(device)?;
        let mut handle: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::hipblasCreate(&mut handle) };
        if result != ffi::HIPBLAS_STATUS_SUCCESS {
            return Err(BackendError::DeviceError(format!(
                "hipblasCreate failed with status {}",
                result
            )));
        }
        let result = unsafe { ffi::hipblasSetStream(handle, stream) };
        if result != ffi::HIPBLAS_STATUS_SUCCESS {
            unsafe { ffi::hipblasDestroy(handle) };
            return Err(BackendError::DeviceError(format!(
                "hipblasSetStream failed with status {}",
                result
            )));
        }
        Ok(RawBlasHandle(handle as u64))
    }

    fn destroy_blas_handle(&self, device: DeviceId, handle: RawBlasHandle) -> BackendResult<()> {
        self.ensure_device(device)?;
        let result = unsafe { ffi::hipblasDestroy(handle.0 as *mut c_void) };
        if result != ffi::HIPBLAS_STATUS_SUCCESS {
            return Err(BackendError::DeviceError(format!(
                "hipblasDestroy failed with status {}",
                result
            )));
        }
        Ok(())
    }

    fn load_module(&self, device: DeviceId, image: &[u8]) -> BackendResult<ModuleHandle> {
        self.ensure_device(device)?;
        let mut module: *mut c_void = ptr::null_mut();
        let result =
            unsafe { ffi::hipModuleLoadData(&mut module, image.as_ptr() as *const c_void) };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::KernelLoadFailed(format!(
                "Failed to load module from data: {}",
                get_error_string(result)
            )));
        }
        Ok(ModuleHandle(module as u64))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> BackendResult<FunctionHandle> {
        let name_c = CString::new(name)
            .map_err(|e| BackendError::KernelLoadFailed(format!("Invalid kernel name: {}", e)))?;
        let mut func: *mut c_void = ptr::null_mut();
        let result = unsafe {
            ffi::hipModuleGetFunction(&mut func, module.0 as *mut c_void, name_c.as_ptr())
        };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::KernelLoadFailed(format!(
                "Failed to get kernel '{}': {}",
                name,
                get_error_string(result)
            )));
        }
        Ok(FunctionHandle(func as u64))
    }

    fn unload_module(&self, module: ModuleHandle) -> BackendResult<()> {
        let result = unsafe { ffi::hipModuleUnload(module.0 as *mut c_void) };
        check(result, || "hipModuleUnload".to_string())
    }

    fn launch(
        &self,
        device: DeviceId,
        function: FunctionHandle,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> BackendResult<()> {
        let stream = self.stream(device)?;
        self.ensure_device(device)?;
        let mut storage: Vec<Vec<u8>> = args.iter().map(KernelArg::to_bytes).collect();
        let mut params: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|s| s.as_mut_ptr() as *mut c_void)
            .collect();
        let result = unsafe {
            ffi::hipModuleLaunchKernel(
                function.0 as *mut c_void,
                config.grid_dim.0,
                config.grid_dim.1,
                config.grid_dim.2,
                config.block_dim.0,
                config.block_dim.1,
                config.block_dim.2,
                config.shared_mem_bytes,
                stream,
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(BackendError::KernelLaunchFailed(format!(
                "hipModuleLaunchKernel failed: {}",
                get_error_string(result)
            )));
        }
        Ok(())
    }
}
