//! HIP, hipBLAS and HIPRTC FFI bindings
//!
//! Only the entry points the driver wraps are declared. Handles cross the
//! boundary as raw pointers and are stored as integers on the Rust side.

#![allow(non_snake_case)] // Parameter names follow the HIP headers

use std::ffi::{c_char, c_void};

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipGetDeviceProperties(props: *mut super::device::HipDeviceProp, deviceId: i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipGetDevice(deviceId: *mut i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipDeviceSynchronize() -> i32;
    pub fn hipDeviceEnablePeerAccess(peerDeviceId: i32, flags: u32) -> i32;
    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipModuleLoadData(module: *mut *mut c_void, image: *const c_void) -> i32;
    pub fn hipModuleUnload(module: *mut c_void) -> i32;
    pub fn hipModuleGetFunction(
        func: *mut *mut c_void,
        module: *mut c_void,
        name: *const c_char,
    ) -> i32;
    pub fn hipModuleLaunchKernel(
        func: *mut c_void,
        gridDimX: u32,
        gridDimY: u32,
        gridDimZ: u32,
        blockDimX: u32,
        blockDimY: u32,
        blockDimZ: u32,
        sharedMemBytes: u32,
        stream: *mut c_void,
        kernelParams: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const c_char;
}

#[link(name = "hipblas")]
extern "C" {
    pub fn hipblasCreate(handle: *mut *mut c_void) -> i32;
    pub fn hipblasDestroy(handle: *mut c_void) -> i32;
    pub fn hipblasSetStream(handle: *mut c_void, stream: *mut c_void) -> i32;
}

pub type HiprtcProgram = *mut c_void;

#[link(name = "hiprtc")]
extern "C" {
    pub fn hiprtcCreateProgram(
        prog: *mut HiprtcProgram,
        src: *const c_char,
        name: *const c_char,
        num_headers: i32,
        headers: *const *const c_char,
        include_names: *const *const c_char,
    ) -> i32;
    pub fn hiprtcCompileProgram(
        prog: HiprtcProgram,
        num_options: i32,
        options: *const *const c_char,
    ) -> i32;
    pub fn hiprtcGetProgramLogSize(prog: HiprtcProgram, log_size_ret: *mut usize) -> i32;
    pub fn hiprtcGetProgramLog(prog: HiprtcProgram, log: *mut c_char) -> i32;
    pub fn hiprtcGetCodeSize(prog: HiprtcProgram, code_size_ret: *mut usize) -> i32;
    pub fn hiprtcGetCode(prog: HiprtcProgram, code: *mut c_char) -> i32;
    pub fn hiprtcDestroyProgram(prog: *mut HiprtcProgram) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Returned by `hipDeviceEnablePeerAccess` when the pair is already enabled
pub const HIP_ERROR_PEER_ACCESS_ALREADY_ENABLED: i32 = 704;

/// hipBLAS success code
pub const HIPBLAS_STATUS_SUCCESS: i32 = 0;

/// HIPRTC success code
pub const HIPRTC_SUCCESS: i32 = 0;
