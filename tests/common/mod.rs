//! Common test utilities
//!
//! Every integration test runs against `SimDriver`, so no GPU is needed.
//! The fixtures here build simulated machines and runtimes and check that
//! nothing leaks once they are disposed.

#![allow(dead_code)]

use std::sync::Arc;

use tensorforge::backend::{DeviceDriver, SimDeviceSpec, SimDriver};
use tensorforge::{RuntimeConfig, TensorRuntime};

pub use serial_test::serial;

/// Device memory of a simulated GPU in tests
pub const SIM_MEMORY: usize = 64 << 20;

/// `count` identical simulated GPUs
pub fn sim_machine(count: usize) -> Arc<SimDriver> {
    Arc::new(SimDriver::uniform(count, SIM_MEMORY))
}

/// A single simulated GPU with `multiprocessors` compute units
pub fn sim_device_with_multiprocessors(multiprocessors: u32) -> Arc<SimDriver> {
    Arc::new(SimDriver::new(vec![SimDeviceSpec::new(SIM_MEMORY)
        .with_name("sim-gpu-0")
        .with_multiprocessors(multiprocessors)]))
}

pub fn as_driver(sim: &Arc<SimDriver>) -> Arc<dyn DeviceDriver> {
    sim.clone()
}

/// Runtime over `sim` managing `devices`
pub fn runtime_on(sim: &Arc<SimDriver>, devices: Vec<u32>) -> TensorRuntime {
    let config = RuntimeConfig::new()
        .with_devices(devices)
        .with_arena_fraction(0.5);
    TensorRuntime::new(sim.clone(), sim.clone(), config).expect("runtime over simulated devices")
}

/// Runtime over a fresh single-device machine
pub fn single_device_runtime() -> (Arc<SimDriver>, TensorRuntime) {
    let sim = sim_machine(1);
    let runtime = runtime_on(&sim, vec![0]);
    (sim, runtime)
}

/// After disposal every driver-side resource must be gone
pub fn assert_no_leak(sim: &SimDriver, devices: &[u32]) {
    for &device in devices {
        assert_eq!(
            sim.live_allocations(device),
            0,
            "device {} still holds allocations",
            device
        );
    }
    assert_eq!(sim.live_blas_handles(), 0, "BLAS handles leaked");
    assert_eq!(sim.loaded_modules(), 0, "modules still loaded");
}
