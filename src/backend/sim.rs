//! Simulated device driver
//!
//! Hands out fake device addresses, tracks per-device memory usage and
//! records every observable driver call. Kernels are never executed; a launch
//! is validated against the device limits and appended to the launch log.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::driver::{
    DeviceDriver, DeviceId, DevicePtr, DeviceProperties, FunctionHandle, KernelArg,
    KernelCompiler, LaunchConfig, MemoryInfo, ModuleHandle, RawBlasHandle,
};
use super::error::{BackendError, BackendResult};

/// Magic prefix of simulated code objects
const SIM_IMAGE_MAGIC: &[u8] = b"SIMBIN\0";

/// Allocation granularity of the simulated `malloc`
const SIM_MALLOC_GRANULARITY: usize = 256;

/// Static description of one simulated device
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub total_memory: usize,
    pub free_memory: usize,
    pub multiprocessors: u32,
    pub max_threads_per_block: u32,
    pub shared_mem_per_block: usize,
    pub warp_size: u32,
}

impl SimDeviceSpec {
    pub fn new(total_memory: usize) -> Self {
        SimDeviceSpec {
            name: "sim-gpu".to_string(),
            total_memory,
            free_memory: total_memory,
            multiprocessors: 16,
            max_threads_per_block: 1024,
            shared_mem_per_block: 64 * 1024,
            warp_size: 32,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Memory already taken by other processes at startup
    pub fn with_free_memory(mut self, free_memory: usize) -> Self {
        self.free_memory = free_memory.min(self.total_memory);
        self
    }

    pub fn with_multiprocessors(mut self, multiprocessors: u32) -> Self {
        self.multiprocessors = multiprocessors;
        self
    }
}

/// One recorded kernel launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub device: DeviceId,
    pub function: String,
    pub config: LaunchConfig,
    pub args: Vec<KernelArg>,
}

/// Call counters, snapshotted by [`SimDriver::counters`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub mallocs: usize,
    pub frees: usize,
    pub synchronizations: usize,
    pub compilations: usize,
    pub module_loads: usize,
    pub module_unloads: usize,
    pub blas_created: usize,
    pub blas_destroyed: usize,
    pub peer_enabled: Vec<(DeviceId, DeviceId)>,
}

#[derive(Debug)]
struct SimDeviceState {
    next_addr: u64,
    live: HashMap<u64, usize>,
    used: usize,
}

#[derive(Debug)]
struct SimModule {
    device: DeviceId,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimDeviceState>,
    modules: HashMap<u64, SimModule>,
    functions: HashMap<u64, (u64, String)>,
    blas: HashSet<u64>,
    next_handle: u64,
    current: HashMap<ThreadId, DeviceId>,
    counters: SimCounters,
    launches: Vec<LaunchRecord>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Deterministic host-side stand-in for a multi-GPU machine
#[derive(Debug)]
pub struct SimDriver {
    devices: Vec<SimDeviceSpec>,
    denied_peers: HashSet<(DeviceId, DeviceId)>,
    load_latency: Duration,
    compile_latency: Duration,
    state: Mutex<SimState>,
}

impl SimDriver {
    pub fn new(devices: Vec<SimDeviceSpec>) -> Self {
        let state = SimState {
            devices: (0..devices.len())
                .map(|i| SimDeviceState {
                    next_addr: ((i as u64) + 1) << 40,
                    live: HashMap::new(),
                    used: 0,
                })
                .collect(),
            ..SimState::default()
        };
        SimDriver {
            devices,
            denied_peers: HashSet::new(),
            load_latency: Duration::ZERO,
            compile_latency: Duration::ZERO,
            state: Mutex::new(state),
        }
    }

    /// `count` identical devices with `total_memory` bytes each
    pub fn uniform(count: usize, total_memory: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| SimDeviceSpec::new(total_memory).with_name(&format!("sim-gpu-{}", i)))
                .collect(),
        )
    }

    /// Make `enable_peer_access(device, peer)` fail
    pub fn deny_peer(mut self, device: DeviceId, peer: DeviceId) -> Self {
        self.denied_peers.insert((device, peer));
        self
    }

    /// Delay every module load, widening race windows in tests
    pub fn with_load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    pub fn with_compile_latency(mut self, latency: Duration) -> Self {
        self.compile_latency = latency;
        self
    }

    pub fn counters(&self) -> SimCounters {
        self.lock().counters.clone()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    pub fn clear_launches(&self) {
        self.lock().launches.clear();
    }

    /// Number of live `malloc` blocks on `device`
    pub fn live_allocations(&self, device: DeviceId) -> usize {
        self.lock()
            .devices
            .get(device as usize)
            .map(|d| d.live.len())
            .unwrap_or(0)
    }

    pub fn live_blas_handles(&self) -> usize {
        self.lock().blas.len()
    }

    pub fn loaded_modules(&self) -> usize {
        self.lock().modules.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // Every mutation below completes before the guard drops, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spec(&self, device: DeviceId) -> BackendResult<&SimDeviceSpec> {
        self.devices
            .get(device as usize)
            .ok_or(BackendError::DeviceNotFound(device))
    }
}

impl DeviceDriver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn device_count(&self) -> BackendResult<u32> {
        Ok(self.devices.len() as u32)
    }

    fn properties(&self, device: DeviceId) -> BackendResult<DeviceProperties> {
        let spec = self.spec(device)?;
        Ok(DeviceProperties {
            name: spec.name.clone(),
            total_memory: spec.total_memory,
            multiprocessor_count: spec.multiprocessors,
            max_threads_per_block: spec.max_threads_per_block,
            shared_mem_per_block: spec.shared_mem_per_block,
            warp_size: spec.warp_size,
        })
    }

    fn memory_info(&self, device: DeviceId) -> BackendResult<MemoryInfo> {
        let spec = self.spec(device)?;
        let state = self.lock();
        let used = state.devices[device as usize].used;
        Ok(MemoryInfo {
            free: spec.free_memory.saturating_sub(used),
            total: spec.total_memory,
        })
    }

    fn current_device(&self) -> BackendResult<DeviceId> {
        Ok(*self.lock().current.get(&thread::current().id()).unwrap_or(&0))
    }

    fn set_device(&self, device: DeviceId) -> BackendResult<()> {
        self.spec(device)?;
        self.lock().current.insert(thread::current().id(), device);
        Ok(())
    }

    fn malloc(&self, device: DeviceId, bytes: usize) -> BackendResult<DevicePtr> {
        let spec = self.spec(device)?;
        let rounded = bytes.max(1).div_ceil(SIM_MALLOC_GRANULARITY) * SIM_MALLOC_GRANULARITY;
        let mut state = self.lock();
        state.counters.mallocs += 1;
        let dev = &mut state.devices[device as usize];
        if dev.used + rounded > spec.free_memory {
            return Err(BackendError::MemoryAllocationFailed(format!(
                "sim malloc of {} bytes on device {}: {} of {} bytes free",
                bytes,
                device,
                spec.free_memory - dev.used,
                spec.free_memory
            )));
        }
        let addr = dev.next_addr;
        dev.next_addr += rounded as u64;
        dev.used += rounded;
        dev.live.insert(addr, rounded);
        Ok(DevicePtr(addr))
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> BackendResult<()> {
        self.spec(device)?;
        let mut state = self.lock();
        state.counters.frees += 1;
        let dev = &mut state.devices[device as usize];
        match dev.live.remove(&ptr.addr()) {
            Some(size) => {
                dev.used -= size;
                Ok(())
            }
            None => Err(BackendError::DeviceError(format!(
                "free of unknown pointer {} on device {}",
                ptr, device
            ))),
        }
    }

    fn synchronize(&self, device: DeviceId) -> BackendResult<()> {
        self.spec(device)?;
        self.lock().counters.synchronizations += 1;
        Ok(())
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> BackendResult<()> {
        self.spec(device)?;
        self.spec(peer)?;
        if self.denied_peers.contains(&(device, peer)) {
            return Err(BackendError::PeerAccessFailed {
                device,
                peer,
                reason: "peer access not supported between these devices".to_string(),
            });
        }
        self.lock().counters.peer_enabled.push((device, peer));
        Ok(())
    }

    fn create_blas_handle(&self, device: DeviceId) -> BackendResult<RawBlasHandle> {
        self.spec(device)?;
        let mut state = self.lock();
        let handle = state.handle();
        state.blas.insert(handle);
        state.counters.blas_created += 1;
        Ok(RawBlasHandle(handle))
    }

    fn destroy_blas_handle(&self, _device: DeviceId, handle: RawBlasHandle) -> BackendResult<()> {
        let mut state = self.lock();
        if !state.blas.remove(&handle.0) {
            return Err(BackendError::DeviceError(format!(
                "destroy of unknown BLAS handle {}",
                handle.0
            )));
        }
        state.counters.blas_destroyed += 1;
        Ok(())
    }

    fn load_module(&self, device: DeviceId, image: &[u8]) -> BackendResult<ModuleHandle> {
        self.spec(device)?;
        if !image.starts_with(SIM_IMAGE_MAGIC) {
            return Err(BackendError::KernelLoadFailed(format!(
                "image of {} bytes is not a simulated code object",
                image.len()
            )));
        }
        self.lock().counters.module_loads += 1;
        if !self.load_latency.is_zero() {
            thread::sleep(self.load_latency);
        }
        let mut state = self.lock();
        let handle = state.handle();
        state.modules.insert(handle, SimModule { device });
        Ok(ModuleHandle(handle))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> BackendResult<FunctionHandle> {
        let mut state = self.lock();
        if !state.modules.contains_key(&module.0) {
            return Err(BackendError::KernelLoadFailed(format!(
                "module {} is not loaded",
                module.0
            )));
        }
        if name.is_empty() {
            return Err(BackendError::KernelLoadFailed(
                "empty kernel name".to_string(),
            ));
        }
        let handle = state.handle();
        state.functions.insert(handle, (module.0, name.to_string()));
        Ok(FunctionHandle(handle))
    }

    fn unload_module(&self, module: ModuleHandle) -> BackendResult<()> {
        let mut state = self.lock();
        if state.modules.remove(&module.0).is_none() {
            return Err(BackendError::KernelLoadFailed(format!(
                "module {} is not loaded",
                module.0
            )));
        }
        state.functions.retain(|_, (m, _)| *m != module.0);
        state.counters.module_unloads += 1;
        Ok(())
    }

    fn launch(
        &self,
        device: DeviceId,
        function: FunctionHandle,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> BackendResult<()> {
        let spec = self.spec(device)?;
        let mut state = self.lock();
        let (module, name) = state.functions.get(&function.0).cloned().ok_or_else(|| {
            BackendError::KernelLaunchFailed(format!("unknown function handle {}", function.0))
        })?;
        match state.modules.get(&module) {
            Some(m) if m.device == device => {}
            _ => {
                return Err(BackendError::KernelLaunchFailed(format!(
                    "kernel '{}' is not loaded on device {}",
                    name, device
                )))
            }
        }
        if config.grid_size() == 0 || config.block_size() == 0 {
            return Err(BackendError::KernelLaunchFailed(format!(
                "kernel '{}' launched with empty geometry {:?}",
                name, config
            )));
        }
        if config.block_size() > spec.max_threads_per_block as u64 {
            return Err(BackendError::KernelLaunchFailed(format!(
                "kernel '{}' block size {} exceeds device limit {}",
                name,
                config.block_size(),
                spec.max_threads_per_block
            )));
        }
        if config.shared_mem_bytes as usize > spec.shared_mem_per_block {
            return Err(BackendError::KernelLaunchFailed(format!(
                "kernel '{}' requests {} bytes of shared memory, device allows {}",
                name, config.shared_mem_bytes, spec.shared_mem_per_block
            )));
        }
        state.launches.push(LaunchRecord {
            device,
            function: name,
            config: *config,
            args: args.to_vec(),
        });
        Ok(())
    }
}

impl KernelCompiler for SimDriver {
    fn compile(&self, name: &str, source: &str) -> BackendResult<Vec<u8>> {
        self.lock().counters.compilations += 1;
        if !self.compile_latency.is_zero() {
            thread::sleep(self.compile_latency);
        }
        if let Some(line) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
            return Err(BackendError::CompilationFailed {
                name: name.to_string(),
                log: format!("{}: {}", name, line.trim()),
            });
        }
        let mut image = SIM_IMAGE_MAGIC.to_vec();
        image.extend_from_slice(source.as_bytes());
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_free_tracks_usage() {
        let driver = SimDriver::uniform(1, 1 << 20);
        let p = driver.malloc(0, 1000).unwrap();
        assert_eq!(driver.live_allocations(0), 1);
        let info = driver.memory_info(0).unwrap();
        assert_eq!(info.free, (1 << 20) - 1024);
        driver.free(0, p).unwrap();
        assert_eq!(driver.memory_info(0).unwrap().free, 1 << 20);
        assert!(driver.free(0, p).is_err());
    }

    #[test]
    fn test_malloc_exhaustion() {
        let driver = SimDriver::uniform(1, 4096);
        assert!(driver.malloc(0, 4096).is_ok());
        assert!(driver.malloc(0, 1).is_err());
    }

    #[test]
    fn test_current_device_is_per_thread() {
        let driver = std::sync::Arc::new(SimDriver::uniform(2, 1 << 20));
        driver.set_device(1).unwrap();
        let d = driver.clone();
        let other = thread::spawn(move || d.current_device().unwrap())
            .join()
            .unwrap();
        assert_eq!(other, 0);
        assert_eq!(driver.current_device().unwrap(), 1);
    }

    #[test]
    fn test_denied_peer() {
        let driver = SimDriver::uniform(2, 1 << 20).deny_peer(0, 1);
        assert!(driver.enable_peer_access(0, 1).is_err());
        assert!(driver.enable_peer_access(1, 0).is_ok());
        assert_eq!(driver.counters().peer_enabled, vec![(1, 0)]);
    }

    #[test]
    fn test_compile_rejects_error_directive() {
        let driver = SimDriver::uniform(1, 1 << 20);
        let err = driver
            .compile("broken", "#define X 1\n#error unsupported\n")
            .unwrap_err();
        match err {
            BackendError::CompilationFailed { name, log } => {
                assert_eq!(name, "broken");
                assert!(log.contains("#error unsupported"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_launch_validates_geometry() {
        let driver = SimDriver::uniform(1, 1 << 20);
        let image = driver.compile("k", "void k() {}").unwrap();
        let module = driver.load_module(0, &image).unwrap();
        let func = driver.get_function(module, "k").unwrap();

        assert!(driver
            .launch(0, func, &LaunchConfig::linear(1, 2048, 0), &[])
            .is_err());
        driver
            .launch(0, func, &LaunchConfig::linear(2, 256, 0), &[KernelArg::U32(3)])
            .unwrap();
        let launches = driver.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].function, "k");

        driver.unload_module(module).unwrap();
        assert!(driver
            .launch(0, func, &LaunchConfig::linear(1, 1, 0), &[])
            .is_err());
    }
}
