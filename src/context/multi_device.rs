//! Multi-device context manager
//!
//! Builds one [`DeviceContext`] per configured device, then negotiates peer
//! access between every ordered pair. The resulting matrix is immutable and
//! read without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{DeviceDriver, DeviceId};
use crate::config::RuntimeConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::kernels::LoadedKernelCache;
use crate::memory::DeviceAllocator;

use super::device_context::{DeviceContext, ScratchSpace};
use super::handle_pool::{BlasHandle, PooledHandle};

/// `N×N` peer-access flags; `[i][j]` means device `i` can address device
/// `j`'s memory. The diagonal is always true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAccessMatrix {
    devices: Vec<DeviceId>,
    access: Vec<bool>,
}

impl PeerAccessMatrix {
    /// Try `enable_peer_access` for every ordered pair.
    ///
    /// Failures only clear that pair's flag. The calling thread's current
    /// device is restored afterwards, even if selecting a device failed.
    pub fn negotiate(driver: &dyn DeviceDriver, devices: &[DeviceId]) -> ForgeResult<Self> {
        let n = devices.len();
        let mut access = vec![false; n * n];
        let original = driver.current_device()?;

        let result = (|| -> ForgeResult<()> {
            for (i, &src) in devices.iter().enumerate() {
                driver.set_device(src)?;
                for (j, &dst) in devices.iter().enumerate() {
                    if i == j {
                        access[i * n + j] = true;
                        continue;
                    }
                    match driver.enable_peer_access(src, dst) {
                        Ok(()) => access[i * n + j] = true,
                        Err(e) => {
                            tracing::warn!("Peer access {} -> {} unavailable: {}", src, dst, e)
                        }
                    }
                }
            }
            Ok(())
        })();

        driver.set_device(original)?;
        result?;

        Ok(PeerAccessMatrix {
            devices: devices.to_vec(),
            access,
        })
    }

    fn index(&self, device: DeviceId) -> Option<usize> {
        self.devices.iter().position(|&d| d == device)
    }

    /// `None` when either device is not managed
    pub fn get(&self, src: DeviceId, dst: DeviceId) -> Option<bool> {
        let i = self.index(src)?;
        let j = self.index(dst)?;
        Some(self.access[i * self.devices.len() + j])
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }
}

impl fmt::Display for PeerAccessMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.devices.len();
        for i in 0..n {
            let row: Vec<&str> = (0..n)
                .map(|j| if self.access[i * n + j] { "1" } else { "0" })
                .collect();
            writeln!(f, "{:>3}: {}", self.devices[i], row.join(" "))?;
        }
        Ok(())
    }
}

/// All device contexts of a process plus the loaded-kernel cache shared by
/// them
pub struct MultiDeviceContext {
    contexts: Vec<DeviceContext>,
    index: HashMap<DeviceId, usize>,
    peers: PeerAccessMatrix,
    kernel_cache: LoadedKernelCache,
    disposed: AtomicBool,
}

impl MultiDeviceContext {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: &RuntimeConfig) -> ForgeResult<Self> {
        config.validate()?;

        let available = driver.device_count()?;
        if let Some(&missing) = config.devices.iter().find(|&&d| d >= available) {
            return Err(ForgeError::UnknownDevice(missing));
        }

        let mut contexts = Vec::with_capacity(config.devices.len());
        for &device in &config.devices {
            contexts.push(DeviceContext::new(
                Arc::clone(&driver),
                device,
                config.allocator,
                config.arena_fraction,
                config.handle_pool_capacity,
            )?);
        }

        let peers = PeerAccessMatrix::negotiate(driver.as_ref(), &config.devices)?;
        tracing::debug!("Peer access matrix:\n{}", peers);

        let index = config
            .devices
            .iter()
            .enumerate()
            .map(|(i, &d)| (d, i))
            .collect();

        tracing::info!("Initialized {} device contexts", contexts.len());
        Ok(MultiDeviceContext {
            contexts,
            index,
            peers,
            kernel_cache: LoadedKernelCache::new(Arc::clone(&driver)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn for_device(&self, device: DeviceId) -> ForgeResult<&DeviceContext> {
        self.index
            .get(&device)
            .map(|&i| &self.contexts[i])
            .ok_or(ForgeError::UnknownDevice(device))
    }

    pub fn contexts(&self) -> &[DeviceContext] {
        &self.contexts
    }

    pub fn device_ids(&self) -> &[DeviceId] {
        self.peers.devices()
    }

    pub fn synchronize(&self, device: DeviceId) -> ForgeResult<()> {
        self.for_device(device)?.synchronize()
    }

    pub fn synchronize_all(&self) -> ForgeResult<()> {
        for ctx in &self.contexts {
            ctx.synchronize()?;
        }
        Ok(())
    }

    /// False for unknown devices
    pub fn can_access_peer(&self, src: DeviceId, dst: DeviceId) -> bool {
        self.peers.get(src, dst).unwrap_or(false)
    }

    pub fn peer_matrix(&self) -> &PeerAccessMatrix {
        &self.peers
    }

    pub fn allocator_for(&self, device: DeviceId) -> ForgeResult<Arc<dyn DeviceAllocator>> {
        Ok(Arc::clone(self.for_device(device)?.allocator()))
    }

    pub fn scratch_for(&self, device: DeviceId) -> ForgeResult<ScratchSpace> {
        Ok(self.for_device(device)?.scratch())
    }

    pub fn acquire_handle(&self, device: DeviceId) -> ForgeResult<PooledHandle<'_, BlasHandle>> {
        self.for_device(device)?.acquire_handle()
    }

    pub fn kernel_cache(&self) -> &LoadedKernelCache {
        &self.kernel_cache
    }

    /// Loaded kernels first, then each context in device order.
    ///
    /// Idempotent; every step runs and the first error is returned.
    pub fn dispose(&self) -> ForgeResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = self.kernel_cache.dispose().err();
        for ctx in &self.contexts {
            if let Err(e) = ctx.dispose() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MultiDeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("Disposing device contexts failed: {}", e);
        }
    }
}

impl fmt::Debug for MultiDeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDeviceContext")
            .field("devices", &self.peers.devices())
            .field("contexts", &self.contexts)
            .finish()
    }
}
