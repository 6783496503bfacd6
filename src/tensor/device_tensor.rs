//! Tensors resident in device memory

use std::sync::Arc;

use crate::backend::{DeviceId, DevicePtr};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::{DeviceAllocator, DeviceMemory};

use super::dtype::DType;
use super::layout::TensorLayout;

/// Typed, shaped view over shared device storage.
///
/// Cloning shares the storage; the block is freed when the last view drops.
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    storage: Arc<DeviceMemory>,
    layout: TensorLayout,
    dtype: DType,
}

impl DeviceTensor {
    /// Uninitialized contiguous tensor
    pub fn empty(
        allocator: &Arc<dyn DeviceAllocator>,
        dtype: DType,
        sizes: &[usize],
    ) -> ForgeResult<Self> {
        let layout = TensorLayout::contiguous(sizes);
        let bytes = layout.numel() * dtype.size();
        let storage = DeviceMemory::allocate(allocator, bytes)?;
        Ok(DeviceTensor {
            storage: Arc::new(storage),
            layout,
            dtype,
        })
    }

    /// View `storage` through `layout`
    pub fn from_storage(
        storage: Arc<DeviceMemory>,
        layout: TensorLayout,
        dtype: DType,
    ) -> ForgeResult<Self> {
        let needed = layout.storage_extent() * dtype.size();
        if needed > storage.size() {
            return Err(ForgeError::InvalidTensor(format!(
                "layout reaches {} bytes but storage holds {}",
                needed,
                storage.size()
            )));
        }
        Ok(DeviceTensor {
            storage,
            layout,
            dtype,
        })
    }

    pub fn storage(&self) -> &Arc<DeviceMemory> {
        &self.storage
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> DeviceId {
        self.storage.device()
    }

    pub fn sizes(&self) -> &[usize] {
        self.layout.sizes()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn numel(&self) -> usize {
        self.layout.numel()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Address of the element at the layout offset
    pub fn data_ptr(&self) -> DevicePtr {
        self.storage
            .ptr()
            .offset((self.layout.offset() * self.dtype.size()) as u64)
    }

    pub fn transpose(&self, d0: usize, d1: usize) -> ForgeResult<Self> {
        Ok(DeviceTensor {
            storage: Arc::clone(&self.storage),
            layout: self.layout.transpose(d0, d1)?,
            dtype: self.dtype,
        })
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> ForgeResult<Self> {
        Ok(DeviceTensor {
            storage: Arc::clone(&self.storage),
            layout: self.layout.narrow(dim, start, len)?,
            dtype: self.dtype,
        })
    }

    /// Both tensors view the same storage
    pub fn shares_storage(&self, other: &DeviceTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimDriver;
    use crate::memory::PoolAllocator;

    fn allocator() -> Arc<dyn DeviceAllocator> {
        let driver = Arc::new(SimDriver::uniform(1, 1 << 20));
        Arc::new(PoolAllocator::with_capacity(driver, 0, 1 << 16).unwrap())
    }

    #[test]
    fn test_empty_allocates_numel_bytes() {
        let alloc = allocator();
        let t = DeviceTensor::empty(&alloc, DType::F64, &[3, 5]).unwrap();
        assert_eq!(t.storage().size(), 120);
        assert_eq!(alloc.live_bytes(), 256);
        assert!(t.is_contiguous());
        drop(t);
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn test_views_share_storage() {
        let alloc = allocator();
        let t = DeviceTensor::empty(&alloc, DType::F32, &[4, 6]).unwrap();
        let n = t.narrow(1, 2, 3).unwrap();
        assert!(n.shares_storage(&t));
        assert_eq!(n.data_ptr(), t.data_ptr().offset(8));
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.sizes(), &[6, 4]);
        drop(t);
        drop(n);
        // The transposed view still keeps the block alive
        assert_eq!(alloc.live_bytes(), 256);
        drop(tt);
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn test_from_storage_checks_extent() {
        let alloc = allocator();
        let storage = Arc::new(DeviceMemory::allocate(&alloc, 16).unwrap());
        assert!(DeviceTensor::from_storage(
            storage.clone(),
            TensorLayout::contiguous(&[4]),
            DType::F32
        )
        .is_ok());
        assert!(DeviceTensor::from_storage(storage, TensorLayout::contiguous(&[5]), DType::F32)
            .is_err());
    }
}
