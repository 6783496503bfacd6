//! Shape and stride metadata
//!
//! Strides and offsets are counted in elements. A layout never owns memory;
//! views (`transpose`, `narrow`) produce new layouts over the same storage.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{ForgeError, ForgeResult};
use crate::kernels::IndexWidth;

/// Largest rank a kernel `TensorInfo` can describe after collapsing
pub const MAX_KERNEL_DIMS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    sizes: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl TensorLayout {
    /// Row-major contiguous layout
    pub fn contiguous(sizes: &[usize]) -> Self {
        let mut strides = vec![0; sizes.len()];
        let mut running = 1usize;
        for i in (0..sizes.len()).rev() {
            strides[i] = running;
            running *= sizes[i].max(1);
        }
        TensorLayout {
            sizes: sizes.to_vec(),
            strides,
            offset: 0,
        }
    }

    pub fn new(sizes: Vec<usize>, strides: Vec<usize>, offset: usize) -> ForgeResult<Self> {
        if sizes.len() != strides.len() {
            return Err(ForgeError::InvalidTensor(format!(
                "{} sizes but {} strides",
                sizes.len(),
                strides.len()
            )));
        }
        Ok(TensorLayout {
            sizes,
            strides,
            offset,
        })
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Elements are laid out densely in row-major order.
    ///
    /// Dimensions of size 1 do not constrain their stride.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1usize;
        for i in (0..self.rank()).rev() {
            if self.sizes[i] == 1 {
                continue;
            }
            if self.strides[i] != expected {
                return false;
            }
            expected *= self.sizes[i];
        }
        true
    }

    /// Largest element offset any index can reach
    pub fn max_offset(&self) -> usize {
        if self.numel() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .sizes
                .iter()
                .zip(&self.strides)
                .map(|(&size, &stride)| (size - 1) * stride)
                .sum::<usize>()
    }

    /// Largest byte offset any index can reach
    pub fn max_byte_offset(&self, elem_size: usize) -> usize {
        self.max_offset() * elem_size
    }

    /// Elements the underlying storage must hold
    pub fn storage_extent(&self) -> usize {
        if self.numel() == 0 {
            0
        } else {
            self.max_offset() + 1
        }
    }

    /// Swap two dimensions
    pub fn transpose(&self, d0: usize, d1: usize) -> ForgeResult<Self> {
        self.check_dim(d0)?;
        self.check_dim(d1)?;
        let mut layout = self.clone();
        layout.sizes.swap(d0, d1);
        layout.strides.swap(d0, d1);
        Ok(layout)
    }

    /// Restrict dimension `dim` to `[start, start + len)`
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> ForgeResult<Self> {
        self.check_dim(dim)?;
        if start + len > self.sizes[dim] {
            return Err(ForgeError::InvalidTensor(format!(
                "narrow [{}, {}) out of range for dimension {} of size {}",
                start,
                start + len,
                dim,
                self.sizes[dim]
            )));
        }
        let mut layout = self.clone();
        layout.offset += start * self.strides[dim];
        layout.sizes[dim] = len;
        Ok(layout)
    }

    fn check_dim(&self, dim: usize) -> ForgeResult<()> {
        if dim >= self.rank() {
            return Err(ForgeError::InvalidTensor(format!(
                "dimension {} out of range for rank {}",
                dim,
                self.rank()
            )));
        }
        Ok(())
    }

    /// Merge adjacent dimensions that are mutually contiguous, innermost
    /// first: dimension `i` joins the group inside it when
    /// `stride[i] == group_stride * group_size`. Size-1 dimensions vanish.
    ///
    /// Empty tensors collapse to `[0]`; rank 0 stays rank 0. Offset is kept.
    pub fn collapsed(&self) -> TensorLayout {
        if self.rank() == 0 {
            return self.clone();
        }
        if self.numel() == 0 {
            return TensorLayout {
                sizes: vec![0],
                strides: vec![1],
                offset: self.offset,
            };
        }
        // Built innermost-first, reversed at the end
        let mut sizes: Vec<usize> = Vec::new();
        let mut strides: Vec<usize> = Vec::new();
        for i in (0..self.rank()).rev() {
            let (size, stride) = (self.sizes[i], self.strides[i]);
            if size == 1 {
                continue;
            }
            if let (Some(group_size), Some(&group_stride)) = (sizes.last_mut(), strides.last()) {
                if stride == group_stride * *group_size {
                    *group_size *= size;
                    continue;
                }
            }
            sizes.push(size);
            strides.push(stride);
        }
        if sizes.is_empty() {
            sizes.push(1);
            strides.push(1);
        }
        sizes.reverse();
        strides.reverse();
        TensorLayout {
            sizes,
            strides,
            offset: self.offset,
        }
    }

    /// Encode as the kernel-side `TensorInfo<IndexType>` struct:
    ///
    /// ```text
    /// IndexType offset; uint32_t dims; [pad to IndexType];
    /// IndexType sizes[MAX_KERNEL_DIMS]; IndexType strides[MAX_KERNEL_DIMS];
    /// ```
    ///
    /// The layout is collapsed first. Little-endian.
    pub fn encode_info(&self, width: IndexWidth) -> ForgeResult<Vec<u8>> {
        let collapsed = self.collapsed();
        let dims = collapsed.rank();
        if dims > MAX_KERNEL_DIMS {
            return Err(ForgeError::InvalidTensor(format!(
                "rank {} after collapsing exceeds kernel limit {}",
                dims, MAX_KERNEL_DIMS
            )));
        }

        let index_bytes = width.bytes();
        let mut buf = Vec::with_capacity(2 * index_bytes * (MAX_KERNEL_DIMS + 1));
        write_index(&mut buf, width, collapsed.offset)?;
        buf.write_u32::<LittleEndian>(dims as u32)?;
        while buf.len() % index_bytes != 0 {
            buf.write_u8(0)?;
        }
        for values in [&collapsed.sizes, &collapsed.strides] {
            for i in 0..MAX_KERNEL_DIMS {
                write_index(&mut buf, width, values.get(i).copied().unwrap_or(0))?;
            }
        }
        Ok(buf)
    }
}

fn write_index(buf: &mut Vec<u8>, width: IndexWidth, value: usize) -> ForgeResult<()> {
    match width {
        IndexWidth::U32 => {
            let v = u32::try_from(value).map_err(|_| {
                ForgeError::InvalidTensor(format!("{} does not fit 32-bit indexing", value))
            })?;
            buf.write_u32::<LittleEndian>(v)?;
        }
        IndexWidth::U64 => buf.write_u64::<LittleEndian>(value as u64)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        let layout = TensorLayout::contiguous(&[4, 5, 6]);
        assert_eq!(layout.strides(), &[30, 6, 1]);
        assert_eq!(layout.numel(), 120);
        assert!(layout.is_contiguous());
        assert_eq!(layout.max_offset(), 119);
        assert_eq!(layout.max_byte_offset(4), 476);
    }

    #[test]
    fn test_transpose_is_not_contiguous() {
        let layout = TensorLayout::contiguous(&[2, 3]).transpose(0, 1).unwrap();
        assert_eq!(layout.sizes(), &[3, 2]);
        assert_eq!(layout.strides(), &[1, 3]);
        assert!(!layout.is_contiguous());
        assert_eq!(layout.max_offset(), 5);
        assert!(layout.transpose(0, 2).is_err());
    }

    #[test]
    fn test_narrow_moves_offset() {
        let layout = TensorLayout::contiguous(&[4, 8]).narrow(1, 2, 4).unwrap();
        assert_eq!(layout.offset(), 2);
        assert_eq!(layout.sizes(), &[4, 4]);
        assert!(!layout.is_contiguous());
        assert_eq!(layout.storage_extent(), 2 + 3 * 8 + 3 + 1);
        assert!(layout.narrow(0, 3, 2).is_err());
    }

    #[test]
    fn test_size_one_dims_ignore_stride() {
        let layout = TensorLayout::new(vec![1, 5], vec![999, 1], 0).unwrap();
        assert!(layout.is_contiguous());
        assert!(TensorLayout::new(vec![2], vec![1, 1], 0).is_err());
    }

    #[test]
    fn test_collapse() {
        assert_eq!(
            TensorLayout::contiguous(&[4, 5, 6]).collapsed().sizes(),
            &[120]
        );
        let narrowed = TensorLayout::contiguous(&[3, 4, 8]).narrow(2, 0, 4).unwrap();
        let collapsed = narrowed.collapsed();
        assert_eq!(collapsed.sizes(), &[12, 4]);
        assert_eq!(collapsed.strides(), &[8, 1]);

        let empty = TensorLayout::contiguous(&[3, 0]).collapsed();
        assert_eq!(empty.sizes(), &[0]);
        let scalar = TensorLayout::contiguous(&[]).collapsed();
        assert_eq!(scalar.rank(), 0);
        let ones = TensorLayout::contiguous(&[1, 1]).collapsed();
        assert_eq!(ones.sizes(), &[1]);
    }

    #[test]
    fn test_encode_info_sizes() {
        let layout = TensorLayout::contiguous(&[2, 3]).transpose(0, 1).unwrap();
        let info32 = layout.encode_info(IndexWidth::U32).unwrap();
        assert_eq!(info32.len(), 4 + 4 + 2 * 4 * MAX_KERNEL_DIMS);
        let info64 = layout.encode_info(IndexWidth::U64).unwrap();
        assert_eq!(info64.len(), 8 + 8 + 2 * 8 * MAX_KERNEL_DIMS);
        // dims field follows the offset
        assert_eq!(&info32[4..8], &2u32.to_le_bytes());
        // first size, first stride
        assert_eq!(&info32[8..12], &3u32.to_le_bytes());
        assert_eq!(&info32[8 + 4 * MAX_KERNEL_DIMS..12 + 4 * MAX_KERNEL_DIMS], &1u32.to_le_bytes());
    }

    #[test]
    fn test_encode_rejects_wide_offsets_in_32_bit() {
        let layout = TensorLayout::new(vec![2], vec![1], 1usize << 33).unwrap();
        assert!(layout.encode_info(IndexWidth::U32).is_err());
        assert!(layout.encode_info(IndexWidth::U64).is_ok());
    }
}
