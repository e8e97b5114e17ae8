//! Strided tensor view over shared host memory.
//!
//! Every tile of a group reads and writes the same tensors, so storage is a
//! flat slice of 32-bit atomic cells. Plain loads and stores are `Relaxed`;
//! ordering between tiles comes from the channel flags and the group
//! barrier, and the launching thread observes all writes once the tile
//! threads are joined.

use crate::error::{KernelError, Result};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// Scalar types storable in a 32-bit cell.
pub trait Element: Copy + Send + Sync + PartialEq + fmt::Debug + 'static {
    /// Additive identity.
    const ZERO: Self;
    /// Bit pattern stored in the cell.
    fn to_bits(self) -> u32;
    /// Value for a stored bit pattern.
    fn from_bits(bits: u32) -> Self;
}

impl Element for f32 {
    const ZERO: Self = 0.0;

    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

impl Element for i32 {
    const ZERO: Self = 0;

    #[allow(clippy::cast_sign_loss)]
    fn to_bits(self) -> u32 {
        self as u32
    }

    #[allow(clippy::cast_possible_wrap)]
    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

/// Row-major strides for `shape`.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Tensor described by shape and strides over a flat cell buffer.
pub struct Tensor<T: Element> {
    shape: Vec<usize>,
    strides: Vec<usize>,
    cells: Box<[AtomicU32]>,
    _elem: PhantomData<T>,
}

impl<T: Element> Tensor<T> {
    /// Contiguous tensor holding `data` in row-major order.
    ///
    /// # Errors
    ///
    /// Returns error if `data.len()` differs from the element count.
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(KernelError::config(format!(
                "tensor of shape {shape:?} needs {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self::from_parts(shape.to_vec(), contiguous_strides(shape), data))
    }

    /// Contiguous tensor of zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self::from_parts(shape.to_vec(), contiguous_strides(shape), vec![T::ZERO; numel])
    }

    /// Tensor with explicit strides over `storage`.
    ///
    /// Strides may describe transposed or padded layouts; every addressable
    /// element must fall inside `storage`.
    ///
    /// # Errors
    ///
    /// Returns error if rank of shape and strides differ or the largest
    /// reachable offset exceeds the storage.
    pub fn with_strides(shape: &[usize], strides: &[usize], storage: Vec<T>) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(KernelError::config(format!(
                "shape {shape:?} and strides {strides:?} differ in rank"
            )));
        }
        if shape.iter().all(|&d| d > 0) {
            let last: usize = shape.iter().zip(strides).map(|(&d, &s)| (d - 1) * s).sum();
            if last >= storage.len() {
                return Err(KernelError::config(format!(
                    "shape {shape:?} with strides {strides:?} reaches offset {last}, storage holds {}",
                    storage.len()
                )));
            }
        }
        Ok(Self::from_parts(shape.to_vec(), strides.to_vec(), storage))
    }

    pub(crate) fn from_parts(shape: Vec<usize>, strides: Vec<usize>, data: Vec<T>) -> Self {
        let cells = data.into_iter().map(|v| AtomicU32::new(v.to_bits())).collect();
        Self { shape, strides, cells, _elem: PhantomData }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Extent of dimension `d`.
    pub fn dim(&self, d: usize) -> usize {
        self.shape[d]
    }

    /// Stride of dimension `d`, in elements.
    pub fn stride(&self, d: usize) -> usize {
        self.strides[d]
    }

    /// Shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of storage cells (≥ `numel` for padded layouts).
    pub fn storage_len(&self) -> usize {
        self.cells.len()
    }

    /// Whether two logical elements may share a storage cell.
    ///
    /// Dimensions of extent one are ignored. The remaining ones, taken from
    /// the smallest stride up, must each step past everything the inner
    /// ones reach. Interleaved layouts that fail this are reported as
    /// overlapping.
    pub fn may_overlap(&self) -> bool {
        let mut dims: Vec<(usize, usize)> = self
            .shape
            .iter()
            .zip(&self.strides)
            .filter(|&(&extent, _)| extent > 1)
            .map(|(&extent, &stride)| (stride, extent))
            .collect();
        dims.sort_unstable();
        let mut reach = 0;
        for (stride, extent) in dims {
            if stride <= reach {
                return true;
            }
            reach += (extent - 1) * stride;
        }
        false
    }

    /// Flat storage offset of a multi-index, or `None` if any coordinate is
    /// out of range.
    pub fn offset_of(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        index
            .iter()
            .zip(&self.shape)
            .zip(&self.strides)
            .try_fold(0, |acc, ((&i, &extent), &stride)| (i < extent).then(|| acc + i * stride))
    }

    /// Element at a flat storage offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= storage_len()`.
    pub fn read(&self, offset: usize) -> T {
        T::from_bits(self.cells[offset].load(Ordering::Relaxed))
    }

    /// Store at a flat storage offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= storage_len()`.
    pub fn write(&self, offset: usize, value: T) {
        self.cells[offset].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Element at a multi-index.
    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.offset_of(index).map(|o| self.read(o))
    }

    /// Store at a multi-index; returns `false` if the index is out of range.
    pub fn set(&self, index: &[usize], value: T) -> bool {
        match self.offset_of(index) {
            Some(o) => {
                self.write(o, value);
                true
            }
            None => false,
        }
    }

    /// Logical elements in row-major order.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.numel());
        if self.numel() == 0 {
            return out;
        }
        let mut index = vec![0usize; self.ndim()];
        loop {
            let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            out.push(self.read(offset));
            // odometer increment
            let mut d = self.ndim();
            loop {
                if d == 0 {
                    return out;
                }
                d -= 1;
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
    }
}

impl Tensor<f32> {
    /// Atomic `cell += value`.
    ///
    /// A single compare-exchange read-modify-write on the cell, so
    /// concurrent adders never lose an update.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= storage_len()`.
    pub fn fetch_add(&self, offset: usize, value: f32) -> f32 {
        let prev = self.cells[offset]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f32::from_bits(bits) + value).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        f32::from_bits(prev)
    }
}

impl<T: Element> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("storage_len", &self.cells.len())
            .finish()
    }
}
