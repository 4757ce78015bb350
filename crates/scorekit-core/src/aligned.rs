//! 32-byte aligned storage for kernel inputs.
//!
//! The vector kernels use aligned 256-bit loads, so model parameters are kept
//! in buffers whose base address is a multiple of [`ALIGNMENT`].

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use bytemuck::{Pod, Zeroable};

/// Alignment, in bytes, of the widest register the kernels load.
pub const ALIGNMENT: usize = 32;

/// One register's worth of storage.
#[derive(Clone, Copy, PartialEq)]
#[repr(C, align(32))]
struct Block([u32; 8]);

// Safety: `Block` is a `repr(C)` wrapper around `[u32; 8]`; its size equals its
// alignment (32), so it has no padding and every bit pattern is valid.
unsafe impl Zeroable for Block {}
unsafe impl Pod for Block {}

const _: () = assert!(std::mem::size_of::<Block>() == ALIGNMENT);

/// Element types a kernel lane can hold: 4-byte plain old data.
pub trait Lane: Pod + private::Sealed {}

impl Lane for f32 {}
impl Lane for u32 {}
impl Lane for i32 {}

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u32 {}
    impl Sealed for i32 {}
}

/// Whether the slice starts on a 32-byte boundary. Empty slices always pass.
#[inline]
pub fn is_aligned<T>(slice: &[T]) -> bool {
    slice.is_empty() || slice.as_ptr() as usize % ALIGNMENT == 0
}

/// Byte offset of the slice start past the previous 32-byte boundary.
#[inline]
pub(crate) fn misalignment<T>(slice: &[T]) -> usize {
    if slice.is_empty() {
        0
    } else {
        slice.as_ptr() as usize % ALIGNMENT
    }
}

/// Owned, fixed-length, 32-byte aligned buffer of 4-byte lanes.
#[derive(Clone)]
pub struct AlignedVec<T: Lane> {
    blocks: Vec<Block>,
    len: usize,
    _lane: PhantomData<T>,
}

impl<T: Lane> AlignedVec<T> {
    const LANES_PER_BLOCK: usize = ALIGNMENT / std::mem::size_of::<T>();

    /// Buffer of `len` zeroed lanes.
    pub fn zeroed(len: usize) -> Self {
        let blocks = vec![Block::zeroed(); len.div_ceil(Self::LANES_PER_BLOCK)];
        Self {
            blocks,
            len,
            _lane: PhantomData,
        }
    }

    /// Aligned copy of `values`.
    pub fn from_slice(values: &[T]) -> Self {
        let mut out = Self::zeroed(values.len());
        out.as_mut_slice().copy_from_slice(values);
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &bytemuck::cast_slice::<Block, T>(&self.blocks)[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut bytemuck::cast_slice_mut::<Block, T>(&mut self.blocks)[..self.len]
    }

    /// Bytes of payload held (excluding padding to the last block).
    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }
}

impl<T: Lane> Deref for AlignedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Lane> DerefMut for AlignedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Lane> From<&[T]> for AlignedVec<T> {
    fn from(values: &[T]) -> Self {
        Self::from_slice(values)
    }
}

impl<T: Lane> From<Vec<T>> for AlignedVec<T> {
    fn from(values: Vec<T>) -> Self {
        Self::from_slice(&values)
    }
}

impl<T: Lane + fmt::Debug> fmt::Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: Lane + PartialEq> PartialEq for AlignedVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}
