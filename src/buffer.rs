/*!
Buffers hold the vectors a kernel reads and writes.

A [`Buffer`] lives on a [`Device`]. Moving data between the host and a device is implicit:
[`Buffer::upload`] and [`Buffer::to_device`] copy in, [`Buffer::to_vec`] copies out after
waiting for the device to finish all work that might still write to the buffer.

Allocation is fallible. Failing to reserve memory returns [`OutOfMemory`](error::OutOfMemory)
instead of aborting.

```
# use vecadd::{anyhow::Result, buffer::Buffer, device::Device};
# fn main() -> Result<()> {
let x = Buffer::upload(Device::host(), &[1f32, 2., 3.])?;
assert_eq!(x.to_vec()?, [1., 2., 3.]);
# Ok(())
# }
```
*/

use crate::device::Device;
use anyhow::Result;
use bytemuck::Pod;
use std::{
    cell::UnsafeCell,
    fmt::{self, Debug},
    mem::size_of,
    ptr::slice_from_raw_parts_mut,
    sync::Arc,
};

/// Errors.
pub mod error {
    /// Memory for a buffer could not be reserved.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Failed to allocate {bytes} bytes!")]
    pub struct OutOfMemory {
        pub(crate) bytes: usize,
    }

    impl OutOfMemory {
        pub fn bytes(&self) -> usize {
            self.bytes
        }
    }
}
use error::OutOfMemory;

fn try_with_capacity<T>(len: usize) -> Result<Vec<T>, OutOfMemory> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(len).map_err(|_| OutOfMemory {
        bytes: len.saturating_mul(size_of::<T>()),
    })?;
    Ok(vec)
}

/// Allocates `len` zeros, or fails with [`OutOfMemory`].
pub(crate) fn try_zeroed_vec<T: Pod>(len: usize) -> Result<Vec<T>, OutOfMemory> {
    let mut vec = try_with_capacity(len)?;
    vec.resize(len, T::zeroed());
    Ok(vec)
}

#[repr(transparent)]
struct SyncCell<T>(UnsafeCell<T>);

// Work-items share a buffer. Access to a single element is exclusive by the contract of
// `GlobalSliceMut::store`.
unsafe impl<T: Send + Sync> Sync for SyncCell<T> {}

pub(crate) struct RawBuffer<T> {
    cells: Box<[SyncCell<T>]>,
}

impl<T: Pod> RawBuffer<T> {
    fn from_vec(vec: Vec<T>) -> Self {
        let len = vec.len();
        let ptr = Box::into_raw(vec.into_boxed_slice()) as *mut SyncCell<T>;
        // # Safety
        // Safe because SyncCell<T> is transparent over T.
        let cells = unsafe { Box::from_raw(slice_from_raw_parts_mut(ptr, len)) };
        Self { cells }
    }
    fn into_vec(self) -> Vec<T> {
        let len = self.cells.len();
        let ptr = Box::into_raw(self.cells) as *mut T;
        // # Safety
        // Safe because SyncCell<T> is transparent over T.
        unsafe { Box::from_raw(slice_from_raw_parts_mut(ptr, len)) }.into_vec()
    }
    fn try_from_slice(data: &[T]) -> Result<Self, OutOfMemory> {
        let mut vec = try_with_capacity(data.len())?;
        vec.extend_from_slice(data);
        Ok(Self::from_vec(vec))
    }
    fn len(&self) -> usize {
        self.cells.len()
    }
    /// # Safety
    /// No kernel may be writing to the buffer.
    unsafe fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.cells.as_ptr() as *const T, self.cells.len()) }
    }
}

/** A buffer on a [`Device`].

Cloning is not provided, use [`to_device`](Buffer::to_device) to copy. */
pub struct Buffer<T: Pod> {
    raw: Arc<RawBuffer<T>>,
    device: Device,
}

impl<T: Pod> Buffer<T> {
    fn from_raw(raw: RawBuffer<T>, device: Device) -> Self {
        Self {
            raw: Arc::new(raw),
            device,
        }
    }
    /// A buffer of `len` zeros on `device`.
    pub fn zeros(device: Device, len: usize) -> Result<Self> {
        let raw = RawBuffer::from_vec(try_zeroed_vec(len)?);
        log::debug!(
            "allocated {} bytes on {device:?}",
            len * size_of::<T>()
        );
        Ok(Self::from_raw(raw, device))
    }
    /// Copies `data` to `device`.
    pub fn upload(device: Device, data: &[T]) -> Result<Self> {
        let raw = RawBuffer::try_from_slice(data)?;
        log::debug!(
            "uploaded {} bytes to {device:?}",
            data.len() * size_of::<T>()
        );
        Ok(Self::from_raw(raw, device))
    }
    /// The device the buffer is on.
    pub fn device(&self) -> Device {
        self.device.clone()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.raw.len()
    }
    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Copies into a new buffer on `device`.
    ///
    /// Waits for pending work on the current device first.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        self.device.wait()?;
        // # Safety
        // Safe because the device is idle.
        let data = unsafe { self.raw.as_slice() };
        Self::upload(device, data)
    }
    /// Moves to `device`, copying only if it is not already there.
    pub fn into_device(self, device: Device) -> Result<Self> {
        if self.device == device {
            Ok(self)
        } else {
            self.to_device(device)
        }
    }
    /// Copies the buffer to the host.
    ///
    /// Waits for pending work on the device first.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.device.wait()?;
        let mut vec = try_with_capacity(self.len())?;
        // # Safety
        // Safe because the device is idle.
        vec.extend_from_slice(unsafe { self.raw.as_slice() });
        Ok(vec)
    }
    /// Moves the buffer to the host, without copying if the buffer is on the host and
    /// no kernel still holds it.
    pub fn into_vec(self) -> Result<Vec<T>> {
        if self.device.is_host() {
            match Arc::try_unwrap(self.raw) {
                Ok(raw) => Ok(raw.into_vec()),
                Err(raw) => Self { raw, device: self.device }.to_vec(),
            }
        } else {
            self.to_vec()
        }
    }
    /// Read access for kernels.
    pub fn global(&self) -> GlobalSlice<T> {
        GlobalSlice {
            raw: self.raw.clone(),
        }
    }
    /// Write access for kernels.
    pub fn global_mut(&mut self) -> GlobalSliceMut<T> {
        GlobalSliceMut {
            raw: self.raw.clone(),
        }
    }
}

/// A host buffer.
impl<T: Pod> From<Vec<T>> for Buffer<T> {
    fn from(vec: Vec<T>) -> Self {
        Self::from_raw(RawBuffer::from_vec(vec), Device::host())
    }
}

impl<T: Pod> Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device)
            .field("len", &self.len())
            .finish()
    }
}

/** Read access to a buffer from inside a kernel.

Holds the buffer's memory alive until the kernel is dropped. Every access is bounds
checked, a work-item that reads out of range panics and fails its dispatch. */
#[derive(Clone)]
pub struct GlobalSlice<T> {
    raw: Arc<RawBuffer<T>>,
}

impl<T: Pod> GlobalSlice<T> {
    pub fn len(&self) -> usize {
        self.raw.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// **panics** if `index` is out of bounds.
    #[inline]
    pub fn load(&self, index: usize) -> T {
        // # Safety
        // Readers never overlap a store to the same index, see `GlobalSliceMut::store`.
        unsafe { *self.raw.cells[index].0.get() }
    }
}

/// Write access to a buffer from inside a kernel.
pub struct GlobalSliceMut<T> {
    raw: Arc<RawBuffer<T>>,
}

impl<T: Pod> GlobalSliceMut<T> {
    pub fn len(&self) -> usize {
        self.raw.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// **panics** if `index` is out of bounds.
    #[inline]
    pub fn load(&self, index: usize) -> T {
        unsafe { *self.raw.cells[index].0.get() }
    }
    /// Writes `value` at `index`.
    ///
    /// **panics** if `index` is out of bounds.
    ///
    /// # Safety
    /// No other work-item of any running dispatch may access `index`, and the host
    /// must not read the buffer until the dispatch has finished.
    #[inline]
    pub unsafe fn store(&self, index: usize, value: T) {
        unsafe {
            *self.raw.cells[index].0.get() = value;
        }
    }
}
