/*!
Kernels and dispatch.

A kernel implements [`KernelFn`] and is called once per work-item of an
[`ExecutionRange`]. Work-items are independent: they may run in any order and on any
number of threads, so a kernel must only write the element its work-item owns.

Padding work-items (global id at or past the item count) must not touch memory.
[`Kernel::item_id`] returns `None` for them:
```
# use vecadd::{buffer::{GlobalSlice, GlobalSliceMut}, kernel::KernelFn};
# use vecadd::vecadd_core::kernel::Kernel;
struct Scale {
    alpha: f32,
    x: GlobalSlice<f32>,
    y: GlobalSliceMut<f32>,
}

impl KernelFn for Scale {
    fn name(&self) -> &'static str {
        "scale"
    }
    fn call(&self, kernel: Kernel) {
        if let Some(i) = kernel.item_id() {
            let y = self.alpha * self.x.load(i);
            // # Safety
            // Each item id belongs to exactly one work-item.
            unsafe { self.y.store(i, y) }
        }
    }
}
```
*/

use crate::{
    buffer::{Buffer, GlobalSlice, GlobalSliceMut},
    device::{error::ProfilingNotEnabled, Device, DeviceInner},
    timing::{Clock, ProfilingInfo},
};
use anyhow::Result;
use std::{
    fmt::{self, Debug},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use vecadd_core::{
    kernel::{ExecutionRange, Kernel},
    vector::THREADS_PER_GROUP,
};

#[cfg(feature = "device")]
use crate::device::RawEvent;

/// Errors.
pub mod error {
    /// A work-item panicked, the remaining work-groups were skipped.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Kernel `{kernel}` panicked!")]
    pub struct KernelPanicked {
        pub(crate) kernel: &'static str,
    }

    impl KernelPanicked {
        /// Name of the kernel.
        pub fn kernel(&self) -> &'static str {
            self.kernel
        }
    }

    /// The buffers passed to a kernel have different lengths.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
    #[error("Length mismatch: a has {a}, b has {b} and c has {c} elements!")]
    pub struct LengthMismatch {
        pub a: usize,
        pub b: usize,
        pub c: usize,
    }

    /// The buffers passed to a kernel are on different devices.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Expected buffers on {expected:?}, found {found:?}!")]
    pub struct DeviceMismatch {
        pub(crate) expected: crate::device::Device,
        pub(crate) found: crate::device::Device,
    }
}
use error::*;

/// A kernel, called once per work-item.
pub trait KernelFn: Send + Sync + 'static {
    /// Used in logs and errors.
    fn name(&self) -> &'static str;
    /// Runs one work-item.
    fn call(&self, kernel: Kernel);
}

/** A dispatched kernel.

Dropping an event does not cancel or wait for the kernel. */
pub struct Event {
    inner: EventInner,
}

enum EventInner {
    Host {
        profiling: ProfilingInfo,
    },
    #[cfg(feature = "device")]
    Device(RawEvent),
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Event {
    /** Blocks until every work-item has finished.

    **errors**
    - [`KernelPanicked`]
    - [`DeviceLost`](crate::device::error::DeviceLost) */
    pub fn wait(&self) -> Result<()> {
        match &self.inner {
            EventInner::Host { .. } => Ok(()),
            #[cfg(feature = "device")]
            EventInner::Device(raw) => raw.wait(),
        }
    }
    /// Whether the kernel has finished, without blocking.
    pub fn is_complete(&self) -> bool {
        match &self.inner {
            EventInner::Host { .. } => true,
            #[cfg(feature = "device")]
            EventInner::Device(raw) => raw.is_complete(),
        }
    }
    /** Submit, start and end timestamps of the kernel.

    Blocks until the kernel has finished. On the host the timestamps are wall clock
    nanoseconds since the dispatch began.

    **errors**
    [`ProfilingNotEnabled`] if the device was built without
    [`profiling`](crate::device::builder::DeviceBuilder::profiling). */
    pub fn profiling(&self) -> Result<ProfilingInfo, ProfilingNotEnabled> {
        match &self.inner {
            EventInner::Host { profiling } => Ok(*profiling),
            #[cfg(feature = "device")]
            EventInner::Device(raw) => raw.profiling(),
        }
    }
}

/** Dispatches `kernel` over `range` on `device`.

On the host the kernel runs to completion on the calling thread before returning. On a
device the kernel is queued behind the kernels already dispatched to it and this returns
immediately. */
pub fn dispatch(
    device: &Device,
    range: ExecutionRange,
    kernel: Arc<dyn KernelFn>,
) -> Result<Event> {
    match device.inner() {
        DeviceInner::Host => {
            let start = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| {
                for item in range.kernels() {
                    kernel.call(item);
                }
            }));
            let end = start.elapsed().as_nanos() as u64;
            if result.is_err() {
                return Err(KernelPanicked {
                    kernel: kernel.name(),
                }
                .into());
            }
            Ok(Event {
                inner: EventInner::Host {
                    profiling: ProfilingInfo {
                        clock: Clock::Host,
                        command_submit: 0,
                        command_start: 0,
                        command_end: end,
                    },
                },
            })
        }
        #[cfg(feature = "device")]
        DeviceInner::Device(raw) => Ok(Event {
            inner: EventInner::Device(raw.dispatch(range, kernel)?),
        }),
    }
}

/// `c[i] = a[i] + b[i]`
struct VectorAdd {
    a: GlobalSlice<f32>,
    b: GlobalSlice<f32>,
    c: GlobalSliceMut<f32>,
}

impl KernelFn for VectorAdd {
    fn name(&self) -> &'static str {
        "vector_add"
    }
    #[inline]
    fn call(&self, kernel: Kernel) {
        if let Some(i) = kernel.item_id() {
            let c = self.a.load(i) + self.b.load(i);
            // # Safety
            // Each item id belongs to exactly one work-item.
            unsafe { self.c.store(i, c) }
        }
    }
}

/// Dispatches `c = a + b` in work-groups of [`THREADS_PER_GROUP`].
pub fn vector_add(a: &Buffer<f32>, b: &Buffer<f32>, c: &mut Buffer<f32>) -> Result<Event> {
    vector_add_with_threads(a, b, c, THREADS_PER_GROUP)
}

/** Dispatches `c = a + b` in work-groups of `threads`.

**errors**
- [`LengthMismatch`]
- [`DeviceMismatch`]
- [`ExecutionRangeError`](vecadd_core::kernel::error::ExecutionRangeError) */
pub fn vector_add_with_threads(
    a: &Buffer<f32>,
    b: &Buffer<f32>,
    c: &mut Buffer<f32>,
    threads: u32,
) -> Result<Event> {
    if a.len() != c.len() || b.len() != c.len() {
        return Err(LengthMismatch {
            a: a.len(),
            b: b.len(),
            c: c.len(),
        }
        .into());
    }
    let device = c.device();
    for found in [a.device(), b.device()] {
        if found != device {
            return Err(DeviceMismatch {
                expected: device,
                found,
            }
            .into());
        }
    }
    let range = ExecutionRange::new(c.len(), threads)?;
    let kernel = VectorAdd {
        a: a.global(),
        b: b.global(),
        c: c.global_mut(),
    };
    dispatch(&device, range, Arc::new(kernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecadd_core::kernel::error::ExecutionRangeError;

    fn inputs(n: usize) -> (Buffer<f32>, Buffer<f32>) {
        let a = (0..n).map(vecadd_core::vector::a).collect::<Vec<_>>();
        let b = (0..n).map(vecadd_core::vector::b).collect::<Vec<_>>();
        (Buffer::from(a), Buffer::from(b))
    }

    #[test]
    fn vector_add_host() {
        for n in [0, 1, 255, 256, 257, 1000] {
            let (a, b) = inputs(n);
            let mut c = Buffer::zeros(Device::host(), n).unwrap();
            let event = vector_add(&a, &b, &mut c).unwrap();
            assert!(event.is_complete());
            event.wait().unwrap();
            let c = c.into_vec().unwrap();
            for (i, c) in c.into_iter().enumerate() {
                assert_eq!(c, i as f32 * 2.5);
            }
        }
    }

    #[test]
    fn length_mismatch() {
        let (a, _) = inputs(10);
        let (_, b) = inputs(11);
        let mut c = Buffer::zeros(Device::host(), 10).unwrap();
        let err = vector_add(&a, &b, &mut c).unwrap_err();
        assert_eq!(
            err.downcast::<LengthMismatch>().unwrap(),
            LengthMismatch { a: 10, b: 11, c: 10 }
        );
    }

    #[test]
    fn zero_threads() {
        let (a, b) = inputs(10);
        let mut c = Buffer::zeros(Device::host(), 10).unwrap();
        let err = vector_add_with_threads(&a, &b, &mut c, 0).unwrap_err();
        assert_eq!(
            err.downcast::<ExecutionRangeError>().unwrap(),
            ExecutionRangeError::ZeroThreads
        );
    }

    struct Unguarded {
        x: GlobalSlice<f32>,
    }

    impl KernelFn for Unguarded {
        fn name(&self) -> &'static str {
            "unguarded"
        }
        fn call(&self, kernel: Kernel) {
            self.x.load(kernel.global_id() as usize);
        }
    }

    #[test]
    fn missing_guard_fails_dispatch() {
        let x = Buffer::from(vec![0f32; 100]);
        let range = ExecutionRange::new(x.len(), 64).unwrap();
        let kernel = Arc::new(Unguarded { x: x.global() });
        let err = dispatch(&Device::host(), range, kernel)
            .unwrap_err()
            .downcast::<KernelPanicked>()
            .unwrap();
        assert_eq!(err.kernel, "unguarded");
    }

    #[test]
    fn host_profiling() {
        let (a, b) = inputs(1000);
        let mut c = Buffer::zeros(Device::host(), 1000).unwrap();
        let info = vector_add(&a, &b, &mut c).unwrap().profiling().unwrap();
        assert_eq!(info.clock(), Clock::Host);
        assert!(info.command_start() <= info.command_end());
    }
}
