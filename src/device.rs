/*!
A [`Device`] runs kernels. [`Device::host()`] is the lack of a device: kernels dispatched to
the host run on the calling thread, one work-item after another.

The compute device is a pool of worker threads fed by a queue. Each dispatch is split into
work-groups, workers claim work-groups until none are left, and the device stamps the
start of the first and the end of the last on its own clock.

Creating a device with profiling enabled and printing its info:
```no_run
# use vecadd::{anyhow::Result, device::Device};
# fn main() -> Result<()> {
let device = Device::builder()
    .profiling(true)
    .build()?;
dbg!(device.info());
# Ok(())
# }
```

There is no fallback: if the requested device can not be created, [`DeviceBuilder::build`]
fails.

# Queues
Dispatching a kernel returns as soon as the kernel is queued. The queue is in order: a
kernel starts only after the kernel dispatched before it on the same device has finished,
so a kernel may read what the previous one wrote without waiting in between.
[`Device::wait()`] blocks until every queued kernel has finished.
*/

#[cfg(feature = "device")]
use crate::{kernel::KernelFn, timing::ProfilingInfo};
use anyhow::Result;
use serde::Serialize;
use std::{
    fmt::{self, Debug},
    num::NonZeroUsize,
    sync::Arc,
};
#[cfg(feature = "device")]
use vecadd_core::kernel::ExecutionRange;

#[cfg(feature = "device")]
mod cpu_engine;
#[cfg(feature = "device")]
use cpu_engine::Engine;

/// Errors.
pub mod error {
    #[cfg(feature = "device")]
    use super::DeviceId;
    use std::fmt::{self, Display};

    /** Device is unavailable.

    The "device" feature is not enabled. */
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("DeviceUnavailable")]
    pub struct DeviceUnavailable;

    /// The device index is greater than or equal to the number of devices.
    #[cfg(feature = "device")]
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device index {index} is out of range 0..{devices}!")]
    pub struct DeviceIndexOutOfRange {
        pub(super) index: usize,
        pub(super) devices: usize,
    }

    /// The device was lost, its workers have exited.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    pub struct DeviceLost(#[cfg(feature = "device")] pub(super) DeviceId);

    impl Display for DeviceLost {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            #[cfg(feature = "device")]
            {
                write!(f, "{:?} was lost!", self.0)
            }
            #[cfg(not(feature = "device"))]
            {
                f.write_str("Device was lost!")
            }
        }
    }

    /// Profiling info was requested from a device built without profiling.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Profiling is not enabled on this device!")]
    pub struct ProfilingNotEnabled;
}
use error::*;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Device`].
    pub struct DeviceBuilder {
        #[cfg(feature = "device")]
        pub(super) options: DeviceOptions,
    }

    impl DeviceBuilder {
        /// Index of the device, defaults to 0.
        pub fn index(self, index: usize) -> Self {
            #[cfg(feature = "device")]
            {
                let mut this = self;
                this.options.index = index;
                this
            }
            #[cfg(not(feature = "device"))]
            {
                let _ = index;
                self
            }
        }
        /// Number of worker threads, defaults to the available parallelism.
        pub fn compute_units(self, compute_units: NonZeroUsize) -> Self {
            #[cfg(feature = "device")]
            {
                let mut this = self;
                this.options.compute_units = Some(compute_units);
                this
            }
            #[cfg(not(feature = "device"))]
            {
                let _ = compute_units;
                self
            }
        }
        /// Stamp kernels with device timestamps, see [`Event::profiling`](crate::kernel::Event::profiling).
        /// Defaults to false.
        pub fn profiling(self, profiling: bool) -> Self {
            #[cfg(feature = "device")]
            {
                let mut this = self;
                this.options.profiling = profiling;
                this
            }
            #[cfg(not(feature = "device"))]
            {
                let _ = profiling;
                self
            }
        }
        /// Creates a device.
        ///
        /// **errors**
        ///
        /// - [`DeviceUnavailable`](super::error::DeviceUnavailable)
        /// - [`DeviceIndexOutOfRange`](super::error::DeviceIndexOutOfRange)
        /// - The worker threads could not be spawned.
        pub fn build(self) -> Result<Device> {
            #[cfg(feature = "device")]
            {
                let raw = RawDevice::new(self.options)?;
                Ok(Device {
                    inner: DeviceInner::Device(raw),
                })
            }
            #[cfg(not(feature = "device"))]
            {
                Err(DeviceUnavailable.into())
            }
        }
    }
}
use builder::*;

#[cfg(feature = "device")]
trait DeviceEngine {
    type Event: DeviceEngineEvent;
    fn new(options: DeviceOptions) -> Result<Arc<Self>>;
    fn devices() -> usize;
    fn id(&self) -> DeviceId;
    fn info(&self) -> &Arc<DeviceInfo>;
    fn wait(&self) -> Result<(), DeviceLost>;
    fn dispatch(&self, range: ExecutionRange, kernel: Arc<dyn KernelFn>) -> Result<Self::Event>;
}

#[cfg(feature = "device")]
trait DeviceEngineEvent {
    fn wait(&self) -> Result<()>;
    fn is_complete(&self) -> bool;
    fn profiling(&self) -> Result<ProfilingInfo, ProfilingNotEnabled>;
}

#[cfg(feature = "device")]
struct DeviceOptions {
    index: usize,
    compute_units: Option<NonZeroUsize>,
    profiling: bool,
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`](std::sync::Arc::clone).

Devices (other than the host) are unique:
```no_run
# use vecadd::{anyhow::Result, device::Device};
# fn main() -> Result<()> {
let a = Device::builder().build()?;
let b = Device::builder().build()?;
assert_ne!(a, b);
# Ok(())
# }
```
*/
#[derive(Clone, Eq, PartialEq)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    /// The host.
    pub const fn host() -> Self {
        Self {
            inner: DeviceInner::Host,
        }
    }
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            #[cfg(feature = "device")]
            options: DeviceOptions {
                index: 0,
                compute_units: None,
                profiling: false,
            },
        }
    }
    /// Is the host.
    pub fn is_host(&self) -> bool {
        matches!(self.inner, DeviceInner::Host)
    }
    /// Is a device.
    pub fn is_device(&self) -> bool {
        !self.is_host()
    }
    pub(crate) fn inner(&self) -> &DeviceInner {
        &self.inner
    }
    /** Device info.

    The host returns None. */
    pub fn info(&self) -> Option<&Arc<DeviceInfo>> {
        match self.inner() {
            DeviceInner::Host => None,
            #[cfg(feature = "device")]
            DeviceInner::Device(raw) => Some(raw.info()),
        }
    }
    /** Wait for previous work to finish.

    If host, this does nothing.

    This is primarily for benchmarking, reading a buffer back waits already.

    **errors**
    Returns an error if the device was lost while waiting. */
    pub fn wait(&self) -> Result<(), DeviceLost> {
        match self.inner() {
            DeviceInner::Host => Ok(()),
            #[cfg(feature = "device")]
            DeviceInner::Device(raw) => raw.wait(),
        }
    }
}

/// See [`Device::host()`].
impl Default for Device {
    fn default() -> Self {
        Self::host()
    }
}

/** Prints `Host` or `Device(index@handle)` where handle uniquely identifies the device.

See [`.info()`](Device::info) for printing device info. */
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner() {
            DeviceInner::Host => f.debug_struct("Host").finish(),
            #[cfg(feature = "device")]
            DeviceInner::Device(raw) => raw.fmt(f),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub(crate) enum DeviceInner {
    Host,
    #[cfg(feature = "device")]
    Device(RawDevice),
}

#[cfg(feature = "device")]
#[derive(Clone)]
pub(crate) struct RawDevice {
    engine: Arc<Engine>,
}

#[cfg(feature = "device")]
pub(crate) struct RawEvent {
    inner: <Engine as DeviceEngine>::Event,
}

#[cfg(feature = "device")]
impl RawEvent {
    pub(crate) fn wait(&self) -> Result<()> {
        self.inner.wait()
    }
    pub(crate) fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }
    pub(crate) fn profiling(&self) -> Result<ProfilingInfo, ProfilingNotEnabled> {
        self.inner.profiling()
    }
}

#[cfg(feature = "device")]
impl RawDevice {
    fn new(options: DeviceOptions) -> Result<Self> {
        let devices = Engine::devices();
        if options.index >= devices {
            return Err(DeviceIndexOutOfRange {
                index: options.index,
                devices,
            }
            .into());
        }
        let engine = Engine::new(options)?;
        log::debug!("created {:?}: {:?}", engine.id(), engine.info());
        Ok(Self { engine })
    }
    pub(crate) fn info(&self) -> &Arc<DeviceInfo> {
        self.engine.info()
    }
    fn wait(&self) -> Result<(), DeviceLost> {
        self.engine.wait()
    }
    pub(crate) fn dispatch(
        &self,
        range: ExecutionRange,
        kernel: Arc<dyn KernelFn>,
    ) -> Result<RawEvent> {
        let inner = self.engine.dispatch(range, kernel)?;
        Ok(RawEvent { inner })
    }
}

#[cfg(feature = "device")]
impl PartialEq for RawDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

#[cfg(feature = "device")]
impl Eq for RawDevice {}

#[cfg(feature = "device")]
impl Debug for RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.engine.id().fmt(f)
    }
}

#[cfg(feature = "device")]
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct DeviceId {
    index: usize,
    handle: usize,
}

#[cfg(feature = "device")]
impl Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({}@{:x})", self.index, self.handle)
    }
}

/// Device info.
#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    index: usize,
    name: String,
    compute_units: usize,
    profiling: bool,
}

impl DeviceInfo {
    /// Index passed to [`DeviceBuilder::index`].
    pub fn index(&self) -> usize {
        self.index
    }
    /// Name of the hardware the device runs on.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Number of worker threads.
    pub fn compute_units(&self) -> usize {
        self.compute_units
    }
    /// Whether kernels are profiled.
    pub fn profiling(&self) -> bool {
        self.profiling
    }
}

#[cfg(all(test, feature = "device"))]
mod tests {
    use super::*;

    #[test]
    fn host_is_default() {
        let host = Device::default();
        assert!(host.is_host());
        assert!(host.info().is_none());
        host.wait().unwrap();
        assert_eq!(format!("{host:?}"), "Host");
    }

    #[test]
    fn devices_are_unique() {
        let a = Device::builder().build().unwrap();
        let b = Device::builder().build().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.is_device());
    }

    #[test]
    fn index_out_of_range() {
        let err = Device::builder().index(1).build().unwrap_err();
        let err = err.downcast::<DeviceIndexOutOfRange>().unwrap();
        assert_eq!(err.index, 1);
        assert_eq!(err.devices, 1);
    }

    #[test]
    fn device_lost_names_device() {
        let device = Device::builder().build().unwrap();
        let id = match device.inner() {
            DeviceInner::Device(raw) => raw.engine.id(),
            DeviceInner::Host => unreachable!(),
        };
        let lost = DeviceLost(id);
        assert_eq!(lost.to_string(), format!("{id:?} was lost!"));
        assert!(lost.to_string().starts_with("Device(0@"));
    }

    #[test]
    fn info() {
        let device = Device::builder()
            .compute_units(NonZeroUsize::new(3).unwrap())
            .profiling(true)
            .build()
            .unwrap();
        let info = device.info().unwrap();
        assert_eq!(info.index(), 0);
        assert_eq!(info.compute_units(), 3);
        assert!(info.profiling());
        assert!(!info.name().is_empty());
    }

    #[test]
    fn info_serializes() {
        let device = Device::builder().build().unwrap();
        let info = device.info().unwrap();
        let bytes = bincode::serialize(info.as_ref()).unwrap();
        let name = info.name().as_bytes();
        assert!(bytes.windows(name.len()).any(|x| x == name));
    }
}
