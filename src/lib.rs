/*!
Element-wise addition of two `f32` vectors, two ways.

- [`host`]: a fork-join parallel loop over the host's threads.
- [`kernel::vector_add`]: a kernel dispatched to a [`Device`](device::Device) over an
explicit [`ExecutionRange`](vecadd_core::kernel::ExecutionRange), timed with device-side
profiling and checked with [`verify`].

```no_run
# use vecadd::{anyhow::Result, buffer::Buffer, device::Device, host, kernel, vector::N};
# fn main() -> Result<()> {
let (a, b) = host::init_inputs(N)?;
let device = Device::builder().profiling(true).build()?;
let a = Buffer::upload(device.clone(), &a)?;
let b = Buffer::upload(device.clone(), &b)?;
let mut c = Buffer::zeros(device, N)?;
let event = kernel::vector_add(&a, &b, &mut c)?;
event.wait()?;
println!("{:.6}", event.profiling()?.sample().secs());
# Ok(())
# }
```
*/

#![forbid(unsafe_op_in_unsafe_fn)]

pub extern crate anyhow;
pub extern crate vecadd_core;

#[doc(inline)]
pub use vecadd_core::vector;

pub mod buffer;
pub mod device;
pub mod host;
pub mod kernel;
pub mod timing;
pub mod verify;
