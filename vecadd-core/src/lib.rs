#![forbid(unsafe_code)]

/*!
Types shared by the host loop and the device kernels.

- [`kernel`]: the explicit execution range of a dispatch and the ids of a single work-item.
- [`vector`]: the problem size and the deterministic inputs.
*/

pub mod kernel;
pub mod vector;
