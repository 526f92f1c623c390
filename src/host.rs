/*!
The multi-threaded host variant.

The loop is split across the threads of the current [rayon] pool. Chunking is left to
rayon, each thread writes a disjoint part of the output, and the result does not depend
on the number of threads.
*/

use crate::{
    buffer::try_zeroed_vec,
    kernel::error::LengthMismatch,
    timing::{self, TimingSample},
};
use anyhow::Result;
use rayon::prelude::*;
use vecadd_core::vector;

/// `n` zeros, failing instead of aborting if memory can not be reserved.
pub fn zeros(n: usize) -> Result<Vec<f32>> {
    Ok(try_zeroed_vec(n)?)
}

/// The inputs `a[i] = i * 0.5` and `b[i] = i * 2.0`.
pub fn init_inputs(n: usize) -> Result<(Vec<f32>, Vec<f32>)> {
    let mut a = zeros(n)?;
    let mut b = zeros(n)?;
    a.par_iter_mut()
        .zip(b.par_iter_mut())
        .enumerate()
        .for_each(|(i, (a, b))| {
            *a = vector::a(i);
            *b = vector::b(i);
        });
    log::debug!("initialized {n} inputs");
    Ok((a, b))
}

/// `c[i] = a[i] + b[i]` on the current rayon pool.
pub fn vector_add(a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
    if a.len() != c.len() || b.len() != c.len() {
        return Err(LengthMismatch {
            a: a.len(),
            b: b.len(),
            c: c.len(),
        }
        .into());
    }
    c.par_iter_mut()
        .zip(a.par_iter().zip(b.par_iter()))
        .for_each(|(c, (a, b))| *c = a + b);
    Ok(())
}

/// [`vector_add`], timed with the host clock.
///
/// Only the addition is timed.
pub fn vector_add_timed(a: &[f32], b: &[f32], c: &mut [f32]) -> Result<TimingSample> {
    let ((), sample) = timing::time(|| vector_add(a, b, c))?;
    log::debug!(
        "vector_add of {} elements on {} threads in {sample}s",
        c.len(),
        rayon::current_num_threads()
    );
    Ok(sample)
}
