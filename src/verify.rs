/*!
Host-side verification of a sum.

The scan stops at the first element outside the tolerance, so at most one mismatch is
reported. NaN is never within tolerance.
*/

use crate::kernel::error::LengthMismatch;
use anyhow::Result;
use num_traits::Float;
use std::fmt::{self, Display};

/// Absolute tolerance used by [`verify`].
pub const DEFAULT_TOLERANCE: f32 = 1e-5;

/// The first element that was not within tolerance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mismatch<T> {
    pub index: usize,
    pub actual: T,
    pub expected: T,
}

impl<T: Display> Display for Mismatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Error at index {}: {} != {}",
            self.index, self.actual, self.expected
        )
    }
}

/// Outcome of a verification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Verification<T> {
    errors: usize,
    first_mismatch: Option<Mismatch<T>>,
}

impl<T: Copy> Verification<T> {
    /// No element was outside the tolerance.
    pub fn passed(&self) -> bool {
        self.errors == 0
    }
    /// Number of mismatches found before the scan stopped.
    pub fn errors(&self) -> usize {
        self.errors
    }
    pub fn first_mismatch(&self) -> Option<Mismatch<T>> {
        self.first_mismatch
    }
}

/// Prints `Verification: SUCCESS` or `Verification: FAILED`.
impl<T> Display for Verification<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let outcome = if self.errors == 0 { "SUCCESS" } else { "FAILED" };
        write!(f, "Verification: {outcome}")
    }
}

/// Checks `c == a + b` within [`DEFAULT_TOLERANCE`].
pub fn verify(a: &[f32], b: &[f32], c: &[f32]) -> Result<Verification<f32>> {
    verify_with_tolerance(a, b, c, DEFAULT_TOLERANCE)
}

/** Checks `|c[i] - (a[i] + b[i])| <= tolerance` for every `i`, stopping at the first
mismatch.

**errors**
[`LengthMismatch`] */
pub fn verify_with_tolerance<T: Float>(
    a: &[T],
    b: &[T],
    c: &[T],
    tolerance: T,
) -> Result<Verification<T>> {
    if a.len() != c.len() || b.len() != c.len() {
        return Err(LengthMismatch {
            a: a.len(),
            b: b.len(),
            c: c.len(),
        }
        .into());
    }
    let first_mismatch = a
        .iter()
        .zip(b)
        .zip(c)
        .enumerate()
        .find_map(|(index, ((a, b), c))| {
            let expected = *a + *b;
            let within = (*c - expected).abs() <= tolerance;
            if within {
                None
            } else {
                Some(Mismatch {
                    index,
                    actual: *c,
                    expected,
                })
            }
        });
    if let Some(mismatch) = first_mismatch.as_ref() {
        log::debug!("first mismatch at {}", mismatch.index);
    }
    Ok(Verification {
        errors: first_mismatch.is_some() as usize,
        first_mismatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host;

    fn sum(n: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let (a, b) = host::init_inputs(n).unwrap();
        let mut c = host::zeros(n).unwrap();
        host::vector_add(&a, &b, &mut c).unwrap();
        (a, b, c)
    }

    #[test]
    fn passes() {
        let (a, b, c) = sum(4096);
        let verification = verify(&a, &b, &c).unwrap();
        assert!(verification.passed());
        assert_eq!(verification.errors(), 0);
        assert_eq!(verification.first_mismatch(), None);
        assert_eq!(verification.to_string(), "Verification: SUCCESS");
    }

    #[test]
    fn reports_first_corruption_only() {
        let (a, b, mut c) = sum(4096);
        c[1234] += 1.0;
        c[3000] = -1.0;
        let verification = verify(&a, &b, &c).unwrap();
        assert!(!verification.passed());
        assert_eq!(verification.errors(), 1);
        let mismatch = verification.first_mismatch().unwrap();
        assert_eq!(mismatch.index, 1234);
        assert_eq!(mismatch.expected, 1234. * 2.5);
        assert_eq!(mismatch.actual, 1234. * 2.5 + 1.);
        assert_eq!(mismatch.to_string(), "Error at index 1234: 3086 != 3085");
        assert_eq!(verification.to_string(), "Verification: FAILED");
    }

    #[test]
    fn within_tolerance() {
        let verification = verify_with_tolerance(&[1f64], &[2.], &[3.0 + 1e-7], 1e-6).unwrap();
        assert!(verification.passed());
        let verification = verify_with_tolerance(&[1f64], &[2.], &[3.0 + 1e-5], 1e-6).unwrap();
        assert!(!verification.passed());
    }

    #[test]
    fn nan_is_a_mismatch() {
        let verification = verify(&[0.], &[0.], &[f32::NAN]).unwrap();
        assert_eq!(verification.first_mismatch().unwrap().index, 0);
    }

    #[test]
    fn length_mismatch() {
        assert!(verify(&[0.; 2], &[0.; 2], &[0.; 3])
            .unwrap_err()
            .is::<LengthMismatch>());
    }
}
