//! Problem size and inputs.

/// Length of every vector.
pub const N: usize = 1_048_576;

/// Work-items per work-group for device dispatches.
pub const THREADS_PER_GROUP: u32 = 256;

/// Element `i` of the first input.
#[inline]
pub fn a(i: usize) -> f32 {
    i as f32 * 0.5
}

/// Element `i` of the second input.
#[inline]
pub fn b(i: usize) -> f32 {
    i as f32 * 2.0
}

/// The sum expected at `i`, computed the same way the kernels compute it.
#[inline]
pub fn sum(i: usize) -> f32 {
    a(i) + b(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        assert_eq!(sum(0), 0.0);
        assert_eq!(sum(N - 1), (N - 1) as f32 * 2.5);
        assert_eq!(sum(N - 1), 2_621_437.5);
    }

    #[test]
    fn sum_is_exact_below_n() {
        for i in (0..N).step_by(4093).chain([1, 2, 3, N - 2]) {
            assert_eq!(sum(i), i as f32 * 2.5, "i = {i}");
        }
    }

    #[test]
    fn group_size_divides_n() {
        assert_eq!(N % THREADS_PER_GROUP as usize, 0);
    }
}
