//! Shared test helpers: deterministic input generation and naive reference
//! kernels to compare the pipelines against.

use crate::coord::GemmCoord;
use half::f16;

/// Deterministic xorshift generator so every test run sees the same inputs.
pub(crate) struct TestRng(u64);

impl TestRng {
    pub(crate) fn new(seed: u64) -> Self {
        TestRng(seed.wrapping_mul(0x9E3779B97F4A7C15) | 1)
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in [-0.5, 0.5).
    pub(crate) fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32 - 0.5
    }
}

pub(crate) fn random_f32(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = TestRng::new(seed);
    (0..len).map(|_| rng.next_f32()).collect()
}

pub(crate) fn random_f16(len: usize, seed: u64) -> Vec<f16> {
    let mut rng = TestRng::new(seed);
    (0..len).map(|_| f16::from_f32(rng.next_f32())).collect()
}

pub(crate) fn random_i8(len: usize, seed: u64) -> Vec<i8> {
    let mut rng = TestRng::new(seed);
    (0..len).map(|_| (rng.next_u64() >> 56) as i8).collect()
}

/// Row-major `a[m x k] * b[k x n]` with f32 accumulation.
pub(crate) fn naive_matmul(a: &[f16], b: &[f16], shape: GemmCoord) -> Vec<f32> {
    let (m, n, k) = (shape.m() as usize, shape.n() as usize, shape.k() as usize);
    assert_eq!(a.len(), m * k, "operand A length mismatch");
    assert_eq!(b.len(), k * n, "operand B length mismatch");
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p].to_f32() * b[p * n + j].to_f32();
            }
            out[i * n + j] = acc;
        }
    }
    out
}

/// Row softmax of `scale * s`, in place per row.
pub(crate) fn naive_softmax_rows(s: &mut [f32], rows: usize, cols: usize, scale: f32) {
    for r in 0..rows {
        let row = &mut s[r * cols..(r + 1) * cols];
        let max = row
            .iter()
            .map(|v| v * scale)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v * scale - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

pub(crate) fn assert_close(got: &[f32], expect: &[f32], tol: f32) {
    assert_eq!(got.len(), expect.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expect.iter()).enumerate() {
        assert!(
            (g - e).abs() <= tol,
            "mismatch at {}: got {}, expect {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_is_deterministic() {
        let a = random_f32(8, 7);
        let b = random_f32(8, 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (-0.5..0.5).contains(v)));
    }

    #[test]
    fn test_softmax_rows_normalize() {
        let mut s = random_f32(12, 3);
        naive_softmax_rows(&mut s, 3, 4, 0.7);
        for r in 0..3 {
            let sum: f32 = s[r * 4..(r + 1) * 4].iter().sum();
            approx::assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
        }
    }
}
