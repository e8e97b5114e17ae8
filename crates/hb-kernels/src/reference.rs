//! Single-threaded reference implementations and deterministic test data.
//!
//! Used by the CLI and benches to check kernel results, and by tests.

use crate::tensor::{contiguous_strides, Tensor};

// ── operands ─────────────────────────────────────────────────────────────────

/// Seeded source of kernel operands: dense tensors and scatter indices.
///
/// SplitMix64 underneath; a seed fixes every operand of a run.
#[derive(Debug, Clone)]
pub struct OperandRng {
    state: u64,
}

impl OperandRng {
    /// Generator for `seed`.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Value in `[-1, 1)` on a 2^-23 grid.
    #[allow(clippy::cast_precision_loss)]
    fn signed_unit(&mut self) -> f32 {
        let grid = (self.next_u64() >> 40) as f32;
        grid / 8_388_608.0 - 1.0
    }

    /// Integer in `0..n`; zero when `n` is zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn below(&mut self, n: usize) -> usize {
        ((u128::from(self.next_u64()) * n as u128) >> 64) as usize
    }

    /// Contiguous tensor filled with values in `[-1, 1)`.
    pub fn tensor(&mut self, shape: &[usize]) -> Tensor<f32> {
        let numel = shape.iter().product();
        let data = (0..numel).map(|_| self.signed_unit()).collect();
        Tensor::from_parts(shape.to_vec(), contiguous_strides(shape), data)
    }

    /// `count` destination rows drawn from `0..rows`, repeats allowed.
    ///
    /// `None` when `rows` does not fit an `i32` index.
    pub fn indices(&mut self, count: usize, rows: usize) -> Option<Vec<i32>> {
        i32::try_from(rows).ok()?;
        (0..count).map(|_| i32::try_from(self.below(rows)).ok()).collect()
    }
}

// ── references ───────────────────────────────────────────────────────────────

/// Direct sliding-window convolution of the first `output_rows` rows.
///
/// Shapes as for the systolic kernel. Each output starts from zero, or
/// from its current value when `accumulate` is set, and accumulates filter
/// rows from last to first, taps left to right, with fused multiply-add;
/// rows at and beyond `output_rows` keep their current value. Returns the
/// expected output in row-major order.
pub fn conv2d(
    omap: &Tensor<f32>,
    imap: &Tensor<f32>,
    filter: &Tensor<f32>,
    output_rows: usize,
    accumulate: bool,
) -> Vec<f32> {
    let [n, cout, hout, wout] = [omap.dim(0), omap.dim(1), omap.dim(2), omap.dim(3)];
    let [hk, wk] = [filter.dim(2), filter.dim(3)];
    let mut out = omap.to_vec();
    for img in 0..n {
        for f in 0..cout {
            for y in 0..hout.min(output_rows) {
                for x in 0..wout {
                    let at = ((img * cout + f) * hout + y) * wout + x;
                    let mut acc = if accumulate { out[at] } else { 0.0 };
                    for fr in (0..hk).rev() {
                        for k in 0..wk {
                            let w = filter.get(&[f, 0, fr, k]).unwrap_or(0.0);
                            let v = imap.get(&[img, 0, y + fr, x + k]).unwrap_or(0.0);
                            acc = w.mul_add(v, acc);
                        }
                    }
                    out[at] = acc;
                }
            }
        }
    }
    out
}

/// Serial `dst.index_add_(0, index, src)` for row-major 2-D operands.
///
/// Indices outside `0..dst_rows` are skipped. Returns the expected
/// destination.
pub fn index_add_rows(dst: &[f32], src: &[f32], indices: &[i32], row_len: usize) -> Vec<f32> {
    let mut out = dst.to_vec();
    let dst_rows = if row_len == 0 { 0 } else { dst.len() / row_len };
    for (j, &d) in indices.iter().enumerate() {
        let Some(d) = usize::try_from(d).ok().filter(|&d| d < dst_rows) else {
            continue;
        };
        for e in 0..row_len {
            out[d * row_len + e] += src[j * row_len + e];
        }
    }
    out
}

/// Naive `a × b` for 2-D tensors, row-major result.
pub fn matmul(a: &Tensor<f32>, b: &Tensor<f32>) -> Vec<f32> {
    let (m, k, n) = (a.dim(0), a.dim(1), b.dim(1));
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k)
                .map(|p| a.get(&[i, p]).unwrap_or(0.0) * b.get(&[p, j]).unwrap_or(0.0))
                .sum();
        }
    }
    out
}

/// Largest absolute difference between two equally long slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_operands() {
        let a = OperandRng::new(7).tensor(&[4, 5]);
        let b = OperandRng::new(7).tensor(&[4, 5]);
        assert_eq!(a.to_vec(), b.to_vec());
        assert_ne!(a.to_vec(), OperandRng::new(8).tensor(&[4, 5]).to_vec());
        assert!(a.to_vec().iter().all(|v| (-1.0..1.0).contains(v)));
        assert_eq!(a.strides(), &[5, 1]);
    }

    #[test]
    fn indices_stay_in_range() {
        let mut rng = OperandRng::new(3);
        let rows = rng.indices(200, 6).unwrap();
        assert_eq!(rows.len(), 200);
        assert!(rows.iter().all(|&r| (0..6).contains(&r)));
        // enough draws to hit every row and repeat some
        assert!((0..6).all(|r| rows.contains(&r)));
        assert_eq!(rng.indices(3, 1).unwrap(), vec![0, 0, 0]);
        assert_eq!(rng.below(0), 0);
        assert!(rng.indices(1, usize::MAX).is_none());
    }

    #[test]
    fn conv_of_known_rows() {
        // 1 image, 1 filter, 2x3 filter over 3x4 input -> 2x2 output
        let imap = Tensor::from_vec(&[1, 1, 3, 4], (0..12).map(|v| v as f32).collect()).unwrap();
        let filter = Tensor::from_vec(&[1, 1, 2, 3], vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        let omap = Tensor::from_vec(&[1, 1, 2, 2], vec![100.0; 4]).unwrap();
        // out[y][x] = in[y][x] + in[y+1][x+2]
        assert_eq!(conv2d(&omap, &imap, &filter, 2, false), vec![6.0, 8.0, 14.0, 16.0]);
        assert_eq!(conv2d(&omap, &imap, &filter, 1, true), vec![106.0, 108.0, 100.0, 100.0]);
    }

    #[test]
    fn serial_scatter() {
        let out = index_add_rows(&[0.0; 4], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 1, -3], 2);
        assert_eq!(out, vec![0.0, 0.0, 4.0, 6.0]);
    }
}
