//! Blocked matrix multiply: `result = mat1 × mat2`.
//!
//! The result is cut into `BLOCK_DIM × BLOCK_DIM` blocks. Tile `(r, c)` owns
//! block rows `r, r + rows, …` and block columns `c, c + cols, …`, and
//! computes each owned block alone: operand blocks are copied into scratch
//! (zero-padded at the matrix edges), multiplied into a scratch result, and
//! the valid part is written back. No two tiles write the same element.

use crate::error::{KernelError, Result};
use crate::fabric::BufferSizes;
use crate::group::{TileContext, TileGroup};
use crate::tensor::Tensor;
use tracing::info;

/// Edge length of a scratch block.
pub const BLOCK_DIM: usize = 16;

const BLOCK_LEN: usize = BLOCK_DIM * BLOCK_DIM;

/// Matrix view: rows, columns and strides of a 2-D tensor.
#[derive(Debug, Clone, Copy)]
struct Matrix<'a> {
    t: &'a Tensor<f32>,
    rows: usize,
    cols: usize,
}

impl<'a> Matrix<'a> {
    fn new(name: &str, t: &'a Tensor<f32>) -> Result<Self> {
        if t.ndim() != 2 {
            return Err(KernelError::config(format!(
                "{name} must be 2-dimensional, got shape {:?}",
                t.shape()
            )));
        }
        Ok(Self { t, rows: t.dim(0), cols: t.dim(1) })
    }

    fn offset(&self, i: usize, j: usize) -> usize {
        i * self.t.stride(0) + j * self.t.stride(1)
    }

    fn blocks(extent: usize) -> usize {
        extent.div_ceil(BLOCK_DIM)
    }

    /// Copy block `(br, bc)` into `out`, zero-filling past the edges.
    fn load(&self, br: usize, bc: usize, out: &mut [f32; BLOCK_LEN]) {
        out.fill(0.0);
        let (i0, j0) = (br * BLOCK_DIM, bc * BLOCK_DIM);
        for i in 0..BLOCK_DIM.min(self.rows.saturating_sub(i0)) {
            for j in 0..BLOCK_DIM.min(self.cols.saturating_sub(j0)) {
                out[i * BLOCK_DIM + j] = self.t.read(self.offset(i0 + i, j0 + j));
            }
        }
    }

    /// Write the valid part of `block` to block `(br, bc)`.
    fn store(&self, br: usize, bc: usize, block: &[f32; BLOCK_LEN]) {
        let (i0, j0) = (br * BLOCK_DIM, bc * BLOCK_DIM);
        for i in 0..BLOCK_DIM.min(self.rows.saturating_sub(i0)) {
            for j in 0..BLOCK_DIM.min(self.cols.saturating_sub(j0)) {
                self.t.write(self.offset(i0 + i, j0 + j), block[i * BLOCK_DIM + j]);
            }
        }
    }
}

fn accumulate(result: &mut [f32; BLOCK_LEN], a: &[f32; BLOCK_LEN], b: &[f32; BLOCK_LEN]) {
    for i in 0..BLOCK_DIM {
        for k in 0..BLOCK_DIM {
            let aik = a[i * BLOCK_DIM + k];
            for j in 0..BLOCK_DIM {
                let r = &mut result[i * BLOCK_DIM + j];
                *r = aik.mul_add(b[k * BLOCK_DIM + j], *r);
            }
        }
    }
}

/// Operands of one multiply, validated.
#[derive(Debug, Clone, Copy)]
pub struct MatMul<'a> {
    result: Matrix<'a>,
    mat1: Matrix<'a>,
    mat2: Matrix<'a>,
}

impl<'a> MatMul<'a> {
    /// Check shapes: `mat1 [m, k]`, `mat2 [k, n]`, `result [m, n]`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Config`] on any shape mismatch.
    pub fn new(result: &'a Tensor<f32>, mat1: &'a Tensor<f32>, mat2: &'a Tensor<f32>) -> Result<Self> {
        let result = Matrix::new("result", result)?;
        let mat1 = Matrix::new("mat1", mat1)?;
        let mat2 = Matrix::new("mat2", mat2)?;
        if mat1.cols != mat2.rows {
            return Err(KernelError::config(format!(
                "mat1 has {} columns but mat2 has {} rows",
                mat1.cols, mat2.rows
            )));
        }
        if result.rows != mat1.rows || result.cols != mat2.cols {
            return Err(KernelError::config(format!(
                "result is {}x{}, expected {}x{}",
                result.rows, result.cols, mat1.rows, mat2.cols
            )));
        }
        Ok(Self { result, mat1, mat2 })
    }
}

/// Per-tile body of the blocked multiply.
///
/// # Errors
///
/// Returns [`KernelError::Aborted`] if another tile fails.
pub fn run_tile(ctx: &TileContext<'_>, op: &MatMul<'_>) -> Result<()> {
    let dims = ctx.dims();
    let me = ctx.coord();
    let block_rows = Matrix::blocks(op.mat1.rows);
    let block_cols = Matrix::blocks(op.mat2.cols);
    let block_mid = Matrix::blocks(op.mat2.rows);

    let mut a = [0.0; BLOCK_LEN];
    let mut b = [0.0; BLOCK_LEN];
    let mut acc = [0.0; BLOCK_LEN];
    for rr in (usize::from(me.row)..block_rows).step_by(usize::from(dims.rows)) {
        for rc in (usize::from(me.col)..block_cols).step_by(usize::from(dims.cols)) {
            acc.fill(0.0);
            for mid in 0..block_mid {
                op.mat1.load(rr, mid, &mut a);
                op.mat2.load(mid, rc, &mut b);
                accumulate(&mut acc, &a, &b);
            }
            op.result.store(rr, rc, &acc);
        }
    }

    ctx.barrier()
}

/// `result = mat1 × mat2` on `group`.
///
/// # Errors
///
/// Returns a configuration error before launch, or the first tile error.
pub fn mm(group: &TileGroup, result: &Tensor<f32>, mat1: &Tensor<f32>, mat2: &Tensor<f32>) -> Result<()> {
    let op = MatMul::new(result, mat1, mat2)?;
    info!(
        "mm: {}x{} by {}x{} in {}-element blocks",
        op.mat1.rows, op.mat1.cols, op.mat2.rows, op.mat2.cols, BLOCK_DIM
    );
    group.launch(BufferSizes::NONE, |ctx| run_tile(ctx, &op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LaunchConfig;
    use crate::reference::matmul as naive;
    use hb_fabric::GroupDims;

    fn matrix(rows: usize, cols: usize, seed: usize) -> Tensor<f32> {
        let data = (0..rows * cols).map(|v| ((v * 7 + seed) % 11) as f32 - 5.0).collect();
        Tensor::from_vec(&[rows, cols], data).unwrap()
    }

    #[test]
    fn ragged_shapes_match_naive() {
        let group = TileGroup::new(LaunchConfig::new(GroupDims::new(2, 3)));
        for (m, k, n) in [(1, 1, 1), (17, 5, 33), (40, 19, 3), (16, 16, 16)] {
            let a = matrix(m, k, 1);
            let b = matrix(k, n, 4);
            let out = Tensor::zeros(&[m, n]);
            mm(&group, &out, &a, &b).unwrap();
            assert_eq!(out.to_vec(), naive(&a, &b), "{m}x{k}x{n}");
        }
    }

    #[test]
    fn transposed_operand() {
        // mat2 stored as its transpose
        let group = TileGroup::new(LaunchConfig::new(GroupDims::new(1, 2)));
        let a = matrix(3, 4, 2);
        let bt = matrix(5, 4, 3).to_vec();
        let b = Tensor::with_strides(&[4, 5], &[1, 4], bt).unwrap();
        let out = Tensor::zeros(&[3, 5]);
        mm(&group, &out, &a, &b).unwrap();
        assert_eq!(out.to_vec(), naive(&a, &b));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let group = TileGroup::new(LaunchConfig::new(GroupDims::new(1, 1)));
        let a = matrix(2, 3, 0);
        let b = matrix(4, 2, 0);
        let out = Tensor::zeros(&[2, 2]);
        assert!(matches!(mm(&group, &out, &a, &b), Err(KernelError::Config { .. })));
        let wrong = Tensor::zeros(&[3, 2]);
        assert!(mm(&group, &wrong, &a, &matrix(3, 2, 0)).is_err());
    }
}
