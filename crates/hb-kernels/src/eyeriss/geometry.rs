//! Convolution geometry shared by every role.
//!
//! All tiles derive the same pass and burst schedule from the same
//! [`Geometry`], so producers and consumers agree on how many transfers
//! happen and how large each one is without exchanging any metadata.

use super::{EyerissConfig, PsumMode};
use crate::error::{KernelError, Result};
use crate::fabric::BufferSizes;
use crate::tensor::Tensor;
use std::ops::Range;

/// Tensor and array dimensions of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Images in the batch (N).
    pub images: usize,
    /// Output channels / filters (Cout).
    pub filters: usize,
    /// Filter height (Hk), one compute column per filter row.
    pub filter_rows: usize,
    /// Filter width (Wk).
    pub filter_width: usize,
    /// Input row width (Win).
    pub input_width: usize,
    /// Output row width (`Win - Wk + 1`).
    pub output_width: usize,
    /// Output rows computed by the array.
    pub output_rows: usize,
    /// Filters carried by one pass.
    pub filters_per_pass: usize,
    /// Images carried by one burst.
    pub images_per_burst: usize,
    /// Where partial sums start from.
    pub psum_mode: PsumMode,
}

impl Geometry {
    /// Validate tensor shapes and convolution parameters against the
    /// variant and derive the geometry.
    ///
    /// Shapes are `omap [N, Cout, Hout, Wout]`, `imap [N, 1, Hin, Win]`,
    /// `filter [Cout, 1, Hk, Wk]`. Only unit stride and zero padding are
    /// supported.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Config`] describing the first mismatch.
    pub fn new(
        config: &EyerissConfig,
        omap: &Tensor<f32>,
        imap: &Tensor<f32>,
        filter: &Tensor<f32>,
        padding: &[i64],
        strides: &[i64],
    ) -> Result<Self> {
        let variant = config.variant;
        if config.filters_per_pass == 0 || config.images_per_burst == 0 {
            return Err(KernelError::config("filters per pass and images per burst must be positive"));
        }
        if padding.iter().any(|&p| p != 0) {
            return Err(KernelError::config(format!("padding {padding:?} is not supported")));
        }
        if strides.iter().any(|&s| s != 1) {
            return Err(KernelError::config(format!("strides {strides:?} are not supported")));
        }
        for (name, t) in [("omap", omap), ("imap", imap), ("filter", filter)] {
            if t.ndim() != 4 {
                return Err(KernelError::config(format!(
                    "{name} must be 4-dimensional, got shape {:?}",
                    t.shape()
                )));
            }
        }

        let [n, cout, hout, wout] = dims4(omap);
        let [n_in, cin, hin, win] = dims4(imap);
        let [cout_f, cin_f, hk, wk] = dims4(filter);

        if cin != 1 || cin_f != 1 {
            return Err(KernelError::config(format!(
                "only single-channel input is supported (imap C={cin}, filter C={cin_f})"
            )));
        }
        if n != n_in {
            return Err(KernelError::config(format!("omap has {n} images, imap has {n_in}")));
        }
        if cout != cout_f {
            return Err(KernelError::config(format!(
                "omap has {cout} channels, filter has {cout_f}"
            )));
        }
        if hk != variant.filter_rows {
            return Err(KernelError::config(format!(
                "{} expects {}-row filters, got {hk}",
                variant.name(),
                variant.filter_rows
            )));
        }
        if wk == 0 || win < wk || wout != win - wk + 1 {
            return Err(KernelError::config(format!(
                "output width {wout} does not match input width {win} and filter width {wk}"
            )));
        }
        if hout < variant.output_rows {
            return Err(KernelError::config(format!(
                "{} produces {} output rows, omap has only {hout}",
                variant.name(),
                variant.output_rows
            )));
        }
        if hin < variant.input_rows() {
            return Err(KernelError::config(format!(
                "{} reads {} input rows, imap has only {hin}",
                variant.name(),
                variant.input_rows()
            )));
        }
        Ok(Self {
            images: n,
            filters: cout,
            filter_rows: hk,
            filter_width: wk,
            input_width: win,
            output_width: wout,
            output_rows: variant.output_rows,
            filters_per_pass: config.filters_per_pass,
            images_per_burst: config.images_per_burst,
            psum_mode: config.psum_mode,
        })
    }

    /// Filter ranges, one per pass; the last one may be short.
    pub fn passes(&self) -> impl Iterator<Item = Range<usize>> {
        chunks(self.filters, self.filters_per_pass)
    }

    /// Image ranges, one per burst; the last one may be short.
    pub fn bursts(&self) -> impl Iterator<Item = Range<usize>> {
        chunks(self.images, self.images_per_burst)
    }

    /// Elements of a filter transfer carrying `filters` filter rows.
    pub const fn filter_len(&self, filters: usize) -> usize {
        filters * self.filter_width
    }

    /// Elements of an input transfer carrying `images` input rows.
    pub const fn input_len(&self, images: usize) -> usize {
        images * self.input_width
    }

    /// Elements of a psum transfer for `images` × `filters` output rows.
    pub const fn psum_len(&self, images: usize, filters: usize) -> usize {
        images * filters * self.output_width
    }

    /// Per-tile scratchpad buffers sized for one full step.
    pub const fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes {
            filter: self.filter_len(self.filters_per_pass),
            input: self.input_len(self.images_per_burst),
            psum: self.psum_len(self.images_per_burst, self.filters_per_pass),
        }
    }

    /// Number of (pass, burst) steps.
    pub fn steps(&self) -> usize {
        self.passes().count() * self.bursts().count()
    }
}

fn dims4(t: &Tensor<f32>) -> [usize; 4] {
    [t.dim(0), t.dim(1), t.dim(2), t.dim(3)]
}

fn chunks(total: usize, size: usize) -> impl Iterator<Item = Range<usize>> {
    (0..total).step_by(size.max(1)).map(move |start| start..(start + size).min(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_fabric::EyerissVariant;

    fn config(variant: EyerissVariant) -> EyerissConfig {
        EyerissConfig::new(variant)
    }

    fn tensors(n: usize, cout: usize, h: usize, w: usize, hk: usize, wk: usize) -> [Tensor<f32>; 3] {
        [
            Tensor::zeros(&[n, cout, h - hk + 1, w - wk + 1]),
            Tensor::zeros(&[n, 1, h, w]),
            Tensor::zeros(&[cout, 1, hk, wk]),
        ]
    }

    #[test]
    fn single_pe_geometry() {
        let [o, i, f] = tensors(1, 3, 1, 8, 1, 5);
        let g = Geometry::new(&config(EyerissVariant::EYERISS_1X1), &o, &i, &f, &[0, 0], &[1, 1])
            .unwrap();
        assert_eq!(g.output_width, 4);
        assert_eq!(g.passes().collect::<Vec<_>>(), vec![0..3]);
        assert_eq!(g.bursts().collect::<Vec<_>>(), vec![0..1]);
        assert_eq!(g.buffer_sizes(), BufferSizes { filter: 15, input: 16, psum: 24 });
        assert_eq!(g.steps(), 1);
    }

    #[test]
    fn partial_passes_and_bursts() {
        let [o, i, f] = tensors(5, 7, 5, 6, 3, 3);
        let g = Geometry::new(&config(EyerissVariant::EYERISS_3X3), &o, &i, &f, &[], &[])
            .unwrap();
        assert_eq!(g.passes().collect::<Vec<_>>(), vec![0..3, 3..6, 6..7]);
        assert_eq!(g.bursts().collect::<Vec<_>>(), vec![0..2, 2..4, 4..5]);
        assert_eq!(g.psum_len(1, 1), 4);
        assert_eq!(g.steps(), 9);
    }

    #[test]
    fn rejects_padding_and_stride() {
        let [o, i, f] = tensors(1, 1, 1, 8, 1, 5);
        let c = config(EyerissVariant::EYERISS_1X1);
        assert!(Geometry::new(&c, &o, &i, &f, &[1, 0], &[1, 1]).is_err());
        assert!(Geometry::new(&c, &o, &i, &f, &[0, 0], &[2, 1]).is_err());
    }

    #[test]
    fn rejects_wrong_filter_height() {
        let [o, i, f] = tensors(1, 1, 5, 8, 3, 5);
        assert!(Geometry::new(&config(EyerissVariant::EYERISS_1X1), &o, &i, &f, &[], &[]).is_err());
    }

    #[test]
    fn rejects_multi_channel_input() {
        let o = Tensor::zeros(&[1, 1, 1, 4]);
        let i = Tensor::zeros(&[1, 2, 1, 8]);
        let f = Tensor::zeros(&[1, 2, 1, 5]);
        let err = Geometry::new(&config(EyerissVariant::EYERISS_1X1), &o, &i, &f, &[], &[])
            .unwrap_err();
        assert!(err.to_string().contains("single-channel"));
    }

    #[test]
    fn rejects_short_output() {
        // 3x3 array needs three output rows
        let [o, i, f] = tensors(1, 1, 4, 8, 3, 3);
        assert!(Geometry::new(&config(EyerissVariant::EYERISS_3X3), &o, &i, &f, &[], &[]).is_err());
    }
}
