//! DMA roles at the edges of the array: the three feeders and write-back.
//!
//! Each feeder streams one row of its tensor, selected by the appendix
//! byte, for every step of the schedule. Write-back is the mirror image.

use super::geometry::Geometry;
use super::links::{required, TileLinks};
use super::{ConvTensors, PsumMode};
use crate::error::{KernelError, Result};
use crate::tensor::Tensor;
use hb_fabric::TileCoord;
use tracing::trace;

fn offset(t: &Tensor<f32>, index: [usize; 4]) -> Result<usize> {
    t.offset_of(&index)
        .ok_or_else(|| KernelError::config(format!("index {index:?} outside tensor {:?}", t.shape())))
}

/// Filter row `row` of every filter in the pass, two tiles down.
pub(super) fn filter_feed(
    geo: &Geometry,
    tensors: &ConvTensors<'_>,
    coord: TileCoord,
    row: usize,
    links: TileLinks<'_>,
) -> Result<()> {
    let mut tx = required(links.filter_out, coord, "filter output")?;
    let wk = geo.filter_width;
    let mut buf = vec![0.0; geo.filter_len(geo.filters_per_pass)];
    for pass in geo.passes() {
        let len = geo.filter_len(pass.len());
        for (slot, f) in pass.clone().enumerate() {
            let base = offset(tensors.filter, [f, 0, row, 0])?;
            let stride = tensors.filter.stride(3);
            for (k, w) in buf[slot * wk..(slot + 1) * wk].iter_mut().enumerate() {
                *w = tensors.filter.read(base + k * stride);
            }
        }
        tx.produce(&buf[..len])?;
        trace!("Tile {} fed filter row {} for filters {:?}", coord, row, pass);
    }
    Ok(())
}

/// Input row `row` of every image in the burst, to the diagonal neighbour.
pub(super) fn input_feed(
    geo: &Geometry,
    tensors: &ConvTensors<'_>,
    coord: TileCoord,
    row: usize,
    links: TileLinks<'_>,
) -> Result<()> {
    let mut tx = required(links.input_out, coord, "input output")?;
    let win = geo.input_width;
    let stride = tensors.imap.stride(3);
    let mut buf = vec![0.0; geo.input_len(geo.images_per_burst)];
    for _pass in geo.passes() {
        for burst in geo.bursts() {
            let len = geo.input_len(burst.len());
            for (slot, n) in burst.clone().enumerate() {
                let base = offset(tensors.imap, [n, 0, row, 0])?;
                for (x, v) in buf[slot * win..(slot + 1) * win].iter_mut().enumerate() {
                    *v = tensors.imap.read(base + x * stride);
                }
            }
            tx.produce(&buf[..len])?;
            trace!("Tile {} fed input row {} for images {:?}", coord, row, burst);
        }
    }
    Ok(())
}

/// Starting partial sums for output row `row`, two tiles right.
pub(super) fn psum_feed(
    geo: &Geometry,
    tensors: &ConvTensors<'_>,
    coord: TileCoord,
    row: usize,
    links: TileLinks<'_>,
) -> Result<()> {
    let mut tx = required(links.psum_out, coord, "psum output")?;
    let wout = geo.output_width;
    let stride = tensors.omap.stride(3);
    let mut buf = vec![0.0; geo.psum_len(geo.images_per_burst, geo.filters_per_pass)];
    for pass in geo.passes() {
        let nf = pass.len();
        for burst in geo.bursts() {
            let len = geo.psum_len(burst.len(), nf);
            match geo.psum_mode {
                PsumMode::Fresh => buf[..len].fill(0.0),
                PsumMode::Accumulate => {
                    for (i, n) in burst.clone().enumerate() {
                        for (fi, f) in pass.clone().enumerate() {
                            let base = offset(tensors.omap, [n, f, row, 0])?;
                            let out = &mut buf[(i * nf + fi) * wout..][..wout];
                            for (x, v) in out.iter_mut().enumerate() {
                                *v = tensors.omap.read(base + x * stride);
                            }
                        }
                    }
                }
            }
            tx.produce(&buf[..len])?;
        }
    }
    Ok(())
}

/// Drain finished partial sums of output row `row` into the output tensor.
pub(super) fn write_back(
    geo: &Geometry,
    tensors: &ConvTensors<'_>,
    coord: TileCoord,
    row: usize,
    links: TileLinks<'_>,
) -> Result<()> {
    let mut rx = required(links.psum_in, coord, "psum input")?;
    let wout = geo.output_width;
    let stride = tensors.omap.stride(3);
    let mut buf = vec![0.0; geo.psum_len(geo.images_per_burst, geo.filters_per_pass)];
    for pass in geo.passes() {
        let nf = pass.len();
        for burst in geo.bursts() {
            let len = geo.psum_len(burst.len(), nf);
            rx.wait_full()?;
            rx.read(0, &mut buf[..len])?;
            for (i, n) in burst.clone().enumerate() {
                for (fi, f) in pass.clone().enumerate() {
                    let base = offset(tensors.omap, [n, f, row, 0])?;
                    for (x, v) in buf[(i * nf + fi) * wout..][..wout].iter().enumerate() {
                        tensors.omap.write(base + x * stride, *v);
                    }
                }
            }
            rx.release();
            trace!("Tile {} wrote output row {} for images {:?}", coord, row, burst);
        }
    }
    Ok(())
}
