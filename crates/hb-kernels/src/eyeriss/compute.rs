//! Processing element of the systolic array.

use super::geometry::Geometry;
use super::links::{required, TileLinks};
use crate::error::Result;
use hb_fabric::TileCoord;
use tracing::trace;

/// One filter row convolved over one input row per (image, filter) pair,
/// accumulated onto `psum`.
///
/// Layouts: `weights[f * wk + k]`, `input[i * win + x]`,
/// `psum[(i * filters + f) * wout + x]`. Taps are applied left to right with
/// fused multiply-add.
pub fn convolve(
    geo: &Geometry,
    images: usize,
    filters: usize,
    weights: &[f32],
    input: &[f32],
    psum: &mut [f32],
) {
    let (wk, win, wout) = (geo.filter_width, geo.input_width, geo.output_width);
    for i in 0..images {
        let row = &input[i * win..(i + 1) * win];
        for f in 0..filters {
            let taps = &weights[f * wk..(f + 1) * wk];
            let out = &mut psum[(i * filters + f) * wout..][..wout];
            for (x, acc) in out.iter_mut().enumerate() {
                *acc = taps
                    .iter()
                    .zip(&row[x..x + wk])
                    .fold(*acc, |sum, (&w, &v)| w.mul_add(v, sum));
            }
        }
    }
}

/// Compute-role main loop.
///
/// Per pass: take the filter rows, pass them down. Per burst: take the
/// input rows and pass them diagonally, take the incoming partial sums,
/// convolve, hand the result to the right.
pub(super) fn run(geo: &Geometry, coord: TileCoord, links: TileLinks<'_>) -> Result<()> {
    let TileLinks { filter_in, mut filter_out, input_in, mut input_out, psum_in, psum_out } =
        links;
    let mut filter_in = required(filter_in, coord, "filter input")?;
    let mut input_in = required(input_in, coord, "input input")?;
    let mut psum_in = required(psum_in, coord, "psum input")?;
    let mut psum_out = required(psum_out, coord, "psum output")?;

    let mut weights = vec![0.0; geo.filter_len(geo.filters_per_pass)];
    let mut input = vec![0.0; geo.input_len(geo.images_per_burst)];
    let mut psum = vec![0.0; geo.psum_len(geo.images_per_burst, geo.filters_per_pass)];

    for pass in geo.passes() {
        let nf = pass.len();
        let weights = &mut weights[..geo.filter_len(nf)];
        filter_in.wait_full()?;
        filter_in.read(0, weights)?;
        if let Some(tx) = filter_out.as_mut() {
            tx.produce(weights)?;
        }

        for burst in geo.bursts() {
            let ni = burst.len();
            let input = &mut input[..geo.input_len(ni)];
            let psum = &mut psum[..geo.psum_len(ni, nf)];

            input_in.wait_full()?;
            input_in.read(0, input)?;
            if let Some(tx) = input_out.as_mut() {
                tx.produce(input)?;
            }

            psum_in.wait_full()?;
            psum_in.read(0, psum)?;
            psum_out.reserve()?;

            convolve(geo, ni, nf, weights, input, psum);
            input_in.release();

            psum_out.write(0, psum)?;
            psum_out.commit();
            psum_in.release();
            trace!("Tile {} finished filters {:?} images {:?}", coord, pass, burst);
        }

        filter_in.release();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eyeriss::PsumMode;

    fn geometry(wk: usize, win: usize) -> Geometry {
        Geometry {
            images: 1,
            filters: 2,
            filter_rows: 1,
            filter_width: wk,
            input_width: win,
            output_width: win - wk + 1,
            output_rows: 1,
            filters_per_pass: 2,
            images_per_burst: 1,
            psum_mode: PsumMode::Fresh,
        }
    }

    #[test]
    fn sliding_window_per_filter() {
        let geo = geometry(3, 5);
        let weights = [1.0, 0.0, -1.0, 0.5, 0.5, 0.5];
        let input = [1.0, 2.0, 4.0, 8.0, 16.0];
        let mut psum = [10.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        convolve(&geo, 1, 2, &weights, &input, &mut psum);
        assert_eq!(psum, [10.0 - 3.0, -6.0, -12.0, 3.5, 7.0, 14.0]);
    }

    #[test]
    fn two_images_share_weights() {
        let geo = geometry(1, 2);
        let weights = [2.0, 3.0];
        let input = [1.0, 2.0, 10.0, 20.0];
        let mut psum = [0.0; 8];
        convolve(&geo, 2, 2, &weights, &input, &mut psum);
        assert_eq!(psum, [2.0, 4.0, 3.0, 6.0, 20.0, 40.0, 30.0, 60.0]);
    }
}
