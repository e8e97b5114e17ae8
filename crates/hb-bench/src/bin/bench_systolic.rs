//! Systolic convolution benchmark.
//!
//! Runs every built-in Eyeriss variant over a sweep of batch sizes and
//! pass/burst settings, checks each result bit-for-bit against a direct
//! convolution, and reports throughput in output elements per second.
//!
//! Small passes and bursts mean more handshakes per output; large ones
//! mean bigger scratchpad buffers per tile.

use anyhow::{bail, Result};
use hb_fabric::EyerissVariant;
use hb_kernels::reference::{self, OperandRng};
use hb_kernels::{eyeriss, EyerissConfig, LaunchConfig, TileGroup};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const ITERATIONS: usize = 5;
const WIDTH: usize = 32;
const TAPS: usize = 5;
const FILTERS: usize = 6;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    println!("Systolic convolution benchmark");
    println!("==============================");
    println!("{FILTERS} filters of width {TAPS} over rows of {WIDTH}, {ITERATIONS} iterations each");
    println!();
    println!(
        "  {:<22}  {:>6}  {:>6}  {:>6}  {:>10}  {:>12}",
        "variant", "images", "f/pass", "n/bur", "ms/call", "Mout/s"
    );
    println!("  {:-<22}  {:-<6}  {:-<6}  {:-<6}  {:-<10}  {:-<12}", "", "", "", "", "", "");

    let mut rng = OperandRng::new(7);
    for variant in EyerissVariant::ALL {
        let group = TileGroup::new(LaunchConfig::new(variant.map.dims));
        let wout = WIDTH - TAPS + 1;
        for &images in &[1usize, 8] {
            let imap = rng.tensor(&[images, 1, variant.input_rows(), WIDTH]);
            let filter = rng.tensor(&[FILTERS, 1, variant.filter_rows, TAPS]);
            let omap = rng.tensor(&[images, FILTERS, variant.output_rows, wout]);
            let expected = reference::conv2d(&omap, &imap, &filter, variant.output_rows, false);

            for &(filters_per_pass, images_per_burst) in &[(1usize, 1usize), (3, 2), (FILTERS, images)] {
                let config = EyerissConfig { filters_per_pass, images_per_burst, ..EyerissConfig::new(variant) };
                let t0 = Instant::now();
                for _ in 0..ITERATIONS {
                    eyeriss(&group, &config, &omap, &imap, &filter, &[0, 0], &[1, 1])?;
                }
                let secs = t0.elapsed().as_secs_f64() / ITERATIONS as f64;
                if omap.to_vec() != expected {
                    bail!("{} diverged from the direct convolution", variant.name());
                }
                let outputs = (images * FILTERS * variant.output_rows * wout) as f64;
                println!(
                    "  {:<22}  {:>6}  {:>6}  {:>6}  {:>10.3}  {:>12.2}",
                    variant.name(),
                    images,
                    filters_per_pass,
                    images_per_burst,
                    secs * 1e3,
                    outputs / secs / 1e6
                );
            }
        }
    }

    println!();
    println!("Every run matched the direct convolution bit-for-bit.");
    Ok(())
}
