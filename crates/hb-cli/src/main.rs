//! `hb`: command-line front end for the tile-group kernels.
//!
//! ```text
//! USAGE:
//!   hb roles [variant]           Print systolic role maps
//!   hb kernels                   List registered kernels and signatures
//!   hb eyeriss <variant>         Run a convolution on random data and verify it
//!   hb index-add                 Run a scatter-accumulate and verify it
//!   hb mm                        Run a blocked matmul and verify it
//! ```
//!
//! Set `RUST_LOG=hb_kernels=debug` to see per-launch detail.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hb_fabric::{EyerissVariant, GroupDims, Role};
use hb_kernels::reference::{self, OperandRng};
use hb_kernels::{
    EyerissConfig, IndexAddConfig, KernelArg, LaunchConfig, PsumMode, Registry, ScatterStrategy,
    Tensor, TileGroup, WaitPolicy,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hb", about = "Manycore tile-group kernel runner", version)]
struct Cli {
    /// Give up on a channel wait after this many polls (default: wait forever).
    #[arg(long, global = true)]
    max_polls: Option<u64>,

    /// Seed for generated operands.
    #[arg(long, global = true, default_value_t = 0x5eed)]
    seed: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the role map of one variant, or all of them.
    Roles {
        /// Variant name (e.g. eyeriss-3x3).
        variant: Option<String>,
    },
    /// List registered kernels.
    Kernels,
    /// Run the systolic convolution and compare with a direct convolution.
    Eyeriss {
        /// Variant name (e.g. eyeriss-5x6x2-lenet).
        variant: String,
        /// Images in the batch.
        #[arg(long, default_value_t = 4)]
        images: usize,
        /// Output channels.
        #[arg(long, default_value_t = 6)]
        filters: usize,
        /// Input row width.
        #[arg(long, default_value_t = 32)]
        width: usize,
        /// Filter row width.
        #[arg(long, default_value_t = 5)]
        taps: usize,
        /// Add onto the existing output instead of overwriting it.
        #[arg(long)]
        accumulate: bool,
    },
    /// Run index_add along dim 0 of a 2-D destination.
    IndexAdd {
        /// Collision resolver.
        #[arg(long, value_enum, default_value_t = StrategyArg::Rounds)]
        strategy: StrategyArg,
        /// Lock buckets for the locked resolver.
        #[arg(long, default_value_t = hb_kernels::index_add::DEFAULT_LOCK_BUCKETS)]
        buckets: usize,
        /// Destination rows.
        #[arg(long, default_value_t = 64)]
        rows: usize,
        /// Source rows (= index values).
        #[arg(long, default_value_t = 256)]
        indices: usize,
        /// Elements per row.
        #[arg(long, default_value_t = 32)]
        slice: usize,
        /// Group shape as ROWSxCOLS.
        #[arg(long, default_value = "4x4", value_parser = parse_dims)]
        group: GroupDims,
    },
    /// Run result = mat1 × mat2.
    Mm {
        #[arg(long, default_value_t = 64)]
        m: usize,
        #[arg(long, default_value_t = 48)]
        k: usize,
        #[arg(long, default_value_t = 80)]
        n: usize,
        /// Group shape as ROWSxCOLS.
        #[arg(long, default_value = "4x4", value_parser = parse_dims)]
        group: GroupDims,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Rounds,
    Locked,
    Atomic,
}

fn parse_dims(s: &str) -> Result<GroupDims, String> {
    let (r, c) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected ROWSxCOLS, got '{s}'"))?;
    let rows: u8 = r.trim().parse().map_err(|e| format!("bad row count '{r}': {e}"))?;
    let cols: u8 = c.trim().parse().map_err(|e| format!("bad column count '{c}': {e}"))?;
    if rows == 0 || cols == 0 {
        return Err(format!("group {s} has no tiles"));
    }
    Ok(GroupDims::new(rows, cols))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let wait = cli.max_polls.map_or(WaitPolicy::Forever, WaitPolicy::Bounded);
    let mut rng = OperandRng::new(cli.seed);

    match cli.command {
        Cmd::Roles { variant } => cmd_roles(variant.as_deref())?,
        Cmd::Kernels => cmd_kernels(),
        Cmd::Eyeriss { variant, images, filters, width, taps, accumulate } => {
            let shape = ConvShape { images, filters, width, taps };
            cmd_eyeriss(&variant, shape, accumulate, wait, &mut rng)?;
        }
        Cmd::IndexAdd { strategy, buckets, rows, indices, slice, group } => {
            let strategy = match strategy {
                StrategyArg::Rounds => ScatterStrategy::Rounds,
                StrategyArg::Locked => ScatterStrategy::Locked { buckets },
                StrategyArg::Atomic => ScatterStrategy::Atomic,
            };
            let group = TileGroup::new(LaunchConfig::new(group).with_wait(wait));
            cmd_index_add(&group, strategy, rows, indices, slice, &mut rng)?;
        }
        Cmd::Mm { m, k, n, group } => {
            let group = TileGroup::new(LaunchConfig::new(group).with_wait(wait));
            cmd_mm(&group, m, k, n, &mut rng)?;
        }
    }

    Ok(())
}

fn variant(name: &str) -> Result<EyerissVariant> {
    EyerissVariant::by_name(name).with_context(|| {
        let known: Vec<_> = EyerissVariant::ALL.iter().map(EyerissVariant::name).collect();
        format!("unknown variant '{name}' (known: {})", known.join(", "))
    })
}

fn cmd_roles(name: Option<&str>) -> Result<()> {
    let variants = match name {
        Some(n) => vec![variant(n)?],
        None => EyerissVariant::ALL.to_vec(),
    };
    for v in variants {
        v.map.validate()?;
        println!(
            "{}  {} group, {}-row filters, {} output rows",
            v.name(),
            v.map.dims,
            v.filter_rows,
            v.output_rows
        );
        print!("{}", v.map.render());
        let counts: Vec<String> = Role::ALL
            .iter()
            .filter(|&&r| r != Role::Idle)
            .map(|&r| format!("{} {}={}", r.glyph(), r, v.map.count(r)))
            .collect();
        println!("  {}", counts.join("  "));
        println!();
    }
    Ok(())
}

fn cmd_kernels() {
    let reg = Registry::builtin();
    println!("{:<22} signature", "kernel");
    println!("{}", "-".repeat(60));
    for entry in reg.entries() {
        let kinds: Vec<String> = entry.signature.iter().map(ToString::to_string).collect();
        println!("{:<22} ({})", entry.name, kinds.join(", "));
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvShape {
    images: usize,
    filters: usize,
    width: usize,
    taps: usize,
}

fn cmd_eyeriss(
    name: &str,
    shape: ConvShape,
    accumulate: bool,
    wait: WaitPolicy,
    rng: &mut OperandRng,
) -> Result<()> {
    let v = variant(name)?;
    if shape.taps == 0 || shape.taps > shape.width {
        bail!("filter width {} does not fit input width {}", shape.taps, shape.width);
    }
    let wout = shape.width - shape.taps + 1;
    let imap = rng.tensor(&[shape.images, 1, v.input_rows(), shape.width]);
    let filter = rng.tensor(&[shape.filters, 1, v.filter_rows, shape.taps]);
    let omap = rng.tensor(&[shape.images, shape.filters, v.output_rows, wout]);
    let expected = reference::conv2d(&omap, &imap, &filter, v.output_rows, accumulate);

    let group = TileGroup::new(LaunchConfig::new(v.map.dims).with_wait(wait));
    let mode = if accumulate { PsumMode::Accumulate } else { PsumMode::Fresh };
    let config = EyerissConfig::new(v).with_psum_mode(mode);

    let t0 = Instant::now();
    hb_kernels::eyeriss(&group, &config, &omap, &imap, &filter, &[0, 0], &[1, 1])?;
    let elapsed = t0.elapsed();

    let got = omap.to_vec();
    let diff = reference::max_abs_diff(&got, &expected);
    println!("Variant      : {}", v.name());
    println!("Group        : {} ({} tiles)", v.map.dims, v.map.dims.tile_count());
    println!(
        "Input        : {}×1×{}×{}   filters {}×1×{}×{}",
        shape.images,
        v.input_rows(),
        shape.width,
        shape.filters,
        v.filter_rows,
        shape.taps
    );
    println!("Output       : {}×{}×{}×{}", shape.images, shape.filters, v.output_rows, wout);
    println!("Psum mode    : {mode:?}");
    println!("Elapsed      : {:.3} ms", elapsed.as_secs_f64() * 1e3);
    println!("Max |error|  : {diff:e}");
    if got != expected {
        bail!("systolic output differs from the direct convolution (max error {diff:e})");
    }
    println!("Result       : bit-exact");
    Ok(())
}

fn cmd_index_add(
    group: &TileGroup,
    strategy: ScatterStrategy,
    rows: usize,
    indices: usize,
    slice: usize,
    rng: &mut OperandRng,
) -> Result<()> {
    let dst = rng.tensor(&[rows, slice]);
    let src = rng.tensor(&[indices, slice]);
    let values = rng.indices(indices, rows).context("destination rows exceed the index range")?;
    let index = Tensor::from_vec(&[indices], values.clone())?;
    let expected = reference::index_add_rows(&dst.to_vec(), &src.to_vec(), &values, slice);

    let config = IndexAddConfig { strategy };
    let t0 = Instant::now();
    hb_kernels::index_add(group, &config, &dst, &src, &index, 0, slice, indices, rows)?;
    let elapsed = t0.elapsed();

    let got = dst.to_vec();
    let diff = reference::max_abs_diff(&got, &expected);
    println!("Strategy     : {strategy}");
    println!("Group        : {} ({} tiles)", group.dims(), group.dims().tile_count());
    println!("Scatter      : {indices} rows of {slice} onto {rows} rows");
    println!("Elapsed      : {:.3} ms", elapsed.as_secs_f64() * 1e3);
    println!("Max |error|  : {diff:e}");
    // Lock and atomic resolvers add in arrival order, so only a tolerance
    // holds for them.
    if diff > 1e-4 {
        bail!("scatter result differs from the serial reference (max error {diff:e})");
    }
    info!("index_add verified against serial reference");
    Ok(())
}

fn cmd_mm(group: &TileGroup, m: usize, k: usize, n: usize, rng: &mut OperandRng) -> Result<()> {
    let a = rng.tensor(&[m, k]);
    let b = rng.tensor(&[k, n]);
    let out = Tensor::zeros(&[m, n]);
    let expected = reference::matmul(&a, &b);

    let reg = Registry::builtin();
    let t0 = Instant::now();
    let status = reg.invoke(
        "tensorlib_mm",
        group,
        &[KernelArg::Tensor(&out), KernelArg::Tensor(&a), KernelArg::Tensor(&b)],
    )?;
    let elapsed = t0.elapsed();

    let diff = reference::max_abs_diff(&out.to_vec(), &expected);
    println!("Shape        : {m}×{k} by {k}×{n}");
    println!("Group        : {} ({} tiles)", group.dims(), group.dims().tile_count());
    println!("Status       : {status}");
    println!("Elapsed      : {:.3} ms", elapsed.as_secs_f64() * 1e3);
    println!("Max |error|  : {diff:e}");
    #[allow(clippy::cast_precision_loss)]
    let tolerance = 1e-5 * k.max(1) as f32;
    if diff > tolerance {
        bail!("matmul differs from the naive product (max error {diff:e})");
    }
    Ok(())
}
