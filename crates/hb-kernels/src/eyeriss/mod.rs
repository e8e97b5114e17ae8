//! Weight-stationary systolic convolution ("Eyeriss" dataflow).
//!
//! Every tile of the group runs [`run_tile`]. The tile looks itself up in
//! the variant's role map and plays exactly one role:
//!
//! ```text
//!            F  F  F                 F  filter feed  (row sel = filter row)
//!         I  I  I                    I  input feed   (row sel = input row)
//!      P  I  C  C  C  W              P  psum feed    (row sel = output row)
//!      P  I  C  C  C  W              C  compute
//!      P     C  C  C  W              W  write-back   (row sel = output row)
//! ```
//!
//! Filters flow down the compute columns, input rows flow diagonally and
//! partial sums flow right. Compute column `c` holds filter row
//! `Hk - 1 - c`, so a partial sum leaving the last column has accumulated
//! every filter row and the write-back tile stores it.
//!
//! The schedule is a sequence of passes (a group of filters) each split into
//! bursts (a group of images). Every role walks the same schedule, derived
//! from the shared [`Geometry`].

mod compute;
mod feeders;
pub mod geometry;
pub mod links;

pub use compute::convolve;
pub use geometry::Geometry;
pub use links::{TileLinks, Wiring};

use crate::error::{KernelError, Result};
use crate::group::{TileContext, TileGroup};
use crate::tensor::Tensor;
use hb_fabric::{EyerissVariant, GroupDims, Role};
use tracing::{debug, info, warn};

/// Default filters carried per pass.
pub const DEFAULT_FILTERS_PER_PASS: usize = 3;
/// Default images carried per burst.
pub const DEFAULT_IMAGES_PER_BURST: usize = 2;

/// Where the partial sums entering the array start from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PsumMode {
    /// Start from zero: the output is overwritten.
    #[default]
    Fresh,
    /// Start from the current output values: the convolution is added on.
    Accumulate,
}

/// Systolic convolution configuration
#[derive(Debug, Clone, Copy)]
pub struct EyerissConfig {
    /// Role-map variant
    pub variant: EyerissVariant,
    /// Filters carried by one pass
    pub filters_per_pass: usize,
    /// Images carried by one burst
    pub images_per_burst: usize,
    /// Partial-sum starting values
    pub psum_mode: PsumMode,
}

impl EyerissConfig {
    /// Default configuration for `variant`.
    pub const fn new(variant: EyerissVariant) -> Self {
        Self {
            variant,
            filters_per_pass: DEFAULT_FILTERS_PER_PASS,
            images_per_burst: DEFAULT_IMAGES_PER_BURST,
            psum_mode: PsumMode::Fresh,
        }
    }

    /// Default configuration for the built-in variant laid out for `dims`.
    ///
    /// # Errors
    ///
    /// Returns error if no built-in variant has these dimensions.
    pub fn for_dims(dims: GroupDims) -> Result<Self> {
        EyerissVariant::ALL
            .into_iter()
            .find(|v| v.map.dims == dims)
            .map(Self::new)
            .ok_or_else(|| KernelError::config(format!("no systolic array variant for a {dims} group")))
    }

    /// Replace the partial-sum mode.
    #[must_use]
    pub const fn with_psum_mode(mut self, psum_mode: PsumMode) -> Self {
        self.psum_mode = psum_mode;
        self
    }
}

/// Tensors of one convolution, shared by every tile.
#[derive(Debug, Clone, Copy)]
pub struct ConvTensors<'a> {
    /// Output `[N, Cout, Hout, Wout]`.
    pub omap: &'a Tensor<f32>,
    /// Input `[N, 1, Hin, Win]`.
    pub imap: &'a Tensor<f32>,
    /// Filters `[Cout, 1, Hk, Wk]`.
    pub filter: &'a Tensor<f32>,
}

/// Host-side check of everything a launch depends on.
///
/// Validates the role map, the wiring of every tile and the row selectors
/// against the tensors, then derives the geometry.
///
/// # Errors
///
/// Returns the first configuration problem found.
pub fn prepare(
    dims: GroupDims,
    config: &EyerissConfig,
    tensors: &ConvTensors<'_>,
    padding: &[i64],
    strides: &[i64],
) -> Result<Geometry> {
    let variant = config.variant;
    if dims != variant.map.dims {
        return Err(KernelError::config(format!(
            "{} needs a {} group, got {}",
            variant.name(),
            variant.map.dims,
            dims
        )));
    }
    links::validate(&variant.map)?;
    let geo = Geometry::new(config, tensors.omap, tensors.imap, tensors.filter, padding, strides)?;

    for coord in dims.coords() {
        let (role, appendix) = variant.map.lookup(coord)?;
        let (limit, what) = match role {
            Role::FilterFeed => (geo.filter_rows, "filter"),
            Role::InputFeed => (variant.input_rows(), "input"),
            Role::PsumFeed | Role::WriteBack => (geo.output_rows, "output"),
            Role::Idle | Role::Compute => continue,
        };
        if appendix.row() >= limit {
            return Err(KernelError::config(format!(
                "{}: {} tile {} selects {} row {} of {}",
                variant.name(),
                role,
                coord,
                what,
                appendix.row(),
                limit
            )));
        }
    }

    if tensors.omap.dim(2) > variant.output_rows {
        warn!(
            "{} computes output rows 0..{}, rows {}..{} are left untouched",
            variant.name(),
            variant.output_rows,
            variant.output_rows,
            tensors.omap.dim(2)
        );
    }
    debug!(
        "{}: {} passes x {} bursts, buffers {:?}",
        variant.name(),
        geo.passes().count(),
        geo.bursts().count(),
        geo.buffer_sizes()
    );
    Ok(geo)
}

/// Per-tile body of the convolution.
///
/// # Errors
///
/// Returns error if the tile's role or links cannot be set up, a transfer
/// fails, or the group aborts.
pub fn run_tile(
    ctx: &TileContext<'_>,
    variant: &EyerissVariant,
    geo: &Geometry,
    tensors: &ConvTensors<'_>,
) -> Result<()> {
    let coord = ctx.coord();
    let (role, appendix) = variant.map.lookup(coord)?;
    let wiring = Wiring::for_tile(&variant.map, coord)?;
    let links = TileLinks::connect(ctx.fabric(), ctx.spin(), coord, &wiring)?;
    ctx.barrier()?;

    debug!("Tile {} runs as {} (appendix {:#x})", coord, role, appendix.0);
    let row = appendix.row();
    match role {
        Role::Idle => {}
        Role::FilterFeed => feeders::filter_feed(geo, tensors, coord, row, links)?,
        Role::InputFeed => feeders::input_feed(geo, tensors, coord, row, links)?,
        Role::PsumFeed => feeders::psum_feed(geo, tensors, coord, row, links)?,
        Role::Compute => compute::run(geo, coord, links)?,
        Role::WriteBack => feeders::write_back(geo, tensors, coord, row, links)?,
    }

    ctx.barrier()
}

/// Run the systolic convolution `omap = imap ⊛ filter` on `group`.
///
/// # Errors
///
/// Returns a configuration error before launch, or the first tile error.
pub fn eyeriss(
    group: &TileGroup,
    config: &EyerissConfig,
    omap: &Tensor<f32>,
    imap: &Tensor<f32>,
    filter: &Tensor<f32>,
    padding: &[i64],
    strides: &[i64],
) -> Result<()> {
    let tensors = ConvTensors { omap, imap, filter };
    let geo = prepare(group.dims(), config, &tensors, padding, strides)?;
    info!(
        "Eyeriss {}: {} images x {} filters, {} steps",
        config.variant.name(),
        geo.images,
        geo.filters,
        geo.steps()
    );
    group.launch(geo.buffer_sizes(), |ctx| run_tile(ctx, &config.variant, &geo, &tensors))
}
