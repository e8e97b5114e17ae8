//! Tile-group kernels for a manycore accelerator, on a simulated fabric.
//!
//! Every kernel runs the same body on every tile of a group; a tile's
//! coordinate decides what it does. Tiles talk only through remote stores
//! into each other's scratchpads, readiness flags and group barriers.
//!
//! # Kernels
//!
//! | Kernel | Host entry | Registered as |
//! |--------|------------|---------------|
//! | Systolic convolution | [`eyeriss::eyeriss`] | `tensorlib_eyeriss` |
//! | Scatter-accumulate | [`index_add::index_add`] | `tensorlib_index_add` |
//! | Blocked matmul | [`mm::mm`] | `tensorlib_mm` |
//!
//! # Layering
//!
//! ```text
//!   registry        name + signature → host launcher
//!   eyeriss / index_add / mm
//!   group           TileGroup::launch, one scoped thread per tile
//!   channel         double-buffered producer/consumer link
//!   fabric, wait    scratchpads, flags, barrier, abort
//!   tensor          strided view over shared cells
//! ```
//!
//! # Quick start
//!
//! ```
//! use hb_kernels::prelude::*;
//!
//! # fn main() -> hb_kernels::Result<()> {
//! let group = TileGroup::new(LaunchConfig::new(GroupDims::new(2, 2)));
//! let a = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//! let b = Tensor::from_vec(&[3, 1], vec![1.0, 0.0, -1.0])?;
//! let c = Tensor::zeros(&[2, 1]);
//! mm(&group, &c, &a, &b)?;
//! assert_eq!(c.to_vec(), vec![-2.0, -2.0]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod barrier;
pub mod channel;
mod error;
pub mod eyeriss;
pub mod fabric;
pub mod group;
pub mod index_add;
pub mod mm;
pub mod reference;
pub mod registry;
pub mod tensor;
pub mod wait;

pub use error::{KernelError, Result};
pub use eyeriss::{eyeriss, EyerissConfig, PsumMode};
pub use fabric::{BufferSizes, Fabric, SharedFabric};
pub use group::{LaunchConfig, TileContext, TileGroup};
pub use index_add::{index_add, IndexAddConfig, ScatterStrategy};
pub use mm::mm;
pub use registry::{ArgKind, KernelArg, Registry};
pub use tensor::Tensor;
pub use wait::WaitPolicy;

/// Everything needed to launch a kernel.
pub mod prelude {
    pub use crate::{
        eyeriss, index_add, mm, BufferSizes, EyerissConfig, IndexAddConfig, KernelArg,
        KernelError, LaunchConfig, PsumMode, Registry, Result, ScatterStrategy, Tensor,
        TileGroup, WaitPolicy,
    };
    pub use hb_fabric::{EyerissVariant, GroupDims, TileCoord};
}
