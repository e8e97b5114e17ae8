//! Host-side launcher: runs one kernel body on every tile of a group.
//!
//! Each tile is a scoped host thread with its own [`TileContext`]. A tile
//! that returns an error or panics aborts the fabric, which releases every
//! other tile from its spin-waits and barriers with
//! [`KernelError::Aborted`]. The launcher then reports the error that
//! started the abort.

use crate::error::{KernelError, Result};
use crate::fabric::{BufferSizes, Fabric, SharedFabric};
use crate::wait::{SpinWait, WaitPolicy};
use hb_fabric::{GroupDims, TileCoord};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info};

/// Launch configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Tile group dimensions
    pub dims: GroupDims,
    /// Spin-wait policy for every tile
    pub wait: WaitPolicy,
}

impl LaunchConfig {
    /// Configuration for a `dims` group that waits forever.
    pub const fn new(dims: GroupDims) -> Self {
        Self { dims, wait: WaitPolicy::Forever }
    }

    /// Replace the wait policy.
    #[must_use]
    pub const fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}

/// What a kernel body sees on one tile.
#[derive(Clone, Copy)]
pub struct TileContext<'f> {
    coord: TileCoord,
    fabric: &'f dyn Fabric,
    wait: SpinWait,
}

impl<'f> TileContext<'f> {
    /// Context for `coord` on `fabric`.
    pub const fn new(coord: TileCoord, fabric: &'f dyn Fabric, wait: WaitPolicy) -> Self {
        Self { coord, fabric, wait: SpinWait::new(coord, wait) }
    }

    /// This tile's coordinate.
    pub const fn coord(&self) -> TileCoord {
        self.coord
    }

    /// Group dimensions.
    pub fn dims(&self) -> GroupDims {
        self.fabric.dims()
    }

    /// Row-major tile id (`row * cols + col`).
    pub fn linear_id(&self) -> usize {
        self.dims().linear_id(self.coord)
    }

    /// Number of tiles in the group.
    pub fn tile_count(&self) -> usize {
        self.dims().tile_count()
    }

    /// The fabric.
    pub const fn fabric(&self) -> &'f dyn Fabric {
        self.fabric
    }

    /// Spin-waiter configured for this tile.
    pub const fn spin(&self) -> SpinWait {
        self.wait
    }

    /// Group barrier.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Aborted`] once the group has been aborted.
    pub fn barrier(&self) -> Result<()> {
        self.fabric.barrier()
    }
}

impl std::fmt::Debug for TileContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileContext")
            .field("coord", &self.coord)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

/// A tile group ready to run kernels.
#[derive(Debug, Clone, Copy)]
pub struct TileGroup {
    config: LaunchConfig,
}

impl TileGroup {
    /// Group with the given launch configuration.
    pub const fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    /// Group dimensions.
    pub const fn dims(&self) -> GroupDims {
        self.config.dims
    }

    /// Launch configuration.
    pub const fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run `kernel` on every tile over a freshly allocated fabric with
    /// `sizes` channel buffers per tile.
    ///
    /// # Errors
    ///
    /// Returns the first tile error that is not itself an abort.
    pub fn launch<F>(&self, sizes: BufferSizes, kernel: F) -> Result<()>
    where
        F: Fn(&TileContext<'_>) -> Result<()> + Sync,
    {
        let fabric = SharedFabric::new(self.config.dims, sizes);
        self.launch_on(&fabric, kernel)
    }

    /// Run `kernel` on every tile over an existing fabric.
    ///
    /// # Errors
    ///
    /// Returns error if the fabric does not match the group dimensions, or
    /// the first tile error that is not itself an abort.
    pub fn launch_on<F>(&self, fabric: &dyn Fabric, kernel: F) -> Result<()>
    where
        F: Fn(&TileContext<'_>) -> Result<()> + Sync,
    {
        let dims = self.config.dims;
        if fabric.dims() != dims {
            return Err(KernelError::config(format!(
                "fabric is {} but the group is {}",
                fabric.dims(),
                dims
            )));
        }

        info!("Launching kernel on {} tile group", dims);
        let start = Instant::now();
        let wait = self.config.wait;
        let kernel = &kernel;

        let outcomes: Vec<(TileCoord, Result<()>)> = std::thread::scope(|s| {
            let handles: Vec<_> = dims
                .coords()
                .map(|coord| {
                    let handle = s.spawn(move || run_tile(coord, fabric, wait, kernel));
                    (coord, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(coord, handle)| {
                    let result = handle.join().unwrap_or_else(|payload| {
                        Err(KernelError::TilePanicked { coord, message: panic_message(&*payload) })
                    });
                    (coord, result)
                })
                .collect()
        });

        let mut first_abort = None;
        for (coord, result) in outcomes {
            match result {
                Ok(()) => {}
                Err(e) if e.is_abort() => {
                    first_abort.get_or_insert(e);
                }
                Err(e) => {
                    debug!("Tile {} failed first: {}", coord, e);
                    return Err(e);
                }
            }
        }
        if let Some(e) = first_abort {
            return Err(e);
        }

        info!("Kernel finished on {} tiles in {:?}", dims.tile_count(), start.elapsed());
        Ok(())
    }
}

fn run_tile<F>(coord: TileCoord, fabric: &dyn Fabric, wait: WaitPolicy, kernel: &F) -> Result<()>
where
    F: Fn(&TileContext<'_>) -> Result<()> + Sync,
{
    let ctx = TileContext::new(coord, fabric, wait);
    let result = panic::catch_unwind(AssertUnwindSafe(|| kernel(&ctx))).unwrap_or_else(|payload| {
        Err(KernelError::TilePanicked { coord, message: panic_message(&*payload) })
    });
    if let Err(e) = &result {
        if !e.is_abort() {
            debug!("Tile {} failed, aborting group: {}", coord, e);
        }
        fabric.abort();
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group(rows: u8, cols: u8) -> TileGroup {
        TileGroup::new(LaunchConfig::new(GroupDims::new(rows, cols)))
    }

    #[test]
    fn every_tile_runs_once() {
        let seen: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();
        group(2, 3)
            .launch(BufferSizes::NONE, |ctx| {
                seen[ctx.linear_id()].fetch_add(1, Ordering::SeqCst);
                ctx.barrier()
            })
            .unwrap();
        assert!(seen.iter().all(|n| n.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn failing_tile_releases_the_barrier() {
        let err = group(2, 2)
            .launch(BufferSizes::NONE, |ctx| {
                if ctx.coord() == TileCoord::new(1, 0) {
                    return Err(KernelError::config("boom"));
                }
                ctx.barrier()
            })
            .unwrap_err();
        assert!(matches!(err, KernelError::Config { .. }));
    }

    #[test]
    fn panicking_tile_is_reported() {
        let err = group(1, 3)
            .launch(BufferSizes::NONE, |ctx| {
                if ctx.coord().col == 2 {
                    panic!("tile exploded");
                }
                ctx.barrier()
            })
            .unwrap_err();
        match err {
            KernelError::TilePanicked { coord, message } => {
                assert_eq!(coord, TileCoord::new(0, 2));
                assert_eq!(message, "tile exploded");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn fabric_must_match_group() {
        let fabric = SharedFabric::new(GroupDims::new(1, 1), BufferSizes::NONE);
        let err = group(2, 2).launch_on(&fabric, |_| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::Config { .. }));
    }
}
