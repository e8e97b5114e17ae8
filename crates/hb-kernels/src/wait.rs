//! Spin-waiting on fabric flags.

use crate::error::{KernelError, Result};
use crate::fabric::Fabric;
use hb_fabric::TileCoord;
use tracing::warn;

/// Busy polls before the waiter starts yielding its thread.
const SPIN_POLLS: u64 = 64;

/// How long a tile may wait on a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait until the flag flips or the group aborts.
    #[default]
    Forever,
    /// Give up with [`KernelError::Stalled`] after this many polls.
    Bounded(u64),
}

/// Spin-waiter for one tile.
#[derive(Debug, Clone, Copy)]
pub struct SpinWait {
    coord: TileCoord,
    policy: WaitPolicy,
}

impl SpinWait {
    /// Waiter for tile `coord`.
    pub const fn new(coord: TileCoord, policy: WaitPolicy) -> Self {
        Self { coord, policy }
    }

    /// Poll `observe` until it returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Aborted`] if the group aborts while waiting and
    /// [`KernelError::Stalled`] if a bounded policy runs out of polls.
    pub fn until(
        &self,
        fabric: &dyn Fabric,
        what: &'static str,
        mut observe: impl FnMut() -> bool,
    ) -> Result<()> {
        let mut polls = 0u64;
        loop {
            if observe() {
                return Ok(());
            }
            if fabric.is_aborted() {
                return Err(KernelError::Aborted);
            }
            polls += 1;
            if let WaitPolicy::Bounded(limit) = self.policy {
                if polls >= limit {
                    warn!("Tile {} gave up waiting for {} after {} polls", self.coord, what, polls);
                    return Err(KernelError::Stalled { coord: self.coord, what, polls });
                }
            }
            if polls < SPIN_POLLS {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{BufferSizes, SharedFabric};
    use hb_fabric::GroupDims;

    fn fabric() -> SharedFabric {
        SharedFabric::new(GroupDims::new(1, 1), BufferSizes::NONE)
    }

    #[test]
    fn returns_once_observed() {
        let fabric = fabric();
        let wait = SpinWait::new(TileCoord::new(0, 0), WaitPolicy::Bounded(1000));
        let mut n = 0;
        wait.until(&fabric, "counter", || {
            n += 1;
            n == 100
        })
        .unwrap();
        assert_eq!(n, 100);
    }

    #[test]
    fn bounded_wait_stalls() {
        let fabric = fabric();
        let wait = SpinWait::new(TileCoord::new(0, 0), WaitPolicy::Bounded(10));
        let err = wait.until(&fabric, "nothing", || false).unwrap_err();
        assert!(matches!(err, KernelError::Stalled { polls: 10, what: "nothing", .. }));
    }

    #[test]
    fn abort_ends_an_unbounded_wait() {
        let fabric = fabric();
        fabric.abort();
        let wait = SpinWait::new(TileCoord::new(0, 0), WaitPolicy::Forever);
        assert!(wait.until(&fabric, "nothing", || false).unwrap_err().is_abort());
    }
}
