//! Group-wide barrier.
//!
//! Unlike `std::sync::Barrier` this one can be poisoned: when a tile fails,
//! the launcher poisons the barrier so tiles already parked on it (and any
//! that arrive later) return [`KernelError::Aborted`] instead of waiting for
//! a peer that will never come.

use crate::error::{KernelError, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

/// Reusable rendezvous for a fixed number of tiles.
#[derive(Debug)]
pub struct GroupBarrier {
    parties: usize,
    state: Mutex<State>,
    released: Condvar,
}

impl GroupBarrier {
    /// Barrier for `parties` tiles.
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(State::default()),
            released: Condvar::new(),
        }
    }

    /// Block until every tile has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Aborted`] if the barrier is or becomes poisoned.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(KernelError::Aborted);
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            self.released.wait(&mut state);
        }
        if state.generation == generation {
            return Err(KernelError::Aborted);
        }
        Ok(())
    }

    /// Release every waiter with an error; later arrivals fail immediately.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.released.notify_all();
    }

    /// Whether [`poison`](Self::poison) has been called.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}
