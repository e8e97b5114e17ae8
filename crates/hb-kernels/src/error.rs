//! Error types for tile-group kernel operations

use hb_fabric::{TileCoord, TopologyError};
use thiserror::Error;

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors that end a kernel invocation.
///
/// Every variant is fatal for the invocation: nothing is retried and a tile
/// that hits one aborts the whole group.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Role map could not be read
    #[error("Topology error: {source}")]
    Topology {
        /// Underlying topology error
        #[from]
        source: TopologyError,
    },

    /// Kernel arguments or role map do not fit together
    #[error("Invalid kernel configuration: {reason}")]
    Config {
        /// Reason for failure
        reason: String,
    },

    /// A remote address was requested outside the tile group
    #[error("Remote address from {from} to {to} leaves the tile group")]
    OutOfGroup {
        /// Requesting tile
        from: TileCoord,
        /// Requested target tile
        to: TileCoord,
    },

    /// A transfer does not fit the scratchpad buffer
    #[error("Transfer of {len} elements at offset {offset} overflows {capacity}-element buffer")]
    BufferOverflow {
        /// Start offset in the buffer
        offset: usize,
        /// Transfer length
        len: usize,
        /// Buffer capacity
        capacity: usize,
    },

    /// A bounded spin-wait gave up
    #[error("Tile {coord} stalled after {polls} polls waiting for {what}")]
    Stalled {
        /// Waiting tile
        coord: TileCoord,
        /// What the tile was waiting for
        what: &'static str,
        /// Number of polls performed
        polls: u64,
    },

    /// Another tile in the group failed
    #[error("Tile group aborted")]
    Aborted,

    /// A tile panicked
    #[error("Tile {coord} panicked: {message}")]
    TilePanicked {
        /// Tile that panicked
        coord: TileCoord,
        /// Panic payload, if it was a string
        message: String,
    },

    /// No kernel registered under this name
    #[error("Unknown kernel: {name}")]
    UnknownKernel {
        /// Requested name
        name: String,
    },

    /// Arguments do not match the registered signature
    #[error("Kernel {name} called with bad arguments: {reason}")]
    Signature {
        /// Kernel name
        name: &'static str,
        /// Reason for failure
        reason: String,
    },
}

impl KernelError {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a signature error
    pub fn signature(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Signature {
            name,
            reason: reason.into(),
        }
    }

    /// Whether this error only reports that some other tile failed first.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
