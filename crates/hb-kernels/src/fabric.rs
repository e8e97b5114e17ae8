//! Remote-memory fabric.
//!
//! Each tile owns a scratchpad holding, for every data stream, two buffers
//! (slot A and B) and two pairs of readiness flags:
//!
//! ```text
//!   inbound[slot]   1 = buffer full, ready to use      (consumer side)
//!   outbound[slot]  mirror of the downstream tile's inbound flag;
//!                   0 = downstream buffer ready to load (producer side)
//! ```
//!
//! Any tile may obtain a handle into another tile's scratchpad through
//! [`Fabric::remote_buffer`] / [`Fabric::remote_flag`]; the fabric refuses
//! targets outside the group. Flag stores use `Release` and flag loads
//! `Acquire`, so buffer contents written before raising a flag are visible
//! to whoever observes the raised flag.

use crate::barrier::GroupBarrier;
use crate::error::{KernelError, Result};
use hb_fabric::{GroupDims, TileCoord};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Flag value: buffer empty, producer may load it.
pub const READY_TO_LOAD: u32 = 0;
/// Flag value: buffer full, consumer may use it.
pub const READY_TO_USE: u32 = 1;

/// Data stream carried by a double-buffered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Filter weights.
    Filter,
    /// Input activations.
    Input,
    /// Partial sums.
    Psum,
}

impl Stream {
    /// All streams.
    pub const ALL: [Self; 3] = [Self::Filter, Self::Input, Self::Psum];

    const fn index(self) -> usize {
        match self {
            Self::Filter => 0,
            Self::Input => 1,
            Self::Psum => 2,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filter => "filter",
            Self::Input => "input",
            Self::Psum => "psum",
        })
    }
}

/// One half of a double buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// First buffer.
    A,
    /// Second buffer.
    B,
}

impl Slot {
    /// The other slot.
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Which flag of a stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    /// Consumer-side ready-to-use flag.
    Inbound,
    /// Producer-side mirror of the downstream inbound flag.
    Outbound,
}

/// Scratchpad-relative address of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagAddr {
    /// Stream.
    pub stream: Stream,
    /// Slot.
    pub slot: Slot,
    /// Inbound or outbound.
    pub kind: FlagKind,
}

impl FlagAddr {
    /// Inbound flag of `stream`/`slot`.
    pub const fn inbound(stream: Stream, slot: Slot) -> Self {
        Self { stream, slot, kind: FlagKind::Inbound }
    }

    /// Outbound mirror flag of `stream`/`slot`.
    pub const fn outbound(stream: Stream, slot: Slot) -> Self {
        Self { stream, slot, kind: FlagKind::Outbound }
    }
}

/// Scratchpad-relative address of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAddr {
    /// Stream.
    pub stream: Stream,
    /// Slot.
    pub slot: Slot,
}

/// Flag address resolved to a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagHandle {
    tile: TileCoord,
    addr: FlagAddr,
}

impl FlagHandle {
    /// A flag in the calling tile's own scratchpad.
    pub const fn local(tile: TileCoord, addr: FlagAddr) -> Self {
        Self { tile, addr }
    }

    /// Owning tile.
    pub const fn tile(&self) -> TileCoord {
        self.tile
    }

    /// Scratchpad address.
    pub const fn addr(&self) -> FlagAddr {
        self.addr
    }
}

/// Buffer address resolved to a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    tile: TileCoord,
    addr: BufferAddr,
}

impl BufferHandle {
    /// A buffer in the calling tile's own scratchpad.
    pub const fn local(tile: TileCoord, addr: BufferAddr) -> Self {
        Self { tile, addr }
    }

    /// Owning tile.
    pub const fn tile(&self) -> TileCoord {
        self.tile
    }

    /// Scratchpad address.
    pub const fn addr(&self) -> BufferAddr {
        self.addr
    }
}

/// Scratchpad buffer capacity per stream, in elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferSizes {
    /// Filter buffer capacity.
    pub filter: usize,
    /// Input buffer capacity.
    pub input: usize,
    /// Partial-sum buffer capacity.
    pub psum: usize,
}

impl BufferSizes {
    /// No channel buffers (kernels that only use the barrier).
    pub const NONE: Self = Self { filter: 0, input: 0, psum: 0 };

    /// Capacity of `stream`.
    pub const fn of(&self, stream: Stream) -> usize {
        match stream {
            Stream::Filter => self.filter,
            Stream::Input => self.input,
            Stream::Psum => self.psum,
        }
    }
}

/// Remote-memory interconnect and group synchronisation as seen by a tile.
///
/// Kernels only touch scratchpads through this trait, so the addressing can
/// be observed or substituted in tests.
pub trait Fabric: Send + Sync {
    /// Dimensions of the tile group.
    fn dims(&self) -> GroupDims;

    /// Buffer capacities of every scratchpad.
    fn sizes(&self) -> BufferSizes;

    /// Address of a flag in tile `to`, usable from tile `from`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::OutOfGroup`] if either tile is outside the group.
    fn remote_flag(&self, from: TileCoord, to: TileCoord, addr: FlagAddr) -> Result<FlagHandle>;

    /// Address of a buffer in tile `to`, usable from tile `from`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::OutOfGroup`] if either tile is outside the group.
    fn remote_buffer(&self, from: TileCoord, to: TileCoord, addr: BufferAddr)
        -> Result<BufferHandle>;

    /// Acquire-load of a flag.
    fn load_flag(&self, flag: FlagHandle) -> u32;

    /// Release-store of a flag.
    fn store_flag(&self, flag: FlagHandle, value: u32);

    /// Copy `data` into a buffer starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::BufferOverflow`] if the data does not fit.
    fn write(&self, buffer: BufferHandle, offset: usize, data: &[f32]) -> Result<()>;

    /// Copy `out.len()` elements out of a buffer starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::BufferOverflow`] if the range exceeds the buffer.
    fn read(&self, buffer: BufferHandle, offset: usize, out: &mut [f32]) -> Result<()>;

    /// Group-wide barrier.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Aborted`] once the group has been aborted.
    fn barrier(&self) -> Result<()>;

    /// Abort the group: waiters on the barrier and on flags give up.
    fn abort(&self);

    /// Whether the group has been aborted.
    fn is_aborted(&self) -> bool;
}

struct StreamSlots {
    buffers: [Box<[AtomicU32]>; 2],
    inbound: [AtomicU32; 2],
    outbound: [AtomicU32; 2],
}

impl StreamSlots {
    fn new(capacity: usize) -> Self {
        let buffer = || (0..capacity).map(|_| AtomicU32::new(0)).collect::<Box<[_]>>();
        Self {
            buffers: [buffer(), buffer()],
            inbound: [AtomicU32::new(READY_TO_LOAD), AtomicU32::new(READY_TO_LOAD)],
            outbound: [AtomicU32::new(READY_TO_LOAD), AtomicU32::new(READY_TO_LOAD)],
        }
    }
}

struct Scratchpad {
    streams: [StreamSlots; 3],
}

impl Scratchpad {
    fn new(sizes: BufferSizes) -> Self {
        Self {
            streams: Stream::ALL.map(|s| StreamSlots::new(sizes.of(s))),
        }
    }

    fn flag(&self, addr: FlagAddr) -> &AtomicU32 {
        let slots = &self.streams[addr.stream.index()];
        match addr.kind {
            FlagKind::Inbound => &slots.inbound[addr.slot.index()],
            FlagKind::Outbound => &slots.outbound[addr.slot.index()],
        }
    }

    fn buffer(&self, addr: BufferAddr) -> &[AtomicU32] {
        &self.streams[addr.stream.index()].buffers[addr.slot.index()]
    }
}

/// In-process fabric: one scratchpad per tile in shared host memory.
///
/// Allocated fresh for every kernel invocation, so no flag or buffer state
/// survives from one launch to the next.
pub struct SharedFabric {
    dims: GroupDims,
    sizes: BufferSizes,
    pads: Vec<Scratchpad>,
    barrier: GroupBarrier,
    aborted: AtomicBool,
}

impl SharedFabric {
    /// Fabric for a `dims` group with `sizes` buffers on every tile.
    pub fn new(dims: GroupDims, sizes: BufferSizes) -> Self {
        let tiles = dims.tile_count();
        Self {
            dims,
            sizes,
            pads: (0..tiles).map(|_| Scratchpad::new(sizes)).collect(),
            barrier: GroupBarrier::new(tiles),
            aborted: AtomicBool::new(false),
        }
    }

    fn pad(&self, tile: TileCoord) -> &Scratchpad {
        &self.pads[self.dims.linear_id(tile)]
    }

    fn check(&self, from: TileCoord, to: TileCoord) -> Result<()> {
        if self.dims.contains(from) && self.dims.contains(to) {
            Ok(())
        } else {
            Err(KernelError::OutOfGroup { from, to })
        }
    }

    fn span(&self, buffer: BufferHandle, offset: usize, len: usize) -> Result<&[AtomicU32]> {
        let cells = self.pad(buffer.tile).buffer(buffer.addr);
        offset
            .checked_add(len)
            .and_then(|end| cells.get(offset..end))
            .ok_or(KernelError::BufferOverflow { offset, len, capacity: cells.len() })
    }
}

impl fmt::Debug for SharedFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFabric")
            .field("dims", &self.dims)
            .field("sizes", &self.sizes)
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Fabric for SharedFabric {
    fn dims(&self) -> GroupDims {
        self.dims
    }

    fn sizes(&self) -> BufferSizes {
        self.sizes
    }

    fn remote_flag(&self, from: TileCoord, to: TileCoord, addr: FlagAddr) -> Result<FlagHandle> {
        self.check(from, to)?;
        Ok(FlagHandle { tile: to, addr })
    }

    fn remote_buffer(
        &self,
        from: TileCoord,
        to: TileCoord,
        addr: BufferAddr,
    ) -> Result<BufferHandle> {
        self.check(from, to)?;
        Ok(BufferHandle { tile: to, addr })
    }

    fn load_flag(&self, flag: FlagHandle) -> u32 {
        self.pad(flag.tile).flag(flag.addr).load(Ordering::Acquire)
    }

    fn store_flag(&self, flag: FlagHandle, value: u32) {
        self.pad(flag.tile).flag(flag.addr).store(value, Ordering::Release);
    }

    fn write(&self, buffer: BufferHandle, offset: usize, data: &[f32]) -> Result<()> {
        for (cell, v) in self.span(buffer, offset, data.len())?.iter().zip(data) {
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn read(&self, buffer: BufferHandle, offset: usize, out: &mut [f32]) -> Result<()> {
        let cells = self.span(buffer, offset, out.len())?;
        for (v, cell) in out.iter_mut().zip(cells) {
            *v = f32::from_bits(cell.load(Ordering::Relaxed));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.sync()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.barrier.poison();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
