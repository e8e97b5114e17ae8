//! Double-buffered point-to-point channels between neighbouring tiles.
//!
//! A channel links a producer tile to one consumer tile for one [`Stream`].
//! The consumer's scratchpad holds the two data buffers and the inbound
//! flags; the producer keeps outbound mirrors of those flags so it can poll
//! locally instead of across the fabric.
//!
//! ```text
//!   producer                                consumer
//!   wait  outbound[s] == READY_TO_LOAD
//!   write buffer[s]           ───────────►  (remote store)
//!   set   outbound[s] = READY_TO_USE
//!   set   inbound[s]  = READY_TO_USE  ───►  wait inbound[s] == READY_TO_USE
//!                                           read buffer[s]
//!                                           set inbound[s]  = READY_TO_LOAD
//!   outbound[s] = READY_TO_LOAD   ◄──────── set outbound[s] = READY_TO_LOAD
//! ```
//!
//! Both ends alternate A, B, A, ... so the producer fills one buffer while
//! the consumer drains the other.

use crate::error::Result;
use crate::fabric::{
    BufferAddr, BufferHandle, Fabric, FlagAddr, FlagHandle, Slot, Stream, READY_TO_LOAD,
    READY_TO_USE,
};
use crate::wait::SpinWait;
use hb_fabric::TileCoord;
use tracing::trace;

/// Alternating A/B slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRing {
    current: Slot,
}

impl SlotRing {
    /// Ring starting at slot A.
    pub const fn new() -> Self {
        Self { current: Slot::A }
    }

    /// Slot in use.
    pub const fn current(&self) -> Slot {
        self.current
    }

    /// The slot not in use.
    pub const fn other(&self) -> Slot {
        self.current.other()
    }

    /// Switch to the other slot.
    pub fn flip(&mut self) {
        self.current = self.current.other();
    }
}

impl Default for SlotRing {
    fn default() -> Self {
        Self::new()
    }
}

const SLOTS: [Slot; 2] = [Slot::A, Slot::B];

const fn free_slot_label(stream: Stream) -> &'static str {
    match stream {
        Stream::Filter => "downstream filter buffer",
        Stream::Input => "downstream input buffer",
        Stream::Psum => "downstream psum buffer",
    }
}

const fn full_slot_label(stream: Stream) -> &'static str {
    match stream {
        Stream::Filter => "inbound filter buffer",
        Stream::Input => "inbound input buffer",
        Stream::Psum => "inbound psum buffer",
    }
}

/// Producer end of a channel.
pub struct ChannelTx<'f> {
    fabric: &'f dyn Fabric,
    wait: SpinWait,
    stream: Stream,
    to: TileCoord,
    ring: SlotRing,
    buffers: [BufferHandle; 2],
    remote_inbound: [FlagHandle; 2],
    outbound: [FlagHandle; 2],
}

impl<'f> ChannelTx<'f> {
    /// Connect tile `from` to the `stream` buffers of tile `to`.
    ///
    /// # Errors
    ///
    /// Returns error if `to` is outside the group.
    pub fn connect(
        fabric: &'f dyn Fabric,
        wait: SpinWait,
        stream: Stream,
        from: TileCoord,
        to: TileCoord,
    ) -> Result<Self> {
        let buffer = |slot| fabric.remote_buffer(from, to, BufferAddr { stream, slot });
        let inbound = |slot| fabric.remote_flag(from, to, FlagAddr::inbound(stream, slot));
        let [a, b] = SLOTS;
        Ok(Self {
            fabric,
            wait,
            stream,
            to,
            ring: SlotRing::new(),
            buffers: [buffer(a)?, buffer(b)?],
            remote_inbound: [inbound(a)?, inbound(b)?],
            outbound: SLOTS.map(|slot| FlagHandle::local(from, FlagAddr::outbound(stream, slot))),
        })
    }

    /// Consumer tile.
    pub const fn target(&self) -> TileCoord {
        self.to
    }

    /// Wait until the next downstream buffer may be loaded.
    ///
    /// # Errors
    ///
    /// Returns error if the group aborts or the wait stalls.
    pub fn reserve(&mut self) -> Result<Slot> {
        let slot = self.ring.current();
        let flag = self.outbound[slot.index()];
        let fabric = self.fabric;
        self.wait.until(fabric, free_slot_label(self.stream), || {
            fabric.load_flag(flag) == READY_TO_LOAD
        })?;
        Ok(slot)
    }

    /// Store `data` at `offset` in the reserved downstream buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the data overflows the buffer.
    pub fn write(&self, offset: usize, data: &[f32]) -> Result<()> {
        self.fabric.write(self.buffers[self.ring.current().index()], offset, data)
    }

    /// Hand the reserved buffer to the consumer and move to the other slot.
    pub fn commit(&mut self) {
        let i = self.ring.current().index();
        self.fabric.store_flag(self.outbound[i], READY_TO_USE);
        self.fabric.store_flag(self.remote_inbound[i], READY_TO_USE);
        trace!(
            "{} {} -> {}: slot {:?} full",
            self.stream,
            self.outbound[i].tile(),
            self.to,
            self.ring.current()
        );
        self.ring.flip();
    }

    /// Reserve, write `data` at offset 0, commit.
    ///
    /// # Errors
    ///
    /// Returns error if the wait fails or the data overflows the buffer.
    pub fn produce(&mut self, data: &[f32]) -> Result<()> {
        self.reserve()?;
        self.write(0, data)?;
        self.commit();
        Ok(())
    }
}

/// Consumer end of a channel.
pub struct ChannelRx<'f> {
    fabric: &'f dyn Fabric,
    wait: SpinWait,
    stream: Stream,
    ring: SlotRing,
    buffers: [BufferHandle; 2],
    inbound: [FlagHandle; 2],
    remote_outbound: [FlagHandle; 2],
}

impl<'f> ChannelRx<'f> {
    /// Connect tile `to` to receive `stream` from tile `from`.
    ///
    /// # Errors
    ///
    /// Returns error if `from` is outside the group.
    pub fn connect(
        fabric: &'f dyn Fabric,
        wait: SpinWait,
        stream: Stream,
        from: TileCoord,
        to: TileCoord,
    ) -> Result<Self> {
        let outbound = |slot| fabric.remote_flag(to, from, FlagAddr::outbound(stream, slot));
        let [a, b] = SLOTS;
        Ok(Self {
            fabric,
            wait,
            stream,
            ring: SlotRing::new(),
            buffers: SLOTS.map(|slot| BufferHandle::local(to, BufferAddr { stream, slot })),
            inbound: SLOTS.map(|slot| FlagHandle::local(to, FlagAddr::inbound(stream, slot))),
            remote_outbound: [outbound(a)?, outbound(b)?],
        })
    }

    /// Wait until the next inbound buffer is full.
    ///
    /// # Errors
    ///
    /// Returns error if the group aborts or the wait stalls.
    pub fn wait_full(&mut self) -> Result<Slot> {
        let slot = self.ring.current();
        let flag = self.inbound[slot.index()];
        let fabric = self.fabric;
        self.wait.until(fabric, full_slot_label(self.stream), || {
            fabric.load_flag(flag) == READY_TO_USE
        })?;
        Ok(slot)
    }

    /// Copy `out.len()` elements from `offset` of the current inbound buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the range overflows the buffer.
    pub fn read(&self, offset: usize, out: &mut [f32]) -> Result<()> {
        self.fabric.read(self.buffers[self.ring.current().index()], offset, out)
    }

    /// Return the current buffer to the producer and move to the other slot.
    pub fn release(&mut self) {
        let i = self.ring.current().index();
        self.fabric.store_flag(self.inbound[i], READY_TO_LOAD);
        self.fabric.store_flag(self.remote_outbound[i], READY_TO_LOAD);
        trace!(
            "{} at {}: slot {:?} released",
            self.stream,
            self.inbound[i].tile(),
            self.ring.current()
        );
        self.ring.flip();
    }

    /// Wait, read `out.len()` elements from offset 0, release.
    ///
    /// # Errors
    ///
    /// Returns error if the wait fails or the range overflows the buffer.
    pub fn consume(&mut self, out: &mut [f32]) -> Result<()> {
        self.wait_full()?;
        self.read(0, out)?;
        self.release();
        Ok(())
    }
}
