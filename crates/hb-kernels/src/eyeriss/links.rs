//! Neighbour links of each tile in the systolic array.
//!
//! [`Wiring`] is the pure part: which tile each stream comes from and goes
//! to, derived from the role, the appendix flags and the neighbours' roles.
//! Boundary tiles simply get no link; a link that would leave the group or
//! land on a tile of the wrong role is a configuration error, caught on the
//! host before any tile starts.

use crate::channel::{ChannelRx, ChannelTx};
use crate::error::{KernelError, Result};
use crate::fabric::{Fabric, Stream};
use crate::wait::SpinWait;
use hb_fabric::{Appendix, Role, RoleMap, TileCoord};

/// Upstream and downstream tile of every stream a tile takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wiring {
    /// Filter source.
    pub filter_in: Option<TileCoord>,
    /// Filter destination.
    pub filter_out: Option<TileCoord>,
    /// Input source.
    pub input_in: Option<TileCoord>,
    /// Input destination.
    pub input_out: Option<TileCoord>,
    /// Partial-sum source.
    pub psum_in: Option<TileCoord>,
    /// Partial-sum destination.
    pub psum_out: Option<TileCoord>,
}

impl Wiring {
    /// Links of the tile at `coord`.
    ///
    /// # Errors
    ///
    /// Returns error if the tile's role cannot be read or a link leaves the
    /// group or reaches a tile with an unexpected role.
    pub fn for_tile(map: &RoleMap, coord: TileCoord) -> Result<Self> {
        let (role, appendix) = map.lookup(coord)?;
        let link = Linker { map, coord };
        let mut w = Self::default();
        match role {
            Role::Idle => {}
            Role::FilterFeed => {
                w.filter_out = Some(link.to(Stream::Filter, 2, 0, &[Role::Compute])?);
            }
            Role::InputFeed => {
                w.input_out = Some(link.to(Stream::Input, 1, 1, &[Role::Compute])?);
            }
            Role::PsumFeed => {
                w.psum_out = Some(link.to(Stream::Psum, 0, 2, &[Role::Compute])?);
            }
            Role::Compute => w = Self::compute(&link, appendix)?,
            Role::WriteBack => {
                w.psum_in = Some(link.from(Stream::Psum, 0, 1, &[Role::Compute])?);
            }
        }
        Ok(w)
    }

    fn compute(link: &Linker<'_>, appendix: Appendix) -> Result<Self> {
        let filter_back = appendix.filter_source_distance();
        let filter_src = if filter_back == 2 { Role::FilterFeed } else { Role::Compute };
        let psum_back = appendix.psum_source_distance();
        let psum_src = if psum_back == 2 { Role::PsumFeed } else { Role::Compute };

        Ok(Self {
            filter_in: Some(link.from(Stream::Filter, filter_back, 0, &[filter_src])?),
            filter_out: appendix
                .forwards_filter()
                .then(|| link.to(Stream::Filter, 1, 0, &[Role::Compute]))
                .transpose()?,
            input_in: Some(link.from(Stream::Input, 1, 1, &[Role::InputFeed, Role::Compute])?),
            input_out: appendix
                .forwards_input()
                .then(|| link.to(Stream::Input, 1, 1, &[Role::Compute]))
                .transpose()?,
            psum_in: Some(link.from(Stream::Psum, 0, psum_back, &[psum_src])?),
            psum_out: Some(link.to(Stream::Psum, 0, 1, &[Role::Compute, Role::WriteBack])?),
        })
    }

    /// Every link as `(stream, producer, consumer)`, seen from `coord`.
    pub fn edges(&self, coord: TileCoord) -> Vec<(Stream, TileCoord, TileCoord)> {
        let mut edges = Vec::new();
        let inbound = [
            (Stream::Filter, self.filter_in),
            (Stream::Input, self.input_in),
            (Stream::Psum, self.psum_in),
        ];
        let outbound = [
            (Stream::Filter, self.filter_out),
            (Stream::Input, self.input_out),
            (Stream::Psum, self.psum_out),
        ];
        for (stream, from) in inbound {
            if let Some(from) = from {
                edges.push((stream, from, coord));
            }
        }
        for (stream, to) in outbound {
            if let Some(to) = to {
                edges.push((stream, coord, to));
            }
        }
        edges
    }
}

struct Linker<'m> {
    map: &'m RoleMap,
    coord: TileCoord,
}

impl Linker<'_> {
    fn to(&self, stream: Stream, drow: i16, dcol: i16, expect: &[Role]) -> Result<TileCoord> {
        self.neighbour(stream, drow, dcol, expect)
    }

    fn from(&self, stream: Stream, back_rows: i16, back_cols: i16, expect: &[Role]) -> Result<TileCoord> {
        self.neighbour(stream, -back_rows, -back_cols, expect)
    }

    fn neighbour(&self, stream: Stream, drow: i16, dcol: i16, expect: &[Role]) -> Result<TileCoord> {
        let dims = self.map.dims;
        let other = dims.offset(self.coord, drow, dcol).ok_or_else(|| {
            KernelError::config(format!(
                "{}: {} link of tile {} leaves the {} group",
                self.map.name, stream, self.coord, dims
            ))
        })?;
        let (role, _) = self.map.lookup(other)?;
        if !expect.contains(&role) {
            return Err(KernelError::config(format!(
                "{}: {} link of tile {} reaches {} tile {}",
                self.map.name, stream, self.coord, role, other
            )));
        }
        Ok(other)
    }
}

/// Check every tile of `map` wires up consistently: each link is seen
/// identically from both of its ends.
///
/// # Errors
///
/// Returns the first inconsistency.
pub fn validate(map: &RoleMap) -> Result<()> {
    map.validate()?;
    let mut produced = Vec::new();
    let mut consumed = Vec::new();
    for coord in map.dims.coords() {
        let wiring = Wiring::for_tile(map, coord)?;
        for edge @ (_, from, to) in wiring.edges(coord) {
            if from == coord {
                produced.push(edge);
            }
            if to == coord {
                consumed.push(edge);
            }
        }
    }
    produced.sort_by_key(|&(s, a, b)| (s as u8, a.row, a.col, b.row, b.col));
    consumed.sort_by_key(|&(s, a, b)| (s as u8, a.row, a.col, b.row, b.col));
    if produced != consumed {
        return Err(KernelError::config(format!(
            "{}: producer and consumer links disagree",
            map.name
        )));
    }
    Ok(())
}

/// Live channel ends of one tile.
pub struct TileLinks<'f> {
    /// Filter receiver.
    pub filter_in: Option<ChannelRx<'f>>,
    /// Filter forwarder.
    pub filter_out: Option<ChannelTx<'f>>,
    /// Input receiver.
    pub input_in: Option<ChannelRx<'f>>,
    /// Input forwarder.
    pub input_out: Option<ChannelTx<'f>>,
    /// Partial-sum receiver.
    pub psum_in: Option<ChannelRx<'f>>,
    /// Partial-sum sender.
    pub psum_out: Option<ChannelTx<'f>>,
}

impl<'f> TileLinks<'f> {
    /// Open the channels described by `wiring` for tile `coord`.
    ///
    /// # Errors
    ///
    /// Returns error if the fabric refuses an address.
    pub fn connect(
        fabric: &'f dyn Fabric,
        wait: SpinWait,
        coord: TileCoord,
        wiring: &Wiring,
    ) -> Result<Self> {
        let rx = |stream, from: Option<TileCoord>| {
            from.map(|from| ChannelRx::connect(fabric, wait, stream, from, coord)).transpose()
        };
        let tx = |stream, to: Option<TileCoord>| {
            to.map(|to| ChannelTx::connect(fabric, wait, stream, coord, to)).transpose()
        };
        Ok(Self {
            filter_in: rx(Stream::Filter, wiring.filter_in)?,
            filter_out: tx(Stream::Filter, wiring.filter_out)?,
            input_in: rx(Stream::Input, wiring.input_in)?,
            input_out: tx(Stream::Input, wiring.input_out)?,
            psum_in: rx(Stream::Psum, wiring.psum_in)?,
            psum_out: tx(Stream::Psum, wiring.psum_out)?,
        })
    }
}

/// Take a link the role requires.
pub(super) fn required<T>(link: Option<T>, coord: TileCoord, what: &str) -> Result<T> {
    link.ok_or_else(|| KernelError::config(format!("tile {coord} has no {what} link")))
}
