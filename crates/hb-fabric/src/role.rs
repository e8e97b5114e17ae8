//! Tile roles and the appendix byte that refines them.

use std::fmt;

/// Behaviour assigned to a tile by its coordinate.
///
/// Raw table codes are the historical ones:
///
/// ```text
/// 0  idle          nothing to do
/// 1  filter feed   DMA filter rows two tiles down
/// 2  input feed    DMA input rows to the diagonal neighbour
/// 3  psum feed     DMA partial sums two tiles right
/// 4  compute       convolve, forward filter/input/psum
/// 5  write-back    copy finished partial sums to the output tensor
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Takes no part in the dataflow.
    Idle,
    /// Streams filter weights into the first compute row.
    FilterFeed,
    /// Streams input activation rows into the array.
    InputFeed,
    /// Streams initial partial sums into the first compute column.
    PsumFeed,
    /// Processing element.
    Compute,
    /// Drains finished partial sums into the output tensor.
    WriteBack,
}

impl Role {
    /// All roles, in code order.
    pub const ALL: [Self; 6] = [
        Self::Idle,
        Self::FilterFeed,
        Self::InputFeed,
        Self::PsumFeed,
        Self::Compute,
        Self::WriteBack,
    ];

    /// Decode a raw role-table code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::FilterFeed),
            2 => Some(Self::InputFeed),
            3 => Some(Self::PsumFeed),
            4 => Some(Self::Compute),
            5 => Some(Self::WriteBack),
            _ => None,
        }
    }

    /// Raw table code of this role.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::FilterFeed => 1,
            Self::InputFeed => 2,
            Self::PsumFeed => 3,
            Self::Compute => 4,
            Self::WriteBack => 5,
        }
    }

    /// Single-character glyph used when printing role maps.
    #[must_use]
    pub const fn glyph(self) -> char {
        match self {
            Self::Idle => '.',
            Self::FilterFeed => 'F',
            Self::InputFeed => 'I',
            Self::PsumFeed => 'P',
            Self::Compute => 'C',
            Self::WriteBack => 'W',
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::FilterFeed => "filter-feed",
            Self::InputFeed => "input-feed",
            Self::PsumFeed => "psum-feed",
            Self::Compute => "compute",
            Self::WriteBack => "write-back",
        };
        f.write_str(name)
    }
}

/// Per-tile refinement of a role.
///
/// For feeder and write-back tiles the whole byte is a row selector. For
/// compute tiles it is a set of link flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Appendix(pub u8);

impl Appendix {
    /// Compute tile: do not forward the filter buffer (last array row).
    pub const NO_FILTER_FORWARD: u8 = 0x1;
    /// Compute tile: do not forward the input buffer (last row or column).
    pub const NO_INPUT_FORWARD: u8 = 0x2;
    /// Compute tile: partial sums arrive from two columns back.
    pub const PSUM_FROM_TWO_BACK: u8 = 0x4;
    /// Compute tile: filters arrive from two rows back.
    pub const FILTER_FROM_TWO_BACK: u8 = 0x8;

    /// Row selector for feeder and write-back tiles.
    #[must_use]
    pub const fn row(self) -> usize {
        self.0 as usize
    }

    /// Whether a compute tile forwards its filter buffer downwards.
    #[must_use]
    pub const fn forwards_filter(self) -> bool {
        self.0 & Self::NO_FILTER_FORWARD == 0
    }

    /// Whether a compute tile forwards its input buffer diagonally.
    #[must_use]
    pub const fn forwards_input(self) -> bool {
        self.0 & Self::NO_INPUT_FORWARD == 0
    }

    /// Column distance to the partial-sum source.
    #[must_use]
    pub const fn psum_source_distance(self) -> i16 {
        if self.0 & Self::PSUM_FROM_TWO_BACK == 0 { 1 } else { 2 }
    }

    /// Row distance to the filter source.
    #[must_use]
    pub const fn filter_source_distance(self) -> i16 {
        if self.0 & Self::FILTER_FROM_TWO_BACK == 0 { 1 } else { 2 }
    }
}
