//! Tile coordinates and group geometry.
//!
//! Rows grow downwards, columns grow to the right. A tile's linear id is
//! `row * cols + col`, the same order the group barrier and the strided
//! work-sharing loops use.

use std::fmt;

/// Position of one tile inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// Row index (0 = top).
    pub row: u8,
    /// Column index (0 = left).
    pub col: u8,
}

impl TileCoord {
    /// Create a coordinate.
    #[must_use]
    pub const fn new(row: u8, col: u8) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Dimensions of a tile group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupDims {
    /// Tiles per column.
    pub rows: u8,
    /// Tiles per row.
    pub cols: u8,
}

impl GroupDims {
    /// Standard 8×16 group.
    pub const GROUP_8X16: Self = Self { rows: 8, cols: 16 };

    /// Create group dimensions.
    #[must_use]
    pub const fn new(rows: u8, cols: u8) -> Self {
        Self { rows, cols }
    }

    /// Number of tiles in the group.
    #[must_use]
    pub const fn tile_count(&self) -> usize {
        (self.rows as usize) * (self.cols as usize)
    }

    /// Whether `coord` lies inside the group.
    #[must_use]
    pub const fn contains(&self, coord: TileCoord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    /// Linear id of a tile (`row * cols + col`).
    #[must_use]
    pub const fn linear_id(&self, coord: TileCoord) -> usize {
        (coord.row as usize) * (self.cols as usize) + (coord.col as usize)
    }

    /// Inverse of [`linear_id`](Self::linear_id).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn coord_of(&self, id: usize) -> TileCoord {
        let cols = self.cols as usize;
        TileCoord::new((id / cols) as u8, (id % cols) as u8)
    }

    /// Neighbour of `from` displaced by `(drow, dcol)`.
    ///
    /// Returns `None` when the displaced position falls outside the group, so
    /// boundary tiles simply have no link in that direction.
    #[must_use]
    pub fn offset(&self, from: TileCoord, drow: i16, dcol: i16) -> Option<TileCoord> {
        let row = i16::from(from.row) + drow;
        let col = i16::from(from.col) + dcol;
        let row = u8::try_from(row).ok()?;
        let col = u8::try_from(col).ok()?;
        let to = TileCoord::new(row, col);
        self.contains(to).then_some(to)
    }

    /// Every coordinate of the group in linear-id order.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.tile_count()).map(|id| self.coord_of(id))
    }
}

impl fmt::Display for GroupDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.rows, self.cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_id_roundtrip() {
        let dims = GroupDims::GROUP_8X16;
        assert_eq!(dims.tile_count(), 128);
        for (id, coord) in dims.coords().enumerate() {
            assert_eq!(dims.linear_id(coord), id);
        }
        assert_eq!(dims.coord_of(17), TileCoord::new(1, 1));
    }

    #[test]
    fn offset_stays_inside_group() {
        let dims = GroupDims::new(3, 4);
        let corner = TileCoord::new(0, 0);
        assert_eq!(dims.offset(corner, -1, 0), None);
        assert_eq!(dims.offset(corner, 0, -1), None);
        assert_eq!(dims.offset(corner, 2, 3), Some(TileCoord::new(2, 3)));
        assert_eq!(dims.offset(TileCoord::new(2, 3), 1, 0), None);
        assert_eq!(dims.offset(TileCoord::new(2, 3), 0, 1), None);
    }

    #[test]
    fn display() {
        assert_eq!(TileCoord::new(2, 7).to_string(), "(2, 7)");
        assert_eq!(GroupDims::GROUP_8X16.to_string(), "8×16");
    }
}
