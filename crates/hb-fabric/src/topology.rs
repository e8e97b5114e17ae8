//! Static role-map tables.
//!
//! A role map assigns every tile of a group one [`Role`] and one
//! [`Appendix`] byte. Tables are compile-time constants per kernel variant;
//! at run time they are only indexed.
//!
//! ## Eyeriss dataflow on the tables
//!
//! ```text
//!   filter  flows down a column      (r, c) -> (r+1, c)
//!   input   flows diagonally         (r, c) -> (r+1, c+1)
//!   psum    flows right along a row  (r, c) -> (r, c+1)
//! ```
//!
//! Filter feeders sit two rows above the first compute row and psum feeders
//! two columns left of the first compute column; the compute tiles next to
//! them carry the `*_FROM_TWO_BACK` appendix flags. Each compute column holds
//! one filter row (last column = filter row 0), each compute row produces one
//! output row, and a write-back tile closes every row.

use crate::coord::{GroupDims, TileCoord};
use crate::role::{Appendix, Role};
use std::fmt;

/// Errors raised while reading a role map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Coordinate lies outside the table.
    OutOfGroup {
        /// Requested coordinate.
        coord: TileCoord,
        /// Table dimensions.
        dims: GroupDims,
    },
    /// Table entry is not a known role code.
    UnknownRole {
        /// Offending coordinate.
        coord: TileCoord,
        /// Raw code found in the table.
        code: u8,
    },
    /// Role and appendix tables disagree with the declared dimensions.
    Malformed {
        /// Variant name.
        name: &'static str,
    },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfGroup { coord, dims } => {
                write!(f, "tile {coord} is outside the {dims} role map")
            }
            Self::UnknownRole { coord, code } => {
                write!(f, "invalid tile task config {code} at {coord}")
            }
            Self::Malformed { name } => {
                write!(f, "role map '{name}' does not match its declared dimensions")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Compile-time role assignment for one kernel variant.
#[derive(Debug, Clone, Copy)]
pub struct RoleMap {
    /// Variant name.
    pub name: &'static str,
    /// Group dimensions the table covers.
    pub dims: GroupDims,
    roles: &'static [&'static [u8]],
    appendix: &'static [&'static [u8]],
}

impl RoleMap {
    /// Build a role map from raw tables.
    #[must_use]
    pub const fn new(
        name: &'static str,
        dims: GroupDims,
        roles: &'static [&'static [u8]],
        appendix: &'static [&'static [u8]],
    ) -> Self {
        Self { name, dims, roles, appendix }
    }

    /// Role and appendix of the tile at `coord`.
    ///
    /// # Errors
    ///
    /// Returns an error for coordinates outside the table or unknown codes.
    pub fn lookup(&self, coord: TileCoord) -> Result<(Role, Appendix), TopologyError> {
        if !self.dims.contains(coord) {
            return Err(TopologyError::OutOfGroup { coord, dims: self.dims });
        }
        let (r, c) = (coord.row as usize, coord.col as usize);
        let code = *self
            .roles
            .get(r)
            .and_then(|row| row.get(c))
            .ok_or(TopologyError::Malformed { name: self.name })?;
        let extra = *self
            .appendix
            .get(r)
            .and_then(|row| row.get(c))
            .ok_or(TopologyError::Malformed { name: self.name })?;
        let role = Role::from_code(code).ok_or(TopologyError::UnknownRole { coord, code })?;
        Ok((role, Appendix(extra)))
    }

    /// Check that every table entry decodes and both tables have the
    /// declared shape.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let rows = self.dims.rows as usize;
        let cols = self.dims.cols as usize;
        let shaped = |t: &[&[u8]]| t.len() == rows && t.iter().all(|r| r.len() == cols);
        if !shaped(self.roles) || !shaped(self.appendix) {
            return Err(TopologyError::Malformed { name: self.name });
        }
        for coord in self.dims.coords() {
            self.lookup(coord)?;
        }
        Ok(())
    }

    /// Number of tiles holding `role`.
    #[must_use]
    pub fn count(&self, role: Role) -> usize {
        self.dims
            .coords()
            .filter(|&c| matches!(self.lookup(c), Ok((r, _)) if r == role))
            .count()
    }

    /// Human-readable rendering: one line per row, role glyph plus appendix
    /// in hex.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for row in 0..self.dims.rows {
            let line: Vec<String> = (0..self.dims.cols)
                .map(|col| match self.lookup(TileCoord::new(row, col)) {
                    Ok((role, Appendix(a))) => format!("{}{:x}", role.glyph(), a),
                    Err(_) => "??".to_string(),
                })
                .collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out
    }
}

/// A systolic convolution variant: a role map plus the filter and output
/// geometry it was laid out for.
#[derive(Debug, Clone, Copy)]
pub struct EyerissVariant {
    /// Role assignment.
    pub map: RoleMap,
    /// Filter height (compute columns per array).
    pub filter_rows: usize,
    /// Output rows produced (compute rows across all arrays).
    pub output_rows: usize,
}

impl EyerissVariant {
    /// Two 6×5 arrays on an 8×16 group, LeNet-5 conv-1 (5×5 filters),
    /// output rows 0–11.
    pub const LENET_5X6X2: Self = Self {
        map: RoleMap::new(
            "eyeriss-5x6x2-lenet",
            GroupDims::GROUP_8X16,
            &[
                &[0, 0, 1, 1, 1, 1, 1, 0, 0, 0, 1, 1, 1, 1, 1, 0],
                &[0, 2, 2, 2, 2, 2, 0, 0, 0, 2, 2, 2, 2, 2, 0, 0],
                &[3, 2, 4, 4, 4, 4, 4, 5, 3, 2, 4, 4, 4, 4, 4, 5],
                &[3, 2, 4, 4, 4, 4, 4, 5, 3, 2, 4, 4, 4, 4, 4, 5],
                &[3, 2, 4, 4, 4, 4, 4, 5, 3, 2, 4, 4, 4, 4, 4, 5],
                &[3, 2, 4, 4, 4, 4, 4, 5, 3, 2, 4, 4, 4, 4, 4, 5],
                &[3, 2, 4, 4, 4, 4, 4, 5, 3, 2, 4, 4, 4, 4, 4, 5],
                &[3, 0, 4, 4, 4, 4, 4, 5, 3, 0, 4, 4, 4, 4, 4, 5],
            ],
            &[
                &[0, 0, 4, 3, 2, 1, 0, 0, 0, 0, 4, 3, 2, 1, 0, 0],
                &[0, 4, 3, 2, 1, 0, 0, 0, 0, 10, 9, 8, 7, 6, 0, 0],
                &[0, 5, 0xc, 8, 8, 8, 0xa, 0, 6, 11, 0xc, 8, 8, 8, 0xa, 6],
                &[1, 6, 4, 0, 0, 0, 2, 1, 7, 12, 4, 0, 0, 0, 2, 7],
                &[2, 7, 4, 0, 0, 0, 2, 2, 8, 13, 4, 0, 0, 0, 2, 8],
                &[3, 8, 4, 0, 0, 0, 2, 3, 9, 14, 4, 0, 0, 0, 2, 9],
                &[4, 9, 4, 0, 0, 0, 2, 4, 10, 15, 4, 0, 0, 0, 2, 10],
                &[5, 0, 7, 3, 3, 3, 3, 5, 11, 0, 7, 3, 3, 3, 3, 11],
            ],
        ),
        filter_rows: 5,
        output_rows: 12,
    };

    /// One 3×3 array on a 5×6 group (3-row filters, 3 output rows).
    pub const EYERISS_3X3: Self = Self {
        map: RoleMap::new(
            "eyeriss-3x3",
            GroupDims::new(5, 6),
            &[
                &[0, 0, 1, 1, 1, 0],
                &[0, 2, 2, 2, 0, 0],
                &[3, 2, 4, 4, 4, 5],
                &[3, 2, 4, 4, 4, 5],
                &[3, 0, 4, 4, 4, 5],
            ],
            &[
                &[0, 0, 2, 1, 0, 0],
                &[0, 2, 1, 0, 0, 0],
                &[0, 3, 0xc, 8, 0xa, 0],
                &[1, 4, 4, 0, 2, 1],
                &[2, 0, 7, 3, 3, 2],
            ],
        ),
        filter_rows: 3,
        output_rows: 3,
    };

    /// A single processing element on a 3×4 group (1-row filters, one
    /// output row). Smallest layout that still exercises every role.
    pub const EYERISS_1X1: Self = Self {
        map: RoleMap::new(
            "eyeriss-1x1",
            GroupDims::new(3, 4),
            &[
                &[0, 0, 1, 0],
                &[0, 2, 0, 0],
                &[3, 0, 4, 5],
            ],
            &[
                &[0, 0, 0, 0],
                &[0, 0, 0, 0],
                &[0, 0, 0xf, 0],
            ],
        ),
        filter_rows: 1,
        output_rows: 1,
    };

    /// Built-in variants.
    pub const ALL: [Self; 3] = [Self::LENET_5X6X2, Self::EYERISS_3X3, Self::EYERISS_1X1];

    /// Variant name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.map.name
    }

    /// Input rows the variant reads (`output_rows + filter_rows - 1`).
    #[must_use]
    pub const fn input_rows(&self) -> usize {
        self.output_rows + self.filter_rows - 1
    }

    /// Look a variant up by name.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_maps_are_total() {
        for variant in EyerissVariant::ALL {
            variant.map.validate().unwrap();
            for coord in variant.map.dims.coords() {
                let (role, _) = variant.map.lookup(coord).unwrap();
                assert!(Role::ALL.contains(&role));
            }
        }
    }

    #[test]
    fn lenet_census() {
        let map = EyerissVariant::LENET_5X6X2.map;
        assert_eq!(map.count(Role::Compute), 60);
        assert_eq!(map.count(Role::FilterFeed), 10);
        assert_eq!(map.count(Role::InputFeed), 20);
        assert_eq!(map.count(Role::PsumFeed), 12);
        assert_eq!(map.count(Role::WriteBack), 12);
        assert_eq!(map.count(Role::Idle), 128 - 60 - 10 - 20 - 12 - 12);
    }

    #[test]
    fn compute_tiles_match_output_geometry() {
        for v in EyerissVariant::ALL {
            assert_eq!(v.map.count(Role::Compute), v.filter_rows * v.output_rows);
            assert_eq!(v.map.count(Role::WriteBack), v.output_rows);
        }
    }

    #[test]
    fn out_of_group_lookup_fails() {
        let map = EyerissVariant::EYERISS_1X1.map;
        let err = map.lookup(TileCoord::new(3, 0)).unwrap_err();
        assert!(matches!(err, TopologyError::OutOfGroup { .. }));
    }

    #[test]
    fn unknown_code_is_reported() {
        static BAD: RoleMap = RoleMap::new("bad", GroupDims::new(1, 2), &[&[0, 9]], &[&[0, 0]]);
        let err = BAD.validate().unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnknownRole { coord: TileCoord::new(0, 1), code: 9 }
        );
    }

    #[test]
    fn ragged_table_is_malformed() {
        static RAGGED: RoleMap = RoleMap::new("ragged", GroupDims::new(2, 2), &[&[0, 0], &[0]], &[&[0, 0], &[0, 0]]);
        assert_eq!(RAGGED.validate(), Err(TopologyError::Malformed { name: "ragged" }));
    }

    #[test]
    fn render_shows_glyphs() {
        let text = EyerissVariant::EYERISS_1X1.map.render();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(2).unwrap().starts_with("P0 .0 Cf W0"));
    }

    #[test]
    fn by_name() {
        assert!(EyerissVariant::by_name("eyeriss-3x3").is_some());
        assert!(EyerissVariant::by_name("nope").is_none());
        assert_eq!(EyerissVariant::LENET_5X6X2.input_rows(), 16);
    }
}
