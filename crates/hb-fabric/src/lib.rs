//! Static model of a manycore tile group.
//!
//! This crate has **no dependencies** and **no runtime state**: it describes
//! the shape of a tile group, the coordinate of every tile in it, the closed
//! set of roles a tile can play in a systolic kernel, and the compile-time
//! role-map tables that assign those roles.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`coord`] | Tile coordinates, group dimensions, bounded neighbour offsets |
//! | [`role`] | `Role` tag, `Appendix` refinement byte |
//! | [`topology`] | `RoleMap` tables and the built-in Eyeriss variants |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coord;
pub mod role;
pub mod topology;

pub use coord::{GroupDims, TileCoord};
pub use role::{Appendix, Role};
pub use topology::{EyerissVariant, RoleMap, TopologyError};
