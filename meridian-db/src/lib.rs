//! # Meridian database core
//!
//! A compact, offline map database derived from OpenStreetMap data.
//! Objects (nodes, ways, areas) carry a typed attribute record
//! ([`types::FeatureValueBuffer`]) whose layout is defined once per
//! [`types::TypeConfig`], and are addressed by their byte offset within the
//! object stores. Spatial queries go through tiled bitmap indices
//! ([`area_index::AreaIndex`], [`low_zoom::LowZoomIndex`]); the routing graph
//! lives in a separate route-node store ([`route_node::RouteNodeStore`]).

pub mod area_index;
pub mod database;
pub mod geom;
pub mod io;
pub mod location;
pub mod low_zoom;
pub mod objects;
pub mod progress;
pub mod route_node;
pub mod store;
pub mod tile;
pub mod types;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};

pub use database::{Database, DatabaseParameter};
pub use geom::{GeoBox, GeoCoord, Point};
pub use types::{FeatureValueBuffer, TypeConfig, TypeInfo};

/// Serial identifier of an imported OSM entity (node serial in ring assembly,
/// junction id in the routing graph).
pub type Id = u64;

/// Byte offset into a named database file; the stable object handle.
pub type FileOffset = u64;

/// The kind of object a [`ObjectFileRef`] points at.
#[repr(u8)]
#[derive(
    TryFromPrimitive, IntoPrimitive, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub enum RefType {
    Node = 0,
    Way = 1,
    Area = 2,
}

impl RefType {
    pub const fn name(self) -> &'static str {
        match self {
            RefType::Node => "node",
            RefType::Way => "way",
            RefType::Area => "area",
        }
    }
}

/// A stable cross-file pointer: which store, and where in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectFileRef {
    ref_type: RefType,
    offset: FileOffset,
}

impl ObjectFileRef {
    #[inline]
    pub const fn new(ref_type: RefType, offset: FileOffset) -> Self {
        Self { ref_type, offset }
    }

    #[inline]
    pub const fn ref_type(&self) -> RefType {
        self.ref_type
    }

    #[inline]
    pub const fn offset(&self) -> FileOffset {
        self.offset
    }

    pub const fn is_way(&self) -> bool {
        matches!(self.ref_type, RefType::Way)
    }

    pub const fn is_area(&self) -> bool {
        matches!(self.ref_type, RefType::Area)
    }
}

impl Display for ObjectFileRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ref_type.name(), self.offset)
    }
}

/// The kind of raw OSM entity an [`ObjectOsmRef`] points at.
///
/// Unlike [`RefType`] this refers to entities of the *input* data model,
/// which has relations instead of assembled areas.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OsmRefType {
    Node,
    Way,
    Relation,
}

impl OsmRefType {
    pub const fn name(self) -> &'static str {
        match self {
            OsmRefType::Node => "node",
            OsmRefType::Way => "way",
            OsmRefType::Relation => "relation",
        }
    }
}

/// Reference to a raw OSM entity, used for diagnostics during import.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObjectOsmRef {
    pub id: u64,
    pub ref_type: OsmRefType,
}

impl ObjectOsmRef {
    pub const fn new(id: u64, ref_type: OsmRefType) -> Self {
        Self { id, ref_type }
    }
}

impl Display for ObjectOsmRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ref_type.name(), self.id)
    }
}

/// Travel mode used by access evaluation and routing profiles.
#[repr(u8)]
#[derive(TryFromPrimitive, IntoPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Vehicle {
    Foot = 0,
    Bicycle = 1,
    Car = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_file_ref_display() {
        let r = ObjectFileRef::new(RefType::Way, 42);
        assert_eq!(r.to_string(), "way 42");
        assert!(r.is_way());
        assert!(!r.is_area());
    }

    #[test]
    fn ref_type_from_byte() {
        assert_eq!(RefType::try_from(2u8), Ok(RefType::Area));
        assert!(RefType::try_from(3u8).is_err());
    }
}
