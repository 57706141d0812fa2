//! # Stored map objects
//!
//! Nodes, ways and areas as they live in the object stores. Every record is
//! self-describing: a type id, the feature buffer, then the geometry.

use crate::geom::{GeoBox, GeoCoord, Point};
use crate::io::{FileScanner, FileWriter, IoError};
use crate::types::buffer::BufferError;
use crate::types::{FeatureValueBuffer, TypeConfig, TypeInfo};
use crate::{FileOffset, ObjectFileRef, RefType};
use bitfield_struct::bitfield;
use std::sync::Arc;
use thiserror::Error;

/// Ring depth of the synthetic master ring carrying the area-wide buffer.
pub const MASTER_RING_DEPTH: u8 = 0;
/// Ring depth of top-level outer rings. Deeper rings alternate inner/outer.
pub const OUTER_RING_DEPTH: u8 = 1;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("Unknown {kind} type id {id} at offset {offset}")]
    UnknownType {
        kind: &'static str,
        id: u64,
        offset: FileOffset,
    },
    #[error("A way needs at least 2 nodes, got {0}")]
    TooFewNodes(usize),
}

fn read_points(scanner: &mut FileScanner) -> Result<Vec<Point>, ObjectError> {
    let count = scanner.read_number()?;
    (0..count)
        .map(|_| {
            let id = scanner.read_number()?;
            let coord = scanner.read_coord()?;
            Ok(Point::new(id, coord))
        })
        .collect()
}

fn write_points(writer: &mut FileWriter, points: &[Point]) -> Result<(), IoError> {
    writer.write_number(points.len() as u64)?;
    for point in points {
        writer.write_number(point.id)?;
        writer.write_coord(&point.coord)?;
    }
    Ok(())
}

/// A point object with typed attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    file_offset: FileOffset,
    pub buffer: FeatureValueBuffer,
    pub coord: GeoCoord,
}

impl Node {
    pub fn new(buffer: FeatureValueBuffer, coord: GeoCoord) -> Self {
        Self {
            file_offset: 0,
            buffer,
            coord,
        }
    }

    pub const fn file_offset(&self) -> FileOffset {
        self.file_offset
    }

    pub const fn object_ref(&self) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Node, self.file_offset)
    }

    pub fn type_info(&self) -> &Arc<TypeInfo> {
        self.buffer.type_info()
    }

    pub fn read(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        let file_offset = scanner.pos();

        let type_id = scanner.read_number()?;
        let info = config
            .node_type_info(type_id as u16)
            .ok_or(ObjectError::UnknownType {
                kind: "node",
                id: type_id,
                offset: file_offset,
            })?;

        let mut buffer = FeatureValueBuffer::new(info);
        buffer.read(scanner, &mut [])?;
        let coord = scanner.read_coord()?;

        Ok(Self {
            file_offset,
            buffer,
            coord,
        })
    }

    pub fn write(&self, writer: &mut FileWriter) -> Result<(), ObjectError> {
        writer.write_number(u64::from(self.buffer.type_info().node_id()))?;
        self.buffer.write(writer, &[])?;
        writer.write_coord(&self.coord)?;
        Ok(())
    }
}

/// An open polyline object. Closed ways become areas during import; a way as
/// stored never repeats its start node.
#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    file_offset: FileOffset,
    pub buffer: FeatureValueBuffer,
    pub nodes: Vec<Point>,
}

impl Way {
    pub fn new(buffer: FeatureValueBuffer, nodes: Vec<Point>) -> Self {
        Self {
            file_offset: 0,
            buffer,
            nodes,
        }
    }

    pub const fn file_offset(&self) -> FileOffset {
        self.file_offset
    }

    pub const fn object_ref(&self) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Way, self.file_offset)
    }

    pub fn type_info(&self) -> &Arc<TypeInfo> {
        self.buffer.type_info()
    }

    /// A way closes iff its first and last node share their id.
    pub fn is_closed(&self) -> bool {
        self.nodes.len() >= 3
            && self.nodes.first().map(|p| p.id) == self.nodes.last().map(|p| p.id)
    }

    pub fn bounding_box(&self) -> Option<GeoBox> {
        GeoBox::bounding(self.nodes.iter().map(|p| p.coord))
    }

    /// Index of the first node carrying `id`, if any.
    pub fn node_index_of(&self, id: u64) -> Option<usize> {
        self.nodes.iter().position(|p| p.id == id)
    }

    pub fn read(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        let file_offset = scanner.pos();

        let type_id = scanner.read_number()?;
        let info = config
            .way_type_info(type_id as u16)
            .ok_or(ObjectError::UnknownType {
                kind: "way",
                id: type_id,
                offset: file_offset,
            })?;

        let mut buffer = FeatureValueBuffer::new(info);
        buffer.read(scanner, &mut [])?;

        let nodes = read_points(scanner)?;
        if nodes.len() < 2 {
            return Err(ObjectError::TooFewNodes(nodes.len()));
        }

        Ok(Self {
            file_offset,
            buffer,
            nodes,
        })
    }

    pub fn write(&self, writer: &mut FileWriter) -> Result<(), ObjectError> {
        if self.nodes.len() < 2 {
            return Err(ObjectError::TooFewNodes(self.nodes.len()));
        }

        writer.write_number(u64::from(self.buffer.type_info().way_id()))?;
        self.buffer.write(writer, &[])?;
        write_points(writer, &self.nodes)?;
        Ok(())
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
struct RingMeta {
    #[bits(1)]
    has_buffer: bool,
    #[bits(1)]
    has_original_type: bool,
    #[bits(6)]
    __: u8,
}

/// One ring of an area. Depth 0 is the synthetic master ring; outer rings
/// have odd depth, inner rings even depth.
#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    pub depth: u8,
    pub buffer: Option<FeatureValueBuffer>,
    /// When an inner ring was retyped to a clip region during import, the
    /// type it originally carried (kept for auditability).
    pub original_type: Option<String>,
    pub nodes: Vec<Point>,
}

impl Ring {
    pub fn new(depth: u8, buffer: Option<FeatureValueBuffer>, nodes: Vec<Point>) -> Self {
        Self {
            depth,
            buffer,
            original_type: None,
            nodes,
        }
    }

    pub const fn is_master(&self) -> bool {
        self.depth == MASTER_RING_DEPTH
    }

    pub const fn is_outer(&self) -> bool {
        self.depth % 2 == 1
    }

    pub fn bounding_box(&self) -> Option<GeoBox> {
        GeoBox::bounding(self.nodes.iter().map(|p| p.coord))
    }
}

/// A closed polygonal object: a master ring carrying the area-wide buffer
/// plus the hierarchically nested geometry rings.
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    file_offset: FileOffset,
    pub rings: Vec<Ring>,
}

impl Area {
    pub fn new(master_buffer: FeatureValueBuffer) -> Self {
        Self {
            file_offset: 0,
            rings: vec![Ring::new(MASTER_RING_DEPTH, Some(master_buffer), Vec::new())],
        }
    }

    pub const fn file_offset(&self) -> FileOffset {
        self.file_offset
    }

    pub const fn object_ref(&self) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Area, self.file_offset)
    }

    pub fn master(&self) -> &Ring {
        &self.rings[0]
    }

    pub fn master_buffer(&self) -> &FeatureValueBuffer {
        self.rings[0]
            .buffer
            .as_ref()
            .expect("master ring always carries the area buffer")
    }

    pub fn type_info(&self) -> &Arc<TypeInfo> {
        self.master_buffer().type_info()
    }

    pub fn push_ring(&mut self, ring: Ring) {
        debug_assert!(!ring.is_master(), "only one master ring per area");
        self.rings.push(ring);
    }

    /// Geometry rings, i.e. everything but the master ring.
    pub fn geometry_rings(&self) -> &[Ring] {
        &self.rings[1..]
    }

    pub fn bounding_box(&self) -> Option<GeoBox> {
        let mut result: Option<GeoBox> = None;
        for ring in self.geometry_rings().iter().filter(|r| r.is_outer()) {
            if let Some(ring_box) = ring.bounding_box() {
                match result.as_mut() {
                    Some(total) => total.include(&ring_box),
                    None => result = Some(ring_box),
                }
            }
        }
        result
    }

    pub fn read(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        let file_offset = scanner.pos();

        let read_typed_buffer =
            |scanner: &mut FileScanner| -> Result<FeatureValueBuffer, ObjectError> {
                let type_index = scanner.read_number()?;
                let info = config
                    .type_by_index(type_index as usize)
                    .ok_or(ObjectError::UnknownType {
                        kind: "area",
                        id: type_index,
                        offset: file_offset,
                    })?;
                let mut buffer = FeatureValueBuffer::new(info);
                buffer.read(scanner, &mut [])?;
                Ok(buffer)
            };

        let master_buffer = read_typed_buffer(scanner)?;
        let mut area = Area::new(master_buffer);
        area.file_offset = file_offset;

        let ring_count = scanner.read_number()?;
        for _ in 0..ring_count {
            let depth = scanner.read_u8()?;
            let meta = RingMeta::from_bits(scanner.read_u8()?);

            let buffer = if meta.has_buffer() {
                Some(read_typed_buffer(scanner)?)
            } else {
                None
            };
            let original_type = if meta.has_original_type() {
                Some(scanner.read_string()?)
            } else {
                None
            };
            let nodes = read_points(scanner)?;

            area.rings.push(Ring {
                depth,
                buffer,
                original_type,
                nodes,
            });
        }

        Ok(area)
    }

    pub fn write(&self, writer: &mut FileWriter) -> Result<(), ObjectError> {
        let write_typed_buffer =
            |writer: &mut FileWriter, buffer: &FeatureValueBuffer| -> Result<(), ObjectError> {
                writer.write_number(buffer.type_info().index() as u64)?;
                buffer.write(writer, &[])?;
                Ok(())
            };

        write_typed_buffer(writer, self.master_buffer())?;

        writer.write_number(self.geometry_rings().len() as u64)?;
        for ring in self.geometry_rings() {
            writer.write_u8(ring.depth)?;

            let meta = RingMeta::new()
                .with_has_buffer(ring.buffer.is_some())
                .with_has_original_type(ring.original_type.is_some());
            writer.write_u8(meta.into_bits())?;

            if let Some(buffer) = &ring.buffer {
                write_typed_buffer(writer, buffer)?;
            }
            if let Some(original_type) = &ring.original_type {
                writer.write_string(original_type)?;
            }
            write_points(writer, &ring.nodes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AccessMode;
    use crate::progress::SilentTagErrorReporter;
    use crate::types::{FeatureKind, TypeInfo};
    use crate::{ObjectOsmRef, OsmRefType, Vehicle};

    fn test_config() -> TypeConfig {
        let mut config = TypeConfig::new();
        config
            .register_type(
                TypeInfo::new("highway_residential")
                    .with_way()
                    .with_path()
                    .with_route(Vehicle::Car)
                    .with_feature(FeatureKind::Name)
                    .with_feature(FeatureKind::Access),
            )
            .unwrap();
        config
            .register_type(
                TypeInfo::new("amenity_fountain")
                    .with_node()
                    .with_feature(FeatureKind::Name),
            )
            .unwrap();
        config
            .register_type(
                TypeInfo::new("landuse_park")
                    .with_area()
                    .with_feature(FeatureKind::Name),
            )
            .unwrap();
        config
    }

    fn buffer_with_name(config: &mut TypeConfig, type_name: &str, name: &str) -> FeatureValueBuffer {
        let info = config.type_by_name(type_name).unwrap();
        let tags = config.tag_map_from_pairs([("name", name)]);
        let mut buffer = FeatureValueBuffer::new(info);
        buffer.parse(
            &SilentTagErrorReporter,
            config,
            &ObjectOsmRef::new(1, OsmRefType::Way),
            &tags,
        );
        buffer
    }

    fn points(coords: &[(u64, f64, f64)]) -> Vec<Point> {
        coords
            .iter()
            .map(|(id, lat, lon)| Point::new(*id, GeoCoord::new(*lat, *lon)))
            .collect()
    }

    /// Coordinates pass through the fixed-point codec, so node sequences are
    /// compared with its resolution in mind.
    fn assert_points_close(actual: &[Point], expected: &[Point]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_eq!(a.id, e.id);
            assert!((a.coord.lat() - e.coord.lat()).abs() < 1e-7);
            assert!((a.coord.lon() - e.coord.lon()).abs() < 1e-7);
        }
    }

    #[test]
    fn node_roundtrip() {
        let mut config = test_config();
        let buffer = buffer_with_name(&mut config, "amenity_fountain", "Alter Markt");
        let node = Node::new(buffer, GeoCoord::new(50.94, 6.96));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.dat");
        let mut writer = FileWriter::open(&path).unwrap();
        node.write(&mut writer).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false).unwrap();
        let restored = Node::read(&config, &mut scanner).unwrap();

        assert_eq!(restored.buffer, node.buffer);
        assert_eq!(restored.type_info().name(), "amenity_fountain");
        assert!((restored.coord.lat() - node.coord.lat()).abs() < 1e-7);
    }

    #[test]
    fn way_roundtrip_and_node_count_validation() {
        let mut config = test_config();
        let buffer = buffer_with_name(&mut config, "highway_residential", "Ringstraße");

        let two_nodes = Way::new(
            buffer.clone(),
            points(&[(1, 50.0, 7.0), (2, 50.001, 7.001)]),
        );
        let single_node = Way::new(buffer, points(&[(1, 50.0, 7.0)]));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ways.dat");
        let mut writer = FileWriter::open(&path).unwrap();
        two_nodes.write(&mut writer).unwrap();
        assert!(matches!(
            single_node.write(&mut writer),
            Err(ObjectError::TooFewNodes(1))
        ));
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false).unwrap();
        let restored = Way::read(&config, &mut scanner).unwrap();

        assert_points_close(&restored.nodes, &two_nodes.nodes);
        assert_eq!(restored.buffer, two_nodes.buffer);
        assert!(!restored.is_closed());
        assert_eq!(restored.node_index_of(2), Some(1));
    }

    #[test]
    fn area_roundtrip_with_nested_rings() {
        let mut config = test_config();
        let master = buffer_with_name(&mut config, "landuse_park", "Stadtgarten");

        let mut area = Area::new(master);
        area.push_ring(Ring::new(
            OUTER_RING_DEPTH,
            None,
            points(&[(1, 0.0, 0.0), (2, 0.0, 1.0), (3, 1.0, 1.0), (4, 1.0, 0.0)]),
        ));
        let mut inner = Ring::new(
            OUTER_RING_DEPTH + 1,
            None,
            points(&[(5, 0.2, 0.2), (6, 0.2, 0.8), (7, 0.8, 0.8), (8, 0.8, 0.2)]),
        );
        inner.original_type = Some("landuse_park".to_string());
        area.push_ring(inner);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("areas.dat");
        let mut writer = FileWriter::open(&path).unwrap();
        area.write(&mut writer).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false).unwrap();
        let restored = Area::read(&config, &mut scanner).unwrap();

        assert_eq!(restored.rings.len(), 3);
        assert_eq!(restored.type_info().name(), "landuse_park");
        assert!(restored.master().is_master());
        assert!(restored.rings[1].is_outer());
        assert!(!restored.rings[2].is_outer());
        assert_eq!(
            restored.rings[2].original_type.as_deref(),
            Some("landuse_park")
        );
        assert_points_close(&restored.rings[1].nodes, &area.rings[1].nodes);

        let bbox = restored.bounding_box().unwrap();
        assert!(bbox.contains(&GeoCoord::new(0.5, 0.5)));
    }
}
