//! # Route-node store
//!
//! The persistent routing graph: one record per junction, carrying the
//! incident objects, the outgoing paths (with target offset, distance and
//! encoded access) and the forbidden turns. Built offline during import,
//! read-only at query time.

use crate::geom::GeoCoord;
use crate::io::{FileScanner, FileWriter};
use crate::objects::ObjectError;
use crate::store::{IndexedDataFile, StoredObject};
use crate::types::{AccessFlag, TypeConfig, TypeId, ACCESS_BICYCLE, ACCESS_CAR, ACCESS_FOOT};
use crate::{FileOffset, Id, ObjectFileRef, RefType, Vehicle};
use enumset::EnumSet;

pub const ROUTE_DAT: &str = "route.dat";
pub const ROUTE_IDX: &str = "route.idx";

/// Outgoing edge of a route node.
///
/// The target offset is stored with a fixed width so that record sizes do
/// not depend on the final file layout; the import pipeline lays out all
/// records first and patches the targets in a second pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteNodePath {
    pub target_offset: FileOffset,
    pub target_coord: GeoCoord,
    /// Index into the owning node's object list naming the traversed object.
    pub object_index: u8,
    /// Route-type id of the traversed object.
    pub type_id: TypeId,
    /// Speed limit along the path in km/h; 0 when unset.
    pub max_speed: u8,
    /// Surface grade 1..=5; 0 when unset.
    pub grade: u8,
    pub distance_m: f64,
    pub access: EnumSet<AccessFlag>,
}

impl RouteNodePath {
    /// Whether any mode may travel this path at all.
    pub fn has_access(&self) -> bool {
        !((ACCESS_FOOT | ACCESS_BICYCLE | ACCESS_CAR) & self.access).is_empty()
    }

    pub fn can_use(&self, vehicle: Vehicle) -> bool {
        let forward = match vehicle {
            Vehicle::Foot => AccessFlag::FootForward,
            Vehicle::Bicycle => AccessFlag::BicycleForward,
            Vehicle::Car => AccessFlag::CarForward,
        };
        self.access.contains(forward)
    }
}

/// A forbidden turn: arriving over `source`, the path at `target_index` may
/// not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteNodeExclude {
    pub source: ObjectFileRef,
    pub target_index: u8,
}

/// Persistent adjacency entry of the routing graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteNode {
    file_offset: FileOffset,
    pub id: Id,
    pub coord: GeoCoord,
    pub objects: Vec<ObjectFileRef>,
    pub paths: Vec<RouteNodePath>,
    pub excludes: Vec<RouteNodeExclude>,
}

impl RouteNode {
    pub fn new(id: Id, coord: GeoCoord) -> Self {
        Self {
            file_offset: 0,
            id,
            coord,
            objects: Vec::new(),
            paths: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub const fn file_offset(&self) -> FileOffset {
        self.file_offset
    }

    /// Index of `object` in the object list, adding it if new.
    pub fn ensure_object(&mut self, object: ObjectFileRef) -> u8 {
        if let Some(index) = self.objects.iter().position(|o| *o == object) {
            return index as u8;
        }
        debug_assert!(self.objects.len() < 256);
        self.objects.push(object);
        (self.objects.len() - 1) as u8
    }

    /// Whether the turn from `source` into path `target_index` is forbidden.
    pub fn is_excluded(&self, source: ObjectFileRef, target_index: usize) -> bool {
        self.excludes
            .iter()
            .any(|e| e.source == source && usize::from(e.target_index) == target_index)
    }

    pub fn read(scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        let file_offset = scanner.pos();

        let id = scanner.read_number()?;
        let coord = scanner.read_coord()?;

        let object_count = scanner.read_number()?;
        let objects = (0..object_count)
            .map(|_| read_object_ref(scanner))
            .collect::<Result<Vec<_>, _>>()?;

        let path_count = scanner.read_number()?;
        let paths = (0..path_count)
            .map(|_| {
                let target_offset = scanner.read_file_offset()?;
                let target_coord = scanner.read_coord()?;
                let object_index = scanner.read_u8()?;
                let type_id = scanner.read_u16()?;
                let max_speed = scanner.read_u8()?;
                let grade = scanner.read_u8()?;
                let distance_m = scanner.read_f64()?;
                let access = EnumSet::from_repr(scanner.read_u8()?);

                Ok(RouteNodePath {
                    target_offset,
                    target_coord,
                    object_index,
                    type_id,
                    max_speed,
                    grade,
                    distance_m,
                    access,
                })
            })
            .collect::<Result<Vec<_>, ObjectError>>()?;

        let exclude_count = scanner.read_number()?;
        let excludes = (0..exclude_count)
            .map(|_| {
                let source = read_object_ref(scanner)?;
                let target_index = scanner.read_u8()?;
                Ok(RouteNodeExclude {
                    source,
                    target_index,
                })
            })
            .collect::<Result<Vec<_>, ObjectError>>()?;

        Ok(Self {
            file_offset,
            id,
            coord,
            objects,
            paths,
            excludes,
        })
    }

    pub fn write(&self, writer: &mut FileWriter) -> Result<(), ObjectError> {
        writer.write_number(self.id)?;
        writer.write_coord(&self.coord)?;

        writer.write_number(self.objects.len() as u64)?;
        for object in &self.objects {
            write_object_ref(writer, *object)?;
        }

        writer.write_number(self.paths.len() as u64)?;
        for path in &self.paths {
            writer.write_file_offset(path.target_offset)?;
            writer.write_coord(&path.target_coord)?;
            writer.write_u8(path.object_index)?;
            writer.write_u16(path.type_id)?;
            writer.write_u8(path.max_speed)?;
            writer.write_u8(path.grade)?;
            writer.write_f64(path.distance_m)?;
            writer.write_u8(path.access.as_repr())?;
        }

        writer.write_number(self.excludes.len() as u64)?;
        for exclude in &self.excludes {
            write_object_ref(writer, exclude.source)?;
            writer.write_u8(exclude.target_index)?;
        }

        Ok(())
    }
}

fn read_object_ref(scanner: &mut FileScanner) -> Result<ObjectFileRef, ObjectError> {
    let offset = scanner.pos();
    let raw = scanner.read_u8()?;
    let ref_type = RefType::try_from(raw).map_err(|_| ObjectError::UnknownType {
        kind: "object ref",
        id: u64::from(raw),
        offset,
    })?;
    let file_offset = scanner.read_number()?;
    Ok(ObjectFileRef::new(ref_type, file_offset))
}

fn write_object_ref(writer: &mut FileWriter, object: ObjectFileRef) -> Result<(), ObjectError> {
    writer.write_u8(object.ref_type().into())?;
    writer.write_number(object.offset())?;
    Ok(())
}

impl StoredObject for RouteNode {
    fn read_record(_config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        RouteNode::read(scanner)
    }
}

/// `route.dat` plus the id index `route.idx`.
pub type RouteNodeStore = IndexedDataFile<RouteNode>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AccessMode;
    use crate::types::ACCESS_CAR;

    #[test]
    fn route_node_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ROUTE_DAT);

        let mut node = RouteNode::new(42, GeoCoord::new(50.0, 7.0));
        let way = ObjectFileRef::new(RefType::Way, 1234);
        let object_index = node.ensure_object(way);
        assert_eq!(object_index, 0);
        assert_eq!(node.ensure_object(way), 0, "objects are deduplicated");

        node.paths.push(RouteNodePath {
            target_offset: 9876,
            target_coord: GeoCoord::new(50.01, 7.01),
            object_index,
            type_id: 3,
            max_speed: 50,
            grade: 0,
            distance_m: 1337.5,
            access: ACCESS_CAR | AccessFlag::OnewayForward,
        });
        node.excludes.push(RouteNodeExclude {
            source: ObjectFileRef::new(RefType::Way, 777),
            target_index: 0,
        });

        let mut writer = FileWriter::open(&path).unwrap();
        node.write(&mut writer).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(&path, AccessMode::FastRandom, false).unwrap();
        let restored = RouteNode::read(&mut scanner).unwrap();

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.objects, node.objects);
        assert_eq!(restored.excludes, node.excludes);

        // Coordinates pass through the fixed-point codec, so compare with
        // its resolution in mind.
        assert_eq!(restored.paths.len(), 1);
        let (restored_path, original_path) = (&restored.paths[0], &node.paths[0]);
        assert_eq!(restored_path.target_offset, original_path.target_offset);
        assert_eq!(restored_path.object_index, original_path.object_index);
        assert_eq!(restored_path.type_id, original_path.type_id);
        assert_eq!(restored_path.max_speed, original_path.max_speed);
        assert_eq!(restored_path.distance_m, original_path.distance_m);
        assert_eq!(restored_path.access, original_path.access);
        assert!(
            (restored_path.target_coord.lat() - original_path.target_coord.lat()).abs() < 1e-7
        );
        assert!(restored.paths[0].has_access());
        assert!(restored.paths[0].can_use(Vehicle::Car));
        assert!(!restored.paths[0].can_use(Vehicle::Foot));
        assert!(restored.is_excluded(ObjectFileRef::new(RefType::Way, 777), 0));
        assert!(!restored.is_excluded(way, 0));
    }
}
