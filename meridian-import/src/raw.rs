//! # Import scratch files
//!
//! The pipeline starts from raw entities spooled into scratch files:
//! `rawnodes.dat`, `rawways.dat` (+ id index), `rawrels.dat` (+ id index)
//! and the coordinate store `coord.dat` (+ id index). Tag keys are
//! registered into the type config while spooling, so the scratch records
//! carry compact tag ids.

use crate::ImportError;
use meridian_db::geom::{GeoCoord, Point};
use meridian_db::io::{AccessMode, FileScanner, FileWriter};
use meridian_db::store::IdIndex;
use meridian_db::types::{TagMap, TypeConfig};
use meridian_db::Id;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const RAW_NODES_DAT: &str = "rawnodes.dat";
pub const RAW_WAYS_DAT: &str = "rawways.dat";
pub const RAW_WAYS_IDX: &str = "rawway.idx";
pub const RAW_RELS_DAT: &str = "rawrels.dat";
pub const RAW_RELS_IDX: &str = "rawrel.idx";
pub const COORD_DAT: &str = "coord.dat";
pub const COORD_IDX: &str = "coord.idx";

#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: Id,
    pub coord: GeoCoord,
    pub tags: TagMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawWay {
    pub id: Id,
    pub node_ids: Vec<Id>,
    pub tags: TagMap,
}

impl RawWay {
    /// A raw way is closed iff its first and last node id coincide (the
    /// duplicate endpoint *is* stored in raw data).
    pub fn is_closed(&self) -> bool {
        self.node_ids.len() >= 4 && self.node_ids.first() == self.node_ids.last()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub member_type: MemberType,
    pub id: Id,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRelation {
    pub id: Id,
    pub members: Vec<Member>,
    pub tags: TagMap,
}

fn write_tags(writer: &mut FileWriter, tags: &TagMap) -> Result<(), ImportError> {
    writer.write_number(tags.len() as u64)?;
    let mut sorted: Vec<_> = tags.iter().collect();
    sorted.sort_by_key(|(id, _)| **id);
    for (id, value) in sorted {
        writer.write_number(u64::from(*id))?;
        writer.write_string(value)?;
    }
    Ok(())
}

fn read_tags(scanner: &mut FileScanner) -> Result<TagMap, ImportError> {
    let count = scanner.read_number()?;
    let mut tags = TagMap::with_capacity(count as usize);
    for _ in 0..count {
        let id = scanner.read_number()? as u16;
        let value = scanner.read_string()?;
        tags.insert(id, value);
    }
    Ok(tags)
}

impl RawNode {
    fn write(&self, writer: &mut FileWriter) -> Result<(), ImportError> {
        writer.write_number(self.id)?;
        writer.write_coord(&self.coord)?;
        write_tags(writer, &self.tags)
    }

    pub fn read(scanner: &mut FileScanner) -> Result<Self, ImportError> {
        let id = scanner.read_number()?;
        let coord = scanner.read_coord()?;
        let tags = read_tags(scanner)?;
        Ok(Self { id, coord, tags })
    }
}

impl RawWay {
    fn write(&self, writer: &mut FileWriter) -> Result<(), ImportError> {
        writer.write_number(self.id)?;
        writer.write_number(self.node_ids.len() as u64)?;
        for node_id in &self.node_ids {
            writer.write_number(*node_id)?;
        }
        write_tags(writer, &self.tags)
    }

    pub fn read(scanner: &mut FileScanner) -> Result<Self, ImportError> {
        let id = scanner.read_number()?;
        let count = scanner.read_number()?;
        let node_ids = (0..count)
            .map(|_| scanner.read_number())
            .collect::<Result<Vec<_>, _>>()?;
        let tags = read_tags(scanner)?;
        Ok(Self { id, node_ids, tags })
    }
}

impl RawRelation {
    fn write(&self, writer: &mut FileWriter) -> Result<(), ImportError> {
        writer.write_number(self.id)?;
        writer.write_number(self.members.len() as u64)?;
        for member in &self.members {
            let raw = match member.member_type {
                MemberType::Node => 0u8,
                MemberType::Way => 1,
                MemberType::Relation => 2,
            };
            writer.write_u8(raw)?;
            writer.write_number(member.id)?;
            writer.write_string(&member.role)?;
        }
        write_tags(writer, &self.tags)
    }

    pub fn read(scanner: &mut FileScanner) -> Result<Self, ImportError> {
        let id = scanner.read_number()?;
        let count = scanner.read_number()?;
        let members = (0..count)
            .map(|_| {
                let raw = scanner.read_u8()?;
                let member_type = match raw {
                    0 => MemberType::Node,
                    1 => MemberType::Way,
                    _ => MemberType::Relation,
                };
                let id = scanner.read_number()?;
                let role = scanner.read_string()?;
                Ok(Member {
                    member_type,
                    id,
                    role,
                })
            })
            .collect::<Result<Vec<_>, ImportError>>()?;
        let tags = read_tags(scanner)?;
        Ok(Self { id, members, tags })
    }
}

/// Spools raw entities into the scratch files, registering tag keys into the
/// type config as it goes.
pub struct ScratchWriter<'a> {
    directory: PathBuf,
    config: &'a mut TypeConfig,
    nodes: Vec<RawNode>,
    ways: Vec<RawWay>,
    relations: Vec<RawRelation>,
}

impl<'a> ScratchWriter<'a> {
    pub fn new(directory: impl AsRef<Path>, config: &'a mut TypeConfig) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            config,
            nodes: Vec::new(),
            ways: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn add_node(&mut self, id: Id, lat: f64, lon: f64, tags: &[(&str, &str)]) {
        let tags = self.config.tag_map_from_pairs(tags.iter().copied());
        self.nodes.push(RawNode {
            id,
            coord: GeoCoord::new(lat, lon),
            tags,
        });
    }

    pub fn add_way(&mut self, id: Id, node_ids: &[Id], tags: &[(&str, &str)]) {
        let tags = self.config.tag_map_from_pairs(tags.iter().copied());
        self.ways.push(RawWay {
            id,
            node_ids: node_ids.to_vec(),
            tags,
        });
    }

    pub fn add_relation(&mut self, id: Id, members: &[(MemberType, Id, &str)], tags: &[(&str, &str)]) {
        let tags = self.config.tag_map_from_pairs(tags.iter().copied());
        self.relations.push(RawRelation {
            id,
            members: members
                .iter()
                .map(|(member_type, id, role)| Member {
                    member_type: *member_type,
                    id: *id,
                    role: (*role).to_string(),
                })
                .collect(),
            tags,
        });
    }

    /// Writes all scratch files.
    pub fn finish(self) -> Result<(), ImportError> {
        let dir = &self.directory;

        let mut writer = FileWriter::open(dir.join(RAW_NODES_DAT))?;
        writer.write_u32(self.nodes.len() as u32)?;
        for node in &self.nodes {
            node.write(&mut writer)?;
        }
        writer.close()?;

        let mut coord_writer = FileWriter::open(dir.join(COORD_DAT))?;
        let mut coord_index = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            coord_index.push((node.id, coord_writer.pos()));
            coord_writer.write_number(node.id)?;
            coord_writer.write_coord(&node.coord)?;
        }
        coord_writer.close()?;
        IdIndex::build(dir.join(COORD_IDX), coord_index)?;

        let mut writer = FileWriter::open(dir.join(RAW_WAYS_DAT))?;
        writer.write_u32(self.ways.len() as u32)?;
        let mut way_index = Vec::with_capacity(self.ways.len());
        for way in &self.ways {
            way_index.push((way.id, writer.pos()));
            way.write(&mut writer)?;
        }
        writer.close()?;
        IdIndex::build(dir.join(RAW_WAYS_IDX), way_index)?;

        let mut writer = FileWriter::open(dir.join(RAW_RELS_DAT))?;
        writer.write_u32(self.relations.len() as u32)?;
        let mut rel_index = Vec::with_capacity(self.relations.len());
        for relation in &self.relations {
            rel_index.push((relation.id, writer.pos()));
            relation.write(&mut writer)?;
        }
        writer.close()?;
        IdIndex::build(dir.join(RAW_RELS_IDX), rel_index)?;

        Ok(())
    }
}

/// Random access to the coordinate scratch store.
pub struct CoordStore {
    scanner: FileScanner,
    index: IdIndex,
}

impl CoordStore {
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, ImportError> {
        let dir = directory.as_ref();
        Ok(Self {
            scanner: FileScanner::open(dir.join(COORD_DAT), AccessMode::FastRandom, true)?,
            index: IdIndex::open(dir.join(COORD_IDX))?,
        })
    }

    pub fn get(&mut self, id: Id) -> Result<Option<Point>, ImportError> {
        let Some(offset) = self.index.offset_of(id)? else {
            return Ok(None);
        };
        self.scanner.set_pos(offset)?;
        let id = self.scanner.read_number()?;
        let coord = self.scanner.read_coord()?;
        Ok(Some(Point::new(id, coord)))
    }

    /// Resolves a set of node ids into a map; missing ids are absent.
    pub fn get_all(
        &mut self,
        ids: impl IntoIterator<Item = Id>,
    ) -> Result<HashMap<Id, Point>, ImportError> {
        let mut result = HashMap::new();
        for id in ids {
            if let Some(point) = self.get(id)? {
                result.insert(id, point);
            }
        }
        Ok(result)
    }
}

/// Random access to a raw entity file through its id index.
pub struct RawStore<T> {
    scanner: FileScanner,
    index: IdIndex,
    read: fn(&mut FileScanner) -> Result<T, ImportError>,
}

impl<T> RawStore<T> {
    fn open(
        directory: &Path,
        data_file: &str,
        index_file: &str,
        read: fn(&mut FileScanner) -> Result<T, ImportError>,
    ) -> Result<Self, ImportError> {
        Ok(Self {
            scanner: FileScanner::open(directory.join(data_file), AccessMode::FastRandom, true)?,
            index: IdIndex::open(directory.join(index_file))?,
            read,
        })
    }

    pub fn get(&mut self, id: Id) -> Result<Option<T>, ImportError> {
        let Some(offset) = self.index.offset_of(id)? else {
            return Ok(None);
        };
        self.scanner.set_pos(offset)?;
        Ok(Some((self.read)(&mut self.scanner)?))
    }
}

pub type RawWayStore = RawStore<RawWay>;
pub type RawRelationStore = RawStore<RawRelation>;

pub fn open_raw_way_store(directory: impl AsRef<Path>) -> Result<RawWayStore, ImportError> {
    RawStore::open(directory.as_ref(), RAW_WAYS_DAT, RAW_WAYS_IDX, RawWay::read)
}

pub fn open_raw_relation_store(
    directory: impl AsRef<Path>,
) -> Result<RawRelationStore, ImportError> {
    RawStore::open(directory.as_ref(), RAW_RELS_DAT, RAW_RELS_IDX, RawRelation::read)
}

/// Sequential pass over one of the counted scratch files.
pub struct SequentialReader {
    scanner: FileScanner,
    count: u32,
    read_so_far: u32,
}

impl SequentialReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let mut scanner = FileScanner::open(path, AccessMode::Sequential, false)?;
        let count = scanner.read_u32()?;
        Ok(Self {
            scanner,
            count,
            read_so_far: 0,
        })
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    pub fn next_record<T>(
        &mut self,
        read: fn(&mut FileScanner) -> Result<T, ImportError>,
    ) -> Result<Option<T>, ImportError> {
        if self.read_so_far >= self.count {
            return Ok(None);
        }
        self.read_so_far += 1;
        read(&mut self.scanner).map(Some)
    }
}

/// Reads the way blacklist written by the relation resolver.
pub fn read_blacklist(path: impl AsRef<Path>) -> Result<HashSet<Id>, ImportError> {
    let mut scanner = FileScanner::open(path, AccessMode::Sequential, false)?;
    let mut result = HashSet::new();
    while scanner.pos() < scanner.len() {
        result.insert(scanner.read_number()?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TypeConfig::new();

        let mut scratch = ScratchWriter::new(dir.path(), &mut config);
        scratch.add_node(1, 50.0, 7.0, &[("amenity", "fountain")]);
        scratch.add_node(2, 50.1, 7.1, &[]);
        scratch.add_way(10, &[1, 2], &[("highway", "residential")]);
        scratch.add_relation(
            20,
            &[(MemberType::Way, 10, "outer")],
            &[("type", "multipolygon")],
        );
        scratch.finish().unwrap();

        let mut coords = CoordStore::open(dir.path()).unwrap();
        let point = coords.get(1).unwrap().unwrap();
        assert_eq!(point.id, 1);
        assert!((point.coord.lat() - 50.0).abs() < 1e-7);
        assert!(coords.get(99).unwrap().is_none());

        let mut ways = open_raw_way_store(dir.path()).unwrap();
        let way = ways.get(10).unwrap().unwrap();
        assert_eq!(way.node_ids, vec![1, 2]);
        assert!(!way.is_closed());
        let highway = config.tag_id("highway").unwrap();
        assert_eq!(way.tags.get(&highway).map(String::as_str), Some("residential"));

        let mut relations = open_raw_relation_store(dir.path()).unwrap();
        let relation = relations.get(20).unwrap().unwrap();
        assert_eq!(relation.members.len(), 1);
        assert_eq!(relation.members[0].role, "outer");

        let mut reader = SequentialReader::open(dir.path().join(RAW_NODES_DAT)).unwrap();
        assert_eq!(reader.count(), 2);
        let mut seen = 0;
        while let Some(_node) = reader.next_record(RawNode::read).unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }
}
