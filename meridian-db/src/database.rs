//! # Database facade
//!
//! Opens a database directory and wires together the type config, the
//! object stores and the spatial indices into one thread-safe, read-only
//! query surface.

use crate::area_index::{
    AREA_AREA_IDX, AREA_NODE_IDX, AREA_WAY_IDX, AreaIndex, IndexError,
};
use crate::geom::GeoBox;
use crate::io::{AccessMode, IoError};
use crate::location::{LOCATION_IDX, LocationError, LocationIndex};
use crate::low_zoom::{LowZoomIndex, WAYS_OPT_DAT};
use crate::objects::{Area, Node, Way};
use crate::store::{DataFile, StoreError};
use crate::tile::Magnification;
use crate::types::{TypeConfig, TypeConfigError, TypeId, TypeInfo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const NODES_DAT: &str = "nodes.dat";
pub const WAYS_DAT: &str = "ways.dat";
pub const AREAS_DAT: &str = "areas.dat";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    TypeConfig(#[from] TypeConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Location(#[from] LocationError),
}

/// Cache sizes and mapping behaviour, set at open time.
#[derive(Debug, Clone)]
pub struct DatabaseParameter {
    pub node_cache_size: usize,
    pub way_cache_size: usize,
    pub area_cache_size: usize,
    pub memory_mapped_data: bool,
    pub memory_mapped_index: bool,
}

impl Default for DatabaseParameter {
    fn default() -> Self {
        Self {
            node_cache_size: 1000,
            way_cache_size: 4000,
            area_cache_size: 2000,
            memory_mapped_data: true,
            memory_mapped_index: true,
        }
    }
}

/// The per-kind type ids a spatial query asks for.
#[derive(Debug, Clone, Default)]
pub struct TypeSet {
    pub node_types: Vec<TypeId>,
    pub way_types: Vec<TypeId>,
    pub area_types: Vec<TypeId>,
}

impl TypeSet {
    pub fn from_types<'a>(types: impl IntoIterator<Item = &'a Arc<TypeInfo>>) -> Self {
        let mut result = TypeSet::default();
        for info in types {
            if info.node_id() != 0 {
                result.node_types.push(info.node_id());
            }
            if info.way_id() != 0 {
                result.way_types.push(info.way_id());
            }
            if info.area_id() != 0 {
                result.area_types.push(info.area_id());
            }
        }
        result
    }
}

/// Objects materialised for a spatial query. Candidates are cell-accurate;
/// exact geometric filtering is up to the consumer.
#[derive(Debug, Default)]
pub struct MapData {
    pub nodes: Vec<Arc<Node>>,
    pub ways: Vec<Arc<Way>>,
    pub areas: Vec<Arc<Area>>,
}

pub struct Database {
    path: PathBuf,
    config: Arc<TypeConfig>,
    nodes: DataFile<Node>,
    ways: DataFile<Way>,
    areas: DataFile<Area>,
    area_node_index: AreaIndex,
    area_way_index: AreaIndex,
    area_area_index: AreaIndex,
    low_zoom: Option<LowZoomIndex>,
    location: Option<LocationIndex>,
}

impl Database {
    pub fn open(
        path: impl AsRef<Path>,
        parameter: &DatabaseParameter,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();

        let config = Arc::new(TypeConfig::load_from_data_file(&path)?);

        let nodes = DataFile::open(
            config.clone(),
            path.join(NODES_DAT),
            AccessMode::LowMemRandom,
            parameter.memory_mapped_data,
            parameter.node_cache_size,
        )?;
        let ways = DataFile::open(
            config.clone(),
            path.join(WAYS_DAT),
            AccessMode::LowMemRandom,
            parameter.memory_mapped_data,
            parameter.way_cache_size,
        )?;
        let areas = DataFile::open(
            config.clone(),
            path.join(AREAS_DAT),
            AccessMode::LowMemRandom,
            parameter.memory_mapped_data,
            parameter.area_cache_size,
        )?;

        let area_node_index =
            AreaIndex::open(path.join(AREA_NODE_IDX), parameter.memory_mapped_index)?;
        let area_way_index =
            AreaIndex::open(path.join(AREA_WAY_IDX), parameter.memory_mapped_index)?;
        let area_area_index =
            AreaIndex::open(path.join(AREA_AREA_IDX), parameter.memory_mapped_index)?;

        let low_zoom = if path.join(WAYS_OPT_DAT).is_file() {
            Some(LowZoomIndex::open(
                config.clone(),
                path.join(WAYS_OPT_DAT),
                parameter.memory_mapped_index,
            )?)
        } else {
            None
        };

        let location = if path.join(LOCATION_IDX).is_file() {
            Some(LocationIndex::open(&path)?)
        } else {
            None
        };

        Ok(Self {
            path,
            config,
            nodes,
            ways,
            areas,
            area_node_index,
            area_way_index,
            area_area_index,
            low_zoom,
            location,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_config(&self) -> &Arc<TypeConfig> {
        &self.config
    }

    pub fn nodes(&self) -> &DataFile<Node> {
        &self.nodes
    }

    pub fn ways(&self) -> &DataFile<Way> {
        &self.ways
    }

    pub fn areas(&self) -> &DataFile<Area> {
        &self.areas
    }

    pub fn location_index(&self) -> Option<&LocationIndex> {
        self.location.as_ref()
    }

    pub fn low_zoom_index(&self) -> Option<&LowZoomIndex> {
        self.low_zoom.as_ref()
    }

    /// Offsets of all ways of the given types touching `geo_box`.
    pub fn way_offsets(
        &self,
        types: &[TypeId],
        geo_box: &GeoBox,
    ) -> Result<BTreeSet<u64>, DatabaseError> {
        Ok(self.area_way_index.get_offsets(types, geo_box)?)
    }

    /// Loads all objects matching the type set within `geo_box`.
    pub fn get_objects(&self, types: &TypeSet, geo_box: &GeoBox) -> Result<MapData, DatabaseError> {
        let node_offsets = self.area_node_index.get_offsets(&types.node_types, geo_box)?;
        let way_offsets = self.area_way_index.get_offsets(&types.way_types, geo_box)?;
        let area_offsets = self.area_area_index.get_offsets(&types.area_types, geo_box)?;

        Ok(MapData {
            nodes: self.nodes.get_by_offsets(node_offsets)?,
            ways: self.ways.get_by_offsets(way_offsets)?,
            areas: self.areas.get_by_offsets(area_offsets)?,
        })
    }

    /// Loads pre-simplified ways for overview magnifications; falls back to
    /// the regular way index for types the optimised index cannot serve.
    pub fn get_ways_low_zoom(
        &self,
        magnification: Magnification,
        types: &[TypeId],
        geo_box: &GeoBox,
    ) -> Result<Vec<Way>, DatabaseError> {
        let (mut ways, covered) = match &self.low_zoom {
            Some(index) => index.get_ways(magnification, types, geo_box)?,
            None => (Vec::new(), BTreeSet::new()),
        };

        let remaining: Vec<TypeId> = types
            .iter()
            .copied()
            .filter(|t| !covered.contains(t))
            .collect();

        if !remaining.is_empty() {
            let offsets = self.area_way_index.get_offsets(&remaining, geo_box)?;
            for way in self.ways.get_by_offsets(offsets)? {
                ways.push(way.as_ref().clone());
            }
        }

        Ok(ways)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area_index::AreaIndexBuilder;
    use crate::geom::GeoCoord;
    use crate::io::FileWriter;
    use crate::types::{FeatureKind, FeatureValueBuffer, TypeInfo};
    use crate::{Point, Vehicle};

    fn write_minimal_database(dir: &Path) -> Arc<TypeConfig> {
        let mut config = TypeConfig::new();
        config
            .register_type(
                TypeInfo::new("highway_residential")
                    .with_way()
                    .with_route(Vehicle::Car)
                    .with_feature(FeatureKind::Name),
            )
            .unwrap();
        config.store_to_data_file(dir).unwrap();

        let info = config.type_by_name("highway_residential").unwrap();

        // One way; nodes.dat and areas.dat stay empty.
        FileWriter::open(dir.join(NODES_DAT)).unwrap().close().unwrap();
        FileWriter::open(dir.join(AREAS_DAT)).unwrap().close().unwrap();

        let way = Way::new(
            FeatureValueBuffer::new(info.clone()),
            vec![
                Point::new(1, GeoCoord::new(50.0, 7.0)),
                Point::new(2, GeoCoord::new(50.01, 7.01)),
            ],
        );
        let mut writer = FileWriter::open(dir.join(WAYS_DAT)).unwrap();
        let offset = writer.pos();
        way.write(&mut writer).unwrap();
        writer.close().unwrap();

        let mut builder = AreaIndexBuilder::new();
        builder.push_type(
            info.way_id(),
            14,
            crate::area_index::cells_for_objects(
                14,
                vec![(offset, way.bounding_box().unwrap())],
            ),
        );
        builder.write(dir.join(AREA_WAY_IDX)).unwrap();

        AreaIndexBuilder::new().write(dir.join(AREA_NODE_IDX)).unwrap();
        AreaIndexBuilder::new().write(dir.join(AREA_AREA_IDX)).unwrap();

        Arc::new(config)
    }

    #[test]
    fn open_and_query_a_minimal_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_minimal_database(dir.path());

        let database = Database::open(dir.path(), &DatabaseParameter::default()).unwrap();
        assert_eq!(
            database.type_config().types().len(),
            config.types().len()
        );

        let info = database
            .type_config()
            .type_by_name("highway_residential")
            .unwrap();

        let geo_box = GeoBox::new(GeoCoord::new(49.99, 6.99), GeoCoord::new(50.02, 7.02));
        let data = database
            .get_objects(&TypeSet::from_types([&info]), &geo_box)
            .unwrap();

        assert!(data.nodes.is_empty());
        assert!(data.areas.is_empty());
        assert_eq!(data.ways.len(), 1);
        assert_eq!(data.ways[0].nodes.len(), 2);

        // Missing optional indices must not break the open.
        assert!(database.low_zoom_index().is_none());
        assert!(database.location_index().is_none());

        // Low-zoom falls back to the regular index.
        let ways = database
            .get_ways_low_zoom(Magnification::new(6), &[info.way_id()], &geo_box)
            .unwrap();
        assert_eq!(ways.len(), 1);
    }
}
