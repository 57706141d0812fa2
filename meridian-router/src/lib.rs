//! # Meridian router
//!
//! A*-based shortest-path search over the persistent route-node graph,
//! producing a [`RouteData`] that resolves back into object geometry and a
//! [`description::RouteDescription`] enriched by the post-processor
//! pipeline.

mod astar;
pub mod description;
pub mod postprocess;
pub mod profile;

use crate::astar::{SearchTarget, SeedNode};
use crate::description::RouteDescription;
use crate::profile::RoutingProfile;
use meridian_db::database::{AREAS_DAT, WAYS_DAT};
use meridian_db::geom::{GeoCoord, Point};
use meridian_db::io::{AccessMode, IoError};
use meridian_db::objects::{Area, ObjectError, Way};
use meridian_db::route_node::{ROUTE_DAT, ROUTE_IDX, RouteNode, RouteNodeStore};
use meridian_db::store::{DataFile, StoreError};
use meridian_db::types::{ACCESS_BACKWARD, TypeConfig, TypeConfigError};
use meridian_db::{FileOffset, Id, ObjectFileRef, RefType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    TypeConfig(#[from] TypeConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Database(#[from] meridian_db::database::DatabaseError),
    #[error("Node index {index} is outside the object's node range {count}")]
    InvalidNodeIndex { index: usize, count: usize },
    #[error("Route node {id} is not part of object {object}")]
    CorruptGraph { id: Id, object: ObjectFileRef },
    #[error("Route position must reference a way or an area, got {0}")]
    UnsupportedObject(ObjectFileRef),
    #[error("Pipeline is mis-ordered: '{processor}' requires '{requirement}' to run before it")]
    PipelineOrder {
        processor: &'static str,
        requirement: &'static str,
    },
}

/// An endpoint of a route request: an object and a node index within it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RoutePosition {
    pub object: ObjectFileRef,
    pub node_index: usize,
}

impl RoutePosition {
    pub const fn new(object: ObjectFileRef, node_index: usize) -> Self {
        Self { object, node_index }
    }
}

/// Counters surfaced after every search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStatistics {
    pub nodes_loaded: usize,
    pub nodes_ignored: usize,
    pub max_open_list: usize,
    pub max_closed_set: usize,
}

/// An alternative leaving a crossing, kept for the description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOption {
    pub object: ObjectFileRef,
    pub traversable: bool,
}

/// One step of a resolved route: traversal of `path_object` from the node at
/// `current_node_index` to `target_node_index` (indices into the object's
/// node sequence). The final entry is terminal and carries no object.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub current_node_index: usize,
    pub paths: Vec<PathOption>,
    pub path_object: Option<ObjectFileRef>,
    pub target_node_index: usize,
}

/// The linear result of a successful search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteData {
    entries: Vec<RouteEntry>,
}

impl RouteData {
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add_entry(
        &mut self,
        current_node_index: usize,
        paths: Vec<PathOption>,
        path_object: Option<ObjectFileRef>,
        target_node_index: usize,
    ) {
        self.entries.push(RouteEntry {
            current_node_index,
            paths,
            path_object,
            target_node_index,
        });
    }
}

/// Result of a route calculation: "not found" is a regular outcome, not an
/// error.
#[derive(Debug)]
pub struct RoutingResult {
    pub route: Option<RouteData>,
    pub statistics: RoutingStatistics,
}

/// Cache sizes of the router's stores, set at open time.
#[derive(Debug, Clone)]
pub struct RouterParameter {
    pub way_cache_size: usize,
    pub area_cache_size: usize,
    pub route_node_cache_size: usize,
    pub memory_mapped: bool,
}

impl Default for RouterParameter {
    fn default() -> Self {
        Self {
            way_cache_size: 2000,
            area_cache_size: 1000,
            route_node_cache_size: 6000,
            memory_mapped: true,
        }
    }
}

/// The road-graph router over one database directory.
///
/// A single `calculate_route` call is sequential; independent calls may run
/// concurrently against the same router, each with its own open/closed sets.
pub struct Router {
    path: PathBuf,
    config: Arc<TypeConfig>,
    ways: DataFile<Way>,
    areas: DataFile<Area>,
    route_nodes: RouteNodeStore,
}

impl Router {
    pub fn open(path: impl AsRef<Path>, parameter: &RouterParameter) -> Result<Self, RouterError> {
        let path = path.as_ref().to_path_buf();
        let config = Arc::new(TypeConfig::load_from_data_file(&path)?);

        let ways = DataFile::open(
            config.clone(),
            path.join(WAYS_DAT),
            AccessMode::LowMemRandom,
            parameter.memory_mapped,
            parameter.way_cache_size,
        )?;
        let areas = DataFile::open(
            config.clone(),
            path.join(AREAS_DAT),
            AccessMode::LowMemRandom,
            parameter.memory_mapped,
            parameter.area_cache_size,
        )?;
        let route_nodes = RouteNodeStore::open(
            config.clone(),
            path.join(ROUTE_DAT),
            path.join(ROUTE_IDX),
            AccessMode::FastRandom,
            parameter.memory_mapped,
            parameter.route_node_cache_size,
        )?;

        Ok(Self {
            path,
            config,
            ways,
            areas,
            route_nodes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_config(&self) -> &Arc<TypeConfig> {
        &self.config
    }

    pub fn ways(&self) -> &DataFile<Way> {
        &self.ways
    }

    pub fn areas(&self) -> &DataFile<Area> {
        &self.areas
    }

    pub fn route_nodes(&self) -> &RouteNodeStore {
        &self.route_nodes
    }

    /// The node sequence and "effectively oneway" flag of a routable object.
    /// For areas this is the first outer ring; rings are never oneway.
    fn object_geometry(&self, object: ObjectFileRef) -> Result<(Vec<Point>, bool), RouterError> {
        match object.ref_type() {
            RefType::Way => {
                let way = self.ways.get_by_offset(object.offset())?;
                let backward = !(way.buffer.access() & ACCESS_BACKWARD).is_empty();
                Ok((way.nodes.clone(), !backward))
            }
            RefType::Area => {
                let area = self.areas.get_by_offset(object.offset())?;
                let ring = area
                    .geometry_rings()
                    .iter()
                    .find(|r| r.is_outer())
                    .ok_or(RouterError::UnsupportedObject(object))?;
                Ok((ring.nodes.clone(), false))
            }
            RefType::Node => Err(RouterError::UnsupportedObject(object)),
        }
    }

    fn closest_forward_route_node(
        &self,
        points: &[Point],
        node_index: usize,
    ) -> Result<Option<(FileOffset, usize)>, RouterError> {
        for (index, point) in points.iter().enumerate().skip(node_index) {
            if let Some(offset) = self.route_nodes.offset_of(point.id)? {
                return Ok(Some((offset, index)));
            }
        }
        Ok(None)
    }

    fn closest_backward_route_node(
        &self,
        points: &[Point],
        node_index: usize,
        oneway: bool,
    ) -> Result<Option<(FileOffset, usize)>, RouterError> {
        if oneway {
            return Ok(None);
        }
        for index in (0..node_index).rev() {
            if let Some(offset) = self.route_nodes.offset_of(points[index].id)? {
                return Ok(Some((offset, index)));
            }
        }
        Ok(None)
    }

    fn seed_cost(
        &self,
        profile: &dyn RoutingProfile,
        object: ObjectFileRef,
        from: &Point,
        to: &Point,
    ) -> Result<f64, RouterError> {
        let distance = from.coord.distance_m(&to.coord);
        if object.is_way() {
            let way = self.ways.get_by_offset(object.offset())?;
            Ok(profile.cost_for_way(&way, distance))
        } else {
            Ok(profile.cost_for_distance(distance))
        }
    }

    /// Calculates the cheapest route between two positions.
    ///
    /// Query misses (no route node near an endpoint, disconnected
    /// components) come back as `route: None`.
    pub fn calculate_route(
        &self,
        profile: &dyn RoutingProfile,
        start: RoutePosition,
        target: RoutePosition,
    ) -> Result<RoutingResult, RouterError> {
        let (target_points, target_oneway) = self.object_geometry(target.object)?;
        if target.node_index >= target_points.len() {
            return Err(RouterError::InvalidNodeIndex {
                index: target.node_index,
                count: target_points.len(),
            });
        }
        let target_coord = target_points[target.node_index].coord;

        let target_forward =
            self.closest_forward_route_node(&target_points, target.node_index)?;
        let target_backward =
            self.closest_backward_route_node(&target_points, target.node_index, target_oneway)?;

        if target_forward.is_none() && target_backward.is_none() {
            debug!("no route node found for target object {}", target.object);
            return Ok(RoutingResult {
                route: None,
                statistics: RoutingStatistics::default(),
            });
        }

        let (start_points, start_oneway) = self.object_geometry(start.object)?;
        if start.node_index >= start_points.len() {
            return Err(RouterError::InvalidNodeIndex {
                index: start.node_index,
                count: start_points.len(),
            });
        }
        let start_point = start_points[start.node_index];

        let mut seeds = Vec::new();
        if let Some((offset, index)) =
            self.closest_forward_route_node(&start_points, start.node_index)?
        {
            seeds.push(SeedNode {
                offset,
                object: start.object,
                current_cost: self.seed_cost(
                    profile,
                    start.object,
                    &start_point,
                    &start_points[index],
                )?,
                estimate_cost: profile
                    .cost_for_distance(start_point.coord.distance_m(&target_coord)),
            });
        }
        if let Some((offset, index)) =
            self.closest_backward_route_node(&start_points, start.node_index, start_oneway)?
        {
            seeds.push(SeedNode {
                offset,
                object: start.object,
                current_cost: self.seed_cost(
                    profile,
                    start.object,
                    &start_point,
                    &start_points[index],
                )?,
                estimate_cost: profile
                    .cost_for_distance(start_point.coord.distance_m(&target_coord)),
            });
        }

        if seeds.is_empty() {
            debug!("no route node found for start object {}", start.object);
            return Ok(RoutingResult {
                route: None,
                statistics: RoutingStatistics::default(),
            });
        }

        let search_target = SearchTarget {
            forward_offset: target_forward.map(|(offset, _)| offset),
            backward_offset: target_backward.map(|(offset, _)| offset),
            coord: target_coord,
        };

        let outcome = astar::search(&self.route_nodes, profile, seeds, &search_target)?;

        debug!(
            nodes_loaded = outcome.statistics.nodes_loaded,
            nodes_ignored = outcome.statistics.nodes_ignored,
            max_open_list = outcome.statistics.max_open_list,
            max_closed_set = outcome.statistics.max_closed_set,
            "route search finished"
        );

        let Some(chain) = outcome.chain else {
            return Ok(RoutingResult {
                route: None,
                statistics: outcome.statistics,
            });
        };

        let route = self.resolve_chain(profile, &chain, &start, &target)?;

        Ok(RoutingResult {
            route: Some(route),
            statistics: outcome.statistics,
        })
    }

    fn transform_paths(
        &self,
        profile: &dyn RoutingProfile,
        node: &RouteNode,
    ) -> Vec<PathOption> {
        node.paths
            .iter()
            .enumerate()
            .map(|(index, path)| PathOption {
                object: node.objects[usize::from(path.object_index)],
                traversable: profile.can_use(node, index),
            })
            .collect()
    }

    fn node_position(points: &[Point], id: Id, object: ObjectFileRef) -> Result<usize, RouterError> {
        points
            .iter()
            .position(|p| p.id == id)
            .ok_or(RouterError::CorruptGraph { id, object })
    }

    /// Resolves the settled chain into per-node route entries by walking the
    /// underlying object geometry between the chosen node indices.
    fn resolve_chain(
        &self,
        profile: &dyn RoutingProfile,
        chain: &[astar::ChainEntry],
        start: &RoutePosition,
        target: &RoutePosition,
    ) -> Result<RouteData, RouterError> {
        let mut route = RouteData::default();

        let mut route_nodes: HashMap<FileOffset, Arc<RouteNode>> = HashMap::new();
        for entry in chain {
            route_nodes.insert(entry.offset, self.route_nodes.get_by_offset(entry.offset)?);
        }

        let (start_points, start_oneway) = self.object_geometry(start.object)?;

        // The path from the start position to the first routing node.
        let initial = &route_nodes[&chain[0].offset];
        if start_points[start.node_index].id != initial.id {
            let route_node_index =
                Self::node_position(&start_points, initial.id, start.object)?;
            add_nodes(
                &mut route,
                Vec::new(),
                start.node_index,
                start.object,
                start_points.len(),
                start_oneway,
                route_node_index,
            );
        }

        for (position, entry) in chain.iter().enumerate() {
            let node = &route_nodes[&entry.offset];

            let Some(next_entry) = chain.get(position + 1) else {
                // The path from the last routing node to the target, plus
                // the terminal entry.
                let (target_points, target_oneway) = self.object_geometry(target.object)?;
                let current_index =
                    Self::node_position(&target_points, node.id, target.object)?;

                if current_index != target.node_index {
                    add_nodes(
                        &mut route,
                        self.transform_paths(profile, node),
                        current_index,
                        target.object,
                        target_points.len(),
                        target_oneway,
                        target.node_index,
                    );
                }

                route.add_entry(target.node_index, Vec::new(), None, 0);
                break;
            };

            let next_node = &route_nodes[&next_entry.offset];
            let object = next_entry
                .object
                .expect("non-seed chain entries carry their incoming object");

            let (points, oneway) = self.object_geometry(object)?;
            let current_index = Self::node_position(&points, node.id, object)?;
            let next_index = Self::node_position(&points, next_node.id, object)?;

            add_nodes(
                &mut route,
                self.transform_paths(profile, node),
                current_index,
                object,
                points.len(),
                oneway,
                next_index,
            );
        }

        Ok(route)
    }

    /// Resolves a route into the coordinates of every traversed node.
    pub fn transform_route_data_to_points(
        &self,
        data: &RouteData,
    ) -> Result<Vec<Point>, RouterError> {
        let mut points: Vec<Point> = Vec::new();

        for (index, entry) in data.entries().iter().enumerate() {
            let Some(object) = entry.path_object else {
                continue;
            };
            let (geometry, _) = self.object_geometry(object)?;

            if index == 0 {
                points.push(geometry[entry.current_node_index]);
            }
            points.push(geometry[entry.target_node_index]);
        }

        Ok(points)
    }

    /// Wraps a route into the description structure consumed by the
    /// post-processor pipeline, resolving per-node locations.
    pub fn transform_route_data_to_description(
        &self,
        data: &RouteData,
    ) -> Result<RouteDescription, RouterError> {
        let mut description = RouteDescription::default();

        let entries = data.entries();
        for (index, entry) in entries.iter().enumerate() {
            let location = match entry.path_object {
                Some(object) => {
                    let (geometry, _) = self.object_geometry(object)?;
                    Some(geometry[entry.current_node_index].coord)
                }
                None => match index.checked_sub(1).map(|i| &entries[i]) {
                    Some(previous) => previous.path_object.map_or(Ok(None), |object| {
                        let (geometry, _) = self.object_geometry(object)?;
                        Ok::<Option<GeoCoord>, RouterError>(Some(
                            geometry[previous.target_node_index].coord,
                        ))
                    })?,
                    None => None,
                },
            };

            description.push_node(
                entry.current_node_index,
                entry.paths.clone(),
                entry.path_object,
                entry.target_node_index,
                location,
            );
        }

        Ok(description)
    }
}

/// Emits the per-node entries for one traversal of `object` between two node
/// indices, handling the oneway ring wraparound of closed geometries.
fn add_nodes(
    route: &mut RouteData,
    start_paths: Vec<PathOption>,
    start_index: usize,
    object: ObjectFileRef,
    id_count: usize,
    oneway: bool,
    target_index: usize,
) {
    debug_assert!(start_index < id_count);
    debug_assert!(target_index < id_count);

    if start_index.abs_diff(target_index) == 1 {
        // From one node to its neighbour.
        route.add_entry(start_index, start_paths, Some(object), target_index);
    } else if start_index < target_index {
        // Following the object's node order.
        route.add_entry(start_index, start_paths, Some(object), start_index + 1);
        for index in start_index + 1..target_index.saturating_sub(1) {
            route.add_entry(index, Vec::new(), Some(object), index + 1);
        }
        route.add_entry(target_index - 1, Vec::new(), Some(object), target_index);
    } else if oneway {
        // Going "backwards" on a oneway only makes sense on closed
        // geometry; wrap around the ring instead.
        let mut position = (start_index + 1) % id_count;
        let mut next = (position + 1) % id_count;

        route.add_entry(start_index, start_paths, Some(object), position);

        while next != target_index {
            route.add_entry(position, Vec::new(), Some(object), next);
            position = (position + 1) % id_count;
            next = (position + 1) % id_count;
        }

        route.add_entry(position, Vec::new(), Some(object), target_index);
    } else {
        // Following the object's node order in reverse.
        route.add_entry(start_index, start_paths, Some(object), start_index - 1);
        for index in (target_index + 2..start_index).rev() {
            route.add_entry(index, Vec::new(), Some(object), index - 1);
        }
        route.add_entry(target_index + 1, Vec::new(), Some(object), target_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn way(offset: FileOffset) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Way, offset)
    }

    fn indices(route: &RouteData) -> Vec<(usize, usize)> {
        route
            .entries()
            .iter()
            .map(|e| (e.current_node_index, e.target_node_index))
            .collect()
    }

    #[test]
    fn add_nodes_forward() {
        let mut route = RouteData::default();
        add_nodes(&mut route, Vec::new(), 1, way(1), 6, false, 4);
        assert_eq!(indices(&route), vec![(1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn add_nodes_neighbours_and_backward() {
        let mut route = RouteData::default();
        add_nodes(&mut route, Vec::new(), 3, way(1), 6, false, 2);
        assert_eq!(indices(&route), vec![(3, 2)]);

        let mut route = RouteData::default();
        add_nodes(&mut route, Vec::new(), 4, way(1), 6, false, 1);
        assert_eq!(indices(&route), vec![(4, 3), (3, 2), (2, 1)]);
    }

    #[test]
    fn add_nodes_oneway_wraparound() {
        // A closed ring of 5 nodes, travelling "backwards" from 1 to 4 must
        // wrap through 2, 3 going forward.
        let mut route = RouteData::default();
        add_nodes(&mut route, Vec::new(), 1, way(1), 5, true, 4);
        assert_eq!(indices(&route), vec![(1, 2), (2, 3), (3, 4)]);

        // Wrapping across the end of the node list.
        let mut route = RouteData::default();
        add_nodes(&mut route, Vec::new(), 3, way(1), 5, true, 1);
        assert_eq!(indices(&route), vec![(3, 4), (4, 0), (0, 1)]);
    }
}
