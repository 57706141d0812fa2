//! Generation of the routing graph (`route.dat`, `route.idx`).
//!
//! Junction nodes are detected over all routable ways; every junction
//! becomes a route node whose paths connect it to the neighbouring
//! junctions along each way, carrying distance, the traversed object and
//! direction-resolved access flags.

use crate::{ImportContext, ImportError, Processor, for_each_object};
use meridian_db::database::WAYS_DAT;
use meridian_db::geom::{Point, polyline_length_m};
use meridian_db::io::FileWriter;
use meridian_db::objects::Way;
use meridian_db::route_node::{ROUTE_DAT, ROUTE_IDX, RouteNode, RouteNodePath};
use meridian_db::store::IdIndex;
use meridian_db::types::{AccessFlag, FeatureKind, TypeId};
use meridian_db::{FileOffset, Id, ObjectFileRef};
use enumset::EnumSet;
use std::collections::HashMap;

/// Mirrors an access mask for traversal against the way direction.
fn swap_directions(access: EnumSet<AccessFlag>) -> EnumSet<AccessFlag> {
    let mut result = EnumSet::empty();
    for flag in access {
        result |= match flag {
            AccessFlag::FootForward => AccessFlag::FootBackward,
            AccessFlag::FootBackward => AccessFlag::FootForward,
            AccessFlag::BicycleForward => AccessFlag::BicycleBackward,
            AccessFlag::BicycleBackward => AccessFlag::BicycleForward,
            AccessFlag::CarForward => AccessFlag::CarBackward,
            AccessFlag::CarBackward => AccessFlag::CarForward,
            AccessFlag::OnewayForward => AccessFlag::OnewayBackward,
            AccessFlag::OnewayBackward => AccessFlag::OnewayForward,
        };
    }
    result
}

struct RoutableWay {
    object: ObjectFileRef,
    type_id: TypeId,
    max_speed: u8,
    grade: u8,
    access: EnumSet<AccessFlag>,
    nodes: Vec<Point>,
}

pub struct RouteGraphProcessor;

impl Processor for RouteGraphProcessor {
    fn description(&self) -> &'static str {
        "Generate route.dat"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        // Collect routable ways and count node usage to find junctions.
        let mut routable: Vec<RoutableWay> = Vec::new();
        let mut usage: HashMap<Id, u32> = HashMap::new();

        for_each_object::<Way, _>(ctx.directory.join(WAYS_DAT), ctx.config, |way| {
            if !way.type_info().is_routable() {
                return Ok(());
            }

            for point in &way.nodes {
                *usage.entry(point.id).or_insert(0) += 1;
            }

            routable.push(RoutableWay {
                object: way.object_ref(),
                type_id: way.type_info().route_id(),
                max_speed: way.buffer.byte_of(FeatureKind::MaxSpeed).unwrap_or(0),
                grade: way.buffer.byte_of(FeatureKind::Grade).unwrap_or(0),
                access: way.buffer.access(),
                nodes: way.nodes.clone(),
            });
            Ok(())
        })?;

        // A junction is a node shared by several ways (or used twice within
        // one); way endpoints always become route nodes.
        let mut is_junction: HashMap<Id, bool> =
            usage.iter().map(|(id, count)| (*id, *count >= 2)).collect();
        for way in &routable {
            if let (Some(first), Some(last)) = (way.nodes.first(), way.nodes.last()) {
                is_junction.insert(first.id, true);
                is_junction.insert(last.id, true);
            }
        }

        // Assemble the route nodes; paths reference their targets by id
        // until the file layout is known.
        let mut nodes: HashMap<Id, RouteNode> = HashMap::new();
        let mut targets: HashMap<Id, Vec<Id>> = HashMap::new();

        for way in &routable {
            let junctions: Vec<usize> = way
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, p)| is_junction.get(&p.id).copied().unwrap_or(false))
                .map(|(i, _)| i)
                .collect();

            for pair in junctions.windows(2) {
                let (from, to) = (pair[0], pair[1]);

                let distance_m = polyline_length_m(&way.nodes[from..=to]);

                let from_point = way.nodes[from];
                let to_point = way.nodes[to];

                for (source, target, access) in [
                    (from_point, to_point, way.access),
                    (to_point, from_point, swap_directions(way.access)),
                ] {
                    let node = nodes
                        .entry(source.id)
                        .or_insert_with(|| RouteNode::new(source.id, source.coord));
                    let object_index = node.ensure_object(way.object);

                    node.paths.push(RouteNodePath {
                        target_offset: 0,
                        target_coord: target.coord,
                        object_index,
                        type_id: way.type_id,
                        max_speed: way.max_speed,
                        grade: way.grade,
                        distance_m,
                        access,
                    });
                    targets.entry(source.id).or_default().push(target.id);
                }
            }
        }

        // Two-pass serialization: the first pass fixes the record layout
        // (path targets are fixed-width), the second patches the offsets.
        let mut ids: Vec<Id> = nodes.keys().copied().collect();
        ids.sort_unstable();

        let route_path = ctx.directory.join(ROUTE_DAT);

        let mut offsets: HashMap<Id, FileOffset> = HashMap::new();
        let mut writer = FileWriter::open(&route_path)?;
        for id in &ids {
            offsets.insert(*id, writer.pos());
            nodes[id].write(&mut writer)?;
        }
        writer.close()?;

        let mut writer = FileWriter::open(&route_path)?;
        for id in &ids {
            let node = nodes.get_mut(id).expect("node exists");
            let node_targets = targets.get(id).map(Vec::as_slice).unwrap_or(&[]);
            debug_assert_eq!(node.paths.len(), node_targets.len());

            for (path, target_id) in node.paths.iter_mut().zip(node_targets) {
                path.target_offset = offsets[target_id];
            }

            debug_assert_eq!(offsets[id], writer.pos());
            node.write(&mut writer)?;
        }
        writer.close()?;

        IdIndex::build(
            ctx.directory.join(ROUTE_IDX),
            offsets.iter().map(|(id, offset)| (*id, *offset)).collect(),
        )?;

        ctx.progress.info(&format!(
            "{} route nodes written from {} routable ways",
            ids.len(),
            routable.len()
        ));

        Ok(())
    }
}
