//! # Multipolygon relation resolver
//!
//! Transforms a relation's member list into consistent, hierarchically
//! nested rings with inner/outer classification, following the OSM
//! multipolygon assembly algorithm:
//!
//! 1. resolve members (recursing into child relations of administrative
//!    boundaries only),
//! 2. chain open ways into closed rings over shared endpoint ids,
//! 3. group rings by geometric containment into a nesting forest,
//! 4. infer the master type and retype old-school clip rings,
//! 5. blacklist the consumed ways.
//!
//! Any failure drops the relation with a warning; the pipeline continues.

use crate::raw::{
    CoordStore, Member, MemberType, RAW_RELS_DAT, RawRelation, RawWay, SequentialReader,
    open_raw_relation_store, open_raw_way_store,
};
use crate::{ImportContext, ImportError, Processor, REL_AREA_TMP, WAY_AREA_BLACK_DAT};
use meridian_db::geom::{Point, is_area_sub_of_area, is_ring_simple};
use meridian_db::io::FileWriter;
use meridian_db::objects::{Area, OUTER_RING_DEPTH, Ring};
use meridian_db::progress::{Progress, TracingTagErrorReporter};
use meridian_db::types::{FeatureValueBuffer, SpecialType, TagMap, TypeConfig, TypeInfo};
use meridian_db::{Id, ObjectOsmRef, OsmRefType};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One candidate ring while resolving a relation.
pub struct MultipolygonPart {
    /// Assigned nesting depth; meaningful after grouping.
    pub ring: u8,
    /// Whether the nodes already form a closed ring (stored without the
    /// duplicate endpoint).
    pub closed: bool,
    pub nodes: Vec<Point>,
    /// The ways this part was assembled from.
    pub way_ids: Vec<Id>,
    /// Type of the primary backing way (may be the ignore type).
    pub type_info: Arc<TypeInfo>,
    /// Tags of the primary backing way.
    pub tags: TagMap,
}

fn relation_error(id: Id, message: impl Into<String>) -> ImportError {
    ImportError::Relation {
        id,
        message: message.into(),
    }
}

/// Phase 1: recursively resolve the member list into parts.
#[allow(clippy::too_many_arguments)]
fn resolve_members(
    progress: &dyn Progress,
    config: &TypeConfig,
    coords: &mut CoordStore,
    ways: &mut crate::raw::RawWayStore,
    relations: &mut crate::raw::RawRelationStore,
    relation: &RawRelation,
    name: &str,
    is_boundary: bool,
) -> Result<Vec<MultipolygonPart>, ImportError> {
    let mut way_ids: BTreeSet<Id> = BTreeSet::new();
    let mut pending_relations: BTreeSet<Id> = BTreeSet::new();
    let mut resolved_relations: HashSet<Id> = HashSet::new();

    let mut collect = |members: &[Member],
                       way_ids: &mut BTreeSet<Id>,
                       pending: &mut BTreeSet<Id>,
                       resolved: &HashSet<Id>|
     -> Result<(), ImportError> {
        for member in members {
            let relevant = matches!(member.role.as_str(), "inner" | "outer" | "");
            match member.member_type {
                MemberType::Way if relevant => {
                    way_ids.insert(member.id);
                }
                MemberType::Relation if relevant => {
                    if is_boundary {
                        if resolved.contains(&member.id) {
                            return Err(relation_error(
                                relation.id,
                                format!("self referencing relation chain via {}", member.id),
                            ));
                        }
                        pending.insert(member.id);
                    } else {
                        progress.warning(&format!(
                            "Unsupported relation reference in relation {} {name}",
                            relation.id
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    };

    collect(
        &relation.members,
        &mut way_ids,
        &mut pending_relations,
        &resolved_relations,
    )?;

    // Child relations of administrative boundaries are followed level by
    // level, collecting further way members.
    while let Some(child_id) = pending_relations.pop_first() {
        resolved_relations.insert(child_id);

        let child = relations.get(child_id)?.ok_or_else(|| {
            relation_error(
                relation.id,
                format!("cannot resolve relation member {child_id}"),
            )
        })?;

        collect(
            &child.members,
            &mut way_ids,
            &mut pending_relations,
            &resolved_relations,
        )?;
    }

    let mut parts = Vec::new();

    for way_id in way_ids {
        let way: RawWay = ways.get(way_id)?.ok_or_else(|| {
            relation_error(relation.id, format!("cannot resolve way member {way_id}"))
        })?;

        if way.node_ids.len() < 2 {
            return Err(relation_error(
                relation.id,
                format!("way member {way_id} has fewer than 2 nodes"),
            ));
        }

        let mut nodes = Vec::with_capacity(way.node_ids.len());
        for node_id in &way.node_ids {
            let point = coords.get(*node_id)?.ok_or_else(|| {
                relation_error(relation.id, format!("cannot resolve node member {node_id}"))
            })?;
            nodes.push(point);
        }

        let closed = way.is_closed();
        if closed {
            // Rings are stored without repeating the start node.
            nodes.pop();
        }

        parts.push(MultipolygonPart {
            ring: OUTER_RING_DEPTH,
            closed,
            nodes,
            way_ids: vec![way.id],
            type_info: config.way_area_type(&way.tags),
            tags: way.tags,
        });
    }

    Ok(parts)
}

/// Phase 2: chain open parts into closed rings over shared endpoint ids.
pub fn build_rings(
    relation_id: Id,
    name: &str,
    parts: Vec<MultipolygonPart>,
    strict_areas: bool,
) -> Result<Vec<MultipolygonPart>, ImportError> {
    let (closed, open): (Vec<_>, Vec<_>) = parts.into_iter().partition(|p| p.closed);

    let mut rings = closed;

    if open.is_empty() {
        return Ok(rings);
    }

    // Every endpoint id must occur an even number of times (at least 2),
    // otherwise the ways cannot pair up into closed rings.
    let mut degree: HashMap<Id, (usize, Id)> = HashMap::new();
    for part in &open {
        let front = part.nodes.first().expect("ways have nodes").id;
        let back = part.nodes.last().expect("ways have nodes").id;
        degree.entry(front).or_insert((0, part.way_ids[0])).0 += 1;
        degree.entry(back).or_insert((0, part.way_ids[0])).0 += 1;
    }

    for (node_id, (count, way_id)) in &degree {
        if *count < 2 {
            return Err(relation_error(
                relation_id,
                format!(
                    "node {node_id} of way {way_id} cannot be joined with any other way of the relation {relation_id} {name}"
                ),
            ));
        }
        if count % 2 != 0 {
            return Err(relation_error(
                relation_id,
                format!(
                    "node {node_id} of way {way_id} can be joined with an uneven number of ways of the relation {relation_id} {name}"
                ),
            ));
        }
    }

    let mut used = vec![false; open.len()];

    for start in 0..open.len() {
        if used[start] {
            continue;
        }
        used[start] = true;

        let mut nodes = open[start].nodes.clone();
        let mut way_ids = open[start].way_ids.clone();
        let front_id = nodes.first().expect("non-empty").id;
        let mut back_id = nodes.last().expect("non-empty").id;

        while back_id != front_id {
            let matching = open.iter().enumerate().find(|(i, part)| {
                !used[*i]
                    && (part.nodes.first().expect("non-empty").id == back_id
                        || part.nodes.last().expect("non-empty").id == back_id)
            });

            let Some((next_index, next)) = matching else {
                break;
            };
            used[next_index] = true;
            way_ids.extend_from_slice(&next.way_ids);

            // Append with the shared boundary node dropped, flipping the
            // appended way's node order when its tail matches.
            if next.nodes.first().expect("non-empty").id == back_id {
                nodes.extend_from_slice(&next.nodes[1..]);
            } else {
                nodes.extend(next.nodes[..next.nodes.len() - 1].iter().rev().copied());
            }
            back_id = nodes.last().expect("non-empty").id;
        }

        // Remove the duplicate endpoint again; rings never repeat the start.
        if nodes.len() > 1 && nodes.first().map(|p| p.id) == nodes.last().map(|p| p.id) {
            nodes.pop();
        }

        if strict_areas && !is_ring_simple(&nodes) {
            return Err(relation_error(
                relation_id,
                format!(
                    "resolved ring including way {} is not simple for multipolygon relation {relation_id} {name}",
                    way_ids[0]
                ),
            ));
        }

        let template = &open[start];
        rings.push(MultipolygonPart {
            ring: OUTER_RING_DEPTH,
            closed: true,
            nodes,
            way_ids,
            type_info: template.type_info.clone(),
            tags: template.tags.clone(),
        });
    }

    Ok(rings)
}

/// Containment matrix over the assembled rings.
struct GroupingState {
    count: usize,
    includes: Vec<bool>,
    used: Vec<bool>,
}

impl GroupingState {
    fn new(rings: &[MultipolygonPart]) -> Self {
        let count = rings.len();
        let mut includes = vec![false; count * count];

        for (i, a) in rings.iter().enumerate() {
            for (j, b) in rings.iter().enumerate() {
                if i != j && is_area_sub_of_area(&a.nodes, &b.nodes) {
                    includes[i * count + j] = true;
                }
            }
        }

        Self {
            count,
            includes,
            used: vec![false; count],
        }
    }

    fn is_included(&self, a: usize, b: usize) -> bool {
        self.includes[a * self.count + b]
    }

    /// An unused ring not contained in any other unused ring.
    fn find_top(&self) -> Option<usize> {
        (0..self.count).find(|&i| {
            !self.used[i]
                && !(0..self.count).any(|x| !self.used[x] && self.is_included(i, x))
        })
    }

    /// An unused ring contained in `top` but in no other unused ring.
    fn find_sub(&self, top: usize) -> Option<usize> {
        (0..self.count).find(|&i| {
            !self.used[i]
                && self.is_included(i, top)
                && !(0..self.count)
                    .any(|x| x != i && !self.used[x] && self.is_included(i, x))
        })
    }
}

/// Phase 3: assign nesting depths. Returns the rings ordered parent-first,
/// each direct subtree consecutive.
pub fn group_rings(
    relation_id: Id,
    name: &str,
    rings: Vec<MultipolygonPart>,
) -> Result<Vec<MultipolygonPart>, ImportError> {
    let mut state = GroupingState::new(&rings);
    let mut order: Vec<(usize, u8)> = Vec::with_capacity(rings.len());

    fn consume_subs(state: &mut GroupingState, order: &mut Vec<(usize, u8)>, top: usize, depth: u8) {
        while let Some(sub) = state.find_sub(top) {
            state.used[sub] = true;
            order.push((sub, depth));
            consume_subs(state, order, sub, depth + 1);
        }
    }

    while order.len() < rings.len() {
        let Some(top) = state.find_top() else {
            return Err(relation_error(
                relation_id,
                format!("error during ring grouping for multipolygon relation {relation_id} {name}"),
            ));
        };

        state.used[top] = true;
        order.push((top, OUTER_RING_DEPTH));
        consume_subs(&mut state, &mut order, top, OUTER_RING_DEPTH + 1);
    }

    let mut indexed: Vec<Option<MultipolygonPart>> = rings.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|(index, depth)| {
            let mut part = indexed[index].take().expect("each ring consumed once");
            part.ring = depth;
            part
        })
        .collect())
}

/// Phases 1-5 for one relation. `Ok(None)` means the relation is silently
/// out of scope (its type carries the ignore flag).
#[allow(clippy::too_many_arguments)]
pub fn handle_multipolygon_relation(
    progress: &dyn Progress,
    config: &TypeConfig,
    coords: &mut CoordStore,
    ways: &mut crate::raw::RawWayStore,
    relations: &mut crate::raw::RawRelationStore,
    relation: &RawRelation,
    name: &str,
    strict_areas: bool,
    blacklist: &mut BTreeSet<Id>,
) -> Result<Option<Area>, ImportError> {
    let relation_type = config.relation_type(&relation.tags);
    let is_boundary = relation_type.index_as_region();

    let parts = resolve_members(
        progress, config, coords, ways, relations, relation, name, is_boundary,
    )?;

    if parts.is_empty() {
        return Err(relation_error(relation.id, "no usable members"));
    }

    let rings = build_rings(relation.id, name, parts, strict_areas)?;
    let mut groups = group_rings(relation.id, name, rings)?;

    let reporter = TracingTagErrorReporter;

    // Per-ring typed buffers, inherited from the backing way's type.
    let mut buffers: Vec<Option<FeatureValueBuffer>> = groups
        .iter()
        .map(|part| {
            if part.type_info.is_ignore() || part.type_info.name().is_empty() {
                return None;
            }
            let mut buffer = FeatureValueBuffer::new(part.type_info.clone());
            buffer.parse(
                &reporter,
                config,
                &ObjectOsmRef::new(part.way_ids[0], OsmRefType::Way),
                &part.tags,
            );
            Some(buffer)
        })
        .collect();

    // Old-school clip regions: an inner ring typed like its direct parent is
    // a hole, not an object. Reset its type but keep the original name as a
    // sidecar for auditability.
    let mut clipped: Vec<Option<String>> = vec![None; groups.len()];
    for parent in 0..groups.len() {
        let parent_depth = groups[parent].ring;
        let parent_type = groups[parent].type_info.clone();

        for child in parent + 1..groups.len() {
            if groups[child].ring <= parent_depth {
                break;
            }
            if groups[child].ring != parent_depth + 1 {
                continue;
            }
            if !parent_type.is_ignore()
                && Arc::ptr_eq(&groups[child].type_info, &parent_type)
                && buffers[child].is_some()
            {
                clipped[child] = Some(parent_type.name().to_string());
                buffers[child] = None;
            }
        }
    }

    // Master type: the relation's own type, or autodetected from the outer
    // rings (the donating ring loses its own buffer).
    let mut master_type = if relation_type.is_ignore() {
        None
    } else {
        Some(relation_type)
    };

    for (index, part) in groups.iter().enumerate() {
        if part.ring != OUTER_RING_DEPTH || part.type_info.is_ignore() {
            continue;
        }
        match &master_type {
            None => {
                if progress.output_debug() {
                    progress.debug(&format!(
                        "Autodetecting type of multipolygon relation {} as {}",
                        relation.id,
                        part.type_info.name()
                    ));
                }
                master_type = Some(part.type_info.clone());
                buffers[index] = None;
            }
            Some(master) => {
                if !Arc::ptr_eq(master, &part.type_info) {
                    progress.warning(&format!(
                        "Multipolygon relation {} has conflicting types for outer boundary ({} vs. {})",
                        relation.id,
                        master.name(),
                        part.type_info.name()
                    ));
                }
            }
        }
    }

    let Some(master_type) = master_type else {
        return Err(relation_error(
            relation.id,
            format!("multipolygon relation {} does not have a type", relation.id),
        ));
    };

    if master_type.is_ignore() {
        return Ok(None);
    }

    let mut master_buffer = FeatureValueBuffer::new(master_type);
    master_buffer.parse(
        &reporter,
        config,
        &ObjectOsmRef::new(relation.id, OsmRefType::Relation),
        &relation.tags,
    );

    // Ways consumed by this area must not be re-emitted as standalone ways.
    for part in &groups {
        blacklist.extend(part.way_ids.iter().copied());
    }

    let mut area = Area::new(master_buffer);
    for (index, part) in groups.drain(..).enumerate() {
        debug_assert!(!part.nodes.is_empty());
        let mut ring = Ring::new(part.ring, buffers[index].take(), part.nodes);
        ring.original_type = clipped[index].take();
        area.push_ring(ring);
    }

    Ok(Some(area))
}

/// Whether a relation is subject to multipolygon assembly at all.
fn is_area_relation(config: &TypeConfig, relation: &RawRelation) -> bool {
    let relation_type = config.relation_type(&relation.tags);
    if relation_type.special() == SpecialType::Multipolygon || relation_type.index_as_region() {
        return true;
    }

    config
        .tag_id("type")
        .and_then(|id| relation.tags.get(&id))
        .is_some_and(|value| value == "multipolygon" || value == "boundary")
}

fn relation_name(config: &TypeConfig, relation: &RawRelation) -> String {
    config
        .tag_id("name")
        .and_then(|id| relation.tags.get(&id))
        .cloned()
        .unwrap_or_default()
}

/// Generates `relarea.tmp` and `wayareablack.dat`.
pub struct RelAreaProcessor;

impl Processor for RelAreaProcessor {
    fn description(&self) -> &'static str {
        "Generate relarea.tmp"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        let mut coords = CoordStore::open(ctx.directory)?;
        let mut ways = open_raw_way_store(ctx.directory)?;
        let mut relations = open_raw_relation_store(ctx.directory)?;

        let mut reader = SequentialReader::open(ctx.directory.join(RAW_RELS_DAT))?;
        let total = u64::from(reader.count());

        let mut writer = FileWriter::open(ctx.directory.join(REL_AREA_TMP))?;
        let mut written: u32 = 0;
        writer.write_u32(written)?;

        let mut blacklist: BTreeSet<Id> = BTreeSet::new();
        let mut index = 0u64;

        while let Some(relation) = reader.next_record(RawRelation::read)? {
            index += 1;
            ctx.progress.set_progress(index, total);

            if !is_area_relation(ctx.config, &relation) {
                continue;
            }

            let name = relation_name(ctx.config, &relation);

            match handle_multipolygon_relation(
                ctx.progress,
                ctx.config,
                &mut coords,
                &mut ways,
                &mut relations,
                &relation,
                &name,
                ctx.parameter.strict_areas,
                &mut blacklist,
            ) {
                Ok(Some(area)) => {
                    if ctx.progress.output_debug() {
                        ctx.progress.debug(&format!(
                            "Storing relation {} {} {name}",
                            relation.id,
                            area.type_info().name()
                        ));
                    }
                    writer.write_number(relation.id)?;
                    area.write(&mut writer)?;
                    written += 1;
                }
                Ok(None) => {}
                Err(ImportError::Relation { id, message }) => {
                    // Malformed input: report and continue with the next
                    // relation.
                    ctx.progress
                        .warning(&format!("relation {id} skipped: {message}"));
                }
                Err(other) => return Err(other),
            }
        }

        writer.set_pos(0)?;
        writer.write_u32(written)?;
        writer.close()?;

        ctx.progress.info(&format!(
            "{total} relations read, {written} relations written"
        ));

        let mut black_writer = FileWriter::open(ctx.directory.join(WAY_AREA_BLACK_DAT))?;
        for way_id in &blacklist {
            black_writer.write_number(*way_id)?;
        }
        black_writer.close()?;

        ctx.progress
            .info(&format!("{} ways written to blacklist", blacklist.len()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_db::geom::GeoCoord;

    fn part(ids: &[(Id, f64, f64)], closed: bool) -> MultipolygonPart {
        let config = TypeConfig::new();
        MultipolygonPart {
            ring: OUTER_RING_DEPTH,
            closed,
            nodes: ids
                .iter()
                .map(|(id, lat, lon)| Point::new(*id, GeoCoord::new(*lat, *lon)))
                .collect(),
            way_ids: vec![ids[0].0 * 100],
            type_info: config.type_ignore(),
            tags: TagMap::new(),
        }
    }

    fn ring_ids(part: &MultipolygonPart) -> Vec<Id> {
        part.nodes.iter().map(|p| p.id).collect()
    }

    #[test]
    fn two_open_ways_chain_into_one_ring() {
        // W1 carries ids [10, 11, 12], W2 [12, 13, 10]; the shared endpoint
        // nodes are dropped while chaining.
        let w1 = part(&[(10, 0.0, 0.0), (11, 0.0, 1.0), (12, 1.0, 1.0)], false);
        let w2 = part(&[(12, 1.0, 1.0), (13, 1.0, 0.0), (10, 0.0, 0.0)], false);

        let rings = build_rings(1, "test", vec![w1, w2], false).unwrap();

        assert_eq!(rings.len(), 1);
        assert_eq!(ring_ids(&rings[0]), vec![10, 11, 12, 13]);
        assert_eq!(rings[0].ring, OUTER_RING_DEPTH);
        assert_eq!(rings[0].way_ids.len(), 2);
    }

    #[test]
    fn reversed_way_is_flipped_while_chaining() {
        // W2 runs in the opposite direction; its nodes must be reversed.
        let w1 = part(&[(10, 0.0, 0.0), (11, 0.0, 1.0), (12, 1.0, 1.0)], false);
        let w2 = part(&[(10, 0.0, 0.0), (13, 1.0, 0.0), (12, 1.0, 1.0)], false);

        let rings = build_rings(1, "test", vec![w1, w2], false).unwrap();

        assert_eq!(rings.len(), 1);
        assert_eq!(ring_ids(&rings[0]), vec![10, 11, 12, 13]);
    }

    #[test]
    fn single_closed_way_passes_through() {
        let closed = part(
            &[(1, 0.0, 0.0), (2, 0.0, 1.0), (3, 1.0, 1.0), (4, 1.0, 0.0)],
            true,
        );

        let rings = build_rings(1, "test", vec![closed], false).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(ring_ids(&rings[0]), vec![1, 2, 3, 4]);
        assert_eq!(rings[0].ring, OUTER_RING_DEPTH);
    }

    #[test]
    fn odd_endpoint_degree_is_a_hard_failure() {
        let w1 = part(&[(10, 0.0, 0.0), (11, 0.0, 1.0), (12, 1.0, 1.0)], false);
        let w2 = part(&[(12, 1.0, 1.0), (13, 1.0, 0.0), (14, 0.5, 0.0)], false);

        let result = build_rings(1, "test", vec![w1, w2], false);
        assert!(matches!(result, Err(ImportError::Relation { .. })));
    }

    #[test]
    fn strict_mode_rejects_non_simple_rings() {
        // A bowtie assembled from two open ways.
        let w1 = part(&[(1, 0.0, 0.0), (2, 1.0, 1.0), (3, 1.0, 0.0)], false);
        let w2 = part(&[(3, 1.0, 0.0), (4, 0.0, 1.0), (1, 0.0, 0.0)], false);

        assert!(build_rings(1, "test", vec![w1.clone_for_test(), w2.clone_for_test()], false).is_ok());
        assert!(matches!(
            build_rings(1, "test", vec![w1, w2], true),
            Err(ImportError::Relation { .. })
        ));
    }

    impl MultipolygonPart {
        fn clone_for_test(&self) -> Self {
            Self {
                ring: self.ring,
                closed: self.closed,
                nodes: self.nodes.clone(),
                way_ids: self.way_ids.clone(),
                type_info: self.type_info.clone(),
                tags: self.tags.clone(),
            }
        }
    }

    #[test]
    fn properly_nested_rings_get_alternating_depths() {
        // A contains B contains C.
        let a = part(
            &[(1, 0.0, 0.0), (2, 0.0, 10.0), (3, 10.0, 10.0), (4, 10.0, 0.0)],
            true,
        );
        let b = part(
            &[(5, 2.0, 2.0), (6, 2.0, 8.0), (7, 8.0, 8.0), (8, 8.0, 2.0)],
            true,
        );
        let c = part(
            &[(9, 4.0, 4.0), (10, 4.0, 6.0), (11, 6.0, 6.0), (12, 6.0, 4.0)],
            true,
        );

        let groups = group_rings(1, "test", vec![c, a, b]).unwrap();

        // Parent-first order with depths 1, 2, 3.
        let depths: Vec<(Vec<Id>, u8)> = groups.iter().map(|g| (ring_ids(g), g.ring)).collect();
        assert_eq!(depths[0].1, 1);
        assert_eq!(depths[0].0[0], 1);
        assert_eq!(depths[1].1, 2);
        assert_eq!(depths[1].0[0], 5);
        assert_eq!(depths[2].1, 3);
        assert_eq!(depths[2].0[0], 9);

        // Every odd depth is an outer ring, every even depth an inner one.
        for group in &groups {
            assert_eq!(group.ring % 2 == 1, group.ring == 1 || group.ring == 3);
        }
    }

    #[test]
    fn siblings_share_the_top_level() {
        let a = part(
            &[(1, 0.0, 0.0), (2, 0.0, 4.0), (3, 4.0, 4.0), (4, 4.0, 0.0)],
            true,
        );
        let b = part(
            &[(5, 20.0, 20.0), (6, 20.0, 24.0), (7, 24.0, 24.0), (8, 24.0, 20.0)],
            true,
        );

        let groups = group_rings(1, "test", vec![a, b]).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.ring == OUTER_RING_DEPTH));
    }
}
