//! # The A* engine
//!
//! Search nodes live in a per-call arena keyed by route-node offset; the
//! open set is a binary heap of `(overall cost, offset)` with lazy
//! decrease-key (stale heap entries are skipped on pop), the open index maps
//! offsets to arena slots, and the closed set collects settled slots for
//! path reconstruction.

use crate::profile::RoutingProfile;
use crate::{RouterError, RoutingStatistics};
use meridian_db::geom::GeoCoord;
use meridian_db::route_node::RouteNodeStore;
use meridian_db::{FileOffset, ObjectFileRef};
use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};

/// One search node in the arena.
#[derive(Debug, Clone)]
struct RNode {
    offset: FileOffset,
    /// The object traversed to arrive here; `None` for seeded start nodes.
    object: Option<ObjectFileRef>,
    /// Arena slot of the predecessor, for path reconstruction.
    prev: Option<usize>,
    /// Offset of the predecessor, for the no-backtrack rule.
    prev_offset: Option<FileOffset>,
    current_cost: f64,
    estimate_cost: f64,
    overall_cost: f64,
    /// Whether arrival happened on an accessible path; once a search walks
    /// into a restricted region it may not escape back out.
    access: bool,
}

struct OpenEntry {
    overall_cost: f64,
    offset: FileOffset,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smallest overall cost first; the offset is the tiebreaker that
        // keeps the expansion order deterministic.
        self.overall_cost
            .total_cmp(&other.overall_cost)
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

/// A start node seeded into the open set.
pub(crate) struct SeedNode {
    pub offset: FileOffset,
    pub object: ObjectFileRef,
    pub current_cost: f64,
    pub estimate_cost: f64,
}

/// The target side of a search.
pub(crate) struct SearchTarget {
    pub forward_offset: Option<FileOffset>,
    pub backward_offset: Option<FileOffset>,
    pub coord: GeoCoord,
}

impl SearchTarget {
    fn is_met_by(&self, offset: FileOffset) -> bool {
        Some(offset) == self.forward_offset || Some(offset) == self.backward_offset
    }
}

/// One settled node of the winning chain, in travel order.
pub(crate) struct ChainEntry {
    pub offset: FileOffset,
    pub object: Option<ObjectFileRef>,
}

pub(crate) struct SearchOutcome {
    /// `None` when the open set drained without meeting the target.
    pub chain: Option<Vec<ChainEntry>>,
    pub statistics: RoutingStatistics,
}

pub(crate) fn search(
    store: &RouteNodeStore,
    profile: &dyn RoutingProfile,
    seeds: Vec<SeedNode>,
    target: &SearchTarget,
) -> Result<SearchOutcome, RouterError> {
    let mut arena: Vec<RNode> = Vec::new();
    let mut heap: BinaryHeap<Reverse<OpenEntry>> = BinaryHeap::new();
    let mut open_index: HashMap<FileOffset, usize> = HashMap::new();
    let mut closed: HashMap<FileOffset, usize> = HashMap::new();
    let mut statistics = RoutingStatistics::default();

    for seed in seeds {
        let overall_cost = seed.current_cost + seed.estimate_cost;
        let node = RNode {
            offset: seed.offset,
            object: Some(seed.object),
            prev: None,
            prev_offset: None,
            current_cost: seed.current_cost,
            estimate_cost: seed.estimate_cost,
            overall_cost,
            access: true,
        };

        match open_index.entry(seed.offset) {
            Entry::Occupied(entry) => {
                let slot = *entry.get();
                if node.current_cost < arena[slot].current_cost {
                    arena[slot] = node;
                    heap.push(Reverse(OpenEntry {
                        overall_cost,
                        offset: seed.offset,
                    }));
                }
            }
            Entry::Vacant(entry) => {
                arena.push(node);
                entry.insert(arena.len() - 1);
                heap.push(Reverse(OpenEntry {
                    overall_cost,
                    offset: seed.offset,
                }));
            }
        }
    }

    statistics.max_open_list = open_index.len();

    let mut settled_target: Option<usize> = None;

    while let Some(Reverse(entry)) = heap.pop() {
        if closed.contains_key(&entry.offset) {
            continue;
        }
        let Some(&slot) = open_index.get(&entry.offset) else {
            continue;
        };
        // A cheaper re-insertion superseded this heap entry.
        if arena[slot].overall_cost != entry.overall_cost {
            continue;
        }

        open_index.remove(&entry.offset);

        if target.is_met_by(entry.offset) {
            closed.insert(entry.offset, slot);
            settled_target = Some(slot);
            break;
        }

        let current = arena[slot].clone();

        let route_node = store.get_by_offset(current.offset)?;
        statistics.nodes_loaded += 1;

        for (path_index, path) in route_node.paths.iter().enumerate() {
            // No immediate back-track to where we just came from.
            if Some(path.target_offset) == current.prev_offset {
                statistics.nodes_ignored += 1;
                continue;
            }

            // Once inside a restricted region, the search may not cross back
            // into accessible territory.
            if !current.access && path.has_access() {
                statistics.nodes_ignored += 1;
                continue;
            }

            if !profile.can_use(&route_node, path_index) {
                statistics.nodes_ignored += 1;
                continue;
            }

            if closed.contains_key(&path.target_offset) {
                continue;
            }

            if let Some(source) = current.object
                && route_node.is_excluded(source, path_index)
            {
                statistics.nodes_ignored += 1;
                continue;
            }

            let tentative = current.current_cost + profile.cost_for_path(&route_node, path_index);

            if let Some(&existing) = open_index.get(&path.target_offset)
                && arena[existing].current_cost <= tentative
            {
                continue;
            }

            let estimate = profile.cost_for_distance(path.target_coord.distance_m(&target.coord));
            let overall_cost = tentative + estimate;

            let node = RNode {
                offset: path.target_offset,
                object: Some(route_node.objects[usize::from(path.object_index)]),
                prev: Some(slot),
                prev_offset: Some(current.offset),
                current_cost: tentative,
                estimate_cost: estimate,
                overall_cost,
                access: path.has_access(),
            };

            match open_index.entry(path.target_offset) {
                Entry::Occupied(entry) => {
                    arena[*entry.get()] = node;
                }
                Entry::Vacant(entry) => {
                    arena.push(node);
                    entry.insert(arena.len() - 1);
                }
            }
            heap.push(Reverse(OpenEntry {
                overall_cost,
                offset: path.target_offset,
            }));
        }

        closed.insert(current.offset, slot);
        statistics.max_open_list = statistics.max_open_list.max(open_index.len());
        statistics.max_closed_set = statistics.max_closed_set.max(closed.len());
    }

    let chain = settled_target.map(|slot| {
        let mut chain = Vec::new();
        let mut cursor = Some(slot);
        while let Some(index) = cursor {
            chain.push(ChainEntry {
                offset: arena[index].offset,
                object: arena[index].object,
            });
            cursor = arena[index].prev;
        }
        chain.reverse();
        chain
    });

    statistics.max_closed_set = statistics.max_closed_set.max(closed.len());

    Ok(SearchOutcome { chain, statistics })
}
