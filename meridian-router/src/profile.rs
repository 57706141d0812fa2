//! # Routing profiles
//!
//! A profile is a pure-function bundle: mode-specific cost over ways and
//! route-node paths, the access predicate gating path expansion, and the
//! optimistic estimate used as the A* heuristic. Costs are measured in
//! hours; the estimate always divides by the highest speed the profile can
//! ever reach, which keeps it admissible.

use meridian_db::Vehicle;
use meridian_db::objects::Way;
use meridian_db::route_node::RouteNode;
use meridian_db::types::{FeatureKind, TypeConfig, TypeId, TypeInfo};

const METERS_PER_KILOMETER: f64 = 1000.0;

pub trait RoutingProfile: Send + Sync {
    fn vehicle(&self) -> Vehicle;

    /// Travel speed over the given way in km/h; 0 means unusable.
    fn speed_for_way(&self, way: &Way) -> f64;

    /// Travel speed along a route-node path in km/h; 0 means unusable.
    fn speed_for_path(&self, node: &RouteNode, path_index: usize) -> f64;

    /// Whether the path may be expanded at all (mode access and speed).
    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool {
        node.paths[path_index].can_use(self.vehicle())
            && self.speed_for_path(node, path_index) > 0.0
    }

    /// Cost of traversing the path, in hours.
    fn cost_for_path(&self, node: &RouteNode, path_index: usize) -> f64 {
        let speed = self.speed_for_path(node, path_index);
        if speed <= 0.0 {
            return f64::INFINITY;
        }
        node.paths[path_index].distance_m / METERS_PER_KILOMETER / speed
    }

    /// Cost of traversing `distance_m` meters along the given way.
    fn cost_for_way(&self, way: &Way, distance_m: f64) -> f64 {
        let speed = self.speed_for_way(way);
        if speed <= 0.0 {
            return f64::INFINITY;
        }
        distance_m / METERS_PER_KILOMETER / speed
    }

    /// Optimistic remaining-cost estimate over a straight-line distance.
    /// Must never overestimate the true remaining cost.
    fn cost_for_distance(&self, distance_m: f64) -> f64;
}

/// Constant walking speed, both directions of every accessible path.
pub struct FootProfile {
    speed_kmh: f64,
}

impl FootProfile {
    pub fn new() -> Self {
        Self { speed_kmh: 5.0 }
    }

    pub fn with_speed(speed_kmh: f64) -> Self {
        Self { speed_kmh }
    }
}

impl Default for FootProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingProfile for FootProfile {
    fn vehicle(&self) -> Vehicle {
        Vehicle::Foot
    }

    fn speed_for_way(&self, _way: &Way) -> f64 {
        self.speed_kmh
    }

    fn speed_for_path(&self, _node: &RouteNode, _path_index: usize) -> f64 {
        self.speed_kmh
    }

    fn cost_for_distance(&self, distance_m: f64) -> f64 {
        distance_m / METERS_PER_KILOMETER / self.speed_kmh
    }
}

/// Constant cycling speed.
pub struct BicycleProfile {
    speed_kmh: f64,
}

impl BicycleProfile {
    pub fn new() -> Self {
        Self { speed_kmh: 20.0 }
    }

    pub fn with_speed(speed_kmh: f64) -> Self {
        Self { speed_kmh }
    }
}

impl Default for BicycleProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingProfile for BicycleProfile {
    fn vehicle(&self) -> Vehicle {
        Vehicle::Bicycle
    }

    fn speed_for_way(&self, way: &Way) -> f64 {
        let limit = way.buffer.byte_of(FeatureKind::MaxSpeed).unwrap_or(0);
        if limit > 0 {
            self.speed_kmh.min(f64::from(limit))
        } else {
            self.speed_kmh
        }
    }

    fn speed_for_path(&self, node: &RouteNode, path_index: usize) -> f64 {
        let limit = node.paths[path_index].max_speed;
        if limit > 0 {
            self.speed_kmh.min(f64::from(limit))
        } else {
            self.speed_kmh
        }
    }

    fn cost_for_distance(&self, distance_m: f64) -> f64 {
        distance_m / METERS_PER_KILOMETER / self.speed_kmh
    }
}

/// Per-type traversal speeds, clamped by tagged speed limits and the
/// profile-wide maximum.
pub struct CarProfile {
    /// Speed per route-type id; 0 marks the type as unusable.
    type_speeds: Vec<f64>,
    max_speed_kmh: f64,
}

impl CarProfile {
    pub fn new(max_speed_kmh: f64) -> Self {
        Self {
            type_speeds: Vec::new(),
            max_speed_kmh,
        }
    }

    /// Fills the per-type speed table from `(type name, speed)` pairs.
    /// Types missing from the table stay unusable.
    pub fn parametrize(
        &mut self,
        config: &TypeConfig,
        type_speeds: &[(&str, f64)],
        max_speed_kmh: f64,
    ) {
        self.max_speed_kmh = max_speed_kmh;
        self.type_speeds = vec![0.0; config.route_type_count()];

        for (name, speed) in type_speeds {
            if let Some(info) = config.type_by_name(name) {
                self.set_type_speed(&info, *speed);
            }
        }
    }

    pub fn set_type_speed(&mut self, info: &TypeInfo, speed_kmh: f64) {
        let route_id = usize::from(info.route_id());
        if route_id == 0 {
            return;
        }
        if self.type_speeds.len() <= route_id {
            self.type_speeds.resize(route_id + 1, 0.0);
        }
        self.type_speeds[route_id] = speed_kmh.min(self.max_speed_kmh);
    }

    fn type_speed(&self, type_id: TypeId) -> f64 {
        self.type_speeds
            .get(usize::from(type_id))
            .copied()
            .unwrap_or(0.0)
    }
}

impl RoutingProfile for CarProfile {
    fn vehicle(&self) -> Vehicle {
        Vehicle::Car
    }

    fn speed_for_way(&self, way: &Way) -> f64 {
        let type_speed = self.type_speed(way.type_info().route_id());
        let limit = way.buffer.byte_of(FeatureKind::MaxSpeed).unwrap_or(0);
        if limit > 0 {
            type_speed.min(f64::from(limit))
        } else {
            type_speed
        }
    }

    fn speed_for_path(&self, node: &RouteNode, path_index: usize) -> f64 {
        let path = &node.paths[path_index];
        let type_speed = self.type_speed(path.type_id);
        if path.max_speed > 0 {
            type_speed.min(f64::from(path.max_speed))
        } else {
            type_speed
        }
    }

    fn cost_for_distance(&self, distance_m: f64) -> f64 {
        // The optimistic denominator keeps the heuristic admissible.
        distance_m / METERS_PER_KILOMETER / self.max_speed_kmh
    }
}
