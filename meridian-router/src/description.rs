//! # Route descriptions
//!
//! A [`RouteDescription`] wraps the per-node route entries with an
//! extensible map of description attachments. Post-processors enrich the
//! nodes in caller-specified order; the downstream navigation formatter
//! consumes the result.

use crate::PathOption;
use meridian_db::ObjectFileRef;
use meridian_db::geom::GeoCoord;
use std::collections::BTreeMap;

/// Attachment slots of a description node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum DescriptionKey {
    Start,
    Target,
    WayName,
    WayType,
    CrossingWays,
    Direction,
    MotorwayJunction,
    Destination,
    MaxSpeed,
    Instructions,
}

/// Binned turn strength, derived from the signed bearing change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TurnKind {
    SharpLeft,
    Left,
    SlightlyLeft,
    StraightOn,
    SlightlyRight,
    Right,
    SharpRight,
}

impl TurnKind {
    /// Bins a signed bearing change (degrees, positive = right).
    pub fn from_angle(angle_deg: f64) -> Self {
        if angle_deg <= -120.0 {
            TurnKind::SharpLeft
        } else if angle_deg <= -60.0 {
            TurnKind::Left
        } else if angle_deg <= -10.0 {
            TurnKind::SlightlyLeft
        } else if angle_deg < 10.0 {
            TurnKind::StraightOn
        } else if angle_deg < 60.0 {
            TurnKind::SlightlyRight
        } else if angle_deg < 120.0 {
            TurnKind::Right
        } else {
            TurnKind::SharpRight
        }
    }
}

/// High-level events synthesised by the instruction post-processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Start,
    Target,
    Turn {
        kind: TurnKind,
    },
    RoundaboutEnter,
    RoundaboutLeave {
        exit_count: usize,
    },
    MotorwayEnter {
        to: Option<String>,
    },
    MotorwayChange {
        from: Option<String>,
        to: Option<String>,
    },
    MotorwayLeave {
        from: Option<String>,
    },
    NameChanged {
        from: Option<String>,
        to: Option<String>,
    },
}

/// A single description attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum Description {
    Start(String),
    Target(String),
    WayName {
        name: Option<String>,
        ref_name: Option<String>,
    },
    WayType(String),
    CrossingWays {
        names: Vec<String>,
    },
    Direction {
        turn_angle_deg: f64,
        turn: TurnKind,
    },
    MotorwayJunction {
        name: Option<String>,
        ref_name: Option<String>,
    },
    Destination(String),
    MaxSpeed(u8),
    Instructions(Vec<Instruction>),
}

/// One node of the description, addressable by index.
#[derive(Debug, Clone)]
pub struct RouteDescriptionNode {
    pub current_node_index: usize,
    pub paths: Vec<PathOption>,
    pub path_object: Option<ObjectFileRef>,
    pub target_node_index: usize,
    pub location: Option<GeoCoord>,
    /// Cumulative distance from the start in meters.
    pub distance_m: f64,
    /// Cumulative travel time from the start in seconds.
    pub time_s: f64,
    descriptions: BTreeMap<DescriptionKey, Description>,
}

impl RouteDescriptionNode {
    pub fn description(&self, key: DescriptionKey) -> Option<&Description> {
        self.descriptions.get(&key)
    }

    pub fn has_description(&self, key: DescriptionKey) -> bool {
        self.descriptions.contains_key(&key)
    }

    /// Sets or replaces an attachment; processors are idempotent by
    /// overwriting their own keys.
    pub fn attach(&mut self, key: DescriptionKey, description: Description) {
        self.descriptions.insert(key, description);
    }

    pub fn detach(&mut self, key: DescriptionKey) {
        self.descriptions.remove(&key);
    }

    pub fn way_name(&self) -> Option<&str> {
        match self.description(DescriptionKey::WayName) {
            Some(Description::WayName { name, .. }) => name.as_deref(),
            _ => None,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        match self.description(DescriptionKey::Instructions) {
            Some(Description::Instructions(instructions)) => instructions,
            _ => &[],
        }
    }
}

/// The enriched, indexable route description.
#[derive(Debug, Clone, Default)]
pub struct RouteDescription {
    nodes: Vec<RouteDescriptionNode>,
}

impl RouteDescription {
    pub fn push_node(
        &mut self,
        current_node_index: usize,
        paths: Vec<PathOption>,
        path_object: Option<ObjectFileRef>,
        target_node_index: usize,
        location: Option<GeoCoord>,
    ) {
        self.nodes.push(RouteDescriptionNode {
            current_node_index,
            paths,
            path_object,
            target_node_index,
            location,
            distance_m: 0.0,
            time_s: 0.0,
            descriptions: BTreeMap::new(),
        });
    }

    pub fn nodes(&self) -> &[RouteDescriptionNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [RouteDescriptionNode] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total length of the described route in meters.
    pub fn total_distance_m(&self) -> f64 {
        self.nodes.last().map_or(0.0, |n| n.distance_m)
    }

    pub fn total_time_s(&self) -> f64 {
        self.nodes.last().map_or(0.0, |n| n.time_s)
    }
}
