//! # Route post-processing
//!
//! A pipeline of processors enriching a [`RouteDescription`] in
//! caller-specified order. Each processor is pure over the description it
//! transforms and idempotent (it overwrites its own attachments), so running
//! the pipeline twice yields the same result.

use crate::description::{
    Description, DescriptionKey, Instruction, RouteDescription, TurnKind,
};
use crate::profile::RoutingProfile;
use crate::{Router, RouterError};
use meridian_db::database::{Database, TypeSet};
use meridian_db::geom::{GeoBox, GeoCoord, bearing_change_deg};
use meridian_db::types::FeatureKind;
use meridian_db::{ObjectFileRef, RefType};
use std::collections::HashSet;

/// Everything a post-processor gets to see besides the description.
pub struct PostprocessContext<'a> {
    pub profile: &'a dyn RoutingProfile,
    pub router: &'a Router,
    /// Full database access, needed only by the junction processor.
    pub database: Option<&'a Database>,
    pub motorway_types: HashSet<String>,
    pub motorway_link_types: HashSet<String>,
    pub junction_types: HashSet<String>,
}

/// Attributes of the object traversed from one description node on.
#[derive(Debug, Clone, Default)]
struct ObjectInfo {
    type_name: String,
    name: Option<String>,
    ref_name: Option<String>,
    roundabout: bool,
    destination: Option<String>,
    max_speed: Option<u8>,
}

impl<'a> PostprocessContext<'a> {
    fn object_info(&self, object: ObjectFileRef) -> Result<ObjectInfo, RouterError> {
        let buffer = match object.ref_type() {
            RefType::Way => self.router.ways().get_by_offset(object.offset())?.buffer.clone(),
            RefType::Area => self
                .router
                .areas()
                .get_by_offset(object.offset())?
                .master_buffer()
                .clone(),
            RefType::Node => return Err(RouterError::UnsupportedObject(object)),
        };

        Ok(ObjectInfo {
            type_name: buffer.type_info().name().to_string(),
            name: buffer.text_of(FeatureKind::Name).map(str::to_string),
            ref_name: buffer.text_of(FeatureKind::Ref).map(str::to_string),
            roundabout: buffer.has_flag(FeatureKind::Roundabout),
            destination: buffer
                .text_of(FeatureKind::Destination)
                .map(str::to_string),
            max_speed: buffer.byte_of(FeatureKind::MaxSpeed),
        })
    }

    fn is_motorway(&self, info: &ObjectInfo) -> bool {
        self.motorway_types.contains(&info.type_name)
            || self.motorway_link_types.contains(&info.type_name)
    }
}

/// One step of the pipeline.
pub trait Postprocessor {
    fn name(&self) -> &'static str;

    /// Processors this one must run after.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError>;
}

/// An ordered pipeline, validated against the processors' declared
/// dependencies at construction time.
pub struct PostprocessorPipeline {
    processors: Vec<Box<dyn Postprocessor>>,
}

impl PostprocessorPipeline {
    pub fn new(processors: Vec<Box<dyn Postprocessor>>) -> Result<Self, RouterError> {
        let mut seen: HashSet<&'static str> = HashSet::new();
        for processor in &processors {
            for requirement in processor.requires() {
                if !seen.contains(requirement) {
                    return Err(RouterError::PipelineOrder {
                        processor: processor.name(),
                        requirement,
                    });
                }
            }
            seen.insert(processor.name());
        }
        Ok(Self { processors })
    }

    /// The canonical pipeline.
    pub fn standard(
        start_description: impl Into<String>,
        target_description: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Box::new(DistanceAndTimePostprocessor),
            Box::new(StartPostprocessor {
                description: start_description.into(),
            }),
            Box::new(TargetPostprocessor {
                description: target_description.into(),
            }),
            Box::new(WayNamePostprocessor),
            Box::new(WayTypePostprocessor),
            Box::new(CrossingWaysPostprocessor),
            Box::new(DirectionPostprocessor),
            Box::new(MotorwayJunctionPostprocessor),
            Box::new(DestinationPostprocessor),
            Box::new(MaxSpeedPostprocessor),
            Box::new(InstructionPostprocessor),
        ])
        .expect("the canonical pipeline is correctly ordered")
    }

    pub fn run(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for processor in &self.processors {
            processor.process(ctx, description)?;
        }
        Ok(())
    }
}

/// Cumulative great-circle distance and travel time per node.
pub struct DistanceAndTimePostprocessor;

impl Postprocessor for DistanceAndTimePostprocessor {
    fn name(&self) -> &'static str {
        "DistanceAndTime"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        let mut distance_m = 0.0;
        let mut time_s = 0.0;
        let mut previous: Option<(GeoCoord, Option<ObjectFileRef>)> = None;

        for node in description.nodes_mut() {
            if let (Some((previous_location, previous_object)), Some(location)) =
                (previous, node.location)
            {
                let segment_m = previous_location.distance_m(&location);
                distance_m += segment_m;

                // The segment to this node runs along the previous node's
                // path object; cost is measured in hours.
                let hours = match previous_object {
                    Some(object) if object.is_way() => {
                        let way = ctx.router.ways().get_by_offset(object.offset())?;
                        ctx.profile.cost_for_way(&way, segment_m)
                    }
                    _ => ctx.profile.cost_for_distance(segment_m),
                };
                if hours.is_finite() {
                    time_s += hours * 3600.0;
                }
            }

            node.distance_m = distance_m;
            node.time_s = time_s;
            previous = node.location.map(|l| (l, node.path_object));
        }

        Ok(())
    }
}

/// Attaches the start description to the first node.
pub struct StartPostprocessor {
    pub description: String,
}

impl Postprocessor for StartPostprocessor {
    fn name(&self) -> &'static str {
        "Start"
    }

    fn process(
        &self,
        _ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        if let Some(node) = description.nodes_mut().first_mut() {
            node.attach(
                DescriptionKey::Start,
                Description::Start(self.description.clone()),
            );
        }
        Ok(())
    }
}

/// Attaches the target description to the last node.
pub struct TargetPostprocessor {
    pub description: String,
}

impl Postprocessor for TargetPostprocessor {
    fn name(&self) -> &'static str {
        "Target"
    }

    fn process(
        &self,
        _ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        if let Some(node) = description.nodes_mut().last_mut() {
            node.attach(
                DescriptionKey::Target,
                Description::Target(self.description.clone()),
            );
        }
        Ok(())
    }
}

/// Attaches the traversed way's name and reference.
pub struct WayNamePostprocessor;

impl Postprocessor for WayNamePostprocessor {
    fn name(&self) -> &'static str {
        "WayName"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 0..description.len() {
            let Some(object) = description.nodes()[index].path_object else {
                continue;
            };
            let info = ctx.object_info(object)?;
            description.nodes_mut()[index].attach(
                DescriptionKey::WayName,
                Description::WayName {
                    name: info.name,
                    ref_name: info.ref_name,
                },
            );
        }
        Ok(())
    }
}

/// Attaches the traversed way's type name.
pub struct WayTypePostprocessor;

impl Postprocessor for WayTypePostprocessor {
    fn name(&self) -> &'static str {
        "WayType"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 0..description.len() {
            let Some(object) = description.nodes()[index].path_object else {
                continue;
            };
            let info = ctx.object_info(object)?;
            description.nodes_mut()[index]
                .attach(DescriptionKey::WayType, Description::WayType(info.type_name));
        }
        Ok(())
    }
}

/// Attaches the set of other named ways meeting at each node.
pub struct CrossingWaysPostprocessor;

impl Postprocessor for CrossingWaysPostprocessor {
    fn name(&self) -> &'static str {
        "CrossingWays"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 0..description.len() {
            let node = &description.nodes()[index];
            let outgoing = node.path_object;
            let incoming = index
                .checked_sub(1)
                .and_then(|i| description.nodes()[i].path_object);

            let mut names: Vec<String> = Vec::new();
            for path in &node.paths {
                if Some(path.object) == outgoing || Some(path.object) == incoming {
                    continue;
                }
                if let Some(name) = ctx.object_info(path.object)?.name
                    && !names.contains(&name)
                {
                    names.push(name);
                }
            }

            let node = &mut description.nodes_mut()[index];
            if names.is_empty() {
                node.detach(DescriptionKey::CrossingWays);
            } else {
                node.attach(
                    DescriptionKey::CrossingWays,
                    Description::CrossingWays { names },
                );
            }
        }
        Ok(())
    }
}

/// Computes the signed bearing change at every interior node and bins it.
pub struct DirectionPostprocessor;

impl Postprocessor for DirectionPostprocessor {
    fn name(&self) -> &'static str {
        "Direction"
    }

    fn process(
        &self,
        _ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 1..description.len().saturating_sub(1) {
            let (Some(previous), Some(current), Some(next)) = (
                description.nodes()[index - 1].location,
                description.nodes()[index].location,
                description.nodes()[index + 1].location,
            ) else {
                continue;
            };

            let incoming = previous.bearing_deg(&current);
            let outgoing = current.bearing_deg(&next);
            let turn_angle_deg = bearing_change_deg(incoming, outgoing);

            description.nodes_mut()[index].attach(
                DescriptionKey::Direction,
                Description::Direction {
                    turn_angle_deg,
                    turn: TurnKind::from_angle(turn_angle_deg),
                },
            );
        }
        Ok(())
    }
}

/// Tags nodes coinciding with highway junction nodes.
pub struct MotorwayJunctionPostprocessor;

impl Postprocessor for MotorwayJunctionPostprocessor {
    fn name(&self) -> &'static str {
        "MotorwayJunction"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        let Some(database) = ctx.database else {
            return Ok(());
        };
        if ctx.junction_types.is_empty() {
            return Ok(());
        }

        let junction_types: Vec<_> = ctx
            .junction_types
            .iter()
            .filter_map(|name| database.type_config().type_by_name(name))
            .collect();
        if junction_types.is_empty() {
            return Ok(());
        }
        let type_set = TypeSet::from_types(junction_types.iter());

        // Junction nodes within roughly 20 meters count as coinciding.
        const MAX_DISTANCE_M: f64 = 20.0;
        const SEARCH_MARGIN_DEG: f64 = 0.0005;

        for index in 0..description.len() {
            let Some(location) = description.nodes()[index].location else {
                continue;
            };

            let search_box = GeoBox::new(
                GeoCoord::new(
                    (location.lat() - SEARCH_MARGIN_DEG).max(-90.0),
                    (location.lon() - SEARCH_MARGIN_DEG).max(-180.0),
                ),
                GeoCoord::new(
                    (location.lat() + SEARCH_MARGIN_DEG).min(90.0),
                    (location.lon() + SEARCH_MARGIN_DEG).min(180.0),
                ),
            );

            let data = database.get_objects(&type_set, &search_box)?;

            for junction in &data.nodes {
                if junction.coord.distance_m(&location) <= MAX_DISTANCE_M {
                    description.nodes_mut()[index].attach(
                        DescriptionKey::MotorwayJunction,
                        Description::MotorwayJunction {
                            name: junction
                                .buffer
                                .text_of(FeatureKind::Name)
                                .map(str::to_string),
                            ref_name: junction
                                .buffer
                                .text_of(FeatureKind::Ref)
                                .map(str::to_string),
                        },
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Propagates the Destination feature from the traversed way.
pub struct DestinationPostprocessor;

impl Postprocessor for DestinationPostprocessor {
    fn name(&self) -> &'static str {
        "Destination"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 0..description.len() {
            let Some(object) = description.nodes()[index].path_object else {
                continue;
            };
            if let Some(destination) = ctx.object_info(object)?.destination {
                description.nodes_mut()[index].attach(
                    DescriptionKey::Destination,
                    Description::Destination(destination),
                );
            }
        }
        Ok(())
    }
}

/// Propagates per-segment speed limits.
pub struct MaxSpeedPostprocessor;

impl Postprocessor for MaxSpeedPostprocessor {
    fn name(&self) -> &'static str {
        "MaxSpeed"
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        for index in 0..description.len() {
            let Some(object) = description.nodes()[index].path_object else {
                continue;
            };
            if let Some(max_speed) = ctx.object_info(object)?.max_speed {
                description.nodes_mut()[index]
                    .attach(DescriptionKey::MaxSpeed, Description::MaxSpeed(max_speed));
            }
        }
        Ok(())
    }
}

/// Synthesises the high-level navigation events.
pub struct InstructionPostprocessor;

impl Postprocessor for InstructionPostprocessor {
    fn name(&self) -> &'static str {
        "Instruction"
    }

    fn requires(&self) -> &'static [&'static str] {
        &[
            "WayName",
            "CrossingWays",
            "Direction",
            "MotorwayJunction",
            "Destination",
        ]
    }

    fn process(
        &self,
        ctx: &PostprocessContext<'_>,
        description: &mut RouteDescription,
    ) -> Result<(), RouterError> {
        let count = description.len();

        // Resolve the outgoing object attributes per node up front.
        let mut infos: Vec<Option<ObjectInfo>> = Vec::with_capacity(count);
        for node in description.nodes() {
            infos.push(match node.path_object {
                Some(object) => Some(ctx.object_info(object)?),
                None => None,
            });
        }

        let mut in_roundabout = false;
        let mut roundabout_exits = 0usize;

        for index in 0..count {
            let mut instructions: Vec<Instruction> = Vec::new();

            if index == 0 {
                instructions.push(Instruction::Start);
            }

            let current = infos[index].as_ref();
            let previous = index.checked_sub(1).and_then(|i| infos[i].as_ref());

            let has_crossing =
                description.nodes()[index].has_description(DescriptionKey::CrossingWays);

            let current_roundabout = current.is_some_and(|i| i.roundabout);

            if in_roundabout {
                if has_crossing {
                    roundabout_exits += 1;
                }
                if !current_roundabout {
                    in_roundabout = false;
                    instructions.push(Instruction::RoundaboutLeave {
                        exit_count: roundabout_exits.max(1),
                    });
                }
            } else if current_roundabout {
                in_roundabout = true;
                roundabout_exits = 0;
                instructions.push(Instruction::RoundaboutEnter);
            }

            let previous_motorway = previous.is_some_and(|i| ctx.is_motorway(i));
            let current_motorway = current.is_some_and(|i| ctx.is_motorway(i));

            if !previous_motorway && current_motorway {
                instructions.push(Instruction::MotorwayEnter {
                    to: current.and_then(|i| i.name.clone()),
                });
            } else if previous_motorway && current_motorway {
                let from = previous.and_then(|i| i.name.clone());
                let to = current.and_then(|i| i.name.clone());
                if from != to {
                    instructions.push(Instruction::MotorwayChange { from, to });
                }
            } else if previous_motorway && !current_motorway && index != count - 1 {
                instructions.push(Instruction::MotorwayLeave {
                    from: previous.and_then(|i| i.name.clone()),
                });
            }

            let significant_turn = match description.nodes()[index]
                .description(DescriptionKey::Direction)
            {
                Some(Description::Direction { turn, .. }) if *turn != TurnKind::StraightOn => {
                    Some(*turn)
                }
                _ => None,
            };

            if !in_roundabout
                && !current_motorway
                && let Some(turn) = significant_turn
                && has_crossing
            {
                instructions.push(Instruction::Turn { kind: turn });
            } else if !in_roundabout
                && !current_motorway
                && !previous_motorway
                && index > 0
                && index != count - 1
            {
                let from = previous.and_then(|i| i.name.clone());
                let to = current.and_then(|i| i.name.clone());
                if from != to && to.is_some() {
                    instructions.push(Instruction::NameChanged { from, to });
                }
            }

            if index == count - 1 {
                instructions.push(Instruction::Target);
            }

            let node = &mut description.nodes_mut()[index];
            if instructions.is_empty() {
                node.detach(DescriptionKey::Instructions);
            } else {
                node.attach(
                    DescriptionKey::Instructions,
                    Description::Instructions(instructions),
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, &'static [&'static str]);

    impl Postprocessor for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }

        fn requires(&self) -> &'static [&'static str] {
            self.1
        }

        fn process(
            &self,
            _ctx: &PostprocessContext<'_>,
            _description: &mut RouteDescription,
        ) -> Result<(), RouterError> {
            Ok(())
        }
    }

    #[test]
    fn pipeline_validates_processor_order() {
        assert!(PostprocessorPipeline::new(vec![
            Box::new(Dummy("A", &[])),
            Box::new(Dummy("B", &["A"])),
        ])
        .is_ok());

        let result = PostprocessorPipeline::new(vec![
            Box::new(Dummy("B", &["A"])),
            Box::new(Dummy("A", &[])),
        ]);
        assert!(matches!(
            result,
            Err(RouterError::PipelineOrder {
                processor: "B",
                requirement: "A"
            })
        ));
    }
}
