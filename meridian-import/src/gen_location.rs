//! Generation of the location index (`location.idx`, `locationaddr.dat`).
//!
//! Regions come from areas flagged `ADMIN_REGION`, nested by geometric
//! containment and admin level. Streets (`LOCATION`) and POIs (`POI`) are
//! assigned to the most specific region containing them; addresses
//! (`ADDRESS`) hang off the street named by their Location feature.

use crate::{ImportContext, ImportError, Processor, for_each_object};
use meridian_db::database::{AREAS_DAT, NODES_DAT, WAYS_DAT};
use meridian_db::geom::{GeoCoord, Point, relation_of_point_to_ring};
use meridian_db::location::{LocationData, LocationKind, RegionData, build_location_index};
use meridian_db::objects::{Area, Node, Way};
use meridian_db::types::FeatureKind;
use meridian_db::ObjectFileRef;

struct RegionCandidate {
    data: RegionData,
    admin_level: u8,
    outer_ring: Vec<Point>,
    children: Vec<usize>,
}

fn containing_region(regions: &[RegionCandidate], coord: &GeoCoord) -> Option<usize> {
    // The most specific region is the container with the highest admin
    // level; ties break in registration order.
    regions
        .iter()
        .enumerate()
        .filter(|(_, r)| relation_of_point_to_ring(coord, &r.outer_ring) >= 0)
        .max_by_key(|(index, r)| (r.admin_level, usize::MAX - index))
        .map(|(index, _)| index)
}

fn push_location(
    regions: &mut [RegionCandidate],
    coord: &GeoCoord,
    name: &str,
    kind: LocationKind,
    object: ObjectFileRef,
) {
    let Some(region) = containing_region(regions, coord) else {
        return;
    };

    let locations = &mut regions[region].data.locations;
    if let Some(existing) = locations
        .iter_mut()
        .find(|l| l.name == name && l.kind == Some(kind))
    {
        existing.objects.push(object);
    } else {
        locations.push(LocationData {
            name: name.to_string(),
            kind: Some(kind),
            objects: vec![object],
            addresses: Vec::new(),
        });
    }
}

pub struct LocationIndexProcessor;

impl Processor for LocationIndexProcessor {
    fn description(&self) -> &'static str {
        "Generate location index"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        // Admin regions from the area store.
        let mut regions: Vec<RegionCandidate> = Vec::new();

        for_each_object::<Area, _>(ctx.directory.join(AREAS_DAT), ctx.config, |area| {
            if !area.type_info().index_as_region() {
                return Ok(());
            }
            let buffer = area.master_buffer();
            let Some(name) = buffer.text_of(FeatureKind::Name) else {
                return Ok(());
            };
            let Some(outer) = area.geometry_rings().iter().find(|r| r.is_outer()) else {
                return Ok(());
            };

            let mut aliases = Vec::new();
            if let Some(alias) = buffer.text_of(FeatureKind::NameAlt) {
                aliases.push(alias.to_string());
            }
            if let Some(alias) = buffer.text_of(FeatureKind::NameShort) {
                aliases.push(alias.to_string());
            }

            regions.push(RegionCandidate {
                data: RegionData {
                    name: name.to_string(),
                    aliases,
                    object: area.object_ref(),
                    admin_level: buffer.byte_of(FeatureKind::AdminLevel).unwrap_or(0),
                    locations: Vec::new(),
                    children: Vec::new(),
                },
                admin_level: buffer.byte_of(FeatureKind::AdminLevel).unwrap_or(0),
                outer_ring: outer.nodes.clone(),
                children: Vec::new(),
            });
            Ok(())
        })?;

        // Streets and way POIs.
        for_each_object::<Way, _>(ctx.directory.join(WAYS_DAT), ctx.config, |way| {
            let Some(name) = way.buffer.text_of(FeatureKind::Name) else {
                return Ok(());
            };
            let name = name.to_string();
            let coord = way.nodes[0].coord;

            if way.type_info().index_as_location() {
                push_location(
                    &mut regions,
                    &coord,
                    &name,
                    LocationKind::Street,
                    way.object_ref(),
                );
            }
            if way.type_info().index_as_poi() {
                push_location(
                    &mut regions,
                    &coord,
                    &name,
                    LocationKind::Poi,
                    way.object_ref(),
                );
            }
            Ok(())
        })?;

        // Node POIs and addresses.
        for_each_object::<Node, _>(ctx.directory.join(NODES_DAT), ctx.config, |node| {
            if node.type_info().index_as_poi()
                && let Some(name) = node.buffer.text_of(FeatureKind::Name)
            {
                let name = name.to_string();
                push_location(
                    &mut regions,
                    &node.coord,
                    &name,
                    LocationKind::Poi,
                    node.object_ref(),
                );
            }

            if node.type_info().index_as_address()
                && let Some(house_number) = node.buffer.text_of(FeatureKind::Address)
                && let Some(street) = node.buffer.text_of(FeatureKind::Location)
            {
                let house_number = house_number.to_string();
                let street = street.to_string();
                if let Some(region) = containing_region(&regions, &node.coord)
                    && let Some(location) = regions[region]
                        .data
                        .locations
                        .iter_mut()
                        .find(|l| l.name == street)
                {
                    location.addresses.push((house_number, node.object_ref()));
                }
            }
            Ok(())
        })?;

        // Nest regions by containment: the parent is the containing region
        // with the highest admin level below the child's.
        let mut parents: Vec<Option<usize>> = vec![None; regions.len()];
        for child in 0..regions.len() {
            let probe = regions[child].outer_ring[0].coord;
            let parent = regions
                .iter()
                .enumerate()
                .filter(|(index, candidate)| {
                    *index != child
                        && candidate.admin_level < regions[child].admin_level
                        && relation_of_point_to_ring(&probe, &candidate.outer_ring) >= 0
                })
                .max_by_key(|(_, candidate)| candidate.admin_level)
                .map(|(index, _)| index);
            parents[child] = parent;
        }

        for child in (0..regions.len()).rev() {
            if let Some(parent) = parents[child] {
                regions[parent].children.push(child);
            }
        }

        // Materialise the forest bottom-up; children were collected in
        // reverse, so restore registration order.
        fn build_tree(regions: &mut [RegionCandidate], index: usize) -> RegionData {
            let mut children: Vec<usize> = std::mem::take(&mut regions[index].children);
            children.reverse();

            let placeholder_object = regions[index].data.object;
            let mut data = std::mem::replace(
                &mut regions[index].data,
                RegionData {
                    name: String::new(),
                    aliases: Vec::new(),
                    object: placeholder_object,
                    admin_level: 0,
                    locations: Vec::new(),
                    children: Vec::new(),
                },
            );

            for child in children {
                let child_data = build_tree(regions, child);
                data.children.push(child_data);
            }
            data
        }

        let roots: Vec<usize> = (0..regions.len())
            .filter(|index| parents[*index].is_none())
            .collect();
        let forest: Vec<RegionData> = roots
            .into_iter()
            .map(|root| build_tree(&mut regions, root))
            .collect();

        build_location_index(ctx.directory, &forest)?;

        ctx.progress
            .info(&format!("{} admin regions indexed", forest.len()));
        Ok(())
    }
}
