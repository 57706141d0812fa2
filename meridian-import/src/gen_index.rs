//! Generation of the spatial indices: the per-kind area indices and the
//! optimised low-zoom way index.

use crate::{ImportContext, ImportError, Processor, for_each_object};
use meridian_db::area_index::{
    AREA_AREA_IDX, AREA_NODE_IDX, AREA_WAY_IDX, AreaIndexBuilder, cells_for_objects,
};
use meridian_db::database::{AREAS_DAT, NODES_DAT, WAYS_DAT};
use meridian_db::geom::{GeoBox, simplify_polyline};
use meridian_db::low_zoom::{LowZoomIndexBuilder, WAYS_OPT_DAT};
use meridian_db::objects::{Area, Node, Way};
use meridian_db::tile::{TileId, TileIdBox, cell_width};
use meridian_db::types::TypeId;
use meridian_db::FileOffset;
use std::collections::{BTreeMap, HashMap};

/// Builds `areanode.idx`, `areaway.idx` and `areaarea.idx` from the freshly
/// written object stores.
pub struct AreaIndexProcessor;

impl AreaIndexProcessor {
    fn write_index(
        ctx: &ImportContext<'_>,
        file: &str,
        objects: HashMap<TypeId, Vec<(FileOffset, GeoBox)>>,
    ) -> Result<(), ImportError> {
        let level = ctx.parameter.area_index_level;
        let mut builder = AreaIndexBuilder::new();

        let mut types: Vec<_> = objects.into_iter().collect();
        types.sort_by_key(|(type_id, _)| *type_id);

        for (type_id, entries) in types {
            builder.push_type(type_id, level, cells_for_objects(level, entries));
        }

        builder.write(ctx.directory.join(file))?;
        Ok(())
    }
}

impl Processor for AreaIndexProcessor {
    fn description(&self) -> &'static str {
        "Generate area indices"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        let mut node_objects: HashMap<TypeId, Vec<(FileOffset, GeoBox)>> = HashMap::new();
        for_each_object::<Node, _>(ctx.directory.join(NODES_DAT), ctx.config, |node| {
            node_objects
                .entry(node.type_info().node_id())
                .or_default()
                .push((node.file_offset(), GeoBox::new(node.coord, node.coord)));
            Ok(())
        })?;
        Self::write_index(ctx, AREA_NODE_IDX, node_objects)?;

        let mut way_objects: HashMap<TypeId, Vec<(FileOffset, GeoBox)>> = HashMap::new();
        for_each_object::<Way, _>(ctx.directory.join(WAYS_DAT), ctx.config, |way| {
            if let Some(bounding_box) = way.bounding_box() {
                way_objects
                    .entry(way.type_info().way_id())
                    .or_default()
                    .push((way.file_offset(), bounding_box));
            }
            Ok(())
        })?;
        Self::write_index(ctx, AREA_WAY_IDX, way_objects)?;

        let mut area_objects: HashMap<TypeId, Vec<(FileOffset, GeoBox)>> = HashMap::new();
        for_each_object::<Area, _>(ctx.directory.join(AREAS_DAT), ctx.config, |area| {
            if let Some(bounding_box) = area.bounding_box() {
                area_objects
                    .entry(area.type_info().area_id())
                    .or_default()
                    .push((area.file_offset(), bounding_box));
            }
            Ok(())
        })?;
        Self::write_index(ctx, AREA_AREA_IDX, area_objects)?;

        Ok(())
    }
}

/// Builds `waysopt.dat`: pre-simplified geometry per optimisation level for
/// every type flagged `optimize_low_zoom`.
pub struct LowZoomProcessor;

impl Processor for LowZoomProcessor {
    fn description(&self) -> &'static str {
        "Generate waysopt.dat"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        let levels = &ctx.parameter.optimization_levels;
        let max_level = levels.iter().copied().max().unwrap_or(0);

        // (type, level) -> cell -> simplified ways
        let mut per_level: BTreeMap<(TypeId, u32), BTreeMap<TileId, Vec<Way>>> = BTreeMap::new();

        for_each_object::<Way, _>(ctx.directory.join(WAYS_DAT), ctx.config, |way| {
            if !way.type_info().optimize_low_zoom() {
                return Ok(());
            }
            let Some(bounding_box) = way.bounding_box() else {
                return Ok(());
            };

            for level in levels {
                // Tolerance tied to the cell size keeps the error invisible
                // at the target magnification.
                let tolerance = cell_width(*level) / 256.0;
                let simplified = simplify_polyline(&way.nodes, tolerance);
                if simplified.len() < 2 {
                    continue;
                }

                let simplified_way = Way::new(way.buffer.clone(), simplified);
                let cells = per_level
                    .entry((way.type_info().way_id(), *level))
                    .or_default();

                for tile in TileIdBox::from_geo_box(*level, &bounding_box).iter() {
                    cells
                        .entry(tile)
                        .or_default()
                        .push(simplified_way.clone());
                }
            }
            Ok(())
        })?;

        let mut builder = LowZoomIndexBuilder::new(max_level);
        for ((type_id, level), cells) in per_level {
            builder.push_level(type_id, level, level, cells);
        }
        builder.write(ctx.directory.join(WAYS_OPT_DAT))?;

        Ok(())
    }
}
