//! Generation of the object stores (`nodes.dat`, `ways.dat`, `areas.dat`)
//! from the raw scratch files and the resolver output.

use crate::raw::{
    CoordStore, RAW_NODES_DAT, RAW_WAYS_DAT, RawNode, RawWay, SequentialReader, read_blacklist,
};
use crate::{ImportContext, ImportError, Processor, REL_AREA_TMP, WAY_AREA_BLACK_DAT};
use meridian_db::database::{AREAS_DAT, NODES_DAT, WAYS_DAT};
use meridian_db::io::{AccessMode, FileScanner, FileWriter};
use meridian_db::objects::{Area, Node, OUTER_RING_DEPTH, Ring, Way};
use meridian_db::progress::TracingTagErrorReporter;
use meridian_db::types::FeatureValueBuffer;
use meridian_db::{ObjectOsmRef, OsmRefType};

/// Converts typed raw nodes into `nodes.dat`.
pub struct NodeGenProcessor;

impl Processor for NodeGenProcessor {
    fn description(&self) -> &'static str {
        "Generate nodes.dat"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        let reporter = TracingTagErrorReporter;

        let mut reader = SequentialReader::open(ctx.directory.join(RAW_NODES_DAT))?;
        let total = u64::from(reader.count());

        let mut writer = FileWriter::open(ctx.directory.join(NODES_DAT))?;
        let mut written = 0u64;
        let mut index = 0u64;

        while let Some(raw) = reader.next_record(RawNode::read)? {
            index += 1;
            ctx.progress.set_progress(index, total);

            let type_info = ctx.config.node_type(&raw.tags);
            if type_info.is_ignore() {
                continue;
            }

            let mut buffer = FeatureValueBuffer::new(type_info);
            buffer.parse(
                &reporter,
                ctx.config,
                &ObjectOsmRef::new(raw.id, OsmRefType::Node),
                &raw.tags,
            );

            Node::new(buffer, raw.coord).write(&mut writer)?;
            written += 1;
        }

        writer.close()?;
        ctx.progress
            .info(&format!("{index} raw nodes read, {written} nodes written"));
        Ok(())
    }
}

/// Converts typed raw ways into `ways.dat` (open polylines) and `areas.dat`
/// (closed ways plus the resolved multipolygon relations), honoring the way
/// blacklist produced by the relation resolver.
pub struct WayAreaGenProcessor;

impl Processor for WayAreaGenProcessor {
    fn description(&self) -> &'static str {
        "Generate ways.dat and areas.dat"
    }

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError> {
        let reporter = TracingTagErrorReporter;

        let blacklist = read_blacklist(ctx.directory.join(WAY_AREA_BLACK_DAT))?;
        let mut coords = CoordStore::open(ctx.directory)?;

        let mut reader = SequentialReader::open(ctx.directory.join(RAW_WAYS_DAT))?;
        let total = u64::from(reader.count());

        let mut way_writer = FileWriter::open(ctx.directory.join(WAYS_DAT))?;
        let mut area_writer = FileWriter::open(ctx.directory.join(AREAS_DAT))?;

        let mut ways_written = 0u64;
        let mut areas_written = 0u64;
        let mut index = 0u64;

        while let Some(raw) = reader.next_record(RawWay::read)? {
            index += 1;
            ctx.progress.set_progress(index, total);

            if blacklist.contains(&raw.id) {
                continue;
            }

            let type_info = ctx.config.way_area_type(&raw.tags);
            if type_info.is_ignore() {
                continue;
            }

            let mut nodes = Vec::with_capacity(raw.node_ids.len());
            let mut unresolved = false;
            for node_id in &raw.node_ids {
                match coords.get(*node_id)? {
                    Some(point) => nodes.push(point),
                    None => {
                        ctx.progress.warning(&format!(
                            "way {} skipped: cannot resolve node {node_id}",
                            raw.id
                        ));
                        unresolved = true;
                        break;
                    }
                }
            }
            if unresolved || nodes.len() < 2 {
                continue;
            }

            let mut buffer = FeatureValueBuffer::new(type_info.clone());
            buffer.parse(
                &reporter,
                ctx.config,
                &ObjectOsmRef::new(raw.id, OsmRefType::Way),
                &raw.tags,
            );

            if raw.is_closed() && type_info.can_be_area() {
                // Closed way: a single-outer-ring area; the duplicated
                // endpoint is not stored.
                nodes.pop();
                let mut area = Area::new(buffer);
                area.push_ring(Ring::new(OUTER_RING_DEPTH, None, nodes));
                area.write(&mut area_writer)?;
                areas_written += 1;
            } else if type_info.can_be_way() {
                Way::new(buffer, nodes).write(&mut way_writer)?;
                ways_written += 1;
            }
        }

        way_writer.close()?;

        // Append the resolved multipolygon relations.
        let rel_area_path = ctx.directory.join(REL_AREA_TMP);
        if rel_area_path.is_file() {
            let mut scanner = FileScanner::open(&rel_area_path, AccessMode::Sequential, false)?;
            let count = scanner.read_u32()?;
            for _ in 0..count {
                let _relation_id = scanner.read_number()?;
                let area = Area::read(ctx.config, &mut scanner)?;
                area.write(&mut area_writer)?;
                areas_written += 1;
            }
        }

        area_writer.close()?;

        ctx.progress.info(&format!(
            "{index} raw ways read, {ways_written} ways and {areas_written} areas written"
        ));
        Ok(())
    }
}
