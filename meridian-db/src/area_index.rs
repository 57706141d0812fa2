//! # Tiled area index
//!
//! A bitmap index keyed by `(type, level)`: per indexed type one level of
//! cells, where each non-empty cell points into a packed data region holding
//! the delta-encoded file offsets of the objects touching that cell. One
//! index file exists per object kind (`areanode.idx`, `areaway.idx`,
//! `areaarea.idx`).

use crate::FileOffset;
use crate::geom::GeoBox;
use crate::io::{
    AccessMode, FileScanner, FileWriter, IoError, append_varint, bytes_needed_for_offset,
};
use crate::tile::{TileId, TileIdBox};
use crate::types::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const AREA_NODE_IDX: &str = "areanode.idx";
pub const AREA_WAY_IDX: &str = "areaway.idx";
pub const AREA_AREA_IDX: &str = "areaarea.idx";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("Index lock is poisoned: {0}")]
    PoisonedLock(String),
    #[error("'{path}' carries format version {found}, supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
    #[error(transparent)]
    Object(#[from] crate::objects::ObjectError),
}

/// Per-type cell range and bitmap location.
#[derive(Debug, Clone)]
struct TypeData {
    level: u32,
    cell_x_start: u32,
    cell_x_end: u32,
    cell_y_start: u32,
    cell_y_end: u32,
    bitmap_offset: FileOffset,
    data_offset: FileOffset,
    data_offset_bytes: u8,
}

impl TypeData {
    const fn cell_x_count(&self) -> u64 {
        (self.cell_x_end - self.cell_x_start + 1) as u64
    }
}

/// Read side of the index. Queries serialise the underlying reader with an
/// index-scoped mutex, so concurrent callers are safe.
pub struct AreaIndex {
    scanner: Mutex<FileScanner>,
    types: HashMap<TypeId, TypeData>,
}

impl AreaIndex {
    pub fn open(path: impl AsRef<Path>, memory_mapped: bool) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let mut scanner = FileScanner::open(path, AccessMode::LowMemRandom, memory_mapped)?;

        let index_offset = scanner.read_file_offset()?;
        scanner.set_pos(index_offset)?;

        let version = scanner.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let mut types = HashMap::new();
        let type_count = scanner.read_number()?;
        for _ in 0..type_count {
            let type_id = scanner.read_u16()?;
            let data = TypeData {
                level: scanner.read_u32()?,
                cell_x_start: scanner.read_u32()?,
                cell_x_end: scanner.read_u32()?,
                cell_y_start: scanner.read_u32()?,
                cell_y_end: scanner.read_u32()?,
                bitmap_offset: scanner.read_file_offset()?,
                data_offset: scanner.read_file_offset()?,
                data_offset_bytes: scanner.read_u8()?,
            };
            types.insert(type_id, data);
        }

        Ok(Self {
            scanner: Mutex::new(scanner),
            types,
        })
    }

    /// Collects the file offsets of all objects of the given types whose
    /// cell range intersects `geo_box`. The result is deduplicated; it may
    /// contain supersets of the exact intersection (cell granularity).
    pub fn get_offsets(
        &self,
        types: &[TypeId],
        geo_box: &GeoBox,
    ) -> Result<BTreeSet<FileOffset>, IndexError> {
        let mut result = BTreeSet::new();

        let mut scanner = self
            .scanner
            .lock()
            .map_err(|e| IndexError::PoisonedLock(e.to_string()))?;

        for type_id in types {
            let Some(data) = self.types.get(type_id) else {
                continue;
            };

            let tile_box = TileIdBox::from_geo_box(data.level, geo_box);

            let min_x = tile_box.min.x.max(data.cell_x_start);
            let max_x = tile_box.max.x.min(data.cell_x_end);
            let min_y = tile_box.min.y.max(data.cell_y_start);
            let max_y = tile_box.max.y.min(data.cell_y_end);

            if min_x > max_x || min_y > max_y {
                continue;
            }

            for y in min_y..=max_y {
                for x in min_x..=max_x {
                    let cell_index = u64::from(y - data.cell_y_start) * data.cell_x_count()
                        + u64::from(x - data.cell_x_start);
                    let word_offset =
                        data.bitmap_offset + cell_index * u64::from(data.data_offset_bytes);

                    scanner.set_pos(word_offset)?;
                    let word = scanner.read_sized_file_offset(data.data_offset_bytes)?;
                    if word == 0 {
                        continue;
                    }

                    scanner.set_pos(data.data_offset + word - 1)?;
                    let count = scanner.read_number()?;
                    let mut offset = 0;
                    for _ in 0..count {
                        offset += scanner.read_number()?;
                        result.insert(offset);
                    }
                }
            }
        }

        Ok(result)
    }

    /// The types this index carries entries for.
    pub fn indexed_types(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.types.keys().copied()
    }
}

/// Build side, driven by the import pipeline.
pub struct AreaIndexBuilder {
    entries: Vec<(TypeId, u32, BTreeMap<TileId, Vec<FileOffset>>)>,
}

impl Default for AreaIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AreaIndexBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers the cell-to-offsets mapping of one type at its index level.
    pub fn push_type(
        &mut self,
        type_id: TypeId,
        level: u32,
        cells: BTreeMap<TileId, Vec<FileOffset>>,
    ) {
        if !cells.is_empty() {
            self.entries.push((type_id, level, cells));
        }
    }

    pub fn write(self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let mut writer = FileWriter::open(path)?;

        // Placeholder for the absolute index offset, patched at the end.
        writer.write_file_offset(0)?;

        let mut type_data = Vec::with_capacity(self.entries.len());

        for (type_id, level, cells) in &self.entries {
            let cell_x_start = cells.keys().map(|t| t.x).min().expect("non-empty cells");
            let cell_x_end = cells.keys().map(|t| t.x).max().expect("non-empty cells");
            let cell_y_start = cells.keys().map(|t| t.y).min().expect("non-empty cells");
            let cell_y_end = cells.keys().map(|t| t.y).max().expect("non-empty cells");

            let cell_x_count = u64::from(cell_x_end - cell_x_start + 1);
            let cell_y_count = u64::from(cell_y_end - cell_y_start + 1);

            // Lay out the data region in memory first; cell words point at
            // it with a bias of one so that zero can mean "empty".
            let mut data_region = Vec::new();
            let mut cell_words: HashMap<TileId, u64> = HashMap::new();

            for (tile, offsets) in cells {
                let mut offsets = offsets.clone();
                offsets.sort_unstable();
                offsets.dedup();

                cell_words.insert(*tile, data_region.len() as u64 + 1);
                append_varint(&mut data_region, offsets.len() as u64);
                let mut previous = 0;
                for offset in offsets {
                    append_varint(&mut data_region, offset - previous);
                    previous = offset;
                }
            }

            let data_offset_bytes = bytes_needed_for_offset(data_region.len() as u64 + 1);

            let bitmap_offset = writer.pos();
            for y in 0..cell_y_count {
                for x in 0..cell_x_count {
                    let tile = TileId::new(
                        cell_x_start + x as u32,
                        cell_y_start + y as u32,
                    );
                    let word = cell_words.get(&tile).copied().unwrap_or(0);
                    writer.write_sized_file_offset(word, data_offset_bytes)?;
                }
            }

            let data_offset = writer.pos();
            writer.write_bytes(&data_region)?;

            type_data.push((
                *type_id,
                TypeData {
                    level: *level,
                    cell_x_start,
                    cell_x_end,
                    cell_y_start,
                    cell_y_end,
                    bitmap_offset,
                    data_offset,
                    data_offset_bytes,
                },
            ));
        }

        let index_offset = writer.pos();
        writer.write_u32(FORMAT_VERSION)?;
        writer.write_number(type_data.len() as u64)?;
        for (type_id, data) in type_data {
            writer.write_u16(type_id)?;
            writer.write_u32(data.level)?;
            writer.write_u32(data.cell_x_start)?;
            writer.write_u32(data.cell_x_end)?;
            writer.write_u32(data.cell_y_start)?;
            writer.write_u32(data.cell_y_end)?;
            writer.write_file_offset(data.bitmap_offset)?;
            writer.write_file_offset(data.data_offset)?;
            writer.write_u8(data.data_offset_bytes)?;
        }

        writer.set_pos(0)?;
        writer.write_file_offset(index_offset)?;
        writer.close()?;

        Ok(())
    }
}

/// Distributes object offsets over the cells their bounding box touches at
/// the given level; the builder input for one type.
pub fn cells_for_objects(
    level: u32,
    objects: impl IntoIterator<Item = (FileOffset, GeoBox)>,
) -> BTreeMap<TileId, Vec<FileOffset>> {
    let mut cells: BTreeMap<TileId, Vec<FileOffset>> = BTreeMap::new();

    for (offset, geo_box) in objects {
        for tile in TileIdBox::from_geo_box(level, &geo_box).iter() {
            cells.entry(tile).or_default().push(offset);
        }
    }

    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::GeoCoord;

    fn small_box(lat: f64, lon: f64, size: f64) -> GeoBox {
        GeoBox::new(
            GeoCoord::new(lat, lon),
            GeoCoord::new(lat + size, lon + size),
        )
    }

    fn build_index(dir: &Path) -> AreaIndex {
        let mut builder = AreaIndexBuilder::new();

        // Type 1: three objects in two neighbourhoods.
        let objects = vec![
            (100, small_box(50.0, 7.0, 0.01)),
            (200, small_box(50.0, 7.0, 0.01)),
            (300, small_box(52.0, 13.0, 0.01)),
        ];
        builder.push_type(1, 14, cells_for_objects(14, objects));

        // Type 2: a single object near the first neighbourhood.
        builder.push_type(2, 14, cells_for_objects(14, vec![(400, small_box(50.0, 7.0, 0.01))]));

        let path = dir.join("areaway.idx");
        builder.write(&path).unwrap();
        AreaIndex::open(&path, false).unwrap()
    }

    #[test]
    fn query_returns_offsets_by_type_and_region() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_index(dir.path());

        let near_bonn = small_box(49.99, 6.99, 0.05);
        let offsets = index.get_offsets(&[1], &near_bonn).unwrap();
        assert!(offsets.contains(&100));
        assert!(offsets.contains(&200));
        assert!(!offsets.contains(&300));
        assert!(!offsets.contains(&400), "type 2 was not requested");

        let both = index.get_offsets(&[1, 2], &near_bonn).unwrap();
        assert!(both.contains(&400));

        let near_berlin = small_box(51.99, 12.99, 0.05);
        let offsets = index.get_offsets(&[1], &near_berlin).unwrap();
        assert_eq!(offsets.into_iter().collect::<Vec<_>>(), vec![300]);
    }

    #[test]
    fn no_false_negatives_for_intersecting_boxes() {
        let dir = tempfile::tempdir().unwrap();

        // Index every object, then query with each object's own box: the
        // result must always contain the object (invariant 3 of the index).
        let objects: Vec<(FileOffset, GeoBox)> = (0..25)
            .map(|i| {
                let lat = -60.0 + f64::from(i) * 4.3;
                let lon = -150.0 + f64::from(i) * 11.7;
                (i as u64 * 8 + 8, small_box(lat, lon, 0.2))
            })
            .collect();

        let mut builder = AreaIndexBuilder::new();
        builder.push_type(7, 12, cells_for_objects(12, objects.clone()));
        let path = dir.path().join("areaway.idx");
        builder.write(&path).unwrap();
        let index = AreaIndex::open(&path, true).unwrap();

        for (offset, geo_box) in &objects {
            let result = index.get_offsets(&[7], geo_box).unwrap();
            assert!(result.contains(offset), "missing offset {offset}");
        }
    }

    #[test]
    fn point_sized_query_box() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_index(dir.path());

        let point = GeoCoord::new(50.005, 7.005);
        let point_box = GeoBox::new(point, point);
        let offsets = index.get_offsets(&[1], &point_box).unwrap();
        assert!(offsets.contains(&100));
    }

    #[test]
    fn unknown_type_yields_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_index(dir.path());

        let offsets = index
            .get_offsets(&[99], &small_box(50.0, 7.0, 0.1))
            .unwrap();
        assert!(offsets.is_empty());
    }
}
