//! # Optimised low-zoom ways
//!
//! A level-keyed secondary index storing pre-simplified way geometry for a
//! handful of overview magnifications, so rendering small scales does not
//! have to load full-detail geometry. Same tiling discipline as the area
//! index; the data region stores complete way records.

use crate::area_index::IndexError;
use crate::geom::GeoBox;
use crate::io::{AccessMode, FileScanner, FileWriter, bytes_needed_for_offset};
use crate::objects::Way;
use crate::tile::{Magnification, TileId, TileIdBox};
use crate::types::{TypeConfig, TypeId};
use crate::FileOffset;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const WAYS_OPT_DAT: &str = "waysopt.dat";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
struct LevelData {
    optimization_level: u32,
    index_level: u32,
    cell_x_start: u32,
    cell_x_end: u32,
    cell_y_start: u32,
    cell_y_end: u32,
    bitmap_offset: FileOffset,
    data_offset: FileOffset,
    data_offset_bytes: u8,
}

impl LevelData {
    const fn cell_x_count(&self) -> u64 {
        (self.cell_x_end - self.cell_x_start + 1) as u64
    }
}

/// Read side of `waysopt.dat`.
pub struct LowZoomIndex {
    config: Arc<TypeConfig>,
    scanner: Mutex<FileScanner>,
    max_optimization_level: u32,
    types: HashMap<TypeId, Vec<LevelData>>,
}

impl LowZoomIndex {
    pub fn open(
        config: Arc<TypeConfig>,
        path: impl AsRef<Path>,
        memory_mapped: bool,
    ) -> Result<Self, IndexError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut scanner = FileScanner::open(&path, AccessMode::LowMemRandom, memory_mapped)?;

        let index_offset = scanner.read_file_offset()?;
        scanner.set_pos(index_offset)?;

        let version = scanner.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path,
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let max_optimization_level = scanner.read_u32()?;

        let mut types: HashMap<TypeId, Vec<LevelData>> = HashMap::new();
        let entry_count = scanner.read_number()?;
        for _ in 0..entry_count {
            let type_id = scanner.read_u16()?;
            let data = LevelData {
                optimization_level: scanner.read_u32()?,
                index_level: scanner.read_u32()?,
                cell_x_start: scanner.read_u32()?,
                cell_x_end: scanner.read_u32()?,
                cell_y_start: scanner.read_u32()?,
                cell_y_end: scanner.read_u32()?,
                bitmap_offset: scanner.read_file_offset()?,
                data_offset: scanner.read_file_offset()?,
                data_offset_bytes: scanner.read_u8()?,
            };
            types.entry(type_id).or_default().push(data);
        }

        Ok(Self {
            config,
            scanner: Mutex::new(scanner),
            max_optimization_level,
            types,
        })
    }

    pub const fn max_optimization_level(&self) -> u32 {
        self.max_optimization_level
    }

    /// Whether any optimised geometry exists for the type.
    pub fn has_type(&self, type_id: TypeId) -> bool {
        self.types.contains_key(&type_id)
    }

    /// Loads the simplified ways of the given types intersecting `geo_box`.
    ///
    /// Per type the optimisation level closest below the magnification is
    /// selected. The second result lists the types this index could serve;
    /// the caller falls back to the regular way index for the rest.
    pub fn get_ways(
        &self,
        magnification: Magnification,
        types: &[TypeId],
        geo_box: &GeoBox,
    ) -> Result<(Vec<Way>, BTreeSet<TypeId>), IndexError> {
        let mut ways = Vec::new();
        let mut covered = BTreeSet::new();

        let mut scanner = self
            .scanner
            .lock()
            .map_err(|e| IndexError::PoisonedLock(e.to_string()))?;

        for type_id in types {
            let Some(levels) = self.types.get(type_id) else {
                continue;
            };

            // The closest optimisation level at or below the requested one.
            let Some(data) = levels
                .iter()
                .filter(|d| d.optimization_level <= magnification.level())
                .max_by_key(|d| d.optimization_level)
            else {
                continue;
            };

            covered.insert(*type_id);

            let tile_box = TileIdBox::from_geo_box(data.index_level, geo_box);
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
                    for _ in 0..count {
                        ways.push(Way::read(&self.config, &mut scanner)?);
                    }
                }
            }
        }

        Ok((ways, covered))
    }
}

/// Build side, driven by the import pipeline.
pub struct LowZoomIndexBuilder {
    max_optimization_level: u32,
    entries: Vec<(TypeId, u32, u32, BTreeMap<TileId, Vec<Way>>)>,
}

impl LowZoomIndexBuilder {
    pub fn new(max_optimization_level: u32) -> Self {
        Self {
            max_optimization_level,
            entries: Vec::new(),
        }
    }

    /// Registers the simplified ways of one type at one optimisation level,
    /// distributed over index cells.
    pub fn push_level(
        &mut self,
        type_id: TypeId,
        optimization_level: u32,
        index_level: u32,
        cells: BTreeMap<TileId, Vec<Way>>,
    ) {
        if !cells.is_empty() {
            self.entries
                .push((type_id, optimization_level, index_level, cells));
        }
    }

    pub fn write(self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let mut writer = FileWriter::open(path)?;

        writer.write_file_offset(0)?;

        let mut level_data = Vec::with_capacity(self.entries.len());

        for (type_id, optimization_level, index_level, cells) in &self.entries {
            let cell_x_start = cells.keys().map(|t| t.x).min().expect("non-empty cells");
            let cell_x_end = cells.keys().map(|t| t.x).max().expect("non-empty cells");
            let cell_y_start = cells.keys().map(|t| t.y).min().expect("non-empty cells");
            let cell_y_end = cells.keys().map(|t| t.y).max().expect("non-empty cells");

            // Way records go straight into the file; the bitmap follows and
            // points back with a bias of one.
            let data_offset = writer.pos();
            let mut cell_words: HashMap<TileId, u64> = HashMap::new();

            for (tile, ways) in cells {
                cell_words.insert(*tile, writer.pos() - data_offset + 1);
                writer.write_number(ways.len() as u64)?;
                for way in ways {
                    way.write(&mut writer)?;
                }
            }

            let max_word = writer.pos() - data_offset + 1;
            let data_offset_bytes = bytes_needed_for_offset(max_word);

            let bitmap_offset = writer.pos();
            for y in cell_y_start..=cell_y_end {
                for x in cell_x_start..=cell_x_end {
                    let word = cell_words.get(&TileId::new(x, y)).copied().unwrap_or(0);
                    writer.write_sized_file_offset(word, data_offset_bytes)?;
                }
            }

            level_data.push((
                *type_id,
                LevelData {
                    optimization_level: *optimization_level,
                    index_level: *index_level,
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
        writer.write_u32(self.max_optimization_level)?;
        writer.write_number(level_data.len() as u64)?;
        for (type_id, data) in level_data {
            writer.write_u16(type_id)?;
            writer.write_u32(data.optimization_level)?;
            writer.write_u32(data.index_level)?;
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
