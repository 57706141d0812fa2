//! # Object stores
//!
//! Load-by-offset access to the sequential object files, with a per-store
//! LRU cache, plus the sorted id-to-offset side index used wherever objects
//! are addressed by their import-time id.

use crate::io::{AccessMode, FileScanner, FileWriter, IoError};
use crate::objects::{Area, Node, ObjectError, Way};
use crate::types::TypeConfig;
use crate::{FileOffset, Id};
use lru::LruCache;
use memmap2::Mmap;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use zerocopy::{FromBytes as _, LE, U64};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error("Cache lock is poisoned: {0}")]
    PoisonedLock(String),
    #[error("Index file '{path}' is malformed: {message}")]
    MalformedIndex { path: PathBuf, message: String },
}

/// A record type that can be materialised from an object store.
pub trait StoredObject: Sized + Send + Sync {
    fn read_record(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError>;
}

impl StoredObject for Node {
    fn read_record(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        Node::read(config, scanner)
    }
}

impl StoredObject for Way {
    fn read_record(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        Way::read(config, scanner)
    }
}

impl StoredObject for Area {
    fn read_record(config: &TypeConfig, scanner: &mut FileScanner) -> Result<Self, ObjectError> {
        Area::read(config, scanner)
    }
}

/// Load-by-offset store over one object file.
///
/// The scanner is serialised behind a store-local mutex for the duration of
/// each seek+read sequence; the cache has its own lock. Queries always
/// return shared, immutable records.
pub struct DataFile<T> {
    config: Arc<TypeConfig>,
    scanner: Mutex<FileScanner>,
    cache: Option<Mutex<LruCache<FileOffset, Arc<T>>>>,
}

impl<T: StoredObject> DataFile<T> {
    pub fn open(
        config: Arc<TypeConfig>,
        path: impl AsRef<Path>,
        mode: AccessMode,
        memory_mapped: bool,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        let scanner = FileScanner::open(path, mode, memory_mapped)?;
        let cache = NonZeroUsize::new(cache_size).map(|size| Mutex::new(LruCache::new(size)));

        Ok(Self {
            config,
            scanner: Mutex::new(scanner),
            cache,
        })
    }

    pub fn config(&self) -> &Arc<TypeConfig> {
        &self.config
    }

    pub fn get_by_offset(&self, offset: FileOffset) -> Result<Arc<T>, StoreError> {
        if let Some(cache) = &self.cache {
            let mut cache = cache
                .lock()
                .map_err(|e| StoreError::PoisonedLock(e.to_string()))?;
            if let Some(hit) = cache.get(&offset) {
                return Ok(hit.clone());
            }
        }

        let record = {
            let mut scanner = self
                .scanner
                .lock()
                .map_err(|e| StoreError::PoisonedLock(e.to_string()))?;
            scanner.set_pos(offset)?;
            Arc::new(T::read_record(&self.config, &mut scanner)?)
        };

        if let Some(cache) = &self.cache {
            let mut cache = cache
                .lock()
                .map_err(|e| StoreError::PoisonedLock(e.to_string()))?;
            cache.put(offset, record.clone());
        }

        Ok(record)
    }

    pub fn get_by_offsets(
        &self,
        offsets: impl IntoIterator<Item = FileOffset>,
    ) -> Result<Vec<Arc<T>>, StoreError> {
        offsets
            .into_iter()
            .map(|offset| self.get_by_offset(offset))
            .collect()
    }

    pub fn flush_cache(&self) {
        if let Some(cache) = &self.cache
            && let Ok(mut cache) = cache.lock()
        {
            cache.clear();
        }
    }
}

/// One fixed-width little-endian record of the id index.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
pub struct IdIndexEntry {
    pub id: U64<LE>,
    pub offset: U64<LE>,
}

/// Memory-mapped, binary-searchable id-to-offset index.
pub struct IdIndex {
    path: PathBuf,
    map: Option<Mmap>,
}

impl IdIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| IoError::Io {
            path: path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| IoError::Io {
                path: path.clone(),
                source,
            })?
            .len();

        let map = if size == 0 {
            None
        } else {
            // SAFETY: index files are immutable while the database is open.
            Some(unsafe { Mmap::map(&file) }.map_err(|source| IoError::Io {
                path: path.clone(),
                source,
            })?)
        };

        Ok(Self { path, map })
    }

    fn entries(&self) -> Result<&[IdIndexEntry], StoreError> {
        let Some(map) = &self.map else {
            return Ok(&[]);
        };

        <[IdIndexEntry]>::ref_from_bytes(&map[..]).map_err(|e| StoreError::MalformedIndex {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len() / size_of::<IdIndexEntry>())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the file offset of the record with the given id.
    pub fn offset_of(&self, id: Id) -> Result<Option<FileOffset>, StoreError> {
        let entries = self.entries()?;
        Ok(entries
            .binary_search_by_key(&id, |entry| entry.id.get())
            .ok()
            .map(|index| entries[index].offset.get()))
    }

    /// Writes the index file from (id, offset) pairs; sorts by id first.
    pub fn build(
        path: impl AsRef<Path>,
        mut entries: Vec<(Id, FileOffset)>,
    ) -> Result<(), IoError> {
        entries.sort_unstable_by_key(|(id, _)| *id);

        let mut writer = FileWriter::open(path)?;
        for (id, offset) in entries {
            writer.write_u64(id)?;
            writer.write_u64(offset)?;
        }
        writer.close()
    }
}

/// An object store paired with its id index.
pub struct IndexedDataFile<T> {
    data: DataFile<T>,
    index: IdIndex,
}

impl<T: StoredObject> IndexedDataFile<T> {
    pub fn open(
        config: Arc<TypeConfig>,
        data_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        mode: AccessMode,
        memory_mapped: bool,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            data: DataFile::open(config, data_path, mode, memory_mapped, cache_size)?,
            index: IdIndex::open(index_path)?,
        })
    }

    pub fn data(&self) -> &DataFile<T> {
        &self.data
    }

    pub fn offset_of(&self, id: Id) -> Result<Option<FileOffset>, StoreError> {
        self.index.offset_of(id)
    }

    pub fn get_by_offset(&self, offset: FileOffset) -> Result<Arc<T>, StoreError> {
        self.data.get_by_offset(offset)
    }

    pub fn get(&self, id: Id) -> Result<Option<Arc<T>>, StoreError> {
        match self.index.offset_of(id)? {
            Some(offset) => Ok(Some(self.data.get_by_offset(offset)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{GeoCoord, Point};
    use crate::objects::Way;
    use crate::progress::SilentTagErrorReporter;
    use crate::types::{FeatureKind, FeatureValueBuffer, TypeInfo};
    use crate::{ObjectOsmRef, OsmRefType, Vehicle};

    fn build_ways(dir: &Path) -> (Arc<TypeConfig>, Vec<(Id, FileOffset)>) {
        let mut config = TypeConfig::new();
        config
            .register_type(
                TypeInfo::new("highway_residential")
                    .with_way()
                    .with_route(Vehicle::Car)
                    .with_feature(FeatureKind::Name),
            )
            .unwrap();

        let info = config.type_by_name("highway_residential").unwrap();
        let mut writer = FileWriter::open(dir.join("ways.dat")).unwrap();
        let mut offsets = Vec::new();

        for id in 1..=5u64 {
            let tags = config.tag_map_from_pairs([("name", format!("Weg {id}").as_str())]);
            let mut buffer = FeatureValueBuffer::new(info.clone());
            buffer.parse(
                &SilentTagErrorReporter,
                &config,
                &ObjectOsmRef::new(id, OsmRefType::Way),
                &tags,
            );

            let way = Way::new(
                buffer,
                vec![
                    Point::new(id * 10, GeoCoord::new(50.0, 7.0)),
                    Point::new(id * 10 + 1, GeoCoord::new(50.001, 7.001)),
                ],
            );

            offsets.push((id, writer.pos()));
            way.write(&mut writer).unwrap();
        }
        writer.close().unwrap();

        (Arc::new(config), offsets)
    }

    #[test]
    fn data_file_loads_and_caches_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (config, offsets) = build_ways(dir.path());

        let store: DataFile<Way> = DataFile::open(
            config,
            dir.path().join("ways.dat"),
            AccessMode::LowMemRandom,
            false,
            4,
        )
        .unwrap();

        // Out-of-order access with repeats must return consistent records.
        for (id, offset) in offsets.iter().rev().chain(offsets.iter()) {
            let way = store.get_by_offset(*offset).unwrap();
            assert_eq!(
                way.buffer.text_of(FeatureKind::Name),
                Some(format!("Weg {id}").as_str())
            );
            assert_eq!(way.file_offset(), *offset);
        }

        let first = store.get_by_offset(offsets[0].1).unwrap();
        let again = store.get_by_offset(offsets[0].1).unwrap();
        assert!(Arc::ptr_eq(&first, &again), "second load must hit the cache");
    }

    #[test]
    fn id_index_roundtrip_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (config, offsets) = build_ways(dir.path());

        // Deliberately unsorted input.
        let mut shuffled = offsets.clone();
        shuffled.reverse();
        IdIndex::build(dir.path().join("ways.idx"), shuffled).unwrap();

        let indexed: IndexedDataFile<Way> = IndexedDataFile::open(
            config,
            dir.path().join("ways.dat"),
            dir.path().join("ways.idx"),
            AccessMode::FastRandom,
            true,
            0,
        )
        .unwrap();

        for (id, offset) in &offsets {
            assert_eq!(indexed.offset_of(*id).unwrap(), Some(*offset));
            assert!(indexed.get(*id).unwrap().is_some());
        }
        assert_eq!(indexed.offset_of(999).unwrap(), None);
        assert!(indexed.get(999).unwrap().is_none());
    }

    #[test]
    fn empty_index_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        IdIndex::build(dir.path().join("empty.idx"), Vec::new()).unwrap();

        let index = IdIndex::open(dir.path().join("empty.idx")).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.offset_of(1).unwrap(), None);
    }
}
