//! # Location service
//!
//! A read-only hierarchical search over admin regions, locations (streets
//! and POIs) and addresses. The region tree and the per-region locations are
//! small and loaded eagerly from `location.idx`; addresses stay on disk in
//! `locationaddr.dat` and are read through a mutex-guarded scanner.

use crate::io::{AccessMode, FileScanner, FileWriter, IoError};
use crate::{FileOffset, ObjectFileRef, RefType};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const LOCATION_IDX: &str = "location.idx";
pub const LOCATION_ADDR_DAT: &str = "locationaddr.dat";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("Lock is poisoned: {0}")]
    PoisonedLock(String),
    #[error("'{path}' carries format version {found}, supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
    #[error("Invalid value {value} for {what} in location index")]
    InvalidValue { what: &'static str, value: u64 },
}

#[repr(u8)]
#[derive(TryFromPrimitive, IntoPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LocationKind {
    Street = 0,
    Poi = 1,
}

/// Administrative polygon, possibly with secondary names (aliases).
#[derive(Debug, Clone, PartialEq)]
pub struct AdminRegion {
    pub name: String,
    pub aliases: Vec<String>,
    pub object: ObjectFileRef,
    pub admin_level: u8,
}

/// A street or POI within a region.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub name: String,
    pub kind: LocationKind,
    pub objects: Vec<ObjectFileRef>,
    /// Offset of the address block in `locationaddr.dat`, if any.
    addresses: Option<FileOffset>,
}

/// A numbered address on a location.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub name: String,
    pub object: ObjectFileRef,
}

struct RegionEntry {
    region: AdminRegion,
    parent: Option<usize>,
    children: Vec<usize>,
    locations: Vec<Location>,
}

/// Match quality of one facet of a search result.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum MatchQuality {
    None,
    Candidate,
    Match,
}

#[derive(Debug, Clone)]
pub struct LocationSearchResult {
    pub region_index: usize,
    pub region: String,
    pub location: Option<String>,
    pub address: Option<String>,
    pub objects: Vec<ObjectFileRef>,
    pub region_quality: MatchQuality,
    pub location_quality: MatchQuality,
    pub address_quality: MatchQuality,
}

/// Result of resolving an object back into the location hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseLookupResult {
    /// Region names from the matched region up to the root.
    pub region_path: Vec<String>,
    pub location: Option<String>,
}

pub struct LocationIndex {
    entries: Vec<RegionEntry>,
    roots: Vec<usize>,
    addr_scanner: Mutex<FileScanner>,
}

impl LocationIndex {
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, LocationError> {
        let directory = directory.as_ref();
        let path = directory.join(LOCATION_IDX);
        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false)?;

        let version = scanner.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(LocationError::UnsupportedVersion {
                path,
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let mut entries = Vec::new();
        let mut roots = Vec::new();

        let root_count = scanner.read_number()?;
        for _ in 0..root_count {
            let root = read_region(&mut scanner, &mut entries, None)?;
            roots.push(root);
        }
        scanner.close()?;

        let addr_scanner = FileScanner::open(
            directory.join(LOCATION_ADDR_DAT),
            AccessMode::LowMemRandom,
            false,
        )?;

        Ok(Self {
            entries,
            roots,
            addr_scanner: Mutex::new(addr_scanner),
        })
    }

    pub fn region_count(&self) -> usize {
        self.entries.len()
    }

    pub fn region(&self, index: usize) -> Option<&AdminRegion> {
        self.entries.get(index).map(|e| &e.region)
    }

    /// Depth-first visit of the region tree. The visitor returns whether to
    /// descend into the children of the visited region.
    pub fn visit_admin_regions(&self, visitor: &mut dyn FnMut(usize, &AdminRegion, usize) -> bool) {
        fn walk(
            entries: &[RegionEntry],
            index: usize,
            depth: usize,
            visitor: &mut dyn FnMut(usize, &AdminRegion, usize) -> bool,
        ) {
            if visitor(index, &entries[index].region, depth) {
                for child in &entries[index].children {
                    walk(entries, *child, depth + 1, visitor);
                }
            }
        }

        for root in &self.roots {
            walk(&self.entries, *root, 0, visitor);
        }
    }

    /// Visits the locations of one region.
    pub fn visit_locations(&self, region_index: usize, visitor: &mut dyn FnMut(&Location)) {
        if let Some(entry) = self.entries.get(region_index) {
            for location in &entry.locations {
                visitor(location);
            }
        }
    }

    /// Visits the addresses of one location, reading them from disk.
    pub fn visit_addresses(
        &self,
        location: &Location,
        visitor: &mut dyn FnMut(&Address),
    ) -> Result<(), LocationError> {
        let Some(offset) = location.addresses else {
            return Ok(());
        };

        let mut scanner = self
            .addr_scanner
            .lock()
            .map_err(|e| LocationError::PoisonedLock(e.to_string()))?;
        scanner.set_pos(offset)?;

        let count = scanner.read_number()?;
        for _ in 0..count {
            let name = scanner.read_string()?;
            let object = read_object_ref(&mut scanner)?;
            visitor(&Address { name, object });
        }

        Ok(())
    }

    /// Resolves an object reference back into `(region path, location)`.
    pub fn reverse_lookup(&self, object: ObjectFileRef) -> Option<ReverseLookupResult> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.region.object == object {
                return Some(ReverseLookupResult {
                    region_path: self.region_path(index),
                    location: None,
                });
            }

            for location in &entry.locations {
                if location.objects.contains(&object) {
                    return Some(ReverseLookupResult {
                        region_path: self.region_path(index),
                        location: Some(location.name.clone()),
                    });
                }
            }
        }
        None
    }

    fn region_path(&self, mut index: usize) -> Vec<String> {
        let mut path = vec![self.entries[index].region.name.clone()];
        while let Some(parent) = self.entries[index].parent {
            path.push(self.entries[parent].region.name.clone());
            index = parent;
        }
        path
    }

    /// Token-based partial-match search over regions, locations and
    /// addresses. Results are ranked by their per-facet match qualities.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<LocationSearchResult>, LocationError> {
        let tokens: Vec<String> = query
            .split([',', ' '])
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();

        for (region_index, entry) in self.entries.iter().enumerate() {
            let names = std::iter::once(&entry.region.name).chain(&entry.region.aliases);
            let (region_quality, region_token) = best_match(names, &tokens);
            if region_quality == MatchQuality::None {
                continue;
            }

            let remaining: Vec<&String> = tokens
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != region_token)
                .map(|(_, t)| t)
                .collect();

            if remaining.is_empty() {
                results.push(LocationSearchResult {
                    region_index,
                    region: entry.region.name.clone(),
                    location: None,
                    address: None,
                    objects: vec![entry.region.object],
                    region_quality,
                    location_quality: MatchQuality::None,
                    address_quality: MatchQuality::None,
                });
                continue;
            }

            for location in &entry.locations {
                let (location_quality, location_token) =
                    best_match(std::iter::once(&location.name), &remaining);
                if location_quality == MatchQuality::None {
                    continue;
                }

                let address_tokens: Vec<&String> = remaining
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != location_token)
                    .map(|(_, t)| *t)
                    .collect();

                let mut address = None;
                let mut address_quality = MatchQuality::None;
                let mut objects = location.objects.clone();

                if !address_tokens.is_empty() {
                    self.visit_addresses(location, &mut |candidate| {
                        let name = candidate.name.to_lowercase();
                        for token in &address_tokens {
                            let quality = if name == **token {
                                MatchQuality::Match
                            } else if name.starts_with(*token) {
                                MatchQuality::Candidate
                            } else {
                                MatchQuality::None
                            };
                            if quality > address_quality {
                                address_quality = quality;
                                address = Some(candidate.name.clone());
                                objects = vec![candidate.object];
                            }
                        }
                    })?;
                }

                results.push(LocationSearchResult {
                    region_index,
                    region: entry.region.name.clone(),
                    location: Some(location.name.clone()),
                    address,
                    objects,
                    region_quality,
                    location_quality,
                    address_quality,
                });
            }
        }

        results.sort_by(|a, b| {
            (b.region_quality, b.location_quality, b.address_quality)
                .cmp(&(a.region_quality, a.location_quality, a.address_quality))
                .then_with(|| a.region.cmp(&b.region))
        });
        results.truncate(limit);

        Ok(results)
    }
}

/// Best match quality of any candidate name against any token, plus the
/// index of the consumed token.
fn best_match<'a, N, T>(names: N, tokens: &[T]) -> (MatchQuality, Option<usize>)
where
    N: IntoIterator<Item = &'a String>,
    T: AsRef<str>,
{
    let mut best = (MatchQuality::None, None);

    for name in names {
        let name = name.to_lowercase();
        for (index, token) in tokens.iter().enumerate() {
            let token = token.as_ref();
            let quality = if name == token {
                MatchQuality::Match
            } else if name.starts_with(token) {
                MatchQuality::Candidate
            } else {
                MatchQuality::None
            };
            if quality > best.0 {
                best = (quality, Some(index));
            }
        }
    }

    best
}

fn read_region(
    scanner: &mut FileScanner,
    entries: &mut Vec<RegionEntry>,
    parent: Option<usize>,
) -> Result<usize, LocationError> {
    let name = scanner.read_string()?;

    let alias_count = scanner.read_number()?;
    let aliases = (0..alias_count)
        .map(|_| scanner.read_string())
        .collect::<Result<Vec<_>, _>>()?;

    let object = read_object_ref(scanner)?;
    let admin_level = scanner.read_u8()?;

    let location_count = scanner.read_number()?;
    let mut locations = Vec::with_capacity(location_count as usize);
    for _ in 0..location_count {
        let location_name = scanner.read_string()?;
        let kind_raw = scanner.read_u8()?;
        let kind = LocationKind::try_from(kind_raw).map_err(|_| LocationError::InvalidValue {
            what: "location kind",
            value: u64::from(kind_raw),
        })?;

        let object_count = scanner.read_number()?;
        let objects = (0..object_count)
            .map(|_| read_object_ref(scanner))
            .collect::<Result<Vec<_>, _>>()?;

        let has_addresses = scanner.read_bool()?;
        let addresses = if has_addresses {
            Some(scanner.read_file_offset()?)
        } else {
            None
        };

        locations.push(Location {
            name: location_name,
            kind,
            objects,
            addresses,
        });
    }

    let index = entries.len();
    entries.push(RegionEntry {
        region: AdminRegion {
            name,
            aliases,
            object,
            admin_level,
        },
        parent,
        children: Vec::new(),
        locations,
    });

    let child_count = scanner.read_number()?;
    for _ in 0..child_count {
        let child = read_region(scanner, entries, Some(index))?;
        entries[index].children.push(child);
    }

    Ok(index)
}

fn read_object_ref(scanner: &mut FileScanner) -> Result<ObjectFileRef, LocationError> {
    let raw = scanner.read_u8()?;
    let ref_type = RefType::try_from(raw).map_err(|_| LocationError::InvalidValue {
        what: "object ref",
        value: u64::from(raw),
    })?;
    let offset = scanner.read_number()?;
    Ok(ObjectFileRef::new(ref_type, offset))
}

// ---------------------------------------------------------------------------
// Build side
// ---------------------------------------------------------------------------

/// Input describing one location and its addresses.
#[derive(Debug, Clone, Default)]
pub struct LocationData {
    pub name: String,
    pub kind: Option<LocationKind>,
    pub objects: Vec<ObjectFileRef>,
    pub addresses: Vec<(String, ObjectFileRef)>,
}

/// Input describing one region subtree.
#[derive(Debug, Clone)]
pub struct RegionData {
    pub name: String,
    pub aliases: Vec<String>,
    pub object: ObjectFileRef,
    pub admin_level: u8,
    pub locations: Vec<LocationData>,
    pub children: Vec<RegionData>,
}

/// Writes `location.idx` and `locationaddr.dat` from a region forest.
pub fn build_location_index(
    directory: impl AsRef<Path>,
    regions: &[RegionData],
) -> Result<(), LocationError> {
    let directory = directory.as_ref();

    // Addresses first, so the index can reference their blocks.
    let mut addr_writer = FileWriter::open(directory.join(LOCATION_ADDR_DAT))?;

    fn write_addresses(
        writer: &mut FileWriter,
        regions: &[RegionData],
        offsets: &mut Vec<Option<FileOffset>>,
    ) -> Result<(), LocationError> {
        for region in regions {
            for location in &region.locations {
                if location.addresses.is_empty() {
                    offsets.push(None);
                    continue;
                }

                offsets.push(Some(writer.pos()));
                writer.write_number(location.addresses.len() as u64)?;
                for (name, object) in &location.addresses {
                    writer.write_string(name)?;
                    write_object_ref(writer, *object)?;
                }
            }
            write_addresses(writer, &region.children, offsets)?;
        }
        Ok(())
    }

    let mut address_offsets = Vec::new();
    write_addresses(&mut addr_writer, regions, &mut address_offsets)?;
    addr_writer.close()?;

    let mut writer = FileWriter::open(directory.join(LOCATION_IDX))?;
    writer.write_u32(FORMAT_VERSION)?;
    writer.write_number(regions.len() as u64)?;

    fn write_region(
        writer: &mut FileWriter,
        region: &RegionData,
        address_offsets: &[Option<FileOffset>],
        next_location: &mut usize,
    ) -> Result<(), LocationError> {
        writer.write_string(&region.name)?;

        writer.write_number(region.aliases.len() as u64)?;
        for alias in &region.aliases {
            writer.write_string(alias)?;
        }

        write_object_ref(writer, region.object)?;
        writer.write_u8(region.admin_level)?;

        writer.write_number(region.locations.len() as u64)?;
        for location in &region.locations {
            writer.write_string(&location.name)?;
            writer.write_u8(location.kind.unwrap_or(LocationKind::Street).into())?;

            writer.write_number(location.objects.len() as u64)?;
            for object in &location.objects {
                write_object_ref(writer, *object)?;
            }

            let offset = address_offsets[*next_location];
            *next_location += 1;
            writer.write_bool(offset.is_some())?;
            if let Some(offset) = offset {
                writer.write_file_offset(offset)?;
            }
        }

        writer.write_number(region.children.len() as u64)?;
        for child in &region.children {
            write_region(writer, child, address_offsets, next_location)?;
        }

        Ok(())
    }

    let mut next_location = 0;
    for region in regions {
        write_region(&mut writer, region, &address_offsets, &mut next_location)?;
    }
    writer.close()?;

    Ok(())
}

fn write_object_ref(writer: &mut FileWriter, object: ObjectFileRef) -> Result<(), LocationError> {
    writer.write_u8(object.ref_type().into())?;
    writer.write_number(object.offset())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(offset: FileOffset) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Area, offset)
    }

    fn way(offset: FileOffset) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Way, offset)
    }

    fn node(offset: FileOffset) -> ObjectFileRef {
        ObjectFileRef::new(RefType::Node, offset)
    }

    fn build_test_index(dir: &Path) -> LocationIndex {
        let regions = vec![RegionData {
            name: "Bonn".to_string(),
            aliases: vec!["Bundesstadt Bonn".to_string()],
            object: area(10),
            admin_level: 6,
            locations: vec![LocationData {
                name: "Marktplatz".to_string(),
                kind: Some(LocationKind::Street),
                objects: vec![way(100)],
                addresses: vec![
                    ("1".to_string(), node(1000)),
                    ("2a".to_string(), node(1001)),
                ],
            }],
            children: vec![RegionData {
                name: "Bad Godesberg".to_string(),
                aliases: Vec::new(),
                object: area(20),
                admin_level: 9,
                locations: vec![LocationData {
                    name: "Theaterplatz".to_string(),
                    kind: Some(LocationKind::Street),
                    objects: vec![way(200)],
                    addresses: Vec::new(),
                }],
                children: Vec::new(),
            }],
        }];

        build_location_index(dir, &regions).unwrap();
        LocationIndex::open(dir).unwrap()
    }

    #[test]
    fn region_tree_visit_order_and_depth() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_test_index(dir.path());

        let mut visited = Vec::new();
        index.visit_admin_regions(&mut |_, region, depth| {
            visited.push((region.name.clone(), depth));
            true
        });

        assert_eq!(
            visited,
            vec![
                ("Bonn".to_string(), 0),
                ("Bad Godesberg".to_string(), 1)
            ]
        );

        // Not descending skips the subtree.
        let mut count = 0;
        index.visit_admin_regions(&mut |_, _, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn locations_and_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_test_index(dir.path());

        let mut names = Vec::new();
        index.visit_locations(0, &mut |location| names.push(location.name.clone()));
        assert_eq!(names, vec!["Marktplatz"]);

        let mut location = None;
        index.visit_locations(0, &mut |l| location = Some(l.clone()));
        let location = location.unwrap();

        let mut addresses = Vec::new();
        index
            .visit_addresses(&location, &mut |address| addresses.push(address.clone()))
            .unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].name, "1");
        assert_eq!(addresses[1].object, node(1001));
    }

    #[test]
    fn reverse_lookup_builds_region_path() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_test_index(dir.path());

        let result = index.reverse_lookup(way(200)).unwrap();
        assert_eq!(result.region_path, vec!["Bad Godesberg", "Bonn"]);
        assert_eq!(result.location.as_deref(), Some("Theaterplatz"));

        let region = index.reverse_lookup(area(10)).unwrap();
        assert_eq!(region.region_path, vec!["Bonn"]);
        assert_eq!(region.location, None);

        assert!(index.reverse_lookup(way(999)).is_none());
    }

    #[test]
    fn search_quality_bins() {
        let dir = tempfile::tempdir().unwrap();
        let index = build_test_index(dir.path());

        // Exact region, exact location.
        let results = index.search("bonn marktplatz", 10).unwrap();
        let best = &results[0];
        assert_eq!(best.region, "Bonn");
        assert_eq!(best.location.as_deref(), Some("Marktplatz"));
        assert_eq!(best.region_quality, MatchQuality::Match);
        assert_eq!(best.location_quality, MatchQuality::Match);

        // Prefix matches bin as candidates.
        let results = index.search("bonn markt", 10).unwrap();
        assert_eq!(results[0].location_quality, MatchQuality::Candidate);

        // Alias matching.
        let results = index.search("bundesstadt", 10).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].region, "Bonn");

        // Address token narrows down to the address object.
        let results = index.search("bonn marktplatz 2a", 10).unwrap();
        let best = &results[0];
        assert_eq!(best.address.as_deref(), Some("2a"));
        assert_eq!(best.address_quality, MatchQuality::Match);
        assert_eq!(best.objects, vec![node(1001)]);

        // Nothing matching is a regular empty result.
        assert!(index.search("atlantis", 10).unwrap().is_empty());
    }
}
