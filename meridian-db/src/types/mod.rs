//! # Type registry and feature schema
//!
//! A [`TypeConfig`] is built once per database (during import from the type
//! definition file, at query time from `types.dat`) and read-only thereafter.
//! It owns the tag registry, the feature registry, and the sealed
//! [`TypeInfo`] records whose feature layout every [`FeatureValueBuffer`]
//! of that type shares.

pub mod buffer;
pub mod feature;
mod ost;

pub use buffer::FeatureValueBuffer;
pub use feature::{
    ACCESS_BACKWARD, ACCESS_BICYCLE, ACCESS_CAR, ACCESS_FOOT, ACCESS_FORWARD, ALL_FEATURES,
    AccessFlag, FeatureKind, FeatureValue, LaneTurn, LanesValue, SidewayFlag,
};
pub use ost::OstError;

use crate::Vehicle;
use crate::io::{AccessMode, FileScanner, FileWriter, IoError};
use bitfield_struct::bitfield;
use enumset::{EnumSet, EnumSetType, enum_set};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a registered tag key. `0` is the reserved "ignore" tag.
pub type TagId = u16;

pub const TAG_IGNORE: TagId = 0;

/// Kind-specific numeric type identifier. `0` is the sentinel ignore type in
/// every kind-specific id space.
pub type TypeId = u16;

pub const TYPE_IGNORE: TypeId = 0;

/// A raw tag map as produced by the import pipeline.
pub type TagMap = HashMap<TagId, String>;

pub const TYPES_DAT: &str = "types.dat";

const FORMAT_VERSION: u32 = 1;

/// The object kinds a tag condition applies to.
#[derive(EnumSetType, Debug)]
pub enum ObjectKind {
    Node,
    Way,
    Area,
    Relation,
}

/// A boolean expression over a tag map.
#[derive(Debug, Clone, PartialEq)]
pub enum TagCondition {
    And(Vec<TagCondition>),
    Or(Vec<TagCondition>),
    Not(Box<TagCondition>),
    Exists { tag: TagId },
    Equals { tag: TagId, value: String },
    OneOf { tag: TagId, values: Vec<String> },
}

impl TagCondition {
    pub fn evaluate(&self, tags: &TagMap) -> bool {
        match self {
            TagCondition::And(conditions) => conditions.iter().all(|c| c.evaluate(tags)),
            TagCondition::Or(conditions) => conditions.iter().any(|c| c.evaluate(tags)),
            TagCondition::Not(condition) => !condition.evaluate(tags),
            TagCondition::Exists { tag } => tags.contains_key(tag),
            TagCondition::Equals { tag, value } => {
                tags.get(tag).is_some_and(|actual| actual == value)
            }
            TagCondition::OneOf { tag, values } => tags
                .get(tag)
                .is_some_and(|actual| values.iter().any(|v| v == actual)),
        }
    }
}

/// A tag condition bound to the object kinds it may classify.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeCondition {
    pub scope: EnumSet<ObjectKind>,
    pub condition: TagCondition,
}

/// Marker for types with dedicated assembly semantics during import.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SpecialType {
    #[default]
    None = 0,
    Multipolygon = 1,
    RouteMaster = 2,
    Route = 3,
}

impl SpecialType {
    const fn into_bits(self) -> u8 {
        self as _
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Multipolygon,
            2 => Self::RouteMaster,
            3 => Self::Route,
            _ => panic!("invalid special type"),
        }
    }
}

/// The persisted behaviour word of a type.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TypeBehaviour {
    #[bits(1)]
    pub can_be_node: bool,
    #[bits(1)]
    pub can_be_way: bool,
    #[bits(1)]
    pub can_be_area: bool,
    #[bits(1)]
    pub can_be_relation: bool,
    #[bits(1)]
    pub is_path: bool,
    #[bits(1)]
    pub can_route_foot: bool,
    #[bits(1)]
    pub can_route_bicycle: bool,
    #[bits(1)]
    pub can_route_car: bool,
    #[bits(1)]
    pub index_as_address: bool,
    #[bits(1)]
    pub index_as_location: bool,
    #[bits(1)]
    pub index_as_region: bool,
    #[bits(1)]
    pub index_as_poi: bool,
    #[bits(1)]
    pub optimize_low_zoom: bool,
    #[bits(1)]
    pub pin_way: bool,
    #[bits(1)]
    pub merge_areas: bool,
    #[bits(1)]
    pub ignore_sea_land: bool,
    #[bits(1)]
    pub ignore: bool,
    #[bits(2)]
    pub special: SpecialType,
    #[bits(13)]
    __: u16,
}

/// The binding of a feature to a type: bit index into the presence mask and
/// byte offset into the value region.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInstance {
    pub kind: FeatureKind,
    pub bit: usize,
    pub offset: usize,
}

impl FeatureInstance {
    pub const fn has_value(&self) -> bool {
        self.kind.has_value()
    }
}

fn bits_to_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// A registered object type.
///
/// Mutable while being described (the `with_` builders), immutable once
/// sealed into a [`TypeConfig`]: the registry hands out `Arc<TypeInfo>` and
/// never touches the record again.
#[derive(Debug)]
pub struct TypeInfo {
    name: String,
    index: usize,
    node_id: TypeId,
    way_id: TypeId,
    area_id: TypeId,
    route_id: TypeId,
    behaviour: TypeBehaviour,
    lanes: u8,
    oneway_lanes: u8,
    features: Vec<FeatureInstance>,
    feature_lookup: HashMap<FeatureKind, usize>,
    feature_mask_bytes: usize,
    value_buffer_size: usize,
    groups: BTreeSet<String>,
    descriptions: BTreeMap<String, String>,
    conditions: Vec<TypeCondition>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            node_id: TYPE_IGNORE,
            way_id: TYPE_IGNORE,
            area_id: TYPE_IGNORE,
            route_id: TYPE_IGNORE,
            behaviour: TypeBehaviour::new(),
            lanes: 1,
            oneway_lanes: 1,
            features: Vec::new(),
            feature_lookup: HashMap::new(),
            feature_mask_bytes: 0,
            value_buffer_size: 0,
            groups: BTreeSet::new(),
            descriptions: BTreeMap::new(),
            conditions: Vec::new(),
        }
    }

    pub fn with_node(mut self) -> Self {
        self.behaviour.set_can_be_node(true);
        self
    }

    pub fn with_way(mut self) -> Self {
        self.behaviour.set_can_be_way(true);
        self
    }

    pub fn with_area(mut self) -> Self {
        self.behaviour.set_can_be_area(true);
        self
    }

    pub fn with_relation(mut self) -> Self {
        self.behaviour.set_can_be_relation(true);
        self
    }

    pub fn with_path(mut self) -> Self {
        self.behaviour.set_is_path(true);
        self
    }

    pub fn with_route(mut self, vehicle: Vehicle) -> Self {
        match vehicle {
            Vehicle::Foot => self.behaviour.set_can_route_foot(true),
            Vehicle::Bicycle => self.behaviour.set_can_route_bicycle(true),
            Vehicle::Car => self.behaviour.set_can_route_car(true),
        }
        self
    }

    pub fn with_index_as_address(mut self) -> Self {
        self.behaviour.set_index_as_address(true);
        self
    }

    pub fn with_index_as_location(mut self) -> Self {
        self.behaviour.set_index_as_location(true);
        self
    }

    pub fn with_index_as_region(mut self) -> Self {
        self.behaviour.set_index_as_region(true);
        self
    }

    pub fn with_index_as_poi(mut self) -> Self {
        self.behaviour.set_index_as_poi(true);
        self
    }

    pub fn with_optimize_low_zoom(mut self) -> Self {
        self.behaviour.set_optimize_low_zoom(true);
        self
    }

    pub fn with_pin_way(mut self) -> Self {
        self.behaviour.set_pin_way(true);
        self
    }

    pub fn with_merge_areas(mut self) -> Self {
        self.behaviour.set_merge_areas(true);
        self
    }

    pub fn with_ignore_sea_land(mut self) -> Self {
        self.behaviour.set_ignore_sea_land(true);
        self
    }

    pub fn with_ignore(mut self) -> Self {
        self.behaviour.set_ignore(true);
        self
    }

    pub fn with_special(mut self, special: SpecialType) -> Self {
        self.behaviour.set_special(special);
        self
    }

    pub fn with_lanes(mut self, lanes: u8, oneway_lanes: u8) -> Self {
        self.lanes = lanes;
        self.oneway_lanes = oneway_lanes;
        self
    }

    /// Appends a feature slot. Slot order defines bit indices and value
    /// offsets once the type is sealed.
    pub fn with_feature(mut self, kind: FeatureKind) -> Self {
        if !self.feature_lookup.contains_key(&kind) {
            self.feature_lookup.insert(kind, self.features.len());
            self.features.push(FeatureInstance {
                kind,
                bit: 0,
                offset: 0,
            });
        }
        self
    }

    pub fn with_condition(mut self, scope: EnumSet<ObjectKind>, condition: TagCondition) -> Self {
        self.conditions.push(TypeCondition { scope, condition });
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.descriptions.insert(language.into(), text.into());
        self
    }

    /// Assigns bit indices, value offsets and derived sizes. Called exactly
    /// once, by [`TypeConfig::register_type`].
    fn seal(&mut self, index: usize) {
        self.index = index;

        let mut offset = 0;
        for (bit, instance) in self.features.iter_mut().enumerate() {
            instance.bit = bit;
            instance.offset = offset;
            offset += instance.kind.value_size();
        }

        self.value_buffer_size = offset;
        self.feature_mask_bytes = bits_to_bytes(self.features.len());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordinal within the owning config.
    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn node_id(&self) -> TypeId {
        self.node_id
    }

    pub const fn way_id(&self) -> TypeId {
        self.way_id
    }

    pub const fn area_id(&self) -> TypeId {
        self.area_id
    }

    pub const fn route_id(&self) -> TypeId {
        self.route_id
    }

    pub const fn behaviour(&self) -> TypeBehaviour {
        self.behaviour
    }

    pub const fn can_be_node(&self) -> bool {
        self.behaviour.can_be_node()
    }

    pub const fn can_be_way(&self) -> bool {
        self.behaviour.can_be_way()
    }

    pub const fn can_be_area(&self) -> bool {
        self.behaviour.can_be_area()
    }

    pub const fn can_be_relation(&self) -> bool {
        self.behaviour.can_be_relation()
    }

    pub const fn is_path(&self) -> bool {
        self.behaviour.is_path()
    }

    pub const fn can_route_foot(&self) -> bool {
        self.behaviour.can_route_foot()
    }

    pub const fn can_route_bicycle(&self) -> bool {
        self.behaviour.can_route_bicycle()
    }

    pub const fn can_route_car(&self) -> bool {
        self.behaviour.can_route_car()
    }

    pub const fn can_route(&self, vehicle: Vehicle) -> bool {
        match vehicle {
            Vehicle::Foot => self.can_route_foot(),
            Vehicle::Bicycle => self.can_route_bicycle(),
            Vehicle::Car => self.can_route_car(),
        }
    }

    pub const fn is_routable(&self) -> bool {
        self.can_route_foot() || self.can_route_bicycle() || self.can_route_car()
    }

    pub const fn index_as_address(&self) -> bool {
        self.behaviour.index_as_address()
    }

    pub const fn index_as_location(&self) -> bool {
        self.behaviour.index_as_location()
    }

    pub const fn index_as_region(&self) -> bool {
        self.behaviour.index_as_region()
    }

    pub const fn index_as_poi(&self) -> bool {
        self.behaviour.index_as_poi()
    }

    pub const fn optimize_low_zoom(&self) -> bool {
        self.behaviour.optimize_low_zoom()
    }

    pub const fn pin_way(&self) -> bool {
        self.behaviour.pin_way()
    }

    pub const fn merge_areas(&self) -> bool {
        self.behaviour.merge_areas()
    }

    pub const fn ignore_sea_land(&self) -> bool {
        self.behaviour.ignore_sea_land()
    }

    pub const fn is_ignore(&self) -> bool {
        self.behaviour.ignore()
    }

    pub const fn special(&self) -> SpecialType {
        self.behaviour.special()
    }

    pub const fn lanes(&self) -> u8 {
        self.lanes
    }

    pub const fn oneway_lanes(&self) -> u8 {
        self.oneway_lanes
    }

    pub fn features(&self) -> &[FeatureInstance] {
        &self.features
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub const fn feature_mask_bytes(&self) -> usize {
        self.feature_mask_bytes
    }

    pub const fn value_buffer_size(&self) -> usize {
        self.value_buffer_size
    }

    pub fn feature_instance(&self, kind: FeatureKind) -> Option<&FeatureInstance> {
        self.feature_lookup.get(&kind).map(|i| &self.features[*i])
    }

    pub fn feature_index(&self, kind: FeatureKind) -> Option<usize> {
        self.feature_lookup.get(&kind).copied()
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn descriptions(&self) -> &BTreeMap<String, String> {
        &self.descriptions
    }

    pub fn conditions(&self) -> &[TypeCondition] {
        &self.conditions
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.index == other.index
            && self.node_id == other.node_id
            && self.way_id == other.way_id
            && self.area_id == other.area_id
            && self.route_id == other.route_id
            && self.behaviour == other.behaviour
            && self.lanes == other.lanes
            && self.oneway_lanes == other.oneway_lanes
            && self.features == other.features
            && self.feature_mask_bytes == other.feature_mask_bytes
            && self.value_buffer_size == other.value_buffer_size
            && self.groups == other.groups
            && self.descriptions == other.descriptions
    }
}

#[derive(Debug, Error)]
pub enum TypeConfigError {
    #[error("Type '{0}' is already registered")]
    TypeAlreadyRegistered(String),
    #[error("Feature '{0}' is not registered")]
    UnknownFeature(String),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("'{path}' carries format version {found}, supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

/// The type registry: tags, features, sealed types and the classification
/// tables shared by import and query.
#[derive(Debug)]
pub struct TypeConfig {
    tags: Vec<String>,
    tag_lookup: HashMap<String, TagId>,
    features: Vec<FeatureKind>,
    feature_lookup: HashMap<&'static str, usize>,
    types: Vec<Arc<TypeInfo>>,
    type_lookup: HashMap<String, Arc<TypeInfo>>,
    node_types: Vec<Arc<TypeInfo>>,
    way_types: Vec<Arc<TypeInfo>>,
    area_types: Vec<Arc<TypeInfo>>,
    route_types: Vec<Arc<TypeInfo>>,
    surface_grades: HashMap<String, u8>,
    max_speed_aliases: HashMap<String, u8>,
    type_ignore: Arc<TypeInfo>,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeConfig {
    pub fn new() -> Self {
        let mut ignore = TypeInfo::new("").with_ignore();
        ignore.seal(0);
        let type_ignore = Arc::new(ignore);

        let mut config = Self {
            tags: vec![String::new()],
            tag_lookup: HashMap::from([(String::new(), TAG_IGNORE)]),
            features: Vec::new(),
            feature_lookup: HashMap::new(),
            types: vec![type_ignore.clone()],
            type_lookup: HashMap::from([(String::new(), type_ignore.clone())]),
            node_types: vec![type_ignore.clone()],
            way_types: vec![type_ignore.clone()],
            area_types: vec![type_ignore.clone()],
            route_types: vec![type_ignore.clone()],
            surface_grades: HashMap::new(),
            max_speed_aliases: HashMap::new(),
            type_ignore,
        };

        for kind in ALL_FEATURES {
            config.register_feature(*kind);
        }

        config
    }

    /// Registers a tag key; idempotent, returns the stable id.
    pub fn register_tag(&mut self, name: &str) -> TagId {
        if let Some(id) = self.tag_lookup.get(name) {
            return *id;
        }

        assert!(self.tags.len() < usize::from(TagId::MAX), "tag registry full");

        let id = self.tags.len() as TagId;
        self.tags.push(name.to_string());
        self.tag_lookup.insert(name.to_string(), id);
        id
    }

    pub fn tag_id(&self, name: &str) -> Option<TagId> {
        self.tag_lookup.get(name).copied()
    }

    pub fn tag_name(&self, id: TagId) -> Option<&str> {
        self.tags.get(usize::from(id)).map(String::as_str)
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Builds a tag map from raw key/value pairs, registering unknown keys.
    pub fn tag_map_from_pairs<'a>(
        &mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> TagMap {
        pairs
            .into_iter()
            .map(|(key, value)| (self.register_tag(key), value.to_string()))
            .collect()
    }

    /// Registers a feature definition and its tags; idempotent.
    pub fn register_feature(&mut self, kind: FeatureKind) {
        if self.feature_lookup.contains_key(kind.name()) {
            return;
        }

        for tag in kind.tags() {
            self.register_tag(tag);
        }

        self.feature_lookup.insert(kind.name(), self.features.len());
        self.features.push(kind);
    }

    pub fn feature(&self, name: &str) -> Option<FeatureKind> {
        self.feature_lookup.get(name).map(|i| self.features[*i])
    }

    pub fn features(&self) -> &[FeatureKind] {
        &self.features
    }

    /// Seals and indexes a type: assigns its ordinal and per-kind numeric
    /// ids. Fails on duplicate names.
    pub fn register_type(&mut self, mut info: TypeInfo) -> Result<Arc<TypeInfo>, TypeConfigError> {
        if self.type_lookup.contains_key(&info.name) {
            return Err(TypeConfigError::TypeAlreadyRegistered(info.name));
        }

        info.seal(self.types.len());

        if info.can_be_node() {
            info.node_id = self.node_types.len() as TypeId;
        }
        if info.can_be_way() {
            info.way_id = self.way_types.len() as TypeId;
        }
        if info.can_be_area() {
            info.area_id = self.area_types.len() as TypeId;
        }
        if (info.can_be_way() || info.can_be_area()) && info.is_routable() {
            info.route_id = self.route_types.len() as TypeId;
        }

        let info = Arc::new(info);

        if info.node_id != TYPE_IGNORE {
            self.node_types.push(info.clone());
        }
        if info.way_id != TYPE_IGNORE {
            self.way_types.push(info.clone());
        }
        if info.area_id != TYPE_IGNORE {
            self.area_types.push(info.clone());
        }
        if info.route_id != TYPE_IGNORE {
            self.route_types.push(info.clone());
        }

        self.types.push(info.clone());
        self.type_lookup.insert(info.name.clone(), info.clone());

        Ok(info)
    }

    pub fn type_ignore(&self) -> Arc<TypeInfo> {
        self.type_ignore.clone()
    }

    pub fn types(&self) -> &[Arc<TypeInfo>] {
        &self.types
    }

    pub fn type_by_name(&self, name: &str) -> Option<Arc<TypeInfo>> {
        self.type_lookup.get(name).cloned()
    }

    /// Lookup by the global ordinal assigned at registration.
    pub fn type_by_index(&self, index: usize) -> Option<Arc<TypeInfo>> {
        self.types.get(index).cloned()
    }

    pub fn node_type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.node_types.get(usize::from(id)).cloned()
    }

    pub fn way_type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.way_types.get(usize::from(id)).cloned()
    }

    pub fn area_type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.area_types.get(usize::from(id)).cloned()
    }

    pub fn route_type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.route_types.get(usize::from(id)).cloned()
    }

    pub fn node_type_count(&self) -> usize {
        self.node_types.len()
    }

    pub fn way_type_count(&self) -> usize {
        self.way_types.len()
    }

    pub fn area_type_count(&self) -> usize {
        self.area_types.len()
    }

    pub fn route_type_count(&self) -> usize {
        self.route_types.len()
    }

    fn type_for(&self, kinds: EnumSet<ObjectKind>, tags: &TagMap) -> Arc<TypeInfo> {
        for info in &self.types {
            for condition in info.conditions() {
                if condition.scope.is_disjoint(kinds) {
                    continue;
                }
                if condition.condition.evaluate(tags) {
                    return info.clone();
                }
            }
        }
        self.type_ignore.clone()
    }

    /// Classifies a node tag map; returns the ignore type when nothing
    /// matches.
    pub fn node_type(&self, tags: &TagMap) -> Arc<TypeInfo> {
        self.type_for(enum_set!(ObjectKind::Node), tags)
    }

    pub fn way_area_type(&self, tags: &TagMap) -> Arc<TypeInfo> {
        self.type_for(ObjectKind::Way | ObjectKind::Area, tags)
    }

    pub fn relation_type(&self, tags: &TagMap) -> Arc<TypeInfo> {
        self.type_for(enum_set!(ObjectKind::Relation), tags)
    }

    pub fn register_surface_grade(&mut self, surface: &str, grade: u8) {
        self.surface_grades.insert(surface.to_string(), grade);
    }

    pub fn grade_for_surface(&self, surface: &str) -> Option<u8> {
        self.surface_grades.get(surface).copied()
    }

    pub fn register_max_speed_alias(&mut self, alias: &str, speed: u8) {
        self.max_speed_aliases.insert(alias.to_string(), speed);
    }

    pub fn max_speed_alias(&self, alias: &str) -> Option<u8> {
        self.max_speed_aliases.get(alias).copied()
    }

    /// Parses the textual type declaration file.
    pub fn load_from_ost_file(path: impl AsRef<Path>) -> Result<Self, OstError> {
        ost::parse_file(path)
    }

    /// Writes the binary `types.dat` into the database directory.
    pub fn store_to_data_file(&self, directory: impl AsRef<Path>) -> Result<(), TypeConfigError> {
        let mut writer = FileWriter::open(directory.as_ref().join(TYPES_DAT))?;

        writer.write_u32(FORMAT_VERSION)?;

        writer.write_number(self.tags.len() as u64 - 1)?;
        for tag in &self.tags[1..] {
            writer.write_string(tag)?;
        }

        writer.write_number(self.features.len() as u64)?;
        for feature in &self.features {
            writer.write_string(feature.name())?;
        }

        writer.write_number(self.surface_grades.len() as u64)?;
        let mut surfaces: Vec<_> = self.surface_grades.iter().collect();
        surfaces.sort();
        for (surface, grade) in surfaces {
            writer.write_string(surface)?;
            writer.write_u8(*grade)?;
        }

        writer.write_number(self.max_speed_aliases.len() as u64)?;
        let mut aliases: Vec<_> = self.max_speed_aliases.iter().collect();
        aliases.sort();
        for (alias, speed) in aliases {
            writer.write_string(alias)?;
            writer.write_u8(*speed)?;
        }

        writer.write_number(self.types.len() as u64 - 1)?;
        for info in &self.types[1..] {
            writer.write_string(&info.name)?;
            writer.write_u32(info.behaviour.into_bits())?;
            writer.write_u8(info.lanes)?;
            writer.write_u8(info.oneway_lanes)?;

            writer.write_number(info.features.len() as u64)?;
            for instance in &info.features {
                writer.write_string(instance.kind.name())?;
            }

            writer.write_number(info.groups.len() as u64)?;
            for group in &info.groups {
                writer.write_string(group)?;
            }

            writer.write_number(info.descriptions.len() as u64)?;
            for (language, text) in &info.descriptions {
                writer.write_string(language)?;
                writer.write_string(text)?;
            }
        }

        writer.close()?;
        Ok(())
    }

    /// Reads `types.dat` back. A version mismatch or an unknown feature name
    /// aborts the open.
    pub fn load_from_data_file(directory: impl AsRef<Path>) -> Result<Self, TypeConfigError> {
        let path = directory.as_ref().join(TYPES_DAT);
        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false)?;

        let version = scanner.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(TypeConfigError::UnsupportedVersion {
                path,
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let mut config = TypeConfig::new();

        let tag_count = scanner.read_number()?;
        for _ in 0..tag_count {
            let name = scanner.read_string()?;
            config.register_tag(&name);
        }

        let feature_count = scanner.read_number()?;
        for _ in 0..feature_count {
            let name = scanner.read_string()?;
            let kind = FeatureKind::from_name(&name)
                .ok_or_else(|| TypeConfigError::UnknownFeature(name.clone()))?;
            config.register_feature(kind);
        }

        let surface_count = scanner.read_number()?;
        for _ in 0..surface_count {
            let surface = scanner.read_string()?;
            let grade = scanner.read_u8()?;
            config.register_surface_grade(&surface, grade);
        }

        let alias_count = scanner.read_number()?;
        for _ in 0..alias_count {
            let alias = scanner.read_string()?;
            let speed = scanner.read_u8()?;
            config.register_max_speed_alias(&alias, speed);
        }

        let type_count = scanner.read_number()?;
        for _ in 0..type_count {
            let name = scanner.read_string()?;
            let behaviour = TypeBehaviour::from_bits(scanner.read_u32()?);
            let lanes = scanner.read_u8()?;
            let oneway_lanes = scanner.read_u8()?;

            let mut info = TypeInfo::new(name);
            info.behaviour = behaviour;
            info = info.with_lanes(lanes, oneway_lanes);

            let feature_count = scanner.read_number()?;
            for _ in 0..feature_count {
                let feature_name = scanner.read_string()?;
                let kind = FeatureKind::from_name(&feature_name)
                    .ok_or_else(|| TypeConfigError::UnknownFeature(feature_name.clone()))?;
                info = info.with_feature(kind);
            }

            let group_count = scanner.read_number()?;
            for _ in 0..group_count {
                let group = scanner.read_string()?;
                info = info.with_group(group);
            }

            let description_count = scanner.read_number()?;
            for _ in 0..description_count {
                let language = scanner.read_string()?;
                let text = scanner.read_string()?;
                info = info.with_description(language, text);
            }

            config.register_type(info)?;
        }

        scanner.close()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vehicle;

    fn residential() -> TypeInfo {
        TypeInfo::new("highway_residential")
            .with_way()
            .with_path()
            .with_route(Vehicle::Foot)
            .with_route(Vehicle::Bicycle)
            .with_route(Vehicle::Car)
            .with_feature(FeatureKind::Name)
            .with_feature(FeatureKind::Access)
            .with_feature(FeatureKind::MaxSpeed)
            .with_group("highway")
    }

    #[test]
    fn tag_registration_is_idempotent() {
        let mut config = TypeConfig::new();
        let first = config.register_tag("building");
        let second = config.register_tag("building");
        assert_eq!(first, second);
        assert_ne!(first, TAG_IGNORE);
        assert_eq!(config.tag_name(first), Some("building"));
    }

    #[test]
    fn sealing_assigns_bits_offsets_and_ids() {
        let mut config = TypeConfig::new();
        let info = config.register_type(residential()).unwrap();

        assert_eq!(info.index(), 1);
        assert_eq!(info.way_id(), 1);
        assert_eq!(info.node_id(), TYPE_IGNORE);
        assert_eq!(info.route_id(), 1);
        assert_eq!(info.feature_count(), 3);
        assert_eq!(info.feature_mask_bytes(), 1);

        let name = info.feature_instance(FeatureKind::Name).unwrap();
        let access = info.feature_instance(FeatureKind::Access).unwrap();
        let max_speed = info.feature_instance(FeatureKind::MaxSpeed).unwrap();
        assert_eq!((name.bit, name.offset), (0, 0));
        assert_eq!((access.bit, access.offset), (1, 8));
        assert_eq!((max_speed.bit, max_speed.offset), (2, 9));
        assert_eq!(info.value_buffer_size(), 10);
    }

    #[test]
    fn duplicate_type_names_are_rejected() {
        let mut config = TypeConfig::new();
        config.register_type(residential()).unwrap();
        assert!(matches!(
            config.register_type(residential()),
            Err(TypeConfigError::TypeAlreadyRegistered(_))
        ));
    }

    #[test]
    fn classification_follows_declaration_order() {
        let mut config = TypeConfig::new();
        let highway = config.register_tag("highway");

        config
            .register_type(
                TypeInfo::new("highway_motorway")
                    .with_way()
                    .with_condition(
                        enum_set!(ObjectKind::Way),
                        TagCondition::Equals {
                            tag: highway,
                            value: "motorway".to_string(),
                        },
                    ),
            )
            .unwrap();
        config
            .register_type(
                TypeInfo::new("highway_any").with_way().with_condition(
                    enum_set!(ObjectKind::Way),
                    TagCondition::Exists { tag: highway },
                ),
            )
            .unwrap();

        let mut tags = TagMap::new();
        tags.insert(highway, "motorway".to_string());
        assert_eq!(config.way_area_type(&tags).name(), "highway_motorway");

        tags.insert(highway, "service".to_string());
        assert_eq!(config.way_area_type(&tags).name(), "highway_any");

        let empty = TagMap::new();
        assert!(config.way_area_type(&empty).is_ignore());
        // Node conditions do not leak into node classification.
        assert!(config.node_type(&tags).is_ignore());
    }

    #[test]
    fn condition_evaluation() {
        let mut config = TypeConfig::new();
        let highway = config.register_tag("highway");
        let area = config.register_tag("area");

        let condition = TagCondition::And(vec![
            TagCondition::OneOf {
                tag: highway,
                values: vec!["pedestrian".into(), "living_street".into()],
            },
            TagCondition::Not(Box::new(TagCondition::Equals {
                tag: area,
                value: "no".into(),
            })),
        ]);

        let mut tags = TagMap::new();
        tags.insert(highway, "pedestrian".into());
        assert!(condition.evaluate(&tags));

        tags.insert(area, "no".into());
        assert!(!condition.evaluate(&tags));
    }

    #[test]
    fn data_file_roundtrip_preserves_types() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = TypeConfig::new();
        config.register_tag("highway");
        config.register_surface_grade("asphalt", 1);
        config.register_max_speed_alias("DE:urban", 50);
        config.register_type(residential()).unwrap();
        config
            .register_type(
                TypeInfo::new("building")
                    .with_area()
                    .with_feature(FeatureKind::Name)
                    .with_feature(FeatureKind::Address)
                    .with_description("en", "A building"),
            )
            .unwrap();

        config.store_to_data_file(dir.path()).unwrap();
        let restored = TypeConfig::load_from_data_file(dir.path()).unwrap();

        assert_eq!(restored.tag_count(), config.tag_count());
        assert_eq!(restored.types().len(), config.types().len());
        assert_eq!(restored.grade_for_surface("asphalt"), Some(1));
        assert_eq!(restored.max_speed_alias("DE:urban"), Some(50));

        for (original, loaded) in config.types().iter().zip(restored.types()) {
            assert_eq!(original.as_ref(), loaded.as_ref());
        }
    }

    #[test]
    fn version_mismatch_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = TypeConfig::new();
        config.store_to_data_file(dir.path()).unwrap();

        // Corrupt the version word.
        let path = dir.path().join(TYPES_DAT);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0xfe;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            TypeConfig::load_from_data_file(dir.path()),
            Err(TypeConfigError::UnsupportedVersion { .. })
        ));
    }
}
