//! The per-object packed attribute record.

use super::feature::{
    AccessFlag, FeatureCodecError, FeatureKind, FeatureValue, LanesValue, ParseContext,
    ParseOutcome, default_access,
};
use super::{TypeConfig, TypeInfo, bits_to_bytes};
use crate::io::{FileScanner, FileWriter, IoError};
use crate::progress::TagErrorReporter;
use crate::types::TagMap;
use crate::{ObjectOsmRef, Vehicle};
use enumset::EnumSet;
use std::sync::Arc;
use thiserror::Error;

/// Callers may piggyback up to 8 special flags onto the serialized mask.
pub const MAX_SPECIAL_FLAGS: usize = 8;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Codec(#[from] FeatureCodecError),
    #[error("At most {MAX_SPECIAL_FLAGS} special flags are supported, got {0}")]
    TooManySpecialFlags(usize),
}

/// A typed attribute record: one presence bit per feature of the type, plus
/// the materialised values of the present features.
///
/// All buffers of one type share the layout computed when the type was
/// sealed; serialization writes the presence mask followed by each present
/// feature's value in registration order.
#[derive(Debug, Clone)]
pub struct FeatureValueBuffer {
    type_info: Arc<TypeInfo>,
    mask: Vec<u8>,
    values: Vec<Option<FeatureValue>>,
}

impl FeatureValueBuffer {
    pub fn new(type_info: Arc<TypeInfo>) -> Self {
        let mask = vec![0; type_info.feature_mask_bytes()];
        let values = vec![None; type_info.feature_count()];
        Self {
            type_info,
            mask,
            values,
        }
    }

    /// Rebinds the buffer to a type, clearing all feature state.
    pub fn set_type(&mut self, type_info: Arc<TypeInfo>) {
        self.mask = vec![0; type_info.feature_mask_bytes()];
        self.values = vec![None; type_info.feature_count()];
        self.type_info = type_info;
    }

    pub fn type_info(&self) -> &Arc<TypeInfo> {
        &self.type_info
    }

    pub fn feature_count(&self) -> usize {
        self.type_info.feature_count()
    }

    #[inline]
    pub fn has_feature(&self, index: usize) -> bool {
        index < self.type_info.feature_count() && self.mask[index / 8] & (1 << (index % 8)) != 0
    }

    /// Sets the presence bit without storing a value (flag-only features).
    pub fn set_flag(&mut self, index: usize) {
        debug_assert!(index < self.type_info.feature_count());
        self.mask[index / 8] |= 1 << (index % 8);
    }

    /// Stores a value and sets the presence bit.
    pub fn set_value(&mut self, index: usize, value: FeatureValue) {
        self.set_flag(index);
        self.values[index] = Some(value);
    }

    /// Clears the presence bit and drops any stored value.
    pub fn free_value(&mut self, index: usize) {
        if index < self.type_info.feature_count() {
            self.mask[index / 8] &= !(1 << (index % 8));
            self.values[index] = None;
        }
    }

    pub fn value(&self, index: usize) -> Option<&FeatureValue> {
        if self.has_feature(index) {
            self.values[index].as_ref()
        } else {
            None
        }
    }

    pub fn value_of(&self, kind: FeatureKind) -> Option<&FeatureValue> {
        self.type_info
            .feature_index(kind)
            .and_then(|index| self.value(index))
    }

    /// Whether the presence bit of the given feature is set (the value for
    /// flag-only features).
    pub fn has_flag(&self, kind: FeatureKind) -> bool {
        self.type_info
            .feature_index(kind)
            .is_some_and(|index| self.has_feature(index))
    }

    pub fn text_of(&self, kind: FeatureKind) -> Option<&str> {
        match self.value_of(kind) {
            Some(FeatureValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn byte_of(&self, kind: FeatureKind) -> Option<u8> {
        match self.value_of(kind) {
            Some(FeatureValue::Byte(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn lanes(&self) -> Option<&LanesValue> {
        match self.value_of(FeatureKind::Lanes) {
            Some(FeatureValue::Lanes(lanes)) => Some(lanes),
            _ => None,
        }
    }

    /// The effective access mask: the stored Access value, or the default
    /// derived from the type's routing flags.
    pub fn access(&self) -> EnumSet<AccessFlag> {
        match self.value_of(FeatureKind::Access) {
            Some(FeatureValue::Access(flags)) => *flags,
            _ => default_access(&self.type_info),
        }
    }

    pub fn can_route_forward(&self, vehicle: Vehicle) -> bool {
        let access = self.access();
        match vehicle {
            Vehicle::Foot => access.contains(AccessFlag::FootForward),
            Vehicle::Bicycle => access.contains(AccessFlag::BicycleForward),
            Vehicle::Car => access.contains(AccessFlag::CarForward),
        }
    }

    pub fn can_route_backward(&self, vehicle: Vehicle) -> bool {
        let access = self.access();
        match vehicle {
            Vehicle::Foot => access.contains(AccessFlag::FootBackward),
            Vehicle::Bicycle => access.contains(AccessFlag::BicycleBackward),
            Vehicle::Car => access.contains(AccessFlag::CarBackward),
        }
    }

    pub fn is_oneway(&self) -> bool {
        let access = self.access();
        access.contains(AccessFlag::OnewayForward) || access.contains(AccessFlag::OnewayBackward)
    }

    /// Runs every feature's parse routine against the tag map.
    pub fn parse(
        &mut self,
        reporter: &dyn TagErrorReporter,
        config: &TypeConfig,
        object: &ObjectOsmRef,
        tags: &TagMap,
    ) {
        let type_info = self.type_info.clone();
        let ctx = ParseContext {
            reporter,
            config,
            type_info: type_info.as_ref(),
            object,
            tags,
        };

        for (index, instance) in type_info.features().iter().enumerate() {
            match instance.kind.parse(&ctx) {
                ParseOutcome::Skip => {}
                ParseOutcome::Flag => self.set_flag(index),
                ParseOutcome::Value(value) => self.set_value(index, value),
            }
        }
    }

    /// Serialises the presence mask and values.
    ///
    /// If the special flags fit into the unused high bits of the last mask
    /// byte (`ceil((features+flags)/8) == ceil(features/8)`) they piggyback
    /// there MSB-first; otherwise one extra byte is appended. The layout is
    /// deterministic and part of the format contract.
    pub fn write(&self, writer: &mut FileWriter, special_flags: &[bool]) -> Result<(), BufferError> {
        if special_flags.len() > MAX_SPECIAL_FLAGS {
            return Err(BufferError::TooManySpecialFlags(special_flags.len()));
        }

        let feature_count = self.type_info.feature_count();

        let mut flag_byte = 0u8;
        let mut bit = 0x80u8;
        for flag in special_flags {
            if *flag {
                flag_byte |= bit;
            }
            bit >>= 1;
        }

        if !special_flags.is_empty()
            && bits_to_bytes(feature_count) == bits_to_bytes(feature_count + special_flags.len())
        {
            let mut mask = self.mask.clone();
            *mask.last_mut().expect("flags fit implies non-empty mask") |= flag_byte;
            writer.write_bytes(&mask)?;
        } else {
            writer.write_bytes(&self.mask)?;
            if !special_flags.is_empty() {
                writer.write_u8(flag_byte)?;
            }
        }

        for (index, instance) in self.type_info.features().iter().enumerate() {
            if self.has_feature(index) && instance.has_value() {
                self.values[index]
                    .as_ref()
                    .expect("present feature with value representation has a value")
                    .write(writer)?;
            }
        }

        Ok(())
    }

    /// Reads back what [`FeatureValueBuffer::write`] produced. The buffer
    /// must already be bound to the object's type.
    pub fn read(
        &mut self,
        scanner: &mut FileScanner,
        special_flags: &mut [bool],
    ) -> Result<(), BufferError> {
        if special_flags.len() > MAX_SPECIAL_FLAGS {
            return Err(BufferError::TooManySpecialFlags(special_flags.len()));
        }

        let feature_count = self.type_info.feature_count();

        self.mask = vec![0; self.type_info.feature_mask_bytes()];
        scanner.read_bytes(&mut self.mask)?;

        if !special_flags.is_empty() {
            let flag_byte = if bits_to_bytes(feature_count)
                == bits_to_bytes(feature_count + special_flags.len())
            {
                let byte = *self.mask.last().expect("flags fit implies non-empty mask");
                // Strip the piggybacked bits so the mask only carries
                // feature presence.
                let used_bits = feature_count % 8;
                if used_bits > 0 {
                    *self.mask.last_mut().expect("non-empty") = byte & ((1 << used_bits) - 1);
                }
                byte
            } else {
                scanner.read_u8()?
            };

            let mut bit = 0x80u8;
            for flag in special_flags.iter_mut() {
                *flag = flag_byte & bit != 0;
                bit >>= 1;
            }
        }

        self.values = vec![None; feature_count];
        for (index, instance) in self.type_info.clone().features().iter().enumerate() {
            if self.has_feature(index) && instance.has_value() {
                self.values[index] = Some(instance.kind.read_value(scanner)?);
            }
        }

        Ok(())
    }
}

impl PartialEq for FeatureValueBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.type_info.name() == other.type_info.name()
            && self.mask == other.mask
            && self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AccessMode;
    use crate::progress::SilentTagErrorReporter;
    use crate::types::{TypeConfig, TypeInfo};
    use crate::{ObjectOsmRef, OsmRefType};

    fn test_config() -> (TypeConfig, Arc<TypeInfo>) {
        let mut config = TypeConfig::new();
        let info = config
            .register_type(
                TypeInfo::new("highway_residential")
                    .with_way()
                    .with_path()
                    .with_route(crate::Vehicle::Foot)
                    .with_route(crate::Vehicle::Bicycle)
                    .with_route(crate::Vehicle::Car)
                    .with_feature(FeatureKind::Name)
                    .with_feature(FeatureKind::Ref)
                    .with_feature(FeatureKind::Access)
                    .with_feature(FeatureKind::MaxSpeed)
                    .with_feature(FeatureKind::Grade)
                    .with_feature(FeatureKind::Width)
                    .with_feature(FeatureKind::Bridge)
                    .with_feature(FeatureKind::Lanes),
            )
            .unwrap();
        (config, info)
    }

    fn parse_tags(pairs: &[(&str, &str)]) -> FeatureValueBuffer {
        let (mut config, info) = test_config();
        let tags = config.tag_map_from_pairs(pairs.iter().copied());
        let mut buffer = FeatureValueBuffer::new(info);
        let object = ObjectOsmRef::new(1, OsmRefType::Way);
        buffer.parse(&SilentTagErrorReporter, &config, &object, &tags);
        buffer
    }

    #[test]
    fn plain_residential_keeps_default_access() {
        let buffer = parse_tags(&[("highway", "residential")]);

        // Matching the defaults means no Access value is materialised...
        assert!(buffer.value_of(FeatureKind::Access).is_none());
        // ...but the effective access covers all modes in both directions.
        let access = buffer.access();
        assert!(access.is_superset(crate::types::ACCESS_FOOT));
        assert!(access.is_superset(crate::types::ACCESS_BICYCLE));
        assert!(access.is_superset(crate::types::ACCESS_CAR));
        assert!(!access.contains(AccessFlag::OnewayForward));
    }

    #[test]
    fn oneway_clears_backward_vehicle_access() {
        let buffer = parse_tags(&[("highway", "residential"), ("oneway", "yes")]);

        let access = buffer.access();
        assert!(access.contains(AccessFlag::CarForward));
        assert!(!access.contains(AccessFlag::CarBackward));
        assert!(!access.contains(AccessFlag::BicycleBackward));
        // Oneway does not restrict pedestrians.
        assert!(access.contains(AccessFlag::FootBackward));
        assert!(access.contains(AccessFlag::OnewayForward));
        assert!(!access.contains(AccessFlag::OnewayBackward));
    }

    #[test]
    fn roundabout_implies_forward_only() {
        let buffer = parse_tags(&[("highway", "residential"), ("junction", "roundabout")]);

        let access = buffer.access();
        assert!(access.contains(AccessFlag::CarForward));
        assert!(!access.contains(AccessFlag::CarBackward));
        assert!(!access.contains(AccessFlag::BicycleBackward));
        assert!(access.contains(AccessFlag::OnewayForward));
    }

    #[test]
    fn reverse_oneway_and_access_no() {
        let reversed = parse_tags(&[("highway", "residential"), ("oneway", "-1")]);
        let access = reversed.access();
        assert!(!access.contains(AccessFlag::CarForward));
        assert!(access.contains(AccessFlag::CarBackward));
        assert!(access.contains(AccessFlag::OnewayBackward));

        let blocked = parse_tags(&[("highway", "residential"), ("access", "no")]);
        assert!(blocked.access().is_empty());

        let foot_only = parse_tags(&[
            ("highway", "residential"),
            ("access", "no"),
            ("foot", "yes"),
        ]);
        let access = foot_only.access();
        assert!(access.contains(AccessFlag::FootForward));
        assert!(!access.contains(AccessFlag::CarForward));
    }

    #[test]
    fn max_speed_boundaries() {
        assert_eq!(
            parse_tags(&[("maxspeed", "50")]).byte_of(FeatureKind::MaxSpeed),
            Some(50)
        );
        assert_eq!(
            parse_tags(&[("maxspeed", "walk")]).byte_of(FeatureKind::MaxSpeed),
            Some(10)
        );
        assert_eq!(
            parse_tags(&[("maxspeed", "none")]).byte_of(FeatureKind::MaxSpeed),
            None
        );
        assert_eq!(
            parse_tags(&[("maxspeed", "999mph")]).byte_of(FeatureKind::MaxSpeed),
            Some(255)
        );
        assert_eq!(
            parse_tags(&[("maxspeed", "30mph")]).byte_of(FeatureKind::MaxSpeed),
            Some(48)
        );
        assert_eq!(
            parse_tags(&[("maxspeed", "50 km/h")]).byte_of(FeatureKind::MaxSpeed),
            Some(50)
        );
    }

    #[test]
    fn width_normalisation() {
        assert_eq!(
            parse_tags(&[("width", "3,5")]).byte_of(FeatureKind::Width),
            Some(4)
        );
        assert_eq!(
            parse_tags(&[("width", "4m")]).byte_of(FeatureKind::Width),
            Some(4)
        );
        assert_eq!(
            parse_tags(&[("width", "narrow")]).byte_of(FeatureKind::Width),
            None
        );
    }

    #[test]
    fn flags_and_lanes() {
        let buffer = parse_tags(&[
            ("bridge", "yes"),
            ("lanes", "3"),
            ("lanes:forward", "2"),
            ("turn:lanes:forward", "left|through"),
        ]);

        assert!(buffer.has_flag(FeatureKind::Bridge));

        let lanes = buffer.lanes().expect("lanes value");
        assert_eq!(lanes.forward, 2);
        assert_eq!(lanes.backward, 1);
        assert!(!lanes.is_single_lane());
        assert_eq!(
            lanes.turn_forward,
            vec![
                crate::types::LaneTurn::Left,
                crate::types::LaneTurn::Through
            ]
        );
    }

    fn roundtrip(buffer: &FeatureValueBuffer, flags: &[bool]) -> (FeatureValueBuffer, Vec<bool>, u64) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.dat");

        let mut writer = FileWriter::open(&path).unwrap();
        buffer.write(&mut writer, flags).unwrap();
        writer.close().unwrap();

        let size = std::fs::metadata(&path).unwrap().len();

        let mut scanner = FileScanner::open(&path, AccessMode::Sequential, false).unwrap();
        let mut restored = FeatureValueBuffer::new(buffer.type_info().clone());
        let mut restored_flags = vec![false; flags.len()];
        restored.read(&mut scanner, &mut restored_flags).unwrap();

        (restored, restored_flags, size)
    }

    #[test]
    fn buffer_roundtrip_with_all_flag_counts() {
        let buffer = parse_tags(&[
            ("highway", "residential"),
            ("name", "Brückenstraße"),
            ("oneway", "yes"),
            ("maxspeed", "30"),
            ("bridge", "yes"),
        ]);

        for flag_count in 0..=MAX_SPECIAL_FLAGS {
            let flags: Vec<bool> = (0..flag_count).map(|i| i % 2 == 0).collect();
            let (restored, restored_flags, _) = roundtrip(&buffer, &flags);

            assert_eq!(restored_flags, flags, "flag count {flag_count}");
            assert_eq!(restored, buffer, "flag count {flag_count}");
        }
    }

    #[test]
    fn flags_never_shadow_feature_bits() {
        // All 8 features present, so every mask bit is used and any special
        // flag must go to the extra byte.
        let buffer = parse_tags(&[
            ("name", "A"),
            ("ref", "B1"),
            ("oneway", "yes"),
            ("maxspeed", "30"),
            ("tracktype", "grade2"),
            ("width", "4"),
            ("bridge", "yes"),
            ("lanes", "2"),
        ]);
        assert_eq!(buffer.type_info().feature_count(), 8);

        let (_, _, no_flag_size) = roundtrip(&buffer, &[]);
        let (restored, flags, with_flag_size) = roundtrip(&buffer, &[true]);

        assert_eq!(with_flag_size, no_flag_size + 1);
        assert!(flags[0]);
        assert_eq!(restored, buffer);
    }

    #[test]
    fn flags_piggyback_when_mask_has_room() {
        // Only 8 slots in the type; a buffer of a smaller type shares the
        // last mask byte with up to the remaining bits.
        let mut config = TypeConfig::new();
        let info = config
            .register_type(
                TypeInfo::new("tiny")
                    .with_way()
                    .with_feature(FeatureKind::Name)
                    .with_feature(FeatureKind::Bridge),
            )
            .unwrap();

        let mut buffer = FeatureValueBuffer::new(info);
        buffer.set_value(0, FeatureValue::Text("x".into()));
        let (plain, _, plain_size) = roundtrip(&buffer, &[]);
        let (piggy, flags, piggy_size) = roundtrip(&buffer, &[true, false, true]);

        // Same byte count: the three flags fit into the mask byte.
        assert_eq!(plain_size, piggy_size);
        assert_eq!(flags, vec![true, false, true]);
        assert_eq!(plain, piggy);
    }
}
