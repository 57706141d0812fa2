//! # Feature definitions
//!
//! A feature is a named, typed attribute slot attached to a [`TypeInfo`].
//! During import each feature inspects the raw OSM tags and optionally
//! materialises a [`FeatureValue`]; at query time the values come back out of
//! the object stores.
//!
//! Features are represented as a closed tagged union of value kinds; the
//! per-name registry on [`TypeConfig`] stays the extension point and lets a
//! reader detect (and loudly reject) declarations it does not know.
//!
//! [`TypeConfig`]: super::TypeConfig
//! [`TypeInfo`]: super::TypeInfo

use super::{TypeConfig, TypeInfo};
use crate::ObjectOsmRef;
use crate::io::{FileScanner, FileWriter, IoError};
use crate::progress::TagErrorReporter;
use crate::types::TagMap;
use enumset::{EnumSet, EnumSetType, enum_set};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Per-mode, per-direction access mask. The declaration order defines the
/// bit positions of the on-disk byte.
#[derive(EnumSetType, Debug)]
#[enumset(repr = "u8")]
pub enum AccessFlag {
    FootForward,
    FootBackward,
    BicycleForward,
    BicycleBackward,
    CarForward,
    CarBackward,
    OnewayForward,
    OnewayBackward,
}

pub const ACCESS_FOOT: EnumSet<AccessFlag> =
    enum_set!(AccessFlag::FootForward | AccessFlag::FootBackward);
pub const ACCESS_BICYCLE: EnumSet<AccessFlag> =
    enum_set!(AccessFlag::BicycleForward | AccessFlag::BicycleBackward);
pub const ACCESS_CAR: EnumSet<AccessFlag> =
    enum_set!(AccessFlag::CarForward | AccessFlag::CarBackward);
pub const ACCESS_FORWARD: EnumSet<AccessFlag> = enum_set!(
    AccessFlag::FootForward | AccessFlag::BicycleForward | AccessFlag::CarForward
);
pub const ACCESS_BACKWARD: EnumSet<AccessFlag> = enum_set!(
    AccessFlag::FootBackward | AccessFlag::BicycleBackward | AccessFlag::CarBackward
);

/// Cycle/walk lane and track flags along a path.
#[derive(EnumSetType, Debug)]
#[enumset(repr = "u8")]
pub enum SidewayFlag {
    FootwayTrackLeft,
    FootwayTrackRight,
    CyclewayLaneLeft,
    CyclewayLaneRight,
    CyclewayTrackLeft,
    CyclewayTrackRight,
}

/// Turn hint for a single lane.
#[repr(u8)]
#[derive(TryFromPrimitive, IntoPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LaneTurn {
    None = 0,
    Left = 1,
    SlightLeft = 2,
    SharpLeft = 3,
    Through = 4,
    ThroughLeft = 5,
    ThroughRight = 6,
    Right = 7,
    SlightRight = 8,
    SharpRight = 9,
    MergeToLeft = 10,
    MergeToRight = 11,
}

/// Per-direction lane counts plus ordered per-lane annotations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LanesValue {
    pub forward: u8,
    pub backward: u8,
    pub turn_forward: Vec<LaneTurn>,
    pub turn_backward: Vec<LaneTurn>,
    pub destination_forward: String,
    pub destination_backward: String,
}

impl LanesValue {
    /// Whether this is an undivided single-lane road.
    pub fn is_single_lane(&self) -> bool {
        u16::from(self.forward) + u16::from(self.backward) <= 1
    }
}

#[repr(u8)]
#[derive(TryFromPrimitive, IntoPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SocketKind {
    Type1 = 0,
    Type2 = 1,
    Chademo = 2,
    Ccs = 3,
    TeslaSupercharger = 4,
    Schuko = 5,
}

impl SocketKind {
    const TAGS: &'static [(&'static str, SocketKind)] = &[
        ("socket:type1", SocketKind::Type1),
        ("socket:type2", SocketKind::Type2),
        ("socket:chademo", SocketKind::Chademo),
        ("socket:ccs", SocketKind::Ccs),
        ("socket:tesla_supercharger", SocketKind::TeslaSupercharger),
        ("socket:schuko", SocketKind::Schuko),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket {
    pub kind: SocketKind,
    pub capacity: u8,
}

/// A materialised feature value. Which variant a feature slot uses is fixed
/// by its [`FeatureKind::representation`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Text(String),
    Byte(u8),
    Layer(i8),
    Access(EnumSet<AccessFlag>),
    Sideway(EnumSet<SidewayFlag>),
    Lanes(LanesValue),
    YearRange { from: i32, to: i32 },
    Sockets(Vec<Socket>),
}

/// Wire/value representation class of a feature.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueRep {
    /// Flag-only feature: presence is the value.
    None,
    Text,
    Byte,
    Layer,
    Access,
    Sideway,
    Lanes,
    YearRange,
    Sockets,
}

/// The closed set of feature definitions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FeatureKind {
    Name,
    NameAlt,
    NameShort,
    Ref,
    Location,
    Address,
    PostalCode,
    AdminLevel,
    Access,
    AccessRestricted,
    Layer,
    Width,
    MaxSpeed,
    Grade,
    Bridge,
    Tunnel,
    Roundabout,
    Embankment,
    Clockwise,
    Lanes,
    Sideway,
    ConstructionYear,
    OpeningHours,
    Fee,
    MaxStay,
    ChargingStation,
    Brand,
    Operator,
    Network,
    Phone,
    Website,
    Destination,
    From,
    To,
    IsIn,
}

/// Registration order of the standard features.
pub const ALL_FEATURES: &[FeatureKind] = &[
    FeatureKind::Name,
    FeatureKind::NameAlt,
    FeatureKind::NameShort,
    FeatureKind::Ref,
    FeatureKind::Location,
    FeatureKind::Address,
    FeatureKind::PostalCode,
    FeatureKind::AdminLevel,
    FeatureKind::Access,
    FeatureKind::AccessRestricted,
    FeatureKind::Layer,
    FeatureKind::Width,
    FeatureKind::MaxSpeed,
    FeatureKind::Grade,
    FeatureKind::Bridge,
    FeatureKind::Tunnel,
    FeatureKind::Roundabout,
    FeatureKind::Embankment,
    FeatureKind::Clockwise,
    FeatureKind::Lanes,
    FeatureKind::Sideway,
    FeatureKind::ConstructionYear,
    FeatureKind::OpeningHours,
    FeatureKind::Fee,
    FeatureKind::MaxStay,
    FeatureKind::ChargingStation,
    FeatureKind::Brand,
    FeatureKind::Operator,
    FeatureKind::Network,
    FeatureKind::Phone,
    FeatureKind::Website,
    FeatureKind::Destination,
    FeatureKind::From,
    FeatureKind::To,
    FeatureKind::IsIn,
];

impl FeatureKind {
    pub const fn name(self) -> &'static str {
        match self {
            FeatureKind::Name => "Name",
            FeatureKind::NameAlt => "NameAlt",
            FeatureKind::NameShort => "NameShort",
            FeatureKind::Ref => "Ref",
            FeatureKind::Location => "Location",
            FeatureKind::Address => "Address",
            FeatureKind::PostalCode => "PostalCode",
            FeatureKind::AdminLevel => "AdminLevel",
            FeatureKind::Access => "Access",
            FeatureKind::AccessRestricted => "AccessRestricted",
            FeatureKind::Layer => "Layer",
            FeatureKind::Width => "Width",
            FeatureKind::MaxSpeed => "MaxSpeed",
            FeatureKind::Grade => "Grade",
            FeatureKind::Bridge => "Bridge",
            FeatureKind::Tunnel => "Tunnel",
            FeatureKind::Roundabout => "Roundabout",
            FeatureKind::Embankment => "Embankment",
            FeatureKind::Clockwise => "Clockwise",
            FeatureKind::Lanes => "Lanes",
            FeatureKind::Sideway => "Sideway",
            FeatureKind::ConstructionYear => "ConstructionYear",
            FeatureKind::OpeningHours => "OpeningHours",
            FeatureKind::Fee => "Fee",
            FeatureKind::MaxStay => "MaxStay",
            FeatureKind::ChargingStation => "ChargingStation",
            FeatureKind::Brand => "Brand",
            FeatureKind::Operator => "Operator",
            FeatureKind::Network => "Network",
            FeatureKind::Phone => "Phone",
            FeatureKind::Website => "Website",
            FeatureKind::Destination => "Destination",
            FeatureKind::From => "From",
            FeatureKind::To => "To",
            FeatureKind::IsIn => "IsIn",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_FEATURES.iter().copied().find(|k| k.name() == name)
    }

    pub const fn representation(self) -> ValueRep {
        match self {
            FeatureKind::Name
            | FeatureKind::NameAlt
            | FeatureKind::NameShort
            | FeatureKind::Ref
            | FeatureKind::Location
            | FeatureKind::Address
            | FeatureKind::PostalCode
            | FeatureKind::OpeningHours
            | FeatureKind::Fee
            | FeatureKind::MaxStay
            | FeatureKind::Brand
            | FeatureKind::Operator
            | FeatureKind::Network
            | FeatureKind::Phone
            | FeatureKind::Website
            | FeatureKind::Destination
            | FeatureKind::From
            | FeatureKind::To
            | FeatureKind::IsIn => ValueRep::Text,
            FeatureKind::AdminLevel
            | FeatureKind::Width
            | FeatureKind::MaxSpeed
            | FeatureKind::Grade => ValueRep::Byte,
            FeatureKind::Layer => ValueRep::Layer,
            FeatureKind::Access => ValueRep::Access,
            FeatureKind::Sideway => ValueRep::Sideway,
            FeatureKind::Lanes => ValueRep::Lanes,
            FeatureKind::ConstructionYear => ValueRep::YearRange,
            FeatureKind::ChargingStation => ValueRep::Sockets,
            FeatureKind::Bridge
            | FeatureKind::Tunnel
            | FeatureKind::Roundabout
            | FeatureKind::Embankment
            | FeatureKind::Clockwise
            | FeatureKind::AccessRestricted => ValueRep::None,
        }
    }

    pub const fn has_value(self) -> bool {
        !matches!(self.representation(), ValueRep::None)
    }

    /// Nominal size of the value inside a buffer; string-like values count as
    /// a pointer-sized slot. Only used for the deterministic value-buffer
    /// offsets of a sealed type.
    pub const fn value_size(self) -> usize {
        match self.representation() {
            ValueRep::None => 0,
            ValueRep::Byte | ValueRep::Layer | ValueRep::Access | ValueRep::Sideway => 1,
            ValueRep::Text | ValueRep::YearRange | ValueRep::Sockets => 8,
            ValueRep::Lanes => 16,
        }
    }

    /// Human-readable attribute projections of this feature.
    pub const fn labels(self) -> &'static [&'static str] {
        match self {
            FeatureKind::Name => &["name"],
            FeatureKind::NameAlt => &["nameAlt"],
            FeatureKind::NameShort => &["nameShort"],
            FeatureKind::Ref => &["ref"],
            FeatureKind::PostalCode => &["postalCode"],
            FeatureKind::Destination => &["destination"],
            FeatureKind::Brand => &["brand"],
            FeatureKind::Operator => &["operator"],
            _ => &[],
        }
    }

    /// The OSM tags this feature inspects; registered when the feature is.
    pub const fn tags(self) -> &'static [&'static str] {
        match self {
            FeatureKind::Name => &["name"],
            FeatureKind::NameAlt => &["alt_name"],
            FeatureKind::NameShort => &["short_name"],
            FeatureKind::Ref => &["ref"],
            FeatureKind::Location => &["addr:street"],
            FeatureKind::Address => &["addr:housenumber"],
            FeatureKind::PostalCode => &["postal_code", "addr:postcode"],
            FeatureKind::AdminLevel => &["admin_level"],
            FeatureKind::Access => &[
                "access",
                "access:forward",
                "access:backward",
                "oneway",
                "junction",
                "foot",
                "foot:forward",
                "foot:backward",
                "bicycle",
                "bicycle:forward",
                "bicycle:backward",
                "motor_vehicle",
                "motor_vehicle:forward",
                "motor_vehicle:backward",
                "motorcar",
                "motorcar:forward",
                "motorcar:backward",
            ],
            FeatureKind::AccessRestricted => &["access"],
            FeatureKind::Layer => &["layer"],
            FeatureKind::Width => &["width"],
            FeatureKind::MaxSpeed => &["maxspeed"],
            FeatureKind::Grade => &["tracktype", "surface"],
            FeatureKind::Bridge => &["bridge"],
            FeatureKind::Tunnel => &["tunnel"],
            FeatureKind::Roundabout => &["junction"],
            FeatureKind::Embankment => &["embankment"],
            FeatureKind::Clockwise => &["direction"],
            FeatureKind::Lanes => &[
                "lanes",
                "lanes:forward",
                "lanes:backward",
                "oneway",
                "junction",
                "turn:lanes",
                "turn:lanes:forward",
                "turn:lanes:backward",
                "destination:lanes",
                "destination:lanes:forward",
                "destination:lanes:backward",
            ],
            FeatureKind::Sideway => &["sidewalk", "cycleway", "cycleway:left", "cycleway:right"],
            FeatureKind::ConstructionYear => &["construction:date", "construction"],
            FeatureKind::OpeningHours => &["opening_hours"],
            FeatureKind::Fee => &["fee"],
            FeatureKind::MaxStay => &["maxstay"],
            FeatureKind::ChargingStation => &[
                "socket:type1",
                "socket:type2",
                "socket:chademo",
                "socket:ccs",
                "socket:tesla_supercharger",
                "socket:schuko",
            ],
            FeatureKind::Brand => &["brand"],
            FeatureKind::Operator => &["operator"],
            FeatureKind::Network => &["network"],
            FeatureKind::Phone => &["phone", "contact:phone"],
            FeatureKind::Website => &["website", "contact:website"],
            FeatureKind::Destination => &["destination", "destination:ref", "destination:forward"],
            FeatureKind::From => &["from"],
            FeatureKind::To => &["to"],
            FeatureKind::IsIn => &["is_in"],
        }
    }
}

/// Result of running one feature's parse routine against a tag map.
#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    /// Nothing relevant found; the feature stays unset.
    Skip,
    /// Flag-only feature: set the presence bit.
    Flag,
    /// Set the presence bit and store the value.
    Value(FeatureValue),
}

/// Everything a feature parse routine gets to see.
pub struct ParseContext<'a> {
    pub reporter: &'a dyn TagErrorReporter,
    pub config: &'a TypeConfig,
    pub type_info: &'a TypeInfo,
    pub object: &'a ObjectOsmRef,
    pub tags: &'a TagMap,
}

impl<'a> ParseContext<'a> {
    fn tag(&self, name: &str) -> Option<&'a str> {
        self.config
            .tag_id(name)
            .and_then(|id| self.tags.get(&id))
            .map(String::as_str)
    }

    fn first_tag(&self, names: &[&str]) -> Option<&'a str> {
        names.iter().find_map(|name| self.tag(name))
    }

    fn report(&self, key: &str, value: &str, message: &str) {
        self.reporter.report_tag(self.object, key, value, message);
    }
}

/// Default access mask derived from the type's routing flags; this is also
/// what an object without a stored Access value reports.
pub fn default_access(type_info: &TypeInfo) -> EnumSet<AccessFlag> {
    let mut access = EnumSet::empty();
    if type_info.can_route_foot() {
        access |= ACCESS_FOOT;
    }
    if type_info.can_route_bicycle() {
        access |= ACCESS_BICYCLE;
    }
    if type_info.can_route_car() {
        access |= ACCESS_CAR;
    }
    access
}

impl FeatureKind {
    pub fn parse(self, ctx: &ParseContext<'_>) -> ParseOutcome {
        match self.representation() {
            ValueRep::Text => self.parse_text(ctx),
            ValueRep::Byte => self.parse_byte(ctx),
            ValueRep::Layer => parse_layer(ctx),
            ValueRep::Access => parse_access(ctx),
            ValueRep::Sideway => parse_sideway(ctx),
            ValueRep::Lanes => parse_lanes(ctx),
            ValueRep::YearRange => parse_construction_year(ctx),
            ValueRep::Sockets => parse_charging_station(ctx),
            ValueRep::None => self.parse_flag(ctx),
        }
    }

    fn parse_text(self, ctx: &ParseContext<'_>) -> ParseOutcome {
        if self == FeatureKind::Fee {
            return match ctx.tag("fee") {
                Some(value) if value != "no" => {
                    ParseOutcome::Value(FeatureValue::Text(value.to_string()))
                }
                _ => ParseOutcome::Skip,
            };
        }

        match ctx.first_tag(self.tags()) {
            Some(value) if !value.is_empty() => {
                ParseOutcome::Value(FeatureValue::Text(value.to_string()))
            }
            _ => ParseOutcome::Skip,
        }
    }

    fn parse_byte(self, ctx: &ParseContext<'_>) -> ParseOutcome {
        match self {
            FeatureKind::AdminLevel => match ctx.tag("admin_level") {
                Some(value) => match value.trim().parse::<u8>() {
                    Ok(level) => ParseOutcome::Value(FeatureValue::Byte(level)),
                    Err(_) => {
                        ctx.report("admin_level", value, "not a number");
                        ParseOutcome::Skip
                    }
                },
                None => ParseOutcome::Skip,
            },
            FeatureKind::Width => parse_width(ctx),
            FeatureKind::MaxSpeed => parse_max_speed(ctx),
            FeatureKind::Grade => parse_grade(ctx),
            _ => unreachable!("no byte-valued parse for {self:?}"),
        }
    }

    fn parse_flag(self, ctx: &ParseContext<'_>) -> ParseOutcome {
        let set = match self {
            FeatureKind::Bridge => ctx.tag("bridge").is_some_and(|v| v != "no"),
            FeatureKind::Tunnel => ctx.tag("tunnel").is_some_and(|v| v != "no"),
            FeatureKind::Embankment => ctx.tag("embankment").is_some_and(|v| v != "no"),
            FeatureKind::Roundabout => ctx.tag("junction") == Some("roundabout"),
            FeatureKind::Clockwise => ctx.tag("direction") == Some("clockwise"),
            FeatureKind::AccessRestricted => ctx.tag("access").is_some_and(|v| {
                !matches!(v, "no" | "yes" | "use_sidepath" | "permissive" | "designated")
            }),
            _ => unreachable!("no flag parse for {self:?}"),
        };

        if set { ParseOutcome::Flag } else { ParseOutcome::Skip }
    }
}

/// Removes `flag`, then re-adds it unless the tag value is "no".
fn apply_directional_flag(
    ctx: &ParseContext<'_>,
    tag: &str,
    access: &mut EnumSet<AccessFlag>,
    flag: AccessFlag,
) {
    if let Some(value) = ctx.tag(tag) {
        access.remove(flag);
        if value != "no" {
            access.insert(flag);
        }
    }
}

/// Removes the mode pair, then re-adds each direction unless blocked by an
/// established oneway flag.
fn apply_mode_pair(
    value: &str,
    access: &mut EnumSet<AccessFlag>,
    forward: AccessFlag,
    backward: AccessFlag,
) {
    access.remove(forward);
    access.remove(backward);

    if value != "no" {
        if !access.contains(AccessFlag::OnewayBackward) {
            access.insert(forward);
        }
        if !access.contains(AccessFlag::OnewayForward) {
            access.insert(backward);
        }
    }
}

fn parse_access(ctx: &ParseContext<'_>) -> ParseOutcome {
    let defaults = default_access(ctx.type_info);
    let mut access = defaults;

    // Class-level access=no clears everything; positive restrictions are
    // added back below. Any other class value leaves the flags untouched.
    if ctx.tag("access") == Some("no") {
        access = EnumSet::empty();
    }

    if let Some(value) = ctx.tag("access:forward") {
        access -= ACCESS_FORWARD;
        if value != "no" {
            access |= ACCESS_FORWARD;
        }
    } else if let Some(value) = ctx.tag("access:backward") {
        access -= ACCESS_BACKWARD;
        if value != "no" {
            access |= ACCESS_BACKWARD;
        }
    }

    if let Some(value) = ctx.tag("oneway") {
        if value == "-1" {
            access.remove(AccessFlag::BicycleForward);
            access.remove(AccessFlag::CarForward);
            access.remove(AccessFlag::OnewayForward);
            access.insert(AccessFlag::OnewayBackward);
        } else if !matches!(value, "no" | "false" | "0") {
            access.remove(AccessFlag::BicycleBackward);
            access.remove(AccessFlag::CarBackward);
            access.remove(AccessFlag::OnewayBackward);
            access.insert(AccessFlag::OnewayForward);
        }
    } else if ctx.tag("junction") == Some("roundabout") {
        access.remove(AccessFlag::BicycleBackward);
        access.remove(AccessFlag::CarBackward);
        access.remove(AccessFlag::OnewayBackward);
        access.insert(AccessFlag::BicycleForward);
        access.insert(AccessFlag::CarForward);
        access.insert(AccessFlag::OnewayForward);
    }

    if let Some(value) = ctx.tag("foot") {
        access.remove(AccessFlag::FootForward);
        access.remove(AccessFlag::FootBackward);
        if value != "no" {
            access.insert(AccessFlag::FootForward);
            access.insert(AccessFlag::FootBackward);
        }
    }

    if let Some(value) = ctx.tag("bicycle") {
        apply_mode_pair(
            value,
            &mut access,
            AccessFlag::BicycleForward,
            AccessFlag::BicycleBackward,
        );
    }

    if let Some(value) = ctx.tag("motor_vehicle") {
        apply_mode_pair(
            value,
            &mut access,
            AccessFlag::CarForward,
            AccessFlag::CarBackward,
        );
    }

    if let Some(value) = ctx.tag("motorcar") {
        apply_mode_pair(
            value,
            &mut access,
            AccessFlag::CarForward,
            AccessFlag::CarBackward,
        );
    }

    apply_directional_flag(ctx, "foot:forward", &mut access, AccessFlag::FootForward);
    apply_directional_flag(ctx, "foot:backward", &mut access, AccessFlag::FootBackward);
    apply_directional_flag(ctx, "bicycle:forward", &mut access, AccessFlag::BicycleForward);
    apply_directional_flag(ctx, "bicycle:backward", &mut access, AccessFlag::BicycleBackward);
    apply_directional_flag(ctx, "motor_vehicle:forward", &mut access, AccessFlag::CarForward);
    apply_directional_flag(ctx, "motor_vehicle:backward", &mut access, AccessFlag::CarBackward);
    apply_directional_flag(ctx, "motorcar:forward", &mut access, AccessFlag::CarForward);
    apply_directional_flag(ctx, "motorcar:backward", &mut access, AccessFlag::CarBackward);

    if access == defaults {
        ParseOutcome::Skip
    } else {
        ParseOutcome::Value(FeatureValue::Access(access))
    }
}

fn parse_max_speed(ctx: &ParseContext<'_>) -> ParseOutcome {
    let Some(raw) = ctx.tag("maxspeed") else {
        return ParseOutcome::Skip;
    };

    // Explicitly unset values.
    if matches!(raw, "signals" | "none" | "no") {
        return ParseOutcome::Skip;
    }

    // "walk" should not be used, but an estimate beats the default.
    if raw == "walk" {
        return ParseOutcome::Value(FeatureValue::Byte(10));
    }

    let mut value = raw;
    let mut is_mph = false;

    if let Some(stripped) = value.strip_suffix("mph") {
        value = stripped;
        is_mph = true;
    } else if let Some(stripped) = value.strip_suffix("km/h") {
        value = stripped;
    }
    let value = value.trim_end();

    let numeric = match value.parse::<u64>() {
        Ok(n) => n,
        Err(_) => match ctx.config.max_speed_alias(value) {
            Some(speed) => u64::from(speed),
            None => {
                ctx.report("maxspeed", raw, "not numeric");
                return ParseOutcome::Skip;
            }
        },
    };

    let speed = if is_mph {
        if numeric as f64 > f64::from(u8::MAX) / 1.609 + 0.5 {
            u8::MAX
        } else {
            (numeric as f64 * 1.609 + 0.5) as u8
        }
    } else if numeric > u64::from(u8::MAX) {
        u8::MAX
    } else {
        numeric as u8
    };

    ParseOutcome::Value(FeatureValue::Byte(speed))
}

fn parse_grade(ctx: &ParseContext<'_>) -> ParseOutcome {
    if let Some(tracktype) = ctx.tag("tracktype") {
        match tracktype {
            "grade1" => return ParseOutcome::Value(FeatureValue::Byte(1)),
            "grade2" => return ParseOutcome::Value(FeatureValue::Byte(2)),
            "grade3" => return ParseOutcome::Value(FeatureValue::Byte(3)),
            "grade4" => return ParseOutcome::Value(FeatureValue::Byte(4)),
            "grade5" => return ParseOutcome::Value(FeatureValue::Byte(5)),
            _ => ctx.report("tracktype", tracktype, "unsupported tracktype"),
        }
    }

    if let Some(surface) = ctx.tag("surface") {
        match ctx.config.grade_for_surface(surface) {
            Some(grade) => return ParseOutcome::Value(FeatureValue::Byte(grade)),
            None => ctx.report("surface", surface, "unknown surface type"),
        }
    }

    ParseOutcome::Skip
}

fn parse_width(ctx: &ParseContext<'_>) -> ParseOutcome {
    let Some(raw) = ctx.tag("width") else {
        return ParseOutcome::Skip;
    };

    let mut value = raw.to_string();

    // Many values use ',' as the decimal separator; fix a single occurrence.
    if value.matches(',').count() == 1 {
        value = value.replacen(',', ".", 1);
    }

    // Some values add an 'm' to hint the unit.
    if let Some(stripped) = value.strip_suffix('m') {
        let preceding = stripped.chars().last();
        if preceding.is_some_and(|c| c.is_ascii_digit() || c == ' ') {
            value = stripped.to_string();
        }
    }
    let value = value.trim_end();

    match value.parse::<f64>() {
        Ok(width) if (0.0..=255.5).contains(&width) => {
            ParseOutcome::Value(FeatureValue::Byte((width + 0.5).floor() as u8))
        }
        Ok(_) => {
            ctx.report("width", raw, "value out of range");
            ParseOutcome::Skip
        }
        Err(_) => {
            ctx.report("width", raw, "not a number");
            ParseOutcome::Skip
        }
    }
}

fn parse_layer(ctx: &ParseContext<'_>) -> ParseOutcome {
    let Some(raw) = ctx.tag("layer") else {
        return ParseOutcome::Skip;
    };

    match raw.trim_start_matches('+').parse::<i8>() {
        Ok(layer) => ParseOutcome::Value(FeatureValue::Layer(layer)),
        Err(_) => {
            ctx.report("layer", raw, "not a number");
            ParseOutcome::Skip
        }
    }
}

fn parse_sideway(ctx: &ParseContext<'_>) -> ParseOutcome {
    let mut flags: EnumSet<SidewayFlag> = EnumSet::empty();

    match ctx.tag("sidewalk") {
        Some("both") => {
            flags |= SidewayFlag::FootwayTrackLeft | SidewayFlag::FootwayTrackRight;
        }
        Some("left") => {
            flags |= SidewayFlag::FootwayTrackLeft;
        }
        Some("right") => {
            flags |= SidewayFlag::FootwayTrackRight;
        }
        _ => {}
    }

    let cycleway_both = ctx.tag("cycleway");
    let apply_cycleway = |value: Option<&str>,
                          lane: SidewayFlag,
                          track: SidewayFlag,
                          flags: &mut EnumSet<SidewayFlag>| {
        match value {
            Some("lane" | "shared_lane") => {
                flags.insert(lane);
            }
            Some("track") => {
                flags.insert(track);
            }
            _ => {}
        }
    };

    apply_cycleway(
        cycleway_both,
        SidewayFlag::CyclewayLaneLeft,
        SidewayFlag::CyclewayTrackLeft,
        &mut flags,
    );
    apply_cycleway(
        cycleway_both,
        SidewayFlag::CyclewayLaneRight,
        SidewayFlag::CyclewayTrackRight,
        &mut flags,
    );
    apply_cycleway(
        ctx.tag("cycleway:left"),
        SidewayFlag::CyclewayLaneLeft,
        SidewayFlag::CyclewayTrackLeft,
        &mut flags,
    );
    apply_cycleway(
        ctx.tag("cycleway:right"),
        SidewayFlag::CyclewayLaneRight,
        SidewayFlag::CyclewayTrackRight,
        &mut flags,
    );

    if flags.is_empty() {
        ParseOutcome::Skip
    } else {
        ParseOutcome::Value(FeatureValue::Sideway(flags))
    }
}

fn parse_lane_turns(value: &str) -> Vec<LaneTurn> {
    value
        .split('|')
        .map(|lane| match lane {
            "left" => LaneTurn::Left,
            "slight_left" => LaneTurn::SlightLeft,
            "sharp_left" => LaneTurn::SharpLeft,
            "through" => LaneTurn::Through,
            "right" => LaneTurn::Right,
            "slight_right" => LaneTurn::SlightRight,
            "sharp_right" => LaneTurn::SharpRight,
            "merge_to_left" => LaneTurn::MergeToLeft,
            "merge_to_right" => LaneTurn::MergeToRight,
            "through;left" | "left;through" => LaneTurn::ThroughLeft,
            "through;right" | "right;through" => LaneTurn::ThroughRight,
            _ => LaneTurn::None,
        })
        .collect()
}

fn parse_lanes(ctx: &ParseContext<'_>) -> ParseOutcome {
    let total = ctx.tag("lanes").and_then(|v| v.trim().parse::<u8>().ok());
    let explicit_forward = ctx
        .tag("lanes:forward")
        .and_then(|v| v.trim().parse::<u8>().ok());
    let explicit_backward = ctx
        .tag("lanes:backward")
        .and_then(|v| v.trim().parse::<u8>().ok());

    let turn_forward = ctx.tag("turn:lanes:forward").map(parse_lane_turns);
    let turn_backward = ctx.tag("turn:lanes:backward").map(parse_lane_turns);
    let turn_plain = ctx.tag("turn:lanes").map(parse_lane_turns);

    let destination_forward = ctx.tag("destination:lanes:forward").or_else(|| {
        ctx.tag("destination:lanes")
    });
    let destination_backward = ctx.tag("destination:lanes:backward");

    let any_input = total.is_some()
        || explicit_forward.is_some()
        || explicit_backward.is_some()
        || turn_forward.is_some()
        || turn_backward.is_some()
        || turn_plain.is_some()
        || destination_forward.is_some()
        || destination_backward.is_some();

    if !any_input {
        return ParseOutcome::Skip;
    }

    let oneway = ctx
        .tag("oneway")
        .is_some_and(|v| !matches!(v, "no" | "false" | "0"))
        || ctx.tag("junction") == Some("roundabout");

    let (forward, backward) = if oneway {
        (total.unwrap_or(1), 0)
    } else {
        match (explicit_forward, explicit_backward, total) {
            (Some(f), Some(b), _) => (f, b),
            (Some(f), None, Some(t)) => (f, t.saturating_sub(f)),
            (None, Some(b), Some(t)) => (t.saturating_sub(b), b),
            (Some(f), None, None) => (f, 0),
            (None, Some(b), None) => (0, b),
            (None, None, Some(t)) => (t.div_ceil(2), t / 2),
            (None, None, None) => (1, 1),
        }
    };

    let value = LanesValue {
        forward,
        backward,
        turn_forward: if oneway {
            turn_plain.or(turn_forward).unwrap_or_default()
        } else {
            turn_forward.unwrap_or_default()
        },
        turn_backward: turn_backward.unwrap_or_default(),
        destination_forward: destination_forward.unwrap_or_default().to_string(),
        destination_backward: destination_backward.unwrap_or_default().to_string(),
    };

    ParseOutcome::Value(FeatureValue::Lanes(value))
}

fn parse_construction_year(ctx: &ParseContext<'_>) -> ParseOutcome {
    let Some(raw) = ctx.first_tag(&["construction:date", "construction"]) else {
        return ParseOutcome::Skip;
    };

    let parse_year = |s: &str| s.trim().parse::<i32>().ok();

    if let Some((from, to)) = raw.split_once('-')
        && let (Some(from), Some(to)) = (parse_year(from), parse_year(to))
    {
        return ParseOutcome::Value(FeatureValue::YearRange { from, to });
    }

    if let Some(year) = parse_year(raw) {
        return ParseOutcome::Value(FeatureValue::YearRange {
            from: year,
            to: year,
        });
    }

    // Plain construction=yes style tagging carries no date.
    ParseOutcome::Skip
}

fn parse_charging_station(ctx: &ParseContext<'_>) -> ParseOutcome {
    let mut sockets = Vec::new();

    for (tag, kind) in SocketKind::TAGS {
        if let Some(value) = ctx.tag(tag) {
            if value == "no" {
                continue;
            }
            let capacity = value.trim().parse::<u8>().unwrap_or(1);
            sockets.push(Socket {
                kind: *kind,
                capacity,
            });
        }
    }

    if sockets.is_empty() {
        ParseOutcome::Skip
    } else {
        ParseOutcome::Value(FeatureValue::Sockets(sockets))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureCodecError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("Invalid encoded value {value} for {what}")]
    InvalidValue { what: &'static str, value: u64 },
}

impl FeatureKind {
    /// Reads a value of this feature from the binary layer.
    pub fn read_value(self, scanner: &mut FileScanner) -> Result<FeatureValue, FeatureCodecError> {
        match self.representation() {
            ValueRep::None => unreachable!("flag features have no value"),
            ValueRep::Text => Ok(FeatureValue::Text(scanner.read_string()?)),
            ValueRep::Byte => Ok(FeatureValue::Byte(scanner.read_u8()?)),
            ValueRep::Layer => Ok(FeatureValue::Layer(scanner.read_i8()?)),
            ValueRep::Access => Ok(FeatureValue::Access(EnumSet::from_repr(scanner.read_u8()?))),
            ValueRep::Sideway => Ok(FeatureValue::Sideway(EnumSet::from_repr_truncated(
                scanner.read_u8()?,
            ))),
            ValueRep::Lanes => {
                let forward = scanner.read_u8()?;
                let backward = scanner.read_u8()?;

                let mut read_turns = |scanner: &mut FileScanner| -> Result<Vec<LaneTurn>, FeatureCodecError> {
                    let count = scanner.read_number()?;
                    (0..count)
                        .map(|_| {
                            let raw = scanner.read_u8()?;
                            LaneTurn::try_from(raw).map_err(|_| FeatureCodecError::InvalidValue {
                                what: "lane turn",
                                value: u64::from(raw),
                            })
                        })
                        .collect()
                };

                let turn_forward = read_turns(scanner)?;
                let turn_backward = read_turns(scanner)?;
                let destination_forward = scanner.read_string()?;
                let destination_backward = scanner.read_string()?;

                Ok(FeatureValue::Lanes(LanesValue {
                    forward,
                    backward,
                    turn_forward,
                    turn_backward,
                    destination_forward,
                    destination_backward,
                }))
            }
            ValueRep::YearRange => {
                let from = scanner.read_i32()?;
                let to = scanner.read_i32()?;
                Ok(FeatureValue::YearRange { from, to })
            }
            ValueRep::Sockets => {
                let count = scanner.read_number()?;
                let sockets = (0..count)
                    .map(|_| {
                        let raw = scanner.read_u8()?;
                        let kind =
                            SocketKind::try_from(raw).map_err(|_| FeatureCodecError::InvalidValue {
                                what: "socket kind",
                                value: u64::from(raw),
                            })?;
                        let capacity = scanner.read_u8()?;
                        Ok(Socket { kind, capacity })
                    })
                    .collect::<Result<Vec<_>, FeatureCodecError>>()?;
                Ok(FeatureValue::Sockets(sockets))
            }
        }
    }
}

impl FeatureValue {
    /// Writes the value to the binary layer.
    pub fn write(&self, writer: &mut FileWriter) -> Result<(), IoError> {
        match self {
            FeatureValue::Text(text) => writer.write_string(text),
            FeatureValue::Byte(value) => writer.write_u8(*value),
            FeatureValue::Layer(value) => writer.write_i8(*value),
            FeatureValue::Access(flags) => writer.write_u8(flags.as_repr()),
            FeatureValue::Sideway(flags) => writer.write_u8(flags.as_repr()),
            FeatureValue::Lanes(lanes) => {
                writer.write_u8(lanes.forward)?;
                writer.write_u8(lanes.backward)?;
                writer.write_number(lanes.turn_forward.len() as u64)?;
                for turn in &lanes.turn_forward {
                    writer.write_u8((*turn).into())?;
                }
                writer.write_number(lanes.turn_backward.len() as u64)?;
                for turn in &lanes.turn_backward {
                    writer.write_u8((*turn).into())?;
                }
                writer.write_string(&lanes.destination_forward)?;
                writer.write_string(&lanes.destination_backward)
            }
            FeatureValue::YearRange { from, to } => {
                writer.write_i32(*from)?;
                writer.write_i32(*to)
            }
            FeatureValue::Sockets(sockets) => {
                writer.write_number(sockets.len() as u64)?;
                for socket in sockets {
                    writer.write_u8(socket.kind.into())?;
                    writer.write_u8(socket.capacity)?;
                }
                Ok(())
            }
        }
    }
}
