//! # Geometry primitives
//!
//! Coordinates, bounding boxes and the handful of polygon predicates the
//! import pipeline and the indices rely on. Spherical math (distance,
//! bearing) delegates to [`geo`].

use crate::Id;
use geo::{Bearing, Distance, Haversine, Point as GeoPoint};
use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// Fixed-point conversion factor for latitudes: the full `[-90, 90]` range is
/// mapped onto `[0, u32::MAX]`, giving a resolution of about 4.2e-8 degrees
/// (millimetres on the ground).
const LAT_CONVERSION: f64 = u32::MAX as f64 / 180.0;

/// Fixed-point conversion factor for longitudes over `[-180, 180]`.
/// Resolution is about 8.4e-8 degrees (under a centimetre at the equator).
const LON_CONVERSION: f64 = u32::MAX as f64 / 360.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GeometryError {
    #[error("Coordinate ({lat}, {lon}) is outside the valid geographic range.")]
    CoordinateOutOfRange { lat: f64, lon: f64 },
}

/// A WGS84 coordinate; immutable value type.
///
/// Invariant: `-90 <= lat <= 90` and `-180 <= lon <= 180`. Constructors from
/// trusted sources (decoded files) use [`GeoCoord::new`], which only checks in
/// debug builds; external input goes through [`GeoCoord::try_new`].
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub struct GeoCoord {
    lat: f64,
    lon: f64,
}

impl GeoCoord {
    #[inline]
    pub fn new(lat: f64, lon: f64) -> Self {
        debug_assert!((-90.0..=90.0).contains(&lat), "latitude out of range");
        debug_assert!((-180.0..=180.0).contains(&lon), "longitude out of range");
        Self { lat, lon }
    }

    pub fn try_new(lat: f64, lon: f64) -> Result<Self, GeometryError> {
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
            Ok(Self { lat, lon })
        } else {
            Err(GeometryError::CoordinateOutOfRange { lat, lon })
        }
    }

    #[inline]
    pub const fn lat(&self) -> f64 {
        self.lat
    }

    #[inline]
    pub const fn lon(&self) -> f64 {
        self.lon
    }

    /// Packs the coordinate into the fixed-point `(lon, lat)` pair used by the
    /// binary format.
    #[inline]
    pub fn to_packed(self) -> (u32, u32) {
        let lon = ((self.lon + 180.0) * LON_CONVERSION).round() as u32;
        let lat = ((self.lat + 90.0) * LAT_CONVERSION).round() as u32;
        (lon, lat)
    }

    /// Reverses [`GeoCoord::to_packed`].
    #[inline]
    pub fn from_packed(lon: u32, lat: u32) -> Self {
        Self {
            lat: f64::from(lat) / LAT_CONVERSION - 90.0,
            lon: f64::from(lon) / LON_CONVERSION - 180.0,
        }
    }

    /// Great-circle distance to `other` in meters.
    #[inline]
    pub fn distance_m(&self, other: &GeoCoord) -> f64 {
        Haversine.distance(GeoPoint::from(*self), GeoPoint::from(*other))
    }

    /// Initial great-circle bearing towards `other`, normalized to
    /// `[0, 360)` degrees clockwise from north.
    pub fn bearing_deg(&self, other: &GeoCoord) -> f64 {
        let raw = Haversine.bearing(GeoPoint::from(*self), GeoPoint::from(*other));
        raw.rem_euclid(360.0)
    }
}

impl From<GeoCoord> for GeoPoint<f64> {
    fn from(coord: GeoCoord) -> Self {
        GeoPoint::new(coord.lon, coord.lat)
    }
}

impl Display for GeoCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.5} {:.5}", self.lat, self.lon)
    }
}

/// Signed change of direction between two bearings, in `(-180, 180]` degrees.
/// Positive values turn right, negative values turn left.
pub fn bearing_change_deg(from_deg: f64, to_deg: f64) -> f64 {
    let delta = (to_deg - from_deg).rem_euclid(360.0);
    if delta > 180.0 { delta - 360.0 } else { delta }
}

/// A coordinate plus the serial id used for node-identity equality in ring
/// assembly and routing-graph construction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Point {
    pub id: Id,
    pub coord: GeoCoord,
}

impl Point {
    pub const fn new(id: Id, coord: GeoCoord) -> Self {
        Self { id, coord }
    }
}

/// An ordered pair of corners. Invariant: `min <= max` in both axes
/// (enforced by normalizing in the constructor).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GeoBox {
    min: GeoCoord,
    max: GeoCoord,
}

impl GeoBox {
    pub fn new(a: GeoCoord, b: GeoCoord) -> Self {
        Self {
            min: GeoCoord::new(a.lat().min(b.lat()), a.lon().min(b.lon())),
            max: GeoCoord::new(a.lat().max(b.lat()), a.lon().max(b.lon())),
        }
    }

    /// The smallest box containing every coordinate in `coords`.
    /// Returns `None` for an empty slice.
    pub fn bounding(coords: impl IntoIterator<Item = GeoCoord>) -> Option<Self> {
        let mut iter = coords.into_iter();
        let first = iter.next()?;
        let mut result = GeoBox::new(first, first);
        for coord in iter {
            result.include_coord(coord);
        }
        Some(result)
    }

    #[inline]
    pub const fn min(&self) -> GeoCoord {
        self.min
    }

    #[inline]
    pub const fn max(&self) -> GeoCoord {
        self.max
    }

    pub fn center(&self) -> GeoCoord {
        GeoCoord::new(
            (self.min.lat() + self.max.lat()) / 2.0,
            (self.min.lon() + self.max.lon()) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.max.lon() - self.min.lon()
    }

    pub fn height(&self) -> f64 {
        self.max.lat() - self.min.lat()
    }

    pub fn contains(&self, coord: &GeoCoord) -> bool {
        coord.lat() >= self.min.lat()
            && coord.lat() <= self.max.lat()
            && coord.lon() >= self.min.lon()
            && coord.lon() <= self.max.lon()
    }

    pub fn intersects(&self, other: &GeoBox) -> bool {
        !(other.max.lon() < self.min.lon()
            || other.min.lon() > self.max.lon()
            || other.max.lat() < self.min.lat()
            || other.min.lat() > self.max.lat())
    }

    /// Grows this box to cover `other` as well.
    pub fn include(&mut self, other: &GeoBox) {
        self.include_coord(other.min);
        self.include_coord(other.max);
    }

    pub fn include_coord(&mut self, coord: GeoCoord) {
        self.min = GeoCoord::new(
            self.min.lat().min(coord.lat()),
            self.min.lon().min(coord.lon()),
        );
        self.max = GeoCoord::new(
            self.max.lat().max(coord.lat()),
            self.max.lon().max(coord.lon()),
        );
    }
}

impl Display for GeoBox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {}]", self.min, self.max)
    }
}

/// Great-circle length of a node sequence in meters.
pub fn polyline_length_m(points: &[Point]) -> f64 {
    points
        .iter()
        .tuple_windows()
        .map(|(a, b)| a.coord.distance_m(&b.coord))
        .sum()
}

/// Relation of a point to a closed ring (given without the repeated start
/// node): `1` = inside, `0` = on the boundary, `-1` = outside.
pub fn relation_of_point_to_ring(coord: &GeoCoord, ring: &[Point]) -> i8 {
    if ring.len() < 3 {
        return -1;
    }

    let x = coord.lon();
    let y = coord.lat();
    let mut inside = false;

    for i in 0..ring.len() {
        let a = ring[i].coord;
        let b = ring[(i + 1) % ring.len()].coord;

        if on_segment(x, y, a.lon(), a.lat(), b.lon(), b.lat()) {
            return 0;
        }

        // Ray casting towards +lon.
        if (a.lat() > y) != (b.lat() > y) {
            let x_cross = (b.lon() - a.lon()) * (y - a.lat()) / (b.lat() - a.lat()) + a.lon();
            if x < x_cross {
                inside = !inside;
            }
        }
    }

    if inside { 1 } else { -1 }
}

fn on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    if cross.abs() > f64::EPSILON {
        return false;
    }
    px >= ax.min(bx) && px <= ax.max(bx) && py >= ay.min(by) && py <= ay.max(by)
}

/// Whether ring `a` lies inside ring `b`.
///
/// This is the monotone "first decisive vertex" vote: it is only correct when
/// the rings are either disjoint or properly nested (never crossing), which
/// ring assembly guarantees for its outputs. Vertices on the boundary of `b`
/// are skipped; a ring touching `b` only at shared boundary nodes counts as
/// outside.
pub fn is_area_sub_of_area(a: &[Point], b: &[Point]) -> bool {
    for node in a {
        match relation_of_point_to_ring(&node.coord, b) {
            1 => return true,
            -1 => return false,
            _ => {}
        }
    }
    false
}

/// Whether the closed ring (stored without the repeated start node) is
/// simple, i.e. no two non-adjacent segments intersect.
pub fn is_ring_simple(ring: &[Point]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    for i in 0..n {
        let a1 = ring[i].coord;
        let a2 = ring[(i + 1) % n].coord;

        for j in i + 1..n {
            // Segments sharing an endpoint are allowed to touch there.
            if j == i || (j + 1) % n == i || j == (i + 1) % n {
                continue;
            }

            let b1 = ring[j].coord;
            let b2 = ring[(j + 1) % n].coord;

            if segments_intersect(a1, a2, b1, b2) {
                return false;
            }
        }
    }

    true
}

fn orientation(a: GeoCoord, b: GeoCoord, c: GeoCoord) -> i8 {
    let v = (b.lon() - a.lon()) * (c.lat() - a.lat()) - (b.lat() - a.lat()) * (c.lon() - a.lon());
    if v > f64::EPSILON {
        1
    } else if v < -f64::EPSILON {
        -1
    } else {
        0
    }
}

fn segments_intersect(a1: GeoCoord, a2: GeoCoord, b1: GeoCoord, b2: GeoCoord) -> bool {
    let o1 = orientation(a1, a2, b1);
    let o2 = orientation(a1, a2, b2);
    let o3 = orientation(b1, b2, a1);
    let o4 = orientation(b1, b2, a2);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    let collinear_overlap = |p: GeoCoord, q: GeoCoord, r: GeoCoord| {
        orientation(p, q, r) == 0
            && r.lon() >= p.lon().min(q.lon())
            && r.lon() <= p.lon().max(q.lon())
            && r.lat() >= p.lat().min(q.lat())
            && r.lat() <= p.lat().max(q.lat())
    };

    collinear_overlap(a1, a2, b1)
        || collinear_overlap(a1, a2, b2)
        || collinear_overlap(b1, b2, a1)
        || collinear_overlap(b1, b2, a2)
}

/// Douglas-Peucker polyline simplification with a tolerance in degrees.
/// Endpoints are always kept.
pub fn simplify_polyline(points: &[Point], tolerance_deg: f64) -> Vec<Point> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    simplify_segment(points, 0, points.len() - 1, tolerance_deg, &mut keep);

    points
        .iter()
        .zip(&keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

fn simplify_segment(points: &[Point], first: usize, last: usize, tolerance: f64, keep: &mut [bool]) {
    if last <= first + 1 {
        return;
    }

    let mut max_dist = 0.0;
    let mut max_index = first;

    for i in first + 1..last {
        let d = perpendicular_distance_deg(
            points[i].coord,
            points[first].coord,
            points[last].coord,
        );
        if d > max_dist {
            max_dist = d;
            max_index = i;
        }
    }

    if max_dist > tolerance {
        keep[max_index] = true;
        simplify_segment(points, first, max_index, tolerance, keep);
        simplify_segment(points, max_index, last, tolerance, keep);
    }
}

fn perpendicular_distance_deg(p: GeoCoord, a: GeoCoord, b: GeoCoord) -> f64 {
    let dx = b.lon() - a.lon();
    let dy = b.lat() - a.lat();
    let len_sq = dx * dx + dy * dy;

    if len_sq == 0.0 {
        let ex = p.lon() - a.lon();
        let ey = p.lat() - a.lat();
        return (ex * ex + ey * ey).sqrt();
    }

    let t = (((p.lon() - a.lon()) * dx + (p.lat() - a.lat()) * dy) / len_sq).clamp(0.0, 1.0);
    let ex = p.lon() - (a.lon() + t * dx);
    let ey = p.lat() - (a.lat() + t * dy);
    (ex * ex + ey * ey).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, proptest};

    fn ring(coords: &[(f64, f64)]) -> Vec<Point> {
        coords
            .iter()
            .enumerate()
            .map(|(i, (lat, lon))| Point::new(i as Id + 1, GeoCoord::new(*lat, *lon)))
            .collect()
    }

    #[test]
    fn coordinate_range_check() {
        assert!(GeoCoord::try_new(91.0, 0.0).is_err());
        assert!(GeoCoord::try_new(0.0, -180.5).is_err());
        assert!(GeoCoord::try_new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn packed_coord_roundtrip_error_is_below_resolution() {
        let coord = GeoCoord::new(50.6811, 7.1595);
        let (lon, lat) = coord.to_packed();
        let restored = GeoCoord::from_packed(lon, lat);

        assert!((restored.lat() - coord.lat()).abs() < 1e-7);
        assert!((restored.lon() - coord.lon()).abs() < 1e-7);
    }

    proptest! {
        #[test]
        fn packed_coord_roundtrip(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            let coord = GeoCoord::new(lat, lon);
            let (plon, plat) = coord.to_packed();
            let restored = GeoCoord::from_packed(plon, plat);

            prop_assert!((restored.lat() - lat).abs() < 1e-7);
            prop_assert!((restored.lon() - lon).abs() < 1e-7);
        }

        #[test]
        fn packing_is_monotone_in_lat(lat in -89.9f64..=89.9) {
            let low = GeoCoord::new(lat, 0.0).to_packed();
            let high = GeoCoord::new(lat + 0.1, 0.0).to_packed();
            prop_assert!(high.1 > low.1);
        }
    }

    #[test]
    fn geo_box_normalizes_corners() {
        let b = GeoBox::new(GeoCoord::new(2.0, 5.0), GeoCoord::new(-1.0, -3.0));
        assert_eq!(b.min(), GeoCoord::new(-1.0, -3.0));
        assert_eq!(b.max(), GeoCoord::new(2.0, 5.0));
        assert!(b.contains(&GeoCoord::new(0.0, 0.0)));
        assert!(!b.contains(&GeoCoord::new(3.0, 0.0)));
    }

    #[test]
    fn geo_box_intersection() {
        let a = GeoBox::new(GeoCoord::new(0.0, 0.0), GeoCoord::new(2.0, 2.0));
        let b = GeoBox::new(GeoCoord::new(1.0, 1.0), GeoCoord::new(3.0, 3.0));
        let c = GeoBox::new(GeoCoord::new(5.0, 5.0), GeoCoord::new(6.0, 6.0));

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn point_in_ring() {
        let square = ring(&[(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0)]);

        assert_eq!(relation_of_point_to_ring(&GeoCoord::new(2.0, 2.0), &square), 1);
        assert_eq!(relation_of_point_to_ring(&GeoCoord::new(5.0, 2.0), &square), -1);
        assert_eq!(relation_of_point_to_ring(&GeoCoord::new(0.0, 2.0), &square), 0);
    }

    #[test]
    fn nested_rings_containment() {
        let outer = ring(&[(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)]);
        let inner = ring(&[(2.0, 2.0), (2.0, 8.0), (8.0, 8.0), (8.0, 2.0)]);
        let separate = ring(&[(20.0, 20.0), (20.0, 22.0), (22.0, 22.0), (22.0, 20.0)]);

        assert!(is_area_sub_of_area(&inner, &outer));
        assert!(!is_area_sub_of_area(&outer, &inner));
        assert!(!is_area_sub_of_area(&separate, &outer));
    }

    #[test]
    fn simple_and_self_intersecting_rings() {
        let square = ring(&[(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0)]);
        // A bowtie: segments (0,0)-(4,4) and (4,0)-(0,4) cross.
        let bowtie = ring(&[(0.0, 0.0), (4.0, 4.0), (4.0, 0.0), (0.0, 4.0)]);

        assert!(is_ring_simple(&square));
        assert!(!is_ring_simple(&bowtie));
    }

    #[test]
    fn polyline_simplification_keeps_endpoints_and_corners() {
        let line = ring(&[
            (0.0, 0.0),
            (0.00001, 1.0),
            (0.0, 2.0),
            (5.0, 2.0),
            (5.0, 4.0),
        ]);
        let simplified = simplify_polyline(&line, 0.01);

        assert_eq!(simplified.first(), line.first());
        assert_eq!(simplified.last(), line.last());
        // The nearly-collinear point must be dropped, the corners kept.
        assert_eq!(simplified.len(), 4);
    }

    #[test]
    fn bearing_and_turns() {
        let a = GeoCoord::new(0.0, 0.0);
        let north = GeoCoord::new(1.0, 0.0);
        let east = GeoCoord::new(0.0, 1.0);

        assert!(a.bearing_deg(&north).abs() < 0.5);
        assert!((a.bearing_deg(&east) - 90.0).abs() < 0.5);

        assert!((bearing_change_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((bearing_change_deg(10.0, 350.0) + 20.0).abs() < 1e-9);
    }

    #[test]
    fn spherical_distance_sanity() {
        // One degree of latitude is about 111 km.
        let a = GeoCoord::new(0.0, 0.0);
        let b = GeoCoord::new(1.0, 0.0);
        let d = a.distance_m(&b);
        assert!((d - 111_000.0).abs() < 1_000.0, "distance was {d}");
    }
}
