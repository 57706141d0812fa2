//! # Tiled addressing
//!
//! The spatial indices address cells by integer tile coordinates at a
//! magnification level. Cell width and height halve per level, so level `l`
//! divides the world into `2^l x 2^l` cells.

use crate::geom::{GeoBox, GeoCoord};
use std::fmt::{Display, Formatter};

/// Zoom; higher level means finer cells and larger scale.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Magnification {
    level: u32,
}

impl Magnification {
    pub const fn new(level: u32) -> Self {
        Self { level }
    }

    #[inline]
    pub const fn level(&self) -> u32 {
        self.level
    }

    pub fn magnification(&self) -> f64 {
        f64::from(u32::pow(2, self.level.min(31)))
    }
}

pub fn cell_width(level: u32) -> f64 {
    360.0 / f64::from(1u32 << level.min(31))
}

pub fn cell_height(level: u32) -> f64 {
    180.0 / f64::from(1u32 << level.min(31))
}

const fn cell_count(level: u32) -> u32 {
    1u32 << if level > 31 { 31 } else { level }
}

/// Integer tile address at some magnification level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// The tile containing `coord` at the given level. Coordinates on the
    /// outer edge of the world map to the last cell.
    pub fn from_coord(level: u32, coord: &GeoCoord) -> Self {
        let max = cell_count(level) - 1;
        let x = ((coord.lon() + 180.0) / cell_width(level)).floor();
        let y = ((coord.lat() + 90.0) / cell_height(level)).floor();

        Self {
            x: (x.max(0.0) as u32).min(max),
            y: (y.max(0.0) as u32).min(max),
        }
    }

    /// The geographic extent of this tile at the given level.
    pub fn geo_box(&self, level: u32) -> GeoBox {
        let w = cell_width(level);
        let h = cell_height(level);
        let min_lon = f64::from(self.x) * w - 180.0;
        let min_lat = f64::from(self.y) * h - 90.0;

        GeoBox::new(
            GeoCoord::new(min_lat, min_lon),
            GeoCoord::new((min_lat + h).min(90.0), (min_lon + w).min(180.0)),
        )
    }
}

impl Display for TileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// An inclusive rectangle of tile addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TileIdBox {
    pub min: TileId,
    pub max: TileId,
}

impl TileIdBox {
    pub fn new(a: TileId, b: TileId) -> Self {
        Self {
            min: TileId::new(a.x.min(b.x), a.y.min(b.y)),
            max: TileId::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn from_geo_box(level: u32, geo_box: &GeoBox) -> Self {
        Self::new(
            TileId::from_coord(level, &geo_box.min()),
            TileId::from_coord(level, &geo_box.max()),
        )
    }

    pub const fn width(&self) -> u32 {
        self.max.x - self.min.x + 1
    }

    pub const fn height(&self) -> u32 {
        self.max.y - self.min.y + 1
    }

    pub fn contains(&self, tile: &TileId) -> bool {
        tile.x >= self.min.x && tile.x <= self.max.x && tile.y >= self.min.y && tile.y <= self.max.y
    }

    /// Iterates row-major over all contained tile addresses.
    pub fn iter(&self) -> impl Iterator<Item = TileId> + use<> {
        let (min, max) = (self.min, self.max);
        (min.y..=max.y).flat_map(move |y| (min.x..=max.x).map(move |x| TileId::new(x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_from_coord_and_back() {
        let coord = GeoCoord::new(51.5, 7.4);
        let tile = TileId::from_coord(10, &coord);
        assert!(tile.geo_box(10).contains(&coord));
    }

    #[test]
    fn world_edges_clamp_to_last_cell() {
        let level = 4;
        let max = (1u32 << level) - 1;

        assert_eq!(
            TileId::from_coord(level, &GeoCoord::new(90.0, 180.0)),
            TileId::new(max, max)
        );
        assert_eq!(
            TileId::from_coord(level, &GeoCoord::new(-90.0, -180.0)),
            TileId::new(0, 0)
        );
    }

    #[test]
    fn box_iteration_is_row_major_and_complete() {
        let b = TileIdBox::new(TileId::new(2, 1), TileId::new(3, 2));
        let tiles: Vec<_> = b.iter().collect();

        assert_eq!(
            tiles,
            vec![
                TileId::new(2, 1),
                TileId::new(3, 1),
                TileId::new(2, 2),
                TileId::new(3, 2),
            ]
        );
        assert_eq!(b.width(), 2);
        assert_eq!(b.height(), 2);
    }

    #[test]
    fn cells_halve_per_level() {
        assert_eq!(cell_width(0), 360.0);
        assert_eq!(cell_width(1), 180.0);
        assert_eq!(cell_height(1), 90.0);
        assert_eq!(cell_width(10), cell_width(9) / 2.0);
    }
}
