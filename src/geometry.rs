//! Pure coordinate math: lat/lng <-> XYZ tile coordinates, bounding-box
//! coverage enumeration, and antimeridian splitting.
//!
//! Everything in this module is pure and synchronous; nothing here touches
//! I/O, so it is safe to call from any context, including inside async
//! executors.

use std::collections::HashSet;
use std::f64::consts::PI;

/// Web Mercator clamps latitude to this range; coordinates outside it have
/// no finite tile projection.
pub const MAX_LATITUDE: f64 = 85.051_128_78;
const MIN_LATITUDE: f64 = -MAX_LATITUDE;

/// An XYZ tile coordinate. `x` and `y` are always `< 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        TileCoord { z, x, y }
    }

    /// Whether this coordinate is in-range for its own zoom level.
    pub fn is_valid(&self) -> bool {
        let n = 1u64 << self.z;
        (self.x as u64) < n && (self.y as u64) < n && self.z <= 22
    }
}

/// A geographic bounding box in degrees: `[min_lng, min_lat, max_lng, max_lat]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        BBox {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        let lng = (self.min_lng + self.max_lng) / 2.0;
        ((lng + 180.0).rem_euclid(360.0) - 180.0, (self.min_lat + self.max_lat) / 2.0)
    }

    /// True when this bbox wraps around the antimeridian (`min_lng > max_lng`).
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_lng > self.max_lng
    }

    /// Splits an antimeridian-crossing bbox into two non-crossing halves.
    /// Returns a single-element vec if the bbox doesn't cross.
    pub fn split_at_antimeridian(&self) -> Vec<BBox> {
        if !self.crosses_antimeridian() {
            return vec![*self];
        }
        vec![
            BBox::new(self.min_lng, self.min_lat, 180.0, self.max_lat),
            BBox::new(-180.0, self.min_lat, self.max_lng, self.max_lat),
        ]
    }
}

fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(MIN_LATITUDE, MAX_LATITUDE)
}

/// Projects `(lng, lat)` in degrees to the tile containing it at zoom `z`.
pub fn lat_lng_to_tile(lat: f64, lng: f64, z: u8) -> (u32, u32) {
    let lat = clamp_lat(lat);
    let n = 2f64.powi(z as i32);

    let x = ((lng + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat.to_radians().tan().asinh()) / PI) / 2.0 * n).floor();

    let max_index = (n as i64 - 1).max(0) as u32;
    (
        (x.max(0.0) as u32).min(max_index),
        (y.max(0.0) as u32).min(max_index),
    )
}

/// Returns the lat/lng bounds of the tile square `(x, y, z)`: `(min_lng,
/// min_lat, max_lng, max_lat)`.
pub fn tile_bounds(x: u32, y: u32, z: u8) -> BBox {
    let n = 2f64.powi(z as i32);

    let lng = |x: f64| x / n * 360.0 - 180.0;
    let lat = |y: f64| {
        let angle = PI * (1.0 - 2.0 * y / n);
        angle.sinh().atan().to_degrees()
    };

    BBox::new(lng(x as f64), lat((y + 1) as f64), lng((x + 1) as f64), lat(y as f64))
}

/// A rectangle of tile indices `[x0..=x1] x [y0..=y1]` at a single zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub z: u8,
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl TileRect {
    pub fn tile_count(&self) -> u64 {
        (self.x1 - self.x0 + 1) as u64 * (self.y1 - self.y0 + 1) as u64
    }

    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let z = self.z;
        (self.x0..=self.x1).flat_map(move |x| (self.y0..=self.y1).map(move |y| TileCoord::new(z, x, y)))
    }
}

/// Computes the tile rectangle(s) covering `bbox` at zoom `z`. Returns more
/// than one rectangle when `bbox` crosses the antimeridian.
pub fn tiles_for_bbox(bbox: &BBox, z: u8) -> Vec<TileRect> {
    bbox.split_at_antimeridian()
        .into_iter()
        .map(|b| {
            let (mut x0, top_y) = lat_lng_to_tile(b.max_lat, b.min_lng, z);
            let (mut x1, bot_y) = lat_lng_to_tile(b.min_lat, b.max_lng, z);
            let (mut y0, mut y1) = (top_y, bot_y);

            if x0 > x1 {
                std::mem::swap(&mut x0, &mut x1);
            }
            if y0 > y1 {
                std::mem::swap(&mut y0, &mut y1);
            }

            TileRect { z, x0, x1, y0, y1 }
        })
        .collect()
}

/// The full set of tiles covering `bbox` across `[min_zoom, max_zoom]`.
pub fn coverage_set(bbox: &BBox, min_zoom: u8, max_zoom: u8) -> HashSet<TileCoord> {
    let mut set = HashSet::new();
    for z in min_zoom..=max_zoom {
        for rect in tiles_for_bbox(bbox, z) {
            set.extend(rect.iter());
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_count_matches_rect_dimensions() {
        let bbox = BBox::new(28.5, 40.8, 29.5, 41.2);
        for z in 8..=12 {
            for rect in tiles_for_bbox(&bbox, z) {
                let expected = (rect.x1 - rect.x0 + 1) as u64 * (rect.y1 - rect.y0 + 1) as u64;
                assert_eq!(rect.tile_count(), expected);
                assert_eq!(rect.iter().count() as u64, expected);
            }
        }
    }

    #[test]
    fn scenario_istanbul_z10_z11() {
        let bbox = BBox::new(28.5, 40.8, 29.5, 41.2);

        let r10 = &tiles_for_bbox(&bbox, 10)[0];
        assert_eq!((r10.x0, r10.x1), (593, 595));
        assert_eq!((r10.y0, r10.y1), (383, 384));
        assert_eq!(r10.tile_count(), 6);

        let r11 = &tiles_for_bbox(&bbox, 11)[0];
        assert_eq!((r11.x0, r11.x1), (1186, 1191));
        assert_eq!((r11.y0, r11.y1), (766, 769));
        assert_eq!(r11.tile_count(), 24);

        let coverage = coverage_set(&bbox, 10, 11);
        assert_eq!(coverage.len(), 30);
    }

    #[test]
    fn round_trip_within_tile_square() {
        let points = [
            (0.0, 0.0),
            (51.5074, -0.1278),
            (-33.8688, 151.2093),
            (84.9, 179.9),
            (-84.9, -179.9),
        ];

        for z in 0..=16u8 {
            for &(lat, lng) in &points {
                let (x, y) = lat_lng_to_tile(lat, lng, z);
                let bounds = tile_bounds(x, y, z);
                let clamped_lat = clamp_lat(lat);
                assert!(
                    clamped_lat >= bounds.min_lat - 1e-6 && clamped_lat <= bounds.max_lat + 1e-6,
                    "lat {clamped_lat} outside {bounds:?} at z={z}"
                );
                assert!(
                    lng >= bounds.min_lng - 1e-6 && lng <= bounds.max_lng + 1e-6,
                    "lng {lng} outside {bounds:?} at z={z}"
                );
            }
        }
    }

    #[test]
    fn antimeridian_crossing_bbox_splits_in_two() {
        let bbox = BBox::new(170.0, -10.0, -170.0, 10.0);
        assert!(bbox.crosses_antimeridian());

        let halves = bbox.split_at_antimeridian();
        assert_eq!(halves.len(), 2);

        let rects = tiles_for_bbox(&bbox, 5);
        assert_eq!(rects.len(), 2);
        // the eastern half touches the max tile index, the western half touches 0
        let n = 1u32 << 5;
        assert_eq!(rects[0].x1, n - 1);
        assert_eq!(rects[1].x0, 0);
    }

    #[test]
    fn zero_width_bbox_still_yields_one_tile_per_zoom() {
        let bbox = BBox::new(10.0, 50.0, 10.0, 50.0);
        for z in 1..=10 {
            let rects = tiles_for_bbox(&bbox, z);
            assert_eq!(rects.len(), 1);
            assert_eq!(rects[0].tile_count(), 1);
        }
    }

    #[test]
    fn tile_coord_validity() {
        assert!(TileCoord::new(5, 10, 10).is_valid());
        assert!(!TileCoord::new(5, 32, 0).is_valid());
        assert!(!TileCoord::new(23, 0, 0).is_valid());
    }
}
