//! Axis-aligned bounds and the cube math used by the octree.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::key::Dir;

/// A point position in native (unscaled) coordinates.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Point {
        Point { x, y, z }
    }

    /// Squared euclidean distance to `other`.
    #[inline]
    pub fn sq_dist(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// 3D bounding box
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub min_z: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub max_z: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            min_z: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
            max_z: f64::NEG_INFINITY,
        }
    }
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, min_z: f64, max_x: f64, max_y: f64, max_z: f64) -> Bounds {
        Bounds {
            min_x,
            min_y,
            min_z,
            max_x,
            max_y,
            max_z,
        }
    }

    /// True once at least one point has been folded in.
    pub fn exists(&self) -> bool {
        self.min_x <= self.max_x
    }

    pub fn min(&self) -> Point {
        Point::new(self.min_x, self.min_y, self.min_z)
    }

    pub fn max(&self) -> Point {
        Point::new(self.max_x, self.max_y, self.max_z)
    }

    pub fn mid(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
            (self.min_z + self.max_z) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[inline]
    pub fn expand(&mut self, r: &Bounds) {
        if r.min_x < self.min_x {
            self.min_x = r.min_x;
        }
        if r.min_y < self.min_y {
            self.min_y = r.min_y;
        }
        if r.min_z < self.min_z {
            self.min_z = r.min_z;
        }
        if r.max_x > self.max_x {
            self.max_x = r.max_x;
        }
        if r.max_y > self.max_y {
            self.max_y = r.max_y;
        }
        if r.max_z > self.max_z {
            self.max_z = r.max_z;
        }
    }

    #[inline]
    pub fn expand_xyz(&mut self, x: f64, y: f64, z: f64) {
        if x < self.min_x {
            self.min_x = x;
        }
        if y < self.min_y {
            self.min_y = y;
        }
        if z < self.min_z {
            self.min_z = z;
        }
        if x > self.max_x {
            self.max_x = x;
        }
        if y > self.max_y {
            self.max_y = y;
        }
        if z > self.max_z {
            self.max_z = z;
        }
    }

    pub fn intersects(&self, r: &Bounds) -> bool {
        if self.max_x < r.min_x {
            return false;
        }
        if self.max_y < r.min_y {
            return false;
        }
        if self.max_z < r.min_z {
            return false;
        }
        if self.min_x > r.max_x {
            return false;
        }
        if self.min_y > r.max_y {
            return false;
        }
        if self.min_z > r.max_z {
            return false;
        }
        true
    }

    pub fn intersection(&self, r: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.max(r.min_x),
            min_y: self.min_y.max(r.min_y),
            min_z: self.min_z.max(r.min_z),
            max_x: self.max_x.min(r.max_x),
            max_y: self.max_y.min(r.max_y),
            max_z: self.max_z.min(r.max_z),
        }
    }

    /// Half-open containment, matching the voxel tie-break: a coordinate on
    /// a max face belongs to the neighbor above. Used for slab and voxel
    /// membership, where every point must land on exactly one side.
    #[inline]
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.min_x
            && p.x < self.max_x
            && p.y >= self.min_y
            && p.y < self.max_y
            && p.z >= self.min_z
            && p.z < self.max_z
    }

    /// Closed containment. The conforming bounds are a tight fit, so the
    /// dataset's extreme points sit exactly on the max faces and must
    /// still qualify.
    #[inline]
    pub fn contains_inclusive(&self, p: &Point) -> bool {
        p.x >= self.min_x
            && p.x <= self.max_x
            && p.y >= self.min_y
            && p.y <= self.max_y
            && p.z >= self.min_z
            && p.z <= self.max_z
    }

    /// The octant direction of `p` relative to the midpoint. A coordinate
    /// equal to the midpoint goes to the upper half.
    #[inline]
    pub fn dir(&self, p: &Point) -> Dir {
        let mid = self.mid();
        Dir::from_bits(
            (p.x >= mid.x) as u8 | (((p.y >= mid.y) as u8) << 1) | (((p.z >= mid.z) as u8) << 2),
        )
    }

    /// Shrink to the octant `dir`.
    pub fn go(&mut self, dir: Dir) {
        let mid = self.mid();
        if dir.up_x() {
            self.min_x = mid.x;
        } else {
            self.max_x = mid.x;
        }
        if dir.up_y() {
            self.min_y = mid.y;
        } else {
            self.max_y = mid.y;
        }
        if dir.up_z() {
            self.min_z = mid.z;
        } else {
            self.max_z = mid.z;
        }
    }

    pub fn get(&self, dir: Dir) -> Bounds {
        let mut b = *self;
        b.go(dir);
        b
    }

    /// Expand the shorter axes around the centroid so every side has the
    /// length of the longest one, then pad the maximal faces slightly so no
    /// conforming point sits exactly on them.
    pub fn cubeify(&self) -> Bounds {
        let mid = self.mid();
        let mut half = ((self.max_x - self.min_x)
            .max(self.max_y - self.min_y)
            .max(self.max_z - self.min_z))
            / 2.0;
        if half == 0.0 {
            half = 0.5;
        }
        // Nudge outward so max-face points stay strictly inside.
        half *= 1.0 + 1e-9;
        Bounds {
            min_x: mid.x - half,
            min_y: mid.y - half,
            min_z: mid.z - half,
            max_x: mid.x + half,
            max_y: mid.y + half,
            max_z: mid.z + half,
        }
    }
}

impl Serialize for Bounds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(6))?;
        for v in [
            self.min_x, self.min_y, self.min_z, self.max_x, self.max_y, self.max_z,
        ] {
            seq.serialize_element(&v)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Bounds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundsVisitor;

        impl<'de> Visitor<'de> for BoundsVisitor {
            type Value = Bounds;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array [xmin, ymin, zmin, xmax, ymax, zmax]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bounds, A::Error> {
                let mut v = [0f64; 6];
                for (i, slot) in v.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Bounds::new(v[0], v[1], v[2], v[3], v[4], v[5]))
            }
        }

        deserializer.deserialize_seq(BoundsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_tie_goes_up() {
        let b = Bounds::new(0.0, 0.0, 0.0, 2.0, 2.0, 2.0);
        let d = b.dir(&Point::new(1.0, 0.5, 1.5));
        assert!(d.up_x());
        assert!(!d.up_y());
        assert!(d.up_z());
    }

    #[test]
    fn cubeify_expands_short_axes() {
        let b = Bounds::new(0.0, 0.0, 0.0, 100.0, 50.0, 10.0).cubeify();
        let w = b.max_x - b.min_x;
        assert!((b.max_y - b.min_y - w).abs() < 1e-9);
        assert!((b.max_z - b.min_z - w).abs() < 1e-9);
        assert!(w >= 100.0);
        // centered on the original centroid
        assert!((b.mid().y - 25.0).abs() < 1e-9);
    }

    #[test]
    fn serde_round_trip() {
        let b = Bounds::new(-1.0, -2.0, -3.0, 1.0, 2.0, 3.0);
        let s = serde_json::to_string(&b).unwrap();
        assert_eq!(s, "[-1.0,-2.0,-3.0,1.0,2.0,3.0]");
        let back: Bounds = serde_json::from_str(&s).unwrap();
        assert_eq!(b, back);
    }

    #[test]
    fn go_shrinks_to_octant() {
        let mut b = Bounds::new(0.0, 0.0, 0.0, 8.0, 8.0, 8.0);
        b.go(Dir::from_bits(0b101));
        assert_eq!(b, Bounds::new(4.0, 0.0, 4.0, 8.0, 4.0, 8.0));
    }
}
