//! Octree keys: integer voxel coordinates at a depth, and the climbing
//! state used to descend a point through the tree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bounds::{Bounds, Point};
use crate::error::Error;

/// Deepest representable level: coordinates are stored in 64 bits.
pub const MAX_DEPTH: u32 = 64;

/// One of the eight child octants.
///
/// Bit 0 selects the upper x half, bit 1 the upper y half, bit 2 the upper
/// z half.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Dir(u8);

impl Dir {
    #[inline]
    pub fn from_bits(bits: u8) -> Dir {
        debug_assert!(bits < 8);
        Dir(bits & 0x7)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn up_x(self) -> bool {
        self.0 & 0x1 != 0
    }

    #[inline]
    pub fn up_y(self) -> bool {
        self.0 & 0x2 != 0
    }

    #[inline]
    pub fn up_z(self) -> bool {
        self.0 & 0x4 != 0
    }

    /// All eight directions in canonical order.
    pub fn all() -> impl Iterator<Item = Dir> {
        (0..8u8).map(Dir)
    }
}

/// Integer voxel coordinates within one depth level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Xyz {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Xyz {
    #[inline]
    pub fn step(&mut self, dir: Dir) {
        self.x = (self.x << 1) | dir.up_x() as u64;
        self.y = (self.y << 1) | dir.up_y() as u64;
        self.z = (self.z << 1) | dir.up_z() as u64;
    }
}

/// A fully qualified node address: depth plus coordinates.
///
/// The serialized form is the `"d-x-y-z"` string used for hierarchy keys
/// and chunk filenames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Dxyz {
    pub d: u32,
    pub p: Xyz,
}

impl Dxyz {
    pub fn new(d: u32, x: u64, y: u64, z: u64) -> Dxyz {
        Dxyz {
            d,
            p: Xyz { x, y, z },
        }
    }

    pub fn root() -> Dxyz {
        Dxyz::default()
    }

    pub fn child(&self, dir: Dir) -> Dxyz {
        let mut p = self.p;
        p.step(dir);
        Dxyz { d: self.d + 1, p }
    }

    pub fn parent(&self) -> Dxyz {
        debug_assert!(self.d > 0);
        Dxyz {
            d: self.d - 1,
            p: Xyz {
                x: self.p.x >> 1,
                y: self.p.y >> 1,
                z: self.p.z >> 1,
            },
        }
    }

    /// True if `self` lies in the subtree rooted at `root`.
    pub fn is_descendant_of(&self, root: &Dxyz) -> bool {
        if self.d < root.d {
            return false;
        }
        let shift = self.d - root.d;
        self.p.x >> shift == root.p.x
            && self.p.y >> shift == root.p.y
            && self.p.z >> shift == root.p.z
    }

    /// The spatial extent of this node within `root_bounds`.
    pub fn bounds(&self, root_bounds: &Bounds) -> Bounds {
        // In an octree every cell is a cube.
        let side = root_bounds.width() / (1u64 << self.d) as f64;
        Bounds::new(
            root_bounds.min_x + self.p.x as f64 * side,
            root_bounds.min_y + self.p.y as f64 * side,
            root_bounds.min_z + self.p.z as f64 * side,
            root_bounds.min_x + (self.p.x + 1) as f64 * side,
            root_bounds.min_y + (self.p.y + 1) as f64 * side,
            root_bounds.min_z + (self.p.z + 1) as f64 * side,
        )
    }
}

impl Ord for Dxyz {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.d, self.p.x, self.p.y, self.p.z).cmp(&(other.d, other.p.x, other.p.y, other.p.z))
    }
}

impl PartialOrd for Dxyz {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Dxyz {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.d, self.p.x, self.p.y, self.p.z)
    }
}

impl FromStr for Dxyz {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut it = s.split('-');
        let mut next = || {
            it.next()
                .ok_or_else(|| Error::Decode(format!("bad node key: {s}")))
        };
        let d = next()?
            .parse::<u32>()
            .map_err(|_| Error::Decode(format!("bad node key: {s}")))?;
        let mut coord = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::Decode(format!("bad node key: {s}")))
        };
        let x = coord(next()?)?;
        let y = coord(next()?)?;
        let z = coord(next()?)?;
        if it.next().is_some() {
            return Err(Error::Decode(format!("bad node key: {s}")));
        }
        Ok(Dxyz::new(d, x, y, z))
    }
}

impl Serialize for Dxyz {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dxyz {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Climbing state for a point's voxel: bounds narrow and coordinates gain
/// one bit per `step`.
///
/// The direction taken at each level is a pure function of the point and
/// the current midpoint, with point-equals-midpoint sent to the upper half,
/// so a point's key at any depth is independent of its insertion path.
#[derive(Clone, Debug)]
pub struct Key {
    root: Bounds,
    bounds: Bounds,
    pos: Dxyz,
}

impl Key {
    pub fn new(root: Bounds) -> Key {
        Key {
            root,
            bounds: root,
            pos: Dxyz::root(),
        }
    }

    pub fn reset(&mut self) {
        self.bounds = self.root;
        self.pos = Dxyz::root();
    }

    /// Reset to the root and descend toward `p` until `depth`.
    pub fn init(&mut self, p: &Point, depth: u32) {
        self.reset();
        while self.pos.d < depth {
            self.step(p);
        }
    }

    /// Descend one level toward `p`.
    #[inline]
    pub fn step(&mut self, p: &Point) -> Dir {
        let dir = self.bounds.dir(p);
        self.bounds.go(dir);
        self.pos.p.step(dir);
        self.pos.d += 1;
        dir
    }

    pub fn depth(&self) -> u32 {
        self.pos.d
    }

    pub fn position(&self) -> &Xyz {
        &self.pos.p
    }

    pub fn dxyz(&self) -> Dxyz {
        self.pos
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }
}

/// A [Key] restricted to chunked nodes: one per octree node holding a data
/// file, starting at the root chunk `0-0-0-0`.
#[derive(Clone, Debug)]
pub struct ChunkKey {
    key: Key,
}

impl ChunkKey {
    pub fn new(root: Bounds) -> ChunkKey {
        ChunkKey {
            key: Key::new(root),
        }
    }

    pub fn reset(&mut self) {
        self.key.reset();
    }

    /// Reset to the root chunk and descend toward `p` until `depth`.
    pub fn init(&mut self, p: &Point, depth: u32) {
        self.key.init(p, depth);
    }

    /// Descend one level toward `p`.
    pub fn step(&mut self, p: &Point) -> Dir {
        self.key.step(p)
    }

    /// The child chunk key in direction `dir`.
    pub fn get_step(&self, dir: Dir) -> ChunkKey {
        let mut child = self.clone();
        child.key.bounds.go(dir);
        child.key.pos.p.step(dir);
        child.key.pos.d += 1;
        child
    }

    pub fn depth(&self) -> u32 {
        self.key.depth()
    }

    pub fn dxyz(&self) -> Dxyz {
        self.key.dxyz()
    }

    pub fn bounds(&self) -> &Bounds {
        self.key.bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Bounds {
        Bounds::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0)
    }

    #[test]
    fn dxyz_string_round_trip() {
        let k = Dxyz::new(3, 1, 5, 7);
        assert_eq!(k.to_string(), "3-1-5-7");
        assert_eq!("3-1-5-7".parse::<Dxyz>().unwrap(), k);
        assert!("3-1-5".parse::<Dxyz>().is_err());
        assert!("a-b-c-d".parse::<Dxyz>().is_err());
    }

    #[test]
    fn child_parent_inverse() {
        let k = Dxyz::new(2, 1, 2, 3);
        for dir in Dir::all() {
            assert_eq!(k.child(dir).parent(), k);
        }
    }

    #[test]
    fn key_depth_is_path_independent() {
        let p = Point::new(0.3, 0.6, 0.9);

        let mut a = Key::new(unit());
        a.init(&p, 5);

        let mut b = Key::new(unit());
        b.init(&p, 2);
        while b.depth() < 5 {
            b.step(&p);
        }

        assert_eq!(a.dxyz(), b.dxyz());
    }

    #[test]
    fn key_coordinates_match_direct_computation() {
        let p = Point::new(0.3, 0.6, 0.9);
        let mut k = Key::new(unit());
        k.init(&p, 4);

        // At depth 4, 16 slabs per axis.
        assert_eq!(k.position().x, (0.3f64 * 16.0).floor() as u64);
        assert_eq!(k.position().y, (0.6f64 * 16.0).floor() as u64);
        assert_eq!(k.position().z, (0.9f64 * 16.0).floor() as u64);
    }

    #[test]
    fn chunk_key_get_step_matches_step() {
        let p = Point::new(0.8, 0.2, 0.4);
        let mut walked = ChunkKey::new(unit());
        let dir = walked.key.bounds().dir(&p);
        let stepped = walked.get_step(dir);
        walked.step(&p);
        assert_eq!(walked.dxyz(), stepped.dxyz());
        assert_eq!(walked.bounds(), stepped.bounds());
    }

    #[test]
    fn descendant_check() {
        let root = Dxyz::new(1, 1, 0, 0);
        assert!(Dxyz::new(3, 4, 1, 2).is_descendant_of(&root));
        assert!(!Dxyz::new(3, 3, 1, 2).is_descendant_of(&root));
        assert!(!Dxyz::new(0, 0, 0, 0).is_descendant_of(&root));
    }

    #[test]
    fn node_bounds_tile_the_root() {
        let root = Bounds::new(0.0, 0.0, 0.0, 8.0, 8.0, 8.0);
        let b = Dxyz::new(2, 3, 0, 1).bounds(&root);
        assert_eq!(b, Bounds::new(6.0, 0.0, 2.0, 8.0, 2.0, 4.0));
    }
}
