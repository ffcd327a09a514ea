//! One octree node's in-memory container: a span² grid of tubes plus the
//! overflow buffer that feeds child creation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::key::{ChunkKey, Key, MAX_DEPTH};
use crate::metadata::Metadata;
use crate::schema::Layout;
use crate::voxel::{Tube, TubeInsert, Voxel};

/// Outcome of a chunk insertion.
pub enum ChunkInsert {
    /// Stored here, either in the grid or the overflow.
    Done,
    /// The chunk just saturated: children now exist and the drained
    /// overflow (including this insertion's loser) must be re-inserted one
    /// depth deeper.
    Spill(Vec<(Key, Voxel)>),
    /// Children already exist; the loser descends without touching the
    /// overflow.
    Descend(Voxel),
}

struct Overflow {
    has_children: bool,
    entries: Vec<(Key, Voxel)>,
}

pub struct Chunk {
    key: ChunkKey,
    span: u64,
    start_depth: u32,
    min_node_size: u64,
    max_node_size: u64,
    grid: Vec<Mutex<Tube>>,
    grid_count: AtomicU64,
    overflow: Mutex<Overflow>,
}

impl Chunk {
    pub fn new(key: ChunkKey, metadata: &Metadata) -> Chunk {
        let span = metadata.span;
        Chunk {
            key,
            span,
            start_depth: metadata.start_depth(),
            min_node_size: metadata.min_node_size,
            max_node_size: metadata.max_node_size,
            grid: (0..span * span).map(|_| Mutex::new(Tube::default())).collect(),
            grid_count: AtomicU64::new(0),
            overflow: Mutex::new(Overflow {
                has_children: false,
                entries: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    /// The Key depth at which points address this chunk's voxel grid.
    pub fn aligned_depth(&self) -> u32 {
        self.key.depth() + self.start_depth
    }

    pub fn has_children(&self) -> bool {
        self.overflow.lock().has_children
    }

    /// Restore the children latch on reanimation, from the hierarchy.
    pub fn set_has_children(&self) {
        self.overflow.lock().has_children = true;
    }

    pub fn population(&self) -> u64 {
        self.grid_count.load(Ordering::Relaxed) + self.overflow.lock().entries.len() as u64
    }

    fn can_subdivide(&self) -> bool {
        self.aligned_depth() < MAX_DEPTH
    }

    /// Insert a voxel whose `key` has been stepped to this chunk's aligned
    /// depth.
    pub fn insert(&self, key: &Key, voxel: Voxel) -> ChunkInsert {
        debug_assert_eq!(key.depth(), self.aligned_depth());

        let pos = key.position();
        let tx = pos.x % self.span;
        let ty = pos.y % self.span;
        let tick = pos.z % self.span;
        let center = key.bounds().mid();

        let loser = {
            let mut tube = self.grid[(ty * self.span + tx) as usize].lock();
            match tube.insert(tick, voxel, &center) {
                TubeInsert::Placed => {
                    self.grid_count.fetch_add(1, Ordering::Relaxed);
                    return ChunkInsert::Done;
                }
                TubeInsert::Evicted(loser) => loser,
            }
        };

        // Both fighters shared one voxel, so the loser's key is the
        // inserting key regardless of which point it was.
        let mut overflow = self.overflow.lock();
        if overflow.has_children {
            return ChunkInsert::Descend(loser);
        }

        overflow.entries.push((key.clone(), loser));

        let saturated = overflow.entries.len() as u64 >= self.min_node_size
            && self.grid_count.load(Ordering::Relaxed) + overflow.entries.len() as u64
                >= self.max_node_size
            && self.can_subdivide();

        if saturated {
            overflow.has_children = true;
            ChunkInsert::Spill(std::mem::take(&mut overflow.entries))
        } else {
            ChunkInsert::Done
        }
    }

    /// Re-place a decoded point without any possibility of spilling, used
    /// when faulting a serialized chunk back in.
    fn load_insert(&self, key: &Key, voxel: Voxel) {
        let pos = key.position();
        let tx = pos.x % self.span;
        let ty = pos.y % self.span;
        let tick = pos.z % self.span;
        let center = key.bounds().mid();

        let mut tube = self.grid[(ty * self.span + tx) as usize].lock();
        match tube.insert(tick, voxel, &center) {
            TubeInsert::Placed => {
                self.grid_count.fetch_add(1, Ordering::Relaxed);
            }
            TubeInsert::Evicted(loser) => {
                drop(tube);
                self.overflow.lock().entries.push((key.clone(), loser));
            }
        }
    }

    /// Flatten every cell and the overflow into one row buffer. Returns
    /// the buffer and its point count.
    pub fn to_rows(&self, layout: &Layout) -> (Vec<u8>, u64) {
        let size = layout.point_size();
        let mut count = 0u64;
        let mut rows = Vec::with_capacity(self.population() as usize * size);

        for tube in &self.grid {
            for cell in tube.lock().cells() {
                rows.extend_from_slice(cell.data());
                count += 1;
            }
        }
        for (_, voxel) in self.overflow.lock().entries.iter() {
            rows.extend_from_slice(voxel.data());
            count += 1;
        }
        (rows, count)
    }

    /// Rebuild the grid/overflow split from a serialized row buffer: each
    /// point's coordinates determine its voxel, and collision losers fall
    /// back into the overflow exactly as they originally did.
    pub fn from_rows(key: ChunkKey, metadata: &Metadata, layout: &Layout, rows: &[u8]) -> Chunk {
        let chunk = Chunk::new(key, metadata);
        let aligned = chunk.aligned_depth();
        let mut point_key = Key::new(metadata.bounds);

        for row in rows.chunks_exact(layout.point_size()) {
            let point = layout.position(row);
            point_key.init(&point, aligned);
            chunk.load_insert(&point_key, Voxel::new(point, row.to_vec()));
        }
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Bounds, Point};
    use crate::metadata::tests::test_metadata;
    use crate::metadata::Metadata;
    use crate::schema::{Dimension, DimKind, Layout};

    fn small_metadata() -> Metadata {
        let mut m = test_metadata();
        m.bounds = Bounds::new(0.0, 0.0, 0.0, 8.0, 8.0, 8.0);
        m.bounds_conforming = m.bounds;
        m.span = 4;
        m.min_node_size = 2;
        m.max_node_size = 8;
        m
    }

    fn layout() -> Layout {
        Layout::new(&vec![
            Dimension::new("X", DimKind::Float, 8),
            Dimension::new("Y", DimKind::Float, 8),
            Dimension::new("Z", DimKind::Float, 8),
        ])
        .unwrap()
    }

    fn voxel(layout: &Layout, x: f64, y: f64, z: f64) -> Voxel {
        let p = las::Point {
            x,
            y,
            z,
            ..Default::default()
        };
        let mut row = vec![0u8; layout.point_size()];
        layout.pack(&p, 0, 0, &mut row);
        Voxel::new(Point::new(x, y, z), row)
    }

    fn insert_at(chunk: &Chunk, m: &Metadata, l: &Layout, x: f64, y: f64, z: f64) -> ChunkInsert {
        let mut key = Key::new(m.bounds);
        key.init(&Point::new(x, y, z), chunk.aligned_depth());
        chunk.insert(&key, voxel(l, x, y, z))
    }

    #[test]
    fn distinct_voxels_fill_the_grid() {
        let m = small_metadata();
        let l = layout();
        let chunk = Chunk::new(ChunkKey::new(m.bounds), &m);

        // span=4 over [0,8): voxels are 2 units wide.
        for i in 0..4 {
            let c = i as f64 * 2.0 + 1.0;
            assert!(matches!(insert_at(&chunk, &m, &l, c, 1.0, 1.0), ChunkInsert::Done));
        }
        assert_eq!(chunk.population(), 4);
        assert!(!chunk.has_children());
    }

    #[test]
    fn collision_goes_to_overflow() {
        let m = small_metadata();
        let l = layout();
        let chunk = Chunk::new(ChunkKey::new(m.bounds), &m);

        assert!(matches!(insert_at(&chunk, &m, &l, 0.5, 0.5, 0.5), ChunkInsert::Done));
        assert!(matches!(insert_at(&chunk, &m, &l, 0.6, 0.6, 0.6), ChunkInsert::Done));
        assert_eq!(chunk.population(), 2);
    }

    #[test]
    fn saturation_spills_the_overflow() {
        let m = small_metadata();
        let l = layout();
        let chunk = Chunk::new(ChunkKey::new(m.bounds), &m);

        // One grid point plus seven overflow entries reach max_node_size=8
        // with overflow >= min_node_size=2.
        let mut spilled = None;
        for i in 0..8 {
            let jitter = 0.01 * i as f64;
            match insert_at(&chunk, &m, &l, 0.5 + jitter, 0.5, 0.5) {
                ChunkInsert::Done => {}
                ChunkInsert::Spill(entries) => spilled = Some(entries),
                ChunkInsert::Descend(_) => panic!("unexpected descend"),
            }
        }

        let spilled = spilled.expect("chunk should have saturated");
        assert_eq!(spilled.len(), 7);
        assert!(chunk.has_children());
        assert_eq!(chunk.population(), 1);

        // Further collisions descend instead of overflowing.
        assert!(matches!(
            insert_at(&chunk, &m, &l, 0.55, 0.5, 0.5),
            ChunkInsert::Descend(_)
        ));
    }

    #[test]
    fn rows_round_trip_preserves_split() {
        let m = small_metadata();
        let l = layout();
        let chunk = Chunk::new(ChunkKey::new(m.bounds), &m);

        insert_at(&chunk, &m, &l, 0.5, 0.5, 0.5);
        insert_at(&chunk, &m, &l, 0.6, 0.6, 0.6);
        insert_at(&chunk, &m, &l, 3.0, 3.0, 3.0);

        let (rows, count) = chunk.to_rows(&l);
        assert_eq!(count, 3);

        let back = Chunk::from_rows(ChunkKey::new(m.bounds), &m, &l, &rows);
        assert_eq!(back.population(), 3);
        let (rows2, count2) = back.to_rows(&l);
        assert_eq!(count2, 3);

        // Same multiset of rows.
        let size = l.point_size();
        let mut a: Vec<&[u8]> = rows.chunks_exact(size).collect();
        let mut b: Vec<&[u8]> = rows2.chunks_exact(size).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}
