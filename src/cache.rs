//! The chunk working set: a sliced, reference-counted map of resident
//! chunks with on-demand fault-in and an asynchronous write-out pool.
//!
//! Workers hold per-worker [Clipper]s. A chunk stays resident exactly as
//! long as some clipper references it; when the last reference is clipped
//! the chunk is serialized, its hierarchy count finalized, and the entry
//! removed. A later touch faults it back in from the store.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::chunk::{Chunk, ChunkInsert};
use crate::codec;
use crate::endpoint::Endpoints;
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::key::{ChunkKey, Dir, Dxyz, Key};
use crate::metadata::Metadata;
use crate::schema::Layout;
use crate::voxel::Voxel;

const SLICES: usize = 64;

/// Monotonic write/read totals plus the current resident count, published
/// to the progress monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub written: u64,
    pub read: u64,
    pub alive: u64,
}

#[derive(Default)]
struct CacheMetrics {
    written: AtomicU64,
    read: AtomicU64,
    alive: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Loading,
    Resident,
    Evicting,
}

struct Entry {
    state: State,
    refs: u64,
    chunk: Option<Arc<Chunk>>,
}

#[derive(Default)]
struct Slice {
    map: Mutex<HashMap<Dxyz, Entry>>,
    cv: Condvar,
}

struct WriteJob {
    chunk: Arc<Chunk>,
}

pub struct ChunkCache {
    endpoints: Endpoints,
    metadata: Arc<Metadata>,
    layout: Arc<Layout>,
    hierarchy: Arc<Hierarchy>,
    slices: Vec<Slice>,
    metrics: CacheMetrics,
    pending: AtomicU64,
    join_m: Mutex<()>,
    join_cv: Condvar,
    fatal: AtomicBool,
    fatal_error: Mutex<Option<Error>>,
    tx: Mutex<Option<Sender<WriteJob>>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChunkCache {
    pub fn new(
        endpoints: Endpoints,
        metadata: Arc<Metadata>,
        hierarchy: Arc<Hierarchy>,
        clip_threads: u64,
    ) -> Result<Arc<ChunkCache>> {
        let layout = Arc::new(Layout::new(&metadata.schema)?);
        let (tx, rx) = unbounded::<WriteJob>();

        let cache = Arc::new(ChunkCache {
            endpoints,
            metadata,
            layout,
            hierarchy,
            slices: (0..SLICES).map(|_| Slice::default()).collect(),
            metrics: CacheMetrics::default(),
            pending: AtomicU64::new(0),
            join_m: Mutex::new(()),
            join_cv: Condvar::new(),
            fatal: AtomicBool::new(false),
            fatal_error: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            writers: Mutex::new(Vec::new()),
        });

        let mut writers = cache.writers.lock();
        for i in 0..clip_threads.max(1) {
            let cache = cache.clone();
            let rx: Receiver<WriteJob> = rx.clone();
            writers.push(
                std::thread::Builder::new()
                    .name(format!("ept-clip-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            cache.write_out(job.chunk);
                        }
                    })
                    .expect("failed to spawn clip thread"),
            );
        }
        drop(writers);

        Ok(cache)
    }

    pub fn latch_info(&self) -> CacheInfo {
        CacheInfo {
            written: self.metrics.written.load(Ordering::Relaxed),
            read: self.metrics.read.load(Ordering::Relaxed),
            alive: self.metrics.alive.load(Ordering::Relaxed),
        }
    }

    fn slice(&self, key: &Dxyz) -> &Slice {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.slices[hasher.finish() as usize % SLICES]
    }

    fn check_fatal(&self) -> Result<()> {
        if self.fatal.load(Ordering::Relaxed) {
            Err(Error::Fatal(
                "chunk write pool failed; aborting build".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn set_fatal(&self, e: Error) {
        log::error!("fatal cache failure: {e}");
        let mut slot = self.fatal_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
        self.fatal.store(true, Ordering::Relaxed);
    }

    /// Insert a voxel at the chunk for `ck`, descending to children when
    /// the voxel loses its cell fight in a subdivided chunk. `key` must be
    /// stepped to `ck`'s aligned depth; the clipper gains a reference to
    /// every chunk touched along the way.
    pub fn insert(
        &self,
        voxel: Voxel,
        key: &mut Key,
        ck: &ChunkKey,
        clipper: &mut Clipper,
    ) -> Result<bool> {
        self.check_fatal()?;
        let chunk = self.acquire(ck, clipper)?;

        match chunk.insert(key, voxel) {
            ChunkInsert::Done => Ok(true),
            ChunkInsert::Descend(loser) => {
                let point = *loser.point();
                let dir = ck.bounds().dir(&point);
                key.step(&point);
                self.insert(loser, key, &ck.get_step(dir), clipper)
            }
            ChunkInsert::Spill(entries) => {
                for (mut entry_key, entry_voxel) in entries {
                    let point = *entry_voxel.point();
                    let dir = ck.bounds().dir(&point);
                    entry_key.step(&point);
                    self.insert(entry_voxel, &mut entry_key, &ck.get_step(dir), clipper)?;
                }
                Ok(true)
            }
        }
    }

    /// Get the resident chunk for `ck`, faulting it in if needed. The
    /// clipper's reference keeps it resident.
    fn acquire(&self, ck: &ChunkKey, clipper: &mut Clipper) -> Result<Arc<Chunk>> {
        let add_ref = clipper.note(ck.dxyz());
        let key = ck.dxyz();
        let slice = self.slice(&key);

        let mut map = slice.map.lock();
        loop {
            let state = map.get(&key).map(|e| e.state);
            match state {
                None => {
                    map.insert(
                        key,
                        Entry {
                            state: State::Loading,
                            refs: 0,
                            chunk: None,
                        },
                    );
                    drop(map);

                    let loaded = self.fault_in(ck);

                    map = slice.map.lock();
                    match loaded {
                        Ok(chunk) => {
                            let e = map.get_mut(&key).expect("loading entry vanished");
                            e.chunk = Some(chunk.clone());
                            e.state = State::Resident;
                            if add_ref {
                                e.refs += 1;
                            }
                            slice.cv.notify_all();
                            return Ok(chunk);
                        }
                        Err(e) => {
                            map.remove(&key);
                            slice.cv.notify_all();
                            // The clipper never gained its reference.
                            clipper.forget(&key);
                            return Err(e);
                        }
                    }
                }
                Some(State::Resident) => {
                    let e = map.get_mut(&key).unwrap();
                    if add_ref {
                        e.refs += 1;
                    }
                    return Ok(e.chunk.clone().expect("resident entry without chunk"));
                }
                Some(State::Loading) | Some(State::Evicting) => {
                    slice.cv.wait(&mut map);
                }
            }
        }
    }

    /// Materialize a chunk: decode the stored payload when the hierarchy
    /// says one exists, otherwise start empty. The children latch is
    /// restored from the hierarchy either way.
    fn fault_in(&self, ck: &ChunkKey) -> Result<Arc<Chunk>> {
        let key = ck.dxyz();
        let count = self.hierarchy.get(&key);

        let chunk = if count > 0 {
            let stem = format!("{key}{}", self.metadata.postfix());
            let rows = codec::read(
                &self.metadata,
                &self.layout,
                &self.endpoints.data,
                &stem,
                count,
            )?;
            self.metrics.read.fetch_add(1, Ordering::Relaxed);
            Chunk::from_rows(ck.clone(), &self.metadata, &self.layout, &rows)
        } else {
            Chunk::new(ck.clone(), &self.metadata)
        };

        if Dir::all().any(|dir| self.hierarchy.get(&key.child(dir)) > 0) {
            chunk.set_has_children();
        }

        self.metrics.alive.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(chunk))
    }

    fn unref(&self, key: &Dxyz) {
        let slice = self.slice(key);
        let mut map = slice.map.lock();
        let e = map.get_mut(key).expect("unref of untracked chunk");
        debug_assert!(e.refs > 0);
        e.refs -= 1;
        if e.refs > 0 {
            return;
        }

        e.state = State::Evicting;
        let chunk = e.chunk.take().expect("evicting entry without chunk");
        drop(map);

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(WriteJob { chunk });
        }
    }

    fn write_out(&self, chunk: Arc<Chunk>) {
        let key = chunk.key().dxyz();
        let (rows, count) = chunk.to_rows(&self.layout);

        if count > 0 {
            let stem = format!("{key}{}", self.metadata.postfix());
            match codec::write(
                &self.metadata,
                &self.layout,
                &self.endpoints.data,
                &stem,
                &rows,
            ) {
                Ok(()) => {
                    self.hierarchy.set(key, count);
                    self.metrics.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.set_fatal(e),
            }
        }

        let slice = self.slice(&key);
        {
            let mut map = slice.map.lock();
            map.remove(&key);
            slice.cv.notify_all();
        }
        self.metrics.alive.fetch_sub(1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.join_cv.notify_all();
    }

    fn resident(&self) -> usize {
        self.slices.iter().map(|s| s.map.lock().len()).sum()
    }

    /// Block until every chunk has been flushed, then shut the write pool
    /// down. Call only after all clippers are gone.
    pub fn join(&self) -> Result<()> {
        {
            let mut guard = self.join_m.lock();
            while self.pending.load(Ordering::SeqCst) > 0 || self.resident() > 0 {
                self.join_cv
                    .wait_for(&mut guard, Duration::from_millis(100));
            }
        }

        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.writers.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }

        if let Some(e) = self.fatal_error.lock().take() {
            return Err(e);
        }
        Ok(())
    }
}

/// Per-worker reference token: records every chunk the worker's insertion
/// paths touch, releasing them all at once on `clip`.
pub struct Clipper {
    cache: Arc<ChunkCache>,
    keys: HashSet<Dxyz>,
}

impl Clipper {
    pub fn new(cache: Arc<ChunkCache>) -> Clipper {
        Clipper {
            cache,
            keys: HashSet::new(),
        }
    }

    /// Record a touch; true when this is the first on this worker.
    fn note(&mut self, key: Dxyz) -> bool {
        self.keys.insert(key)
    }

    fn forget(&mut self, key: &Dxyz) {
        self.keys.remove(key);
    }

    /// Release every accumulated reference.
    pub fn clip(&mut self) {
        let keys = std::mem::take(&mut self.keys);
        for key in keys {
            self.cache.unref(&key);
        }
    }
}

impl Drop for Clipper {
    fn drop(&mut self) {
        self.clip();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Bounds, Point};
    use crate::metadata::tests::test_metadata;
    use crate::metadata::DataType;

    fn metadata() -> Arc<Metadata> {
        let mut m = test_metadata();
        m.bounds = Bounds::new(0.0, 0.0, 0.0, 16.0, 16.0, 16.0);
        m.bounds_conforming = m.bounds;
        m.span = 4;
        m.min_node_size = 4;
        m.max_node_size = 16;
        m.data_type = DataType::Binary;
        m.schema = vec![
            crate::schema::Dimension::new("X", crate::schema::DimKind::Float, 8),
            crate::schema::Dimension::new("Y", crate::schema::DimKind::Float, 8),
            crate::schema::Dimension::new("Z", crate::schema::DimKind::Float, 8),
        ];
        Arc::new(m)
    }

    fn harness(dir: &std::path::Path) -> (Arc<ChunkCache>, Arc<Hierarchy>, Arc<Metadata>) {
        let m = metadata();
        let h = Arc::new(Hierarchy::new());
        let cache =
            ChunkCache::new(Endpoints::local(dir, None), m.clone(), h.clone(), 2).unwrap();
        (cache, h, m)
    }

    fn push(cache: &Arc<ChunkCache>, m: &Metadata, clipper: &mut Clipper, x: f64, y: f64, z: f64) {
        let layout = Layout::new(&m.schema).unwrap();
        let p = las::Point {
            x,
            y,
            z,
            ..Default::default()
        };
        let mut row = vec![0u8; layout.point_size()];
        layout.pack(&p, 0, 0, &mut row);

        let mut key = Key::new(m.bounds);
        key.init(&Point::new(x, y, z), m.start_depth());
        let ck = ChunkKey::new(m.bounds);
        assert!(cache
            .insert(Voxel::new(Point::new(x, y, z), row), &mut key, &ck, clipper)
            .unwrap());
    }

    #[test]
    fn flush_writes_root_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, hierarchy, m) = harness(dir.path());

        {
            let mut clipper = Clipper::new(cache.clone());
            for i in 0..10 {
                push(&cache, &m, &mut clipper, 0.5 + i as f64, 0.5, 0.5);
            }
        }
        cache.join().unwrap();

        let root = Dxyz::root();
        assert_eq!(hierarchy.get(&root), 10);
        assert!(dir.path().join("ept-data/0-0-0-0.bin").exists());

        let info = cache.latch_info();
        assert_eq!(info.written, 1);
        assert_eq!(info.alive, 0);
    }

    #[test]
    fn reanimation_reads_back_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, hierarchy, m) = harness(dir.path());

        {
            let mut clipper = Clipper::new(cache.clone());
            push(&cache, &m, &mut clipper, 1.0, 1.0, 1.0);
        }
        cache.join().unwrap();
        assert_eq!(hierarchy.get(&Dxyz::root()), 1);

        // A fresh cache over the same store faults the chunk in and keeps
        // the prior point.
        let cache2 = ChunkCache::new(
            Endpoints::local(dir.path(), None),
            Arc::new(m.as_ref().clone()),
            hierarchy.clone(),
            1,
        )
        .unwrap();
        {
            let mut clipper = Clipper::new(cache2.clone());
            push(&cache2, &m, &mut clipper, 9.0, 9.0, 9.0);
        }
        cache2.join().unwrap();

        assert_eq!(hierarchy.get(&Dxyz::root()), 2);
        assert_eq!(cache2.latch_info().read, 1);
    }

    #[test]
    fn saturation_descends_into_children() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, hierarchy, m) = harness(dir.path());

        // 40 points into one voxel: max_node_size=16 forces children.
        {
            let mut clipper = Clipper::new(cache.clone());
            for i in 0..40 {
                push(
                    &cache,
                    &m,
                    &mut clipper,
                    0.5 + 0.001 * i as f64,
                    0.5,
                    0.5,
                );
            }
        }
        cache.join().unwrap();

        let total: u64 = hierarchy.snapshot().values().sum();
        assert_eq!(total, 40);
        assert!(hierarchy.get(&Dxyz::root()) > 0);
        // The cluster sits in the low corner: all depth-1 points belong to
        // child 1-0-0-0.
        let depth1: Vec<_> = hierarchy
            .snapshot()
            .into_iter()
            .filter(|(k, _)| k.d == 1)
            .collect();
        assert!(depth1.iter().all(|(k, _)| *k == Dxyz::new(1, 0, 0, 0)));
    }

    #[test]
    fn concurrent_workers_agree_on_totals() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, hierarchy, m) = harness(dir.path());

        let mut handles = Vec::new();
        for w in 0..4 {
            let cache = cache.clone();
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                let mut clipper = Clipper::new(cache.clone());
                for i in 0..100 {
                    let v = (w * 100 + i) as f64 / 400.0 * 15.0;
                    push(&cache, &m, &mut clipper, v, (v * 7.3) % 16.0, (v * 3.1) % 16.0);
                    if i % 25 == 0 {
                        clipper.clip();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        cache.join().unwrap();

        assert_eq!(hierarchy.total(), 400);

        // Every hierarchy entry has a matching chunk file.
        for (key, count) in hierarchy.snapshot() {
            assert!(count > 0);
            assert!(dir
                .path()
                .join(format!("ept-data/{key}.bin"))
                .exists());
        }
    }
}
