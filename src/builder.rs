//! The builder: drives insertion of every manifest item through the chunk
//! cache, monitors progress, and serializes the final artifacts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::unbounded;

use crate::bounds::{Bounds, Point};
use crate::cache::{ChunkCache, Clipper};
use crate::endpoint::{Endpoints, Store};
use crate::error::{Error, Result};
use crate::hierarchy::{self, Hierarchy};
use crate::io;
use crate::key::{ChunkKey, Key};
use crate::manifest::{self, Manifest, Origin, SourceInfo};
use crate::metadata::Metadata;
use crate::pipeline::{self, Pipeline, Stage};
use crate::pool::Pool;
use crate::schema::{self, Layout};
use crate::voxel::Voxel;

const BATCH_CAPACITY: usize = 4096;

/// Thread split between insertion workers and the cache's write pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Threads {
    pub work: u64,
    pub clip: u64,
}

impl Threads {
    pub fn split(total: u64) -> Threads {
        let total = total.max(2);
        let work = (total / 2).max(1);
        Threads {
            work,
            clip: total - work,
        }
    }

    pub fn total(&self) -> u64 {
        self.work + self.clip
    }
}

pub struct Builder {
    pub endpoints: Endpoints,
    pub metadata: Metadata,
    pub manifest: Manifest,
    pub hierarchy: Arc<Hierarchy>,
    pub input_store: Arc<dyn Store>,
    pub verbose: bool,
}

struct ItemOutcome {
    origin: Origin,
    info: SourceInfo,
}

impl Builder {
    pub fn new(
        endpoints: Endpoints,
        metadata: Metadata,
        manifest: Manifest,
        hierarchy: Hierarchy,
        input_store: Arc<dyn Store>,
        verbose: bool,
    ) -> Builder {
        Builder {
            endpoints,
            metadata,
            manifest,
            hierarchy: Arc::new(hierarchy),
            input_store,
            verbose,
        }
    }

    /// Reload a previous build (optionally a numbered subset) so insertion
    /// or merging can resume.
    pub fn load(
        endpoints: Endpoints,
        input_store: Arc<dyn Store>,
        threads: u64,
        subset_id: Option<u64>,
        verbose: bool,
    ) -> Result<Builder> {
        let postfix = subset_id.map(|id| format!("-{id}")).unwrap_or_default();
        let ept = io::ensure_get_json(&endpoints.output, &format!("ept{postfix}.json"))?;
        let build = io::ensure_get_json(&endpoints.output, &format!("ept-build{postfix}.json"))?;
        let metadata = Metadata::from_files(ept, build);

        let manifest = manifest::load(&endpoints.sources, threads, &postfix)?;
        let hierarchy = hierarchy::load(&endpoints.hierarchy, &postfix)?;

        Ok(Builder::new(
            endpoints,
            metadata,
            manifest,
            hierarchy,
            input_store,
            verbose,
        ))
    }

    /// The bounds insertion actually honors for this invocation.
    pub fn active_bounds(&self) -> Bounds {
        match &self.metadata.subset {
            Some(s) => s
                .slab(&self.metadata.bounds)
                .intersection(&self.metadata.bounds_conforming),
            None => self.metadata.bounds_conforming,
        }
    }

    /// Run the build: schedule every eligible manifest item, drain the
    /// cache, and save. Returns the number of points inserted by this
    /// invocation.
    pub fn run(&mut self, threads: Threads, limit: u64, progress_interval: u64) -> Result<u64> {
        self.metadata.validate()?;

        // Work threads beyond the eligible file count go to the clip pool.
        let eligible = self
            .manifest
            .iter()
            .filter(|item| !item.inserted && item.source.info.points > 0)
            .count() as u64;
        let actual_work = threads.work.min(eligible.max(1));
        let actual_clip = threads.clip + (threads.work - actual_work);

        let metadata = Arc::new(self.metadata.clone());
        let cache = ChunkCache::new(
            self.endpoints.clone(),
            metadata.clone(),
            self.hierarchy.clone(),
            actual_clip,
        )?;

        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let monitor =
            self.spawn_monitor(progress_interval, counter.clone(), done.clone(), cache.clone());
        let result = self.run_inserts(cache, metadata, actual_work, limit, &counter);
        done.store(true, Ordering::Relaxed);
        let _ = monitor.join();
        result?;

        self.save(threads.total())?;
        Ok(counter.load(Ordering::Relaxed))
    }

    fn spawn_monitor(
        &self,
        progress_interval: u64,
        counter: Arc<AtomicU64>,
        done: Arc<AtomicBool>,
        cache: Arc<ChunkCache>,
    ) -> std::thread::JoinHandle<()> {
        let already = manifest::inserted_points(&self.manifest) as f64;
        let total = manifest::total_points(&self.manifest) as f64;

        std::thread::spawn(move || {
            if progress_interval == 0 {
                return;
            }
            const MHR: f64 = 3600.0 / 1_000_000.0;
            let start = std::time::Instant::now();
            let mut last_inserted = 0.0;

            while !done.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_secs(1));
                let tick = start.elapsed().as_secs();
                if tick == 0 || tick % progress_interval != 0 {
                    continue;
                }

                let current = counter.load(Ordering::Relaxed) as f64;
                let inserted = already + current;
                let progress = if total > 0.0 { inserted / total } else { 0.0 };
                let pace = (inserted / tick as f64 * MHR) as u64;
                let interval_pace =
                    ((inserted - last_inserted) / progress_interval as f64 * MHR) as u64;
                last_inserted = inserted;

                let info = cache.latch_info();
                println!(
                    "{} - {}% - {} - {} ({}) M/h - {}W - {}R - {}A",
                    format_time(tick),
                    (progress * 100.0).round(),
                    commify(inserted as u64),
                    commify(pace),
                    commify(interval_pace),
                    info.written,
                    info.read,
                    info.alive,
                );
            }
        })
    }

    fn run_inserts(
        &mut self,
        cache: Arc<ChunkCache>,
        metadata: Arc<Metadata>,
        work_threads: u64,
        limit: u64,
        counter: &Arc<AtomicU64>,
    ) -> Result<()> {
        let active = self.active_bounds();
        let pool = Pool::new(work_threads as usize);
        let (tx, rx) = unbounded::<ItemOutcome>();

        let mut files_inserted = 0u64;
        for (origin, item) in self.manifest.iter().enumerate() {
            if limit > 0 && files_inserted >= limit {
                break;
            }
            let info = &item.source.info;
            if item.inserted || info.points == 0 {
                continue;
            }
            if let Some(b) = &info.bounds {
                if !active.intersects(b) {
                    continue;
                }
            }

            if self.verbose {
                log::info!("Adding {origin} - {}", item.source.path);
            }

            let origin = origin as Origin;
            let path = item.source.path.clone();
            let info = info.clone();
            let cache = cache.clone();
            let metadata = metadata.clone();
            let counter = counter.clone();
            let tx = tx.clone();
            let input_store = self.input_store.clone();
            let tmp = self.endpoints.tmp.clone();
            let active = active;
            let verbose = self.verbose;

            pool.add(move || {
                let outcome = try_insert(
                    &cache,
                    &metadata,
                    &input_store,
                    &tmp,
                    origin,
                    &path,
                    info,
                    active,
                    &counter,
                );
                if verbose {
                    log::info!("\tDone {origin}");
                }
                let _ = tx.send(outcome);
            });

            files_inserted += 1;
        }
        drop(tx);

        if self.verbose {
            log::info!("Joining");
        }

        pool.join();
        for outcome in rx.iter() {
            let item = &mut self.manifest[outcome.origin as usize];
            item.source.info = outcome.info;
            item.inserted = true;
        }
        cache.join()
    }

    /// Serialize hierarchy, manifest, and metadata.
    pub fn save(&mut self, threads: u64) -> Result<()> {
        if self.verbose {
            log::info!("Saving");
        }
        self.save_hierarchy()?;
        self.save_sources(threads)?;
        self.save_metadata()
    }

    fn save_hierarchy(&mut self) -> Result<()> {
        // A subset or a partial build defers sharding and writes one
        // monolithic file; the merge or the completing run re-shards.
        let stepped =
            self.metadata.subset.is_none() && manifest::all_inserted(&self.manifest);

        let step = if !stepped {
            0
        } else if self.metadata.hierarchy_step != 0 {
            self.metadata.hierarchy_step as u32
        } else {
            let step = hierarchy::determine_step(&self.hierarchy);
            self.metadata.hierarchy_step = step as u64;
            step
        };

        hierarchy::save(
            &self.hierarchy,
            &self.endpoints.hierarchy,
            step,
            &self.metadata.postfix(),
        )
    }

    fn save_sources(&mut self, threads: u64) -> Result<()> {
        self.manifest = manifest::save(
            &self.manifest,
            &self.endpoints.sources,
            threads,
            &self.metadata.postfix(),
            self.metadata.subset.map(|s| s.id),
        )?;
        Ok(())
    }

    fn save_metadata(&mut self) -> Result<()> {
        // Fold per-file stats into the global schema once everything is in.
        if self.metadata.subset.is_none()
            && manifest::all_inserted(&self.manifest)
            && manifest::all_have_stats(&self.manifest)
        {
            let so = schema::get_scale_offset(&self.metadata.schema);
            let mut combined = schema::clear_stats(self.metadata.schema.clone());
            for item in self.manifest.iter().filter(|i| i.source.info.points > 0) {
                let mut item_schema = item.source.info.schema.clone();
                if let Some(so) = so {
                    item_schema = schema::set_scale_offset(item_schema, so);
                }
                combined = schema::combine(combined, &item_schema, true);
            }
            self.metadata.schema = combined;
        }

        let postfix = self.metadata.postfix();
        let points = manifest::inserted_points(&self.manifest);

        io::ensure_put_json(
            &self.endpoints.output,
            &format!("ept{postfix}.json"),
            &self.metadata.to_ept_file(points),
            true,
        )?;
        io::ensure_put_json(
            &self.endpoints.output,
            &format!("ept-build{postfix}.json"),
            &self.metadata.to_build_file(),
            true,
        )
    }
}

/// Task-boundary wrapper: any failure becomes an error entry on the item,
/// and the item is latched either way so continuations skip it.
#[allow(clippy::too_many_arguments)]
fn try_insert(
    cache: &Arc<ChunkCache>,
    metadata: &Arc<Metadata>,
    input_store: &Arc<dyn Store>,
    tmp: &std::path::Path,
    origin: Origin,
    path: &str,
    mut info: SourceInfo,
    active: Bounds,
    counter: &Arc<AtomicU64>,
) -> ItemOutcome {
    match insert(
        cache,
        metadata,
        input_store,
        tmp,
        origin,
        path,
        &mut info,
        active,
        counter,
    ) {
        Ok(()) => {}
        Err(e) => info.errors.push(e.to_entry()),
    }
    ItemOutcome { origin, info }
}

#[allow(clippy::too_many_arguments)]
fn insert(
    cache: &Arc<ChunkCache>,
    metadata: &Arc<Metadata>,
    input_store: &Arc<dyn Store>,
    tmp: &std::path::Path,
    origin: Origin,
    path: &str,
    info: &mut SourceInfo,
    active: Bounds,
    counter: &Arc<AtomicU64>,
) -> Result<()> {
    let handle = io::ensure_local_handle(input_store, path, tmp, io::RETRY_TRIES)?;
    let local = handle
        .path()
        .to_str()
        .ok_or_else(|| Error::Input(format!("non-utf8 path for {path}")))?;

    let mut pipeline = if info.pipeline.stages.is_empty() {
        Pipeline::reader_only()
    } else {
        info.pipeline.clone()
    }
    .with_filename(local);

    let had_stats = schema::has_stats(&info.schema);

    if schema::contains(&metadata.schema, "OriginId") {
        pipeline.push(Stage::Assign {
            dimension: "OriginId".to_string(),
            value: origin as f64,
        });
        // The source file itself has no origin dimension; adopt it so its
        // stats are tracked alongside the native attributes. A deep-scanned
        // schema already has stats, and the origin is a per-file constant.
        if !schema::contains(&info.schema, "OriginId") {
            let mut dim = schema::origin_dimension();
            if had_stats {
                dim.stats = Some(crate::schema::DimensionStats {
                    count: info.points,
                    minimum: origin as f64,
                    maximum: origin as f64,
                    mean: origin as f64,
                    variance: 0.0,
                    counts: None,
                });
            }
            info.schema.push(dim);
        }
    }

    if !had_stats {
        // Only accumulate stats for points that actually get inserted.
        pipeline.push(Stage::Stats {
            enumerate: vec!["Classification".to_string()],
            clip: Some(active),
        });
    }

    let layout = Layout::new(&metadata.schema)?;
    let so = layout.scale_offset();
    let start_depth = metadata.start_depth();
    // Slab membership is half-open so subsets stay disjoint at their
    // shared faces.
    let slab = metadata.subset.map(|s| s.slab(&metadata.bounds));

    let mut key = Key::new(metadata.bounds);
    let root_ck = ChunkKey::new(metadata.bounds);
    let mut clipper = Clipper::new(cache.clone());

    // The scan's header count gets replaced by the number of points this
    // run actually lands.
    let mut inserted = 0u64;
    let mut inserted_at_batch_start = 0u64;
    let mut point_id = 0u64;
    let mut since_sleep = 0u64;
    let mut row = vec![0u8; layout.point_size()];

    let stats = pipeline::execute(&pipeline, &info.schema, BATCH_CAPACITY, |batch| {
        for p in batch {
            let id = point_id;
            point_id += 1;

            let mut position = Point::new(p.x, p.y, p.z);
            if let Some(so) = &so {
                position = so.clip(&position);
            }

            if !metadata.bounds_conforming.contains_inclusive(&position) {
                continue;
            }
            if let Some(slab) = &slab {
                if !slab.contains(&position) {
                    continue;
                }
            }

            layout.pack(p, origin, id, &mut row);
            key.init(&position, start_depth);
            if cache.insert(
                Voxel::new(position, row.clone()),
                &mut key,
                &root_ck,
                &mut clipper,
            )? {
                inserted += 1;
            }

            since_sleep += 1;
            if since_sleep >= metadata.sleep_count {
                since_sleep = 0;
                clipper.clip();
            }
        }
        let delta = inserted - inserted_at_batch_start;
        counter.fetch_add(delta, Ordering::Relaxed);
        inserted_at_batch_start = inserted;
        Ok(())
    })?;

    drop(clipper);

    info.points = inserted;
    if let Some(stats) = stats {
        stats.harvest(&mut info.schema);
        // The clip excludes max-face points from the sample, so the
        // counts come from what was actually inserted.
        for d in info.schema.iter_mut() {
            if let Some(s) = d.stats.as_mut() {
                s.count = inserted;
            }
        }
    }
    Ok(())
}

pub fn format_time(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        seconds % 3600 / 60,
        seconds % 60
    )
}

pub fn commify(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_split_halves() {
        assert_eq!(Threads::split(8), Threads { work: 4, clip: 4 });
        assert_eq!(Threads::split(9), Threads { work: 4, clip: 5 });
        assert_eq!(Threads::split(1), Threads { work: 1, clip: 1 });
    }

    #[test]
    fn time_and_commify_formats() {
        assert_eq!(format_time(3725), "01:02:05");
        assert_eq!(commify(1234567), "1,234,567");
        assert_eq!(commify(123), "123");
        assert_eq!(commify(0), "0");
    }
}
