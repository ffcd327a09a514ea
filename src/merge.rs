//! Subset recombination: fold independently built subsets into one EPT.
//!
//! Nodes at or below the shared depth belong to exactly one subset, so
//! their chunks and counts transfer directly; the shallow levels were
//! built redundantly by every subset and must be re-inserted point by
//! point to resolve cross-subset voxel fights.

use std::sync::Arc;

use crate::builder::Builder;
use crate::cache::{ChunkCache, Clipper};
use crate::codec;
use crate::endpoint::{Endpoints, Store};
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::io;
use crate::key::{ChunkKey, Key};
use crate::manifest;
use crate::metadata::Metadata;
use crate::schema::Layout;
use crate::voxel::Voxel;

pub fn merge(
    endpoints: Endpoints,
    input_store: Arc<dyn Store>,
    threads: u64,
    force: bool,
    verbose: bool,
) -> Result<()> {
    if !force && endpoints.output.exists("ept.json") {
        return Err(Error::Config(
            "Completed dataset already exists here: re-run with '--force' to overwrite it"
                .to_string(),
        ));
    }
    if !endpoints.output.exists("ept-1.json") {
        return Err(Error::Config("Failed to find first subset".to_string()));
    }

    if verbose {
        log::info!("Initializing");
    }
    let base = Builder::load(endpoints.clone(), input_store.clone(), threads, Some(1), verbose)?;

    let subset = base
        .metadata
        .subset
        .ok_or_else(|| Error::Fatal("first subset carries no subset descriptor".to_string()))?;
    let of = subset.of;
    let shared_depth = subset.shared_depth();

    // The merged output is subset 1's metadata without the subset itself.
    let mut metadata: Metadata = base.metadata.clone();
    metadata.subset = None;

    let mut builder = Builder::new(
        endpoints.clone(),
        metadata,
        base.manifest.clone(),
        Hierarchy::new(),
        input_store.clone(),
        verbose,
    );

    let merged_metadata = Arc::new(builder.metadata.clone());
    let cache = ChunkCache::new(
        endpoints.clone(),
        merged_metadata.clone(),
        builder.hierarchy.clone(),
        threads,
    )?;

    if verbose {
        log::info!("Merging");
    }

    for id in 1..=of {
        if !endpoints.output.exists(&format!("ept-{id}.json")) {
            if verbose {
                log::info!("\t{id}/{of}: skipping");
            }
            continue;
        }
        if verbose {
            log::info!("\t{id}/{of}: merging");
        }

        let current = Builder::load(
            endpoints.clone(),
            input_store.clone(),
            threads,
            Some(id),
            verbose,
        )?;
        merge_one(&builder, &cache, &current, shared_depth)?;

        // The base builder already carries subset 1's manifest.
        if id > 1 {
            builder.manifest = manifest::merge(std::mem::take(&mut builder.manifest), &current.manifest)?;
        }
    }

    cache.join()?;
    builder.save(threads)?;

    if verbose {
        log::info!("Done");
    }
    Ok(())
}

fn merge_one(
    dst: &Builder,
    cache: &Arc<ChunkCache>,
    src: &Builder,
    shared_depth: u32,
) -> Result<()> {
    let metadata = &dst.metadata;
    let layout = Layout::new(&metadata.schema)?;
    let postfix = src.metadata.postfix();
    let ext = metadata.data_type.extension();

    let mut clipper = Clipper::new(cache.clone());
    let start_depth = metadata.start_depth();

    for (key, count) in src.hierarchy.snapshot() {
        if count == 0 {
            continue;
        }

        if key.d >= shared_depth && dst.hierarchy.get(&key) == 0 {
            // Disjoint subtree: transfer the chunk file to its merged name
            // and adopt the count.
            let blob = io::ensure_get(&dst.endpoints.data, &format!("{key}{postfix}.{ext}"))?;
            io::ensure_put(&dst.endpoints.data, &format!("{key}.{ext}"), &blob)?;
            dst.hierarchy.set(key, count);
            continue;
        }

        if key.d >= shared_depth {
            // A shallow fight already pushed points into this node; fold
            // the subset's chunk in through the cache instead of copying.
            log::warn!("re-inserting occupied node {key} during merge");
        }

        // Levels built by every subset are combined point by point so
        // cross-subset voxel fights resolve exactly as a single build
        // would have.
        let rows = codec::read(
            metadata,
            &layout,
            &dst.endpoints.data,
            &format!("{key}{postfix}"),
            count,
        )?;

        let mut point_key = Key::new(metadata.bounds);
        let mut ck = ChunkKey::new(metadata.bounds);
        for row in rows.chunks_exact(layout.point_size()) {
            let point = layout.position(row);
            point_key.init(&point, key.d + start_depth);
            ck.init(&point, key.d);
            debug_assert_eq!(ck.dxyz(), key);

            cache.insert(
                Voxel::new(point, row.to_vec()),
                &mut point_key,
                &ck,
                &mut clipper,
            )?;
        }
    }

    Ok(())
}
