//! The scanner: a header-level inference pass over the inputs, producing
//! the aggregate schema, bounds, and SRS that parameterize a build.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoints, Store};
use crate::error::{Error, Result};
use crate::io;
use crate::manifest::{self, Source, SourceInfo};
use crate::pipeline::{deep_preview, preview, Pipeline};
use crate::pool::Pool;
use crate::schema::set_scale_offset;
use crate::schema::ScaleOffset;

pub const SCAN_FILENAME: &str = "ept-scan.json";

/// The scan artifact: the aggregate plus every per-file result, feedable
/// to a build in place of the raw inputs.
#[derive(Serialize, Deserialize, Debug)]
pub struct ScanFile {
    #[serde(flatten)]
    pub summary: SourceInfo,
    pub sources: Vec<Source>,
}

fn is_las(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".las") || lower.ends_with(".laz")
}

/// Inspect one input. Remote LAS files are fetched shallowly (header and
/// VLRs only) unless a deep scan needs the point records; other remote
/// files are staged whole.
fn analyze_one(
    store: &Arc<dyn Store>,
    tmp: &Path,
    pipeline: &Pipeline,
    path: &str,
    deep: bool,
) -> Result<SourceInfo> {
    let handle = if let Some(local) = store.local_path(path) {
        io::LocalHandle::borrowed(local)
    } else if is_las(path) && !deep {
        io::shallow_las_handle(store, path, tmp)?
    } else {
        io::ensure_local_handle(store, path, tmp, io::RETRY_TRIES)?
    };

    let p = if deep {
        deep_preview(handle.path())?
    } else {
        preview(handle.path())?
    };

    let mut schema = p.schema;
    // Record the file's native resolution on its coordinate dimensions so
    // the aggregate can take the finest scale.
    schema = set_scale_offset(
        schema,
        ScaleOffset {
            scale: p.scale,
            offset: p.offset,
        },
    );

    Ok(SourceInfo {
        pipeline: pipeline.clone(),
        srs: p.srs,
        bounds: Some(p.bounds),
        points: p.points,
        schema,
        metadata: p.metadata,
        errors: Vec::new(),
        warnings: Vec::new(),
    })
}

/// Inspect every input in parallel. An input with no obtainable preview is
/// kept in the list with zero points and a warning, which drops it from
/// any subsequent build.
pub fn analyze(
    inputs: &[String],
    pipeline: &Pipeline,
    store: &Arc<dyn Store>,
    tmp: &Path,
    threads: u64,
    deep: bool,
    verbose: bool,
) -> Vec<Source> {
    let pool = Pool::new(threads as usize);
    let (tx, rx) = unbounded::<(usize, Source)>();

    for (i, path) in inputs.iter().enumerate() {
        let store = store.clone();
        let tmp = tmp.to_path_buf();
        let pipeline = pipeline.clone();
        let path = path.clone();
        let tx = tx.clone();
        pool.add(move || {
            if verbose {
                log::info!("Scanning {path}");
            }
            let source = match analyze_one(&store, &tmp, &pipeline, &path, deep) {
                Ok(info) => Source {
                    path: path.clone(),
                    info,
                },
                Err(e) => {
                    log::warn!("Dropping {path}: {e}");
                    Source {
                        path: path.clone(),
                        info: SourceInfo {
                            warnings: vec![e.to_entry()],
                            ..Default::default()
                        },
                    }
                }
            };
            let _ = tx.send((i, source));
        });
    }
    drop(tx);
    pool.join();

    let mut indexed: Vec<(usize, Source)> = rx.iter().collect();
    indexed.sort_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, s)| s).collect()
}

/// Run a full scan and write the artifact: `ept-scan.json` plus one
/// sidecar per source under `ept-sources/`.
pub fn run(
    inputs: &[String],
    pipeline: &Pipeline,
    store: &Arc<dyn Store>,
    endpoints: &Endpoints,
    threads: u64,
    deep: bool,
    verbose: bool,
) -> Result<ScanFile> {
    if inputs.is_empty() {
        return Err(Error::Config("no inputs to scan".to_string()));
    }

    let sources = analyze(inputs, pipeline, store, &endpoints.tmp, threads, deep, verbose);
    let summary = manifest::reduce(&sources);

    let scan = ScanFile {
        summary,
        sources: sources.clone(),
    };
    io::ensure_put_json(&endpoints.output, SCAN_FILENAME, &scan, true)?;

    let items: Vec<crate::manifest::BuildItem> = sources
        .into_iter()
        .map(crate::manifest::BuildItem::new)
        .collect();
    manifest::save(&items, &endpoints.sources, threads, "", None)?;

    Ok(scan)
}

/// Load a previously written scan artifact.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ScanFile> {
    let data = std::fs::read(&path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
    Ok(serde_json::from_slice(&data)?)
}
