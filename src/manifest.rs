//! The manifest: per-input-file state, its sharded persistence, and the
//! merge/reduce logic used by subset recombination and the scanner.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::io;
use crate::pipeline::Pipeline;
use crate::pool::Pool;
use crate::schema::{self, Schema};
use crate::srs::Srs;

/// Zero-based index of an input file within the manifest; also written to
/// every inserted point.
pub type Origin = u64;

/// Everything known about one input file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "pipeline_is_empty")]
    pub pipeline: Pipeline,
    #[serde(default, skip_serializing_if = "Srs::is_empty_record")]
    pub srs: Srs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub points: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

fn pipeline_is_empty(p: &Pipeline) -> bool {
    p.stages.is_empty()
}

/// A path plus its inspection results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
    #[serde(flatten)]
    pub info: SourceInfo,
}

/// One manifest entry: a source, its insertion latch, and where its
/// detailed sidecar lives.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildItem {
    pub source: Source,
    pub inserted: bool,
    pub metadata_path: String,
}

impl BuildItem {
    pub fn new(source: Source) -> BuildItem {
        BuildItem {
            source,
            inserted: false,
            metadata_path: String::new(),
        }
    }
}

pub type Manifest = Vec<BuildItem>;

#[derive(Serialize, Deserialize)]
struct ListEntry {
    path: String,
    #[serde(default)]
    inserted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    points: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Schema>,
    #[serde(default, rename = "metadataPath", skip_serializing_if = "Option::is_none")]
    metadata_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<SourceInfo>,
}

fn list_name(postfix: &str) -> String {
    format!("list{postfix}.json")
}

/// Unique sidecar filenames derived from each source's stem.
pub fn assign_metadata_paths(mut manifest: Manifest) -> Manifest {
    let mut taken: HashSet<String> = HashSet::new();
    for item in manifest.iter_mut() {
        if !item.metadata_path.is_empty() {
            taken.insert(item.metadata_path.clone());
            continue;
        }
        let stem = std::path::Path::new(&item.source.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source")
            .to_string();
        let mut name = format!("{stem}.json");
        let mut n = 1;
        while !taken.insert(name.clone()) {
            name = format!("{stem}-{n}.json");
            n += 1;
        }
        item.metadata_path = name;
    }
    manifest
}

/// Persist the manifest: per-file sidecars plus an overview for a full
/// build, or a single self-contained blob for subsets (which are always
/// reloaded wholesale by the merge).
pub fn save(
    manifest: &Manifest,
    ep: &Endpoint,
    threads: u64,
    postfix: &str,
    subset_id: Option<u64>,
) -> Result<Manifest> {
    let pretty = manifest.len() <= 1000;
    let mut manifest = manifest.clone();

    if let Some(id) = subset_id {
        // Aside from schema stats and counts, every subset sees identical
        // per-file detail, so only the first subset writes the full form;
        // the rest reduce each item to {path, inserted, points, schema}.
        let entries: Vec<ListEntry> = manifest
            .iter()
            .map(|item| {
                let info = &item.source.info;
                if id == 1 {
                    ListEntry {
                        path: item.source.path.clone(),
                        inserted: item.inserted,
                        points: Some(info.points),
                        schema: None,
                        metadata_path: None,
                        info: Some(info.clone()),
                    }
                } else {
                    ListEntry {
                        path: item.source.path.clone(),
                        inserted: item.inserted,
                        points: item.inserted.then_some(info.points),
                        schema: (item.inserted && info.points > 0)
                            .then(|| info.schema.clone()),
                        metadata_path: None,
                        info: None,
                    }
                }
            })
            .collect();
        io::ensure_put_json(ep, &list_name(postfix), &entries, pretty)?;
        return Ok(manifest);
    }

    manifest = assign_metadata_paths(manifest);

    let pool = Pool::new(threads as usize);
    let (tx, rx) = unbounded::<Result<()>>();
    for item in &manifest {
        let ep = ep.clone();
        let name = item.metadata_path.clone();
        let source = item.source.clone();
        let tx = tx.clone();
        pool.add(move || {
            let _ = tx.send(io::ensure_put_json(&ep, &name, &source, true));
        });
    }
    drop(tx);
    pool.join();
    for result in rx.iter() {
        result?;
    }

    let entries: Vec<ListEntry> = manifest
        .iter()
        .map(|item| ListEntry {
            path: item.source.path.clone(),
            inserted: item.inserted,
            points: Some(item.source.info.points),
            schema: None,
            metadata_path: Some(item.metadata_path.clone()),
            info: None,
        })
        .collect();
    io::ensure_put_json(ep, &list_name(postfix), &entries, pretty)?;
    Ok(manifest)
}

/// Load a manifest: the overview first, then any sidecars in parallel.
pub fn load(ep: &Endpoint, threads: u64, postfix: &str) -> Result<Manifest> {
    let entries: Vec<ListEntry> = io::ensure_get_json(ep, &list_name(postfix))?;

    let mut manifest: Manifest = entries
        .iter()
        .map(|e| {
            // Reduced entries carry their detail flat on the list entry.
            let info = e.info.clone().unwrap_or_else(|| SourceInfo {
                points: e.points.unwrap_or(0),
                schema: e.schema.clone().unwrap_or_default(),
                ..Default::default()
            });
            BuildItem {
                source: Source {
                    path: e.path.clone(),
                    info,
                },
                inserted: e.inserted,
                metadata_path: e.metadata_path.clone().unwrap_or_default(),
            }
        })
        .collect();

    let wanted: Vec<(usize, String)> = entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| {
            (e.info.is_none() && e.metadata_path.is_some())
                .then(|| (i, e.metadata_path.clone().unwrap()))
        })
        .collect();

    if !wanted.is_empty() {
        let pool = Pool::new(threads as usize);
        let (tx, rx) = unbounded::<(usize, Result<Source>)>();
        for (i, name) in wanted {
            let ep = ep.clone();
            let tx = tx.clone();
            pool.add(move || {
                let _ = tx.send((i, io::ensure_get_json(&ep, &name)));
            });
        }
        drop(tx);
        pool.join();
        for (i, result) in rx.iter() {
            manifest[i].source = result?;
        }
    }

    Ok(manifest)
}

/// Pairwise merge of two runs over the same input list.
pub fn merge(mut a: Manifest, b: &Manifest) -> Result<Manifest> {
    if a.len() != b.len() {
        return Err(Error::Fatal(format!(
            "manifest size mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    for (ours, theirs) in a.iter_mut().zip(b) {
        if ours.source.path != theirs.source.path {
            return Err(Error::Fatal(format!(
                "manifest path mismatch: {} vs {}",
                ours.source.path, theirs.source.path
            )));
        }

        match (ours.inserted, theirs.inserted) {
            (true, true) => {
                ours.source.info.points += theirs.source.info.points;
                ours.source.info.schema = schema::combine(
                    std::mem::take(&mut ours.source.info.schema),
                    &theirs.source.info.schema,
                    true,
                );
                ours.source
                    .info
                    .errors
                    .extend(theirs.source.info.errors.iter().cloned());
                ours.source
                    .info
                    .warnings
                    .extend(theirs.source.info.warnings.iter().cloned());
            }
            (false, true) => *ours = theirs.clone(),
            _ => {}
        }
    }
    Ok(a)
}

/// Aggregate a source list into one summary: bounds union, point totals,
/// schema union, and a consistency-checked SRS.
pub fn reduce(sources: &[Source]) -> SourceInfo {
    let mut out = SourceInfo::default();
    let mut bounds = Bounds::default();

    for source in sources {
        let info = &source.info;
        if let Some(b) = &info.bounds {
            bounds.expand(b);
        }
        out.points += info.points;
        out.schema = schema::combine(std::mem::take(&mut out.schema), &info.schema, false);

        if info.srs.exists() {
            if !out.srs.exists() {
                out.srs = info.srs.clone();
            } else if out.srs != info.srs {
                out.warnings.push(format!(
                    "SRS mismatch: {} does not match the aggregate",
                    source.path
                ));
            }
        }

        out.errors.extend(info.errors.iter().cloned());
    }

    if bounds.exists() {
        out.bounds = Some(bounds);
    }
    out
}

pub fn total_points(manifest: &Manifest) -> u64 {
    manifest.iter().map(|i| i.source.info.points).sum()
}

pub fn inserted_points(manifest: &Manifest) -> u64 {
    manifest
        .iter()
        .filter(|i| i.inserted)
        .map(|i| i.source.info.points)
        .sum()
}

pub fn all_inserted(manifest: &Manifest) -> bool {
    manifest.iter().all(|i| i.inserted)
}

/// Used by save-time decisions that want to know whether stats exist for
/// every inserted item.
pub fn all_have_stats(manifest: &Manifest) -> bool {
    manifest
        .iter()
        .filter(|i| i.inserted && i.source.info.points > 0)
        .all(|i| schema::has_stats(&i.source.info.schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoints;
    use crate::schema::{DimKind, Dimension};

    fn source(path: &str, points: u64) -> Source {
        Source {
            path: path.to_string(),
            info: SourceInfo {
                points,
                bounds: Some(Bounds::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0)),
                schema: vec![Dimension::new("X", DimKind::Float, 8)],
                ..Default::default()
            },
        }
    }

    #[test]
    fn sidecar_names_are_unique() {
        let manifest = vec![
            BuildItem::new(source("a/pts.las", 1)),
            BuildItem::new(source("b/pts.las", 1)),
            BuildItem::new(source("c/other.las", 1)),
        ];
        let manifest = assign_metadata_paths(manifest);
        assert_eq!(manifest[0].metadata_path, "pts.json");
        assert_eq!(manifest[1].metadata_path, "pts-1.json");
        assert_eq!(manifest[2].metadata_path, "other.json");
    }

    #[test]
    fn save_load_round_trip_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);

        let mut manifest = vec![
            BuildItem::new(source("a.las", 10)),
            BuildItem::new(source("b.las", 20)),
        ];
        manifest[0].inserted = true;

        save(&manifest, &ep.sources, 2, "", None).unwrap();
        assert!(ep.sources.exists("list.json"));
        assert!(ep.sources.exists("a.json"));

        let back = load(&ep.sources, 2, "").unwrap();
        assert_eq!(back.len(), 2);
        assert!(back[0].inserted);
        assert!(!back[1].inserted);
        assert_eq!(back[0].source.info.points, 10);
        assert_eq!(back[1].source.info.bounds, manifest[1].source.info.bounds);
    }

    #[test]
    fn subset_save_is_self_contained() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);

        let mut manifest = vec![BuildItem::new(source("a.las", 10))];
        manifest[0].inserted = true;
        save(&manifest, &ep.sources, 2, "-2", Some(2)).unwrap();
        assert!(ep.sources.exists("list-2.json"));
        assert!(!ep.sources.exists("a.json"));

        // Subsets past the first reduce each item to four flat fields.
        let raw: serde_json::Value =
            serde_json::from_slice(&ep.sources.get("list-2.json").unwrap()).unwrap();
        let entry = &raw[0];
        assert!(entry.get("info").is_none());
        assert!(entry.get("errors").is_none());
        assert_eq!(entry["points"], 10);
        assert!(entry["schema"].is_array());

        let back = load(&ep.sources, 2, "-2").unwrap();
        assert!(back[0].inserted);
        assert_eq!(back[0].source.info.points, 10);
        assert_eq!(back[0].source.info.schema, manifest[0].source.info.schema);
    }

    #[test]
    fn merge_folds_counts_and_latches() {
        let mut a = vec![
            BuildItem::new(source("a.las", 5)),
            BuildItem::new(source("b.las", 0)),
        ];
        a[0].inserted = true;

        let mut b = vec![
            BuildItem::new(source("a.las", 7)),
            BuildItem::new(source("b.las", 3)),
        ];
        b[0].inserted = true;
        b[1].inserted = true;

        let merged = merge(a, &b).unwrap();
        assert_eq!(merged[0].source.info.points, 12);
        assert!(merged[1].inserted);
        assert_eq!(merged[1].source.info.points, 3);
    }

    #[test]
    fn merge_rejects_mismatched_manifests() {
        let a = vec![BuildItem::new(source("a.las", 1))];
        let b = vec![
            BuildItem::new(source("a.las", 1)),
            BuildItem::new(source("b.las", 1)),
        ];
        assert!(merge(a, &b).is_err());
    }

    #[test]
    fn reduce_unions_bounds_and_flags_srs_conflicts() {
        let mut a = source("a.las", 5);
        a.info.srs = crate::srs::Srs::from_code("EPSG:26915");
        let mut b = source("b.las", 7);
        b.info.srs = crate::srs::Srs::from_code("EPSG:4326");
        b.info.bounds = Some(Bounds::new(2.0, 2.0, 2.0, 3.0, 3.0, 3.0));

        let out = reduce(&[a, b]);
        assert_eq!(out.points, 12);
        assert_eq!(out.srs.horizontal, "26915");
        assert_eq!(out.warnings.len(), 1);
        let bounds = out.bounds.unwrap();
        assert_eq!(bounds.max_x, 3.0);
        assert_eq!(bounds.min_x, 0.0);
    }
}
