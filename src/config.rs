//! User configuration and its reconciliation with any EPT dataset already
//! at the output location.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::builder::Builder;
use crate::endpoint::{Endpoints, LocalStore, Store};
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::manifest::BuildItem;
use crate::metadata::{DataType, Metadata, Reprojection, Subset};
use crate::pipeline::Pipeline;
use crate::scan;
use crate::schema::{self, Schema, ScaleOffset};
use crate::srs::Srs;

/// A uniform or per-axis scale request.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scale {
    Uniform(f64),
    PerAxis([f64; 3]),
}

impl Scale {
    pub fn to_array(self) -> [f64; 3] {
        match self {
            Scale::Uniform(s) => [s; 3],
            Scale::PerAxis(a) => a,
        }
    }
}

/// Everything a user can ask for, either via CLI flags or a JSON config
/// file layered underneath them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub input: Vec<String>,
    pub output: String,
    pub tmp: Option<String>,
    pub threads: u64,
    pub force: bool,
    pub data_type: Option<DataType>,
    pub span: Option<u64>,
    pub bounds: Option<Bounds>,
    pub scale: Option<Scale>,
    pub absolute: bool,
    pub no_origin_id: bool,
    pub limit: u64,
    /// Read every point record during the scan for exact bounds and stats,
    /// instead of trusting file headers.
    pub deep: bool,
    pub subset: Option<Subset>,
    pub min_node_size: Option<u64>,
    pub max_node_size: Option<u64>,
    pub cache_size: Option<u64>,
    pub hierarchy_step: Option<u64>,
    pub sleep_count: Option<u64>,
    pub progress: Option<u64>,
    #[serde(rename = "laz_14")]
    pub laz_14: bool,
    pub reprojection: Option<Reprojection>,
    pub pipeline: Option<Pipeline>,
    pub schema: Option<Schema>,
    pub srs: Option<Srs>,
    pub verbose: bool,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Config> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read config {path}: {e}")))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn threads(&self) -> u64 {
        if self.threads > 0 {
            self.threads
        } else {
            num_cpus::get() as u64
        }
    }

    pub fn progress_interval(&self) -> u64 {
        self.progress.unwrap_or(10)
    }

    pub fn endpoints(&self) -> Result<Endpoints> {
        if self.output.is_empty() {
            return Err(Error::Config("no output path given".to_string()));
        }
        Ok(Endpoints::local(
            &self.output,
            self.tmp.as_ref().map(PathBuf::from),
        ))
    }

    pub fn input_store(&self) -> Arc<dyn Store> {
        // Input paths are used as given against the filesystem.
        Arc::new(LocalStore::new(""))
    }
}

/// Expand globs, leaving plain paths and remote-style paths untouched.
pub fn expand_inputs(inputs: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for input in inputs {
        if input.contains('*') || input.contains('?') || input.contains('[') {
            let mut matched = false;
            for entry in glob::glob(input)
                .map_err(|e| Error::Config(format!("bad input pattern {input}: {e}")))?
            {
                let path =
                    entry.map_err(|e| Error::Config(format!("bad input {input}: {e}")))?;
                if let Some(s) = path.to_str() {
                    out.push(s.to_string());
                    matched = true;
                }
            }
            if !matched {
                log::warn!("no inputs matched {input}");
            }
        } else {
            out.push(input.clone());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_scan_file(inputs: &[String]) -> bool {
    inputs.len() == 1
        && std::path::Path::new(&inputs[0])
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n == scan::SCAN_FILENAME)
            .unwrap_or(false)
}

/// Build a [Builder] for this configuration: fresh when nothing exists at
/// the output (or `--force`), a continuation otherwise.
pub fn resolve(config: &Config) -> Result<Builder> {
    let mut config = config.clone();
    // A 1-of-1 subset is the whole build.
    if let Some(s) = config.subset {
        if s.of == 1 {
            if s.id != 1 {
                return Err(Error::Config(format!(
                    "subset id must be in 1..=1 (got {})",
                    s.id
                )));
            }
            config.subset = None;
        }
    }
    let config = &config;

    let endpoints = config.endpoints()?;
    let postfix = config
        .subset
        .map(|s| format!("-{}", s.id))
        .unwrap_or_default();

    if !config.force && endpoints.output.exists(&format!("ept{postfix}.json")) {
        resolve_continuation(config, endpoints)
    } else {
        resolve_fresh(config, endpoints)
    }
}

/// Existing dataset: on-disk metadata overrides the user config, and only
/// genuinely new inputs are scanned in.
fn resolve_continuation(config: &Config, endpoints: Endpoints) -> Result<Builder> {
    let threads = config.threads();
    let mut builder = Builder::load(
        endpoints,
        config.input_store(),
        threads,
        config.subset.map(|s| s.id),
        config.verbose,
    )?;

    match (&config.subset, &builder.metadata.subset) {
        (Some(theirs), Some(ours)) if theirs.of != ours.of => {
            return Err(Error::Config(format!(
                "subset of={} does not match the existing build's of={}",
                theirs.of, ours.of
            )));
        }
        (Some(_), None) => {
            return Err(Error::Config(
                "cannot continue a non-subset build as a subset".to_string(),
            ));
        }
        _ => {}
    }

    let inputs = expand_inputs(&config.input)?;
    let fresh: Vec<String> = inputs
        .into_iter()
        .filter(|path| !builder.manifest.iter().any(|i| &i.source.path == path))
        .collect();

    if !fresh.is_empty() {
        let pipeline = config.pipeline.clone().unwrap_or_else(Pipeline::reader_only);
        let sources = scan::analyze(
            &fresh,
            &pipeline,
            &builder.input_store,
            &builder.endpoints.tmp,
            threads,
            config.deep,
            config.verbose,
        );
        for source in sources {
            // New files that contribute nothing are dropped outright.
            if source.info.points > 0 {
                builder.manifest.push(BuildItem::new(source));
            }
        }
    }

    Ok(builder)
}

/// No dataset at the output: derive metadata from the scan aggregate with
/// the user's explicit settings taking priority.
fn resolve_fresh(config: &Config, endpoints: Endpoints) -> Result<Builder> {
    let inputs = expand_inputs(&config.input)?;
    if inputs.is_empty() {
        return Err(Error::Config("no inputs given".to_string()));
    }

    let input_store = config.input_store();
    let pipeline = config.pipeline.clone().unwrap_or_else(Pipeline::reader_only);

    let (sources, summary) = if is_scan_file(&inputs) {
        let scan = scan::load(&inputs[0])?;
        (scan.sources, scan.summary)
    } else {
        let sources = scan::analyze(
            &inputs,
            &pipeline,
            &input_store,
            &endpoints.tmp,
            config.threads(),
            config.deep,
            config.verbose,
        );
        let summary = crate::manifest::reduce(&sources);
        (sources, summary)
    };

    if summary.points == 0 {
        return Err(Error::Config("no points found in input".to_string()));
    }

    let metadata = build_metadata(config, &summary)?;

    let manifest: Vec<BuildItem> = sources
        .into_iter()
        .filter(|s| s.info.points > 0)
        .map(|mut s| {
            if s.info.pipeline.stages.is_empty() {
                s.info.pipeline = pipeline.clone();
            }
            BuildItem::new(s)
        })
        .collect();

    Ok(Builder::new(
        endpoints,
        metadata,
        manifest,
        Hierarchy::new(),
        input_store,
        config.verbose,
    ))
}

fn build_metadata(config: &Config, summary: &crate::manifest::SourceInfo) -> Result<Metadata> {
    let conforming = config
        .bounds
        .or(summary.bounds)
        .ok_or_else(|| Error::Config("no bounds: supply --bounds or readable inputs".to_string()))?;
    let cube = conforming.cubeify();

    let data_type = config.data_type.unwrap_or(DataType::Laszip);
    if config.absolute && data_type == DataType::Laszip {
        return Err(Error::Config(
            "laszip storage requires scaled coordinates; use --scale or another dataType"
                .to_string(),
        ));
    }

    let mut schema = schema::clear_stats(
        config
            .schema
            .clone()
            .unwrap_or_else(|| summary.schema.clone()),
    );
    if !config.no_origin_id && !schema::contains(&schema, "OriginId") {
        schema.push(schema::origin_dimension());
    }

    if config.absolute {
        for d in schema.iter_mut() {
            if matches!(d.name.as_str(), "X" | "Y" | "Z") {
                d.scale = None;
                d.offset = None;
            }
        }
    } else {
        let scale = config
            .scale
            .map(Scale::to_array)
            .or_else(|| {
                let x = schema::find(&schema, "X")?.scale?;
                let y = schema::find(&schema, "Y")?.scale?;
                let z = schema::find(&schema, "Z")?.scale?;
                Some([x, y, z])
            })
            .unwrap_or([0.01; 3]);
        let mid = cube.mid();
        let offset = [mid.x.round(), mid.y.round(), mid.z.round()];
        schema = schema::set_scale_offset(schema, ScaleOffset { scale, offset });
    }

    let span = config.span.unwrap_or(128);
    let srs = config
        .srs
        .clone()
        .unwrap_or_else(|| summary.srs.clone());

    let metadata = Metadata {
        bounds: cube,
        bounds_conforming: conforming,
        schema,
        srs,
        data_type,
        span,
        subset: config.subset,
        reprojection: config.reprojection.clone(),
        hierarchy_step: config.hierarchy_step.unwrap_or(0),
        min_node_size: config.min_node_size.unwrap_or(span * span),
        max_node_size: config.max_node_size.unwrap_or(span * span * 4),
        cache_size: config.cache_size.unwrap_or(64),
        sleep_count: config.sleep_count.unwrap_or(65_536 * 32),
        laz_14: config.laz_14,
    };
    metadata.validate()?;
    Ok(metadata)
}
