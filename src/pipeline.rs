//! The point pipeline: a typed stage list executed against LAS/LAZ input,
//! with unknown stages passed through to an external executor (and
//! rejected by the built-in one).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bounds::{Bounds, Point};
use crate::error::{Error, Result};
use crate::metadata::Reprojection;
use crate::schema::{self, DimensionStats, Schema};
use crate::srs::Srs;

/// One pipeline stage with typed parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Stage {
    /// Source reader; the filename is parameterized per input.
    Read {
        #[serde(default)]
        filename: String,
    },
    /// Coordinate reprojection, delegated to an external executor.
    Reproject(Reprojection),
    /// Constant assignment to one dimension.
    Assign { dimension: String, value: f64 },
    /// Per-dimension statistics, restricted to points within `clip`.
    Stats {
        #[serde(default)]
        enumerate: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clip: Option<Bounds>,
    },
    /// Spatial crop.
    Filter { bounds: Bounds },
    /// Anything else: forwarded verbatim to an external executor.
    Other {
        name: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

/// An ordered stage list. The template form has an unparameterized
/// reader; [Pipeline::with_filename] specializes it per input.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn reader_only() -> Pipeline {
        Pipeline {
            stages: vec![Stage::Read {
                filename: String::new(),
            }],
        }
    }

    pub fn with_filename(&self, path: &str) -> Pipeline {
        let mut out = self.clone();
        match out.stages.first_mut() {
            Some(Stage::Read { filename }) => *filename = path.to_string(),
            _ => out.stages.insert(
                0,
                Stage::Read {
                    filename: path.to_string(),
                },
            ),
        }
        out
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn has_stats(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Stats { .. }))
    }

    fn filename(&self) -> Result<&str> {
        match self.stages.first() {
            Some(Stage::Read { filename }) if !filename.is_empty() => Ok(filename),
            _ => Err(Error::Input("pipeline has no reader filename".to_string())),
        }
    }
}

fn las_value(p: &las::Point, name: &str) -> Option<f64> {
    Some(match name {
        "X" => p.x,
        "Y" => p.y,
        "Z" => p.z,
        "Intensity" => p.intensity as f64,
        "ReturnNumber" => p.return_number as f64,
        "NumberOfReturns" => p.number_of_returns as f64,
        "ScanDirectionFlag" => {
            matches!(p.scan_direction, las::point::ScanDirection::LeftToRight) as u8 as f64
        }
        "EdgeOfFlightLine" => p.is_edge_of_flight_line as u8 as f64,
        "Classification" => u8::from(p.classification) as f64,
        "ScanAngleRank" => p.scan_angle as f64,
        "UserData" => p.user_data as f64,
        "PointSourceId" => p.point_source_id as f64,
        "GpsTime" => p.gps_time?,
        "Red" => p.color?.red as f64,
        "Green" => p.color?.green as f64,
        "Blue" => p.color?.blue as f64,
        "Infrared" => p.nir? as f64,
        _ => return None,
    })
}

fn assign(p: &mut las::Point, dimension: &str, value: f64) {
    match dimension {
        "Intensity" => p.intensity = value as u16,
        "Classification" => {
            if let Ok(c) = las::point::Classification::new(value as u8) {
                p.classification = c;
            }
        }
        "UserData" => p.user_data = value as u8,
        "PointSourceId" => p.point_source_id = value as u16,
        "GpsTime" => p.gps_time = Some(value),
        // Builder-assigned dimensions (OriginId, PointId) are written at
        // pack time; nothing to do on the parsed point.
        _ => {}
    }
}

#[derive(Debug)]
struct Welford {
    count: u64,
    minimum: f64,
    maximum: f64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn new() -> Welford {
        Welford {
            count: 0,
            minimum: f64::INFINITY,
            maximum: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn push(&mut self, v: f64) {
        self.count += 1;
        self.minimum = self.minimum.min(v);
        self.maximum = self.maximum.max(v);
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (v - self.mean);
    }
}

/// Streaming per-dimension statistics over the points a pipeline run
/// delivers.
#[derive(Debug)]
pub struct StatsAccumulator {
    dims: Vec<(String, Welford)>,
    enumerate: Vec<String>,
    enums: BTreeMap<String, BTreeMap<String, u64>>,
    clip: Option<Bounds>,
}

impl StatsAccumulator {
    pub fn new(schema: &Schema, enumerate: &[String], clip: Option<Bounds>) -> StatsAccumulator {
        StatsAccumulator {
            dims: schema
                .iter()
                .map(|d| (d.name.clone(), Welford::new()))
                .collect(),
            enumerate: enumerate.to_vec(),
            enums: enumerate
                .iter()
                .map(|n| (n.clone(), BTreeMap::new()))
                .collect(),
            clip,
        }
    }

    fn push(&mut self, p: &las::Point) {
        if let Some(clip) = &self.clip {
            // Half-open in x/y so a point on a shared slab face counts
            // toward exactly one side.
            if p.x < clip.min_x || p.x >= clip.max_x || p.y < clip.min_y || p.y >= clip.max_y {
                return;
            }
        }
        for (name, w) in self.dims.iter_mut() {
            if let Some(v) = las_value(p, name) {
                w.push(v);
            }
        }
        for name in &self.enumerate {
            if let Some(v) = las_value(p, name) {
                *self
                    .enums
                    .get_mut(name)
                    .unwrap()
                    .entry(format!("{}", v as i64))
                    .or_insert(0) += 1;
            }
        }
    }

    /// Fold the accumulated values into a schema's per-dimension stats.
    pub fn harvest(mut self, schema: &mut Schema) {
        for d in schema.iter_mut() {
            let Some((_, w)) = self.dims.iter().find(|(n, _)| n == &d.name) else {
                continue;
            };
            if w.count == 0 {
                d.stats = Some(DimensionStats::default());
                continue;
            }
            d.stats = Some(DimensionStats {
                count: w.count,
                minimum: w.minimum,
                maximum: w.maximum,
                mean: w.mean,
                variance: w.m2 / w.count as f64,
                counts: self.enums.remove(&d.name).filter(|m| !m.is_empty()),
            });
        }
    }
}

/// Header-level inspection of one input, no point records read.
#[derive(Clone, Debug)]
pub struct Preview {
    pub points: u64,
    pub bounds: Bounds,
    pub schema: Schema,
    pub srs: Srs,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub metadata: serde_json::Value,
}

pub fn preview<P: AsRef<Path>>(path: P) -> Result<Preview> {
    let reader = las::Reader::from_path(&path)
        .map_err(|e| Error::ShallowInfo(format!("{}: {e}", path.as_ref().display())))?;
    let header = reader.header();

    let b = header.bounds();
    let bounds = Bounds::new(b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z);
    if !bounds.exists() && header.number_of_points() > 0 {
        return Err(Error::ShallowInfo(format!(
            "{}: header carries no bounds",
            path.as_ref().display()
        )));
    }

    let t = header.transforms();
    let metadata = serde_json::json!({
        "software": header.generating_software(),
        "system": header.system_identifier(),
        "version": header.version().to_string(),
        "pointFormat": header.point_format().to_u8().unwrap_or(0),
    });

    Ok(Preview {
        points: header.number_of_points(),
        bounds,
        schema: schema::from_las_format(header.point_format()),
        srs: Srs::from_las_header(header),
        scale: [t.x.scale, t.y.scale, t.z.scale],
        offset: [t.x.offset, t.y.offset, t.z.offset],
        metadata,
    })
}

/// Full inspection of one input: walk every point record for exact
/// bounds, an exact count, and per-dimension statistics. Headers lie
/// often enough that this is worth the read when requested.
pub fn deep_preview<P: AsRef<Path>>(path: P) -> Result<Preview> {
    let mut out = preview(&path)?;

    let mut reader = las::Reader::from_path(&path)
        .map_err(|e| Error::ShallowInfo(format!("{}: {e}", path.as_ref().display())))?;

    let mut stats = StatsAccumulator::new(
        &out.schema,
        &["Classification".to_string()],
        None,
    );
    let mut bounds = Bounds::default();
    let mut count = 0u64;

    for point in reader.points() {
        let point = point
            .map_err(|e| Error::ShallowInfo(format!("{}: {e}", path.as_ref().display())))?;
        bounds.expand_xyz(point.x, point.y, point.z);
        stats.push(&point);
        count += 1;
    }

    out.points = count;
    if bounds.exists() {
        out.bounds = bounds;
    }
    stats.harvest(&mut out.schema);
    Ok(out)
}

/// Run a pipeline against its reader, delivering points in batches of
/// `capacity`. Returns the stats accumulator if the pipeline carried a
/// stats stage.
pub fn execute<F>(
    pipeline: &Pipeline,
    schema: &Schema,
    capacity: usize,
    mut on_batch: F,
) -> Result<Option<StatsAccumulator>>
where
    F: FnMut(&[las::Point]) -> Result<()>,
{
    let path = pipeline.filename()?;
    let mut reader = las::Reader::from_path(path)
        .map_err(|e| Error::Input(format!("{path}: {e}")))?;

    // Validate the non-reader stages up front so an unsupported pipeline
    // fails before any points move.
    let mut stats = None;
    for stage in &pipeline.stages[1..] {
        match stage {
            Stage::Read { .. } => {
                return Err(Error::Input("pipeline has multiple readers".to_string()))
            }
            Stage::Reproject(r) if !r.in_srs.is_empty() && r.in_srs == r.out_srs => {}
            Stage::Reproject(r) => {
                return Err(Error::Input(format!(
                    "reprojection to {} requires an external pipeline executor",
                    r.out_srs
                )))
            }
            Stage::Other { name, .. } => {
                return Err(Error::Input(format!(
                    "stage {name} requires an external pipeline executor"
                )))
            }
            Stage::Stats { enumerate, clip } => {
                stats = Some(StatsAccumulator::new(schema, enumerate, *clip));
            }
            Stage::Assign { .. } | Stage::Filter { .. } => {}
        }
    }

    let mut batch: Vec<las::Point> = Vec::with_capacity(capacity);
    for point in reader.points() {
        let mut point = point.map_err(|e| Error::Input(format!("{path}: {e}")))?;

        let mut keep = true;
        for stage in &pipeline.stages[1..] {
            match stage {
                Stage::Assign { dimension, value } => assign(&mut point, dimension, *value),
                Stage::Filter { bounds } => {
                    if !bounds.contains(&Point::new(point.x, point.y, point.z)) {
                        keep = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !keep {
            continue;
        }

        if let Some(stats) = stats.as_mut() {
            stats.push(&point);
        }

        batch.push(point);
        if batch.len() == capacity {
            on_batch(&batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        on_batch(&batch)?;
    }

    Ok(stats)
}
