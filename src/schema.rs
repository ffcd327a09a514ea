//! Schema: the ordered dimension list carried by a build, with per
//! dimension statistics and the fixed-width row layout used by the raw
//! codecs.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::bounds::Point;
use crate::error::{Error, Result};

/// The storage class of a dimension, matching the EPT `"type"` field.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimKind {
    Signed,
    Unsigned,
    Float,
}

/// Per-dimension statistics, flattened into the dimension object in
/// `ept.json`.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct DimensionStats {
    pub count: u64,
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub variance: f64,
    /// Value enumeration, only tracked for classification-like dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<BTreeMap<String, u64>>,
}

impl DimensionStats {
    /// Merge two sample sets (parallel mean/variance combination).
    pub fn combine(&self, other: &DimensionStats) -> DimensionStats {
        if self.count == 0 {
            return other.clone();
        }
        if other.count == 0 {
            return self.clone();
        }

        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * n2 / n;
        let m1 = self.variance * n1;
        let m2 = other.variance * n2;
        let m = m1 + m2 + delta * delta * n1 * n2 / n;

        let counts = match (&self.counts, &other.counts) {
            (Some(a), Some(b)) => {
                let mut out = a.clone();
                for (k, v) in b {
                    *out.entry(k.clone()).or_insert(0) += v;
                }
                Some(out)
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        DimensionStats {
            count: self.count + other.count,
            minimum: self.minimum.min(other.minimum),
            maximum: self.maximum.max(other.maximum),
            mean,
            variance: m / n,
            counts,
        }
    }
}

/// One named attribute of the point schema.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DimKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(flatten)]
    pub stats: Option<DimensionStats>,
}

impl Dimension {
    pub fn new(name: &str, kind: DimKind, size: u64) -> Dimension {
        Dimension {
            name: name.to_string(),
            kind,
            size,
            scale: None,
            offset: None,
            stats: None,
        }
    }
}

/// An ordered list of dimensions. X/Y/Z always come first.
pub type Schema = Vec<Dimension>;

/// Scale/offset applied to X/Y/Z for signed-integer storage.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ScaleOffset {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl ScaleOffset {
    /// Scaled integer form of a coordinate, rounded to nearest.
    #[inline]
    pub fn forward(&self, p: &Point) -> [i32; 3] {
        [
            ((p.x - self.offset[0]) / self.scale[0]).round() as i32,
            ((p.y - self.offset[1]) / self.scale[1]).round() as i32,
            ((p.z - self.offset[2]) / self.scale[2]).round() as i32,
        ]
    }

    #[inline]
    pub fn back(&self, v: [i32; 3]) -> Point {
        Point::new(
            v[0] as f64 * self.scale[0] + self.offset[0],
            v[1] as f64 * self.scale[1] + self.offset[1],
            v[2] as f64 * self.scale[2] + self.offset[2],
        )
    }

    /// Clamp a point onto its representable grid position.
    #[inline]
    pub fn clip(&self, p: &Point) -> Point {
        self.back(self.forward(p))
    }
}

pub fn contains(schema: &Schema, name: &str) -> bool {
    schema.iter().any(|d| d.name == name)
}

pub fn find<'a>(schema: &'a Schema, name: &str) -> Option<&'a Dimension> {
    schema.iter().find(|d| d.name == name)
}

pub fn get_scale_offset(schema: &Schema) -> Option<ScaleOffset> {
    let x = find(schema, "X")?;
    let y = find(schema, "Y")?;
    let z = find(schema, "Z")?;
    match (x.scale, y.scale, z.scale) {
        (Some(sx), Some(sy), Some(sz)) => Some(ScaleOffset {
            scale: [sx, sy, sz],
            offset: [
                x.offset.unwrap_or(0.0),
                y.offset.unwrap_or(0.0),
                z.offset.unwrap_or(0.0),
            ],
        }),
        _ => None,
    }
}

pub fn set_scale_offset(mut schema: Schema, so: ScaleOffset) -> Schema {
    for (i, name) in ["X", "Y", "Z"].iter().enumerate() {
        if let Some(d) = schema.iter_mut().find(|d| &d.name == name) {
            d.kind = DimKind::Signed;
            d.size = 4;
            d.scale = Some(so.scale[i]);
            d.offset = Some(so.offset[i]);
        }
    }
    schema
}

pub fn clear_stats(mut schema: Schema) -> Schema {
    for d in schema.iter_mut() {
        d.stats = None;
    }
    schema
}

fn widen(a: &Dimension, b: &Dimension) -> (DimKind, u64) {
    use DimKind::*;
    let size = a.size.max(b.size);
    let kind = match (a.kind, b.kind) {
        (Float, _) | (_, Float) => Float,
        (Signed, _) | (_, Signed) => Signed,
        (Unsigned, Unsigned) => Unsigned,
    };
    // A signed type must gain a bit to cover the unsigned range.
    let size = if kind == Signed && (a.kind == Unsigned || b.kind == Unsigned) {
        let unsigned = if a.kind == Unsigned { a.size } else { b.size };
        size.max((unsigned * 2).min(8))
    } else {
        size
    };
    (kind, size)
}

/// Union of two schemas, widening types where an attribute appears in both.
/// With `with_stats`, per-dimension stats are merged as well.
pub fn combine(mut a: Schema, b: &Schema, with_stats: bool) -> Schema {
    for theirs in b {
        if let Some(ours) = a.iter_mut().find(|d| d.name == theirs.name) {
            let (kind, size) = widen(ours, theirs);
            ours.kind = kind;
            ours.size = size;
            match (ours.scale, theirs.scale) {
                // The finest resolution of any contributor wins.
                (Some(a), Some(b)) => ours.scale = Some(a.min(b)),
                (None, Some(b)) => {
                    ours.scale = Some(b);
                    ours.offset = theirs.offset;
                }
                _ => {}
            }
            if with_stats {
                ours.stats = match (&ours.stats, &theirs.stats) {
                    (Some(x), Some(y)) => Some(x.combine(y)),
                    (x, y) => x.clone().or_else(|| y.clone()),
                };
            }
        } else {
            let mut d = theirs.clone();
            if !with_stats {
                d.stats = None;
            }
            a.push(d);
        }
    }
    a
}

pub fn has_stats(schema: &Schema) -> bool {
    !schema.is_empty() && schema.iter().all(|d| d.stats.is_some())
}

/// The dimension list implied by a LAS point format, in LAS order.
pub fn from_las_format(format: &las::point::Format) -> Schema {
    let mut s: Schema = vec![
        Dimension::new("X", DimKind::Float, 8),
        Dimension::new("Y", DimKind::Float, 8),
        Dimension::new("Z", DimKind::Float, 8),
        Dimension::new("Intensity", DimKind::Unsigned, 2),
        Dimension::new("ReturnNumber", DimKind::Unsigned, 1),
        Dimension::new("NumberOfReturns", DimKind::Unsigned, 1),
        Dimension::new("ScanDirectionFlag", DimKind::Unsigned, 1),
        Dimension::new("EdgeOfFlightLine", DimKind::Unsigned, 1),
        Dimension::new("Classification", DimKind::Unsigned, 1),
        Dimension::new("ScanAngleRank", DimKind::Float, 4),
        Dimension::new("UserData", DimKind::Unsigned, 1),
        Dimension::new("PointSourceId", DimKind::Unsigned, 2),
    ];
    if format.has_gps_time {
        s.push(Dimension::new("GpsTime", DimKind::Float, 8));
    }
    if format.has_color {
        s.push(Dimension::new("Red", DimKind::Unsigned, 2));
        s.push(Dimension::new("Green", DimKind::Unsigned, 2));
        s.push(Dimension::new("Blue", DimKind::Unsigned, 2));
    }
    if format.has_nir {
        s.push(Dimension::new("Infrared", DimKind::Unsigned, 2));
    }
    s
}

pub fn origin_dimension() -> Dimension {
    Dimension::new("OriginId", DimKind::Unsigned, 4)
}

pub fn point_id_dimension() -> Dimension {
    Dimension::new("PointId", DimKind::Unsigned, 8)
}

/// Fixed byte offsets for one point row in schema order.
///
/// The row form is the unit of chunk storage and of the raw codecs: each
/// dimension as its declared width, little-endian, no padding.
#[derive(Clone, Debug)]
pub struct Layout {
    dims: Vec<(Dimension, usize)>,
    point_size: usize,
    so: Option<ScaleOffset>,
    x: usize,
    y: usize,
    z: usize,
}

impl Layout {
    pub fn new(schema: &Schema) -> Result<Layout> {
        let mut dims = Vec::with_capacity(schema.len());
        let mut offset = 0usize;
        let mut x = None;
        let mut y = None;
        let mut z = None;
        for d in schema {
            match d.name.as_str() {
                "X" => x = Some(offset),
                "Y" => y = Some(offset),
                "Z" => z = Some(offset),
                _ => {}
            }
            dims.push((d.clone(), offset));
            offset += d.size as usize;
        }
        let missing = || Error::Config("schema is missing X, Y, or Z".to_string());
        Ok(Layout {
            dims,
            point_size: offset,
            so: get_scale_offset(schema),
            x: x.ok_or_else(missing)?,
            y: y.ok_or_else(missing)?,
            z: z.ok_or_else(missing)?,
        })
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dims.iter().map(|(d, _)| d)
    }

    /// Dimensions with their byte offsets into a row.
    pub fn entries(&self) -> &[(Dimension, usize)] {
        &self.dims
    }

    pub fn scale_offset(&self) -> Option<ScaleOffset> {
        self.so
    }

    fn write_coord(&self, row: &mut [u8], at: usize, scaled: Option<i32>, value: f64) {
        match scaled {
            Some(v) => LittleEndian::write_i32(&mut row[at..at + 4], v),
            None => LittleEndian::write_f64(&mut row[at..at + 8], value),
        }
    }

    fn read_coord(&self, row: &[u8], at: usize, axis: usize) -> f64 {
        match &self.so {
            Some(so) => {
                LittleEndian::read_i32(&row[at..at + 4]) as f64 * so.scale[axis] + so.offset[axis]
            }
            None => LittleEndian::read_f64(&row[at..at + 8]),
        }
    }

    /// The native-coordinate position stored in a row.
    pub fn position(&self, row: &[u8]) -> Point {
        Point::new(
            self.read_coord(row, self.x, 0),
            self.read_coord(row, self.y, 1),
            self.read_coord(row, self.z, 2),
        )
    }

    /// Pack one parsed LAS point into `row`.
    ///
    /// `origin` and `point_id` fill the builder-assigned dimensions when
    /// the schema carries them.
    pub fn pack(&self, p: &las::Point, origin: u64, point_id: u64, row: &mut [u8]) {
        debug_assert_eq!(row.len(), self.point_size);
        let scaled = self
            .so
            .map(|so| so.forward(&Point::new(p.x, p.y, p.z)));
        for (d, at) in &self.dims {
            let at = *at;
            match d.name.as_str() {
                "X" => self.write_coord(row, at, scaled.map(|s| s[0]), p.x),
                "Y" => self.write_coord(row, at, scaled.map(|s| s[1]), p.y),
                "Z" => self.write_coord(row, at, scaled.map(|s| s[2]), p.z),
                "Intensity" => LittleEndian::write_u16(&mut row[at..at + 2], p.intensity),
                "ReturnNumber" => row[at] = p.return_number,
                "NumberOfReturns" => row[at] = p.number_of_returns,
                "ScanDirectionFlag" => {
                    row[at] = matches!(p.scan_direction, las::point::ScanDirection::LeftToRight)
                        as u8
                }
                "EdgeOfFlightLine" => row[at] = p.is_edge_of_flight_line as u8,
                "Classification" => row[at] = u8::from(p.classification),
                "ScanAngleRank" => {
                    LittleEndian::write_f32(&mut row[at..at + 4], p.scan_angle)
                }
                "UserData" => row[at] = p.user_data,
                "PointSourceId" => {
                    LittleEndian::write_u16(&mut row[at..at + 2], p.point_source_id)
                }
                "GpsTime" => {
                    LittleEndian::write_f64(&mut row[at..at + 8], p.gps_time.unwrap_or(0.0))
                }
                "Red" => LittleEndian::write_u16(
                    &mut row[at..at + 2],
                    p.color.map(|c| c.red).unwrap_or(0),
                ),
                "Green" => LittleEndian::write_u16(
                    &mut row[at..at + 2],
                    p.color.map(|c| c.green).unwrap_or(0),
                ),
                "Blue" => LittleEndian::write_u16(
                    &mut row[at..at + 2],
                    p.color.map(|c| c.blue).unwrap_or(0),
                ),
                "Infrared" => LittleEndian::write_u16(&mut row[at..at + 2], p.nir.unwrap_or(0)),
                "OriginId" => LittleEndian::write_u32(&mut row[at..at + 4], origin as u32),
                "PointId" => LittleEndian::write_u64(&mut row[at..at + 8], point_id),
                _ => {
                    // Unknown attribute: zero-fill its width.
                    row[at..at + d.size as usize].fill(0);
                }
            }
        }
    }

    /// Rebuild a LAS point from a row, for the laszip codec.
    pub fn unpack(&self, row: &[u8], has_color: bool) -> las::Point {
        let pos = self.position(row);
        let mut p = las::Point {
            x: pos.x,
            y: pos.y,
            z: pos.z,
            ..Default::default()
        };
        let mut color = las::Color::new(0, 0, 0);
        for (d, at) in &self.dims {
            let at = *at;
            match d.name.as_str() {
                "Intensity" => p.intensity = LittleEndian::read_u16(&row[at..at + 2]),
                "ReturnNumber" => p.return_number = row[at],
                "NumberOfReturns" => p.number_of_returns = row[at],
                "ScanDirectionFlag" => {
                    p.scan_direction = if row[at] != 0 {
                        las::point::ScanDirection::LeftToRight
                    } else {
                        las::point::ScanDirection::RightToLeft
                    }
                }
                "EdgeOfFlightLine" => p.is_edge_of_flight_line = row[at] != 0,
                "Classification" => {
                    p.classification = las::point::Classification::new(row[at])
                        .unwrap_or(las::point::Classification::Unclassified)
                }
                "ScanAngleRank" => p.scan_angle = LittleEndian::read_f32(&row[at..at + 4]),
                "UserData" => p.user_data = row[at],
                "PointSourceId" => {
                    p.point_source_id = LittleEndian::read_u16(&row[at..at + 2])
                }
                "GpsTime" => p.gps_time = Some(LittleEndian::read_f64(&row[at..at + 8])),
                "Red" => color.red = LittleEndian::read_u16(&row[at..at + 2]),
                "Green" => color.green = LittleEndian::read_u16(&row[at..at + 2]),
                "Blue" => color.blue = LittleEndian::read_u16(&row[at..at + 2]),
                "Infrared" => p.nir = Some(LittleEndian::read_u16(&row[at..at + 2])),
                _ => {}
            }
        }
        if has_color {
            p.color = Some(color);
        }
        p
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn xyz_schema(scaled: bool) -> Schema {
        let s = vec![
            Dimension::new("X", DimKind::Float, 8),
            Dimension::new("Y", DimKind::Float, 8),
            Dimension::new("Z", DimKind::Float, 8),
        ];
        if scaled {
            set_scale_offset(
                s,
                ScaleOffset {
                    scale: [0.01; 3],
                    offset: [0.0; 3],
                },
            )
        } else {
            s
        }
    }

    #[test]
    fn layout_sizes() {
        let layout = Layout::new(&xyz_schema(false)).unwrap();
        assert_eq!(layout.point_size(), 24);
        let layout = Layout::new(&xyz_schema(true)).unwrap();
        assert_eq!(layout.point_size(), 12);
    }

    #[test]
    fn pack_position_round_trip_scaled() {
        let layout = Layout::new(&xyz_schema(true)).unwrap();
        let p = las::Point {
            x: 12.344,
            y: 56.781,
            z: 90.125,
            ..Default::default()
        };
        let mut row = vec![0u8; layout.point_size()];
        layout.pack(&p, 0, 0, &mut row);
        let pos = layout.position(&row);
        assert!((pos.x - p.x).abs() <= 0.005);
        assert!((pos.y - p.y).abs() <= 0.005);
        assert!((pos.z - p.z).abs() <= 0.005);
    }

    #[test]
    fn combine_widens() {
        let a = vec![Dimension::new("Intensity", DimKind::Unsigned, 2)];
        let b = vec![
            Dimension::new("Intensity", DimKind::Signed, 2),
            Dimension::new("GpsTime", DimKind::Float, 8),
        ];
        let out = combine(a, &b, false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, DimKind::Signed);
        assert_eq!(out[0].size, 4);
        assert_eq!(out[1].name, "GpsTime");
    }

    #[test]
    fn stats_combine_matches_population() {
        // Two halves of 1..=8.
        let a = DimensionStats {
            count: 4,
            minimum: 1.0,
            maximum: 4.0,
            mean: 2.5,
            variance: 1.25,
            counts: None,
        };
        let b = DimensionStats {
            count: 4,
            minimum: 5.0,
            maximum: 8.0,
            mean: 6.5,
            variance: 1.25,
            counts: None,
        };
        let c = a.combine(&b);
        assert_eq!(c.count, 8);
        assert_eq!(c.minimum, 1.0);
        assert_eq!(c.maximum, 8.0);
        assert!((c.mean - 4.5).abs() < 1e-12);
        assert!((c.variance - 5.25).abs() < 1e-12);
    }

    #[test]
    fn scale_offset_clip_snaps_to_grid() {
        let so = ScaleOffset {
            scale: [0.1; 3],
            offset: [100.0; 3],
        };
        let p = so.clip(&Point::new(100.333, 100.349, 99.96));
        assert!((p.x - 100.3).abs() < 1e-9);
        assert!((p.y - 100.3).abs() < 1e-9);
        assert!((p.z - 100.0).abs() < 1e-9);
    }

    #[test]
    fn schema_json_field_names() {
        let mut d = Dimension::new("X", DimKind::Signed, 4);
        d.scale = Some(0.01);
        d.offset = Some(500.0);
        let j = serde_json::to_value(&d).unwrap();
        assert_eq!(j["type"], "signed");
        assert_eq!(j["size"], 4);
        assert_eq!(j["scale"], 0.01);
        assert!(j.get("stats").is_none());
    }
}
