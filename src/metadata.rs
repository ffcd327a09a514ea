//! Global build metadata: the parameters that define an EPT dataset and
//! the knobs that only matter while building one.

use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::srs::Srs;

pub const EPT_VERSION: &str = "1.0.0";

/// Chunk storage encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Laszip,
    Zstandard,
    Binary,
}

impl DataType {
    pub fn extension(&self) -> &'static str {
        match self {
            DataType::Laszip => "laz",
            DataType::Zstandard => "zst",
            DataType::Binary => "bin",
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<DataType> {
        match s {
            "laszip" => Ok(DataType::Laszip),
            "zstandard" => Ok(DataType::Zstandard),
            "binary" => Ok(DataType::Binary),
            other => Err(Error::Config(format!("unknown dataType: {other}"))),
        }
    }
}

/// Reprojection request, executed by an external pipeline stage.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Reprojection {
    #[serde(default, rename = "in", skip_serializing_if = "String::is_empty")]
    pub in_srs: String,
    #[serde(rename = "out")]
    pub out_srs: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hammer: bool,
}

/// One slab of a partitioned build: `id` in `1..=of`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Subset {
    pub id: u64,
    pub of: u64,
}

impl Subset {
    pub fn validate(&self) -> Result<()> {
        let of = self.of;
        // Powers of four only: each doubling step splits two more axes.
        let is_pow4 = of >= 4 && of.is_power_of_two() && of.trailing_zeros() % 2 == 0;
        if !is_pow4 {
            return Err(Error::Config(format!(
                "subset 'of' must be a power of 4 (got {of})"
            )));
        }
        if self.id == 0 || self.id > of {
            return Err(Error::Config(format!(
                "subset id must be in 1..={of} (got {})",
                self.id
            )));
        }
        Ok(())
    }

    pub fn splits(&self) -> u32 {
        self.of.trailing_zeros()
    }

    /// The slab of the cubic bounds covered by this subset: the cube is
    /// halved in alternating axes x,y,z,x,... with the big-endian bits of
    /// `id - 1` selecting the upper or lower half at each split.
    pub fn slab(&self, cube: &Bounds) -> Bounds {
        let mut b = *cube;
        let splits = self.splits();
        let bits = self.id - 1;
        for i in 0..splits {
            let up = (bits >> (splits - 1 - i)) & 1 == 1;
            let mid = b.mid();
            match i % 3 {
                0 => {
                    if up {
                        b.min_x = mid.x
                    } else {
                        b.max_x = mid.x
                    }
                }
                1 => {
                    if up {
                        b.min_y = mid.y
                    } else {
                        b.max_y = mid.y
                    }
                }
                _ => {
                    if up {
                        b.min_z = mid.z
                    } else {
                        b.max_z = mid.z
                    }
                }
            }
        }
        b
    }

    /// The depth at which subsets own disjoint subtrees: deep enough that
    /// every node at this depth falls entirely within one slab.
    pub fn shared_depth(&self) -> u32 {
        self.splits().div_ceil(3)
    }
}

/// All global state of a build.
#[derive(Clone, Debug)]
pub struct Metadata {
    /// Cubic indexing bounds.
    pub bounds: Bounds,
    /// Tight fit around the inputs.
    pub bounds_conforming: Bounds,
    pub schema: Schema,
    pub srs: Srs,
    pub data_type: DataType,
    pub span: u64,
    pub subset: Option<Subset>,
    pub reprojection: Option<Reprojection>,

    // Build-only knobs, persisted in ept-build.json.
    pub hierarchy_step: u64,
    pub min_node_size: u64,
    pub max_node_size: u64,
    pub cache_size: u64,
    pub sleep_count: u64,
    /// Force LAS 1.4 extended formats for laszip output.
    pub laz_14: bool,
}

impl Metadata {
    /// Number of initial Key steps: the root chunk's voxel grid already
    /// resolves `span` slabs per axis.
    pub fn start_depth(&self) -> u32 {
        self.span.trailing_zeros()
    }

    /// Artifact name postfix while a subset build is un-merged.
    pub fn postfix(&self) -> String {
        match &self.subset {
            Some(s) => format!("-{}", s.id),
            None => String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bounds.exists() || !self.bounds_conforming.exists() {
            return Err(Error::Config("no bounds: empty input?".to_string()));
        }
        if !self.span.is_power_of_two() || self.span < 2 {
            return Err(Error::Config(format!(
                "span must be a power of two >= 2 (got {})",
                self.span
            )));
        }
        if self.min_node_size >= self.max_node_size {
            return Err(Error::Config(
                "minNodeSize must be less than maxNodeSize".to_string(),
            ));
        }
        if let Some(s) = &self.subset {
            s.validate()?;
        }
        Ok(())
    }
}

/// The `ept.json` document, field names per the EPT specification.
#[derive(Serialize, Deserialize, Debug)]
pub struct EptFile {
    pub bounds: Bounds,
    #[serde(rename = "boundsConforming")]
    pub bounds_conforming: Bounds,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(rename = "hierarchyType")]
    pub hierarchy_type: String,
    pub points: u64,
    pub schema: Schema,
    pub span: u64,
    pub srs: Srs,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
}

/// The `ept-build.json` document: parameters a continuation or merge needs
/// that are not part of the EPT format itself.
#[derive(Serialize, Deserialize, Debug)]
pub struct EptBuildFile {
    #[serde(rename = "hierarchyStep")]
    pub hierarchy_step: u64,
    #[serde(rename = "minNodeSize")]
    pub min_node_size: u64,
    #[serde(rename = "maxNodeSize")]
    pub max_node_size: u64,
    #[serde(rename = "cacheSize")]
    pub cache_size: u64,
    #[serde(rename = "sleepCount")]
    pub sleep_count: u64,
    #[serde(default, rename = "laz_14", skip_serializing_if = "std::ops::Not::not")]
    pub laz_14: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprojection: Option<Reprojection>,
    pub software: String,
    pub version: String,
}

impl Metadata {
    pub fn to_ept_file(&self, points: u64) -> EptFile {
        EptFile {
            bounds: self.bounds,
            bounds_conforming: self.bounds_conforming,
            data_type: self.data_type,
            hierarchy_type: "json".to_string(),
            points,
            schema: self.schema.clone(),
            span: self.span,
            srs: self.srs.clone(),
            version: EPT_VERSION.to_string(),
            subset: self.subset,
        }
    }

    pub fn to_build_file(&self) -> EptBuildFile {
        EptBuildFile {
            hierarchy_step: self.hierarchy_step,
            min_node_size: self.min_node_size,
            max_node_size: self.max_node_size,
            cache_size: self.cache_size,
            sleep_count: self.sleep_count,
            laz_14: self.laz_14,
            reprojection: self.reprojection.clone(),
            software: "ept-rs".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn from_files(ept: EptFile, build: EptBuildFile) -> Metadata {
        Metadata {
            bounds: ept.bounds,
            bounds_conforming: ept.bounds_conforming,
            schema: ept.schema,
            srs: ept.srs,
            data_type: ept.data_type,
            span: ept.span,
            subset: ept.subset,
            reprojection: build.reprojection,
            hierarchy_step: build.hierarchy_step,
            min_node_size: build.min_node_size,
            max_node_size: build.max_node_size,
            cache_size: build.cache_size,
            sleep_count: build.sleep_count,
            laz_14: build.laz_14,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn cube() -> Bounds {
        Bounds::new(0.0, 0.0, 0.0, 8.0, 8.0, 8.0)
    }

    #[test]
    fn subset_validation() {
        assert!(Subset { id: 1, of: 4 }.validate().is_ok());
        assert!(Subset { id: 16, of: 16 }.validate().is_ok());
        assert!(Subset { id: 1, of: 8 }.validate().is_err());
        assert!(Subset { id: 0, of: 4 }.validate().is_err());
        assert!(Subset { id: 5, of: 4 }.validate().is_err());
    }

    #[test]
    fn four_slabs_tile_the_cube() {
        let slabs: Vec<Bounds> = (1..=4)
            .map(|id| Subset { id, of: 4 }.slab(&cube()))
            .collect();

        // x split first, then y; z untouched.
        assert_eq!(slabs[0], Bounds::new(0.0, 0.0, 0.0, 4.0, 4.0, 8.0));
        assert_eq!(slabs[1], Bounds::new(0.0, 4.0, 0.0, 4.0, 8.0, 8.0));
        assert_eq!(slabs[2], Bounds::new(4.0, 0.0, 0.0, 8.0, 4.0, 8.0));
        assert_eq!(slabs[3], Bounds::new(4.0, 4.0, 0.0, 8.0, 8.0, 8.0));
    }

    #[test]
    fn sixteen_slabs_tile_without_overlap() {
        use crate::bounds::Point;

        // Probe a lattice of points: each must fall in exactly one slab
        // under half-open membership.
        let slabs: Vec<Bounds> = (1..=16)
            .map(|id| Subset { id, of: 16 }.slab(&cube()))
            .collect();

        for ix in 0..8 {
            for iy in 0..8 {
                for iz in 0..8 {
                    let p = Point::new(ix as f64, iy as f64, iz as f64);
                    let owners = slabs.iter().filter(|s| s.contains(&p)).count();
                    assert_eq!(owners, 1, "point {p:?} owned by {owners} slabs");
                }
            }
        }
    }

    #[test]
    fn slab_boundary_points_go_up() {
        // The cube midpoint belongs to the all-upper slab only.
        let mid = cube().mid();
        let mid = crate::bounds::Point::new(mid.x, mid.y, mid.z);
        for id in 1..=4u64 {
            let slab = Subset { id, of: 4 }.slab(&cube());
            assert_eq!(slab.contains(&mid), id == 4);
        }
    }

    #[test]
    fn shared_depths() {
        assert_eq!(Subset { id: 1, of: 4 }.shared_depth(), 1);
        assert_eq!(Subset { id: 1, of: 16 }.shared_depth(), 2);
        assert_eq!(Subset { id: 1, of: 64 }.shared_depth(), 2);
        assert_eq!(Subset { id: 1, of: 256 }.shared_depth(), 3);
    }

    #[test]
    fn postfix_forms() {
        let mut m = test_metadata();
        assert_eq!(m.postfix(), "");
        m.subset = Some(Subset { id: 3, of: 4 });
        assert_eq!(m.postfix(), "-3");
    }

    pub(crate) fn test_metadata() -> Metadata {
        Metadata {
            bounds: cube(),
            bounds_conforming: cube(),
            schema: crate::schema::from_las_format(&las::point::Format::default()),
            srs: Srs::default(),
            data_type: DataType::Binary,
            span: 128,
            subset: None,
            reprojection: None,
            hierarchy_step: 0,
            min_node_size: 128 * 128,
            max_node_size: 128 * 128 * 4,
            cache_size: 64,
            sleep_count: 65_536 * 32,
            laz_14: false,
        }
    }
}
