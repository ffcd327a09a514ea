//! Spatial reference carried through a build.

use serde::{Deserialize, Serialize};

/// Spatial reference in the `ept.json` form: authority/code plus WKT.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Srs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub horizontal: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vertical: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wkt: String,
}

impl Srs {
    pub fn exists(&self) -> bool {
        !self.horizontal.is_empty() || !self.wkt.is_empty()
    }

    /// True when every field is empty; used to elide the record entirely.
    pub fn is_empty_record(&self) -> bool {
        self == &Srs::default()
    }

    /// Parse from an authority code string like `"EPSG:26915"` or
    /// `"EPSG:26915+5703"`.
    pub fn from_code(code: &str) -> Srs {
        let mut srs = Srs::default();
        let (authority, rest) = match code.split_once(':') {
            Some((a, r)) => (a.to_string(), r),
            None => ("EPSG".to_string(), code),
        };
        srs.authority = authority;
        match rest.split_once('+') {
            Some((h, v)) => {
                srs.horizontal = h.to_string();
                srs.vertical = v.to_string();
            }
            None => srs.horizontal = rest.to_string(),
        }
        if let Ok(code) = srs.horizontal.parse::<u16>() {
            if let Some(def) = crs_definitions::from_code(code) {
                srs.wkt = def.wkt.to_string();
            }
        }
        srs
    }

    /// Derive from a LAS header: EPSG codes from the GeoTiff or WKT VLRs,
    /// with the WKT text filled in from the definitions table if the file
    /// itself carries none.
    pub fn from_las_header(header: &las::Header) -> Srs {
        let mut srs = Srs::default();

        for vlr in header.vlrs().iter().chain(header.evlrs().iter()) {
            if vlr.user_id.eq_ignore_ascii_case("lasf_projection") && vlr.record_id == 2112 {
                let text: String = vlr
                    .data
                    .iter()
                    .take_while(|&&b| b != 0)
                    .map(|&b| b as char)
                    .collect();
                srs.wkt = text;
            }
        }

        if let Ok(epsg) = las_crs::parse_las_crs(header) {
            srs.authority = "EPSG".to_string();
            srs.horizontal = epsg.horizontal.to_string();
            if let Some(vertical) = epsg.vertical {
                srs.vertical = vertical.to_string();
            }
            if srs.wkt.is_empty() {
                if let Some(def) = crs_definitions::from_code(epsg.horizontal) {
                    srs.wkt = def.wkt.to_string();
                }
            }
        }

        srs
    }
}
