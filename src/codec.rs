//! Chunk payload encoding: dispatch on the configured data type to write
//! and read point buffers through laszip, zstandard, or raw binary.

use std::io::Cursor;

use las::{Builder, Transform, Vector};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::io;
use crate::metadata::{DataType, Metadata};
use crate::schema::Layout;

/// Dimension names with a native slot in a LAS point record; anything else
/// rides in the extra bytes.
const LAS_NATIVE: &[&str] = &[
    "X",
    "Y",
    "Z",
    "Intensity",
    "ReturnNumber",
    "NumberOfReturns",
    "ScanDirectionFlag",
    "EdgeOfFlightLine",
    "Classification",
    "ScanAngleRank",
    "UserData",
    "PointSourceId",
    "GpsTime",
    "Red",
    "Green",
    "Blue",
    "Infrared",
];

fn extra_entries(layout: &Layout) -> Vec<(usize, usize)> {
    // (row offset, size) for each non-native dimension, in schema order.
    layout
        .entries()
        .iter()
        .filter(|(d, _)| !LAS_NATIVE.contains(&d.name.as_str()))
        .map(|(d, at)| (*at, d.size as usize))
        .collect()
}

fn has(layout: &Layout, name: &str) -> bool {
    layout.dimensions().any(|d| d.name == name)
}

/// Write one chunk's rows as `<stem>.<ext>` under the data endpoint.
pub fn write(
    metadata: &Metadata,
    layout: &Layout,
    ep: &Endpoint,
    stem: &str,
    rows: &[u8],
) -> Result<()> {
    let data_type = metadata.data_type;
    let name = format!("{stem}.{}", data_type.extension());
    let encoded = match data_type {
        DataType::Binary => rows.to_vec(),
        DataType::Zstandard => {
            zstd::encode_all(rows, 0).map_err(|e| Error::Io(format!("zstd encode: {e}")))?
        }
        DataType::Laszip => encode_laszip(layout, metadata.laz_14, rows)?,
    };
    io::ensure_put(ep, &name, &encoded)
}

/// Read one chunk back into row form, verifying the stored point count.
pub fn read(
    metadata: &Metadata,
    layout: &Layout,
    ep: &Endpoint,
    stem: &str,
    expected: u64,
) -> Result<Vec<u8>> {
    let data_type = metadata.data_type;
    let name = format!("{stem}.{}", data_type.extension());
    let encoded = io::ensure_get(ep, &name)?;
    let rows = match data_type {
        DataType::Binary => encoded,
        DataType::Zstandard => zstd::decode_all(encoded.as_slice())
            .map_err(|e| Error::Decode(format!("{name}: {e}")))?,
        DataType::Laszip => decode_laszip(layout, &encoded, &name)?,
    };

    let size = layout.point_size();
    if rows.len() % size != 0 || (rows.len() / size) as u64 != expected {
        return Err(Error::Decode(format!(
            "{name}: expected {expected} points, found {}",
            rows.len() / size
        )));
    }
    Ok(rows)
}

fn las_format(layout: &Layout, laz_14: bool) -> Result<las::point::Format> {
    let gps = has(layout, "GpsTime");
    let color = has(layout, "Red");
    let nir = has(layout, "Infrared");

    let n = if nir {
        8
    } else if laz_14 {
        6 | (color as u8)
    } else {
        (gps as u8) | ((color as u8) << 1)
    };
    let mut format = las::point::Format::new(n)?;
    format.extra_bytes = extra_entries(layout)
        .iter()
        .map(|(_, size)| *size as u16)
        .sum();
    Ok(format)
}

fn las_header(layout: &Layout, laz_14: bool) -> Result<las::Header> {
    let format = las_format(layout, laz_14)?;
    let mut builder = if format.is_extended {
        Builder::from((1, 4))
    } else {
        Builder::from((1, 2))
    };
    builder.point_format = format;

    let so = layout.scale_offset();
    let transform = |axis: usize| Transform {
        scale: so.map(|so| so.scale[axis]).unwrap_or(1.0),
        offset: so.map(|so| so.offset[axis]).unwrap_or(0.0),
    };
    builder.transforms = Vector {
        x: transform(0),
        y: transform(1),
        z: transform(2),
    };

    Ok(builder.into_header()?)
}

fn encode_laszip(layout: &Layout, laz_14: bool, rows: &[u8]) -> Result<Vec<u8>> {
    let header = las_header(layout, laz_14)?;
    let format = *header.point_format();
    let extras = extra_entries(layout);

    let mut writer = las::Writer::new(Cursor::new(Vec::new()), header)?;
    for row in rows.chunks_exact(layout.point_size()) {
        let mut p = layout.unpack(row, format.has_color);
        if format.has_gps_time && p.gps_time.is_none() {
            p.gps_time = Some(0.0);
        }
        if format.extra_bytes > 0 {
            let mut extra = Vec::with_capacity(format.extra_bytes as usize);
            for (at, size) in &extras {
                extra.extend_from_slice(&row[*at..*at + *size]);
            }
            p.extra_bytes = extra;
        }
        writer.write_point(p)?;
    }
    writer.close()?;
    Ok(writer.into_inner()?.into_inner())
}

fn decode_laszip(layout: &Layout, encoded: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut reader = las::Reader::new(Cursor::new(encoded.to_vec()))
        .map_err(|e| Error::Decode(format!("{name}: {e}")))?;

    let size = layout.point_size();
    let extras = extra_entries(layout);
    let count = reader.header().number_of_points() as usize;
    let mut rows = vec![0u8; count * size];

    for (i, point) in reader.points().enumerate() {
        let point = point.map_err(|e| Error::Decode(format!("{name}: {e}")))?;
        if i >= count {
            return Err(Error::Decode(format!("{name}: more points than declared")));
        }
        let row = &mut rows[i * size..(i + 1) * size];
        layout.pack(&point, 0, 0, row);
        let mut taken = 0usize;
        for (at, dim_size) in &extras {
            if taken + dim_size <= point.extra_bytes.len() {
                row[*at..*at + *dim_size]
                    .copy_from_slice(&point.extra_bytes[taken..taken + dim_size]);
            }
            taken += dim_size;
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoints;
    use byteorder::ByteOrder;
    use crate::schema::{
        from_las_format, origin_dimension, point_id_dimension, set_scale_offset, ScaleOffset,
    };

    fn layout() -> Layout {
        let mut schema = from_las_format(&las::point::Format::default());
        schema.push(origin_dimension());
        schema.push(point_id_dimension());
        let schema = set_scale_offset(
            schema,
            ScaleOffset {
                scale: [0.01; 3],
                offset: [0.0; 3],
            },
        );
        Layout::new(&schema).unwrap()
    }

    fn rows(layout: &Layout, n: usize) -> Vec<u8> {
        let size = layout.point_size();
        let mut rows = vec![0u8; n * size];
        for i in 0..n {
            let p = las::Point {
                x: i as f64,
                y: (i * 2) as f64,
                z: (i * 3) as f64,
                intensity: i as u16,
                ..Default::default()
            };
            layout.pack(&p, 7, i as u64, &mut rows[i * size..(i + 1) * size]);
        }
        rows
    }

    fn metadata_for(data_type: DataType) -> Metadata {
        let mut m = crate::metadata::tests::test_metadata();
        m.data_type = data_type;
        m
    }

    fn round_trip(data_type: DataType) {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let m = metadata_for(data_type);
        let layout = layout();
        let data = rows(&layout, 10);

        write(&m, &layout, &ep.data, "0-0-0-0", &data).unwrap();
        let back = read(&m, &layout, &ep.data, "0-0-0-0", 10).unwrap();

        assert_eq!(back.len(), data.len());
        let size = layout.point_size();
        for (a, b) in data.chunks_exact(size).zip(back.chunks_exact(size)) {
            let pa = layout.position(a);
            let pb = layout.position(b);
            assert!((pa.x - pb.x).abs() <= 0.005);
            assert!((pa.y - pb.y).abs() <= 0.005);
            assert!((pa.z - pb.z).abs() <= 0.005);
        }
    }

    #[test]
    fn binary_round_trip() {
        round_trip(DataType::Binary);
    }

    #[test]
    fn zstandard_round_trip() {
        round_trip(DataType::Zstandard);
    }

    #[test]
    fn laszip_round_trip() {
        round_trip(DataType::Laszip);
    }

    #[test]
    fn laszip_preserves_extra_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let m = metadata_for(DataType::Laszip);
        let layout = layout();
        let data = rows(&layout, 4);

        write(&m, &layout, &ep.data, "1-0-0-0", &data).unwrap();
        let back = read(&m, &layout, &ep.data, "1-0-0-0", 4).unwrap();

        // OriginId and PointId ride in the extra bytes.
        let origin_at = layout
            .entries()
            .iter()
            .find(|(d, _)| d.name == "OriginId")
            .unwrap()
            .1;
        for (i, row) in back.chunks_exact(layout.point_size()).enumerate() {
            assert_eq!(
                byteorder::LittleEndian::read_u32(&row[origin_at..origin_at + 4]),
                7
            );
            let id_at = layout
                .entries()
                .iter()
                .find(|(d, _)| d.name == "PointId")
                .unwrap()
                .1;
            assert_eq!(
                byteorder::LittleEndian::read_u64(&row[id_at..id_at + 8]),
                i as u64
            );
        }
    }

    #[test]
    fn wrong_count_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints::local(dir.path(), None);
        let m = metadata_for(DataType::Binary);
        let layout = layout();
        let data = rows(&layout, 5);

        write(&m, &layout, &ep.data, "2-0-0-0", &data).unwrap();
        let err = read(&m, &layout, &ep.data, "2-0-0-0", 6).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
