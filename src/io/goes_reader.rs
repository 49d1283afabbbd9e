use crate::types::{
    ChannelImage, ChannelSet, GeosProjection, GvError, GvResult, RegionOfInterest, SourceUnit,
    SweepAxis,
};
use chrono::{DateTime, Utc};
use gdal::{Dataset, Metadata};
use ndarray::{Array1, Array2};
use std::io::{Read, Write};
use std::path::Path;

/// ABI variable names of the GeoColor channels
pub const BLUE_VAR: &str = "CMI_C01";
pub const RED_VAR: &str = "CMI_C02";
pub const NIR_VAR: &str = "CMI_C03";
pub const CLEAN_IR_VAR: &str = "CMI_C13";
const IR_RANGE_ATTR: &str = "max_brightness_temperature_C13#valid_range";
const PROJECTION_VAR: &str = "goes_imager_projection";

/// Global and projection attributes of an ABI multi-band file
#[derive(Debug, Clone, PartialEq)]
pub struct GoesHeader {
    pub platform: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub projection: GeosProjection,
    /// Scan-angle encoding of the x axis: radians = index * scale + offset
    pub x_scale: f64,
    pub x_offset: f64,
    pub y_scale: f64,
    pub y_offset: f64,
    pub ir_valid_range: (f32, f32),
}

impl GoesHeader {
    /// Parse from GDAL-style `variable#attribute` metadata items
    pub fn from_metadata<F>(lookup: F) -> GvResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| -> GvResult<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .ok_or_else(|| GvError::MalformedInput(format!("Missing attribute {}", key)))
        };
        let number = |key: &str| -> GvResult<f64> {
            let raw = text(key)?;
            parse_numbers(&raw)
                .and_then(|v| v.first().copied())
                .ok_or_else(|| GvError::MalformedInput(format!("Attribute {} is not numeric: {}", key, raw)))
        };
        let time = |key: &str| -> GvResult<DateTime<Utc>> {
            let raw = text(key)?;
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| GvError::MalformedInput(format!("Attribute {} is not a timestamp ({}): {}", key, raw, e)))
        };
        let proj = |attr: &str| number(&format!("{}#{}", PROJECTION_VAR, attr));

        let sweep = match text(&format!("{}#sweep_angle_axis", PROJECTION_VAR))?.as_str() {
            "x" => SweepAxis::X,
            "y" => SweepAxis::Y,
            other => {
                return Err(GvError::MalformedInput(format!(
                    "Unknown sweep_angle_axis '{}'",
                    other
                )))
            }
        };

        let ir_raw = text(IR_RANGE_ATTR)?;
        let ir_valid_range = match parse_numbers(&ir_raw).as_deref() {
            Some([lo, hi]) => (*lo as f32, *hi as f32),
            _ => {
                return Err(GvError::MalformedInput(format!(
                    "Attribute {} must hold two numbers, got {}",
                    IR_RANGE_ATTR, ir_raw
                )))
            }
        };

        Ok(Self {
            platform: text("NC_GLOBAL#platform_ID")?,
            start_time: time("NC_GLOBAL#time_coverage_start")?,
            end_time: time("NC_GLOBAL#time_coverage_end")?,
            projection: GeosProjection {
                semi_major_axis: proj("semi_major_axis")?,
                semi_minor_axis: proj("semi_minor_axis")?,
                inverse_flattening: proj("inverse_flattening")?,
                longitude_of_origin: proj("longitude_of_projection_origin")?,
                perspective_height: proj("perspective_point_height")?,
                sweep,
            },
            x_scale: number("x#scale_factor")?,
            x_offset: number("x#add_offset")?,
            y_scale: number("y#scale_factor")?,
            y_offset: number("y#add_offset")?,
            ir_valid_range,
        })
    }

    /// Native x coordinates in meters for an axis of `len` samples
    pub fn x_axis(&self, len: usize) -> Array1<f64> {
        native_axis(len, self.x_scale, self.x_offset, self.projection.perspective_height)
    }

    /// Native y coordinates in meters for an axis of `len` samples
    pub fn y_axis(&self, len: usize) -> Array1<f64> {
        native_axis(len, self.y_scale, self.y_offset, self.projection.perspective_height)
    }
}

/// Parse `6378137`, `{180,360}` or `180, 360` style attribute values
fn parse_numbers(raw: &str) -> Option<Vec<f64>> {
    let inner = raw.trim().trim_start_matches('{').trim_end_matches('}');
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok())
        .collect()
}

/// Scan-angle axis scaled to meters
pub fn native_axis(len: usize, scale: f64, offset: f64, height: f64) -> Array1<f64> {
    Array1::from_iter((0..len).map(|i| (i as f64 * scale + offset) * height))
}

/// Inclusive index range of the samples lying within [lo, hi]
pub fn subset_range(axis: &Array1<f64>, lo: f64, hi: f64) -> Option<(usize, usize)> {
    let mut inside = axis
        .iter()
        .enumerate()
        .filter(|(_, &v)| v >= lo && v <= hi)
        .map(|(i, _)| i);
    let first = inside.next()?;
    let last = inside.last().unwrap_or(first);
    Some((first, last))
}

/// Pixel window of the native grid covering a region of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeWindow {
    pub col_start: usize,
    pub col_end: usize,
    pub row_start: usize,
    pub row_end: usize,
}

impl NativeWindow {
    pub fn cols(&self) -> usize {
        self.col_end - self.col_start + 1
    }

    pub fn rows(&self) -> usize {
        self.row_end - self.row_start + 1
    }
}

/// Bounding window of the ROI corners on the native axes
pub fn roi_window(
    projection: &GeosProjection,
    x: &Array1<f64>,
    y: &Array1<f64>,
    roi: &RegionOfInterest,
) -> GvResult<NativeWindow> {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for (lon, lat) in roi.subset.corners() {
        let (px, py) = projection.forward(lon, lat).ok_or_else(|| {
            GvError::MalformedInput(format!(
                "ROI corner ({}, {}) is not visible from sub-satellite longitude {}",
                lon, lat, projection.longitude_of_origin
            ))
        })?;
        min_x = min_x.min(px);
        max_x = max_x.max(px);
        min_y = min_y.min(py);
        max_y = max_y.max(py);
    }

    let (col_start, col_end) = subset_range(x, min_x, max_x)
        .ok_or_else(|| GvError::MalformedInput("ROI does not intersect the native x axis".to_string()))?;
    let (row_start, row_end) = subset_range(y, min_y, max_y)
        .ok_or_else(|| GvError::MalformedInput("ROI does not intersect the native y axis".to_string()))?;

    Ok(NativeWindow {
        col_start,
        col_end,
        row_start,
        row_end,
    })
}

/// Convert stored counts to physical values: fill samples become NaN,
/// everything else is `raw * scale + offset`
pub fn to_physical(
    raw: Vec<f32>,
    shape: (usize, usize),
    fill: Option<f64>,
    scale: f32,
    offset: f32,
) -> GvResult<ChannelImage> {
    let data = raw
        .into_iter()
        .map(|v| match fill {
            Some(f) if v == f as f32 => f32::NAN,
            _ => v * scale + offset,
        })
        .collect();
    Array2::from_shape_vec(shape, data)
        .map_err(|e| GvError::MalformedInput(format!("Channel data does not fit {:?}: {}", shape, e)))
}

/// Reader for GOES-R ABI multi-band (MCMIP) netCDF files
pub struct GoesReader;

impl GoesReader {
    /// Decode a sensor file from a byte stream.
    ///
    /// netCDF-4 needs random access, so the stream is spooled to a temporary
    /// file that lives only for the duration of the decode.
    pub fn decode<R: Read>(reader: &mut R, roi: &RegionOfInterest) -> GvResult<SourceUnit> {
        let mut spool = tempfile::Builder::new()
            .prefix("goes_")
            .suffix(".nc")
            .tempfile()?;
        let bytes = std::io::copy(reader, &mut spool)?;
        spool.flush()?;
        log::debug!("Spooled {} bytes to {}", bytes, spool.path().display());

        Self::open(spool.path(), roi)
    }

    /// Decode a sensor file already on disk
    pub fn open<P: AsRef<Path>>(path: P, roi: &RegionOfInterest) -> GvResult<SourceUnit> {
        let path = path.as_ref();
        log::info!("Reading ABI file: {}", path.display());

        let root = Dataset::open(path)?;
        let header = GoesHeader::from_metadata(|key| root.metadata_item(key, ""))?;
        log::debug!(
            "Platform {} scan {} - {}, lon_0 {}",
            header.platform,
            header.start_time,
            header.end_time,
            header.projection.longitude_of_origin
        );

        let red_ds = Self::open_variable(path, RED_VAR)?;
        let (width, height) = red_ds.raster_size();
        let x = header.x_axis(width);
        let y = header.y_axis(height);
        let window = roi_window(&header.projection, &x, &y, roi)?;
        log::debug!("Native window {:?} of {}x{}", window, width, height);

        let red = Self::read_window(&root, &red_ds, RED_VAR, &window)?;
        let blue = Self::read_window(&root, &Self::open_variable(path, BLUE_VAR)?, BLUE_VAR, &window)?;
        let nir = Self::read_window(&root, &Self::open_variable(path, NIR_VAR)?, NIR_VAR, &window)?;
        let clean_ir = Self::read_window(&root, &Self::open_variable(path, CLEAN_IR_VAR)?, CLEAN_IR_VAR, &window)?;

        Ok(SourceUnit {
            platform: header.platform,
            start_time: header.start_time,
            end_time: header.end_time,
            projection: header.projection,
            x: x.slice(ndarray::s![window.col_start..=window.col_end]).to_owned(),
            y: y.slice(ndarray::s![window.row_start..=window.row_end]).to_owned(),
            channels: ChannelSet {
                blue,
                red,
                nir,
                clean_ir,
                ir_valid_range: header.ir_valid_range,
            },
        })
    }

    fn open_variable(path: &Path, var: &str) -> GvResult<Dataset> {
        let name = format!("NETCDF:\"{}\":{}", path.display(), var);
        Dataset::open(&name).map_err(|e| {
            GvError::MalformedInput(format!("Missing channel {} in {}: {}", var, path.display(), e))
        })
    }

    /// Read one channel over the window, applying fill masking and scaling
    fn read_window(
        root: &Dataset,
        dataset: &Dataset,
        var: &str,
        window: &NativeWindow,
    ) -> GvResult<ChannelImage> {
        let band = dataset.rasterband(1)?;
        let (cols, rows) = (window.cols(), window.rows());
        let buffer = band.read_as::<f32>(
            (window.col_start as isize, window.row_start as isize),
            (cols, rows),
            (cols, rows),
            None,
        )?;

        let attr = |name: &str| {
            root.metadata_item(&format!("{}#{}", var, name), "")
                .and_then(|v| parse_numbers(&v))
                .and_then(|v| v.first().copied())
        };
        let fill = band.no_data_value().or_else(|| attr("_FillValue"));
        let scale = attr("scale_factor").unwrap_or(1.0) as f32;
        let offset = attr("add_offset").unwrap_or(0.0) as f32;

        to_physical(buffer.data, (rows, cols), fill, scale, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoBox;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn conus_metadata() -> HashMap<String, String> {
        [
            ("NC_GLOBAL#platform_ID", "G16"),
            ("NC_GLOBAL#time_coverage_start", "2022-10-28T18:01:17.3Z"),
            ("NC_GLOBAL#time_coverage_end", "2022-10-28T18:03:54.6Z"),
            ("goes_imager_projection#semi_major_axis", "6378137"),
            ("goes_imager_projection#semi_minor_axis", "6356752.31414"),
            ("goes_imager_projection#inverse_flattening", "298.2572221"),
            ("goes_imager_projection#longitude_of_projection_origin", "-75"),
            ("goes_imager_projection#perspective_point_height", "35786023"),
            ("goes_imager_projection#sweep_angle_axis", "x"),
            ("x#scale_factor", "5.6e-05"),
            ("x#add_offset", "-0.101332"),
            ("y#scale_factor", "-5.6e-05"),
            ("y#add_offset", "0.128212"),
            ("max_brightness_temperature_C13#valid_range", "{180,360}"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_header_from_metadata() {
        let meta = conus_metadata();
        let header = GoesHeader::from_metadata(|k| meta.get(k).cloned()).unwrap();
        assert_eq!(header.platform, "G16");
        assert_eq!(header.projection.sweep, SweepAxis::X);
        assert_eq!(header.projection.longitude_of_origin, -75.0);
        assert_eq!(header.ir_valid_range, (180.0, 360.0));
        assert_eq!(
            header.start_time,
            Utc.with_ymd_and_hms(2022, 10, 28, 18, 1, 17).unwrap() + chrono::Duration::milliseconds(300)
        );
    }

    #[test]
    fn test_missing_projection_field_is_malformed() {
        let mut meta = conus_metadata();
        meta.remove("goes_imager_projection#perspective_point_height");
        let err = GoesHeader::from_metadata(|k| meta.get(k).cloned()).unwrap_err();
        assert!(matches!(err, GvError::MalformedInput(_)));

        let mut meta = conus_metadata();
        meta.insert("max_brightness_temperature_C13#valid_range".into(), "{180}".into());
        assert!(GoesHeader::from_metadata(|k| meta.get(k).cloned()).is_err());
    }

    #[test]
    fn test_axes_scaled_by_perspective_height() {
        let meta = conus_metadata();
        let header = GoesHeader::from_metadata(|k| meta.get(k).cloned()).unwrap();
        let x = header.x_axis(5000);
        let y = header.y_axis(3000);
        assert_abs_diff_eq!(x[0], -0.101332 * 35_786_023.0, epsilon = 1e-3);
        assert_abs_diff_eq!(x[1] - x[0], 5.6e-05 * 35_786_023.0, epsilon = 1e-3);
        assert!(y[1] < y[0]);
    }

    #[test]
    fn test_subset_range_inclusive() {
        let axis = Array1::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(subset_range(&axis, 1.0, 3.5), Some((1, 3)));
        assert_eq!(subset_range(&axis, 2.0, 2.0), Some((2, 2)));
        assert_eq!(subset_range(&axis, 6.0, 9.0), None);

        let descending = Array1::from_vec(vec![5.0, 4.0, 3.0, 2.0, 1.0]);
        assert_eq!(subset_range(&descending, 1.5, 4.0), Some((1, 3)));
    }

    #[test]
    fn test_roi_window_covers_corners() {
        let meta = conus_metadata();
        let header = GoesHeader::from_metadata(|k| meta.get(k).cloned()).unwrap();
        let x = header.x_axis(5000);
        let y = header.y_axis(3000);
        let roi = RegionOfInterest {
            subset: GeoBox::from_corners((-116.0, 30.0), (-102.0, 38.0)),
            map_extent: GeoBox::from_corners((-115.0, 31.0), (-103.0, 37.0)),
        };
        let window = roi_window(&header.projection, &x, &y, &roi).unwrap();
        assert!(window.cols() > 1 && window.rows() > 1);

        let projected: Vec<(f64, f64)> = roi
            .subset
            .corners()
            .iter()
            .map(|&(lon, lat)| header.projection.forward(lon, lat).unwrap())
            .collect();
        let min_x = projected.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let max_x = projected.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = projected.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_y = projected.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

        // Retained indices lie inside the box, their outer neighbours outside
        assert!(x[window.col_start] >= min_x && x[window.col_start - 1] < min_x);
        assert!(x[window.col_end] <= max_x && x[window.col_end + 1] > max_x);
        assert!(y[window.row_start] <= max_y && y[window.row_start - 1] > max_y);
        assert!(y[window.row_end] >= min_y && y[window.row_end + 1] < min_y);
    }

    #[test]
    fn test_roi_off_disk_is_malformed() {
        let meta = conus_metadata();
        let header = GoesHeader::from_metadata(|k| meta.get(k).cloned()).unwrap();
        let x = header.x_axis(100);
        let y = header.y_axis(100);
        let roi = RegionOfInterest {
            subset: GeoBox::from_corners((100.0, 10.0), (110.0, 20.0)),
            map_extent: GeoBox::from_corners((100.0, 10.0), (110.0, 20.0)),
        };
        assert!(matches!(
            roi_window(&header.projection, &x, &y, &roi),
            Err(GvError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_to_physical_masks_fill_and_scales() {
        let raw = vec![0.0, 100.0, 4095.0, 2000.0, -1.0, 4095.0];
        let image = to_physical(raw, (2, 3), Some(4095.0), 0.5, 10.0).unwrap();
        assert_eq!(image.dim(), (2, 3));
        assert_abs_diff_eq!(image[[0, 0]], 10.0);
        assert_abs_diff_eq!(image[[0, 1]], 60.0);
        assert!(image[[0, 2]].is_nan());
        assert_abs_diff_eq!(image[[1, 0]], 1010.0);
        assert_abs_diff_eq!(image[[1, 1]], 9.5);
        assert!(image[[1, 2]].is_nan());
    }

    #[test]
    fn test_to_physical_without_fill_keeps_every_sample() {
        let image = to_physical(vec![4095.0, 1.0], (1, 2), None, 1.0, 0.0).unwrap();
        assert_abs_diff_eq!(image[[0, 0]], 4095.0);
        assert_abs_diff_eq!(image[[0, 1]], 1.0);
    }

    #[test]
    fn test_to_physical_shape_mismatch_is_malformed() {
        assert!(matches!(
            to_physical(vec![1.0; 5], (2, 3), None, 1.0, 0.0),
            Err(GvError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_missing_channel_is_malformed() {
        let mut file = tempfile::Builder::new().suffix(".nc").tempfile().unwrap();
        file.write_all(b"not a netCDF file").unwrap();
        assert!(matches!(
            GoesReader::open_variable(file.path(), BLUE_VAR),
            Err(GvError::MalformedInput(_))
        ));
    }
}
