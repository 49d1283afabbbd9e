//! Native geostationary grid to Web Mercator resampling
//!
//! Weight computation is split from weight application: the neighbour
//! search depends only on the grid geometry, so a platform's fixed viewing
//! geometry lets one [`ResampleWeights`] serve every scan of the same shape.

use crate::core::projection::{lonlat_to_mercator, mercator_to_lonlat};
use crate::types::{CompositeImage, GeoBox, GeosProjection, GvError, GvResult, RgbaImage, SourceUnit};
use ndarray::{Array1, Array3};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maximum neighbours kept per output cell
pub const MAX_NEIGHBOURS: usize = 8;

/// Fixed-resolution output grid in Web Mercator meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGrid {
    pub min_x: f64,
    pub max_y: f64,
    pub dx: f64,
    pub dy: f64,
    pub width: usize,
    pub height: usize,
}

impl TargetGrid {
    /// Grid covering a geographic extent at the given cell size
    pub fn from_extent(extent: &GeoBox, dx: f64, dy: f64) -> GvResult<Self> {
        let (min_x, min_y) = lonlat_to_mercator(extent.min_lon, extent.min_lat);
        let (max_x, max_y) = lonlat_to_mercator(extent.max_lon, extent.max_lat);
        let width = ((max_x - min_x) / dx).floor() as usize;
        let height = ((max_y - min_y) / dy).floor() as usize;
        if width == 0 || height == 0 {
            return Err(GvError::Processing(format!(
                "Map extent {:?} is smaller than one {}x{} m cell",
                extent, dx, dy
            )));
        }
        Ok(Self {
            min_x,
            max_y,
            dx,
            dy,
            width,
            height,
        })
    }

    /// Mercator coordinates of a cell centre, row 0 is north
    pub fn cell_centre(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.min_x + (col as f64 + 0.5) * self.dx,
            self.max_y - (row as f64 + 0.5) * self.dy,
        )
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Regularly spaced native axis
#[derive(Debug, Clone, Copy, PartialEq)]
struct RegularAxis {
    start: f64,
    step: f64,
    len: usize,
}

impl RegularAxis {
    fn from_coords(coords: &Array1<f64>, name: &str) -> GvResult<Self> {
        let len = coords.len();
        if len < 2 {
            return Err(GvError::Processing(format!(
                "Native {} axis needs at least 2 samples, got {}",
                name, len
            )));
        }
        let start = coords[0];
        let step = (coords[len - 1] - start) / (len - 1) as f64;
        if step == 0.0 || !step.is_finite() {
            return Err(GvError::Processing(format!("Native {} axis is degenerate", name)));
        }
        let tolerance = step.abs() * 1e-3;
        for (i, &c) in coords.iter().enumerate() {
            if (c - (start + i as f64 * step)).abs() > tolerance {
                return Err(GvError::Processing(format!(
                    "Native {} axis is not regularly spaced at index {}",
                    name, i
                )));
            }
        }
        Ok(Self { start, step, len })
    }

    fn coord(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }

    fn fractional_index(&self, coord: f64) -> f64 {
        (coord - self.start) / self.step
    }
}

/// Cache key: native grid geometry, output grid, search radius
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeightKey {
    source_shape: (usize, usize),
    source_extent: [u64; 4],
    target_shape: (usize, usize),
    target_origin: [u64; 4],
    projection: [u64; 4],
    radius: u64,
}

impl WeightKey {
    pub fn new(unit: &SourceUnit, target: &TargetGrid, radius: f64) -> Self {
        let nx = unit.x.len();
        let ny = unit.y.len();
        let edge = |a: &Array1<f64>, i: usize| a.get(i).copied().unwrap_or(f64::NAN).to_bits();
        let p = &unit.projection;
        Self {
            source_shape: (ny, nx),
            source_extent: [
                edge(&unit.x, 0),
                edge(&unit.x, nx.saturating_sub(1)),
                edge(&unit.y, 0),
                edge(&unit.y, ny.saturating_sub(1)),
            ],
            target_shape: target.shape(),
            target_origin: [
                target.min_x.to_bits(),
                target.max_y.to_bits(),
                target.dx.to_bits(),
                target.dy.to_bits(),
            ],
            projection: [
                p.semi_major_axis.to_bits(),
                p.semi_minor_axis.to_bits(),
                p.longitude_of_origin.to_bits(),
                p.perspective_height.to_bits(),
            ],
            radius: radius.to_bits(),
        }
    }
}

/// Neighbour indices and interpolation weights for every output cell
#[derive(Debug, Clone, PartialEq)]
pub struct ResampleWeights {
    /// Native shape (rows, cols) the indices refer to
    pub source_shape: (usize, usize),
    /// Output shape (rows, cols)
    pub target_shape: (usize, usize),
    /// Per output cell, flat source indices (row-major), at most [`MAX_NEIGHBOURS`]
    pub neighbours: Vec<Vec<(u32, f32)>>,
}

impl ResampleWeights {
    /// Number of output cells with at least one neighbour
    pub fn covered_cells(&self) -> usize {
        self.neighbours.iter().filter(|n| !n.is_empty()).count()
    }
}

/// Computes interpolation weights from the native grid to a target grid
pub struct WeightComputer {
    projection: GeosProjection,
    x_axis: RegularAxis,
    y_axis: RegularAxis,
    radius: f64,
}

impl WeightComputer {
    pub fn new(unit: &SourceUnit, radius: f64) -> GvResult<Self> {
        Ok(Self {
            projection: unit.projection,
            x_axis: RegularAxis::from_coords(&unit.x, "x")?,
            y_axis: RegularAxis::from_coords(&unit.y, "y")?,
            radius,
        })
    }

    /// Weights for every cell of `target`
    pub fn compute(&self, target: &TargetGrid) -> ResampleWeights {
        log::info!(
            "Computing resample weights: {}x{} native -> {}x{} output, radius {} m",
            self.y_axis.len,
            self.x_axis.len,
            target.height,
            target.width,
            self.radius
        );
        let start = std::time::Instant::now();

        let row_weights = |row: usize| -> Vec<Vec<(u32, f32)>> {
            (0..target.width)
                .map(|col| {
                    let (mx, my) = target.cell_centre(row, col);
                    self.cell_weights(mx, my)
                })
                .collect()
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<Vec<Vec<(u32, f32)>>> = {
            use rayon::prelude::*;
            (0..target.height).into_par_iter().map(row_weights).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<Vec<Vec<(u32, f32)>>> = (0..target.height).map(row_weights).collect();

        let weights = ResampleWeights {
            source_shape: (self.y_axis.len, self.x_axis.len),
            target_shape: target.shape(),
            neighbours: rows.into_iter().flatten().collect(),
        };

        log::debug!(
            "Resample weights ready in {:?}, {} of {} cells covered",
            start.elapsed(),
            weights.covered_cells(),
            target.width * target.height
        );
        weights
    }

    fn cell_weights(&self, mx: f64, my: f64) -> Vec<(u32, f32)> {
        let (lon, lat) = mercator_to_lonlat(mx, my);
        let (px, py) = match self.projection.forward(lon, lat) {
            Some(p) => p,
            None => return Vec::new(),
        };

        let fx = self.x_axis.fractional_index(px);
        let fy = self.y_axis.fractional_index(py);
        if !fx.is_finite() || !fy.is_finite() {
            return Vec::new();
        }
        let col0 = fx.floor() as i64;
        let row0 = fy.floor() as i64;

        // Candidates: the 4x4 block around the point, inside the search radius
        let mut candidates: Vec<(f64, usize, usize)> = Vec::with_capacity(16);
        for row in (row0 - 1)..=(row0 + 2) {
            if row < 0 || row >= self.y_axis.len as i64 {
                continue;
            }
            for col in (col0 - 1)..=(col0 + 2) {
                if col < 0 || col >= self.x_axis.len as i64 {
                    continue;
                }
                let (row, col) = (row as usize, col as usize);
                let dist = (self.x_axis.coord(col) - px).hypot(self.y_axis.coord(row) - py);
                if dist <= self.radius {
                    candidates.push((dist, row, col));
                }
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        let ncols = self.x_axis.len;
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| (a.1 * ncols + a.2).cmp(&(b.1 * ncols + b.2)))
        });
        candidates.truncate(MAX_NEIGHBOURS);

        let flat = |row: usize, col: usize| (row * ncols + col) as u32;
        let has = |row: i64, col: i64| {
            candidates
                .iter()
                .any(|&(_, r, c)| r as i64 == row && c as i64 == col)
        };

        if has(row0, col0) && has(row0, col0 + 1) && has(row0 + 1, col0) && has(row0 + 1, col0 + 1) {
            let tx = fx - col0 as f64;
            let ty = fy - row0 as f64;
            let (r0, c0) = (row0 as usize, col0 as usize);
            return [
                (flat(r0, c0), (1.0 - tx) * (1.0 - ty)),
                (flat(r0, c0 + 1), tx * (1.0 - ty)),
                (flat(r0 + 1, c0), (1.0 - tx) * ty),
                (flat(r0 + 1, c0 + 1), tx * ty),
            ]
            .into_iter()
            .map(|(i, w)| (i, w as f32))
            .collect();
        }

        // Grid edge or radius cut: inverse-distance over what is available
        if let Some(&(d, r, c)) = candidates.first() {
            if d < 1e-9 {
                return vec![(flat(r, c), 1.0)];
            }
        }
        let total: f64 = candidates.iter().map(|(d, _, _)| 1.0 / d).sum();
        candidates
            .iter()
            .map(|&(d, r, c)| (flat(r, c), ((1.0 / d) / total) as f32))
            .collect()
    }
}

/// Memoizes weights by grid geometry
#[derive(Default)]
pub struct WeightCache {
    entries: Mutex<HashMap<WeightKey, Arc<ResampleWeights>>>,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached weights for this geometry, computing them on first use
    pub fn get_or_compute(
        &self,
        unit: &SourceUnit,
        target: &TargetGrid,
        radius: f64,
    ) -> GvResult<Arc<ResampleWeights>> {
        let key = WeightKey::new(unit, target, radius);
        if let Some(hit) = self.lock()?.get(&key) {
            log::debug!("Reusing cached resample weights");
            return Ok(Arc::clone(hit));
        }

        let weights = Arc::new(WeightComputer::new(unit, radius)?.compute(target));
        self.lock()?.insert(key, Arc::clone(&weights));
        Ok(weights)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> GvResult<std::sync::MutexGuard<'_, HashMap<WeightKey, Arc<ResampleWeights>>>> {
        self.entries
            .lock()
            .map_err(|_| GvError::Processing("Weight cache lock poisoned".to_string()))
    }
}

/// Apply weights to the composite, producing 8-bit RGBA on the target grid.
///
/// A neighbour contributes only when its RGB triple is not all zero. Cells
/// with no contributing neighbour are fully transparent.
pub fn resample(weights: &ResampleWeights, composite: &CompositeImage) -> GvResult<RgbaImage> {
    let (rows, cols, bands) = composite.dim();
    if (rows, cols) != weights.source_shape || bands != 3 {
        return Err(GvError::Processing(format!(
            "Composite shape {:?} does not match weights for {:?}",
            composite.dim(),
            weights.source_shape
        )));
    }

    let (height, width) = weights.target_shape;
    let mut out = Array3::<u8>::zeros((height, width, 4));

    for (cell, neighbours) in weights.neighbours.iter().enumerate() {
        let mut acc = [0.0_f32; 3];
        let mut total = 0.0_f32;
        for &(index, weight) in neighbours {
            let index = index as usize;
            let (r, c) = (index / cols, index % cols);
            let px = [composite[[r, c, 0]], composite[[r, c, 1]], composite[[r, c, 2]]];
            if px.iter().all(|v| !v.is_finite() || *v <= 0.0) || weight <= 0.0 {
                continue;
            }
            for (a, v) in acc.iter_mut().zip(px) {
                *a += weight * if v.is_finite() { v } else { 0.0 };
            }
            total += weight;
        }
        if total <= 0.0 {
            continue;
        }

        let (row, col) = (cell / width, cell % width);
        for (band, a) in acc.iter().enumerate() {
            out[[row, col, band]] = ((a / total).clamp(0.0, 1.0) * 255.0) as u8;
        }
        out[[row, col, 3]] = 255;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelSet, SweepAxis};
    use chrono::Utc;
    use ndarray::Array2;

    fn goes_west() -> GeosProjection {
        GeosProjection {
            semi_major_axis: 6_378_137.0,
            semi_minor_axis: 6_356_752.314_14,
            inverse_flattening: 298.257_222_096,
            longitude_of_origin: -137.0,
            perspective_height: 35_786_023.0,
            sweep: SweepAxis::X,
        }
    }

    /// Native grid (2 km spacing) covering a box, built the way the decoder does
    fn synthetic_unit(extent: &GeoBox, spacing: f64) -> SourceUnit {
        let projection = goes_west();
        let pts: Vec<(f64, f64)> = extent
            .corners()
            .iter()
            .map(|&(lon, lat)| projection.forward(lon, lat).unwrap())
            .collect();
        let min_x = pts.iter().map(|p| p.0).fold(f64::INFINITY, f64::min) - 2.0 * spacing;
        let max_x = pts.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max) + 2.0 * spacing;
        let min_y = pts.iter().map(|p| p.1).fold(f64::INFINITY, f64::min) - 2.0 * spacing;
        let max_y = pts.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max) + 2.0 * spacing;
        let nx = ((max_x - min_x) / spacing) as usize + 1;
        let ny = ((max_y - min_y) / spacing) as usize + 1;
        let x = Array1::from_iter((0..nx).map(|i| min_x + i as f64 * spacing));
        // North-up like the sensor files: y decreases with row
        let y = Array1::from_iter((0..ny).map(|i| max_y - i as f64 * spacing));
        SourceUnit {
            platform: "G17".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            projection,
            x,
            y,
            channels: ChannelSet {
                blue: Array2::zeros((ny, nx)),
                red: Array2::zeros((ny, nx)),
                nir: Array2::zeros((ny, nx)),
                clean_ir: Array2::zeros((ny, nx)),
                ir_valid_range: (180.0, 360.0),
            },
        }
    }

    fn small_extent() -> GeoBox {
        GeoBox::from_corners((-111.2, 32.0), (-110.6, 32.4))
    }

    #[test]
    fn test_target_grid_dimensions() {
        let grid = TargetGrid::from_extent(&small_extent(), 2500.0, 2500.0).unwrap();
        let (x0, y0) = lonlat_to_mercator(-111.2, 32.0);
        let (x1, y1) = lonlat_to_mercator(-110.6, 32.4);
        assert_eq!(grid.width, ((x1 - x0) / 2500.0).floor() as usize);
        assert_eq!(grid.height, ((y1 - y0) / 2500.0).floor() as usize);
        let (cx, cy) = grid.cell_centre(0, 0);
        assert!((cx - (x0 + 1250.0)).abs() < 1e-6);
        assert!((cy - (y1 - 1250.0)).abs() < 1e-6);
    }

    #[test]
    fn test_weights_deterministic_and_normalized() {
        let extent = small_extent();
        let unit = synthetic_unit(&extent, 2000.0);
        let grid = TargetGrid::from_extent(&extent, 2500.0, 2500.0).unwrap();
        let computer = WeightComputer::new(&unit, 6000.0).unwrap();

        let first = computer.compute(&grid);
        let second = computer.compute(&grid);
        assert_eq!(first, second);
        assert_eq!(first.neighbours.len(), grid.width * grid.height);
        assert_eq!(first.covered_cells(), grid.width * grid.height);

        for n in &first.neighbours {
            assert!(n.len() <= MAX_NEIGHBOURS);
            let sum: f32 = n.iter().map(|(_, w)| w).sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_cached_weights_match_recomputation() {
        let extent = small_extent();
        let grid = TargetGrid::from_extent(&extent, 2500.0, 2500.0).unwrap();
        let mut unit_a = synthetic_unit(&extent, 2000.0);
        let mut unit_b = synthetic_unit(&extent, 2000.0);
        let shape = unit_a.channels.dim();
        unit_a.channels.red = Array2::from_shape_fn(shape, |(r, c)| ((r + c) % 7) as f32 / 7.0);
        unit_b.channels.red = Array2::from_shape_fn(shape, |(r, c)| ((r * 3 + c) % 5) as f32 / 5.0);

        let cache = WeightCache::new();
        let cached_a = cache.get_or_compute(&unit_a, &grid, 6000.0).unwrap();
        let cached_b = cache.get_or_compute(&unit_b, &grid, 6000.0).unwrap();
        assert!(Arc::ptr_eq(&cached_a, &cached_b));
        assert_eq!(cache.len(), 1);

        for unit in [&unit_a, &unit_b] {
            let composite = Array3::from_shape_fn((shape.0, shape.1, 3), |(r, c, _)| unit.channels.red[[r, c]]);
            let fresh = WeightComputer::new(unit, 6000.0).unwrap().compute(&grid);
            assert_eq!(
                resample(&cached_a, &composite).unwrap(),
                resample(&fresh, &composite).unwrap()
            );
        }
    }

    #[test]
    fn test_all_zero_composite_is_transparent() {
        let extent = small_extent();
        let unit = synthetic_unit(&extent, 2000.0);
        let grid = TargetGrid::from_extent(&extent, 2500.0, 2500.0).unwrap();
        let weights = WeightComputer::new(&unit, 6000.0).unwrap().compute(&grid);
        let (rows, cols) = unit.channels.dim();

        let out = resample(&weights, &Array3::zeros((rows, cols, 3))).unwrap();
        assert_eq!(out.dim(), (grid.height, grid.width, 4));
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_uniform_composite_resamples_to_uniform_opaque() {
        let extent = small_extent();
        let unit = synthetic_unit(&extent, 2000.0);
        let grid = TargetGrid::from_extent(&extent, 2500.0, 2500.0).unwrap();
        let weights = WeightComputer::new(&unit, 6000.0).unwrap().compute(&grid);
        let (rows, cols) = unit.channels.dim();

        let out = resample(&weights, &Array3::from_elem((rows, cols, 3), 0.5)).unwrap();
        for row in 0..grid.height {
            for col in 0..grid.width {
                assert_eq!(out[[row, col, 3]], 255);
                // 0.5 * 255 truncates to 127, allow one step of float noise
                let v = out[[row, col, 0]];
                assert!(v == 127 || v == 126, "unexpected value {}", v);
            }
        }
    }

    #[test]
    fn test_cells_outside_native_grid_get_no_neighbours() {
        let native = GeoBox::from_corners((-111.0, 32.1), (-110.8, 32.3));
        let unit = synthetic_unit(&native, 2000.0);
        let wider = GeoBox::from_corners((-112.0, 31.5), (-110.0, 33.0));
        let grid = TargetGrid::from_extent(&wider, 2500.0, 2500.0).unwrap();
        let weights = WeightComputer::new(&unit, 6000.0).unwrap().compute(&grid);

        assert!(weights.neighbours[0].is_empty());
        assert!(weights.covered_cells() > 0);
        assert!(weights.covered_cells() < grid.width * grid.height);
    }

    #[test]
    fn test_rejects_irregular_axis_and_shape_mismatch() {
        let extent = small_extent();
        let mut unit = synthetic_unit(&extent, 2000.0);
        unit.x[1] += 700.0;
        assert!(WeightComputer::new(&unit, 6000.0).is_err());

        let unit = synthetic_unit(&extent, 2000.0);
        let grid = TargetGrid::from_extent(&extent, 2500.0, 2500.0).unwrap();
        let weights = WeightComputer::new(&unit, 6000.0).unwrap().compute(&grid);
        assert!(resample(&weights, &Array3::zeros((2, 2, 3))).is_err());
    }
}
