use crate::types::{ChannelSet, CompositeImage, GvError, GvResult};
use ndarray::{s, Array2, Array3, Zip};

/// Gamma applied to the visible channels
pub const GAMMA: f32 = 1.0 / 1.7;

/// Attenuation of the clean-IR overlay so cold cloud tops are not blown out
pub const IR_ATTENUATION: f32 = 1.3;

/// GeoColor composite parameters
#[derive(Debug, Clone)]
pub struct ColorizeParams {
    /// Contrast parameter C of the linear stretch
    pub contrast: f32,
}

impl Default for ColorizeParams {
    fn default() -> Self {
        Self { contrast: 105.0 }
    }
}

impl ColorizeParams {
    /// Stretch factor `F = 259 (C + 255) / (255 (259 - C))`
    pub fn stretch_factor(&self) -> f32 {
        let c = self.contrast;
        259.0 * (c + 255.0) / (255.0 * (259.0 - c))
    }
}

/// Clip to [0, 1], NaN becomes 0
#[inline]
pub fn clip_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Builds the true-color-like composite from the ABI channels
pub struct GeoColorProcessor {
    params: ColorizeParams,
}

impl GeoColorProcessor {
    pub fn new(params: ColorizeParams) -> Self {
        Self { params }
    }

    /// Combine the visible channels and the clean-IR overlay into RGB in [0, 1]
    pub fn colorize(&self, channels: &ChannelSet) -> GvResult<CompositeImage> {
        let dim = channels.dim();
        for (name, band) in [
            ("blue", &channels.blue),
            ("nir", &channels.nir),
            ("clean_ir", &channels.clean_ir),
        ] {
            if band.dim() != dim {
                return Err(GvError::MalformedInput(format!(
                    "Channel {} has shape {:?}, expected {:?}",
                    name,
                    band.dim(),
                    dim
                )));
            }
        }

        let (lo, hi) = channels.ir_valid_range;
        if !(hi > lo) {
            return Err(GvError::MalformedInput(format!(
                "Invalid C13 valid range ({}, {})",
                lo, hi
            )));
        }

        log::debug!("Colorizing {}x{} composite, contrast {}", dim.0, dim.1, self.params.contrast);

        let f = self.params.stretch_factor();
        let stretch = move |v: f32| clip_unit(f * (v - 0.5) + 0.5);

        let mut red = Array2::<f32>::zeros(dim);
        let mut green = Array2::<f32>::zeros(dim);
        let mut blue = Array2::<f32>::zeros(dim);

        let zip = Zip::from(&mut red)
            .and(&mut green)
            .and(&mut blue)
            .and(&channels.red)
            .and(&channels.nir)
            .and(&channels.blue);
        // Zip tops out at six producers, so the IR overlay is folded in below
        let visible = |r_out: &mut f32, g_out: &mut f32, b_out: &mut f32, &r: &f32, &n: &f32, &b: &f32| {
            let r = clip_unit(r);
            let n = clip_unit(n);
            let b = clip_unit(b);
            let g = clip_unit(0.45 * r + 0.10 * n + 0.45 * b);
            *r_out = r.powf(GAMMA);
            *g_out = g.powf(GAMMA);
            *b_out = b.powf(GAMMA);
        };

        #[cfg(feature = "parallel")]
        zip.par_for_each(visible);
        #[cfg(not(feature = "parallel"))]
        zip.for_each(visible);

        let span = hi - lo;
        // Missing IR samples (off-disk) contribute no overlay
        let clean_ir = channels.clean_ir.mapv(|t| {
            if t.is_nan() {
                0.0
            } else {
                (1.0 - clip_unit((t - lo) / span)) / IR_ATTENUATION
            }
        });

        let mut out = Array3::<f32>::zeros((dim.0, dim.1, 3));
        for (band, visible) in [red, green, blue].iter().enumerate() {
            Zip::from(out.slice_mut(s![.., .., band]))
                .and(visible)
                .and(&clean_ir)
                .for_each(|o, &v, &ir| *o = stretch(clip_unit(v.max(ir))));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn uniform_channels(visible: f32, ir: f32, shape: (usize, usize)) -> ChannelSet {
        ChannelSet {
            blue: Array2::from_elem(shape, visible),
            red: Array2::from_elem(shape, visible),
            nir: Array2::from_elem(shape, visible),
            clean_ir: Array2::from_elem(shape, ir),
            ir_valid_range: (180.0, 360.0),
        }
    }

    #[test]
    fn test_stretch_factor_default() {
        let f = ColorizeParams::default().stretch_factor();
        assert_abs_diff_eq!(f, 259.0 * 360.0 / (255.0 * 154.0), epsilon = 1e-6);
    }

    #[test]
    fn test_mid_gray_literal_value() {
        let processor = GeoColorProcessor::new(ColorizeParams::default());
        let channels = uniform_channels(0.5, 270.0, (4, 5));
        let out = processor.colorize(&channels).unwrap();

        let f = 259.0_f32 * (105.0 + 255.0) / (255.0 * (259.0 - 105.0));
        let expected = (f * (0.5_f32.powf(1.0 / 1.7) - 0.5) + 0.5).clamp(0.0, 1.0);
        assert_eq!(out.dim(), (4, 5, 3));
        for v in out.iter() {
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cold_cloud_tops_brighten_dark_scene() {
        let processor = GeoColorProcessor::new(ColorizeParams::default());
        let dark = processor.colorize(&uniform_channels(0.0, 360.0, (2, 2))).unwrap();
        let cold = processor.colorize(&uniform_channels(0.0, 180.0, (2, 2))).unwrap();
        assert_eq!(dark[[0, 0, 0]], 0.0);
        assert!(cold[[0, 0, 0]] > 0.5);
    }

    #[test]
    fn test_output_clipped_and_finite() {
        let processor = GeoColorProcessor::new(ColorizeParams::default());
        let mut channels = uniform_channels(0.3, 250.0, (3, 3));
        channels.red[[0, 0]] = f32::NAN;
        channels.blue[[1, 1]] = f32::INFINITY;
        channels.nir[[2, 2]] = -4.0;
        channels.clean_ir[[0, 2]] = f32::NAN;
        channels.clean_ir[[2, 0]] = f32::NEG_INFINITY;

        let out = processor.colorize(&channels).unwrap();
        assert!(out.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_rejects_mismatched_shapes_and_bad_range() {
        let processor = GeoColorProcessor::new(ColorizeParams::default());
        let mut channels = uniform_channels(0.5, 270.0, (3, 3));
        channels.nir = Array2::zeros((2, 3));
        assert!(matches!(processor.colorize(&channels), Err(GvError::MalformedInput(_))));

        let mut channels = uniform_channels(0.5, 270.0, (3, 3));
        channels.ir_valid_range = (300.0, 300.0);
        assert!(matches!(processor.colorize(&channels), Err(GvError::MalformedInput(_))));
    }
}
