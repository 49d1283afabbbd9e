use crate::types::{GvError, GvResult, RgbaImage};
use ndarray::{s, Array2, Zip};
use serde::Deserialize;

/// Brightness, contrast and unsharp-mask parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnhanceParams {
    /// Fixed brightness offset; `None` derives it as `160 - mean`
    pub brightness: Option<f32>,
    /// Contrast gain
    pub contrast: f32,
    /// Gaussian kernel size (odd)
    pub kernel_size: usize,
    /// Gaussian sigma; values <= 0 derive sigma from the kernel size
    pub sigma: f32,
    /// Unsharp-mask amount
    pub amount: f32,
    /// Minimum |brightened - blurred| for sharpening to apply
    pub threshold: f32,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self {
            brightness: None,
            contrast: 1.15,
            kernel_size: 5,
            sigma: 1.0,
            amount: 1.0,
            threshold: 0.0,
        }
    }
}

impl EnhanceParams {
    pub fn validate(&self) -> GvResult<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(GvError::Config(format!(
                "Sharpening kernel size must be odd, got {}",
                self.kernel_size
            )));
        }
        if !self.contrast.is_finite() || self.contrast <= 0.0 {
            return Err(GvError::Config(format!(
                "Contrast gain must be positive, got {}",
                self.contrast
            )));
        }
        Ok(())
    }

    /// Sigma actually used for the blur
    pub fn effective_sigma(&self) -> f32 {
        if self.sigma > 0.0 {
            self.sigma
        } else {
            0.3 * ((self.kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
        }
    }
}

/// Normalizes brightness/contrast and sharpens the reprojected composite
pub struct ImageEnhancer {
    params: EnhanceParams,
}

impl ImageEnhancer {
    pub fn new(params: EnhanceParams) -> GvResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Enhance the RGB bands; alpha is carried through untouched
    pub fn enhance(&self, image: &RgbaImage) -> GvResult<RgbaImage> {
        let (rows, cols, bands) = image.dim();
        if bands != 4 {
            return Err(GvError::Processing(format!(
                "Expected an RGBA image, got {} bands",
                bands
            )));
        }

        let brightness = self
            .params
            .brightness
            .unwrap_or_else(|| 160.0 - opaque_mean(image));
        let contrast = self.params.contrast;
        let offset = (255.0 * (1.0 - contrast) / 2.0).round();
        log::debug!(
            "Enhancing {}x{}: brightness {:.1}, contrast {}, offset {}",
            rows,
            cols,
            brightness,
            contrast,
            offset
        );

        let kernel = gaussian_kernel(self.params.kernel_size, self.params.effective_sigma());
        let amount = self.params.amount;
        let threshold = self.params.threshold;

        let mut out = image.clone();
        for band in 0..3 {
            let brightened = image
                .slice(s![.., .., band])
                .mapv(|v| saturate((contrast * v as f32 + brightness + offset).abs()));
            let blurred = blur(&brightened, &kernel);

            Zip::from(out.slice_mut(s![.., .., band]))
                .and(&brightened)
                .and(&blurred)
                .for_each(|o, &b, &bl| {
                    let sharpened = ((amount + 1.0) * b - amount * bl).clamp(0.0, 255.0);
                    *o = if threshold > 0.0 && (b - bl).abs() < threshold {
                        b.round() as u8
                    } else {
                        sharpened.round() as u8
                    };
                });
        }

        Ok(out)
    }
}

/// Mean of the RGB samples of opaque pixels, 0 when nothing is opaque
fn opaque_mean(image: &RgbaImage) -> f32 {
    let (rows, cols, _) = image.dim();
    let mut sum = 0.0_f64;
    let mut count = 0_u64;
    for r in 0..rows {
        for c in 0..cols {
            if image[[r, c, 3]] == 0 {
                continue;
            }
            for band in 0..3 {
                sum += image[[r, c, band]] as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

/// Round and saturate to the 8-bit range, kept as f32 for the blur
fn saturate(v: f32) -> f32 {
    v.round().clamp(0.0, 255.0)
}

/// Normalized 1-D Gaussian
fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let half = (size / 2) as i64;
    let two_sigma2 = 2.0 * sigma * sigma;
    let raw: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / two_sigma2).exp())
        .collect();
    let total: f32 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Reflect-101 border index
fn reflect(i: i64, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let n = len as i64;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Separable Gaussian blur with reflect-101 borders
fn blur(image: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let half = (kernel.len() / 2) as i64;

    let horizontal: Array2<f32> = Array2::from_shape_fn((rows, cols), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * image[[r, reflect(c as i64 + k as i64 - half, cols)]])
            .sum::<f32>()
    });
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * horizontal[[reflect(r as i64 + k as i64 - half, rows), c]])
            .sum::<f32>()
    })
}
