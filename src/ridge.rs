// src/ridge.rs - Multiscale Hessian ridge detection with TWOMBLI thresholds

use std::f64::consts::PI;
use image::{GrayImage, ImageBuffer, Luma};
use log::debug;

use crate::config::Config;
use crate::errors::{FiberTrackError, Result};
use crate::image_utils::{
    count_on, float_from_u8, is_on, percentile, set_mask, stretch_to_u8, FloatImage, Mask,
};
use crate::morphology::skeletonize;
use crate::skeleton::remove_short_components;

/// Gaussian kernels are cut at this many standard deviations
const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Ridge detection settings
#[derive(Debug, Clone)]
pub struct RidgeParams {
    pub min_line_width: u32,
    pub max_line_width: u32,
    pub contrast_low: f64,
    pub contrast_high: f64,
    pub dark_line: bool,
    pub do_enhance_contrast: bool,
    pub intensity_clip_percent: f64,
    pub do_skeleton: bool,
    pub prune_short: bool,
    pub minimum_branch_length: f64,
}

impl RidgeParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_line_width: config.min_line_width,
            max_line_width: config.max_line_width,
            contrast_low: config.contrast_low,
            contrast_high: config.contrast_high,
            dark_line: config.dark_line,
            do_enhance_contrast: config.do_enhance_contrast,
            intensity_clip_percent: config.intensity_clip_percent,
            do_skeleton: config.do_skeleton,
            prune_short: config.prune_short,
            minimum_branch_length: config.minimum_branch_length,
        }
    }
}

/// Result of ridge detection for one line width
pub struct LineWidthResponse {
    pub mask: Mask,
    pub response: FloatImage,
    pub lower: f64,
    pub upper: f64,
}

/// Combined ridges over all line widths
pub struct RidgeDetection {
    pub mask: Mask,
    /// None when skeletonisation is off or leaves no pixels
    pub skeleton: Option<Mask>,
}

/// Gaussian sigma matching a line width
pub fn calc_sigma(line_width: f64) -> f64 {
    line_width / (2.0 * 3f64.sqrt()) + 0.5
}

fn threshold_from_contrast(line_width: f64, sigma: f64, contrast: f64) -> f64 {
    let half = line_width / 2.0;
    let value = (-2.0 * contrast * half / ((2.0 * PI).sqrt() * sigma.powi(3))
        * (-(half * half) / (2.0 * sigma * sigma)).exp())
    .abs();
    0.17 * value.floor()
}

/// Lower response threshold for a line width
pub fn calc_lower_thresh(
    line_width: f64,
    sigma: f64,
    contrast_low: f64,
    contrast_high: f64,
    dark_line: bool,
) -> f64 {
    let clow = if dark_line { 255.0 - contrast_high } else { contrast_low };
    threshold_from_contrast(line_width, sigma, clow)
}

/// Upper response threshold for a line width
pub fn calc_upper_thresh(
    line_width: f64,
    sigma: f64,
    contrast_low: f64,
    contrast_high: f64,
    dark_line: bool,
) -> f64 {
    let chigh = if dark_line { 255.0 - contrast_low } else { contrast_high };
    threshold_from_contrast(line_width, sigma, chigh)
}

/// Clip intensities to the central percentile band and rescale to [0, 1]
pub fn enhance_contrast(image: &GrayImage, intensity_clip_percent: f64) -> FloatImage {
    let img = float_from_u8(image);
    let low = percentile(img.as_raw(), intensity_clip_percent / 2.0);
    let high = percentile(img.as_raw(), 100.0 - intensity_clip_percent / 2.0);

    if !(high > low) {
        debug!("Contrast band collapsed (low {:.4} >= high {:.4}), keeping image", low, high);
        return img;
    }

    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0].clamp(low, high);
        Luma([(v - low) / (high - low)])
    })
}

/// 8-bit view used by the ridge detector: the original pixels, or a min-max stretch
pub fn prepare_eight_bit(image: &FloatImage, image_u8: Option<&GrayImage>) -> GrayImage {
    match image_u8 {
        Some(original) => original.clone(),
        None => stretch_to_u8(image),
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i * i) as f64 / (sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian blur with zero padding outside the image
pub fn gaussian_smooth(image: &FloatImage, sigma: f64) -> FloatImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let (width, height) = image.dimensions();

    let horizontal = ImageBuffer::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for (k, w) in kernel.iter().enumerate() {
            let sx = x as i64 + k as i64 - radius;
            if sx >= 0 && sx < width as i64 {
                acc += w * image.get_pixel(sx as u32, y)[0];
            }
        }
        Luma([acc])
    });

    ImageBuffer::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for (k, w) in kernel.iter().enumerate() {
            let sy = y as i64 + k as i64 - radius;
            if sy >= 0 && sy < height as i64 {
                acc += w * horizontal.get_pixel(x, sy as u32)[0];
            }
        }
        Luma([acc])
    })
}

/// Finite-difference derivative along one axis: central inside, one-sided at the edges
fn gradient(image: &FloatImage, along_x: bool) -> FloatImage {
    let (width, height) = image.dimensions();
    let len = if along_x { width } else { height };

    ImageBuffer::from_fn(width, height, |x, y| {
        if len < 2 {
            return Luma([0.0]);
        }
        let i = if along_x { x } else { y };
        let at = |j: u32| {
            if along_x {
                image.get_pixel(j, y)[0]
            } else {
                image.get_pixel(x, j)[0]
            }
        };
        let d = if i == 0 {
            at(1) - at(0)
        } else if i == len - 1 {
            at(len - 1) - at(len - 2)
        } else {
            (at(i + 1) - at(i - 1)) / 2.0
        };
        Luma([d])
    })
}

/// Eigenvalues of a symmetric 2x2 matrix, largest first
#[inline]
fn symmetric_eigenvalues(a: f64, b: f64, c: f64) -> (f64, f64) {
    let mean = (a + c) / 2.0;
    let spread = (((a - c) / 2.0).powi(2) + b * b).sqrt();
    (mean + spread, mean - spread)
}

/// Ridge strength from the dominant Hessian eigenvalue, scaled to [0, 255]
pub fn hessian_ridge_response(image: &FloatImage, sigma: f64, dark_line: bool) -> FloatImage {
    let smoothed = gaussian_smooth(image, sigma);
    let d_row = gradient(&smoothed, false);
    let d_col = gradient(&smoothed, true);
    let h_rr = gradient(&d_row, false);
    let h_rc = gradient(&d_row, true);
    let h_cc = gradient(&d_col, true);

    let (width, height) = image.dimensions();
    let response: FloatImage = ImageBuffer::from_fn(width, height, |x, y| {
        let (l1, l2) = symmetric_eigenvalues(
            h_rr.get_pixel(x, y)[0],
            h_rc.get_pixel(x, y)[0],
            h_cc.get_pixel(x, y)[0],
        );
        let dominant = if l2.abs() > l1.abs() { l2 } else { l1 };
        // Bright ridges curve downwards (negative eigenvalue), dark ridges upwards
        let value = if dark_line { dominant.max(0.0) } else { (-dominant).max(0.0) };
        Luma([value])
    });

    let (min, max) = response
        .as_raw()
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    ImageBuffer::from_fn(width, height, |x, y| {
        let shifted = response.get_pixel(x, y)[0] - min;
        let normalised = if range > 0.0 { shifted / range } else { shifted };
        Luma([normalised * 255.0])
    })
}

/// Threshold the ridge response for a single line width
pub fn ridge_mask_for_line_width(
    image: &FloatImage,
    line_width: u32,
    roi: Option<&Mask>,
    contrast_low: f64,
    contrast_high: f64,
    dark_line: bool,
) -> LineWidthResponse {
    let lw = line_width as f64;
    let sigma = calc_sigma(lw);
    let lower = calc_lower_thresh(lw, sigma, contrast_low, contrast_high, dark_line);
    let upper = calc_upper_thresh(lw, sigma, contrast_low, contrast_high, dark_line);

    let mut response = hessian_ridge_response(image, sigma, dark_line);
    if let Some(roi) = roi {
        for (x, y, pixel) in response.enumerate_pixels_mut() {
            if !is_on(roi, x, y) {
                pixel[0] = f64::NEG_INFINITY;
            }
        }
    }

    let mut mask = Mask::new(image.width(), image.height());
    for (x, y, pixel) in response.enumerate_pixels() {
        let v = pixel[0];
        set_mask(&mut mask, x, y, v >= lower && v <= upper);
    }

    debug!(
        "Line width {}: sigma={:.3}, thresholds=[{:.3}, {:.3}], {} ridge pixels",
        line_width, sigma, lower, upper, count_on(&mask)
    );

    LineWidthResponse { mask, response, lower, upper }
}

/// OR-combine ridge masks over every line width, then optionally skeletonise
pub fn run_multiscale_ridge_detection(
    image_u8: &GrayImage,
    roi: Option<&Mask>,
    params: &RidgeParams,
) -> Result<RidgeDetection> {
    if let Some(roi) = roi {
        if roi.dimensions() != image_u8.dimensions() {
            return Err(FiberTrackError::DimensionMismatch {
                expected: image_u8.dimensions(),
                actual: roi.dimensions(),
            });
        }
    }
    if params.min_line_width == 0 || params.min_line_width > params.max_line_width {
        return Err(FiberTrackError::InvalidParameter(format!(
            "line width range {}..={} is empty",
            params.min_line_width, params.max_line_width
        )));
    }

    let img = if params.do_enhance_contrast {
        enhance_contrast(image_u8, params.intensity_clip_percent)
    } else {
        float_from_u8(image_u8)
    };

    let mut combined = Mask::new(image_u8.width(), image_u8.height());
    for line_width in params.min_line_width..=params.max_line_width {
        let scale = ridge_mask_for_line_width(
            &img,
            line_width,
            roi,
            params.contrast_low,
            params.contrast_high,
            params.dark_line,
        );
        for (dst, src) in combined.pixels_mut().zip(scale.mask.pixels()) {
            dst[0] |= src[0];
        }
    }

    let skeleton = if params.do_skeleton {
        let mut skel = skeletonize(&combined);
        if params.prune_short {
            skel = remove_short_components(&skel, params.minimum_branch_length);
        }
        (count_on(&skel) > 0).then_some(skel)
    } else {
        None
    };

    Ok(RidgeDetection { mask: combined, skeleton })
}
