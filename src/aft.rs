// src/aft.rs - Local fiber orientation by Fourier transform of image windows

use std::f64::consts::PI;
use std::sync::Arc;

use log::debug;
use nalgebra::{Matrix2, SymmetricEigen};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::config::Config;
use crate::errors::{FiberTrackError, Result};
use crate::image_utils::{is_on, FloatImage, Mask};

/// Window grid settings
#[derive(Debug, Clone, Copy)]
pub struct AftParams {
    pub window_size: u32,
    /// Fraction of the window shared by neighbouring windows, in [0, 1)
    pub overlap: f64,
    pub intensity_thresh: f64,
    pub eccentricity_thresh: f64,
}

impl AftParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_size: config.window_size as u32,
            overlap: config.overlap,
            intensity_thresh: config.intensity_thresh,
            eccentricity_thresh: config.eccentricity_thresh,
        }
    }

    /// Window side actually used; even sizes grow by one so the window has a centre pixel
    pub fn effective_window(&self) -> u32 {
        if self.window_size % 2 == 0 {
            self.window_size + 1
        } else {
            self.window_size
        }
    }

    /// Distance between neighbouring window centres
    pub fn step(&self) -> u32 {
        let step = (self.effective_window() as f64 * (1.0 - self.overlap)).round();
        (step as u32).max(1)
    }
}

/// Orientation field over the window grid, flattened row-major
#[derive(Debug, Clone)]
pub struct AftField {
    pub nrows: usize,
    pub ncols: usize,
    /// Window centre columns
    pub x: Vec<f64>,
    /// Window centre rows
    pub y: Vec<f64>,
    pub u: Vec<f64>,
    pub v: Vec<f64>,
    /// Fiber angle in (-pi/2, pi/2], NaN for rejected windows
    pub theta: Vec<f64>,
    pub eccentricity: Vec<f64>,
}

impl AftField {
    pub fn len(&self) -> usize {
        self.theta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }

    #[inline]
    pub fn theta_at(&self, row: usize, col: usize) -> f64 {
        self.theta[row * self.ncols + col]
    }

    /// Number of windows with a valid orientation
    pub fn valid_count(&self) -> usize {
        self.theta.iter().filter(|t| !t.is_nan()).count()
    }
}

/// Window centre positions along one axis
fn centres(length: u32, window: u32, step: u32) -> Vec<u32> {
    let half = window / 2;
    let mut out = Vec::new();
    let mut c = half;
    while c + half < length {
        out.push(c);
        c += step;
    }
    out
}

fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Signed frequency of FFT bin `k`, i.e. its offset from the centre after fftshift
#[inline]
fn shifted_frequency(k: usize, n: usize) -> f64 {
    if k <= n / 2 {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

/// Wrap an angle into (-pi/2, pi/2]
pub fn wrap_half_pi(angle: f64) -> f64 {
    let t = angle.rem_euclid(PI);
    if t > PI / 2.0 { t - PI } else { t }
}

struct WindowAnalyzer {
    n: usize,
    fft: Arc<dyn Fft<f64>>,
    taper: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl WindowAnalyzer {
    fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            n,
            fft: planner.plan_fft_forward(n),
            taper: hann(n),
            buffer: vec![Complex::new(0.0, 0.0); n * n],
            scratch: vec![Complex::new(0.0, 0.0); n * n],
        }
    }

    /// Orientation and eccentricity of one window of mean-subtracted values
    fn analyze(&mut self, values: &[f64], mean: f64) -> Option<(f64, f64)> {
        let n = self.n;
        for (i, (dst, &value)) in self.buffer.iter_mut().zip(values).enumerate() {
            let (r, c) = (i / n, i % n);
            *dst = Complex::new((value - mean) * self.taper[r] * self.taper[c], 0.0);
        }

        // Rows, then columns through a transpose
        self.fft.process(&mut self.buffer);
        for r in 0..n {
            for c in 0..n {
                self.scratch[c * n + r] = self.buffer[r * n + c];
            }
        }
        self.fft.process(&mut self.scratch);

        // scratch[c * n + r] now holds frequency (fy = r, fx = c)
        let radius = (n / 2) as f64;
        let (mut sw, mut sx, mut sy) = (0.0, 0.0, 0.0);
        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for c in 0..n {
            let fx = shifted_frequency(c, n);
            for r in 0..n {
                let fy = shifted_frequency(r, n);
                if (fx == 0.0 && fy == 0.0) || fx * fx + fy * fy > radius * radius {
                    continue;
                }
                let w = self.scratch[c * n + r].norm();
                sw += w;
                sx += w * fx;
                sy += w * fy;
                sxx += w * fx * fx;
                syy += w * fy * fy;
                sxy += w * fx * fy;
            }
        }

        if sw <= f64::EPSILON {
            return None;
        }
        let (mx, my) = (sx / sw, sy / sw);
        let moments = Matrix2::new(
            sxx / sw - mx * mx,
            sxy / sw - mx * my,
            sxy / sw - mx * my,
            syy / sw - my * my,
        );

        let eig = SymmetricEigen::new(moments);
        let (major, lambda_max, lambda_min) = if eig.eigenvalues[0] >= eig.eigenvalues[1] {
            (eig.eigenvectors.column(0), eig.eigenvalues[0], eig.eigenvalues[1])
        } else {
            (eig.eigenvectors.column(1), eig.eigenvalues[1], eig.eigenvalues[0])
        };
        if !lambda_max.is_finite() || lambda_max <= 0.0 {
            return None;
        }

        // Spectral energy spreads across the fibers
        let theta = wrap_half_pi(major[1].atan2(major[0]) + PI / 2.0);
        let eccentricity = (1.0 - lambda_min.max(0.0) / lambda_max).sqrt();
        Some((theta, eccentricity))
    }
}

/// Local fiber orientation on a regular window grid
pub fn image_local_order(image: &FloatImage, params: &AftParams, mask: Option<&Mask>) -> Result<AftField> {
    let (width, height) = image.dimensions();
    if let Some(mask) = mask {
        if mask.dimensions() != (width, height) {
            return Err(FiberTrackError::DimensionMismatch {
                expected: (width, height),
                actual: mask.dimensions(),
            });
        }
    }
    if !(0.0..1.0).contains(&params.overlap) {
        return Err(FiberTrackError::InvalidParameter(format!(
            "overlap must be in [0, 1), got {}", params.overlap
        )));
    }

    let window = params.effective_window();
    let half = window / 2;
    let step = params.step();
    let rows = centres(height, window, step);
    let cols = centres(width, window, step);
    let count = rows.len() * cols.len();

    let mut field = AftField {
        nrows: rows.len(),
        ncols: cols.len(),
        x: Vec::with_capacity(count),
        y: Vec::with_capacity(count),
        u: Vec::with_capacity(count),
        v: Vec::with_capacity(count),
        theta: Vec::with_capacity(count),
        eccentricity: Vec::with_capacity(count),
    };

    let n = window as usize;
    let mut analyzer = WindowAnalyzer::new(n);
    let mut values = vec![0.0; n * n];

    for &cy in &rows {
        for &cx in &cols {
            field.x.push(cx as f64);
            field.y.push(cy as f64);

            let mut result = None;
            if mask.map_or(true, |m| is_on(m, cx, cy)) {
                for (i, value) in values.iter_mut().enumerate() {
                    let x = cx - half + (i % n) as u32;
                    let y = cy - half + (i / n) as u32;
                    *value = image.get_pixel(x, y)[0];
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                if mean >= params.intensity_thresh {
                    result = analyzer
                        .analyze(&values, mean)
                        .filter(|&(_, ecc)| ecc >= params.eccentricity_thresh);
                }
            }

            let (theta, ecc) = result.unwrap_or((f64::NAN, f64::NAN));
            field.theta.push(theta);
            field.eccentricity.push(ecc);
            field.u.push(theta.cos());
            field.v.push(theta.sin());
        }
    }

    debug!(
        "AFT grid {}x{} (window {}, step {}), {} valid windows",
        field.nrows, field.ncols, window, step, field.valid_count()
    );
    Ok(field)
}

/// Local order value of every window: `2 * nanmean(cos^2(theta_nb - theta_ref) - 0.5)`
/// over the full `(2r+1)^2` neighbourhood, centre included. NaN when the
/// neighbourhood leaves the grid or the centre angle is undefined.
pub fn local_order(field: &AftField, radius: usize) -> Vec<f64> {
    (0..field.len())
        .map(|idx| {
            let (r, c) = (idx / field.ncols, idx % field.ncols);
            neighbourhood_order(field, r, c, radius, true)
        })
        .collect()
}

fn neighbourhood_order(field: &AftField, r: usize, c: usize, radius: usize, include_centre: bool) -> f64 {
    if r < radius || c < radius || r + radius >= field.nrows || c + radius >= field.ncols {
        return f64::NAN;
    }
    let reference = field.theta_at(r, c);
    if reference.is_nan() {
        return f64::NAN;
    }

    let (mut sum, mut count) = (0.0, 0usize);
    for nr in r - radius..=r + radius {
        for nc in c - radius..=c + radius {
            if !include_centre && nr == r && nc == c {
                continue;
            }
            let t = field.theta_at(nr, nc);
            if !t.is_nan() {
                sum += (t - reference).cos().powi(2) - 0.5;
                count += 1;
            }
        }
    }

    if count == 0 { f64::NAN } else { 2.0 * sum / count as f64 }
}

/// Image-level order parameter: median of the neighbourhood order of
/// interior windows, each neighbourhood excluding its own centre
pub fn order_parameter(field: &AftField, radius: usize) -> f64 {
    let mut values: Vec<f64> = (0..field.len())
        .map(|idx| neighbourhood_order(field, idx / field.ncols, idx % field.ncols, radius, false))
        .filter(|v| !v.is_nan())
        .collect();
    if values.is_empty() {
        return f64::NAN;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
