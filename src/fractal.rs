use std::collections::HashSet;

use crate::image_utils::{mean, variance};

/// Number of grid shifts per axis tried at every scale
const OVERSAMPLE_SHIFTS: usize = 4;

#[derive(Debug, Clone)]
pub struct BoxCountResult {
    /// Fractal dimension, NaN when it cannot be fitted
    pub fd: f64,
    pub scales: Vec<f64>,
    pub counts: Vec<usize>,
}

/// Five log-spaced box sizes between 0.02 and 0.25 of the unit square
pub fn default_scales() -> Vec<f64> {
    log_spaced(0.02, 0.25, 5)
}

fn log_spaced(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let (a, b) = (start.log10(), end.log10());
    (0..n)
        .map(|i| 10f64.powf(a + (b - a) * i as f64 / (n - 1) as f64))
        .collect()
}

/// Occupied boxes of side `scale`, minimised over shifted grid origins
fn count_boxes(points: &[(f64, f64)], scale: f64) -> usize {
    let mut best = usize::MAX;
    for sx in 0..OVERSAMPLE_SHIFTS {
        for sy in 0..OVERSAMPLE_SHIFTS {
            let ox = scale * sx as f64 / OVERSAMPLE_SHIFTS as f64;
            let oy = scale * sy as f64 / OVERSAMPLE_SHIFTS as f64;
            let boxes: HashSet<(i64, i64)> = points
                .iter()
                .map(|&(x, y)| (((x + ox) / scale).floor() as i64, ((y + oy) / scale).floor() as i64))
                .collect();
            best = best.min(boxes.len());
        }
    }
    best
}

/// Least-squares slope of y against x
fn slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let sxx: f64 = x.iter().map(|a| (a - mx) * (a - mx)).sum();
    if sxx == 0.0 { f64::NAN } else { sxy / sxx }
}

/// Box-counting fractal dimension of points in the unit square
pub fn box_counting(points: &[(f64, f64)], scales: &[f64]) -> BoxCountResult {
    let scales: Vec<f64> = scales.iter().copied().filter(|s| *s > 0.0).collect();
    if points.is_empty() || scales.len() < 2 {
        return BoxCountResult { fd: f64::NAN, counts: vec![0; scales.len()], scales };
    }

    let counts: Vec<usize> = scales.iter().map(|&s| count_boxes(points, s)).collect();
    let ln_s: Vec<f64> = scales.iter().map(|s| s.ln()).collect();
    let ln_n: Vec<f64> = counts.iter().map(|&c| (c as f64).ln()).collect();

    BoxCountResult {
        fd: -slope(&ln_s, &ln_n),
        scales,
        counts,
    }
}

/// Lacunarity of an intensity patch: |variance / mean^2 - 1|
pub fn lacunarity(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    (variance(values) / (m * m) - 1.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn default_scales_are_log_spaced() {
        let s = default_scales();
        assert_eq!(s.len(), 5);
        assert_approx_eq!(s[0], 0.02);
        assert_approx_eq!(s[4], 0.25);
        assert_approx_eq!(s[1] / s[0], s[2] / s[1]);
    }

    #[test]
    fn filled_square_has_dimension_near_two() {
        let n = 200;
        let points: Vec<(f64, f64)> = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i as f64 / (n - 1) as f64, j as f64 / (n - 1) as f64)))
            .collect();
        let result = box_counting(&points, &default_scales());
        assert!((result.fd - 2.0).abs() < 0.25, "fd = {}", result.fd);
    }

    #[test]
    fn line_has_dimension_near_one() {
        let points: Vec<(f64, f64)> = (0..1000).map(|i| (i as f64 / 999.0, 0.5)).collect();
        let result = box_counting(&points, &default_scales());
        assert!((result.fd - 1.0).abs() < 0.15, "fd = {}", result.fd);
        assert!(result.counts.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn no_points_gives_nan() {
        assert!(box_counting(&[], &default_scales()).fd.is_nan());
    }

    #[test]
    fn lacunarity_of_uniform_patch_is_one() {
        assert_approx_eq!(lacunarity(&[0.4; 16]), 1.0);
    }

    #[test]
    fn lacunarity_uses_population_variance() {
        // mean 0.5, variance 0.25
        assert_approx_eq!(lacunarity(&[0.0, 1.0]), 0.0);
    }
}
