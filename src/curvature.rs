use std::collections::BTreeMap;

use crate::image_utils::Mask;
use crate::skeleton::SkeletonGraph;

/// Curvature values of one branch, keyed by window length
#[derive(Debug, Clone)]
pub struct BranchCurvature {
    pub branch_id: usize,
    pub branch_distance: f64,
    pub per_window: BTreeMap<usize, f64>,
}

/// Mean deviation of a pixel path from the chords of sliding windows.
///
/// Every segment `coords[i..i + window]` is compared with the straight line
/// joining its first and last pixel; the perpendicular distances of its pixels
/// are averaged, and the segment averages are averaged again. Returns NaN when
/// the path is shorter than the window or no segment has a non-degenerate chord.
pub fn curvature(coords: &[(u32, u32)], window: usize) -> f64 {
    if window == 0 || coords.len() < window {
        return f64::NAN;
    }

    let mut segment_means = Vec::new();
    for i in 0..coords.len() - window {
        let segment = &coords[i..i + window];
        let (y0, x0) = (segment[0].0 as f64, segment[0].1 as f64);
        let (y1, x1) = (segment[window - 1].0 as f64, segment[window - 1].1 as f64);

        let (lx, ly) = (x1 - x0, y1 - y0);
        let chord = (lx * lx + ly * ly).sqrt();
        if chord == 0.0 {
            continue;
        }
        let (ux, uy) = (lx / chord, ly / chord);

        let total: f64 = segment
            .iter()
            .map(|&(row, col)| {
                let px = col as f64 - x0;
                let py = row as f64 - y0;
                // |p x u| is the distance from the chord line
                (px * uy - py * ux).abs()
            })
            .sum();
        segment_means.push(total / window as f64);
    }

    if segment_means.is_empty() {
        f64::NAN
    } else {
        segment_means.iter().sum::<f64>() / segment_means.len() as f64
    }
}

/// Length-normalised curvature of every branch at least `min_pixels` long
pub fn compute_curvature_from_skeleton(
    skeleton: &Mask,
    windows: &[usize],
    min_pixels: f64,
) -> Vec<BranchCurvature> {
    let graph = SkeletonGraph::from_mask(skeleton);

    graph
        .branches()
        .iter()
        .enumerate()
        .filter(|(_, b)| b.distance >= min_pixels)
        .map(|(branch_id, b)| {
            let per_window = windows
                .iter()
                .map(|&w| {
                    let c = curvature(&b.path, w);
                    let c = if !c.is_nan() && b.distance > 0.0 { c / b.distance } else { c };
                    (w, c)
                })
                .collect();
            BranchCurvature {
                branch_id,
                branch_distance: b.distance,
                per_window,
            }
        })
        .collect()
}
