// src/segmentation.rs - Per-window ECM features from ridge masks and skeletons

use image::imageops;
use log::{debug, info};

use crate::aft::{image_local_order, AftField, AftParams};
use crate::config::Config;
use crate::curvature::compute_curvature_from_skeleton;
use crate::errors::Result;
use crate::fractal::{box_counting, default_scales, lacunarity};
use crate::image_io::InputImage;
use crate::image_utils::{count_on, mean, FloatImage, Mask};
use crate::ridge::{prepare_eight_bit, run_multiscale_ridge_detection, RidgeDetection, RidgeParams};
use crate::skeleton::SkeletonGraph;

/// Patch feature settings
#[derive(Debug, Clone)]
pub struct SegmentationParams {
    pub window_size: u32,
    pub curvature_windows: Vec<usize>,
    pub minimum_branch_length: f64,
}

impl SegmentationParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_size: config.window_size as u32,
            curvature_windows: config.curvature_windows.clone(),
            minimum_branch_length: config.minimum_branch_length,
        }
    }
}

/// Features of the patch around one AFT window centre
#[derive(Debug, Clone)]
pub struct SegmentationRow {
    pub image_name: String,
    pub ecm_x: f64,
    pub ecm_y: f64,
    /// Mean image intensity
    pub intensity: f64,
    /// Fraction of the patch covered by detected ridges
    pub hdm: f64,
    pub endpoints: usize,
    pub branch_points: usize,
    pub norm_endpoints: f64,
    pub norm_branch: f64,
    pub curvature_mean: f64,
    /// Box-counting dimension of the skeleton pixels
    pub ffd: f64,
    pub lacunarity: f64,
}

/// Curvature of a patch skeleton averaged over branches, then over window lengths.
/// Window lengths longer than the patch and windows with no long-enough branch are skipped.
fn patch_curvature(patch: &Mask, params: &SegmentationParams) -> f64 {
    let per_branch = compute_curvature_from_skeleton(patch, &params.curvature_windows, params.minimum_branch_length);
    if per_branch.is_empty() {
        return f64::NAN;
    }

    let window_means: Vec<f64> = params
        .curvature_windows
        .iter()
        .filter(|&&w| w <= params.window_size as usize)
        .map(|w| {
            let values: Vec<f64> = per_branch
                .iter()
                .filter_map(|b| b.per_window.get(w).copied())
                .filter(|v| !v.is_nan())
                .collect();
            if values.is_empty() {
                f64::NAN
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        })
        .collect();

    if window_means.is_empty() {
        f64::NAN
    } else {
        window_means.iter().sum::<f64>() / window_means.len() as f64
    }
}

/// Box-counting dimension of the on pixels, coordinates scaled by patch size - 1
fn patch_fractal_dimension(patch: &Mask) -> f64 {
    let (w, h) = patch.dimensions();
    let sx = (w.max(2) - 1) as f64;
    let sy = (h.max(2) - 1) as f64;
    let points: Vec<(f64, f64)> = patch
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| (x as f64 / sx, y as f64 / sy))
        .collect();
    box_counting(&points, &default_scales()).fd
}

/// Features of the square patch `[c - half, c + half)` around a window centre.
///
/// Returns `None` when the patch leaves the image or holds no skeleton pixel.
pub fn patch_features(
    image_name: &str,
    centre: (u32, u32),
    image: &FloatImage,
    detection: &RidgeDetection,
    skeleton: &Mask,
    params: &SegmentationParams,
) -> Option<SegmentationRow> {
    let half = params.window_size / 2;
    let (cx, cy) = centre;
    let (width, height) = image.dimensions();
    if cx < half || cy < half || cx + half > width || cy + half > height || half == 0 {
        return None;
    }
    let (x1, y1, side) = (cx - half, cy - half, 2 * half);

    let skel_patch = imageops::crop_imm(skeleton, x1, y1, side, side).to_image();
    if count_on(&skel_patch) == 0 {
        return None;
    }
    let im_patch = imageops::crop_imm(image, x1, y1, side, side).to_image();
    let mask_patch = imageops::crop_imm(&detection.mask, x1, y1, side, side).to_image();

    let values = im_patch.as_raw();
    let intensity = mean(values);
    let hdm = count_on(&mask_patch) as f64 / (side * side) as f64;

    let graph = SkeletonGraph::from_mask(&skel_patch);
    let endpoints = graph.endpoint_count();
    let branch_points = graph.branch_point_count();
    let total = graph.total_branch_distance();
    let (norm_endpoints, norm_branch) = if total > 0.0 {
        (endpoints as f64 / total, branch_points as f64 / total)
    } else {
        (f64::NAN, f64::NAN)
    };

    Some(SegmentationRow {
        image_name: image_name.to_string(),
        ecm_x: cx as f64,
        ecm_y: cy as f64,
        intensity,
        hdm,
        endpoints,
        branch_points,
        norm_endpoints,
        norm_branch,
        curvature_mean: patch_curvature(&skel_patch, params),
        ffd: patch_fractal_dimension(&skel_patch),
        lacunarity: lacunarity(values),
    })
}

/// Patch features for every window of one image's AFT grid
pub fn image_segmentation_features(
    input: &InputImage,
    field: &AftField,
    detection: &RidgeDetection,
    params: &SegmentationParams,
) -> Vec<SegmentationRow> {
    let Some(skeleton) = detection.skeleton.as_ref() else {
        info!("{}: no skeleton, skipping patch features", input.label);
        return Vec::new();
    };

    let rows: Vec<SegmentationRow> = field
        .x
        .iter()
        .zip(&field.y)
        .filter_map(|(&x, &y)| {
            patch_features(&input.label, (x as u32, y as u32), &input.image, detection, skeleton, params)
        })
        .collect();

    debug!("{}: {} of {} patches carry skeleton", input.label, rows.len(), field.len());
    rows
}

/// Ridge detection on one image, restricted to the region of interest
pub fn detect_ridges(input: &InputImage, roi: Option<&Mask>, ridge: &RidgeParams) -> Result<RidgeDetection> {
    let eight_bit = prepare_eight_bit(&input.image, input.image_u8.as_ref());
    run_multiscale_ridge_detection(&eight_bit, roi, ridge)
}

/// Patch features for a batch of images
pub fn segmentation_features(
    images: &[InputImage],
    aft: &AftParams,
    ridge: &RidgeParams,
    params: &SegmentationParams,
    roi: Option<&Mask>,
) -> Result<Vec<SegmentationRow>> {
    let mut rows = Vec::new();
    for input in images {
        let field = image_local_order(&input.image, aft, roi)?;
        let detection = detect_ridges(input, roi, ridge)?;
        rows.extend(image_segmentation_features(input, &field, &detection, params));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use image::{ImageBuffer, Luma};
    use std::path::PathBuf;
    use crate::image_utils::{is_on, set_mask};

    fn params() -> SegmentationParams {
        SegmentationParams {
            window_size: 20,
            curvature_windows: vec![5, 40],
            minimum_branch_length: 3.0,
        }
    }

    fn detection_with(skeleton: Mask) -> RidgeDetection {
        RidgeDetection { mask: skeleton.clone(), skeleton: Some(skeleton) }
    }

    fn line_skeleton(width: u32, height: u32) -> Mask {
        let mut mask = Mask::new(width, height);
        for x in 5..35 {
            set_mask(&mut mask, x, 20, true);
        }
        mask
    }

    #[test]
    fn straight_line_patch_features() {
        let image: FloatImage = ImageBuffer::from_pixel(40, 40, Luma([0.25]));
        let skeleton = line_skeleton(40, 40);
        let detection = detection_with(skeleton.clone());

        let row = patch_features("img", (20, 20), &image, &detection, &skeleton, &params()).unwrap();
        assert_approx_eq!(row.intensity, 0.25);
        // 20 skeleton pixels on one row of a 20 x 20 patch
        assert_approx_eq!(row.hdm, 20.0 / 400.0);
        assert_eq!(row.endpoints, 2);
        assert_eq!(row.branch_points, 0);
        assert_approx_eq!(row.norm_endpoints, 2.0 / 19.0);
        assert_approx_eq!(row.curvature_mean, 0.0);
        assert_approx_eq!(row.lacunarity, 1.0);
        // Twenty pixels saturate the finest boxes, so the estimate sits below 1
        assert!(row.ffd > 0.3 && row.ffd <= 1.1, "ffd = {}", row.ffd);
    }

    #[test]
    fn empty_or_clipped_patches_are_skipped() {
        let image: FloatImage = ImageBuffer::from_pixel(40, 40, Luma([0.25]));
        let skeleton = line_skeleton(40, 40);
        let detection = detection_with(skeleton.clone());

        assert!(patch_features("img", (20, 5), &image, &detection, &skeleton, &params()).is_none());
        assert!(patch_features("img", (5, 20), &image, &detection, &skeleton, &params()).is_none());
        assert!(patch_features("img", (20, 32), &image, &detection, &skeleton, &params()).is_none());
    }

    #[test]
    fn image_without_skeleton_yields_no_rows() {
        let input = InputImage {
            image: ImageBuffer::from_pixel(40, 40, Luma([0.5])),
            image_u8: None,
            path: PathBuf::from("blank.png"),
            label: "blank".to_string(),
        };
        let field = image_local_order(
            &input.image,
            &AftParams { window_size: 20, overlap: 0.5, intensity_thresh: 0.0, eccentricity_thresh: 0.0 },
            None,
        )
        .unwrap();
        let detection = RidgeDetection { mask: Mask::new(40, 40), skeleton: None };
        assert!(image_segmentation_features(&input, &field, &detection, &params()).is_empty());
    }

    fn bright_line_input() -> InputImage {
        let image_u8 = ImageBuffer::from_fn(60, 60, |x, _| Luma([if x.abs_diff(30) <= 1 { 200u8 } else { 20 }]));
        InputImage {
            image: ImageBuffer::from_fn(60, 60, |x, y| Luma([image_u8.get_pixel(x, y)[0] as f64 / 255.0])),
            image_u8: Some(image_u8),
            path: PathBuf::from("line.png"),
            label: "line".to_string(),
        }
    }

    fn ridge_params() -> RidgeParams {
        RidgeParams {
            min_line_width: 2,
            max_line_width: 4,
            contrast_low: 0.0,
            contrast_high: 120.0,
            dark_line: false,
            do_enhance_contrast: false,
            intensity_clip_percent: 0.35,
            do_skeleton: true,
            prune_short: false,
            minimum_branch_length: 0.0,
        }
    }

    #[test]
    fn detected_skeleton_feeds_patch_features() {
        let input = bright_line_input();
        let aft = AftParams { window_size: 21, overlap: 0.5, intensity_thresh: 0.0, eccentricity_thresh: 0.0 };
        let ridge = ridge_params();

        let detection = detect_ridges(&input, None, &ridge).unwrap();
        let skeleton = detection.skeleton.clone().expect("ridge band should leave a skeleton");

        let rows = segmentation_features(std::slice::from_ref(&input), &aft, &ridge, &params(), None).unwrap();
        assert!(!rows.is_empty());

        for row in &rows {
            let (x1, y1) = (row.ecm_x as u32 - 10, row.ecm_y as u32 - 10);
            let mut ridge_pixels = 0;
            let mut skeleton_pixels = 0;
            let mut intensity = 0.0;
            for y in y1..y1 + 20 {
                for x in x1..x1 + 20 {
                    ridge_pixels += is_on(&detection.mask, x, y) as usize;
                    skeleton_pixels += is_on(&skeleton, x, y) as usize;
                    intensity += input.image.get_pixel(x, y)[0];
                }
            }
            assert_eq!(row.image_name, "line");
            assert!(skeleton_pixels > 0);
            assert_approx_eq!(row.hdm, ridge_pixels as f64 / 400.0);
            assert_approx_eq!(row.intensity, intensity / 400.0);
        }
    }

    #[test]
    fn batch_matches_per_image_features() {
        let input = bright_line_input();
        let aft = AftParams { window_size: 21, overlap: 0.5, intensity_thresh: 0.0, eccentricity_thresh: 0.0 };
        let ridge = ridge_params();

        let field = image_local_order(&input.image, &aft, None).unwrap();
        let detection = detect_ridges(&input, None, &ridge).unwrap();
        let single = image_segmentation_features(&input, &field, &detection, &params());
        assert!(!single.is_empty());

        let batch = segmentation_features(&[bright_line_input(), bright_line_input()], &aft, &ridge, &params(), None).unwrap();
        assert_eq!(batch.len(), 2 * single.len());
        assert_approx_eq!(batch[0].hdm, single[0].hdm);
        assert_eq!(batch[single.len()].ecm_x, single[0].ecm_x);
    }
}
