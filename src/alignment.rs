// src/alignment.rs - Alignment of cell tracks with the local fiber field

use log::{info, warn};
use rayon::prelude::*;

use crate::aft::{image_local_order, local_order, AftField, AftParams};
use crate::errors::Result;
use crate::image_io::InputImage;
use crate::image_utils::Mask;
use crate::kdtree::KdTree;
use crate::tracks::{group_by_track, Spot};

/// Identifier of the `idx`-th window of an AFT grid
pub fn ecm_id(idx: usize) -> String {
    format!("ECM_{}", idx + 1)
}

/// One track step matched to its nearest AFT window
#[derive(Debug, Clone)]
pub struct AlignmentRow {
    /// Spot the step starts from
    pub spot: Spot,
    pub image_name: String,
    pub ecm_id: String,
    pub ecm_x: f64,
    pub ecm_y: f64,
    pub track_angle: f64,
    pub aft_angle: f64,
    /// AFT angle minus track angle
    pub delta_phi: f64,
    /// cos^2 of `delta_phi`: 1 when the cell moves along the fibers
    pub alignment_index: f64,
    pub aft_eccentricity: f64,
    pub track_angle_u: f64,
    pub track_angle_v: f64,
    pub aft_angle_u: f64,
    pub aft_angle_v: f64,
}

/// Local order value of one AFT window
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub image_name: String,
    pub ecm_id: String,
    pub ecm_x: f64,
    pub ecm_y: f64,
    pub order_value: f64,
    pub window_size: u32,
    pub overlap: f64,
    pub neighborhood_radius: usize,
}

/// Match every step of every track on one image to the fiber field
pub fn track_alignment(image_name: &str, field: &AftField, spots: &[Spot]) -> Vec<AlignmentRow> {
    let on_image: Vec<Spot> = spots
        .iter()
        .filter(|s| s.file_name_raw == image_name)
        .cloned()
        .collect();
    if on_image.is_empty() {
        return Vec::new();
    }

    let tree = KdTree::from_xy(&field.x, &field.y);
    if tree.is_empty() {
        warn!("{}: AFT grid is empty, {} spots left unmatched", image_name, on_image.len());
        return Vec::new();
    }

    let mut rows = Vec::new();
    for (_, mut track) in group_by_track(&on_image) {
        track.dedup_by_key(|s| s.frame);

        for pair in track.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            let Some((_, idx)) = tree.nearest([current.position_x, current.position_y]) else {
                continue;
            };

            let dx = next.position_x - current.position_x;
            let dy = next.position_y - current.position_y;
            let norm = (dx * dx + dy * dy).sqrt();
            let track_angle = if norm > 0.0 {
                (dy / norm).atan2(dx / norm)
            } else {
                f64::NAN
            };

            let aft_angle = field.theta[idx];
            let delta_phi = aft_angle - track_angle;
            rows.push(AlignmentRow {
                spot: current.clone(),
                image_name: image_name.to_string(),
                ecm_id: ecm_id(idx),
                ecm_x: field.x[idx],
                ecm_y: field.y[idx],
                track_angle,
                aft_angle,
                delta_phi,
                alignment_index: delta_phi.cos().powi(2),
                aft_eccentricity: field.eccentricity[idx],
                track_angle_u: track_angle.cos(),
                track_angle_v: track_angle.sin(),
                aft_angle_u: aft_angle.cos(),
                aft_angle_v: aft_angle.sin(),
            });
        }
    }

    rows
}

/// Local order rows for every window of one image
pub fn order_rows(image_name: &str, field: &AftField, params: &AftParams, radius: usize) -> Vec<OrderRow> {
    local_order(field, radius)
        .into_iter()
        .enumerate()
        .map(|(idx, order_value)| OrderRow {
            image_name: image_name.to_string(),
            ecm_id: ecm_id(idx),
            ecm_x: field.x[idx],
            ecm_y: field.y[idx],
            order_value,
            window_size: params.window_size,
            overlap: params.overlap,
            neighborhood_radius: radius,
        })
        .collect()
}

/// Track/fiber alignment for a batch of images
pub fn aft_ai_metric(
    images: &[InputImage],
    spots: &[Spot],
    params: &AftParams,
    mask: Option<&Mask>,
) -> Result<Vec<AlignmentRow>> {
    let per_image = images
        .par_iter()
        .map(|input| -> Result<Vec<AlignmentRow>> {
            let field = image_local_order(&input.image, params, mask)?;
            let rows = track_alignment(&input.label, &field, spots);
            info!("{}: {} track steps matched", input.label, rows.len());
            Ok(rows)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_image.into_iter().flatten().collect())
}

/// Local order parameter for a batch of images
pub fn aft_order_parameter(
    images: &[InputImage],
    params: &AftParams,
    mask: Option<&Mask>,
    radius: usize,
) -> Result<Vec<OrderRow>> {
    let per_image = images
        .par_iter()
        .map(|input| -> Result<Vec<OrderRow>> {
            let field = image_local_order(&input.image, params, mask)?;
            Ok(order_rows(&input.label, &field, params, radius))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_image.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use image::{ImageBuffer, Luma};
    use std::f64::consts::PI;
    use std::path::PathBuf;
    use crate::errors::FiberTrackError;

    fn field(theta: f64) -> AftField {
        // 3 x 3 grid with centres 10 px apart
        let n = 9;
        AftField {
            nrows: 3,
            ncols: 3,
            x: (0..n).map(|i| 10.0 + 10.0 * (i % 3) as f64).collect(),
            y: (0..n).map(|i| 10.0 + 10.0 * (i / 3) as f64).collect(),
            u: vec![theta.cos(); n],
            v: vec![theta.sin(); n],
            theta: vec![theta; n],
            eccentricity: vec![0.8; n],
        }
    }

    fn spot(track_id: i64, frame: i64, x: f64, y: f64, image: &str) -> Spot {
        Spot {
            track_id,
            frame,
            position_x: x,
            position_y: y,
            file_name_raw: image.to_string(),
            condition: None,
        }
    }

    #[test]
    fn motion_along_fibers_is_aligned() {
        let spots = vec![
            spot(7, 0, 11.0, 9.0, "img"),
            spot(7, 1, 21.0, 9.0, "img"),
            spot(7, 2, 31.0, 9.0, "img"),
            spot(8, 0, 0.0, 0.0, "other"),
        ];
        let rows = track_alignment("img", &field(0.0), &spots);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ecm_id, "ECM_1");
        assert_eq!(rows[1].ecm_id, "ECM_2");
        assert_approx_eq!(rows[1].ecm_x, 20.0);
        assert_approx_eq!(rows[0].track_angle, 0.0);
        assert_approx_eq!(rows[0].alignment_index, 1.0);
        assert_approx_eq!(rows[0].aft_eccentricity, 0.8);
        assert_eq!(rows[0].spot.frame, 0);
    }

    #[test]
    fn perpendicular_motion_has_zero_index() {
        let spots = vec![spot(1, 0, 20.0, 20.0, "img"), spot(1, 1, 20.0, 25.0, "img")];
        let rows = track_alignment("img", &field(0.0), &spots);
        assert_eq!(rows.len(), 1);
        assert_approx_eq!(rows[0].track_angle, PI / 2.0);
        assert_approx_eq!(rows[0].alignment_index, 0.0);
        assert_eq!(rows[0].ecm_id, "ECM_5");
    }

    #[test]
    fn duplicate_frames_and_stalls() {
        let spots = vec![
            spot(1, 0, 10.0, 10.0, "img"),
            spot(1, 0, 50.0, 50.0, "img"),
            spot(1, 1, 10.0, 10.0, "img"),
        ];
        let rows = track_alignment("img", &field(0.3), &spots);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].track_angle.is_nan());
        assert!(rows[0].alignment_index.is_nan());
        assert_approx_eq!(rows[0].aft_angle, 0.3);
    }

    #[test]
    fn spots_without_position_are_left_unmatched() {
        let spots = vec![
            spot(1, 0, f64::NAN, 10.0, "img"),
            spot(1, 1, 20.0, 10.0, "img"),
            spot(1, 2, 30.0, 10.0, "img"),
        ];
        let rows = track_alignment("img", &field(0.0), &spots);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].spot.frame, 1);
        assert_eq!(rows[0].ecm_id, "ECM_2");
    }

    #[test]
    fn order_rows_cover_every_window() {
        let params = AftParams {
            window_size: 33,
            overlap: 0.5,
            intensity_thresh: 0.0,
            eccentricity_thresh: 0.0,
        };
        let rows = order_rows("img", &field(0.1), &params, 1);
        assert_eq!(rows.len(), 9);
        assert!(rows[0].order_value.is_nan());
        assert_approx_eq!(rows[4].order_value, 1.0);
        assert_eq!(rows[8].ecm_id, "ECM_9");
        assert_eq!(rows[4].neighborhood_radius, 1);
    }

    fn stripe_input(label: &str) -> InputImage {
        InputImage {
            image: ImageBuffer::from_fn(100, 100, |x, _| {
                Luma([0.5 + 0.4 * (2.0 * PI * x as f64 / 8.0).sin()])
            }),
            image_u8: None,
            path: PathBuf::from(format!("{}.png", label)),
            label: label.to_string(),
        }
    }

    fn batch_params() -> AftParams {
        AftParams {
            window_size: 33,
            overlap: 0.5,
            intensity_thresh: 0.0,
            eccentricity_thresh: 0.0,
        }
    }

    #[test]
    fn batch_alignment_matches_each_image_separately() {
        let images = vec![stripe_input("a"), stripe_input("b")];
        let spots = vec![
            spot(1, 0, 50.0, 30.0, "a"),
            spot(1, 1, 50.0, 45.0, "a"),
            spot(2, 0, 30.0, 50.0, "b"),
            spot(2, 1, 45.0, 50.0, "b"),
            spot(2, 2, 60.0, 50.0, "b"),
        ];

        let rows = aft_ai_metric(&images, &spots, &batch_params(), None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].image_name, "a");
        // Vertical motion along vertical fibers, horizontal motion across them
        assert!(rows[0].alignment_index > 0.9, "AI = {}", rows[0].alignment_index);
        assert!(rows[1..].iter().all(|r| r.image_name == "b" && r.alignment_index < 0.1));
    }

    #[test]
    fn batch_order_covers_every_window_of_every_image() {
        let images = vec![stripe_input("a"), stripe_input("b")];
        let rows = aft_order_parameter(&images, &batch_params(), None, 1).unwrap();

        assert_eq!(rows.len(), 32);
        assert_eq!(rows[16].image_name, "b");
        assert_eq!(rows[16].ecm_id, "ECM_1");
        // Window (1, 1) is interior to the 4 x 4 grid
        assert!(rows[5].order_value > 0.9, "order = {}", rows[5].order_value);
        assert!(rows[0].order_value.is_nan());
    }

    #[test]
    fn batch_propagates_mask_mismatch() {
        let images = vec![stripe_input("a")];
        let mask = Mask::new(10, 10);
        assert!(matches!(
            aft_order_parameter(&images, &batch_params(), Some(&mask), 1),
            Err(FiberTrackError::DimensionMismatch { .. })
        ));
    }
}
