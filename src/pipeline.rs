// src/pipeline.rs - Per-image orchestration and batch driver

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bresenham::Bresenham;
use image::{Rgb, RgbImage};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::aft::{image_local_order, order_parameter, AftField, AftParams};
use crate::alignment::{order_rows, track_alignment, AlignmentRow, OrderRow};
use crate::config::Config;
use crate::errors::{FiberTrackError, Result};
use crate::image_io::{collect_inputs, load_image, load_mask, save_image, InputImage};
use crate::image_utils::{create_debug_image, float_to_u8, in_bounds, Mask};
use crate::output;
use crate::ridge::RidgeParams;
use crate::segmentation::{detect_ridges, image_segmentation_features, SegmentationParams, SegmentationRow};
use crate::skeleton::SkeletonGraph;
use crate::tracks::{self, load_spots, Spot};

/// Analyses that can be requested for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    Alignment,
    Order,
    Segmentation,
    Tracks,
    All,
}

impl Analysis {
    fn alignment(self) -> bool {
        matches!(self, Analysis::Alignment | Analysis::All)
    }

    fn order(self) -> bool {
        matches!(self, Analysis::Order | Analysis::All)
    }

    fn segmentation(self) -> bool {
        matches!(self, Analysis::Segmentation | Analysis::All)
    }

    fn tracks(self) -> bool {
        matches!(self, Analysis::Tracks | Analysis::All)
    }

    /// Whether the analysis reads the input images
    pub fn needs_images(self) -> bool {
        self.alignment() || self.order() || self.segmentation()
    }

    fn needs_spots(self) -> bool {
        self.alignment() || self.tracks()
    }
}

/// Everything computed for one image
#[derive(Debug, Default)]
pub struct ImageResults {
    pub label: String,
    pub alignment: Vec<AlignmentRow>,
    pub order: Vec<OrderRow>,
    pub segmentation: Vec<SegmentationRow>,
    /// Image-level median of the neighbourhood order
    pub order_parameter: Option<f64>,
}

/// Files written by a run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub images_processed: usize,
    pub images_failed: usize,
    pub outputs: Vec<PathBuf>,
}

const RIDGE_COLOR: [u8; 3] = [255, 64, 64];
const SKELETON_COLOR: [u8; 3] = [255, 255, 0];
const ORIENTATION_COLOR: Rgb<u8> = Rgb([0, 200, 255]);

/// Draw one segment per valid window along its fiber direction
pub fn draw_orientation_overlay(base: &RgbImage, field: &AftField, length: f64) -> RgbImage {
    let mut overlay = base.clone();
    let (width, height) = overlay.dimensions();
    let half = length / 2.0;

    for i in 0..field.len() {
        if field.theta[i].is_nan() {
            continue;
        }
        let (dx, dy) = (field.u[i] * half, field.v[i] * half);
        let start = ((field.x[i] - dx).round() as isize, (field.y[i] - dy).round() as isize);
        let end = ((field.x[i] + dx).round() as isize, (field.y[i] + dy).round() as isize);

        for (x, y) in Bresenham::new(start, end).chain(std::iter::once(end)) {
            if in_bounds(x as i64, y as i64, width, height) {
                overlay.put_pixel(x as u32, y as u32, ORIENTATION_COLOR);
            }
        }
    }
    overlay
}

fn save_debug_images(
    input: &InputImage,
    field: Option<&AftField>,
    ridge_mask: Option<&Mask>,
    skeleton: Option<&Mask>,
    window: u32,
    debug_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(debug_dir)?;
    let label = &input.label;

    if let Some(field) = field {
        let base = image::DynamicImage::ImageLuma8(float_to_u8(&input.image)).to_rgb8();
        let overlay = draw_orientation_overlay(&base, field, window as f64 * 0.8);
        save_image(overlay, debug_dir.join(format!("{}_aft_orientation.png", label)))?;
    }
    if let Some(mask) = ridge_mask {
        let img = create_debug_image(&input.image, mask, RIDGE_COLOR);
        save_image(img, debug_dir.join(format!("{}_ridge_mask.png", label)))?;
    }
    if let Some(skeleton) = skeleton {
        let img = create_debug_image(&input.image, skeleton, SKELETON_COLOR);
        save_image(img, debug_dir.join(format!("{}_skeleton.png", label)))?;

        let summary = SkeletonGraph::from_mask(skeleton).summarize();
        output::write_branch_summary_csv(&summary, debug_dir.join(format!("{}_branches.csv", label)))?;
    }

    debug!("Saved debug images for {} to {}", label, debug_dir.display());
    Ok(())
}

/// Run the selected per-image analyses
pub fn process_image(
    input: &InputImage,
    spots: Option<&[Spot]>,
    roi: Option<&Mask>,
    config: &Config,
    analysis: Analysis,
    debug_dir: Option<&Path>,
) -> Result<ImageResults> {
    let aft = AftParams::from_config(config);
    let mut results = ImageResults {
        label: input.label.clone(),
        ..ImageResults::default()
    };

    let field = image_local_order(&input.image, &aft, roi)?;
    info!(
        "{}: {}x{} windows, {} oriented",
        input.label, field.nrows, field.ncols, field.valid_count()
    );

    if analysis.alignment() {
        if let Some(spots) = spots {
            results.alignment = track_alignment(&input.label, &field, spots);
            if results.alignment.is_empty() {
                warn!("{}: no track steps matched this image", input.label);
            }
        }
    }

    if analysis.order() {
        results.order = order_rows(&input.label, &field, &aft, config.neighborhood_radius);
        let op = order_parameter(&field, config.neighborhood_radius);
        info!("{}: order parameter {:.4}", input.label, op);
        results.order_parameter = Some(op);
    }

    let mut detection = None;
    if analysis.segmentation() {
        let ridge = RidgeParams::from_config(config);
        let found = detect_ridges(input, roi, &ridge)?;
        results.segmentation =
            image_segmentation_features(input, &field, &found, &SegmentationParams::from_config(config));
        detection = Some(found);
    }

    if let Some(dir) = debug_dir {
        save_debug_images(
            input,
            Some(&field),
            detection.as_ref().map(|d| &d.mask),
            detection.as_ref().and_then(|d| d.skeleton.as_ref()),
            aft.effective_window(),
            dir,
        )?;
    }

    Ok(results)
}

fn load_and_process(
    path: &Path,
    spots: Option<&[Spot]>,
    roi: Option<&Mask>,
    config: &Config,
    analysis: Analysis,
    debug_dir: Option<&Path>,
) -> Result<ImageResults> {
    info!("Processing: {}", path.display());
    let input = load_image(path)?;
    process_image(&input, spots, roi, config, analysis, debug_dir)
}

/// Run a whole batch: load inputs, analyse every image, write the result tables
pub fn run(config: &Config, analysis: Analysis, debug: bool) -> Result<RunSummary> {
    let start_time = Instant::now();
    let output_dir = PathBuf::from(&config.output_base_dir);
    fs::create_dir_all(&output_dir)?;
    let debug_dir = debug.then(|| output_dir.join("debug"));

    let spots = if analysis.needs_spots() {
        match &config.tracks_path {
            Some(path) => Some(load_spots(path, config.position_scale)?),
            None => {
                return Err(FiberTrackError::Config(
                    "tracks_path is required for alignment and track analyses".to_string(),
                ))
            }
        }
    } else {
        None
    };

    let roi = config.mask_path.as_ref().map(load_mask).transpose()?;

    let mut summary = RunSummary::default();
    let mut per_image = Vec::new();

    if analysis.needs_images() {
        let files = collect_inputs(&config.input_path)?;
        info!("Found {} image files", files.len());

        let process = |path: &PathBuf| {
            load_and_process(path, spots.as_deref(), roi.as_ref(), config, analysis, debug_dir.as_deref())
                .map_err(|e| {
                    error!("Error processing {}: {}", path.display(), e);
                    e
                })
        };

        let outcomes: Vec<Result<ImageResults>> = if config.use_parallel {
            files.par_iter().map(process).collect()
        } else {
            files.iter().map(process).collect()
        };

        for outcome in outcomes {
            match outcome {
                Ok(results) => {
                    summary.images_processed += 1;
                    per_image.push(results);
                }
                Err(_) => summary.images_failed += 1,
            }
        }
    }

    let alignment: Vec<AlignmentRow> = per_image.iter_mut().flat_map(|r| r.alignment.drain(..)).collect();
    let order: Vec<OrderRow> = per_image.iter_mut().flat_map(|r| r.order.drain(..)).collect();
    let segmentation: Vec<SegmentationRow> = per_image.iter_mut().flat_map(|r| r.segmentation.drain(..)).collect();

    if analysis.alignment() {
        let orientation = tracks::calculate_fiber_orientation(
            alignment.iter().map(|r| (r.spot.condition_label(), r.aft_angle)),
        );
        let path = output_dir.join("alignment.csv");
        output::write_alignment_csv(&alignment, Some(&orientation), &path)?;
        summary.outputs.push(path);
    }

    if analysis.order() {
        let path = output_dir.join("order_parameter.csv");
        output::write_order_csv(&order, &path)?;
        summary.outputs.push(path);
    }

    if analysis.segmentation() {
        let path = output_dir.join("segmentation_features.csv");
        output::write_segmentation_csv(&segmentation, &path)?;
        summary.outputs.push(path);
    }

    if analysis.alignment() {
        let merged = output::data_saving_spots_only(
            &alignment,
            analysis.segmentation().then_some(segmentation.as_slice()),
            analysis.order().then_some(order.as_slice()),
            &output_dir,
        )?;
        summary.outputs.push(merged);
    }

    if analysis.tracks() {
        if let Some(spots) = &spots {
            summary.outputs.extend(write_track_tables(spots, &alignment, config, &output_dir)?);
        }
    }

    let params_path = output_dir.join("parameters.json");
    config.save_parameters_json(&params_path)?;
    summary.outputs.push(params_path);

    info!(
        "Processed {} images ({} failed) in {:.2} seconds",
        summary.images_processed,
        summary.images_failed,
        start_time.elapsed().as_secs_f64()
    );
    Ok(summary)
}

fn write_track_tables(
    spots: &[Spot],
    alignment: &[AlignmentRow],
    config: &Config,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let metrics = tracks::track_additional_metrics(spots, config.time_step);
    let path = output_dir.join("track_metrics.csv");
    output::write_track_metrics_csv(&metrics, &path)?;
    written.push(path);

    let lines = tracks::line_metrics(spots, config.time_step);
    let path = output_dir.join("line_metrics.csv");
    output::write_line_metrics_csv(&lines, &path)?;
    written.push(path);

    let velocity = tracks::calculate_velocity(spots, config.time_step);
    let path = output_dir.join("velocity.csv");
    output::write_velocity_csv(&velocity, &path)?;
    written.push(path);

    if !alignment.is_empty() {
        let per_ecm = tracks::track_additional_metrics_per_ecm(
            alignment.iter().map(|r| {
                (
                    r.spot.track_id,
                    r.image_name.as_str(),
                    r.ecm_id.as_str(),
                    r.spot.frame,
                    r.spot.position_x,
                    r.spot.position_y,
                )
            }),
            config.time_step,
        );
        let path = output_dir.join("track_metrics_per_ecm.csv");
        output::write_ecm_track_metrics_csv(&per_ecm, &path)?;
        written.push(path);
    }

    info!("Track metrics written for {} tracks", metrics.len());
    Ok(written)
}
