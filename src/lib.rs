// src/lib.rs - Library interface for ECM FiberTrack

pub mod aft;
pub mod alignment;
pub mod config;
pub mod curvature;
pub mod errors;
pub mod fractal;
pub mod image_io;
pub mod image_utils;
pub mod kdtree;
pub mod morphology;
pub mod output;
pub mod pipeline;
pub mod ridge;
pub mod segmentation;
pub mod skeleton;
pub mod tracks;

// Re-export commonly used types and functions
pub use errors::{FiberTrackError, Result};
pub use config::Config;
pub use pipeline::{process_image, run, Analysis, ImageResults, RunSummary};
pub use image_io::{InputImage, load_image, load_mask, save_image};

// Re-export analysis entry points
pub use aft::{image_local_order, order_parameter, AftField, AftParams};
pub use alignment::{aft_ai_metric, aft_order_parameter, AlignmentRow, OrderRow};
pub use ridge::{
    calc_lower_thresh,
    calc_sigma,
    calc_upper_thresh,
    run_multiscale_ridge_detection,
    RidgeDetection,
    RidgeParams,
};
pub use skeleton::{remove_short_components, BranchSummary, BranchType, SkeletonGraph};
pub use segmentation::{segmentation_features, SegmentationRow};
pub use tracks::{load_spots, Spot};
pub use output::data_saving_spots_only;
