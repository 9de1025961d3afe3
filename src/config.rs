use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::errors::{FiberTrackError, Result};

/// Configuration for ECM FiberTrack
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub input_path: String,
    pub output_base_dir: String,

    /// Spot table exported from the tracker (required for alignment and track metrics)
    #[serde(default)]
    pub tracks_path: Option<String>,

    /// Region-of-interest mask shared by every image (non-zero = analysed)
    #[serde(default)]
    pub mask_path: Option<String>,

    #[serde(default = "default_parallel")]
    pub use_parallel: bool,

    // AFT parameters
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_overlap")]
    pub overlap: f64,

    #[serde(default)]
    pub intensity_thresh: f64,

    #[serde(default)]
    pub eccentricity_thresh: f64,

    #[serde(default = "default_neighborhood_radius")]
    pub neighborhood_radius: usize,

    // Ridge detection parameters
    #[serde(default = "default_min_line_width")]
    pub min_line_width: u32,

    #[serde(default = "default_max_line_width")]
    pub max_line_width: u32,

    #[serde(default = "default_contrast_low")]
    pub contrast_low: f64,

    #[serde(default = "default_contrast_high")]
    pub contrast_high: f64,

    #[serde(default)]
    pub dark_line: bool,

    #[serde(default = "default_true")]
    pub do_enhance_contrast: bool,

    #[serde(default = "default_intensity_clip_percent")]
    pub intensity_clip_percent: f64,

    // Skeleton parameters
    #[serde(default = "default_true")]
    pub do_skeleton: bool,

    #[serde(default = "default_true")]
    pub prune_short: bool,

    #[serde(default = "default_minimum_branch_length")]
    pub minimum_branch_length: f64,

    #[serde(default = "default_curvature_windows")]
    pub curvature_windows: Vec<usize>,

    // Track parameters
    #[serde(default = "default_time_step")]
    pub time_step: f64,

    /// Multiplier from spot positions to image pixels, [x, y]
    #[serde(default = "default_position_scale")]
    pub position_scale: [f64; 2],
}

fn default_parallel() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_window_size() -> usize {
    33
}

fn default_overlap() -> f64 {
    0.5
}

fn default_neighborhood_radius() -> usize {
    2
}

// TWOMBLI ridge detector defaults
fn default_min_line_width() -> u32 {
    3
}

fn default_max_line_width() -> u32 {
    6
}

fn default_contrast_low() -> f64 {
    0.0
}

fn default_contrast_high() -> f64 {
    120.0
}

fn default_intensity_clip_percent() -> f64 {
    0.35
}

fn default_minimum_branch_length() -> f64 {
    10.0
}

fn default_curvature_windows() -> Vec<usize> {
    vec![10, 20, 30, 40]
}

fn default_time_step() -> f64 {
    1.0
}

fn default_position_scale() -> [f64; 2] {
    [1.0, 1.0]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: "./input".to_string(),
            output_base_dir: "./output".to_string(),
            tracks_path: None,
            mask_path: None,
            use_parallel: true,
            window_size: default_window_size(),
            overlap: default_overlap(),
            intensity_thresh: 0.0,
            eccentricity_thresh: 0.0,
            neighborhood_radius: default_neighborhood_radius(),
            min_line_width: default_min_line_width(),
            max_line_width: default_max_line_width(),
            contrast_low: default_contrast_low(),
            contrast_high: default_contrast_high(),
            dark_line: false,
            do_enhance_contrast: true,
            intensity_clip_percent: default_intensity_clip_percent(),
            do_skeleton: true,
            prune_short: true,
            minimum_branch_length: default_minimum_branch_length(),
            curvature_windows: default_curvature_windows(),
            time_step: default_time_step(),
            position_scale: default_position_scale(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FiberTrackError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|source| FiberTrackError::ConfigLoad {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Check parameter ranges only, without touching the filesystem
    pub fn validate_parameters(&self) -> Result<()> {
        if self.window_size < 3 {
            return Err(FiberTrackError::Config("window_size must be >= 3".to_string()));
        }

        if !(0.0..1.0).contains(&self.overlap) {
            return Err(FiberTrackError::Config(
                "overlap must be in [0.0, 1.0)".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.eccentricity_thresh) {
            return Err(FiberTrackError::Config(
                "eccentricity_thresh must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.min_line_width == 0 || self.min_line_width > self.max_line_width {
            return Err(FiberTrackError::Config(
                "line widths must satisfy 0 < min_line_width <= max_line_width".to_string(),
            ));
        }

        if !(0.0..=255.0).contains(&self.contrast_low)
            || !(0.0..=255.0).contains(&self.contrast_high)
            || self.contrast_low >= self.contrast_high
        {
            return Err(FiberTrackError::Config(
                "contrast_low and contrast_high must lie in [0, 255] with contrast_low < contrast_high".to_string(),
            ));
        }

        if !(0.0..100.0).contains(&self.intensity_clip_percent) {
            return Err(FiberTrackError::Config(
                "intensity_clip_percent must be in [0.0, 100.0)".to_string(),
            ));
        }

        if self.minimum_branch_length < 0.0 {
            return Err(FiberTrackError::Config(
                "minimum_branch_length must be >= 0.0".to_string(),
            ));
        }

        if self.curvature_windows.iter().any(|&w| w < 2) {
            return Err(FiberTrackError::Config(
                "curvature_windows entries must be >= 2".to_string(),
            ));
        }

        if self.time_step <= 0.0 {
            return Err(FiberTrackError::Config("time_step must be > 0.0".to_string()));
        }

        if self.position_scale.iter().any(|&s| s <= 0.0) {
            return Err(FiberTrackError::Config(
                "position_scale entries must be > 0.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate configuration and prepare the output directory.
    ///
    /// `input_path` is only checked when the run reads images.
    pub fn validate(&self, needs_images: bool) -> Result<()> {
        let input_path = PathBuf::from(&self.input_path);
        if needs_images && !input_path.exists() {
            return Err(FiberTrackError::InvalidPath(input_path));
        }

        if let Some(tracks) = &self.tracks_path {
            let tracks_path = PathBuf::from(tracks);
            if !tracks_path.is_file() {
                return Err(FiberTrackError::InvalidPath(tracks_path));
            }
        }

        if let Some(mask) = &self.mask_path {
            let mask_path = PathBuf::from(mask);
            if !mask_path.is_file() {
                return Err(FiberTrackError::InvalidPath(mask_path));
            }
        }

        self.validate_parameters()?;

        fs::create_dir_all(&self.output_base_dir).map_err(|e| {
            FiberTrackError::Io(io::Error::new(
                ErrorKind::Other,
                format!("Failed to create output directory: {}", e),
            ))
        })?;

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            FiberTrackError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, content)?;

        Ok(())
    }

    /// Record the effective parameters next to the results
    pub fn save_parameters_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate_parameters().is_ok());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = toml::from_str(
            "input_path = \"in\"\noutput_base_dir = \"out\"\nwindow_size = 65\n",
        )
        .unwrap();
        assert_eq!(config.window_size, 65);
        assert_eq!(config.max_line_width, 6);
        assert_eq!(config.curvature_windows, vec![10, 20, 30, 40]);
        assert!(config.tracks_path.is_none());
    }

    #[test]
    fn rejects_inverted_line_widths() {
        let config = Config {
            min_line_width: 8,
            max_line_width: 4,
            ..Config::default()
        };
        assert!(config.validate_parameters().is_err());
    }

    #[test]
    fn rejects_full_overlap() {
        let config = Config {
            overlap: 1.0,
            ..Config::default()
        };
        assert!(config.validate_parameters().is_err());
    }

    #[test]
    fn toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            dark_line: true,
            time_step: 5.0,
            ..Config::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert!(loaded.dark_line);
        assert_eq!(loaded.time_step, 5.0);
    }

    #[test]
    fn validate_rejects_missing_input() {
        let config = Config {
            input_path: "/definitely/not/here".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(true), Err(FiberTrackError::InvalidPath(_))));
    }

    #[test]
    fn missing_input_is_fine_without_images() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = dir.path().join("spots.csv");
        fs::write(&tracks, "TRACK_ID,FRAME,POSITION_X,POSITION_Y,File_name_raw\n").unwrap();

        let config = Config {
            input_path: "/definitely/not/here".to_string(),
            tracks_path: Some(tracks.to_string_lossy().to_string()),
            output_base_dir: dir.path().join("out").to_string_lossy().to_string(),
            ..Config::default()
        };
        assert!(config.validate(false).is_ok());
        assert!(dir.path().join("out").is_dir());
    }
}
