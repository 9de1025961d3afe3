// src/tracks.rs - Spot tables and cell-migration metrics

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One tracked cell position
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Spot {
    #[serde(rename = "TRACK_ID")]
    pub track_id: i64,
    #[serde(rename = "FRAME")]
    pub frame: i64,
    #[serde(rename = "POSITION_X")]
    pub position_x: f64,
    #[serde(rename = "POSITION_Y")]
    pub position_y: f64,
    /// Label of the image the spot was tracked on
    #[serde(rename = "File_name_raw")]
    pub file_name_raw: String,
    #[serde(rename = "Condition", default)]
    pub condition: Option<String>,
}

impl Spot {
    /// Condition label used for grouping; spots without one share a group
    pub fn condition_label(&self) -> &str {
        self.condition.as_deref().unwrap_or("NA")
    }
}

/// Load a spot table, skipping rows that do not parse as spots.
///
/// Tracker exports carry extra header rows (units, short names) below the
/// column header; they fail to deserialize and are dropped, as are rows with
/// a NaN or infinite position. Positions are
/// multiplied by `position_scale` to bring them into pixel units.
pub fn load_spots<P: AsRef<Path>>(path: P, position_scale: [f64; 2]) -> Result<Vec<Spot>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;

    let mut spots = Vec::new();
    let mut skipped = 0usize;
    for (line, record) in reader.deserialize::<Spot>().enumerate() {
        match record {
            Ok(spot) if !(spot.position_x.is_finite() && spot.position_y.is_finite()) => {
                skipped += 1;
                debug!("Skipping spot row {}: non-finite position", line + 2);
            }
            Ok(mut spot) => {
                spot.position_x *= position_scale[0];
                spot.position_y *= position_scale[1];
                spots.push(spot);
            }
            Err(e) => {
                skipped += 1;
                debug!("Skipping spot row {}: {}", line + 2, e);
            }
        }
    }

    info!("Loaded {} spots from {} ({} rows skipped)", spots.len(), path.display(), skipped);
    Ok(spots)
}

/// Spots grouped by track and ordered by frame
pub fn group_by_track(spots: &[Spot]) -> BTreeMap<i64, Vec<&Spot>> {
    let mut tracks: BTreeMap<i64, Vec<&Spot>> = BTreeMap::new();
    for spot in spots {
        tracks.entry(spot.track_id).or_default().push(spot);
    }
    for track in tracks.values_mut() {
        track.sort_by_key(|s| s.frame);
    }
    tracks
}

fn nan_mean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

fn nan_median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    let mid = v.len() / 2;
    if v.len() % 2 == 0 { (v[mid - 1] + v[mid]) / 2.0 } else { v[mid] }
}

/// Summary of a sequence of positions
#[derive(Debug, Clone, Serialize)]
pub struct MotionSummary {
    pub average_traveled_distance: f64,
    pub net_distance: f64,
    pub total_distance_travelled: f64,
    /// Net over total distance, NaN for a track that never moves
    pub consistency_index: f64,
    pub avg_instantaneous_speed: f64,
    /// Mean cosine between consecutive displacements
    pub velocity_correlation_index: f64,
    /// Mean dot product of consecutive displacements
    pub displacement_autocorrelation: f64,
}

/// Motion statistics of positions ordered in time
pub fn motion_summary(points: &[(f64, f64)], time_step: f64) -> MotionSummary {
    let steps: Vec<(f64, f64)> = points.windows(2).map(|w| (w[1].0 - w[0].0, w[1].1 - w[0].1)).collect();
    let lengths: Vec<f64> = steps.iter().map(|(dx, dy)| (dx * dx + dy * dy).sqrt()).collect();

    let net_distance = match (points.first(), points.last()) {
        (Some(a), Some(b)) => ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt(),
        _ => f64::NAN,
    };
    let total: f64 = lengths.iter().sum();
    let average = nan_mean(lengths.iter().copied());

    let dots: Vec<f64> = steps.windows(2).map(|w| w[0].0 * w[1].0 + w[0].1 * w[1].1).collect();
    let cosines = dots
        .iter()
        .zip(lengths.windows(2))
        .map(|(dot, l)| dot / (l[0] * l[1]));

    MotionSummary {
        average_traveled_distance: average,
        net_distance,
        total_distance_travelled: total,
        consistency_index: if total != 0.0 { net_distance / total } else { f64::NAN },
        avg_instantaneous_speed: average / time_step,
        velocity_correlation_index: nan_mean(cosines),
        displacement_autocorrelation: nan_mean(dots.iter().copied()),
    }
}

/// Whole-track migration metrics
#[derive(Debug, Clone, Serialize)]
pub struct TrackMetrics {
    pub track_id: i64,
    pub n_spots: usize,
    #[serde(flatten)]
    pub motion: MotionSummary,
}

/// Migration metrics for every track
pub fn track_additional_metrics(spots: &[Spot], time_step: f64) -> Vec<TrackMetrics> {
    group_by_track(spots)
        .into_iter()
        .map(|(track_id, track)| {
            let points: Vec<(f64, f64)> = track.iter().map(|s| (s.position_x, s.position_y)).collect();
            TrackMetrics {
                track_id,
                n_spots: track.len(),
                motion: motion_summary(&points, time_step),
            }
        })
        .collect()
}

/// Migration metrics of the part of a track spent next to one ECM window
#[derive(Debug, Clone, Serialize)]
pub struct EcmTrackMetrics {
    pub track_id: i64,
    pub image_name: String,
    pub ecm_id: String,
    pub n_spots: usize,
    #[serde(flatten)]
    pub motion: MotionSummary,
}

/// Migration metrics per (track, ECM window) group.
///
/// `rows` yields `(track_id, image_name, ecm_id, frame, x, y)` tuples.
pub fn track_additional_metrics_per_ecm<'a, I>(rows: I, time_step: f64) -> Vec<EcmTrackMetrics>
where
    I: IntoIterator<Item = (i64, &'a str, &'a str, i64, f64, f64)>,
{
    let mut groups: BTreeMap<(i64, &str, &str), Vec<(i64, f64, f64)>> = BTreeMap::new();
    for (track_id, image_name, ecm_id, frame, x, y) in rows {
        groups.entry((track_id, image_name, ecm_id)).or_default().push((frame, x, y));
    }

    groups
        .into_iter()
        .map(|((track_id, image_name, ecm_id), mut positions)| {
            positions.sort_by_key(|p| p.0);
            let points: Vec<(f64, f64)> = positions.iter().map(|&(_, x, y)| (x, y)).collect();
            EcmTrackMetrics {
                track_id,
                image_name: image_name.to_string(),
                ecm_id: ecm_id.to_string(),
                n_spots: points.len(),
                motion: motion_summary(&points, time_step),
            }
        })
        .collect()
}

/// Per-spot displacement from the previous spot and forward-migration-index contributions
#[derive(Debug, Clone, Serialize)]
pub struct LineMetric {
    pub track_id: i64,
    pub frame: i64,
    pub dx: f64,
    pub dy: f64,
    pub dr: f64,
    pub speed: f64,
    pub total_path_length: f64,
    pub fmi_x_plus: f64,
    pub fmi_x_minus: f64,
    pub fmi_y_plus: f64,
    pub fmi_y_minus: f64,
}

pub fn line_metrics(spots: &[Spot], time_step: f64) -> Vec<LineMetric> {
    let mut out = Vec::with_capacity(spots.len());
    for (track_id, track) in group_by_track(spots) {
        let steps: Vec<(f64, f64)> = track
            .iter()
            .enumerate()
            .map(|(i, s)| match i {
                0 => (f64::NAN, f64::NAN),
                _ => (s.position_x - track[i - 1].position_x, s.position_y - track[i - 1].position_y),
            })
            .collect();
        let total: f64 = steps
            .iter()
            .map(|(dx, dy)| (dx * dx + dy * dy).sqrt())
            .filter(|d| !d.is_nan())
            .sum();

        let share = |d: f64, positive: bool| {
            if (positive && d > 0.0) || (!positive && d < 0.0) {
                d.abs() / total
            } else {
                f64::NAN
            }
        };

        for (spot, &(dx, dy)) in track.iter().zip(&steps) {
            let dr = (dx * dx + dy * dy).sqrt();
            out.push(LineMetric {
                track_id,
                frame: spot.frame,
                dx,
                dy,
                dr,
                speed: dr / time_step,
                total_path_length: total,
                fmi_x_plus: share(dx, true),
                fmi_x_minus: share(dx, false),
                fmi_y_plus: share(dy, true),
                fmi_y_minus: share(dy, false),
            });
        }
    }
    out
}

/// Instantaneous velocity at a spot, toward the next spot of its track
#[derive(Debug, Clone, Serialize)]
pub struct VelocityRow {
    pub track_id: i64,
    pub frame: i64,
    pub condition: String,
    pub vx: f64,
    pub vy: f64,
    pub speed: f64,
    pub angle_rad: f64,
    pub angle_deg: f64,
    /// Mean speed over all spots of the same condition
    pub population_average_speed: f64,
}

pub fn calculate_velocity(spots: &[Spot], delta_t: f64) -> Vec<VelocityRow> {
    let mut rows = Vec::with_capacity(spots.len());
    for (track_id, track) in group_by_track(spots) {
        for (i, spot) in track.iter().enumerate() {
            let (dx, dy) = match track.get(i + 1) {
                Some(next) => (next.position_x - spot.position_x, next.position_y - spot.position_y),
                None => (f64::NAN, f64::NAN),
            };
            let (vx, vy) = (dx / delta_t, dy / delta_t);
            let angle = vy.atan2(vx);
            rows.push(VelocityRow {
                track_id,
                frame: spot.frame,
                condition: spot.condition_label().to_string(),
                vx,
                vy,
                speed: (vx * vx + vy * vy).sqrt(),
                angle_rad: angle,
                angle_deg: angle.to_degrees(),
                population_average_speed: f64::NAN,
            });
        }
    }

    let mut per_condition: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for row in &rows {
        per_condition.entry(row.condition.clone()).or_default().push(row.speed);
    }
    let averages: BTreeMap<String, f64> = per_condition
        .into_iter()
        .map(|(condition, speeds)| (condition, nan_mean(speeds)))
        .collect();
    for row in &mut rows {
        row.population_average_speed = averages.get(&row.condition).copied().unwrap_or(f64::NAN);
    }

    rows
}

/// Fiber orientation in [0, 1]: 0 along the vertical axis, 1 along the horizontal axis.
///
/// Takes `(condition, AFT angle)` pairs and logs the per-condition mean and median.
pub fn calculate_fiber_orientation<'a, I>(angles: I) -> Vec<f64>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut per_condition: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let normalized: Vec<f64> = angles
        .into_iter()
        .map(|(condition, angle)| {
            let value = angle.abs() / (PI / 2.0);
            per_condition.entry(condition).or_default().push(value);
            value
        })
        .collect();

    for (condition, values) in &per_condition {
        info!(
            "Fiber orientation [{}]: mean {:.3}, median {:.3}",
            condition,
            nan_mean(values.iter().copied()),
            nan_median(values)
        );
    }

    normalized
}
