use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use csv::Writer;
use log::info;

use crate::alignment::{AlignmentRow, OrderRow};
use crate::errors::Result;
use crate::segmentation::SegmentationRow;
use crate::skeleton::BranchSummary;
use crate::tracks::{EcmTrackMetrics, LineMetric, MotionSummary, TrackMetrics, VelocityRow};

/// File name of the joined spot table
pub const MERGED_SPOTS_FILE: &str = "merged_Spots_AFT.csv";

/// Format a float with six decimals; NaN becomes an empty field
pub fn fmt_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{:.6}", value)
    }
}

fn create_writer<P: AsRef<Path>>(path: P) -> Result<Writer<fs::File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(Writer::from_path(path)?)
}

const ALIGNMENT_HEADER: [&str; 19] = [
    "TRACK_ID",
    "FRAME",
    "POSITION_X",
    "POSITION_Y",
    "File_name_raw",
    "Condition",
    "image_name",
    "ECM_ID",
    "ECM_x",
    "ECM_y",
    "track_angle",
    "AFT_angle",
    "AFT-Δφ",
    "AFT-AI",
    "AFT_eccentricity",
    "track_angle_u",
    "track_angle_v",
    "AFT_angle_u",
    "AFT_angle_v",
];

fn alignment_fields(row: &AlignmentRow) -> Vec<String> {
    vec![
        row.spot.track_id.to_string(),
        row.spot.frame.to_string(),
        fmt_float(row.spot.position_x),
        fmt_float(row.spot.position_y),
        row.spot.file_name_raw.clone(),
        row.spot.condition.clone().unwrap_or_default(),
        row.image_name.clone(),
        row.ecm_id.clone(),
        fmt_float(row.ecm_x),
        fmt_float(row.ecm_y),
        fmt_float(row.track_angle),
        fmt_float(row.aft_angle),
        fmt_float(row.delta_phi),
        fmt_float(row.alignment_index),
        fmt_float(row.aft_eccentricity),
        fmt_float(row.track_angle_u),
        fmt_float(row.track_angle_v),
        fmt_float(row.aft_angle_u),
        fmt_float(row.aft_angle_v),
    ]
}

/// Write track/fiber alignment rows, with the normalised fiber orientation when given
pub fn write_alignment_csv<P: AsRef<Path>>(
    rows: &[AlignmentRow],
    orientation: Option<&[f64]>,
    path: P,
) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header: Vec<&str> = ALIGNMENT_HEADER.to_vec();
    if orientation.is_some() {
        header.push("AFT_angle_normalized");
    }
    writer.write_record(&header)?;

    for (i, row) in rows.iter().enumerate() {
        let mut fields = alignment_fields(row);
        if let Some(values) = orientation {
            fields.push(fmt_float(values.get(i).copied().unwrap_or(f64::NAN)));
        }
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}

const ORDER_HEADER: [&str; 4] = ["order_value", "window_size", "overlap", "neighborhood_radius"];

fn order_fields(row: &OrderRow) -> Vec<String> {
    vec![
        fmt_float(row.order_value),
        row.window_size.to_string(),
        fmt_float(row.overlap),
        row.neighborhood_radius.to_string(),
    ]
}

pub fn write_order_csv<P: AsRef<Path>>(rows: &[OrderRow], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header = vec!["image_name", "ECM_ID", "ECM_x", "ECM_y"];
    header.extend(ORDER_HEADER);
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![
            row.image_name.clone(),
            row.ecm_id.clone(),
            fmt_float(row.ecm_x),
            fmt_float(row.ecm_y),
        ];
        fields.extend(order_fields(row));
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}

const SEGMENTATION_HEADER: [&str; 9] = [
    "intensity",
    "HDM",
    "endpoints",
    "norm_endpoints",
    "norm_branch",
    "curvature_mean",
    "branch_points",
    "FFD",
    "lacunarity",
];

fn segmentation_fields(row: &SegmentationRow) -> Vec<String> {
    vec![
        fmt_float(row.intensity),
        fmt_float(row.hdm),
        row.endpoints.to_string(),
        fmt_float(row.norm_endpoints),
        fmt_float(row.norm_branch),
        fmt_float(row.curvature_mean),
        row.branch_points.to_string(),
        fmt_float(row.ffd),
        fmt_float(row.lacunarity),
    ]
}

pub fn write_segmentation_csv<P: AsRef<Path>>(rows: &[SegmentationRow], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header = vec!["image_name", "ECM_x", "ECM_y"];
    header.extend(SEGMENTATION_HEADER);
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![row.image_name.clone(), fmt_float(row.ecm_x), fmt_float(row.ecm_y)];
        fields.extend(segmentation_fields(row));
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}

const MOTION_HEADER: [&str; 7] = [
    "average_traveled_distance",
    "net_distance",
    "total_distance_travelled",
    "consistency_index",
    "avg_instantaneous_speed",
    "velocity_correlation_index",
    "displacement_autocorrelation_function",
];

fn motion_fields(m: &MotionSummary) -> Vec<String> {
    vec![
        fmt_float(m.average_traveled_distance),
        fmt_float(m.net_distance),
        fmt_float(m.total_distance_travelled),
        fmt_float(m.consistency_index),
        fmt_float(m.avg_instantaneous_speed),
        fmt_float(m.velocity_correlation_index),
        fmt_float(m.displacement_autocorrelation),
    ]
}

pub fn write_track_metrics_csv<P: AsRef<Path>>(rows: &[TrackMetrics], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header = vec!["TRACK_ID", "n_spots"];
    header.extend(MOTION_HEADER);
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![row.track_id.to_string(), row.n_spots.to_string()];
        fields.extend(motion_fields(&row.motion));
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_ecm_track_metrics_csv<P: AsRef<Path>>(rows: &[EcmTrackMetrics], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header = vec!["TRACK_ID".to_string(), "image_name".to_string(), "ECM_ID".to_string(), "n_spots_ECM".to_string()];
    header.extend(MOTION_HEADER.iter().map(|h| format!("{}_ECM", h)));
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![
            row.track_id.to_string(),
            row.image_name.clone(),
            row.ecm_id.clone(),
            row.n_spots.to_string(),
        ];
        fields.extend(motion_fields(&row.motion));
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_line_metrics_csv<P: AsRef<Path>>(rows: &[LineMetric], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    writer.write_record([
        "TRACK_ID",
        "FRAME",
        "dx_spot",
        "dy_spot",
        "dR_euclidean_spot",
        "v_spot",
        "total_path_length",
        "local_FMI_contribution_x_plus_spot",
        "local_FMI_contribution_x_minus_spot",
        "local_FMI_contribution_y_plus_spot",
        "local_FMI_contribution_y_minus_spot",
    ])?;

    for row in rows {
        writer.write_record(&[
            row.track_id.to_string(),
            row.frame.to_string(),
            fmt_float(row.dx),
            fmt_float(row.dy),
            fmt_float(row.dr),
            fmt_float(row.speed),
            fmt_float(row.total_path_length),
            fmt_float(row.fmi_x_plus),
            fmt_float(row.fmi_x_minus),
            fmt_float(row.fmi_y_plus),
            fmt_float(row.fmi_y_minus),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_velocity_csv<P: AsRef<Path>>(rows: &[VelocityRow], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;

    writer.write_record([
        "TRACK_ID",
        "FRAME",
        "Condition",
        "vx",
        "vy",
        "instantaneous_velocity",
        "instantaneous_velocity_angle_rad",
        "instantaneous_velocity_angle_deg",
        "population_average_velocity",
    ])?;

    for row in rows {
        writer.write_record(&[
            row.track_id.to_string(),
            row.frame.to_string(),
            row.condition.clone(),
            fmt_float(row.vx),
            fmt_float(row.vy),
            fmt_float(row.speed),
            fmt_float(row.angle_rad),
            fmt_float(row.angle_deg),
            fmt_float(row.population_average_speed),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Branch table of a skeleton, written in debug mode
pub fn write_branch_summary_csv<P: AsRef<Path>>(rows: &[BranchSummary], path: P) -> Result<()> {
    let mut writer = create_writer(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Key joining tables on image and window centre
fn window_key(image_name: &str, x: f64, y: f64) -> (String, i64, i64) {
    (image_name.to_string(), x.round() as i64, y.round() as i64)
}

/// Left-join alignment rows with order and segmentation rows on
/// `(image_name, ECM_x, ECM_y)` and write `merged_Spots_AFT.csv` into `folder`
pub fn data_saving_spots_only<P: AsRef<Path>>(
    alignment: &[AlignmentRow],
    density: Option<&[SegmentationRow]>,
    order: Option<&[OrderRow]>,
    folder: P,
) -> Result<PathBuf> {
    let folder = folder.as_ref();
    fs::create_dir_all(folder)?;
    let path = folder.join(MERGED_SPOTS_FILE);

    let order_index: Option<HashMap<_, &OrderRow>> = order.map(|rows| {
        rows.iter()
            .map(|r| (window_key(&r.image_name, r.ecm_x, r.ecm_y), r))
            .collect()
    });
    let density_index: Option<HashMap<_, &SegmentationRow>> = density.map(|rows| {
        rows.iter()
            .map(|r| (window_key(&r.image_name, r.ecm_x, r.ecm_y), r))
            .collect()
    });

    let mut writer = create_writer(&path)?;
    let mut header: Vec<&str> = ALIGNMENT_HEADER.to_vec();
    if order_index.is_some() {
        header.extend(ORDER_HEADER);
    }
    if density_index.is_some() {
        header.extend(SEGMENTATION_HEADER);
    }
    writer.write_record(&header)?;

    for row in alignment {
        let key = window_key(&row.image_name, row.ecm_x, row.ecm_y);
        let mut fields = alignment_fields(row);

        if let Some(index) = &order_index {
            match index.get(&key) {
                Some(o) => fields.extend(order_fields(o)),
                None => fields.extend(std::iter::repeat(String::new()).take(ORDER_HEADER.len())),
            }
        }
        if let Some(index) = &density_index {
            match index.get(&key) {
                Some(d) => fields.extend(segmentation_fields(d)),
                None => fields.extend(std::iter::repeat(String::new()).take(SEGMENTATION_HEADER.len())),
            }
        }
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    info!("Merged {} spot rows into {}", alignment.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::Spot;

    fn alignment_row(image: &str, x: f64, y: f64) -> AlignmentRow {
        AlignmentRow {
            spot: Spot {
                track_id: 3,
                frame: 1,
                position_x: x + 1.0,
                position_y: y,
                file_name_raw: image.to_string(),
                condition: Some("ctrl".to_string()),
            },
            image_name: image.to_string(),
            ecm_id: "ECM_1".to_string(),
            ecm_x: x,
            ecm_y: y,
            track_angle: 0.0,
            aft_angle: f64::NAN,
            delta_phi: f64::NAN,
            alignment_index: f64::NAN,
            aft_eccentricity: 0.5,
            track_angle_u: 1.0,
            track_angle_v: 0.0,
            aft_angle_u: f64::NAN,
            aft_angle_v: f64::NAN,
        }
    }

    fn order_row(image: &str, x: f64, y: f64, value: f64) -> OrderRow {
        OrderRow {
            image_name: image.to_string(),
            ecm_id: "ECM_1".to_string(),
            ecm_x: x,
            ecm_y: y,
            order_value: value,
            window_size: 33,
            overlap: 0.5,
            neighborhood_radius: 2,
        }
    }

    fn segmentation_row(image: &str, x: f64, y: f64, hdm: f64) -> SegmentationRow {
        SegmentationRow {
            image_name: image.to_string(),
            ecm_x: x,
            ecm_y: y,
            intensity: 0.4,
            hdm,
            endpoints: 2,
            branch_points: 0,
            norm_endpoints: 0.1,
            norm_branch: 0.0,
            curvature_mean: f64::NAN,
            ffd: 1.0,
            lacunarity: 0.5,
        }
    }

    #[test]
    fn nan_is_written_as_empty_field() {
        assert_eq!(fmt_float(f64::NAN), "");
        assert_eq!(fmt_float(0.5), "0.500000");
    }

    #[test]
    fn merge_left_joins_on_window() {
        let dir = tempfile::tempdir().unwrap();
        let alignment = vec![alignment_row("img", 16.0, 16.0), alignment_row("img", 33.0, 16.0)];
        let order = vec![order_row("img", 16.0, 16.0, 0.75), order_row("other", 33.0, 16.0, 0.1)];

        let path = data_saving_spots_only(&alignment, None, Some(&order), dir.path()).unwrap();
        assert!(path.ends_with(MERGED_SPOTS_FILE));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let col = headers.iter().position(|h| h == "order_value").unwrap();
        assert!(headers.iter().all(|h| h != "HDM"));

        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][col], "0.750000");
        assert_eq!(&records[1][col], "");
        // NaN angle stays empty
        let angle = headers.iter().position(|h| h == "AFT_angle").unwrap();
        assert_eq!(&records[0][angle], "");
    }

    #[test]
    fn merge_appends_density_after_order() {
        let dir = tempfile::tempdir().unwrap();
        let alignment = vec![
            alignment_row("img", 16.0, 16.0),
            alignment_row("img", 33.0, 16.0),
            alignment_row("img", 50.0, 16.0),
        ];
        let order = vec![order_row("img", 50.0, 16.0, 0.2)];
        // Window centres round onto the same key
        let density = vec![segmentation_row("img", 16.2, 15.9, 0.125), segmentation_row("img", 50.0, 16.0, 0.5)];

        let path = data_saving_spots_only(&alignment, Some(&density), Some(&order), dir.path()).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), ALIGNMENT_HEADER.len() + ORDER_HEADER.len() + SEGMENTATION_HEADER.len());
        let order_col = headers.iter().position(|h| h == "order_value").unwrap();
        let hdm = headers.iter().position(|h| h == "HDM").unwrap();
        let endpoints = headers.iter().position(|h| h == "endpoints").unwrap();
        assert!(order_col < hdm);

        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(&records[0][hdm], "0.125000");
        assert_eq!(&records[0][endpoints], "2");
        assert_eq!(&records[0][order_col], "");
        // No patch for the middle window
        assert_eq!(&records[1][hdm], "");
        assert_eq!(&records[1][endpoints], "");
        assert_eq!(&records[2][hdm], "0.500000");
        assert_eq!(&records[2][order_col], "0.200000");
    }

    #[test]
    fn alignment_csv_with_orientation_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("alignment.csv");
        write_alignment_csv(&[alignment_row("img", 16.0, 16.0)], Some(&[0.25]), &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().ends_with("AFT_angle_normalized"));
        assert!(lines.next().unwrap().ends_with("0.250000"));
    }
}
