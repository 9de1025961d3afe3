use std::fs;
use std::path::{Path, PathBuf};
use image::{ColorType, DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma};

use crate::errors::{FiberTrackError, Result};
use crate::image_utils::{FloatImage, Mask, MASK_ON};

/// File extensions accepted as microscopy input
const IMAGE_EXTENSIONS: [&str; 3] = ["tif", "tiff", "png"];

/// Represents an input image with its metadata
pub struct InputImage {
    /// Intensities scaled to [0, 1] by the full range of the source bit depth
    pub image: FloatImage,
    /// Original 8-bit pixels, when the source was 8-bit
    pub image_u8: Option<GrayImage>,
    pub path: PathBuf,
    /// File stem, matched against the `File_name_raw` column of the spot table
    pub label: String,
}

/// Get all supported image files from a directory (recursively, sorted)
pub fn get_image_files_in_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<PathBuf>> {
    let dir_path = dir_path.as_ref();

    if !dir_path.exists() {
        return Err(FiberTrackError::InvalidPath(dir_path.to_path_buf()));
    }

    if !dir_path.is_dir() {
        return Err(FiberTrackError::Config(format!(
            "{} is not a directory", dir_path.display()
        )));
    }

    let mut files = Vec::new();
    find_image_files_recursive(dir_path, &mut files)?;
    files.sort();

    Ok(files)
}

fn find_image_files_recursive(dir_path: &Path, result: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();

        if path.is_dir() {
            find_image_files_recursive(&path, result)?;
        } else if path.is_file() && has_image_extension(&path) {
            result.push(path);
        }
    }

    Ok(())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Resolve the input setting to a list of image files
pub fn collect_inputs<P: AsRef<Path>>(input: P) -> Result<Vec<PathBuf>> {
    let input = input.as_ref();
    let files = if input.is_file() {
        vec![input.to_path_buf()]
    } else if input.is_dir() {
        get_image_files_in_dir(input)?
    } else {
        return Err(FiberTrackError::InvalidPath(input.to_path_buf()));
    };

    if files.is_empty() {
        return Err(FiberTrackError::NoImages(input.to_path_buf()));
    }

    Ok(files)
}

/// Label used to join images with spot rows
pub fn image_label<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| FiberTrackError::InvalidPath(path.to_path_buf()))
}

/// Load a single-channel image; multi-page stacks yield their first frame
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<InputImage> {
    let path = path.as_ref();
    let label = image_label(path)?;

    let dynamic = image::open(path)?;
    Ok(InputImage {
        image: to_float(&dynamic),
        image_u8: is_eight_bit(dynamic.color()).then(|| dynamic.to_luma8()),
        path: path.to_path_buf(),
        label,
    })
}

fn is_eight_bit(color: ColorType) -> bool {
    matches!(
        color,
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8
    )
}

fn to_float(dynamic: &DynamicImage) -> FloatImage {
    let luma = dynamic.to_luma16();
    ImageBuffer::from_fn(luma.width(), luma.height(), |x, y| {
        Luma([luma.get_pixel(x, y)[0] as f64 / u16::MAX as f64])
    })
}

/// Load a region-of-interest mask (any non-zero pixel is inside)
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<Mask> {
    let gray = image::open(path)?.to_luma8();
    Ok(ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if gray.get_pixel(x, y)[0] > 0 { MASK_ON } else { 0 }])
    }))
}

/// Save an image as PNG
pub fn save_image<I: Into<DynamicImage>, P: AsRef<Path>>(image: I, path: P) -> Result<()> {
    image.into().save_with_format(path, ImageFormat::Png)?;
    Ok(())
}
