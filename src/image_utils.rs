use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

/// Single-channel floating point image, intensities nominally in [0, 1]
pub type FloatImage = ImageBuffer<Luma<f64>, Vec<f64>>;

/// Binary mask: 255 = on, 0 = off
pub type Mask = GrayImage;

/// Value written for "on" pixels in a mask
pub const MASK_ON: u8 = 255;

/// Check if a mask pixel is set
#[inline]
pub fn is_on(mask: &Mask, x: u32, y: u32) -> bool {
    mask.get_pixel(x, y)[0] > 0
}

/// Set a mask pixel on or off
#[inline]
pub fn set_mask(mask: &mut Mask, x: u32, y: u32, on: bool) {
    mask.put_pixel(x, y, Luma([if on { MASK_ON } else { 0 }]));
}

/// Number of "on" pixels in a mask
pub fn count_on(mask: &Mask) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Check if a point is inside the image bounds
#[inline]
pub fn in_bounds(x: i64, y: i64, width: u32, height: u32) -> bool {
    x >= 0 && y >= 0 && (x as u64) < width as u64 && (y as u64) < height as u64
}

/// Mean of a set of intensities (NaN when empty)
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance of a set of intensities (NaN when empty)
pub fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Percentile with linear interpolation between closest ranks (`q` in [0, 100])
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Convert an 8-bit image to floats in [0, 1]
pub fn float_from_u8(image: &GrayImage) -> FloatImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f64 / 255.0])
    })
}

/// Linearly stretch an image to the full 8-bit range (values are truncated)
pub fn stretch_to_u8(image: &FloatImage) -> GrayImage {
    let (min, max) = image
        .as_raw()
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let value = if range > 0.0 {
            255.0 * (image.get_pixel(x, y)[0] - min) / range
        } else {
            0.0
        };
        Luma([value.clamp(0.0, 255.0) as u8])
    })
}

/// Quantise a [0, 1] float image for saving
pub fn float_to_u8(image: &FloatImage) -> GrayImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([(image.get_pixel(x, y)[0] * 255.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// Overlay mask pixels in a solid color on top of a grayscale image
pub fn create_debug_image(base: &FloatImage, mask: &Mask, color: [u8; 3]) -> RgbImage {
    let gray = float_to_u8(base);
    ImageBuffer::from_fn(base.width(), base.height(), |x, y| {
        if x < mask.width() && y < mask.height() && is_on(mask, x, y) {
            Rgb(color)
        } else {
            let g = gray.get_pixel(x, y)[0];
            Rgb([g, g, g])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_approx_eq!(percentile(&values, 0.0), 1.0);
        assert_approx_eq!(percentile(&values, 50.0), 2.5);
        assert_approx_eq!(percentile(&values, 100.0), 4.0);
        assert_approx_eq!(percentile(&values, 25.0), 1.75);
    }

    #[test]
    fn percentile_of_empty_is_nan() {
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn stretch_maps_extremes_to_full_range() {
        let image = FloatImage::from_fn(3, 1, |x, _| Luma([0.2 + 0.1 * x as f64]));
        let stretched = stretch_to_u8(&image);
        assert_eq!(stretched.get_pixel(0, 0)[0], 0);
        assert_eq!(stretched.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn stretch_of_flat_image_is_black() {
        let image = FloatImage::from_pixel(4, 4, Luma([0.7]));
        assert!(stretch_to_u8(&image).pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn variance_and_mean() {
        let image = FloatImage::from_fn(2, 1, |x, _| Luma([x as f64]));
        assert_approx_eq!(mean(image.as_raw()), 0.5);
        assert_approx_eq!(variance(image.as_raw()), 0.25);
        assert!(mean(&[]).is_nan());
        assert!(variance(&[]).is_nan());
    }

    #[test]
    fn mask_helpers() {
        let mut mask = Mask::new(3, 3);
        set_mask(&mut mask, 1, 1, true);
        assert!(is_on(&mask, 1, 1));
        assert!(!is_on(&mask, 0, 0));
        assert_eq!(count_on(&mask), 1);
    }

    #[test]
    fn bounds_check() {
        assert!(in_bounds(0, 0, 2, 2));
        assert!(!in_bounds(-1, 0, 2, 2));
        assert!(!in_bounds(2, 1, 2, 2));
    }
}
