//! Foreground isolation and glyph region extraction.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::contrast::{ThresholdType, threshold};
use imageproc::morphology::{Mask, grayscale_dilate};

use crate::challenges::core::DetectedRegion;

/// Default binarisation cutoff for the grayscale foreground.
pub const DEFAULT_BINARIZE_CUTOFF: u8 = 20;

const DILATE_KERNEL: u32 = 4;

/// BT.601 luma in 14-bit fixed point, the rounding the thresholds are tuned for.
pub fn grayscale(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = (4899 * r as u32 + 9617 * g as u32 + 1868 * b as u32 + 8192) >> 14;
        Luma([luma as u8])
    })
}

/// Keeps only the channels that differ from the reference background.
///
/// This is an exact inequality mask: any channel equal to the reference is
/// zeroed, however close the others are.
pub fn remove_background(original: &RgbImage, reference: &RgbImage) -> RgbImage {
    let mut foreground = RgbImage::new(original.width(), original.height());
    for (x, y, pixel) in original.enumerate_pixels() {
        let Some(reference_pixel) = reference.get_pixel_checked(x, y) else {
            foreground.put_pixel(x, y, *pixel);
            continue;
        };
        let mut kept = *pixel;
        for (channel, reference_channel) in kept.0.iter_mut().zip(reference_pixel.0) {
            if *channel == reference_channel {
                *channel = 0;
            }
        }
        foreground.put_pixel(x, y, kept);
    }
    foreground
}

/// Bounding boxes of the external blobs left in a foreground image.
pub fn detect_regions(foreground: &RgbImage, cutoff: u8) -> Vec<DetectedRegion> {
    let gray = grayscale(foreground);
    let binary = threshold(&gray, cutoff, ThresholdType::Binary);
    let dilated = grayscale_dilate(&binary, &dilation_mask());

    find_contours::<u32>(&dilated)
        .into_iter()
        .filter(|contour| contour.parent.is_none() && contour.border_type == BorderType::Outer)
        .filter_map(|contour| bounding_rect(&contour.points))
        .collect()
}

fn dilation_mask() -> Mask {
    let kernel = GrayImage::from_pixel(DILATE_KERNEL, DILATE_KERNEL, Luma([255]));
    let center = (DILATE_KERNEL / 2) as u8;
    Mask::from_image(&kernel, center, center)
}

fn bounding_rect(points: &[imageproc::point::Point<u32>]) -> Option<DetectedRegion> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for point in points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Some(DetectedRegion::new(
        min_x,
        min_y,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}
