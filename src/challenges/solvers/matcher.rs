//! Pairs the four target characters with detected glyph regions.

use image::RgbImage;
use image::imageops::crop_imm;

use crate::challenges::core::{CLICK_COUNT, DetectedRegion};

use super::SolveError;
use super::similarity::{PatchTensor, SimilarityScorer, sigmoid};

/// Default acceptance threshold applied after the sigmoid.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Fixed layout of the target characters inside the pointer image.
pub const TARGET_OFFSETS: [u32; CLICK_COUNT] = [165, 200, 231, 265];
pub const TARGET_TOP: u32 = 11;
pub const TARGET_WIDTH: u32 = 26;
pub const TARGET_HEIGHT: u32 = 28;

/// Extra pixels kept right of and below a region when cropping it.
const REGION_MARGIN: u32 = 2;

/// Crops the four target characters in click order.
pub fn split_targets(pointer: &RgbImage) -> Result<Vec<RgbImage>, SolveError> {
    TARGET_OFFSETS
        .iter()
        .map(|&x| {
            clamped_crop(pointer, x, TARGET_TOP, TARGET_WIDTH, TARGET_HEIGHT).ok_or_else(|| {
                SolveError::Layout(format!(
                    "pointer image {}x{} has no character at x={x}",
                    pointer.width(),
                    pointer.height()
                ))
            })
        })
        .collect()
}

/// Crop of a region with the trailing margin, clamped to the image.
pub fn region_crop(haystack: &RgbImage, region: &DetectedRegion) -> Option<RgbImage> {
    clamped_crop(
        haystack,
        region.x,
        region.y,
        region.width + REGION_MARGIN,
        region.height + REGION_MARGIN,
    )
}

fn clamped_crop(image: &RgbImage, x: u32, y: u32, width: u32, height: u32) -> Option<RgbImage> {
    if x >= image.width() || y >= image.height() {
        return None;
    }
    let width = width.min(image.width() - x);
    let height = height.min(image.height() - y);
    if width == 0 || height == 0 {
        return None;
    }
    Some(crop_imm(image, x, y, width, height).to_image())
}

/// For each target in order, appends every region whose squashed score
/// exceeds `threshold`. Anything other than exactly four matches fails.
pub fn match_characters(
    haystack: &RgbImage,
    targets: &[RgbImage],
    regions: &[DetectedRegion],
    scorer: &dyn SimilarityScorer,
    threshold: f32,
) -> Result<Vec<DetectedRegion>, SolveError> {
    let size = scorer.input_size();
    let candidates: Vec<(DetectedRegion, PatchTensor)> = regions
        .iter()
        .filter_map(|region| {
            region_crop(haystack, region).map(|crop| (*region, PatchTensor::from_image(&crop, size)))
        })
        .collect();

    let mut matched = Vec::with_capacity(CLICK_COUNT);
    for (index, target) in targets.iter().enumerate() {
        let target_patch = PatchTensor::from_image(target, size);
        for (region, candidate) in &candidates {
            let confidence = sigmoid(scorer.score(candidate, &target_patch)?);
            if confidence > threshold {
                log::debug!(
                    "character {index} matched region {region:?} (confidence {confidence:.3})"
                );
                matched.push(*region);
            }
        }
    }

    if matched.len() != CLICK_COUNT {
        return Err(SolveError::Match {
            found: matched.len(),
        });
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::PointSet;
    use image::Rgb;

    /// Scores patches by comparing the mean intensity of their first channel.
    struct MeanScorer;

    impl SimilarityScorer for MeanScorer {
        fn input_size(&self) -> u32 {
            8
        }

        fn score(&self, candidate: &PatchTensor, target: &PatchTensor) -> Result<f32, SolveError> {
            let mean = |patch: &PatchTensor| {
                let plane = (patch.size() * patch.size()) as usize;
                patch.as_slice()[..plane].iter().sum::<f32>() / plane as f32
            };
            Ok(if (mean(candidate) - mean(target)).abs() < 0.02 {
                5.0
            } else {
                -5.0
            })
        }
    }

    const SHADES: [u8; 4] = [60, 120, 180, 240];

    fn pointer_image() -> RgbImage {
        let mut image = RgbImage::new(300, 40);
        for (&x, shade) in TARGET_OFFSETS.iter().zip(SHADES) {
            for dy in 0..TARGET_HEIGHT {
                for dx in 0..TARGET_WIDTH {
                    image.put_pixel(x + dx, TARGET_TOP + dy, Rgb([shade, 0, 0]));
                }
            }
        }
        image
    }

    /// Haystack where the shade for character `i` sits in `boxes[i]`.
    fn haystack(boxes: &[DetectedRegion]) -> RgbImage {
        let mut image = RgbImage::new(320, 160);
        for (region, shade) in boxes.iter().zip(SHADES) {
            for y in region.y..region.y + region.height + REGION_MARGIN {
                for x in region.x..region.x + region.width + REGION_MARGIN {
                    image.put_pixel(x, y, Rgb([shade, 0, 0]));
                }
            }
        }
        image
    }

    fn boxes() -> Vec<DetectedRegion> {
        vec![
            DetectedRegion::new(200, 100, 20, 20),
            DetectedRegion::new(20, 20, 24, 22),
            DetectedRegion::new(120, 40, 18, 26),
            DetectedRegion::new(260, 10, 22, 22),
        ]
    }

    #[test]
    fn splits_four_targets_of_fixed_size() {
        let targets = split_targets(&pointer_image()).unwrap();
        assert_eq!(targets.len(), 4);
        assert!(
            targets
                .iter()
                .all(|t| t.dimensions() == (TARGET_WIDTH, TARGET_HEIGHT))
        );
    }

    #[test]
    fn narrow_pointer_image_is_a_layout_failure() {
        let pointer = RgbImage::new(180, 40);
        assert!(matches!(
            split_targets(&pointer),
            Err(SolveError::Layout(_))
        ));
    }

    #[test]
    fn order_follows_characters_not_regions() {
        let boxes = boxes();
        let haystack = haystack(&boxes);
        let targets = split_targets(&pointer_image()).unwrap();

        let mut shuffled = boxes.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);

        let matched = match_characters(
            &haystack,
            &targets,
            &shuffled,
            &MeanScorer,
            DEFAULT_MATCH_THRESHOLD,
        )
        .unwrap();
        assert_eq!(matched, boxes);

        let points = PointSet::from_regions(&matched).unwrap();
        assert_eq!(points.points()[0], boxes[0].center());
        assert_eq!(points.points()[3], boxes[3].center());
    }

    #[test]
    fn missing_glyph_fails_instead_of_guessing() {
        let boxes = boxes();
        let haystack = haystack(&boxes[..3]);
        let targets = split_targets(&pointer_image()).unwrap();

        let err = match_characters(
            &haystack,
            &targets,
            &boxes[..3],
            &MeanScorer,
            DEFAULT_MATCH_THRESHOLD,
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Match { found: 3 }));
    }

    #[test]
    fn ambiguous_duplicates_fail_instead_of_truncating() {
        let mut boxes = boxes();
        let haystack = {
            let mut image = haystack(&boxes);
            for y in 130..152 {
                for x in 100..122 {
                    image.put_pixel(x, y, Rgb([SHADES[0], 0, 0]));
                }
            }
            image
        };
        boxes.push(DetectedRegion::new(100, 130, 20, 20));
        let targets = split_targets(&pointer_image()).unwrap();

        let err = match_characters(
            &haystack,
            &targets,
            &boxes,
            &MeanScorer,
            DEFAULT_MATCH_THRESHOLD,
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Match { found: 5 }));
    }

    #[test]
    fn threshold_is_strict() {
        struct Neutral;
        impl SimilarityScorer for Neutral {
            fn score(&self, _: &PatchTensor, _: &PatchTensor) -> Result<f32, SolveError> {
                Ok(0.0)
            }
        }
        let boxes = boxes();
        let haystack = haystack(&boxes);
        let targets = split_targets(&pointer_image()).unwrap();
        let err = match_characters(&haystack, &targets, &boxes, &Neutral, 0.5).unwrap_err();
        assert!(matches!(err, SolveError::Match { found: 0 }));
    }
}
