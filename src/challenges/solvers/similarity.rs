//! Patch similarity scoring.
//!
//! The production scorer runs a Siamese ONNX network through `tract`; tests
//! and experiments can plug in any other [`SimilarityScorer`].

use std::path::Path;

use image::RgbImage;
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use super::{AssetError, SolveError};

/// Side length of the square patches the Siamese network consumes.
pub const PATCH_SIZE: u32 = 105;

/// Normalised `1×3×S×S` patch: RGB planes scaled to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchTensor {
    size: u32,
    data: Vec<f32>,
}

impl PatchTensor {
    /// Resizes `image` to `size×size` (bilinear) and lays it out channel-first.
    pub fn from_image(image: &RgbImage, size: u32) -> Self {
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
        let plane = (size * size) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = (y * size + x) as usize;
            for (channel, value) in pixel.0.iter().enumerate() {
                data[channel * plane + offset] = *value as f32 / 255.0;
            }
        }
        Self { size, data }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Tensor shape including the batch dimension.
    pub fn shape(&self) -> [usize; 4] {
        let side = self.size as usize;
        [1, 3, side, side]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Scores how likely two patches depict the same glyph.
///
/// Returns the raw model output (a logit); callers squash it.
pub trait SimilarityScorer: Send + Sync {
    fn input_size(&self) -> u32 {
        PATCH_SIZE
    }

    fn score(&self, candidate: &PatchTensor, target: &PatchTensor) -> Result<f32, SolveError>;
}

/// Logistic squashing applied to raw scores.
pub fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Siamese network loaded once and shared read-only across solves.
pub struct SiameseScorer {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
}

impl SiameseScorer {
    /// Loads and optimises the ONNX model. Input 0 is the candidate region,
    /// input 1 the target character.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AssetError> {
        let path = path.as_ref();
        let side = PATCH_SIZE as usize;
        let model_error = |err: TractError| AssetError::Model {
            path: path.display().to_string(),
            reason: err.to_string(),
        };

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, f32::fact([1, 3, side, side]).into()))
            .and_then(|model| model.with_input_fact(1, f32::fact([1, 3, side, side]).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(model_error)?;

        log::debug!("loaded siamese model from {}", path.display());
        Ok(Self {
            model,
            input_size: PATCH_SIZE,
        })
    }

    fn to_tensor(patch: &PatchTensor) -> Result<Tensor, SolveError> {
        Tensor::from_shape(&patch.shape(), patch.as_slice())
            .map_err(|err| SolveError::Model(format!("failed to build input tensor: {err}")))
    }
}

impl SimilarityScorer for SiameseScorer {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn score(&self, candidate: &PatchTensor, target: &PatchTensor) -> Result<f32, SolveError> {
        let inputs = tvec!(
            Self::to_tensor(candidate)?.into(),
            Self::to_tensor(target)?.into()
        );
        let outputs = self
            .model
            .run(inputs)
            .map_err(|err| SolveError::Model(format!("inference failed: {err}")))?;
        let first = outputs
            .first()
            .ok_or_else(|| SolveError::Model("model produced no outputs".into()))?;
        let view = first
            .to_array_view::<f32>()
            .map_err(|err| SolveError::Model(format!("unexpected output type: {err}")))?;
        view.iter()
            .next()
            .copied()
            .ok_or_else(|| SolveError::Model("model produced an empty output".into()))
    }
}
