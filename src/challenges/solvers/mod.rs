//! Click-word captcha solving pipeline.
//!
//! Each submodule implements one stage: background classification,
//! foreground segmentation, patch similarity scoring and character
//! matching. [`ClickCaptchaSolver`] chains them into a single blocking
//! `solve` call.

pub mod background;
pub mod matcher;
pub mod segmentation;
pub mod similarity;

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;

use crate::challenges::core::{CaptchaChallenge, DetectedRegion, PointSet};

use self::background::{BackgroundCatalog, BackgroundKind};
use self::matcher::{DEFAULT_MATCH_THRESHOLD, match_characters, split_targets};
use self::segmentation::{DEFAULT_BINARIZE_CUTOFF, detect_regions, remove_background};
use self::similarity::{SiameseScorer, SimilarityScorer};

/// Default grayscale MSE at or below which a background counts as matched.
pub const DEFAULT_CLASSIFICATION_THRESHOLD: f64 = 2.0;

/// Failure of a single solve attempt.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("captcha image could not be decoded: {0}")]
    Decode(String),
    #[error("background does not match any known reference")]
    Classification,
    #[error("expected 4 character matches, found {found}")]
    Match { found: usize },
    #[error("unexpected pointer image layout: {0}")]
    Layout(String),
    #[error("similarity model failed: {0}")]
    Model(String),
}

impl SolveError {
    /// Whether a fresh challenge may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SolveError::Model(_))
    }
}

/// Failure loading the reference backgrounds or the similarity model.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to load image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to load model {path}: {reason}")]
    Model { path: String, reason: String },
}

/// Tunables for the solving pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    pub classification_threshold: f64,
    pub match_threshold: f32,
    pub binarize_cutoff: u8,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            classification_threshold: DEFAULT_CLASSIFICATION_THRESHOLD,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            binarize_cutoff: DEFAULT_BINARIZE_CUTOFF,
        }
    }
}

/// Common solver interface.
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Turns a challenge into four ordered click points.
    fn solve(&self, challenge: &CaptchaChallenge) -> Result<PointSet, SolveError>;
}

/// Outcome of [`ClickCaptchaSolver::analyze`].
#[derive(Debug)]
pub struct SolveReport {
    pub background: Option<BackgroundKind>,
    pub regions: Vec<DetectedRegion>,
    pub outcome: Result<PointSet, SolveError>,
}

impl SolveReport {
    pub fn is_solved(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Default solver: catalog lookup, background subtraction, contour
/// extraction and Siamese matching.
#[derive(Clone)]
pub struct ClickCaptchaSolver {
    catalog: Arc<BackgroundCatalog>,
    scorer: Arc<dyn SimilarityScorer>,
    config: SolverConfig,
}

impl std::fmt::Debug for ClickCaptchaSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickCaptchaSolver")
            .field("backgrounds", &self.catalog.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ClickCaptchaSolver {
    pub fn new(
        catalog: Arc<BackgroundCatalog>,
        scorer: Arc<dyn SimilarityScorer>,
        config: SolverConfig,
    ) -> Self {
        Self {
            catalog,
            scorer,
            config,
        }
    }

    /// Loads `<dir>/backgrounds/*.png` and `<dir>/models/siamese.onnx`.
    pub fn from_assets_dir(dir: impl AsRef<Path>, config: SolverConfig) -> Result<Self, AssetError> {
        let dir = dir.as_ref();
        let catalog = BackgroundCatalog::load_dir(dir.join("backgrounds"))?;
        let scorer = SiameseScorer::from_path(dir.join("models").join("siamese.onnx"))?;
        Ok(Self::new(Arc::new(catalog), Arc::new(scorer), config))
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn catalog(&self) -> &BackgroundCatalog {
        &self.catalog
    }

    /// Runs every stage and reports what each produced, without failing fast.
    pub fn analyze(&self, challenge: &CaptchaChallenge) -> SolveReport {
        let mut report = SolveReport {
            background: None,
            regions: Vec::new(),
            outcome: Err(SolveError::Classification),
        };
        let (original, pointer) = match decode_images(challenge) {
            Ok(images) => images,
            Err(err) => {
                report.outcome = Err(err);
                return report;
            }
        };
        let reference = match self
            .catalog
            .classify(&original, self.config.classification_threshold)
        {
            Ok(reference) => reference,
            Err(err) => {
                report.outcome = Err(err);
                return report;
            }
        };
        report.background = Some(reference.kind());

        let foreground = remove_background(&original, reference.image());
        report.regions = detect_regions(&foreground, self.config.binarize_cutoff);
        report.outcome = self.resolve_points(&foreground, &pointer, &report.regions);
        report
    }

    fn resolve_points(
        &self,
        foreground: &RgbImage,
        pointer: &RgbImage,
        regions: &[DetectedRegion],
    ) -> Result<PointSet, SolveError> {
        let targets = split_targets(pointer)?;
        let matched = match_characters(
            foreground,
            &targets,
            regions,
            self.scorer.as_ref(),
            self.config.match_threshold,
        )?;
        PointSet::from_regions(&matched).ok_or(SolveError::Match {
            found: matched.len(),
        })
    }
}

impl ChallengeSolver for ClickCaptchaSolver {
    fn name(&self) -> &'static str {
        "click_word"
    }

    fn solve(&self, challenge: &CaptchaChallenge) -> Result<PointSet, SolveError> {
        let (original, pointer) = decode_images(challenge)?;
        let reference = self
            .catalog
            .classify(&original, self.config.classification_threshold)?;
        let foreground = remove_background(&original, reference.image());
        let regions = detect_regions(&foreground, self.config.binarize_cutoff);
        log::debug!(
            "background {} left {} candidate regions",
            reference.kind(),
            regions.len()
        );
        self.resolve_points(&foreground, &pointer, &regions)
    }
}

fn decode_images(challenge: &CaptchaChallenge) -> Result<(RgbImage, RgbImage), SolveError> {
    let decode = |bytes: Result<Vec<u8>, base64::DecodeError>, label: &str| {
        let bytes = bytes.map_err(|err| SolveError::Decode(format!("{label}: {err}")))?;
        image::load_from_memory(&bytes)
            .map(|image| image.to_rgb8())
            .map_err(|err| SolveError::Decode(format!("{label}: {err}")))
    };
    Ok((
        decode(challenge.background_bytes(), "background image")?,
        decode(challenge.pointer_bytes(), "pointer image")?,
    ))
}
