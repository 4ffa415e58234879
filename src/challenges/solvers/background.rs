//! Background classification against the closed catalog of known motifs.
//!
//! Every challenge is rendered on top of one of a fixed set of stock
//! pictures. Finding which one lets the segmenter subtract it exactly.

use std::fmt;
use std::path::Path;

use image::{GrayImage, ImageError, ImageReader, RgbImage};

use super::segmentation::grayscale;
use super::{AssetError, SolveError};

/// The known background motifs, in catalog declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundKind {
    Beach,
    ButterflyFlower,
    Butterfly,
    Cake,
    Camera,
    Car,
    Cats,
    Doll,
    Falls,
    Grasshopper,
    Grassland,
    Horse,
    HorseHerd,
    Hummingbird,
    Moon,
    Pie,
    Rose,
    SnowMountain,
    Squirrel,
    Villa,
    Wall,
}

impl BackgroundKind {
    pub const ALL: [BackgroundKind; 21] = [
        BackgroundKind::Beach,
        BackgroundKind::ButterflyFlower,
        BackgroundKind::Butterfly,
        BackgroundKind::Cake,
        BackgroundKind::Camera,
        BackgroundKind::Car,
        BackgroundKind::Cats,
        BackgroundKind::Doll,
        BackgroundKind::Falls,
        BackgroundKind::Grasshopper,
        BackgroundKind::Grassland,
        BackgroundKind::Horse,
        BackgroundKind::HorseHerd,
        BackgroundKind::Hummingbird,
        BackgroundKind::Moon,
        BackgroundKind::Pie,
        BackgroundKind::Rose,
        BackgroundKind::SnowMountain,
        BackgroundKind::Squirrel,
        BackgroundKind::Villa,
        BackgroundKind::Wall,
    ];

    /// Asset name, also the reference file stem.
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundKind::Beach => "beach",
            BackgroundKind::ButterflyFlower => "butterfly_flower",
            BackgroundKind::Butterfly => "butterfly",
            BackgroundKind::Cake => "cake",
            BackgroundKind::Camera => "camera",
            BackgroundKind::Car => "car",
            BackgroundKind::Cats => "cats",
            BackgroundKind::Doll => "doll",
            BackgroundKind::Falls => "falls",
            BackgroundKind::Grasshopper => "grasshopper",
            BackgroundKind::Grassland => "grassland",
            BackgroundKind::Horse => "horse",
            BackgroundKind::HorseHerd => "horse_herd",
            BackgroundKind::Hummingbird => "hummingbird",
            BackgroundKind::Moon => "moon",
            BackgroundKind::Pie => "pie",
            BackgroundKind::Rose => "rose",
            BackgroundKind::SnowMountain => "snow_mountain",
            BackgroundKind::Squirrel => "squirrel",
            BackgroundKind::Villa => "villa",
            BackgroundKind::Wall => "wall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for BackgroundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A catalog entry: the motif and its pristine reference image.
#[derive(Debug, Clone)]
pub struct ReferenceBackground {
    kind: BackgroundKind,
    image: RgbImage,
    gray: GrayImage,
}

impl ReferenceBackground {
    pub fn new(kind: BackgroundKind, image: RgbImage) -> Self {
        let gray = grayscale(&image);
        Self { kind, image, gray }
    }

    pub fn kind(&self) -> BackgroundKind {
        self.kind
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Immutable, ordered set of reference backgrounds.
///
/// Loaded once per process and shared behind an `Arc`; classification is a
/// linear scan where the first entry within the threshold wins.
#[derive(Debug, Clone, Default)]
pub struct BackgroundCatalog {
    entries: Vec<ReferenceBackground>,
}

impl BackgroundCatalog {
    /// Builds a catalog from explicit entries, keeping their order.
    pub fn from_entries(entries: Vec<ReferenceBackground>) -> Self {
        Self { entries }
    }

    /// Loads `<dir>/<name>.png` for every [`BackgroundKind`] in declaration order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, AssetError> {
        let dir = dir.as_ref();
        let mut entries = Vec::with_capacity(BackgroundKind::ALL.len());
        for kind in BackgroundKind::ALL {
            let path = dir.join(format!("{}.png", kind.name()));
            let image = load_reference(&path).map_err(|source| AssetError::Image {
                path: path.display().to_string(),
                source,
            })?;
            entries.push(ReferenceBackground::new(kind, image));
        }
        log::debug!("loaded {} reference backgrounds from {}", entries.len(), dir.display());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReferenceBackground] {
        &self.entries
    }

    /// Returns the first reference whose grayscale MSE against `image` is at
    /// or below `threshold`.
    pub fn classify(
        &self,
        image: &RgbImage,
        threshold: f64,
    ) -> Result<&ReferenceBackground, SolveError> {
        let gray = grayscale(image);
        for entry in &self.entries {
            let Some(score) = mean_squared_error(&entry.gray, &gray) else {
                log::debug!(
                    "skipping background {}: size {:?} != {:?}",
                    entry.kind,
                    entry.gray.dimensions(),
                    gray.dimensions()
                );
                continue;
            };
            if score <= threshold {
                log::debug!("background matched {} (mse {score:.2})", entry.kind);
                return Ok(entry);
            }
        }
        Err(SolveError::Classification)
    }
}

/// Decodes by content, not extension; references saved from challenges are
/// often JPEG data under a `.png` name.
fn load_reference(path: &Path) -> Result<RgbImage, ImageError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.to_rgb8())
}

/// Mean squared intensity error of `observed` against `reference`, rounded
/// to two decimals, or `None` when the images differ in size.
///
/// Scoring runs in 8-bit arithmetic: the difference `reference - observed`
/// saturates at zero and its square wraps. Glyphs drawn brighter than the
/// motif therefore barely move the score, and the default threshold of 2.0
/// is calibrated against exactly this arithmetic.
pub fn mean_squared_error(reference: &GrayImage, observed: &GrayImage) -> Option<f64> {
    if reference.dimensions() != observed.dimensions() {
        return None;
    }
    let pixels = (reference.width() as u64) * (reference.height() as u64);
    if pixels == 0 {
        return Some(0.0);
    }
    let sum: u64 = reference
        .as_raw()
        .iter()
        .zip(observed.as_raw())
        .map(|(&expected, &actual)| {
            let diff = expected.saturating_sub(actual);
            diff.wrapping_mul(diff) as u64
        })
        .sum();
    let mse = sum as f64 / pixels as f64;
    Some((mse * 100.0).round() / 100.0)
}
