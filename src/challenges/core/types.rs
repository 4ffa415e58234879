//! Core data structures shared across the captcha solver, the session client,
//! and the retry orchestrator.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Number of characters the click-word challenge asks for.
pub const CLICK_COUNT: usize = 4;

/// One server-issued click-word challenge.
///
/// Challenges are single-use: the orchestrator fetches a fresh one for every
/// attempt and drops it once the attempt is over.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaChallenge {
    #[serde(rename = "bigImage")]
    pub background_image: String,
    #[serde(rename = "smallImage")]
    pub pointer_image: String,
    pub secret_key: String,
    pub uuid: String,
    #[serde(default)]
    pub word_count: u32,
}

impl CaptchaChallenge {
    /// Decoded bytes of the background image.
    pub fn background_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(strip_data_uri(&self.background_image))
    }

    /// Decoded bytes of the pointer (target characters) image.
    pub fn pointer_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(strip_data_uri(&self.pointer_image))
    }
}

fn strip_data_uri(value: &str) -> &str {
    match value.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => value,
    }
}

/// Axis-aligned bounding box of a foreground blob in background coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectedRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DetectedRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Click point at the centre of the box; halves round to even.
    pub fn center(&self) -> CandidatePoint {
        let cx = (self.x as f64 + self.width as f64 / 2.0).round_ties_even();
        let cy = (self.y as f64 + self.height as f64 / 2.0).round_ties_even();
        CandidatePoint::new(cx as i32, cy as i32)
    }
}

/// Integer click coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidatePoint {
    pub x: i32,
    pub y: i32,
}

impl CandidatePoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Ordered click sequence submitted to the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointSet(Vec<CandidatePoint>);

impl PointSet {
    /// Builds a point set, rejecting anything but exactly [`CLICK_COUNT`] points.
    pub fn new(points: Vec<CandidatePoint>) -> Option<Self> {
        (points.len() == CLICK_COUNT).then_some(Self(points))
    }

    /// Resolves click points from matched regions, keeping their order.
    pub fn from_regions(regions: &[DetectedRegion]) -> Option<Self> {
        Self::new(regions.iter().map(DetectedRegion::center).collect())
    }

    pub fn points(&self) -> &[CandidatePoint] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Token pair plus client correlation id held for one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub refresh_token: String,
    pub client_id: String,
}

/// Capability granted by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub sign: String,
    pub challenge_uuid: String,
}
