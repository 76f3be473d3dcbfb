//! Face login: scoring a face crop against every enrolled identity.
//!
//! Predictors return an LBPH-style distance, so lower confidence is a better
//! match. A match is accepted only below the configured threshold, and an
//! accepted match stays pending until the user confirms it.

use crate::{constants::FACE_CROP_SIZE, Error, Frame, Result};
use image::{imageops, GrayImage};
use log::{debug, warn};
use std::fmt;

/// An enrolled user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub numeric_id: i32,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.id, self.numeric_id)
    }
}

/// Axis-aligned face rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Outcome of scoring one face
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatchResult {
    /// Best identity, present only when accepted
    pub identity: Option<Identity>,

    /// Lowest confidence seen; infinite when no predictor produced a score
    pub confidence: f64,

    /// Best identity regardless of the threshold
    pub candidate: Option<Identity>,
}

impl FaceMatchResult {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.identity.is_some()
    }

    fn none() -> Self {
        Self {
            identity: None,
            confidence: f64::INFINITY,
            candidate: None,
        }
    }
}

/// Locates faces in a frame
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>>;
}

/// A trained per-identity face model
pub trait FacePredictor {
    /// Distance-like confidence for the face crop (lower is better)
    fn predict(&self, face: &GrayImage) -> Result<f64>;
}

/// Crop a face box out of a frame as a square grayscale image
///
/// # Errors
///
/// Returns `InvalidInput` if the box is empty or lies outside the frame.
pub fn crop_face(frame: &Frame, face: &FaceBox) -> Result<GrayImage> {
    let x_end = face.x.saturating_add(face.width).min(frame.width());
    let y_end = face.y.saturating_add(face.height).min(frame.height());
    if face.x >= x_end || face.y >= y_end {
        return Err(Error::InvalidInput(format!("Face box {face:?} outside frame")));
    }
    let region = imageops::crop_imm(frame, face.x, face.y, x_end - face.x, y_end - face.y).to_image();
    let gray = imageops::grayscale(&region);
    Ok(imageops::resize(
        &gray,
        FACE_CROP_SIZE,
        FACE_CROP_SIZE,
        imageops::FilterType::Triangle,
    ))
}

/// Scores faces against all enrolled predictors in enrollment order
pub struct AuthMatcher {
    enrolled: Vec<(Identity, Box<dyn FacePredictor>)>,
    threshold: f64,
}

impl AuthMatcher {
    /// Create a new matcher accepting confidences strictly below `threshold`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the threshold is not finite and positive.
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::InvalidInput(format!("Invalid accept threshold: {threshold}")));
        }
        Ok(Self {
            enrolled: Vec::new(),
            threshold,
        })
    }

    /// Add an identity; a re-enrolled id replaces its predictor in place
    pub fn enroll(&mut self, identity: Identity, predictor: Box<dyn FacePredictor>) {
        if let Some(slot) = self.enrolled.iter_mut().find(|(known, _)| known.id == identity.id) {
            *slot = (identity, predictor);
        } else {
            self.enrolled.push((identity, predictor));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.enrolled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enrolled.is_empty()
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.enrolled.iter().map(|(identity, _)| identity)
    }

    /// Score a face crop. Failing predictors and NaN scores are skipped; the
    /// first strictly lowest score wins.
    #[must_use]
    pub fn match_face(&self, face: &GrayImage) -> FaceMatchResult {
        let mut best: Option<(&Identity, f64)> = None;
        for (identity, predictor) in &self.enrolled {
            match predictor.predict(face) {
                Ok(confidence) if confidence.is_nan() => {
                    debug!("Predictor for {} returned NaN", identity.id);
                }
                Ok(confidence) => {
                    if best.map_or(true, |(_, lowest)| confidence < lowest) {
                        best = Some((identity, confidence));
                    }
                }
                Err(e) => warn!("Skipping predictor for {}: {}", identity.id, e),
            }
        }

        let Some((identity, confidence)) = best else {
            return FaceMatchResult::none();
        };
        debug!(
            "Best match {} confidence {:.2} (threshold {:.2})",
            identity.id, confidence, self.threshold
        );
        FaceMatchResult {
            identity: (confidence < self.threshold).then(|| identity.clone()),
            confidence,
            candidate: Some(identity.clone()),
        }
    }
}
