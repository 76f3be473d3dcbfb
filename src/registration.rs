//! New-user registration: id validation and face sample collection.

use crate::persistence::IdMap;
use image::GrayImage;
use std::fmt;

/// Why a proposed user id was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdRejection {
    Empty,
    TooLong { max: usize },
    InvalidCharacters,
    Duplicate,
}

impl fmt::Display for IdRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "user id is empty"),
            Self::TooLong { max } => write!(f, "user id longer than {max} characters"),
            Self::InvalidCharacters => write!(f, "user id may only contain letters, digits, '_' and '-'"),
            Self::Duplicate => write!(f, "user id already registered"),
        }
    }
}

/// Trim and check a proposed user id against the id map
pub fn validate_user_id(raw: &str, existing: &IdMap, max_len: usize) -> Result<String, IdRejection> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(IdRejection::Empty);
    }
    if id.chars().count() > max_len {
        return Err(IdRejection::TooLong { max: max_len });
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(IdRejection::InvalidCharacters);
    }
    if existing.contains(id) {
        return Err(IdRejection::Duplicate);
    }
    Ok(id.to_string())
}

/// Samples collected for one user being registered
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    user_id: String,
    target: usize,
    samples: Vec<GrayImage>,
}

impl RegistrationSession {
    #[must_use]
    pub fn new(user_id: String, target: usize) -> Self {
        Self {
            user_id,
            target: target.max(1),
            samples: Vec::with_capacity(target),
        }
    }

    /// Store one sample; ignored once the target is reached. Returns whether
    /// the target is now reached.
    pub fn add_sample(&mut self, sample: GrayImage) -> bool {
        if !self.is_complete() {
            self.samples.push(sample);
        }
        self.is_complete()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn captured(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub const fn target(&self) -> usize {
        self.target
    }

    #[must_use]
    pub fn samples(&self) -> &[GrayImage] {
        &self.samples
    }
}
