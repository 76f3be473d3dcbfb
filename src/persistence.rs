//! Storage of the user id map, captured face samples and trained models.

use crate::auth::{FacePredictor, Identity};
use crate::{Error, Result};
use image::GrayImage;
use log::{info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Mapping of user id to dense numeric label
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    entries: BTreeMap<String, i32>,
}

impl IdMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse JSON, accepting integer or numeric-string labels.
    /// Entries with any other value are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(Error::Persistence("Id map is not a JSON object".to_string()));
        };

        let mut entries = BTreeMap::new();
        for (user_id, label) in object {
            let parsed = match &label {
                Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
                Value::String(s) => s.trim().parse::<i32>().ok(),
                _ => None,
            };
            match parsed {
                Some(numeric_id) => {
                    entries.insert(user_id, numeric_id);
                }
                None => warn!("Ignoring id map entry {user_id}: invalid label {label}"),
            }
        }
        Ok(Self { entries })
    }

    /// Pretty JSON with integer labels
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<i32> {
        self.entries.get(user_id).copied()
    }

    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Largest label plus one, or 0 when empty
    #[must_use]
    pub fn next_numeric_id(&self) -> i32 {
        self.entries.values().max().map_or(0, |max| max.saturating_add(1))
    }

    /// Record a new user with the next free label
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the user id is already mapped.
    pub fn assign(&mut self, user_id: &str) -> Result<Identity> {
        if self.contains(user_id) {
            return Err(Error::InvalidInput(format!("User id already exists: {user_id}")));
        }
        let numeric_id = self.next_numeric_id();
        self.entries.insert(user_id.to_string(), numeric_id);
        Ok(Identity {
            id: user_id.to_string(),
            numeric_id,
        })
    }

    /// Identities ordered by numeric label
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self
            .entries
            .iter()
            .map(|(id, &numeric_id)| Identity {
                id: id.clone(),
                numeric_id,
            })
            .collect();
        identities.sort_by_key(|identity| identity.numeric_id);
        identities
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trains and loads face models (LBPH or compatible)
pub trait FaceModelBackend {
    /// Train on `samples` under `label` and write the model to `path`
    fn train(&self, samples: &[GrayImage], label: i32, path: &Path) -> Result<()>;

    /// Load a model written by [`FaceModelBackend::train`]
    fn load(&self, path: &Path) -> Result<Box<dyn FacePredictor>>;
}

/// Persistence collaborator used by the session
pub trait IdentityStore {
    fn load_id_map(&self) -> Result<IdMap>;
    fn save_id_map(&self, map: &IdMap) -> Result<()>;
    fn load_model(&self, identity: &Identity) -> Result<Box<dyn FacePredictor>>;
    /// Persist samples, train, and return the freshly trained predictor
    fn save_model(&self, identity: &Identity, samples: &[GrayImage]) -> Result<Box<dyn FacePredictor>>;
}

/// Filesystem-backed identity store
pub struct FileIdentityStore<B> {
    id_map_path: PathBuf,
    models_dir: PathBuf,
    samples_dir: PathBuf,
    backend: B,
}

impl<B: FaceModelBackend> FileIdentityStore<B> {
    pub fn new(
        id_map_path: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
        samples_dir: impl Into<PathBuf>,
        backend: B,
    ) -> Self {
        Self {
            id_map_path: id_map_path.into(),
            models_dir: models_dir.into(),
            samples_dir: samples_dir.into(),
            backend,
        }
    }

    /// Model file of a user
    #[must_use]
    pub fn model_path(&self, identity: &Identity) -> PathBuf {
        self.models_dir.join(format!("{}.yml", identity.id))
    }

    /// Sample directory of a user
    #[must_use]
    pub fn samples_path(&self, identity: &Identity) -> PathBuf {
        self.samples_dir.join(&identity.id)
    }
}

impl<B: FaceModelBackend> IdentityStore for FileIdentityStore<B> {
    fn load_id_map(&self) -> Result<IdMap> {
        if !self.id_map_path.exists() {
            return Ok(IdMap::new());
        }
        let text = fs::read_to_string(&self.id_map_path)?;
        match IdMap::from_json(&text) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(
                    "Id map {} is unreadable ({}); starting empty",
                    self.id_map_path.display(),
                    e
                );
                Ok(IdMap::new())
            }
        }
    }

    fn save_id_map(&self, map: &IdMap) -> Result<()> {
        if let Some(parent) = self.id_map_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.id_map_path, map.to_json()?)?;
        info!("Saved id map with {} user(s)", map.len());
        Ok(())
    }

    fn load_model(&self, identity: &Identity) -> Result<Box<dyn FacePredictor>> {
        let path = self.model_path(identity);
        if !path.exists() {
            return Err(Error::Persistence(format!("Model not found: {}", path.display())));
        }
        self.backend.load(&path)
    }

    fn save_model(&self, identity: &Identity, samples: &[GrayImage]) -> Result<Box<dyn FacePredictor>> {
        if samples.is_empty() {
            return Err(Error::Persistence(format!("No samples for {}", identity.id)));
        }

        let sample_dir = self.samples_path(identity);
        fs::create_dir_all(&sample_dir)?;
        for (index, sample) in samples.iter().enumerate() {
            sample.save(sample_dir.join(format!("face_{index:03}.png")))?;
        }

        fs::create_dir_all(&self.models_dir)?;
        let path = self.model_path(identity);
        self.backend.train(samples, identity.numeric_id, &path)?;
        info!(
            "Trained model for {} from {} sample(s) at {}",
            identity,
            samples.len(),
            path.display()
        );
        self.backend.load(&path)
    }
}
