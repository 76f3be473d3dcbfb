//! Typed, validated catalog of selectable cars.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One selectable car
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarDefinition {
    /// Stable key used by voice intents (e.g. `ferrari`)
    pub key: String,

    /// Display name
    pub name: String,

    /// Asset path, relative to the catalog's asset root
    pub asset_path: PathBuf,

    /// One-line description shown in the menu
    #[serde(default)]
    pub description: String,

    /// Uniform scale applied after centering
    pub scale: f64,

    /// Lift along the marker normal, in meters
    #[serde(default)]
    pub elevation: f64,

    /// Spoken keywords (including common misspellings) selecting this car
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Immutable, ordered list of cars. Shape is checked once in [`Catalog::new`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    asset_root: PathBuf,
    cars: Vec<CarDefinition>,
}

impl Catalog {
    /// Build a catalog, rejecting malformed entries
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on an empty or duplicate key, an empty asset path,
    /// a non-positive or non-finite scale, or a non-finite elevation.
    pub fn new(asset_root: impl Into<PathBuf>, cars: Vec<CarDefinition>) -> Result<Self> {
        validate_cars(&cars)?;
        Ok(Self {
            asset_root: asset_root.into(),
            cars,
        })
    }

    /// Number of cars
    #[must_use]
    pub fn len(&self) -> usize {
        self.cars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cars.is_empty()
    }

    /// Car at zero-based catalog index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&CarDefinition> {
        self.cars.get(index)
    }

    /// One-based menu ordinal of the car with the given key
    #[must_use]
    pub fn ordinal_of(&self, key: &str) -> Option<usize> {
        self.cars.iter().position(|car| car.key == key).map(|index| index + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CarDefinition> {
        self.cars.iter()
    }

    /// Directory that asset paths are resolved against
    #[must_use]
    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }
}

pub(crate) fn validate_cars(cars: &[CarDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for car in cars {
        if car.key.trim().is_empty() {
            return Err(Error::ConfigError(format!("Car '{}' has an empty key", car.name)));
        }
        if !seen.insert(car.key.as_str()) {
            return Err(Error::ConfigError(format!("Duplicate car key: {}", car.key)));
        }
        if car.asset_path.as_os_str().is_empty() {
            return Err(Error::ConfigError(format!("Car '{}' has no asset path", car.key)));
        }
        if !car.scale.is_finite() || car.scale <= 0.0 {
            return Err(Error::ConfigError(format!(
                "Car '{}' scale must be finite and positive, got {}",
                car.key, car.scale
            )));
        }
        if !car.elevation.is_finite() {
            return Err(Error::ConfigError(format!(
                "Car '{}' elevation must be finite",
                car.key
            )));
        }
    }
    Ok(())
}

/// The two cars shipped with the showroom
#[must_use]
pub fn default_cars() -> Vec<CarDefinition> {
    vec![
        CarDefinition {
            key: "ferrari".to_string(),
            name: "Ferrari F40".to_string(),
            asset_path: PathBuf::from("ferrari-f40/f40.obj"),
            description: "Superdeportivo clásico italiano".to_string(),
            scale: 0.05,
            elevation: 0.01,
            keywords: ["ferrari", "ferari", "ferrary", "f40", "f cuarenta"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        },
        CarDefinition {
            key: "porsche".to_string(),
            name: "Porsche 911".to_string(),
            asset_path: PathBuf::from("porsche-911/911.glb"),
            description: "Deportivo alemán icónico".to_string(),
            scale: 0.03,
            elevation: 0.015,
            keywords: [
                "porsche",
                "porche",
                "porshe",
                "novecientos once",
                "911",
                "nueve uno uno",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(key: &str, scale: f64) -> CarDefinition {
        CarDefinition {
            key: key.to_string(),
            name: key.to_uppercase(),
            asset_path: PathBuf::from(format!("{key}/model.obj")),
            description: String::new(),
            scale,
            elevation: 0.0,
            keywords: vec![key.to_string()],
        }
    }

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog = Catalog::new("assets/3d_models", default_cars()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(0).unwrap().name, "Ferrari F40");
        assert_eq!(catalog.ordinal_of("porsche"), Some(2));
        assert_eq!(catalog.ordinal_of("lada"), None);
        assert_eq!(catalog.asset_root(), Path::new("assets/3d_models"));
    }

    #[test]
    fn test_rejects_duplicate_keys() {
        let result = Catalog::new("", vec![car("a", 1.0), car("a", 2.0)]);
        assert!(matches!(result, Err(Error::ConfigError(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_rejects_bad_scale() {
        assert!(Catalog::new("", vec![car("a", 0.0)]).is_err());
        assert!(Catalog::new("", vec![car("a", -1.0)]).is_err());
        assert!(Catalog::new("", vec![car("a", f64::NAN)]).is_err());
    }

    #[test]
    fn test_rejects_empty_key_and_path() {
        assert!(Catalog::new("", vec![car("", 1.0)]).is_err());
        let mut no_path = car("a", 1.0);
        no_path.asset_path = PathBuf::new();
        assert!(Catalog::new("", vec![no_path]).is_err());
    }

    #[test]
    fn test_empty_catalog_is_allowed() {
        let catalog = Catalog::new("", Vec::new()).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.get(0).is_none());
    }
}
