//! Configuration management for the AR showroom

use crate::catalog::{default_cars, validate_cars, CarDefinition, Catalog};
use crate::constants::{
    DEFAULT_ACCEPT_THRESHOLD, DEFAULT_ENERGY_THRESHOLD, DEFAULT_ERROR_BACKOFF_MS, DEFAULT_EXPONENTIAL_ALPHA, DEFAULT_JOIN_TIMEOUT_MS,
    DEFAULT_LISTEN_TIMEOUT_MS, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_MOVING_AVERAGE_WINDOW, DEFAULT_PAUSE_MS, DEFAULT_PHRASE_LIMIT_MS,
    DEFAULT_REGISTRATION_SAMPLES, DEFAULT_RETRY_PAUSE_MS, DEFAULT_SERVICE_BACKOFF_MS, DEFAULT_SPEECH_LANGUAGE, DEFAULT_TRANSCRIBER_URL,
    DEFAULT_TRANSCRIBE_TIMEOUT_MS, DEFAULT_VOICE_QUEUE_CAPACITY,
    EXPONENTIAL_ALPHA_MAX, EXPONENTIAL_ALPHA_MIN, MARKER_SIZE_METERS, MAX_USER_ID_LENGTH, MENU_MARKER_ID,
    MODEL_MARKER_ID,
};
use crate::pose_estimation::{CameraIntrinsics, CameraModel, Distortion};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Profile name whose intrinsics are derived from the frame size
pub const ESTIMATED_PROFILE: &str = "estimated";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera device and intrinsics profiles
    pub camera: CameraConfig,

    /// Face login configuration
    pub auth: AuthConfig,

    /// Marker ids, size and pose smoothing
    pub markers: MarkerConfig,

    /// Selectable cars
    pub catalog: CatalogConfig,

    /// Face registration configuration
    pub registration: RegistrationConfig,

    /// Voice command configuration
    pub voice: VoiceConfig,

    /// On-disk locations for identities and models
    pub storage: StorageConfig,

    /// Display configuration
    pub display: DisplayConfig,
}

/// Camera selection and calibration profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture device index
    pub device: i32,

    /// Active profile name
    pub profile: String,

    /// Calibrated profiles by name
    pub profiles: BTreeMap<String, CameraProfile>,
}

/// Calibrated intrinsics of one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraProfile {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,

    /// Radial/tangential distortion `k1 k2 p1 p2 k3`
    #[serde(default)]
    pub distortion: [f64; 5],

    /// Face acceptance threshold tuned for this camera
    #[serde(default)]
    pub accept_threshold: Option<f64>,
}

/// Face login parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept a match when its confidence is below this value
    pub accept_threshold: f64,
}

/// Marker ids, size and pose smoothing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Marker that anchors the menu and the displayed car
    pub menu_marker_id: i32,

    /// Reserved marker id
    pub model_marker_id: i32,

    /// Printed marker side length in meters
    pub marker_size_meters: f64,

    /// Pose filter name (`none`, `exponential`, `moving_average`)
    pub pose_filter: String,

    /// Exponential filter alpha
    pub exponential_alpha: f64,

    /// Moving average window size
    pub moving_average_window: usize,
}

/// Catalog of cars
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory that asset paths are resolved against
    pub asset_root: PathBuf,

    /// Cars in menu order
    pub cars: Vec<CarDefinition>,
}

/// Registration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Face samples captured before training
    pub sample_count: usize,

    /// Longest accepted user id
    pub max_id_length: usize,
}

/// Voice command channel parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Start listening on launch
    pub enabled_on_start: bool,

    /// Bounded intent queue capacity
    pub queue_capacity: usize,

    /// Wait for speech at most this long per cycle
    pub listen_timeout_ms: u64,

    /// Longest phrase captured per cycle
    pub phrase_time_limit_ms: u64,

    /// Consecutive failures before backing off
    pub max_consecutive_errors: u32,

    /// Backoff after repeated transcription service failures
    pub service_backoff_ms: u64,

    /// Backoff after repeated other failures
    pub error_backoff_ms: u64,

    /// Pause after a single failure
    pub retry_pause_ms: u64,

    /// Bounded wait when stopping the worker
    pub join_timeout_ms: u64,

    /// Microphone RMS level that counts as speech
    pub energy_threshold: f64,

    /// Trailing silence that ends a phrase
    pub pause_ms: u64,

    /// HTTP endpoint receiving a multipart WAV upload and answering `{"text": ...}`
    pub transcriber_url: String,

    /// Language hint sent with every clip
    pub language: String,

    pub transcribe_timeout_ms: u64,

    /// Phrases navigating back to the menu
    pub menu_keywords: Vec<String>,

    /// Phrases logging out
    pub logout_keywords: Vec<String>,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON map of user id to numeric id
    pub id_map_path: PathBuf,

    /// Directory of trained models
    pub models_dir: PathBuf,

    /// Directory of captured face samples
    pub samples_dir: PathBuf,

    /// Haar cascade used by the face detector
    pub face_cascade: PathBuf,
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Window title
    pub window_name: String,

    /// Key poll delay in milliseconds
    pub poll_delay_ms: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            auth: AuthConfig::default(),
            markers: MarkerConfig::default(),
            catalog: CatalogConfig::default(),
            registration: RegistrationConfig::default(),
            voice: VoiceConfig::default(),
            storage: StorageConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "droidcam".to_string(),
            CameraProfile {
                fx: 1060.0,
                fy: 1060.0,
                cx: 640.0,
                cy: 360.0,
                distortion: [0.0; 5],
                accept_threshold: Some(60.0),
            },
        );
        Self {
            device: 0,
            profile: ESTIMATED_PROFILE.to_string(),
            profiles,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            menu_marker_id: MENU_MARKER_ID,
            model_marker_id: MODEL_MARKER_ID,
            marker_size_meters: MARKER_SIZE_METERS,
            pose_filter: "none".to_string(),
            exponential_alpha: DEFAULT_EXPONENTIAL_ALPHA,
            moving_average_window: DEFAULT_MOVING_AVERAGE_WINDOW,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("assets/3d_models"),
            cars: default_cars(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            sample_count: DEFAULT_REGISTRATION_SAMPLES,
            max_id_length: MAX_USER_ID_LENGTH,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled_on_start: false,
            queue_capacity: DEFAULT_VOICE_QUEUE_CAPACITY,
            listen_timeout_ms: DEFAULT_LISTEN_TIMEOUT_MS,
            phrase_time_limit_ms: DEFAULT_PHRASE_LIMIT_MS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            service_backoff_ms: DEFAULT_SERVICE_BACKOFF_MS,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF_MS,
            retry_pause_ms: DEFAULT_RETRY_PAUSE_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
            pause_ms: DEFAULT_PAUSE_MS,
            transcriber_url: DEFAULT_TRANSCRIBER_URL.to_string(),
            language: DEFAULT_SPEECH_LANGUAGE.to_string(),
            transcribe_timeout_ms: DEFAULT_TRANSCRIBE_TIMEOUT_MS,
            menu_keywords: ["menu", "menú", "volver", "atrás", "back"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            logout_keywords: ["salir", "logout", "cerrar sesión", "quit"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            id_map_path: PathBuf::from("data/user_ids.json"),
            models_dir: PathBuf::from("data/models"),
            samples_dir: PathBuf::from("data/faces"),
            face_cascade: PathBuf::from("assets/haarcascade_frontalface_default.xml"),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            window_name: "AR Showroom".to_string(),
            poll_delay_ms: 1,
        }
    }
}

impl VoiceConfig {
    #[must_use]
    pub const fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    #[must_use]
    pub const fn phrase_time_limit(&self) -> Duration {
        Duration::from_millis(self.phrase_time_limit_ms)
    }

    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    #[must_use]
    pub const fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    #[must_use]
    pub const fn transcribe_timeout(&self) -> Duration {
        Duration::from_millis(self.transcribe_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::IoError(e.to_string()))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| Error::IoError(e.to_string()))?;

        Ok(())
    }

    /// Build the validated catalog
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::new(self.catalog.asset_root.clone(), self.catalog.cars.clone())
    }

    /// Profile selected by `camera.profile`, `None` for the estimated profile
    pub fn active_profile(&self) -> Result<Option<&CameraProfile>> {
        if self.camera.profile == ESTIMATED_PROFILE {
            return Ok(None);
        }
        self.camera
            .profiles
            .get(&self.camera.profile)
            .map(Some)
            .ok_or_else(|| Error::ConfigError(format!("Unknown camera profile: {}", self.camera.profile)))
    }

    /// Intrinsics for a frame of the given size
    pub fn intrinsics_for(&self, width: u32, height: u32) -> Result<(CameraIntrinsics, Distortion)> {
        match self.active_profile()? {
            None => Ok((CameraIntrinsics::estimated(width, height), Distortion::default())),
            Some(profile) => Ok((
                CameraIntrinsics::new(profile.fx, profile.fy, profile.cx, profile.cy),
                Distortion::from_coefficients(profile.distortion),
            )),
        }
    }

    /// Camera model for the pose estimator
    pub fn camera_model(&self) -> Result<CameraModel> {
        Ok(match self.active_profile()? {
            None => CameraModel::Estimated,
            Some(profile) => CameraModel::Calibrated(
                CameraIntrinsics::new(profile.fx, profile.fy, profile.cx, profile.cy),
                Distortion::from_coefficients(profile.distortion),
            ),
        })
    }

    /// Effective face acceptance threshold: the profile's override, else the global one
    pub fn accept_threshold(&self) -> Result<f64> {
        Ok(self
            .active_profile()?
            .and_then(|profile| profile.accept_threshold)
            .unwrap_or(self.auth.accept_threshold))
    }

    /// Create the configured pose filter
    pub fn create_pose_filter(&self) -> Result<Box<dyn crate::filters::PoseFilter>> {
        use crate::filters::{create_filter, exponential::ExponentialFilter, moving_average::MovingAverageFilter};

        match self.markers.pose_filter.as_str() {
            "moving_average" => Ok(Box::new(MovingAverageFilter::new(self.markers.moving_average_window)?)),
            "exponential" => Ok(Box::new(ExponentialFilter::new(self.markers.exponential_alpha)?)),
            name => create_filter(name),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_cars(&self.catalog.cars)?;

        if self.active_profile()?.is_some_and(|p| p.fx <= 0.0 || p.fy <= 0.0) {
            return Err(Error::ConfigError("Focal lengths must be positive".to_string()));
        }
        let threshold = self.accept_threshold()?;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::ConfigError(
                "Accept threshold must be finite and positive".to_string(),
            ));
        }

        if !self.markers.marker_size_meters.is_finite() || self.markers.marker_size_meters <= 0.0 {
            return Err(Error::ConfigError("Marker size must be positive".to_string()));
        }
        if self.markers.moving_average_window == 0 {
            return Err(Error::ConfigError(
                "Moving average window size must be greater than 0".to_string(),
            ));
        }
        if self.markers.exponential_alpha <= EXPONENTIAL_ALPHA_MIN
            || self.markers.exponential_alpha > EXPONENTIAL_ALPHA_MAX
        {
            return Err(Error::ConfigError(
                "Exponential alpha must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.registration.sample_count == 0 {
            return Err(Error::ConfigError(
                "Registration sample count must be greater than 0".to_string(),
            ));
        }
        if self.registration.max_id_length == 0 {
            return Err(Error::ConfigError("Max id length must be greater than 0".to_string()));
        }

        if self.voice.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "Voice queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.voice.max_consecutive_errors == 0 {
            return Err(Error::ConfigError(
                "Voice max consecutive errors must be greater than 0".to_string(),
            ));
        }
        if self.voice.energy_threshold.is_nan() || self.voice.energy_threshold <= 0.0 {
            return Err(Error::ConfigError(
                "Voice energy threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# AR Showroom Configuration

camera:
  device: 0
  # "estimated" derives fx = fy = width and the principal point from the frame
  profile: "estimated"
  profiles:
    droidcam:
      fx: 1060.0
      fy: 1060.0
      cx: 640.0
      cy: 360.0
      distortion: [0.0, 0.0, 0.0, 0.0, 0.0]
      accept_threshold: 60.0

auth:
  accept_threshold: 50.0

markers:
  menu_marker_id: 23
  model_marker_id: 24
  marker_size_meters: 0.05
  pose_filter: "none"
  exponential_alpha: 0.5
  moving_average_window: 5

catalog:
  asset_root: "assets/3d_models"
  cars:
    - key: "ferrari"
      name: "Ferrari F40"
      asset_path: "ferrari-f40/f40.obj"
      description: "Superdeportivo clásico italiano"
      scale: 0.05
      elevation: 0.01
      keywords: ["ferrari", "ferari", "ferrary", "f40", "f cuarenta"]
    - key: "porsche"
      name: "Porsche 911"
      asset_path: "porsche-911/911.glb"
      description: "Deportivo alemán icónico"
      scale: 0.03
      elevation: 0.015
      keywords: ["porsche", "porche", "porshe", "novecientos once", "911", "nueve uno uno"]

registration:
  sample_count: 50
  max_id_length: 32

voice:
  enabled_on_start: false
  queue_capacity: 8
  listen_timeout_ms: 1000
  phrase_time_limit_ms: 4000
  max_consecutive_errors: 5
  service_backoff_ms: 5000
  error_backoff_ms: 3000
  retry_pause_ms: 500
  join_timeout_ms: 2000
  # Speech gate and transcription service (built with `--features voice`)
  energy_threshold: 300.0
  pause_ms: 800
  transcriber_url: "http://127.0.0.1:8080/inference"
  language: "es"
  transcribe_timeout_ms: 8000
  menu_keywords: ["menu", "menú", "volver", "atrás", "back"]
  logout_keywords: ["salir", "logout", "cerrar sesión", "quit"]

storage:
  id_map_path: "data/user_ids.json"
  models_dir: "data/models"
  samples_dir: "data/faces"
  face_cascade: "assets/haarcascade_frontalface_default.xml"

display:
  window_name: "AR Showroom"
  poll_delay_ms: 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.accept_threshold().unwrap(), 50.0);
        assert_eq!(config.catalog().unwrap().len(), 2);
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.markers.menu_marker_id, 23);
        assert_eq!(config.catalog.cars[1].keywords.len(), 6);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("auth:\n  accept_threshold: 42.0\n").unwrap();
        assert_eq!(config.auth.accept_threshold, 42.0);
        assert_eq!(config.registration.sample_count, 50);
        assert_eq!(config.voice.join_timeout(), Duration::from_secs(2));
        assert_eq!(config.voice.language, "es");
        assert_eq!(config.voice.pause(), Duration::from_millis(800));
    }

    #[test]
    fn test_profile_overrides_threshold() {
        let mut config = Config::default();
        config.camera.profile = "droidcam".to_string();
        assert_eq!(config.accept_threshold().unwrap(), 60.0);
        let (intrinsics, _) = config.intrinsics_for(640, 480).unwrap();
        assert_eq!(intrinsics.fx, 1060.0);
    }

    #[test]
    fn test_estimated_intrinsics() {
        let config = Config::default();
        let (intrinsics, distortion) = config.intrinsics_for(640, 480).unwrap();
        assert_eq!(intrinsics.fx, 640.0);
        assert_eq!(intrinsics.fy, 640.0);
        assert_eq!(intrinsics.cx, 320.0);
        assert_eq!(intrinsics.cy, 240.0);
        assert!(distortion.is_zero());
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let mut config = Config::default();
        config.camera.profile = "nope".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.auth.accept_threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.voice.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.voice.energy_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.catalog.cars[0].scale = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.markers.pose_filter = "exponential".to_string();
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.markers.pose_filter, "exponential");
        assert!(loaded.create_pose_filter().is_ok());
    }
}
