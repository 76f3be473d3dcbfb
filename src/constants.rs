//! Constants used throughout the application

/// Marker id that anchors the menu and the displayed car
pub const MENU_MARKER_ID: i32 = 23;

/// Marker id reserved for model viewing; nothing branches on it
pub const MODEL_MARKER_ID: i32 = 24;

/// Printed marker side length in meters
pub const MARKER_SIZE_METERS: f64 = 0.05;

/// Default LBPH acceptance threshold (lower confidence is better)
pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 50.0;

/// Face samples captured before training
pub const DEFAULT_REGISTRATION_SAMPLES: usize = 50;

/// Longest accepted user id
pub const MAX_USER_ID_LENGTH: usize = 32;

/// Side length of the square grayscale face crop fed to predictors
pub const FACE_CROP_SIZE: u32 = 200;

/// Camera matrix center factor
pub const CAMERA_CENTER_FACTOR: f64 = 2.0;

/// Menu ordinal reserved for "back to login"
pub const BACK_ORDINAL: usize = 0;

/// Maximum mean reprojection error (pixels) for an accepted marker pose
pub const MAX_REPROJECTION_ERROR_PX: f64 = 4.0;

/// Iterations used when undistorting marker corners
pub const UNDISTORT_ITERATIONS: usize = 8;

/// Voice channel defaults (milliseconds unless stated)
pub const DEFAULT_VOICE_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_LISTEN_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_PHRASE_LIMIT_MS: u64 = 4_000;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
pub const DEFAULT_SERVICE_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 3_000;
pub const DEFAULT_RETRY_PAUSE_MS: u64 = 500;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2_000;

/// RMS level (16-bit scale) separating speech from room noise
pub const DEFAULT_ENERGY_THRESHOLD: f64 = 300.0;

/// Trailing silence that ends a phrase
pub const DEFAULT_PAUSE_MS: u64 = 800;

/// Speech-to-text endpoint (a local whisper.cpp server by default)
pub const DEFAULT_TRANSCRIBER_URL: &str = "http://127.0.0.1:8080/inference";
pub const DEFAULT_SPEECH_LANGUAGE: &str = "es";
pub const DEFAULT_TRANSCRIBE_TIMEOUT_MS: u64 = 8_000;

/// Granularity of interruptible sleeps in the voice worker
pub const STOP_POLL_INTERVAL_MS: u64 = 50;

/// Default pose filter parameters
pub const DEFAULT_MOVING_AVERAGE_WINDOW: usize = 5;
pub const DEFAULT_EXPONENTIAL_ALPHA: f64 = 0.5;

/// Exponential filter bounds
pub const EXPONENTIAL_ALPHA_MIN: f64 = 0.0;
pub const EXPONENTIAL_ALPHA_MAX: f64 = 1.0;

/// Numeric precision epsilon
pub const EPSILON: f64 = 1e-10;
