//! Marker-anchored AR car showroom.
//!
//! A live camera feed is gated behind a face login; once logged in, showing
//! ArUco marker 23 opens a menu of cars and the selected car is rendered on
//! the marker. Keyboard, marker visibility and an optional background voice
//! listener drive one session state machine.
//!
//! The pipeline per frame:
//! 1. Marker detection and a planar pose solve per marker
//! 2. Face detection and LBPH-style matching while logging in
//! 3. One state transition from a key or a voice intent
//! 4. Off-screen rendering of the selected car composited onto the frame
//!
//! Every external capability (camera, window, detectors, renderer, speech) is
//! a trait; the `opencv` feature provides the camera, window and detector
//! implementations, the `voice` feature provides the microphone and
//! transcription client, and [`render::software`] provides a CPU renderer.
//!
//! # Examples
//!
//! ## Menu selection
//!
//! ```
//! use ar_showroom::config::Config;
//! use ar_showroom::menu::{MenuChoice, MenuModel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let mut menu = MenuModel::new(config.catalog()?);
//!
//! // Ordinal 2 is the second car, 0 is the back entry
//! menu.select(2);
//! match menu.confirm() {
//!     Some(MenuChoice::Car(car)) => println!("Selected {}", car.name),
//!     Some(MenuChoice::Back) => println!("Back to login"),
//!     None => println!("Empty catalog"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Voice keywords
//!
//! ```
//! use ar_showroom::config::Config;
//! use ar_showroom::voice::{KeywordMatcher, NavAction, VoiceIntent};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let matcher = KeywordMatcher::from_catalog(&config.catalog()?, &config.voice);
//!
//! assert_eq!(
//!     matcher.match_text("muéstrame el ferrari"),
//!     Some(VoiceIntent::CarSelect("ferrari".to_string()))
//! );
//! assert_eq!(
//!     matcher.match_text("cerrar sesión"),
//!     Some(VoiceIntent::Navigate(NavAction::Logout))
//! );
//! # Ok(())
//! # }
//! ```

/// Camera frame: 8-bit RGB
pub type Frame = image::RgbImage;

/// Face detection seam and LBPH-style identity matching
pub mod auth;

/// Selectable car definitions
pub mod catalog;

/// Marker pose estimation behind a pluggable PnP solver
pub mod pose_estimation;

/// Pose smoothing filters
pub mod filters;

/// Menu selection model
pub mod menu;

/// Identity map and trained model storage
pub mod persistence;

/// User id validation and face sample collection
pub mod registration;

/// Scene description, render backends and the model resource lifecycle
pub mod render;

/// Session state machine
pub mod session;

/// Background voice command listener
pub mod voice;

/// Microphone capture and HTTP speech-to-text
#[cfg(feature = "voice")]
pub mod speech;

/// Numeric and image conversion helpers
pub mod utils;

/// Error types and result handling
pub mod error;

/// Main application module
pub mod app;

/// Constants used throughout the application
pub mod constants;

/// Configuration management
pub mod config;

/// `OpenCV` camera, window and detector backends
#[cfg(feature = "opencv")]
pub mod backend;

pub use error::{Error, Result};
