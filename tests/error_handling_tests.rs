//! Error handling tests across modules

mod test_helpers;

use ar_showroom::config::Config;
use ar_showroom::error::Error;
use ar_showroom::filters::create_filter;
use ar_showroom::pose_estimation::{CameraModel, MarkerDetector, PoseEstimator};
use ar_showroom::render::model_resource::ModelResource;
use ar_showroom::render::software::SoftwareRenderer;
use ar_showroom::session::{InputEvent, Key, SessionController, SessionSettings, SessionState};
use ar_showroom::voice::VoiceIntent;
use ar_showroom::utils::safe_cast::{i32_to_u32, u32_to_i32};
use ar_showroom::{catalog::default_cars, catalog::Catalog, menu::MenuModel, Frame, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use test_helpers::{asset_dir, frame, BoxAssetLoader, MemoryState, MemoryStore, ScriptedFaces};

#[test]
fn test_config_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = Config::from_file(dir.path().join("missing.yaml"));
    assert!(matches!(missing, Err(Error::IoError(_))));

    let broken = dir.path().join("broken.yaml");
    std::fs::write(&broken, "camera: [not, a, map").unwrap();
    assert!(matches!(Config::from_file(&broken), Err(Error::ConfigError(_))));

    let mut config = Config::default();
    config.camera.profile = "nonexistent".to_string();
    assert!(matches!(config.validate(), Err(Error::ConfigError(msg)) if msg.contains("nonexistent")));

    let mut config = Config::default();
    config.auth.accept_threshold = f64::NAN;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.markers.marker_size_meters = 0.0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.voice.queue_capacity = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("showroom.yaml");

    let mut config = Config::default();
    config.camera.profile = "droidcam".to_string();
    config.registration.sample_count = 12;
    config.to_file(&path).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.registration.sample_count, 12);
    assert_eq!(loaded.accept_threshold().unwrap(), 60.0);
    assert!(matches!(loaded.camera_model().unwrap(), CameraModel::Calibrated(..)));
}

#[test]
fn test_filter_creation_errors() {
    assert!(matches!(create_filter("invalid_filter"), Err(Error::FilterError(_))));
    assert!(matches!(create_filter("moving_average:0"), Err(Error::FilterError(_))));
    assert!(matches!(create_filter("exponential:2.0"), Err(Error::FilterError(_))));
    assert!(create_filter("exponential:0.3").is_ok());

    let mut config = Config::default();
    config.markers.pose_filter = "kalman".to_string();
    assert!(config.create_pose_filter().is_err());
}

#[test]
fn test_catalog_errors() {
    let mut cars = default_cars();
    cars[1].key = cars[0].key.clone();
    assert!(matches!(Catalog::new("assets", cars), Err(Error::ConfigError(msg)) if msg.contains("Duplicate")));

    let mut cars = default_cars();
    cars[0].scale = -1.0;
    assert!(Catalog::new("assets", cars).is_err());
}

#[test]
fn test_safe_cast_errors() {
    assert!(u32_to_i32(u32::MAX).is_err());
    assert!(i32_to_u32(-1).is_err());
    assert_eq!(i32_to_u32(7).unwrap(), 7);
}

#[test]
fn test_only_camera_errors_are_fatal() {
    assert!(Error::Camera("gone".to_string()).is_fatal());
    assert!(!Error::Render("texture".to_string()).is_fatal());
    assert!(!Error::AssetNotFound("car.obj".to_string()).is_fatal());
}

#[test]
fn test_invalid_marker_size() {
    struct Never;
    impl MarkerDetector for Never {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<ar_showroom::pose_estimation::DetectedMarker>> {
            Ok(Vec::new())
        }
    }
    assert!(PoseEstimator::new(Box::new(Never), CameraModel::Estimated, -0.05).is_err());
    assert!(PoseEstimator::new(Box::new(Never), CameraModel::Estimated, f64::INFINITY).is_err());
}

/// Marker detector that always fails
struct BrokenMarkers;

impl MarkerDetector for BrokenMarkers {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<ar_showroom::pose_estimation::DetectedMarker>> {
        Err(Error::MarkerDetection("dictionary missing".to_string()))
    }
}

#[test]
fn test_perception_failures_do_not_end_session() {
    let assets = asset_dir();
    let catalog = Catalog::new(assets.path(), default_cars()).unwrap();
    let model = ModelResource::new(
        Box::new(BoxAssetLoader),
        Box::new(SoftwareRenderer::new()),
        catalog.asset_root(),
    );
    let pose = PoseEstimator::new(Box::new(BrokenMarkers), CameraModel::Estimated, 0.05).unwrap();
    let faces = Rc::new(RefCell::new(vec![test_helpers::centered_face()]));
    let mut state = MemoryState::default();
    let ana = state.id_map.assign("ana").unwrap();
    state.scores.insert(ana.numeric_id, 5.0);
    let mut session = SessionController::new(
        SessionSettings::default(),
        pose,
        Box::new(ScriptedFaces(faces)),
        Box::new(MemoryStore(Rc::new(RefCell::new(state)))),
        MenuModel::new(catalog),
        model,
    )
    .unwrap();

    let mut idle: VecDeque<VoiceIntent> = VecDeque::new();
    let press = |k| Some(InputEvent::Key(k));
    session.step(frame(), press(Key::Letter('l')), &mut idle);
    let out = session.step(frame(), press(Key::Enter), &mut idle);
    assert_eq!(out.state, SessionState::MainMenu);

    let input = frame();
    let out = session.step(input.clone(), press(Key::Digit(1)), &mut idle);
    assert_eq!(out.state, SessionState::MainMenu);
    assert!(!out.has_menu_overlay());
    assert_eq!(out.frame, input);
}

#[test]
fn test_invalid_threshold_rejected_at_construction() {
    let assets = asset_dir();
    let catalog = Catalog::new(assets.path(), default_cars()).unwrap();
    let model = ModelResource::new(
        Box::new(BoxAssetLoader),
        Box::new(SoftwareRenderer::new()),
        catalog.asset_root(),
    );
    let pose = PoseEstimator::new(Box::new(BrokenMarkers), CameraModel::Estimated, 0.05).unwrap();
    let settings = SessionSettings {
        accept_threshold: -1.0,
        ..SessionSettings::default()
    };
    let result = SessionController::new(
        settings,
        pose,
        Box::new(ScriptedFaces(Rc::new(RefCell::new(Vec::new())))),
        Box::new(MemoryStore(Rc::new(RefCell::new(MemoryState::default())))),
        MenuModel::new(catalog),
        model,
    );
    assert!(result.is_err());
}
