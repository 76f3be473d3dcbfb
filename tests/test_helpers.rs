//! Fakes and fixtures shared by the integration tests

#![allow(dead_code)]

use ar_showroom::auth::{FaceBox, FaceDetector, FacePredictor, Identity};
use ar_showroom::catalog::{default_cars, Catalog};
use ar_showroom::menu::MenuModel;
use ar_showroom::persistence::{IdMap, IdentityStore};
use ar_showroom::pose_estimation::{
    project_marker, CameraIntrinsics, CameraModel, DetectedMarker, Distortion, MarkerDetector, PoseEstimator,
};
use ar_showroom::render::model_resource::ModelResource;
use ar_showroom::render::software::SoftwareRenderer;
use ar_showroom::render::{
    AssetLoader, LoadedAsset, Mesh, NodeHandle, RenderBackend, RendererHandle, SceneDescription, SceneHandle,
};
use ar_showroom::session::{SessionController, SessionSettings};
use ar_showroom::{Error, Frame, Result};
use image::{GrayImage, Rgb, RgbaImage};
use nalgebra::{Matrix4, Point3, Rotation3, Vector3};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const MARKER_SIZE: f64 = 0.05;

/// Mid-gray camera frame
pub fn frame() -> Frame {
    Frame::from_pixel(WIDTH, HEIGHT, Rgb([90, 90, 90]))
}

/// Corners of a marker half a meter in front of the camera, facing it
pub fn marker(id: i32) -> DetectedMarker {
    let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI);
    let translation = Vector3::new(0.0, 0.0, 0.5);
    let intrinsics = CameraIntrinsics::estimated(WIDTH, HEIGHT);
    let corners = project_marker(&rotation, &translation, MARKER_SIZE, &intrinsics, &Distortion::default())
        .expect("marker in front of the camera projects");
    DetectedMarker { id, corners }
}

/// Reports the markers listed in a shared cell
pub struct ScriptedMarkers(pub Rc<RefCell<Vec<i32>>>);

impl MarkerDetector for ScriptedMarkers {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedMarker>> {
        Ok(self.0.borrow().iter().map(|&id| marker(id)).collect())
    }
}

/// Reports the faces listed in a shared cell
pub struct ScriptedFaces(pub Rc<RefCell<Vec<FaceBox>>>);

impl FaceDetector for ScriptedFaces {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<FaceBox>> {
        Ok(self.0.borrow().clone())
    }
}

pub fn centered_face() -> FaceBox {
    FaceBox::new(220, 140, 200, 200)
}

/// Predictor returning a fixed confidence
pub struct FixedScore(pub f64);

impl FacePredictor for FixedScore {
    fn predict(&self, _face: &GrayImage) -> Result<f64> {
        Ok(self.0)
    }
}

/// Gives every existing asset file the same car-sized box, without materials
pub struct BoxAssetLoader;

impl AssetLoader for BoxAssetLoader {
    fn load(&mut self, path: &Path) -> Result<LoadedAsset> {
        if !path.is_file() {
            return Err(Error::AssetNotFound(path.display().to_string()));
        }
        let (x, y, z) = (2.2, 0.6, 1.0);
        let positions = vec![
            Point3::new(-x, -y, -z),
            Point3::new(x, -y, -z),
            Point3::new(x, y, -z),
            Point3::new(-x, y, -z),
            Point3::new(-x, -y, z),
            Point3::new(x, -y, z),
            Point3::new(x, y, z),
            Point3::new(-x, y, z),
        ];
        let triangles = vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [3, 7, 6],
            [3, 6, 2],
            [0, 4, 7],
            [0, 7, 3],
            [1, 2, 6],
            [1, 6, 5],
        ];
        Ok(LoadedAsset {
            meshes: vec![Mesh {
                name: "body".to_string(),
                positions,
                triangles,
                material: None,
            }],
            is_scene: false,
        })
    }
}

/// What a render backend was asked to do
#[derive(Debug, Default)]
pub struct RenderCalls {
    pub renders: usize,
    pub released_scenes: usize,
    pub released_renderers: usize,
}

/// Software renderer whose render passes all fail
pub struct BrokenRenderer {
    inner: SoftwareRenderer,
    pub calls: Rc<RefCell<RenderCalls>>,
}

impl BrokenRenderer {
    pub fn new(calls: Rc<RefCell<RenderCalls>>) -> Self {
        Self {
            inner: SoftwareRenderer::new(),
            calls,
        }
    }
}

impl RenderBackend for BrokenRenderer {
    fn create_renderer(&mut self, width: u32, height: u32) -> Result<RendererHandle> {
        self.inner.create_renderer(width, height)
    }

    fn build_scene(&mut self, scene: &SceneDescription) -> Result<(SceneHandle, Vec<NodeHandle>)> {
        self.inner.build_scene(scene)
    }

    fn add_camera(&mut self, scene: SceneHandle, intrinsics: &CameraIntrinsics) -> Result<NodeHandle> {
        self.inner.add_camera(scene, intrinsics)
    }

    fn set_node_pose(&mut self, scene: SceneHandle, node: NodeHandle, pose: &Matrix4<f64>) -> Result<()> {
        self.inner.set_node_pose(scene, node, pose)
    }

    fn render(&mut self, _renderer: RendererHandle, _scene: SceneHandle) -> Result<RgbaImage> {
        self.calls.borrow_mut().renders += 1;
        Err(Error::Render("device lost".to_string()))
    }

    fn release_scene(&mut self, scene: SceneHandle) {
        self.calls.borrow_mut().released_scenes += 1;
        self.inner.release_scene(scene);
    }

    fn release_renderer(&mut self, renderer: RendererHandle) {
        self.calls.borrow_mut().released_renderers += 1;
        self.inner.release_renderer(renderer);
    }
}

/// In-memory identity storage
#[derive(Default)]
pub struct MemoryState {
    pub id_map: IdMap,
    /// Confidence each enrolled user's predictor reports
    pub scores: HashMap<i32, f64>,
    /// Confidence given to newly trained models
    pub trained_score: f64,
    pub saved_samples: usize,
    pub fail_training: bool,
}

pub struct MemoryStore(pub Rc<RefCell<MemoryState>>);

impl IdentityStore for MemoryStore {
    fn load_id_map(&self) -> Result<IdMap> {
        Ok(self.0.borrow().id_map.clone())
    }

    fn save_id_map(&self, map: &IdMap) -> Result<()> {
        self.0.borrow_mut().id_map = map.clone();
        Ok(())
    }

    fn load_model(&self, identity: &Identity) -> Result<Box<dyn FacePredictor>> {
        self.0
            .borrow()
            .scores
            .get(&identity.numeric_id)
            .map(|&score| Box::new(FixedScore(score)) as Box<dyn FacePredictor>)
            .ok_or_else(|| Error::Persistence(format!("No model for {}", identity.id)))
    }

    fn save_model(&self, identity: &Identity, samples: &[GrayImage]) -> Result<Box<dyn FacePredictor>> {
        let mut state = self.0.borrow_mut();
        if state.fail_training {
            return Err(Error::Persistence("disk full".to_string()));
        }
        state.saved_samples += samples.len();
        let score = state.trained_score;
        state.scores.insert(identity.numeric_id, score);
        Ok(Box::new(FixedScore(score)))
    }
}

/// A controller over scripted perception plus handles to steer it
pub struct Rig {
    pub session: SessionController,
    pub markers: Rc<RefCell<Vec<i32>>>,
    pub faces: Rc<RefCell<Vec<FaceBox>>>,
    pub store: Rc<RefCell<MemoryState>>,
    pub assets: tempfile::TempDir,
}

/// Perception handles and the asset directory, kept alive while a session runs elsewhere
pub struct Handles {
    pub markers: Rc<RefCell<Vec<i32>>>,
    pub faces: Rc<RefCell<Vec<FaceBox>>>,
    pub store: Rc<RefCell<MemoryState>>,
    pub assets: tempfile::TempDir,
}

impl Rig {
    pub fn split(self) -> (SessionController, Handles) {
        let Self {
            session,
            markers,
            faces,
            store,
            assets,
        } = self;
        (
            session,
            Handles {
                markers,
                faces,
                store,
                assets,
            },
        )
    }

    pub fn show_marker(&self, id: i32) {
        self.markers.borrow_mut().push(id);
    }

    pub fn hide_markers(&self) {
        self.markers.borrow_mut().clear();
    }

    pub fn show_face(&self) {
        *self.faces.borrow_mut() = vec![centered_face()];
    }

    pub fn hide_faces(&self) {
        self.faces.borrow_mut().clear();
    }
}

/// Asset directory containing the files the default catalog points at
pub fn asset_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for car in default_cars() {
        let path = dir.path().join(&car.asset_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("asset dir");
        }
        std::fs::write(&path, b"mesh").expect("asset file");
    }
    dir
}

/// Controller with one enrolled user `ana` whose face scores `score`
pub fn rig_with_user(score: f64, settings: SessionSettings) -> Rig {
    let mut id_map = IdMap::new();
    let ana = id_map.assign("ana").expect("assign");
    let mut state = MemoryState {
        id_map,
        trained_score: 20.0,
        ..MemoryState::default()
    };
    state.scores.insert(ana.numeric_id, score);
    rig(state, settings)
}

pub fn rig(state: MemoryState, settings: SessionSettings) -> Rig {
    rig_with_backend(state, settings, Box::new(SoftwareRenderer::new()))
}

pub fn rig_with_backend(state: MemoryState, settings: SessionSettings, backend: Box<dyn RenderBackend>) -> Rig {
    let assets = asset_dir();
    let markers = Rc::new(RefCell::new(Vec::new()));
    let faces = Rc::new(RefCell::new(Vec::new()));
    let store = Rc::new(RefCell::new(state));

    let pose = PoseEstimator::new(
        Box::new(ScriptedMarkers(Rc::clone(&markers))),
        CameraModel::Estimated,
        MARKER_SIZE,
    )
    .expect("pose estimator");
    let catalog = Catalog::new(assets.path(), default_cars()).expect("catalog");
    let model = ModelResource::new(Box::new(BoxAssetLoader), backend, catalog.asset_root());
    let session = SessionController::new(
        settings,
        pose,
        Box::new(ScriptedFaces(Rc::clone(&faces))),
        Box::new(MemoryStore(Rc::clone(&store))),
        MenuModel::new(catalog),
        model,
    )
    .expect("session controller");

    Rig {
        session,
        markers,
        faces,
        store,
        assets,
    }
}
