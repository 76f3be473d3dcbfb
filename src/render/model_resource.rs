//! Lifecycle of the one car currently shown on the marker.
//!
//! ```text
//! Unloaded -> Loading -> Ready <-> Rendering -> Ready
//!                                  Rendering -> Reloading -> Ready   (safe-material rebuild)
//! any -> Unloaded                                                     (cleanup)
//! ```

use super::{
    lighting_rig, normalization_transform, AssetLoader, Material, Mesh, NodeHandle, RenderBackend,
    RendererHandle, SceneDescription, SceneHandle,
};
use crate::catalog::CarDefinition;
use crate::pose_estimation::{CameraIntrinsics, MarkerObservation};
use crate::{Error, Frame, Result};
use image::RgbaImage;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unloaded,
    Loading,
    Ready,
    Rendering,
    Reloading,
}

/// Outcome of a render call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// Nothing loaded; the frame is untouched
    Skipped,
    /// The car was drawn over the frame
    Composited { visible_pixels: usize },
    /// The pass succeeded but drew nothing (off-screen or fully clipped)
    NoVisiblePixels,
}

/// Owns the loaded meshes and every renderer/scene/node handle for one car
pub struct ModelResource {
    loader: Box<dyn AssetLoader>,
    backend: Box<dyn RenderBackend>,
    asset_root: PathBuf,
    state: ResourceState,
    definition: Option<CarDefinition>,
    meshes: Vec<Mesh>,
    has_materials: bool,
    renderer: Option<RendererHandle>,
    scene: Option<SceneHandle>,
    nodes: Vec<NodeHandle>,
    camera: Option<NodeHandle>,
    fallback_rebuilds: usize,
}

impl ModelResource {
    pub fn new(loader: Box<dyn AssetLoader>, backend: Box<dyn RenderBackend>, asset_root: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            backend,
            asset_root: asset_root.into(),
            state: ResourceState::Unloaded,
            definition: None,
            meshes: Vec::new(),
            has_materials: false,
            renderer: None,
            scene: None,
            nodes: Vec::new(),
            camera: None,
            fallback_rebuilds: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ResourceState {
        self.state
    }

    /// True only after the scene was set up successfully
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ResourceState::Ready)
    }

    /// Anything (definition or handle) is held
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.definition.is_some() || self.renderer.is_some() || self.scene.is_some()
    }

    #[must_use]
    pub fn definition(&self) -> Option<&CarDefinition> {
        self.definition.as_ref()
    }

    /// Safe-material rebuilds performed since creation
    #[must_use]
    pub const fn fallback_rebuilds(&self) -> usize {
        self.fallback_rebuilds
    }

    /// Whether the loaded asset brought its own materials
    #[must_use]
    pub const fn has_materials(&self) -> bool {
        self.has_materials
    }

    fn resolve(&self, definition: &CarDefinition) -> PathBuf {
        self.asset_root.join(&definition.asset_path)
    }

    /// Load and prepare `definition` for a frame of `width` x `height`,
    /// replacing whatever was loaded before.
    ///
    /// # Errors
    ///
    /// Returns `AssetNotFound` if the path does not resolve, or the loader's or
    /// backend's error. On error nothing stays loaded.
    pub fn load(&mut self, definition: &CarDefinition, width: u32, height: u32) -> Result<()> {
        self.cleanup();
        self.state = ResourceState::Loading;
        info!("Loading model {} ({})", definition.name, definition.asset_path.display());

        match self.prepare(definition, width, height) {
            Ok(()) => {
                self.definition = Some(definition.clone());
                self.state = ResourceState::Ready;
                info!(
                    "Model {} ready: {} mesh(es), {}",
                    definition.name,
                    self.meshes.len(),
                    if self.has_materials { "own materials" } else { "forced material" }
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load model {}: {}", definition.name, e);
                self.cleanup();
                Err(e)
            }
        }
    }

    fn prepare(&mut self, definition: &CarDefinition, width: u32, height: u32) -> Result<()> {
        let path = self.resolve(definition);
        if !path.exists() {
            return Err(Error::AssetNotFound(path.display().to_string()));
        }
        let asset = self.loader.load(&path)?;
        let centroid = asset
            .centroid()
            .ok_or_else(|| Error::AssetLoad(format!("{} has no geometry", path.display())))?;
        let transform = normalization_transform(&centroid, definition.scale, definition.elevation);

        self.has_materials = asset.has_materials();
        self.meshes = asset
            .meshes
            .iter()
            .map(|mesh| {
                let mut normalized = mesh.transformed(&transform);
                if !self.has_materials {
                    normalized.material = Some(Material::forced_solid());
                }
                normalized
            })
            .collect();
        debug!(
            "Normalized {} (scene: {}) around centroid {:?}",
            path.display(),
            asset.is_scene,
            centroid.coords.as_slice()
        );

        self.renderer = Some(self.backend.create_renderer(width, height)?);
        self.build_scene()
    }

    fn build_scene(&mut self) -> Result<()> {
        let description = SceneDescription {
            meshes: self.meshes.clone(),
            lights: lighting_rig(self.has_materials),
        };
        let (scene, nodes) = self.backend.build_scene(&description)?;
        self.scene = Some(scene);
        self.nodes = nodes;
        self.camera = None;
        Ok(())
    }

    /// Draw the car at the marker pose and composite it over `frame`.
    ///
    /// A failed pass triggers exactly one rebuild with safe materials and one
    /// retry.
    ///
    /// # Errors
    ///
    /// Returns the retry's error (or the rebuild's) when recovery fails; the
    /// caller is expected to [`cleanup`](Self::cleanup).
    pub fn render(
        &mut self,
        frame: &mut Frame,
        pose: &MarkerObservation,
        intrinsics: &CameraIntrinsics,
    ) -> Result<RenderStatus> {
        if !self.is_ready() {
            return Ok(RenderStatus::Skipped);
        }

        self.state = ResourceState::Rendering;
        let color = match self.render_pass(pose, intrinsics) {
            Ok(color) => color,
            Err(e) => {
                warn!("Render failed ({}); rebuilding scene with safe materials", e);
                self.state = ResourceState::Reloading;
                self.fallback_rebuilds += 1;
                self.rebuild_with_safe_materials()?;
                self.state = ResourceState::Rendering;
                self.render_pass(pose, intrinsics)?
            }
        };
        self.state = ResourceState::Ready;

        let visible_pixels = composite(frame, &color);
        if visible_pixels == 0 {
            Ok(RenderStatus::NoVisiblePixels)
        } else {
            Ok(RenderStatus::Composited { visible_pixels })
        }
    }

    fn render_pass(&mut self, pose: &MarkerObservation, intrinsics: &CameraIntrinsics) -> Result<RgbaImage> {
        let (Some(renderer), Some(scene)) = (self.renderer, self.scene) else {
            return Err(Error::Render("Render handles missing".to_string()));
        };
        if self.camera.is_none() {
            self.camera = Some(self.backend.add_camera(scene, intrinsics)?);
        }
        let gl_pose = pose.gl_pose();
        for node in &self.nodes {
            self.backend.set_node_pose(scene, *node, &gl_pose)?;
        }
        self.backend.render(renderer, scene)
    }

    fn rebuild_with_safe_materials(&mut self) -> Result<()> {
        if let Some(scene) = self.scene.take() {
            self.backend.release_scene(scene);
        }
        self.nodes.clear();
        self.camera = None;
        for mesh in &mut self.meshes {
            mesh.material = Some(Material::safe_fallback());
        }
        self.build_scene()
    }

    /// Release every handle and forget the car. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if let Some(scene) = self.scene.take() {
            self.backend.release_scene(scene);
        }
        if let Some(renderer) = self.renderer.take() {
            self.backend.release_renderer(renderer);
        }
        if let Some(definition) = self.definition.take() {
            info!("Released model {}", definition.name);
        }
        self.nodes.clear();
        self.camera = None;
        self.meshes.clear();
        self.has_materials = false;
        self.state = ResourceState::Unloaded;
    }

    #[must_use]
    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }
}

impl Drop for ModelResource {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Copy every pixel with non-zero alpha onto the frame; returns how many
fn composite(frame: &mut Frame, color: &RgbaImage) -> usize {
    let width = frame.width().min(color.width());
    let height = frame.height().min(color.height());
    let mut visible = 0;
    for y in 0..height {
        for x in 0..width {
            let pixel = color.get_pixel(x, y);
            if pixel[3] > 0 {
                frame.put_pixel(x, y, image::Rgb([pixel[0], pixel[1], pixel[2]]));
                visible += 1;
            }
        }
    }
    visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mesh_loader::MeshFileLoader;
    use crate::render::software::SoftwareRenderer;
    use crate::render::LoadedAsset;
    use image::{Rgb, Rgba};
    use nalgebra::{Point2, Point3, Rotation3, Vector3};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        render_attempts: usize,
        builds: usize,
        released_scenes: usize,
        released_renderers: usize,
        cameras: usize,
        last_materials: Vec<Option<Material>>,
    }

    /// Backend whose first `failures` render passes fail
    struct ScriptedBackend {
        calls: Rc<RefCell<Calls>>,
        failures: usize,
        draw: bool,
    }

    impl RenderBackend for ScriptedBackend {
        fn create_renderer(&mut self, _w: u32, _h: u32) -> Result<RendererHandle> {
            Ok(RendererHandle(1))
        }

        fn build_scene(&mut self, scene: &SceneDescription) -> Result<(SceneHandle, Vec<NodeHandle>)> {
            let mut calls = self.calls.borrow_mut();
            calls.builds += 1;
            calls.last_materials = scene.meshes.iter().map(|m| m.material).collect();
            let nodes = (0..scene.meshes.len() as u64).map(NodeHandle).collect();
            Ok((SceneHandle(calls.builds as u64), nodes))
        }

        fn add_camera(&mut self, _scene: SceneHandle, _k: &CameraIntrinsics) -> Result<NodeHandle> {
            self.calls.borrow_mut().cameras += 1;
            Ok(NodeHandle(99))
        }

        fn set_node_pose(&mut self, _s: SceneHandle, _n: NodeHandle, _p: &nalgebra::Matrix4<f64>) -> Result<()> {
            Ok(())
        }

        fn render(&mut self, _r: RendererHandle, _s: SceneHandle) -> Result<RgbaImage> {
            let mut calls = self.calls.borrow_mut();
            calls.render_attempts += 1;
            if calls.render_attempts <= self.failures {
                return Err(Error::Render("texture format unsupported".to_string()));
            }
            let mut image = RgbaImage::new(4, 4);
            if self.draw {
                image.put_pixel(1, 1, Rgba([10, 20, 30, 255]));
                image.put_pixel(2, 1, Rgba([10, 20, 30, 255]));
            }
            Ok(image)
        }

        fn release_scene(&mut self, _scene: SceneHandle) {
            self.calls.borrow_mut().released_scenes += 1;
        }

        fn release_renderer(&mut self, _renderer: RendererHandle) {
            self.calls.borrow_mut().released_renderers += 1;
        }
    }

    struct TexturedLoader;

    impl AssetLoader for TexturedLoader {
        fn load(&mut self, _path: &Path) -> Result<LoadedAsset> {
            let material = Material {
                textured: true,
                ..Material::safe_fallback()
            };
            Ok(LoadedAsset {
                meshes: vec![Mesh {
                    name: "body".to_string(),
                    positions: vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0)],
                    triangles: vec![[0, 1, 2]],
                    material: Some(material),
                }],
                is_scene: true,
            })
        }
    }

    fn asset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("car")).unwrap();
        std::fs::write(dir.path().join("car/model.glb"), b"glTF").unwrap();
        dir
    }

    fn definition() -> CarDefinition {
        CarDefinition {
            key: "car".to_string(),
            name: "Car".to_string(),
            asset_path: PathBuf::from("car/model.glb"),
            description: String::new(),
            scale: 0.05,
            elevation: 0.01,
            keywords: Vec::new(),
        }
    }

    fn observation() -> MarkerObservation {
        MarkerObservation {
            marker_id: 23,
            corners: [Point2::origin(); 4],
            rotation: Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
            translation: Vector3::new(0.0, 0.0, 0.5),
        }
    }

    fn scripted(root: &Path, failures: usize, draw: bool) -> (ModelResource, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let backend = ScriptedBackend {
            calls: Rc::clone(&calls),
            failures,
            draw,
        };
        (ModelResource::new(Box::new(TexturedLoader), Box::new(backend), root), calls)
    }

    #[test]
    fn test_render_before_load_is_noop() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 0, true);
        let mut frame = Frame::from_pixel(4, 4, Rgb([7, 7, 7]));
        let before = frame.clone();
        let status = resource
            .render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4))
            .unwrap();
        assert_eq!(status, RenderStatus::Skipped);
        assert_eq!(frame, before);
        assert_eq!(calls.borrow().render_attempts, 0);
    }

    #[test]
    fn test_one_failure_triggers_exactly_one_rebuild() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 1, true);
        resource.load(&definition(), 4, 4).unwrap();
        assert!(resource.is_ready());
        assert!(resource.has_materials());

        let mut frame = Frame::from_pixel(4, 4, Rgb([0, 0, 0]));
        let status = resource
            .render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4))
            .unwrap();
        assert_eq!(status, RenderStatus::Composited { visible_pixels: 2 });
        assert_eq!(*frame.get_pixel(1, 1), Rgb([10, 20, 30]));
        assert_eq!(resource.fallback_rebuilds(), 1);
        assert!(resource.is_ready());

        let calls = calls.borrow();
        assert_eq!(calls.builds, 2);
        assert_eq!(calls.render_attempts, 2);
        assert_eq!(calls.released_scenes, 1);
        assert_eq!(calls.last_materials, vec![Some(Material::safe_fallback())]);
    }

    #[test]
    fn test_two_failures_propagate_without_looping() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 5, true);
        resource.load(&definition(), 4, 4).unwrap();
        let mut frame = Frame::new(4, 4);
        let result = resource.render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4));
        assert!(matches!(result, Err(Error::Render(_))));
        assert_eq!(resource.fallback_rebuilds(), 1);
        assert_eq!(calls.borrow().render_attempts, 2);
    }

    #[test]
    fn test_camera_is_memoized() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 0, true);
        resource.load(&definition(), 4, 4).unwrap();
        let mut frame = Frame::new(4, 4);
        for _ in 0..3 {
            resource
                .render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4))
                .unwrap();
        }
        assert_eq!(calls.borrow().cameras, 1);
    }

    #[test]
    fn test_blank_render_is_soft_warning() {
        let dir = asset_dir();
        let (mut resource, _calls) = scripted(dir.path(), 0, false);
        resource.load(&definition(), 4, 4).unwrap();
        let mut frame = Frame::new(4, 4);
        let status = resource
            .render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4))
            .unwrap();
        assert_eq!(status, RenderStatus::NoVisiblePixels);
        assert!(resource.is_ready());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 0, true);
        resource.load(&definition(), 4, 4).unwrap();
        resource.cleanup();
        resource.cleanup();
        assert!(!resource.is_loaded());
        assert_eq!(resource.state(), ResourceState::Unloaded);
        assert_eq!(calls.borrow().released_scenes, 1);
        assert_eq!(calls.borrow().released_renderers, 1);

        let mut frame = Frame::new(4, 4);
        let status = resource
            .render(&mut frame, &observation(), &CameraIntrinsics::estimated(4, 4))
            .unwrap();
        assert_eq!(status, RenderStatus::Skipped);
    }

    #[test]
    fn test_missing_asset_leaves_nothing_loaded() {
        let dir = asset_dir();
        let (mut resource, calls) = scripted(dir.path(), 0, true);
        let mut missing = definition();
        missing.asset_path = PathBuf::from("car/nope.obj");
        assert!(matches!(resource.load(&missing, 4, 4), Err(Error::AssetNotFound(_))));
        assert!(!resource.is_loaded());
        assert_eq!(calls.borrow().builds, 0);
    }

    #[test]
    fn test_asset_without_materials_gets_forced_material() {
        let dir = asset_dir();
        std::fs::write(dir.path().join("car/model.obj"), "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        let mut plain = definition();
        plain.asset_path = PathBuf::from("car/model.obj");

        let mut resource = ModelResource::new(
            Box::new(MeshFileLoader::new()),
            Box::new(SoftwareRenderer::new()),
            dir.path(),
        );
        resource.load(&plain, 64, 48).unwrap();
        assert!(!resource.has_materials());
        assert!(resource.meshes.iter().all(|m| m.material == Some(Material::forced_solid())));
    }

    #[test]
    fn test_textured_asset_renders_after_safe_rebuild() {
        let dir = asset_dir();
        let mut resource = ModelResource::new(Box::new(TexturedLoader), Box::new(SoftwareRenderer::new()), dir.path());
        resource.load(&definition(), 64, 48).unwrap();

        let mut frame = Frame::new(64, 48);
        let status = resource.render(&mut frame, &observation(), &CameraIntrinsics::estimated(64, 48));
        assert!(status.is_ok());
        assert_eq!(resource.fallback_rebuilds(), 1);
        assert!(resource.meshes.iter().all(|m| m.material == Some(Material::safe_fallback())));
        assert!(resource.is_ready());
    }
}
