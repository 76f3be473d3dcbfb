//! Scene description types and the collaborator traits for asset loading and
//! off-screen rendering.
//!
//! The session never talks to a renderer directly; it goes through
//! [`model_resource::ModelResource`], which owns every handle issued by a
//! [`RenderBackend`].

/// Load/render/cleanup lifecycle of the selected car
pub mod model_resource;

/// OBJ and glTF asset loading
pub mod mesh_loader;

/// Pure-Rust rasterizer backend
pub mod software;

use crate::pose_estimation::CameraIntrinsics;
use crate::Result;
use image::RgbaImage;
use nalgebra::{Matrix4, Point3, Rotation3, Translation3, Vector3};
use std::path::Path;

/// Surface appearance of a mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: [f32; 3],
    /// Samples an image texture
    pub textured: bool,
}

impl Material {
    /// Solid metallic red given to assets that ship without materials
    #[must_use]
    pub const fn forced_solid() -> Self {
        Self {
            base_color: [1.0, 0.0, 0.0, 1.0],
            metallic: 0.8,
            roughness: 0.2,
            emissive: [0.2, 0.0, 0.0],
            textured: false,
        }
    }

    /// Untextured blue used when rebuilding a scene after a failed render
    #[must_use]
    pub const fn safe_fallback() -> Self {
        Self {
            base_color: [0.2, 0.4, 0.8, 1.0],
            metallic: 0.3,
            roughness: 0.7,
            emissive: [0.0, 0.0, 0.0],
            textured: false,
        }
    }
}

/// Triangle mesh with an optional material
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub name: String,
    pub positions: Vec<Point3<f64>>,
    pub triangles: Vec<[usize; 3]>,
    pub material: Option<Material>,
}

impl Mesh {
    #[must_use]
    pub fn transformed(&self, transform: &Matrix4<f64>) -> Self {
        Self {
            positions: self
                .positions
                .iter()
                .map(|p| transform.transform_point(p))
                .collect(),
            ..self.clone()
        }
    }
}

/// Output of the asset-loading collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedAsset {
    pub meshes: Vec<Mesh>,
    /// Loaded as a multi-node scene (glTF) rather than a single mesh
    pub is_scene: bool,
}

impl LoadedAsset {
    /// Whether any mesh carries its own material
    #[must_use]
    pub fn has_materials(&self) -> bool {
        self.meshes.iter().any(|mesh| mesh.material.is_some())
    }

    /// Mean of all vertex positions
    #[must_use]
    pub fn centroid(&self) -> Option<Point3<f64>> {
        let (sum, count) = self
            .meshes
            .iter()
            .flat_map(|mesh| mesh.positions.iter())
            .fold((Vector3::zeros(), 0usize), |(sum, count), p| (sum + p.coords, count + 1));
        (count > 0).then(|| Point3::from(sum / count as f64))
    }
}

/// Parses asset files into meshes
pub trait AssetLoader {
    fn load(&mut self, path: &Path) -> Result<LoadedAsset>;
}

/// Light type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    /// Shines along the light's local -Z
    Directional,
    Point,
}

/// A light placed in camera space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: [f32; 3],
    pub intensity: f32,
    pub pose: Matrix4<f64>,
}

impl Light {
    fn at(kind: LightKind, color: [f32; 3], intensity: f32, x: f64, y: f64, z: f64) -> Self {
        Self {
            kind,
            color,
            intensity,
            pose: Translation3::new(x, y, z).to_homogeneous(),
        }
    }
}

/// Lights for an asset: key, ambient-ish fill and point light when the asset
/// has its own materials, two strong lights otherwise
#[must_use]
pub fn lighting_rig(has_materials: bool) -> Vec<Light> {
    const WHITE: [f32; 3] = [1.0, 1.0, 1.0];
    if has_materials {
        vec![
            Light::at(LightKind::Directional, WHITE, 1.5, 0.0, 0.0, 0.0),
            Light::at(LightKind::Directional, [0.6, 0.6, 0.6], 0.8, 0.0, 0.0, -0.1),
            Light::at(LightKind::Point, WHITE, 2.0, 0.1, 0.1, 0.05),
        ]
    } else {
        vec![
            Light::at(LightKind::Directional, WHITE, 8.0, 0.0, 0.0, 0.0),
            Light::at(LightKind::Point, WHITE, 10.0, 0.0, 0.0, 0.1),
        ]
    }
}

/// Model transform placing an asset on the marker: center on the centroid,
/// scale, turn Y-up into the marker's Z-up, then lift along the normal
#[must_use]
pub fn normalization_transform(centroid: &Point3<f64>, scale: f64, elevation: f64) -> Matrix4<f64> {
    let center = Translation3::from(-centroid.coords).to_homogeneous();
    let scaling = Matrix4::new_scaling(scale);
    let stand_up = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2).to_homogeneous();
    let lift = Translation3::new(0.0, 0.0, elevation).to_homogeneous();
    lift * stand_up * scaling * center
}

/// Everything a backend needs to build a scene
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescription {
    /// Meshes in marker space, one scene node each
    pub meshes: Vec<Mesh>,
    pub lights: Vec<Light>,
}

/// Opaque renderer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendererHandle(pub u64);

/// Opaque scene handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneHandle(pub u64);

/// Opaque scene node handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

/// Off-screen renderer collaborator. Poses are in the GL camera convention.
pub trait RenderBackend {
    /// Create an off-screen target of the given size
    fn create_renderer(&mut self, width: u32, height: u32) -> Result<RendererHandle>;

    /// Build a scene; returns one node per mesh, in mesh order
    fn build_scene(&mut self, scene: &SceneDescription) -> Result<(SceneHandle, Vec<NodeHandle>)>;

    /// Add a pinhole camera at the origin
    fn add_camera(&mut self, scene: SceneHandle, intrinsics: &CameraIntrinsics) -> Result<NodeHandle>;

    fn set_node_pose(&mut self, scene: SceneHandle, node: NodeHandle, pose: &Matrix4<f64>) -> Result<()>;

    /// One render pass; transparent where nothing was drawn
    fn render(&mut self, renderer: RendererHandle, scene: SceneHandle) -> Result<RgbaImage>;

    fn release_scene(&mut self, scene: SceneHandle);

    fn release_renderer(&mut self, renderer: RendererHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_centers_scales_and_lifts() {
        let transform = normalization_transform(&Point3::new(1.0, 2.0, 3.0), 0.5, 0.01);
        let center = transform.transform_point(&Point3::new(1.0, 2.0, 3.0));
        assert!((center - Point3::new(0.0, 0.0, 0.01)).norm() < 1e-12);

        // Model up (+Y) becomes marker normal (+Z).
        let top = transform.transform_point(&Point3::new(1.0, 4.0, 3.0));
        assert!((top - Point3::new(0.0, 0.0, 1.01)).norm() < 1e-12);
    }

    #[test]
    fn test_lighting_rig_depends_on_materials() {
        let textured = lighting_rig(true);
        assert_eq!(textured.len(), 3);
        assert_eq!(textured[0].intensity, 1.5);
        assert_eq!(textured[2].kind, LightKind::Point);

        let bare = lighting_rig(false);
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[0].intensity, 8.0);
        assert_eq!(bare[1].pose[(2, 3)], 0.1);
    }

    #[test]
    fn test_centroid_and_materials() {
        let asset = LoadedAsset {
            meshes: vec![Mesh {
                name: "body".to_string(),
                positions: vec![Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 4.0, 6.0)],
                triangles: Vec::new(),
                material: None,
            }],
            is_scene: false,
        };
        assert_eq!(asset.centroid(), Some(Point3::new(1.0, 2.0, 3.0)));
        assert!(!asset.has_materials());
        let empty = LoadedAsset {
            meshes: Vec::new(),
            is_scene: true,
        };
        assert!(empty.centroid().is_none());
    }
}
