//! CPU rasterizer implementing [`RenderBackend`].
//!
//! The rasterizer draws flat-shaded triangles with a depth buffer through the
//! scene camera's intrinsics. It has no texture sampling: a scene containing a
//! textured material fails to render, which the model resource recovers from
//! by rebuilding with untextured materials.

use super::{
    LightKind, Material, NodeHandle, RenderBackend, RendererHandle, SceneDescription, SceneHandle,
};
use crate::pose_estimation::{CameraIntrinsics, Distortion};
use crate::utils::safe_cast::f64_to_u32_clamp;
use crate::{Error, Result};
use image::{Rgba, RgbaImage};
use log::debug;
use nalgebra::{Matrix4, Point2, Point3, Vector3};
use std::collections::HashMap;

const NEAR_PLANE: f64 = 1e-3;
const AMBIENT: f64 = 0.25;
const UNLIT_GRAY: [f32; 4] = [0.7, 0.7, 0.7, 1.0];

struct Target {
    width: u32,
    height: u32,
}

struct Scene {
    description: SceneDescription,
    node_poses: Vec<Matrix4<f64>>,
    camera: Option<CameraIntrinsics>,
}

/// Flat-shaded, depth-buffered triangle rasterizer
#[derive(Default)]
pub struct SoftwareRenderer {
    next_id: u64,
    targets: HashMap<u64, Target>,
    scenes: HashMap<u64, Scene>,
}

impl SoftwareRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn issue_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Live scenes and renderers (leak checks in tests)
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.targets.len() + self.scenes.len()
    }
}

/// Edge function: twice the signed area of (a, b, p)
fn edge(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> f64 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// GL camera space to vision camera space
fn gl_to_cv(p: &Point3<f64>) -> Point3<f64> {
    Point3::new(p.x, -p.y, -p.z)
}

fn shade(material: &Material, normal: &Vector3<f64>, center: &Point3<f64>, scene: &SceneDescription) -> Rgba<u8> {
    let mut lit = 0.0;
    let mut total = 0.0;
    for light in &scene.lights {
        let intensity = f64::from(light.intensity);
        // Lights are placed in GL camera space
        let direction = match light.kind {
            LightKind::Directional => (light.pose * nalgebra::Vector4::new(0.0, 0.0, 1.0, 0.0)).xyz(),
            LightKind::Point => {
                let position = light.pose.transform_point(&Point3::origin());
                position - center
            }
        };
        let Some(direction) = direction.try_normalize(1e-12) else {
            continue;
        };
        lit += intensity * normal.dot(&direction).abs();
        total += intensity;
    }
    let diffuse = if total > 0.0 { lit / total } else { 1.0 };
    let factor = (AMBIENT + (1.0 - AMBIENT) * diffuse).clamp(0.0, 1.0);

    let base = material.base_color;
    let channel = |c: f32, e: f32| f64_to_u32_clamp((f64::from(c) * factor + f64::from(e)) * 255.0, 0, 255) as u8;
    Rgba([
        channel(base[0], material.emissive[0]),
        channel(base[1], material.emissive[1]),
        channel(base[2], material.emissive[2]),
        255,
    ])
}

impl RenderBackend for SoftwareRenderer {
    fn create_renderer(&mut self, width: u32, height: u32) -> Result<RendererHandle> {
        if width == 0 || height == 0 {
            return Err(Error::Render(format!("Invalid target size {width}x{height}")));
        }
        let id = self.issue_id();
        self.targets.insert(id, Target { width, height });
        Ok(RendererHandle(id))
    }

    fn build_scene(&mut self, scene: &SceneDescription) -> Result<(SceneHandle, Vec<NodeHandle>)> {
        let id = self.issue_id();
        let nodes = (0..scene.meshes.len() as u64).map(NodeHandle).collect();
        self.scenes.insert(
            id,
            Scene {
                description: scene.clone(),
                node_poses: vec![Matrix4::identity(); scene.meshes.len()],
                camera: None,
            },
        );
        Ok((SceneHandle(id), nodes))
    }

    fn add_camera(&mut self, scene: SceneHandle, intrinsics: &CameraIntrinsics) -> Result<NodeHandle> {
        let state = self
            .scenes
            .get_mut(&scene.0)
            .ok_or_else(|| Error::Render(format!("Unknown scene {}", scene.0)))?;
        state.camera = Some(*intrinsics);
        Ok(NodeHandle(u64::MAX))
    }

    fn set_node_pose(&mut self, scene: SceneHandle, node: NodeHandle, pose: &Matrix4<f64>) -> Result<()> {
        let state = self
            .scenes
            .get_mut(&scene.0)
            .ok_or_else(|| Error::Render(format!("Unknown scene {}", scene.0)))?;
        let slot = usize::try_from(node.0)
            .ok()
            .and_then(|index| state.node_poses.get_mut(index))
            .ok_or_else(|| Error::Render(format!("Unknown node {}", node.0)))?;
        *slot = *pose;
        Ok(())
    }

    fn render(&mut self, renderer: RendererHandle, scene: SceneHandle) -> Result<RgbaImage> {
        let target = self
            .targets
            .get(&renderer.0)
            .ok_or_else(|| Error::Render(format!("Unknown renderer {}", renderer.0)))?;
        let state = self
            .scenes
            .get(&scene.0)
            .ok_or_else(|| Error::Render(format!("Unknown scene {}", scene.0)))?;
        let intrinsics = state
            .camera
            .ok_or_else(|| Error::Render("Scene has no camera".to_string()))?;
        if state
            .description
            .meshes
            .iter()
            .any(|mesh| mesh.material.is_some_and(|m| m.textured))
        {
            return Err(Error::Render("Texture sampling is not supported".to_string()));
        }

        let (width, height) = (target.width, target.height);
        let mut color = RgbaImage::new(width, height);
        let mut depth = vec![f64::INFINITY; (width as usize) * (height as usize)];
        let distortion = Distortion::default();
        let mut drawn = 0usize;

        for (mesh, pose) in state.description.meshes.iter().zip(&state.node_poses) {
            let gl: Vec<Point3<f64>> = mesh.positions.iter().map(|p| pose.transform_point(p)).collect();
            let material = mesh.material.unwrap_or(Material {
                base_color: UNLIT_GRAY,
                ..Material::safe_fallback()
            });

            for triangle in &mesh.triangles {
                let Some(corners) = triangle
                    .iter()
                    .map(|&i| gl.get(i).copied())
                    .collect::<Option<Vec<Point3<f64>>>>()
                else {
                    return Err(Error::Render(format!("Mesh {} has an out-of-range index", mesh.name)));
                };
                let cv: Vec<Point3<f64>> = corners.iter().map(gl_to_cv).collect();
                if cv.iter().any(|p| p.z < NEAR_PLANE) {
                    continue;
                }
                let Some(screen) = cv
                    .iter()
                    .map(|p| intrinsics.project(p, &distortion))
                    .collect::<Option<Vec<Point2<f64>>>>()
                else {
                    continue;
                };
                let area = edge(&screen[0], &screen[1], &screen[2]);
                if area.abs() < 1e-12 {
                    continue;
                }

                let normal = (corners[1] - corners[0])
                    .cross(&(corners[2] - corners[0]))
                    .try_normalize(1e-18)
                    .unwrap_or_else(Vector3::z);
                let center = Point3::from((corners[0].coords + corners[1].coords + corners[2].coords) / 3.0);
                let pixel = shade(&material, &normal, &center, &state.description);

                let max_x = f64::from(width - 1);
                let max_y = f64::from(height - 1);
                let min_px = screen.iter().map(|p| p.x).fold(f64::INFINITY, f64::min).floor().max(0.0);
                let max_px = screen.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max).ceil().min(max_x);
                let min_py = screen.iter().map(|p| p.y).fold(f64::INFINITY, f64::min).floor().max(0.0);
                let max_py = screen.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max).ceil().min(max_y);
                if min_px > max_px || min_py > max_py {
                    continue;
                }

                let (x0, x1) = (f64_to_u32_clamp(min_px, 0, width - 1), f64_to_u32_clamp(max_px, 0, width - 1));
                let (y0, y1) = (f64_to_u32_clamp(min_py, 0, height - 1), f64_to_u32_clamp(max_py, 0, height - 1));
                for y in y0..=y1 {
                    for x in x0..=x1 {
                        let p = Point2::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
                        let w0 = edge(&screen[1], &screen[2], &p) / area;
                        let w1 = edge(&screen[2], &screen[0], &p) / area;
                        let w2 = edge(&screen[0], &screen[1], &p) / area;
                        if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                            continue;
                        }
                        let z = w0 * cv[0].z + w1 * cv[1].z + w2 * cv[2].z;
                        let index = (y as usize) * (width as usize) + (x as usize);
                        if z < depth[index] {
                            depth[index] = z;
                            color.put_pixel(x, y, pixel);
                            drawn += 1;
                        }
                    }
                }
            }
        }

        debug!("Software render wrote {drawn} fragment(s)");
        Ok(color)
    }

    fn release_scene(&mut self, scene: SceneHandle) {
        self.scenes.remove(&scene.0);
    }

    fn release_renderer(&mut self, renderer: RendererHandle) {
        self.targets.remove(&renderer.0);
    }
}
