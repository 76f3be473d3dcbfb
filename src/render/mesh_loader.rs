//! Car assets from disk: Wavefront OBJ (with MTL materials) through `tobj`,
//! glTF/GLB scenes through `gltf`.

use super::{AssetLoader, LoadedAsset, Material, Mesh};
use crate::{Error, Result};
use log::{debug, warn};
use nalgebra::{Matrix4, Point3};
use std::path::Path;

/// Loads `.obj`, `.gltf` and `.glb` files
#[derive(Debug, Default, Clone, Copy)]
pub struct MeshFileLoader;

impl MeshFileLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Group a flat index list into triangles, dropping any that point past the vertex list
fn triangles(indices: &[u32], vertex_count: usize) -> Vec<[usize; 3]> {
    indices
        .chunks_exact(3)
        .filter_map(|chunk| {
            let tri = [
                usize::try_from(chunk[0]).ok()?,
                usize::try_from(chunk[1]).ok()?,
                usize::try_from(chunk[2]).ok()?,
            ];
            tri.iter().all(|&i| i < vertex_count).then_some(tri)
        })
        .collect()
}

fn obj_material(material: &tobj::Material) -> Material {
    let [r, g, b] = material.diffuse.unwrap_or([0.8, 0.8, 0.8]);
    let alpha = material.dissolve.unwrap_or(1.0);
    // Phong exponent 0..1000 mapped onto PBR roughness
    let roughness = 1.0 - (material.shininess.unwrap_or(0.0) / 1000.0).clamp(0.0, 1.0);
    Material {
        base_color: [r, g, b, alpha],
        metallic: 0.0,
        roughness,
        emissive: [0.0, 0.0, 0.0],
        textured: material.diffuse_texture.is_some(),
    }
}

fn load_obj(path: &Path) -> Result<LoadedAsset> {
    let (models, materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS)
        .map_err(|e| Error::AssetLoad(format!("{}: {e}", path.display())))?;
    let materials = materials.unwrap_or_else(|e| {
        warn!("No usable materials for {}: {e}", path.display());
        Vec::new()
    });

    let meshes = models
        .into_iter()
        .map(|model| {
            let positions: Vec<Point3<f64>> = model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| Point3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2])))
                .collect();
            let triangles = triangles(&model.mesh.indices, positions.len());
            let material = model
                .mesh
                .material_id
                .and_then(|id| materials.get(id))
                .map(obj_material);
            Mesh {
                name: model.name,
                positions,
                triangles,
                material,
            }
        })
        .collect();

    Ok(LoadedAsset {
        meshes,
        is_scene: false,
    })
}

fn gltf_material(material: &gltf::Material<'_>) -> Option<Material> {
    // Primitives without a material use the glTF default, which is not the asset's own.
    material.index()?;
    let pbr = material.pbr_metallic_roughness();
    Some(Material {
        base_color: pbr.base_color_factor(),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        emissive: material.emissive_factor(),
        textured: pbr.base_color_texture().is_some(),
    })
}

fn gltf_node(
    node: &gltf::Node<'_>,
    parent: &Matrix4<f64>,
    buffers: &[gltf::buffer::Data],
    meshes: &mut Vec<Mesh>,
) {
    let transform = parent * Matrix4::from(node.transform().matrix()).cast::<f64>();

    if let Some(mesh) = node.mesh() {
        for (index, primitive) in mesh.primitives().enumerate() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                debug!("Skipping non-triangle primitive {index} of {:?}", mesh.name());
                continue;
            }
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));
            let Some(positions) = reader.read_positions() else {
                continue;
            };
            let positions: Vec<Point3<f64>> = positions
                .map(|p| transform.transform_point(&Point3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2]))))
                .collect();
            let indices: Vec<u32> = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect(),
                None => (0..u32::try_from(positions.len()).unwrap_or(u32::MAX)).collect(),
            };
            meshes.push(Mesh {
                name: format!("{}#{index}", mesh.name().or(node.name()).unwrap_or("mesh")),
                triangles: triangles(&indices, positions.len()),
                positions,
                material: gltf_material(&primitive.material()),
            });
        }
    }

    for child in node.children() {
        gltf_node(&child, &transform, buffers, meshes);
    }
}

fn load_gltf(path: &Path) -> Result<LoadedAsset> {
    let asset_error = |e: gltf::Error| Error::AssetLoad(format!("{}: {e}", path.display()));
    // Textures are only flagged, never decoded, so images are not imported.
    let gltf::Gltf { document, blob } = gltf::Gltf::open(path).map_err(asset_error)?;
    let buffers = gltf::import_buffers(&document, path.parent(), blob).map_err(asset_error)?;

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| Error::AssetLoad(format!("{} has no scene", path.display())))?;

    let mut meshes = Vec::new();
    for node in scene.nodes() {
        gltf_node(&node, &Matrix4::identity(), &buffers, &mut meshes);
    }
    Ok(LoadedAsset { meshes, is_scene: true })
}

impl AssetLoader for MeshFileLoader {
    fn load(&mut self, path: &Path) -> Result<LoadedAsset> {
        if !path.is_file() {
            return Err(Error::AssetNotFound(path.display().to_string()));
        }
        let asset = match extension(path).as_str() {
            "obj" => load_obj(path)?,
            "gltf" | "glb" => load_gltf(path)?,
            other => return Err(Error::AssetLoad(format!("Unsupported model format '.{other}'"))),
        };
        debug!(
            "Loaded {}: {} mesh(es), {} triangle(s)",
            path.display(),
            asset.meshes.len(),
            asset.meshes.iter().map(|m| m.triangles.len()).sum::<usize>()
        );
        Ok(asset)
    }
}
