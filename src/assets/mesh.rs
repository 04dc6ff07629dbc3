// Mesh data and OBJ import
//
// Vertices carry a full tangent frame. Meshes without normals or tangents
// get them generated, so vertex and index buffers always stay in step.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use super::MeshImporter;
use crate::error::{RendererError, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv: Vec2,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 5] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };

        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(3, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, tangent)),
            attribute(4, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, bitangent)),
        ]
    }
}

/// One imported mesh record.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Diffuse texture referenced by the mesh's material, if any.
    pub diffuse_texture: Option<PathBuf>,
}

impl MeshData {
    /// Unit cube centred on the origin, counter-clockwise faces.
    pub fn cube() -> Self {
        // (normal, u axis, v axis) with u x v = normal
        let faces = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        ];
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let mut mesh = Self::default();
        for (normal, u, v) in faces {
            let base = mesh.vertices.len() as u32;
            for (su, sv) in corners {
                mesh.vertices.push(Vertex {
                    position: (normal + u * su + v * sv) * 0.5,
                    uv: Vec2::new((su + 1.0) * 0.5, 1.0 - (sv + 1.0) * 0.5),
                    normal,
                    ..Default::default()
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        generate_tangents(&mut mesh.vertices, &mesh.indices);
        mesh
    }
}

fn triangles(indices: &[u32]) -> impl Iterator<Item = [usize; 3]> + '_ {
    indices
        .chunks_exact(3)
        .map(|tri| [tri[0] as usize, tri[1] as usize, tri[2] as usize])
}

/// Area-weighted vertex normals.
pub fn generate_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let mut normals = vec![Vec3::ZERO; vertices.len()];
    for [a, b, c] in triangles(indices) {
        let (pa, pb, pc) = (vertices[a].position, vertices[b].position, vertices[c].position);
        // Cross product length is twice the area
        let face = (pb - pa).cross(pc - pa);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    for (vertex, normal) in vertices.iter_mut().zip(normals) {
        vertex.normal = normal.normalize_or_zero();
    }
}

/// Per-vertex tangent and bitangent from positions and UVs, orthonormalised
/// against the normal. Vertices whose UVs are degenerate get an arbitrary
/// frame around the normal.
pub fn generate_tangents(vertices: &mut [Vertex], indices: &[u32]) {
    let mut tangents = vec![Vec3::ZERO; vertices.len()];
    let mut bitangents = vec![Vec3::ZERO; vertices.len()];

    for [a, b, c] in triangles(indices) {
        let e1 = vertices[b].position - vertices[a].position;
        let e2 = vertices[c].position - vertices[a].position;
        let d1 = vertices[b].uv - vertices[a].uv;
        let d2 = vertices[c].uv - vertices[a].uv;

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() < f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let t = (e1 * d2.y - e2 * d1.y) * r;
        let b_ = (e2 * d1.x - e1 * d2.x) * r;

        for i in [a, b, c] {
            tangents[i] += t;
            bitangents[i] += b_;
        }
    }

    for (i, vertex) in vertices.iter_mut().enumerate() {
        let n = vertex.normal;
        let t = (tangents[i] - n * n.dot(tangents[i])).normalize_or_zero();

        let t = if t == Vec3::ZERO {
            if n == Vec3::ZERO {
                Vec3::X
            } else {
                n.any_orthonormal_vector()
            }
        } else {
            t
        };

        let handedness = if n.cross(t).dot(bitangents[i]) < 0.0 { -1.0 } else { 1.0 };
        vertex.tangent = t;
        vertex.bitangent = n.cross(t) * handedness;
    }
}

/// Wavefront OBJ importer. Faces are triangulated and V is flipped to
/// Vulkan's top-left texture origin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjImporter;

impl ObjImporter {
    fn convert(model: &tobj::Model, material_dir: &Path, materials: &[tobj::Material]) -> MeshData {
        let mesh = &model.mesh;
        let vertex_count = mesh.positions.len() / 3;
        let has_normals = mesh.normals.len() == mesh.positions.len();
        let has_uvs = mesh.texcoords.len() / 2 == vertex_count;

        let mut vertices: Vec<Vertex> = (0..vertex_count)
            .map(|i| Vertex {
                position: Vec3::from_slice(&mesh.positions[i * 3..i * 3 + 3]),
                uv: if has_uvs {
                    Vec2::new(mesh.texcoords[i * 2], 1.0 - mesh.texcoords[i * 2 + 1])
                } else {
                    Vec2::ZERO
                },
                normal: if has_normals {
                    Vec3::from_slice(&mesh.normals[i * 3..i * 3 + 3])
                } else {
                    Vec3::ZERO
                },
                ..Default::default()
            })
            .collect();

        if !has_normals {
            log::debug!("Mesh '{}' has no normals, generating", model.name);
            generate_normals(&mut vertices, &mesh.indices);
        }
        // OBJ carries no tangent frame
        generate_tangents(&mut vertices, &mesh.indices);

        let diffuse_texture = mesh
            .material_id
            .and_then(|id| materials.get(id))
            .and_then(|material| material.diffuse_texture.as_ref())
            .map(|texture| material_dir.join(texture));

        MeshData {
            vertices,
            indices: mesh.indices.clone(),
            diffuse_texture,
        }
    }
}

impl MeshImporter for ObjImporter {
    fn import(&self, path: &Path) -> Result<Vec<MeshData>> {
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };

        let (models, materials) = tobj::load_obj(path, &options).map_err(|e| RendererError::Asset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let materials = materials.unwrap_or_else(|e| {
            log::warn!("Failed to load materials for {:?}: {}", path, e);
            Vec::new()
        });
        let material_dir = path.parent().unwrap_or(Path::new(""));

        let meshes: Vec<MeshData> = models
            .iter()
            .map(|model| Self::convert(model, material_dir, &materials))
            .filter(|mesh| !mesh.indices.is_empty())
            .collect();

        log::info!("Imported {} meshes from {:?}", meshes.len(), path);
        Ok(meshes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 14 * 4);
        assert_eq!(Vertex::binding_description().stride, 56);

        let attrs = Vertex::attribute_descriptions();
        let locations: Vec<u32> = attrs.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2, 3, 4]);
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 20, 32, 44]);
        assert_eq!(attrs[1].format, vk::Format::R32G32_SFLOAT);
        assert!(attrs
            .iter()
            .enumerate()
            .all(|(i, a)| i == 1 || a.format == vk::Format::R32G32B32_SFLOAT));
    }

    #[test]
    fn cube_has_24_vertices_and_12_triangles() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertices.len()));
    }

    #[test]
    fn cube_faces_wind_counter_clockwise_outward() {
        let cube = MeshData::cube();
        for tri in cube.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| cube.vertices[i as usize]);
            let face = (b.position - a.position).cross(c.position - a.position);
            assert!(face.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn generated_frames_are_orthonormal() {
        let cube = MeshData::cube();
        for v in &cube.vertices {
            assert!((v.tangent.length() - 1.0).abs() < 1e-4);
            assert!((v.bitangent.length() - 1.0).abs() < 1e-4);
            assert!(v.tangent.dot(v.normal).abs() < 1e-4);
            assert!(v.bitangent.dot(v.normal).abs() < 1e-4);
        }
        // +Z face: U runs along +X
        assert!(approx(cube.vertices[16].tangent, Vec3::X));
    }

    #[test]
    fn tangent_generation_keeps_every_vertex() {
        let mut vertices = vec![
            Vertex {
                position: Vec3::ZERO,
                normal: Vec3::Z,
                ..Default::default()
            },
            Vertex {
                position: Vec3::X,
                normal: Vec3::Z,
                ..Default::default()
            },
            Vertex {
                position: Vec3::Y,
                normal: Vec3::Z,
                ..Default::default()
            },
        ];
        // All UVs zero: no usable gradient
        generate_tangents(&mut vertices, &[0, 1, 2]);
        assert_eq!(vertices.len(), 3);
        for v in &vertices {
            assert!((v.tangent.length() - 1.0).abs() < 1e-4);
            assert!(v.tangent.dot(Vec3::Z).abs() < 1e-4);
        }
    }

    #[test]
    fn normals_follow_winding() {
        let mut vertices = vec![
            Vertex {
                position: Vec3::ZERO,
                ..Default::default()
            },
            Vertex {
                position: Vec3::X,
                ..Default::default()
            },
            Vertex {
                position: Vec3::Y,
                ..Default::default()
            },
        ];
        generate_normals(&mut vertices, &[0, 1, 2]);
        assert!(vertices.iter().all(|v| approx(v.normal, Vec3::Z)));
    }

    #[test]
    fn obj_import_flips_v_and_builds_frames() {
        let obj = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
                   vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
                   f 1/1 2/2 3/3 4/4\n";
        let path = std::env::temp_dir().join(format!("deferred-vk-{}-quad.obj", std::process::id()));
        std::fs::write(&path, obj).unwrap();

        let meshes = ObjImporter.import(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0];
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.vertices[0].uv, Vec2::new(0.0, 1.0));
        assert!(mesh.vertices.iter().all(|v| approx(v.normal, Vec3::Z)));
        assert!(mesh.vertices.iter().all(|v| approx(v.tangent, Vec3::X)));
        assert!(mesh.diffuse_texture.is_none());
    }

    #[test]
    fn missing_obj_is_an_asset_error() {
        let err = ObjImporter.import(Path::new("nowhere/missing.obj")).unwrap_err();
        assert!(matches!(err, RendererError::Asset { .. }));
    }
}
