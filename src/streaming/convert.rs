//! Engine-native mesh to renderable buffers
//!
//! Converts a `GeneratedMesh` into interleaved GPU vertices, a 16 or 32-bit
//! index buffer and render sections. Attribute arrays that come back
//! shorter than the position array are padded so the vertex buffer is
//! never partially initialized.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rayon::prelude::*;

use crate::core::Error;
use crate::generation::GeneratedMesh;

/// Interleaved vertex as uploaded to the GPU
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RenderVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Real-time morph target delta for one vertex
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MorphTargetVertex {
    pub position_delta: [f32; 3],
    pub tangent_z_delta: [f32; 3],
    pub source_index: u32,
}

/// Clothing skinning record for one render vertex
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ClothVertex {
    pub position_bary: [f32; 4],
    pub normal_bary: [f32; 4],
    pub tangent_bary: [f32; 4],
    pub source_indices: [u16; 4],
    pub weight: f32,
    pub _pad: u32,
}

/// Decode a block of `T` records; `None` if the size is not a multiple
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Option<Vec<T>> {
    let size = std::mem::size_of::<T>();
    if size == 0 || bytes.len() % size != 0 {
        return None;
    }
    Some(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
}

#[derive(Clone, Debug, PartialEq)]
pub enum IndexBuffer {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexBuffer {
    /// Narrowest index format that can address `vertex_count` vertices.
    ///
    /// Indices are never truncated: one that does not fit in `u16` keeps
    /// the buffer at `u32` even for small meshes.
    pub fn for_vertex_count(indices: &[u32], vertex_count: usize) -> Self {
        if vertex_count <= u16::MAX as usize + 1 && indices.iter().all(|&i| i <= u16::MAX as u32) {
            IndexBuffer::U16(indices.iter().map(|&i| i as u16).collect())
        } else {
            IndexBuffer::U32(indices.to_vec())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexBuffer::U16(v) => v.len(),
            IndexBuffer::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IndexBuffer::U16(v) => bytemuck::cast_slice(v),
            IndexBuffer::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSection {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: u32,
    pub vertex_count: u32,
    pub material: u32,
}

/// One converted LOD
#[derive(Clone, Debug)]
pub struct RenderLod {
    pub lod: u8,
    pub vertices: Vec<RenderVertex>,
    pub indices: IndexBuffer,
    pub sections: Vec<RenderSection>,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl RenderLod {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }
}

/// Conversion result plus what the buffer stage needs to know about it
#[derive(Clone, Debug)]
pub struct ConvertedLod {
    pub render: RenderLod,
    /// Section boundaries no longer match the resident layout
    pub degenerate: bool,
    /// Attribute arrays that had to be padded
    pub padded_attributes: usize,
}

/// Convert one generated mesh.
///
/// `resident_sections` is the section count the host currently has for
/// this LOD, if any.
pub fn convert_mesh(mesh: &GeneratedMesh, resident_sections: Option<usize>) -> ConvertedLod {
    let count = mesh.positions.len();
    let mut padded_attributes = 0;

    if mesh.normals.len() < count {
        log::warn!("LOD {} normals: {}", mesh.lod, Error::SizeMismatch { expected: count, actual: mesh.normals.len() });
        padded_attributes += 1;
    }
    if mesh.uvs.len() < count {
        log::warn!("LOD {} uvs: {}", mesh.lod, Error::SizeMismatch { expected: count, actual: mesh.uvs.len() });
        padded_attributes += 1;
    }

    let vertices: Vec<RenderVertex> = (0..count)
        .into_par_iter()
        .map(|i| RenderVertex {
            position: mesh.positions[i],
            normal: mesh.normals.get(i).copied().unwrap_or([0.0, 1.0, 0.0]),
            uv: mesh.uvs.get(i).copied().unwrap_or_default(),
        })
        .collect();

    let (bounds_min, bounds_max) = vertices
        .par_iter()
        .map(|v| {
            let p = Vec3::from_array(v.position);
            (p, p)
        })
        .reduce(
            || (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );
    let (bounds_min, bounds_max) = if count == 0 { (Vec3::ZERO, Vec3::ZERO) } else { (bounds_min, bounds_max) };

    let index_total = mesh.indices.len() as u32;
    let mut degenerate = resident_sections.is_some_and(|n| n != mesh.sections.len());
    if let Some(bad) = mesh.indices.par_iter().find_any(|&&i| i as usize >= count) {
        log::warn!("LOD {} index {} out of range for {} vertices", mesh.lod, bad, count);
        degenerate = true;
    }
    let sections: Vec<RenderSection> = mesh
        .sections
        .iter()
        .map(|s| {
            let first_index = s.first_index.min(index_total);
            let index_count = s.index_count.min(index_total - first_index);
            if index_count == 0 || index_count != s.index_count {
                degenerate = true;
            }
            RenderSection {
                first_index,
                index_count,
                base_vertex: s.base_vertex,
                vertex_count: s.vertex_count,
                material: s.material,
            }
        })
        .collect();

    if degenerate {
        log::debug!("LOD {} section layout changed, buffers must be rebuilt", mesh.lod);
    }

    ConvertedLod {
        render: RenderLod {
            lod: mesh.lod,
            vertices,
            indices: IndexBuffer::for_vertex_count(&mesh.indices, count),
            sections,
            bounds_min,
            bounds_max,
        },
        degenerate,
        padded_attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::procedural::uv_sphere;
    use crate::generation::MeshSection;

    #[test]
    fn test_pod_sizes() {
        assert_eq!(std::mem::size_of::<RenderVertex>(), 32);
        assert_eq!(std::mem::size_of::<MorphTargetVertex>(), 28);
        assert_eq!(std::mem::size_of::<ClothVertex>(), 64);
    }

    #[test]
    fn test_convert_sphere() {
        let mesh = uv_sphere(4, 6, 1.5, true);
        let converted = convert_mesh(&mesh, Some(2));

        assert!(!converted.degenerate);
        assert_eq!(converted.padded_attributes, 0);
        assert_eq!(converted.render.vertices.len(), mesh.positions.len());
        assert!(matches!(converted.render.indices, IndexBuffer::U16(_)));
        assert_eq!(converted.render.indices.len(), mesh.indices.len());
        assert!((converted.render.bounds_max.y - 1.5).abs() < 1e-4);
        assert!((converted.render.bounds_min.y + 1.5).abs() < 1e-4);
        assert_eq!(converted.render.vertex_bytes().len(), mesh.positions.len() * 32);
    }

    #[test]
    fn test_section_count_change_is_degenerate() {
        let mesh = uv_sphere(4, 6, 1.0, false);
        assert!(convert_mesh(&mesh, Some(2)).degenerate);
        assert!(!convert_mesh(&mesh, Some(1)).degenerate);
        assert!(!convert_mesh(&mesh, None).degenerate);
    }

    #[test]
    fn test_empty_section_is_degenerate() {
        let mut mesh = uv_sphere(2, 3, 1.0, false);
        mesh.sections.push(MeshSection {
            first_index: mesh.indices.len() as u32,
            index_count: 0,
            base_vertex: 0,
            vertex_count: 0,
            material: 1,
        });
        assert!(convert_mesh(&mesh, None).degenerate);
    }

    #[test]
    fn test_out_of_range_index_is_degenerate_and_kept() {
        let mut mesh = uv_sphere(2, 3, 1.0, false);
        mesh.indices[0] = 70_000;
        let converted = convert_mesh(&mesh, None);
        assert!(converted.degenerate);
        match &converted.render.indices {
            IndexBuffer::U32(indices) => assert_eq!(indices[0], 70_000),
            IndexBuffer::U16(_) => panic!("index was narrowed"),
        }
    }

    #[test]
    fn test_short_attributes_are_padded() {
        let mut mesh = uv_sphere(2, 3, 1.0, false);
        mesh.uvs.truncate(2);
        let converted = convert_mesh(&mesh, None);
        assert_eq!(converted.padded_attributes, 1);
        assert_eq!(converted.render.vertices[5].uv, [0.0, 0.0]);
    }

    #[test]
    fn test_large_mesh_uses_u32_indices() {
        let buffer = IndexBuffer::for_vertex_count(&[0, 70_000], 70_001);
        assert!(matches!(buffer, IndexBuffer::U32(_)));
        assert_eq!(buffer.as_bytes().len(), 8);
    }

    #[test]
    fn test_decode_records() {
        let record = MorphTargetVertex { position_delta: [1.0, 2.0, 3.0], tangent_z_delta: [0.0; 3], source_index: 9 };
        let mut bytes = bytemuck::bytes_of(&record).to_vec();
        bytes.extend_from_slice(bytemuck::bytes_of(&record));
        let decoded: Vec<MorphTargetVertex> = decode_records(&bytes).unwrap();
        assert_eq!(decoded, vec![record, record]);
        assert!(decode_records::<MorphTargetVertex>(&bytes[..30]).is_none());
    }
}
