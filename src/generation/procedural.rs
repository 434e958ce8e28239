//! Reference procedural engine
//!
//! Meshes are UV spheres whose ring and segment counts halve per LOD.
//! Images are Perlin-noise RGBA tiles with a filtered mip chain. Recognised
//! parameters: `rings` (int, default 32), `segments` (int, default 48),
//! `radius` (float, default 1.0), `sections` (int, 1 or 2, default 2),
//! `size` (int, texture size at mip 0, default 64), `seed` (int) and
//! `tint` (color).

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::{Vec2, Vec3};
use image::{imageops, Rgba, RgbaImage};
use noise::{NoiseFn, Perlin};

use crate::core::{ContentKind, ResourceAddress};
use crate::generation::engine::{
    CompiledGraph, GeneratedImage, GeneratedMesh, GeneratedResource, GenerationEngine, GenerationError,
    InstanceHandle, MeshSection, Parameters,
};
use crate::streaming::lod::mip_extent;

const DEFAULT_RINGS: i32 = 32;
const DEFAULT_SEGMENTS: i32 = 48;
const DEFAULT_TEXTURE_SIZE: i32 = 64;
const MIN_RINGS: u32 = 2;
const MIN_SEGMENTS: u32 = 3;

struct InstanceState {
    graph: Arc<CompiledGraph>,
    parameters: Parameters,
}

/// Behaviour overrides used to exercise degraded paths
#[derive(Debug, Default)]
struct EngineOptions {
    /// Cap on the number of mips returned per image
    mip_limit: Option<usize>,
    /// LODs the engine fails to produce
    missing_lods: Vec<u8>,
    /// Packed streamed resource ids attached to meshes per LOD
    streamed: HashMap<u8, Vec<u64>>,
}

/// Deterministic engine used by the demo, benchmarks and tests
pub struct ProceduralEngine {
    next_handle: AtomicU32,
    instances: Mutex<HashMap<u32, InstanceState>>,
    options: Mutex<EngineOptions>,
    calls: Mutex<Vec<(InstanceHandle, ResourceAddress)>>,
    preloaded: Mutex<Vec<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProceduralEngine {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(1),
            instances: Mutex::new(HashMap::new()),
            options: Mutex::new(EngineOptions::default()),
            calls: Mutex::new(Vec::new()),
            preloaded: Mutex::new(Vec::new()),
        }
    }

    /// Return at most `count` mips per image request
    pub fn limit_mips(&self, count: usize) {
        lock(&self.options).mip_limit = Some(count);
    }

    /// Fail every request for `lod`
    pub fn drop_lod(&self, lod: u8) {
        lock(&self.options).missing_lods.push(lod);
    }

    /// Attach packed streamed resource ids to meshes generated at `lod`
    pub fn set_streamed_resources(&self, lod: u8, ids: Vec<u64>) {
        lock(&self.options).streamed.insert(lod, ids);
    }

    /// Every generate call so far, in execution order
    pub fn calls(&self) -> Vec<(InstanceHandle, ResourceAddress)> {
        lock(&self.calls).clone()
    }

    pub fn live_instances(&self) -> usize {
        lock(&self.instances).len()
    }

    /// Block ids handed over through `preload_block`
    pub fn preloaded(&self) -> Vec<u64> {
        lock(&self.preloaded).clone()
    }

    fn generate_mesh(&self, state: &InstanceState, lod: u8) -> GeneratedMesh {
        let params = &state.parameters;
        let rings = (params.int("rings").unwrap_or(DEFAULT_RINGS).max(0) as u32 >> lod).max(MIN_RINGS);
        let segments = (params.int("segments").unwrap_or(DEFAULT_SEGMENTS).max(0) as u32 >> lod).max(MIN_SEGMENTS);
        let radius = params.float("radius").unwrap_or(1.0);
        let split = params.int("sections").unwrap_or(2) >= 2;

        let mut mesh = uv_sphere(rings, segments, radius, split);
        mesh.lod = lod;
        mesh.streamed_resources = lock(&self.options).streamed.get(&lod).cloned().unwrap_or_default();
        mesh
    }

    fn generate_image(&self, state: &InstanceState, first_mip: u8) -> GeneratedImage {
        let params = &state.parameters;
        let base = params.int("size").unwrap_or(DEFAULT_TEXTURE_SIZE).max(1) as u32;
        let seed = params.int("seed").map(|s| s as u32).unwrap_or(state.graph.id as u32);
        let tint = params.color("tint").unwrap_or([0.8, 0.6, 0.4, 1.0]);

        let extent = mip_extent(base, first_mip);
        let top = noise_tile(extent, seed, tint);

        let mut mips = vec![top.clone().into_raw()];
        let mut mip = first_mip;
        while mip_extent(base, mip) > 1 {
            mip += 1;
            let size = mip_extent(base, mip);
            mips.push(imageops::resize(&top, size, size, imageops::FilterType::Triangle).into_raw());
        }

        if let Some(limit) = lock(&self.options).mip_limit {
            mips.truncate(limit);
        }

        GeneratedImage { width: extent, height: extent, bytes_per_pixel: 4, first_mip, mips }
    }
}

impl Default for ProceduralEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEngine for ProceduralEngine {
    fn create_instance(&self, graph: &Arc<CompiledGraph>, parameters: &Parameters) -> InstanceHandle {
        let handle = InstanceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.instances).insert(
            handle.0,
            InstanceState { graph: graph.clone(), parameters: parameters.clone() },
        );
        handle
    }

    fn generate(
        &self,
        instance: InstanceHandle,
        address: &ResourceAddress,
    ) -> Result<GeneratedResource, GenerationError> {
        lock(&self.calls).push((instance, *address));

        let instances = lock(&self.instances);
        let state = instances
            .get(&instance.0)
            .ok_or_else(|| GenerationError::Failed(format!("unknown instance {:?}", instance)))?;

        match address.kind {
            ContentKind::Mesh => {
                let missing = lock(&self.options).missing_lods.contains(&address.lod);
                if missing || address.lod >= state.graph.num_lods {
                    return Err(GenerationError::NotProduced(*address));
                }
                Ok(GeneratedResource::Mesh(Arc::new(self.generate_mesh(state, address.lod))))
            }
            ContentKind::Image => Ok(GeneratedResource::Image(Arc::new(self.generate_image(state, address.lod)))),
        }
    }

    fn release_instance(&self, instance: InstanceHandle) {
        if lock(&self.instances).remove(&instance.0).is_none() {
            log::warn!("Release of unknown instance {:?}", instance);
        }
    }

    fn preload_block(&self, block_id: u64, bytes: Arc<[u8]>) {
        log::trace!("Preloaded block {} ({} bytes)", block_id, bytes.len());
        lock(&self.preloaded).push(block_id);
    }
}

/// UV sphere, optionally split into upper and lower hemisphere sections
pub fn uv_sphere(rings: u32, segments: u32, radius: f32, split: bool) -> GeneratedMesh {
    let vertex_count = ((rings + 1) * (segments + 1)) as usize;
    let mut mesh = GeneratedMesh {
        positions: Vec::with_capacity(vertex_count),
        normals: Vec::with_capacity(vertex_count),
        uvs: Vec::with_capacity(vertex_count),
        ..Default::default()
    };

    for ring in 0..=rings {
        let v = ring as f32 / rings as f32;
        let theta = v * PI;
        for segment in 0..=segments {
            let u = segment as f32 / segments as f32;
            let phi = u * 2.0 * PI;
            let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            mesh.positions.push((normal * radius).to_array());
            mesh.normals.push(normal.to_array());
            mesh.uvs.push(Vec2::new(u, v).to_array());
        }
    }

    let stride = segments + 1;
    let ring_indices = |ring: u32, out: &mut Vec<u32>| {
        for segment in 0..segments {
            let a = ring * stride + segment;
            let b = a + stride;
            out.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
        }
    };

    let boundaries: Vec<u32> = if split { vec![0, rings / 2, rings] } else { vec![0, rings] };
    for (material, pair) in boundaries.windows(2).enumerate() {
        let first_index = mesh.indices.len() as u32;
        for ring in pair[0]..pair[1] {
            ring_indices(ring, &mut mesh.indices);
        }
        mesh.sections.push(MeshSection {
            first_index,
            index_count: mesh.indices.len() as u32 - first_index,
            base_vertex: 0,
            vertex_count: vertex_count as u32,
            material: material as u32,
        });
    }

    mesh
}

fn noise_tile(size: u32, seed: u32, tint: [f32; 4]) -> RgbaImage {
    let perlin = Perlin::new(seed);
    let scale = 4.0 / size as f64;
    RgbaImage::from_fn(size, size, |x, y| {
        let n = perlin.get([x as f64 * scale, y as f64 * scale]);
        let t = ((n + 1.0) * 0.5).clamp(0.0, 1.0) as f32;
        let channel = |c: f32| (c * t * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgba([channel(tint[0]), channel(tint[1]), channel(tint[2]), (tint[3] * 255.0) as u8])
    })
}
