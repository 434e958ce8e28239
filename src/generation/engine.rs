//! Generation engine collaborator contract
//!
//! The engine turns a compiled operation graph plus a parameter set into
//! meshes and images. It is not thread-safe per instance: the facade only
//! ever calls it from the compute lane.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Error, ResourceAddress};

/// Compiled operation graph shared by every instance created from it.
///
/// Recompiling bumps the revision, which invalidates live instances.
#[derive(Debug)]
pub struct CompiledGraph {
    pub id: u64,
    pub name: String,
    /// LOD count of the meshes this graph produces
    pub num_lods: u8,
    valid: AtomicBool,
    revision: AtomicU32,
}

impl CompiledGraph {
    pub fn new(id: u64, name: impl Into<String>, num_lods: u8) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            num_lods,
            valid: AtomicBool::new(true),
            revision: AtomicU32::new(0),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn revision(&self) -> u32 {
        self.revision.load(Ordering::Acquire)
    }

    /// Mark the graph unusable (e.g. its source asset was deleted)
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Recompile in place. Instances created before this are invalidated.
    pub fn recompile(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        self.valid.store(true, Ordering::Release);
        log::debug!("Graph '{}' recompiled (revision {})", self.name, self.revision());
    }
}

/// Typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParameterValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Color([f32; 4]),
}

/// Parameter set an instance is generated with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn color(&self, name: &str) -> Option<[f32; 4]> {
        match self.get(name)? {
            ParameterValue::Color(c) => Some(*c),
            _ => None,
        }
    }
}

/// Opaque engine-side instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u32);

/// Contiguous range of one material in a generated mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshSection {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: u32,
    pub vertex_count: u32,
    pub material: u32,
}

/// Engine-native mesh for one LOD
#[derive(Debug, Clone, Default)]
pub struct GeneratedMesh {
    pub lod: u8,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    pub sections: Vec<MeshSection>,
    /// Packed `StreamedResourceId`s of auxiliary data this mesh uses
    pub streamed_resources: Vec<u64>,
}

impl GeneratedMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }
}

/// Engine-native image with its mip chain, finest first
#[derive(Debug, Clone, Default)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Mip index of `mips[0]`
    pub first_mip: u8,
    pub mips: Vec<Vec<u8>>,
}

/// Fully computed resource for one address
#[derive(Debug, Clone)]
pub enum GeneratedResource {
    Mesh(Arc<GeneratedMesh>),
    Image(Arc<GeneratedImage>),
}

impl GeneratedResource {
    pub fn into_mesh(self) -> Option<Arc<GeneratedMesh>> {
        match self {
            GeneratedResource::Mesh(mesh) => Some(mesh),
            GeneratedResource::Image(_) => None,
        }
    }

    pub fn into_image(self) -> Option<Arc<GeneratedImage>> {
        match self {
            GeneratedResource::Image(image) => Some(image),
            GeneratedResource::Mesh(_) => None,
        }
    }
}

/// Errors reported by the engine or the facade around it
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("compiled graph was recompiled or invalidated")]
    InstanceInvalidated,
    #[error("instance already released")]
    Released,
    #[error("request skipped after cancellation")]
    Skipped,
    #[error("engine produced no resource for {0:?}")]
    NotProduced(ResourceAddress),
    #[error("{0}")]
    Failed(String),
}

impl From<GenerationError> for Error {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::InstanceInvalidated => Error::InstanceInvalidated,
            GenerationError::Skipped => Error::Cancelled,
            GenerationError::NotProduced(address) => {
                Error::IncompleteGeneration(format!("no resource for {:?}", address))
            }
            other => Error::Generation(other.to_string()),
        }
    }
}

/// External generation engine.
///
/// `create_instance` must be cheap. The other calls may take arbitrary
/// time and are only issued from the compute lane.
pub trait GenerationEngine: Send + Sync {
    fn create_instance(&self, graph: &Arc<CompiledGraph>, parameters: &Parameters) -> InstanceHandle;

    fn generate(
        &self,
        instance: InstanceHandle,
        address: &ResourceAddress,
    ) -> std::result::Result<GeneratedResource, GenerationError>;

    fn release_instance(&self, instance: InstanceHandle);

    /// Hand the engine a prefetched data block so a later request does not
    /// have to load it again
    fn preload_block(&self, _block_id: u64, _bytes: Arc<[u8]>) {}
}
