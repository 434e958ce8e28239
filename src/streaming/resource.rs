//! Host-side resource contracts
//!
//! Streaming requests read what they need from the host's mesh or texture
//! through these traits and hand results back in one call. `HostMesh` and
//! `HostTexture` are plain in-memory hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{ResourceAddress, ResourceId};
use crate::generation::{CompiledGraph, Parameters};
use crate::streaming::block::ModelStreamables;
use crate::streaming::convert::{ClothVertex, MorphTargetVertex, RenderLod};
use crate::streaming::lod::MipLayout;
use crate::streaming::storage::StorageBackend;

/// Clothing deltas for one block, with the clothing asset they belong to
#[derive(Debug, Clone)]
pub struct ClothingBuffer {
    pub asset_index: u32,
    pub asset_lod: u32,
    pub vertices: Vec<ClothVertex>,
}

/// Everything the buffer stage hands to the host in one call
#[derive(Debug, Clone, Default)]
pub struct MeshBuffers {
    /// Converted LODs, coarse to fine
    pub lods: Vec<RenderLod>,
    /// Morph target deltas keyed by block id
    pub morphs: HashMap<u32, Vec<MorphTargetVertex>>,
    /// Clothing deltas keyed by block id
    pub clothing: HashMap<u32, ClothingBuffer>,
}

impl MeshBuffers {
    pub fn lod_levels(&self) -> Vec<u8> {
        self.lods.iter().map(|l| l.lod).collect()
    }
}

/// Streamable mesh owned by the host
pub trait MeshResource: Send + Sync {
    fn resource_id(&self) -> ResourceId;
    /// False once the host has started tearing the resource down
    fn is_valid(&self) -> bool;
    fn graph(&self) -> Arc<CompiledGraph>;
    fn parameters(&self) -> Parameters;
    /// Component index used to address the engine
    fn component(&self) -> u16;
    fn streamables(&self) -> Arc<ModelStreamables>;
    /// Backend resolved for this resource's bulk data
    fn storage(&self) -> StorageBackend;
    /// Section count of a resident LOD
    fn section_count(&self, lod: u8) -> Option<usize>;
    fn mark_buffers_dirty(&self);
    fn create_buffers(&self, buffers: MeshBuffers);
}

/// Streamable texture owned by the host
pub trait TextureResource: Send + Sync {
    fn resource_id(&self) -> ResourceId;
    fn is_valid(&self) -> bool;
    fn graph(&self) -> Arc<CompiledGraph>;
    fn parameters(&self) -> Parameters;
    /// Engine address of the image (the lod field is ignored)
    fn address(&self) -> ResourceAddress;
    fn mip_layout(&self) -> MipLayout;
    /// Bytes of a mip the host already has
    fn resident_mip(&self, mip: u8) -> Option<Vec<u8>>;
    /// Model block ids worth prefetching before generating from `first_mip`
    fn prefetch_blocks(&self, first_mip: u8) -> Vec<u64>;
    fn streamables(&self) -> Arc<ModelStreamables>;
    fn storage(&self) -> StorageBackend;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory mesh host
pub struct HostMesh {
    id: ResourceId,
    graph: Arc<CompiledGraph>,
    parameters: Parameters,
    component: u16,
    streamables: Arc<ModelStreamables>,
    storage: StorageBackend,
    valid: AtomicBool,
    resident_sections: Mutex<HashMap<u8, usize>>,
    dirty_marks: AtomicUsize,
    created: Mutex<Vec<MeshBuffers>>,
}

impl HostMesh {
    pub fn new(id: ResourceId, graph: Arc<CompiledGraph>, parameters: Parameters, storage: StorageBackend) -> Self {
        Self {
            id,
            graph,
            parameters,
            component: 0,
            streamables: Arc::new(ModelStreamables::default()),
            storage,
            valid: AtomicBool::new(true),
            resident_sections: Mutex::new(HashMap::new()),
            dirty_marks: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_component(mut self, component: u16) -> Self {
        self.component = component;
        self
    }

    pub fn with_streamables(mut self, streamables: ModelStreamables) -> Self {
        self.streamables = Arc::new(streamables);
        self
    }

    pub fn set_resident_sections(&self, lod: u8, count: usize) {
        lock(&self.resident_sections).insert(lod, count);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn dirty_marks(&self) -> usize {
        self.dirty_marks.load(Ordering::Acquire)
    }

    pub fn create_count(&self) -> usize {
        lock(&self.created).len()
    }

    /// Take every buffer set created so far
    pub fn take_created(&self) -> Vec<MeshBuffers> {
        std::mem::take(&mut *lock(&self.created))
    }
}

impl MeshResource for HostMesh {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn graph(&self) -> Arc<CompiledGraph> {
        self.graph.clone()
    }

    fn parameters(&self) -> Parameters {
        self.parameters.clone()
    }

    fn component(&self) -> u16 {
        self.component
    }

    fn streamables(&self) -> Arc<ModelStreamables> {
        self.streamables.clone()
    }

    fn storage(&self) -> StorageBackend {
        self.storage.clone()
    }

    fn section_count(&self, lod: u8) -> Option<usize> {
        lock(&self.resident_sections).get(&lod).copied()
    }

    fn mark_buffers_dirty(&self) {
        self.dirty_marks.fetch_add(1, Ordering::AcqRel);
    }

    fn create_buffers(&self, buffers: MeshBuffers) {
        let mut sections = lock(&self.resident_sections);
        for lod in &buffers.lods {
            sections.insert(lod.lod, lod.sections.len());
        }
        drop(sections);
        log::debug!("Mesh {} received LODs {:?}", self.id, buffers.lod_levels());
        lock(&self.created).push(buffers);
    }
}

/// In-memory texture host
pub struct HostTexture {
    id: ResourceId,
    graph: Arc<CompiledGraph>,
    parameters: Parameters,
    address: ResourceAddress,
    layout: MipLayout,
    streamables: Arc<ModelStreamables>,
    storage: StorageBackend,
    valid: AtomicBool,
    resident: Mutex<HashMap<u8, Vec<u8>>>,
    prefetch: Mutex<Vec<u64>>,
}

impl HostTexture {
    pub fn new(
        id: ResourceId,
        graph: Arc<CompiledGraph>,
        parameters: Parameters,
        layout: MipLayout,
        storage: StorageBackend,
    ) -> Self {
        Self {
            id,
            graph,
            parameters,
            address: ResourceAddress::image(0, 0, 0),
            layout,
            streamables: Arc::new(ModelStreamables::default()),
            storage,
            valid: AtomicBool::new(true),
            resident: Mutex::new(HashMap::new()),
            prefetch: Mutex::new(Vec::new()),
        }
    }

    pub fn with_address(mut self, address: ResourceAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_streamables(mut self, streamables: ModelStreamables) -> Self {
        self.streamables = Arc::new(streamables);
        self
    }

    pub fn set_resident_mip(&self, mip: u8, bytes: Vec<u8>) {
        lock(&self.resident).insert(mip, bytes);
    }

    pub fn set_prefetch_blocks(&self, ids: Vec<u64>) {
        *lock(&self.prefetch) = ids;
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl TextureResource for HostTexture {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn graph(&self) -> Arc<CompiledGraph> {
        self.graph.clone()
    }

    fn parameters(&self) -> Parameters {
        self.parameters.clone()
    }

    fn address(&self) -> ResourceAddress {
        self.address
    }

    fn mip_layout(&self) -> MipLayout {
        self.layout
    }

    fn resident_mip(&self, mip: u8) -> Option<Vec<u8>> {
        lock(&self.resident).get(&mip).cloned()
    }

    fn prefetch_blocks(&self, _first_mip: u8) -> Vec<u64> {
        lock(&self.prefetch).clone()
    }

    fn streamables(&self) -> Arc<ModelStreamables> {
        self.streamables.clone()
    }

    fn storage(&self) -> StorageBackend {
        self.storage.clone()
    }
}
