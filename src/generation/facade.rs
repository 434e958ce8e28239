//! Async facade over the generation engine
//!
//! Every engine request, preload and release is queued on the scheduler's
//! compute lane, so instances never update concurrently and a release
//! always runs after the requests submitted before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::core::{Error, ResourceAddress, Result};
use crate::generation::engine::{
    CompiledGraph, GeneratedResource, GenerationEngine, GenerationError, InstanceHandle, Parameters,
};
use crate::scheduler::{probe_cancelled, CancelSource, ComputeLane, LaneTask, Scheduler};

/// Exclusively owned generation instance.
///
/// Dropping it queues the release on the compute lane.
pub struct EngineInstance {
    handle: InstanceHandle,
    graph: Arc<CompiledGraph>,
    revision: u32,
    /// Set by the lane job that releases the instance
    released: Arc<AtomicBool>,
    release_queued: AtomicBool,
    engine: Arc<dyn GenerationEngine>,
    lane: Arc<ComputeLane>,
}

impl EngineInstance {
    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    /// Whether the graph is unchanged since this instance was created
    pub fn is_current(&self) -> bool {
        self.graph.is_valid() && self.graph.revision() == self.revision
    }

    fn release(&self) {
        if self.release_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = self.engine.clone();
        let handle = self.handle;
        let released = self.released.clone();
        // Fire and forget: the lane runs it behind every queued request
        drop(self.lane.submit(move || {
            released.store(true, Ordering::Release);
            engine.release_instance(handle);
            log::trace!("Released instance {:?}", handle);
        }));
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("handle", &self.handle)
            .field("graph", &self.graph.name)
            .field("revision", &self.revision)
            .finish()
    }
}

/// Pending result of one resource request
pub struct ResourceTask {
    inner: LaneTask<std::result::Result<GeneratedResource, GenerationError>>,
}

impl ResourceTask {
    /// Wait for the engine. Invalidation and release surface as errors.
    pub async fn wait(self) -> Result<GeneratedResource> {
        match self.inner.await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(e),
        }
    }
}

/// Request/response boundary around a `GenerationEngine`
#[derive(Clone)]
pub struct GenerationFacade {
    engine: Arc<dyn GenerationEngine>,
    lane: Arc<ComputeLane>,
}

impl GenerationFacade {
    pub fn new(engine: Arc<dyn GenerationEngine>, scheduler: &Scheduler) -> Self {
        Self { engine, lane: scheduler.compute_lane().clone() }
    }

    pub fn engine(&self) -> &Arc<dyn GenerationEngine> {
        &self.engine
    }

    /// Create an instance. Synchronous: handle creation is cheap.
    pub fn create_instance(&self, graph: &Arc<CompiledGraph>, parameters: &Parameters) -> Result<EngineInstance> {
        if !graph.is_valid() {
            return Err(Error::InstanceInvalidated);
        }
        let handle = self.engine.create_instance(graph, parameters);
        log::trace!("Created instance {:?} of graph '{}'", handle, graph.name);
        Ok(EngineInstance {
            handle,
            graph: graph.clone(),
            revision: graph.revision(),
            released: Arc::new(AtomicBool::new(false)),
            release_queued: AtomicBool::new(false),
            engine: self.engine.clone(),
            lane: self.lane.clone(),
        })
    }

    /// Request one resource from an instance
    pub fn request_resource(&self, instance: &EngineInstance, address: ResourceAddress) -> ResourceTask {
        self.submit_request(instance, address, None)
    }

    /// Request one resource; the job is skipped if `probe` reports
    /// cancellation by the time it reaches the front of the lane
    pub fn request_resource_cancellable(
        &self,
        instance: &EngineInstance,
        address: ResourceAddress,
        probe: Weak<dyn CancelSource>,
    ) -> ResourceTask {
        self.submit_request(instance, address, Some(probe))
    }

    fn submit_request(
        &self,
        instance: &EngineInstance,
        address: ResourceAddress,
        probe: Option<Weak<dyn CancelSource>>,
    ) -> ResourceTask {
        let engine = self.engine.clone();
        let graph = instance.graph.clone();
        let revision = instance.revision;
        let released = instance.released.clone();
        let handle = instance.handle;

        let inner = self.lane.submit(move || {
            if released.load(Ordering::Acquire) {
                return Err(GenerationError::Released);
            }
            if probe.as_ref().is_some_and(probe_cancelled) {
                return Err(GenerationError::Skipped);
            }
            if !graph.is_valid() || graph.revision() != revision {
                log::warn!("Instance {:?} of graph '{}' invalidated mid-session", handle, graph.name);
                return Err(GenerationError::InstanceInvalidated);
            }
            log::debug!("Generating {:?} on instance {:?}", address, handle);
            engine.generate(handle, &address)
        });

        ResourceTask { inner }
    }

    /// Hand prefetched block bytes to the engine, in lane order
    pub fn preload_block(&self, block_id: u64, bytes: Arc<[u8]>) -> LaneTask<()> {
        let engine = self.engine.clone();
        self.lane.submit(move || engine.preload_block(block_id, bytes))
    }

    /// Release an instance.
    ///
    /// The release is queued on the compute lane, so requests submitted
    /// before it still run against the live instance and resolve first.
    pub fn release_instance(&self, instance: EngineInstance) {
        instance.release();
    }
}
