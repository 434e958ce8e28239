//! Entry point for higher layers that need more detail on a resource

use std::sync::Arc;

use crate::core::{Error, ResourceId, Result, StreamingConfig};
use crate::generation::{GenerationEngine, GenerationFacade};
use crate::scheduler::Scheduler;
use crate::streaming::buffer::SharedBuffer;
use crate::streaming::events::StreamingEvents;
use crate::streaming::flight::InFlightRegistry;
use crate::streaming::lod::lods_to_generate;
use crate::streaming::mesh_request::{self, MeshRequestState};
use crate::streaming::mip_request::{self, MipRequestState};
use crate::streaming::request::{RequestContext, StreamingHandle};
use crate::streaming::resource::{MeshResource, TextureResource};

/// Starts mesh and texture streaming requests.
///
/// Enforces one active request per resource and fans out lifecycle events.
pub struct ResourceStreamer {
    ctx: RequestContext,
    flights: Arc<InFlightRegistry>,
}

impl ResourceStreamer {
    pub fn new(scheduler: Arc<Scheduler>, engine: Arc<dyn GenerationEngine>, config: StreamingConfig) -> Self {
        let facade = GenerationFacade::new(engine, &scheduler);
        Self {
            ctx: RequestContext { scheduler, facade, config, events: Arc::new(StreamingEvents::new()) },
            flights: InFlightRegistry::new(),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.ctx.config
    }

    pub fn facade(&self) -> &GenerationFacade {
        &self.ctx.facade
    }

    pub fn events(&self) -> &Arc<StreamingEvents> {
        &self.ctx.events
    }

    pub fn is_streaming(&self, resource: ResourceId) -> bool {
        self.flights.is_active(resource)
    }

    pub fn active_requests(&self) -> usize {
        self.flights.active_count()
    }

    /// Generate LODs `requested_first..resident_first` of a mesh
    pub fn stream_mesh_lods(
        &self,
        mesh: Arc<dyn MeshResource>,
        resident_first: u8,
        requested_first: u8,
    ) -> Result<StreamingHandle<MeshRequestState>> {
        if !self.ctx.config.stream_mesh_lods {
            return Err(Error::InvalidRequest("mesh LOD streaming is disabled".to_string()));
        }
        let num_lods = mesh.graph().num_lods;
        if requested_first >= resident_first || resident_first > num_lods {
            return Err(Error::InvalidRequest(format!(
                "LOD range {}..{} is empty or outside 0..{}",
                requested_first, resident_first, num_lods
            )));
        }

        let guard = self.flights.try_begin(mesh.resource_id())?;
        let lods = lods_to_generate(resident_first, requested_first);
        log::debug!("Streaming mesh {} LODs {:?}", mesh.resource_id(), lods);
        Ok(mesh_request::start(self.ctx.clone(), mesh, lods, guard))
    }

    /// Fill `dest` with mips `requested_first..` of a texture.
    ///
    /// `dest` holds one buffer per mip down to the end of the chain; mips
    /// from `resident_first` on may be copied from the texture itself.
    pub fn stream_texture_mips(
        &self,
        texture: Arc<dyn TextureResource>,
        resident_first: u8,
        requested_first: u8,
        dest: Vec<SharedBuffer>,
    ) -> Result<StreamingHandle<MipRequestState>> {
        let layout = texture.mip_layout();
        if requested_first > resident_first || requested_first >= layout.mip_count {
            return Err(Error::InvalidRequest(format!(
                "mip range {}..{} is invalid for a {}-mip texture",
                requested_first, resident_first, layout.mip_count
            )));
        }
        let expected = (layout.mip_count - requested_first) as usize;
        if dest.len() != expected {
            return Err(Error::InvalidRequest(format!("expected {} mip buffers, got {}", expected, dest.len())));
        }

        let guard = self.flights.try_begin(texture.resource_id())?;
        log::debug!("Streaming texture {} mips from {}", texture.resource_id(), requested_first);
        Ok(mip_request::start(self.ctx.clone(), texture, resident_first, requested_first, dest, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{CompiledGraph, Parameters, ProceduralEngine};
    use crate::streaming::events::{RequestKind, StreamingEvent};
    use crate::streaming::lod::MipLayout;
    use crate::streaming::resource::{HostMesh, HostTexture};
    use crate::streaming::storage::{LooseFileStorage, StorageBackend};

    fn backend() -> StorageBackend {
        StorageBackend::bulk(Arc::new(LooseFileStorage::new(std::env::temp_dir())))
    }

    fn streamer() -> ResourceStreamer {
        let scheduler = Arc::new(Scheduler::with_current_runtime().unwrap());
        ResourceStreamer::new(scheduler, Arc::new(ProceduralEngine::new()), StreamingConfig::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_bad_ranges() {
        let streamer = streamer();
        let mesh = Arc::new(HostMesh::new(1, CompiledGraph::new(1, "m", 3), Parameters::new(), backend()));
        assert!(matches!(streamer.stream_mesh_lods(mesh.clone(), 1, 1), Err(Error::InvalidRequest(_))));
        assert!(matches!(streamer.stream_mesh_lods(mesh, 4, 0), Err(Error::InvalidRequest(_))));

        let layout = MipLayout::full_chain(8, 8, 4);
        let texture = Arc::new(HostTexture::new(2, CompiledGraph::new(2, "t", 1), Parameters::new(), layout, backend()));
        assert!(matches!(
            streamer.stream_texture_mips(texture.clone(), 1, 2, Vec::new()),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            streamer.stream_texture_mips(texture, 4, 0, vec![SharedBuffer::zeroed(4)]),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(streamer.active_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_events_bracket_each_request() {
        let streamer = streamer();
        let mut rx = streamer.events().subscribe_channel();
        let mesh = Arc::new(HostMesh::new(7, CompiledGraph::new(1, "m", 2), Parameters::new(), backend()));

        streamer.stream_mesh_lods(mesh, 1, 0).unwrap().wait().await;

        assert_eq!(rx.recv().await, Some(StreamingEvent::Started { resource: 7, kind: RequestKind::MeshLods }));
        assert_eq!(
            rx.recv().await,
            Some(StreamingEvent::Finished { resource: 7, kind: RequestKind::MeshLods, levels: vec![0] })
        );
    }
}
