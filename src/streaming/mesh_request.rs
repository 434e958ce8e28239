//! Mesh Streaming Request
//!
//! Stages run one at a time, each awaiting the previous:
//!
//! 1. `Init` - the resource and its compiled graph must still be valid
//! 2. `RequestGeneration` - one engine instance, every missing LOD requested
//!    coarse to fine; auxiliary morph and clothing blocks referenced by each
//!    mesh start streaming as soon as that mesh arrives
//! 3. `ConvertResources` - engine meshes to render buffers on the blocking pool
//! 4. `MarkBuffersDirty` - only if a section layout changed
//! 5. `CreateBuffers` - hand everything to the host
//!
//! Stages 4 and 5 are the only ones that touch the host and cannot be
//! cancelled; whichever runs first settles cancellation.
//!
//! A missing or wrong LOD aborts the whole request: partial LOD chains are
//! never committed.

use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::sync::Arc;

use rayon::prelude::*;

use crate::core::{Error, ResourceAddress, Result, StreamedKind, StreamedResourceId, StreamingConfig};
use crate::generation::{EngineInstance, GeneratedMesh};
use crate::streaming::block::ModelStreamables;
use crate::streaming::buffer::SharedBuffer;
use crate::streaming::convert::{convert_mesh, decode_records, ClothVertex, MorphTargetVertex};
use crate::streaming::events::{RequestKind, StreamingEvent};
use crate::streaming::flight::FlightGuard;
use crate::streaming::request::{RequestContext, RequestControl, RequestOutcome, StreamingHandle, StreamingSummary};
use crate::streaming::resource::{ClothingBuffer, MeshBuffers, MeshResource};
use crate::streaming::storage::{DataKind, StorageBackend};
use crate::streaming::transfer::{BlockTransfer, TransferTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshRequestState {
    Init,
    RequestGeneration,
    ConvertResources,
    MarkBuffersDirty,
    CreateBuffers,
    Finished,
    Cancelled,
}

struct PendingClothing {
    asset_index: u32,
    asset_lod: u32,
    buffer: SharedBuffer,
}

/// Generated meshes and auxiliary block buffers of one session
#[derive(Default)]
struct OperationData {
    meshes: Vec<Arc<GeneratedMesh>>,
    morphs: HashMap<u32, SharedBuffer>,
    clothing: HashMap<u32, PendingClothing>,
    requested: HashSet<StreamedResourceId>,
}

/// Everything the request owns while it runs. Dropping it is the cancel
/// path: the instance is released and unfinished transfers are cancelled.
#[derive(Default)]
struct MeshSession {
    instance: Option<EngineInstance>,
    transfers: Vec<TransferTask>,
    data: OperationData,
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        for transfer in &self.transfers {
            transfer.cancel();
        }
    }
}

struct ConvertedBuffers {
    buffers: MeshBuffers,
    degenerate: bool,
    degraded: Vec<u8>,
}

/// Spawn the request; the flight guard is released when it resolves
pub(crate) fn start(
    ctx: RequestContext,
    mesh: Arc<dyn MeshResource>,
    lods: Vec<u8>,
    guard: FlightGuard,
) -> StreamingHandle<MeshRequestState> {
    let resource = mesh.resource_id();
    let control = RequestControl::new(MeshRequestState::Init);
    let task_control = control.clone();
    let scheduler = ctx.scheduler.clone();

    let join = scheduler.spawn(async move {
        let kind = RequestKind::MeshLods;
        ctx.events.emit(StreamingEvent::Started { resource, kind });

        let outcome = match run(&ctx, &task_control, mesh.as_ref(), &lods).await {
            Ok(summary) => {
                task_control.set_state(MeshRequestState::Finished);
                log::info!("Mesh {} streamed LODs {:?}", resource, summary.levels);
                RequestOutcome::Completed(summary)
            }
            Err(e) if e.is_cancelled() => {
                task_control.set_state(MeshRequestState::Cancelled);
                log::debug!("Mesh {} request cancelled", resource);
                RequestOutcome::Cancelled
            }
            Err(e) => {
                task_control.set_state(MeshRequestState::Cancelled);
                log::warn!("Mesh {} request aborted: {}", resource, e);
                RequestOutcome::Aborted(e)
            }
        };
        drop(guard);

        ctx.events.emit(match &outcome {
            RequestOutcome::Completed(summary) => {
                StreamingEvent::Finished { resource, kind, levels: summary.levels.clone() }
            }
            RequestOutcome::Cancelled => StreamingEvent::Cancelled { resource, kind },
            RequestOutcome::Aborted(e) => StreamingEvent::Aborted { resource, kind, reason: e.to_string() },
        });
        outcome
    });

    StreamingHandle::new(resource, control, join)
}

async fn run(
    ctx: &RequestContext,
    control: &Arc<RequestControl<MeshRequestState>>,
    mesh: &dyn MeshResource,
    lods: &[u8],
) -> Result<StreamingSummary> {
    // Init
    let graph = mesh.graph();
    if !mesh.is_valid() || !graph.is_valid() {
        log::debug!("Mesh {} or graph '{}' no longer valid", mesh.resource_id(), graph.name);
        return Err(Error::Cancelled);
    }
    control.checkpoint()?;

    let mut session = MeshSession::default();
    let backend = mesh.storage();
    let streamables = mesh.streamables();

    // RequestGeneration
    control.set_state(MeshRequestState::RequestGeneration);
    let instance = ctx.facade.create_instance(&graph, &mesh.parameters())?;
    let probe = control.probe();
    let component = mesh.component();
    let tasks: Vec<_> = lods
        .iter()
        .map(|&lod| {
            let address = ResourceAddress::mesh(component, lod);
            (lod, ctx.facade.request_resource_cancellable(&instance, address, probe.clone()))
        })
        .collect();
    session.instance = Some(instance);

    for (lod, task) in tasks {
        let generated = task.wait().await?;
        control.checkpoint()?;

        let generated = generated
            .into_mesh()
            .filter(|m| m.lod == lod)
            .ok_or_else(|| Error::IncompleteGeneration(format!("engine returned no mesh for LOD {}", lod)))?;
        log::debug!("Mesh {} LOD {} generated ({} vertices)", mesh.resource_id(), lod, generated.vertex_count());

        if let Some(mut transfer) = register_aux_blocks(&ctx.config, &mut session.data, &streamables, &backend, &generated)? {
            control.register_transfer(transfer.canceller());
            session.transfers.push(transfer.stream(&ctx.scheduler)?);
        }
        session.data.meshes.push(generated);
    }

    if let Some(instance) = session.instance.take() {
        ctx.facade.release_instance(instance);
    }

    let mut failed_blocks = 0;
    for transfer in std::mem::take(&mut session.transfers) {
        let report = transfer.wait().await;
        failed_blocks += report.failed;
    }
    control.checkpoint()?;

    // ConvertResources
    control.set_state(MeshRequestState::ConvertResources);
    let resident: Vec<Option<usize>> = session.data.meshes.iter().map(|m| mesh.section_count(m.lod)).collect();
    let data = std::mem::take(&mut session.data);
    let converted = ctx
        .scheduler
        .spawn_blocking(move || convert_operation_data(data, resident))
        .await
        .map_err(|e| Error::Generation(format!("mesh conversion failed: {}", e)))?;
    control.checkpoint()?;

    // The host is first touched here, so cancellation must already be settled
    let first_commit_stage = if converted.degenerate {
        MeshRequestState::MarkBuffersDirty
    } else {
        MeshRequestState::CreateBuffers
    };
    if !control.enter_irreversible(first_commit_stage) {
        return Err(Error::Cancelled);
    }
    if converted.degenerate {
        mesh.mark_buffers_dirty();
        control.set_state(MeshRequestState::CreateBuffers);
    }

    // CreateBuffers
    let levels = converted.buffers.lod_levels();
    mesh.create_buffers(converted.buffers);

    Ok(StreamingSummary {
        resource: mesh.resource_id(),
        levels,
        degraded_levels: converted.degraded,
        failed_blocks,
        buffers_marked_dirty: converted.degenerate,
    })
}

/// Queue the morph and clothing blocks a generated mesh references.
///
/// Each block id is requested once per session. Returns `None` when the
/// mesh references nothing new.
fn register_aux_blocks(
    config: &StreamingConfig,
    data: &mut OperationData,
    streamables: &ModelStreamables,
    backend: &StorageBackend,
    mesh: &GeneratedMesh,
) -> Result<Option<BlockTransfer>> {
    let mut transfer: Option<BlockTransfer> = None;

    for &raw in &mesh.streamed_resources {
        let Some(id) = StreamedResourceId::unpack(raw) else {
            log::error!("Invalid streamed resource id {:#x} in LOD {}", raw, mesh.lod);
            continue;
        };
        if !data.requested.insert(id) {
            continue;
        }

        let (entry, kind, element_size, clothing) = match id.kind {
            StreamedKind::RealTimeMorphTarget => {
                if !config.enable_realtime_morph_targets {
                    continue;
                }
                (streamables.morphs.get(&id.id), DataKind::RealTimeMorph, size_of::<MorphTargetVertex>(), None)
            }
            StreamedKind::Clothing => {
                if !config.enable_clothing {
                    continue;
                }
                let cloth = streamables.clothing.get(&id.id);
                (
                    cloth.map(|c| &c.entry),
                    DataKind::Clothing,
                    size_of::<ClothVertex>(),
                    cloth.map(|c| (c.asset_index, c.asset_lod)),
                )
            }
        };

        let Some(entry) = entry else {
            log::error!("No block descriptor for {:?}", id);
            continue;
        };
        let size = entry.size as usize;
        if size % element_size != 0 {
            log::error!("Block {:?} is {} bytes, not a multiple of its {}-byte element", id, size, element_size);
            continue;
        }

        let buffer = SharedBuffer::zeroed(size);
        transfer
            .get_or_insert_with(|| BlockTransfer::new(backend.clone()))
            .add_block(entry.block, kind, id.kind as u16, buffer.whole())?;

        match clothing {
            Some((asset_index, asset_lod)) => {
                data.clothing.insert(id.id, PendingClothing { asset_index, asset_lod, buffer });
            }
            None => {
                data.morphs.insert(id.id, buffer);
            }
        }
    }

    Ok(transfer)
}

fn convert_operation_data(data: OperationData, resident: Vec<Option<usize>>) -> ConvertedBuffers {
    let converted: Vec<_> = data
        .meshes
        .par_iter()
        .zip(resident.par_iter())
        .map(|(mesh, sections)| convert_mesh(mesh, *sections))
        .collect();

    let degenerate = converted.iter().any(|c| c.degenerate);
    let degraded = converted.iter().filter(|c| c.padded_attributes > 0).map(|c| c.render.lod).collect();

    let morphs = data
        .morphs
        .into_iter()
        .filter_map(|(id, buffer)| decode_records::<MorphTargetVertex>(&buffer.take()).map(|v| (id, v)))
        .collect();
    let clothing = data
        .clothing
        .into_iter()
        .filter_map(|(id, pending)| {
            decode_records::<ClothVertex>(&pending.buffer.take()).map(|vertices| {
                (id, ClothingBuffer { asset_index: pending.asset_index, asset_lod: pending.asset_lod, vertices })
            })
        })
        .collect();

    ConvertedBuffers {
        buffers: MeshBuffers { lods: converted.into_iter().map(|c| c.render).collect(), morphs, clothing },
        degenerate,
        degraded,
    }
}
