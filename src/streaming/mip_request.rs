//! Mip Streaming Request
//!
//! `GetMips` copies mips the texture already has and, for the rest, issues
//! one image request (after optionally prefetching engine data blocks).
//! `PollMips` waits for the image, then writes every level into the
//! destination buffers. The write cannot be cancelled; until it starts the
//! buffers are untouched. A chain shorter than expected is zero-filled, not
//! fatal. Cancelled and aborted requests pass through `CleanUp`.

use std::sync::Arc;

use crate::core::{Error, Result};
use crate::streaming::buffer::{BufferView, SharedBuffer};
use crate::streaming::events::{RequestKind, StreamingEvent};
use crate::streaming::flight::FlightGuard;
use crate::streaming::request::{RequestContext, RequestControl, RequestOutcome, StreamingHandle, StreamingSummary};
use crate::streaming::resource::TextureResource;
use crate::streaming::storage::DataKind;
use crate::streaming::transfer::BlockTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipRequestState {
    Init,
    GetMips,
    PollMips,
    CleanUp,
    Done,
    Cancelled,
}

/// Copy `src` into a mip buffer, warning when the sizes disagree
fn copy_level(mip: u8, src: &[u8], dest: &BufferView) {
    if src.len() != dest.len() {
        log::warn!(
            "Mip {}: {}",
            mip,
            Error::SizeMismatch { expected: dest.len(), actual: src.len() }
        );
    }
    dest.write(src);
}

/// Spawn the request. `dest[i]` receives mip `requested_first + i`.
pub(crate) fn start(
    ctx: RequestContext,
    texture: Arc<dyn TextureResource>,
    resident_first: u8,
    requested_first: u8,
    dest: Vec<SharedBuffer>,
    guard: FlightGuard,
) -> StreamingHandle<MipRequestState> {
    let resource = texture.resource_id();
    let control = RequestControl::new(MipRequestState::Init);
    let task_control = control.clone();
    let scheduler = ctx.scheduler.clone();

    let join = scheduler.spawn(async move {
        let kind = RequestKind::TextureMips;
        ctx.events.emit(StreamingEvent::Started { resource, kind });

        let result = run(&ctx, &task_control, texture.as_ref(), resident_first, requested_first, &dest).await;

        let outcome = match result {
            Ok(summary) => {
                task_control.set_state(MipRequestState::Done);
                log::info!("Texture {} streamed mips {:?}", resource, summary.levels);
                RequestOutcome::Completed(summary)
            }
            Err(e) if e.is_cancelled() => {
                task_control.set_state(MipRequestState::CleanUp);
                task_control.set_state(MipRequestState::Cancelled);
                log::debug!("Texture {} request cancelled", resource);
                RequestOutcome::Cancelled
            }
            Err(e) => {
                task_control.set_state(MipRequestState::CleanUp);
                task_control.set_state(MipRequestState::Cancelled);
                log::warn!("Texture {} request aborted: {}", resource, e);
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
    control: &Arc<RequestControl<MipRequestState>>,
    texture: &dyn TextureResource,
    resident_first: u8,
    requested_first: u8,
    dest: &[SharedBuffer],
) -> Result<StreamingSummary> {
    // Init
    let graph = texture.graph();
    if !texture.is_valid() || !graph.is_valid() {
        log::debug!("Texture {} or graph '{}' no longer valid", texture.resource_id(), graph.name);
        return Err(Error::Cancelled);
    }
    control.checkpoint()?;

    let mut summary = StreamingSummary { resource: texture.resource_id(), ..Default::default() };
    let views: Vec<(u8, BufferView)> =
        dest.iter().enumerate().map(|(i, buffer)| (requested_first + i as u8, buffer.whole())).collect();

    // GetMips
    control.set_state(MipRequestState::GetMips);
    let mut resident = Vec::new();
    let mut missing = Vec::new();
    for (mip, view) in views {
        let bytes = if mip >= resident_first && ctx.config.skip_generate_resident_mips {
            texture.resident_mip(mip)
        } else {
            None
        };
        match bytes {
            Some(bytes) => resident.push((mip, view, bytes)),
            None => missing.push((mip, view)),
        }
    }
    control.checkpoint()?;

    let mut image = None;
    if let Some(&(first_missing, _)) = missing.first() {
        if ctx.config.enable_mip_prefetch {
            summary.failed_blocks = prefetch(ctx, control, texture, requested_first).await?;
        }

        let instance = ctx.facade.create_instance(&graph, &texture.parameters())?;
        let address = texture.address().with_lod(first_missing);
        let task = ctx.facade.request_resource_cancellable(&instance, address, control.probe());

        // PollMips
        control.set_state(MipRequestState::PollMips);
        image = match task.wait().await {
            Ok(resource) => resource.into_image(),
            Err(Error::IncompleteGeneration(reason)) => {
                log::warn!("Texture {}: {}", texture.resource_id(), reason);
                None
            }
            Err(e) => return Err(e),
        };
        ctx.facade.release_instance(instance);
    }

    // Destination buffers are only written once cancellation can no longer win
    if !control.enter_irreversible(MipRequestState::PollMips) {
        return Err(Error::Cancelled);
    }

    for (mip, view, bytes) in &resident {
        copy_level(*mip, bytes, view);
        summary.levels.push(*mip);
    }
    for (mip, view) in &missing {
        let level = image.as_ref().and_then(|img| img.mips.get(mip.checked_sub(img.first_mip)? as usize));
        match level {
            Some(bytes) => copy_level(*mip, bytes, view),
            None => {
                log::warn!("Texture {} mip {} not generated, zero-filling", texture.resource_id(), mip);
                view.fill_zero();
                summary.degraded_levels.push(*mip);
            }
        }
        summary.levels.push(*mip);
    }

    Ok(summary)
}

/// Stream model blocks the engine will need and hand them over before the
/// image request. Returns the number of blocks that failed to load.
async fn prefetch(
    ctx: &RequestContext,
    control: &Arc<RequestControl<MipRequestState>>,
    texture: &dyn TextureResource,
    first_mip: u8,
) -> Result<usize> {
    let streamables = texture.streamables();
    let mut transfer = BlockTransfer::new(texture.storage());
    let mut blocks = Vec::new();

    for id in texture.prefetch_blocks(first_mip) {
        let Some(entry) = streamables.model.get(&id) else {
            log::error!("Prefetch block {} has no descriptor", id);
            continue;
        };
        if entry.is_prefetched() {
            continue;
        }
        let buffer = SharedBuffer::zeroed(entry.size as usize);
        transfer.add_block(entry.block, DataKind::Model, 0, buffer.whole())?;
        blocks.push((id, buffer));
    }

    if blocks.is_empty() {
        return Ok(0);
    }

    control.register_transfer(transfer.canceller());
    let report = transfer.stream(&ctx.scheduler)?.wait().await;
    control.checkpoint()?;

    if report.failed > 0 {
        log::warn!("{} of {} prefetch blocks failed, engine will load them itself", report.failed, report.blocks);
    }

    // Blocks land in registration order; zero-filled ones are not handed over
    for (index, (id, buffer)) in blocks.into_iter().enumerate() {
        if !report.has_landed(index) {
            continue;
        }
        drop(ctx.facade.preload_block(id, Arc::from(buffer.take())));
        if let Some(entry) = streamables.model.get(&id) {
            entry.mark_prefetched();
        }
    }
    log::debug!(
        "Prefetched {} of {} blocks for texture {}",
        report.landed.len(),
        report.blocks,
        texture.resource_id()
    );
    Ok(report.failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StreamingConfig;
    use crate::generation::{CompiledGraph, ParameterValue, Parameters, ProceduralEngine};
    use crate::scheduler::Scheduler;
    use crate::streaming::block::{ModelStreamables, StreamableBlock, StreamableEntry};
    use crate::streaming::lod::MipLayout;
    use crate::streaming::resource::HostTexture;
    use crate::streaming::storage::{LooseFileStorage, StorageBackend};
    use crate::streaming::streamer::ResourceStreamer;

    const SIZE: u32 = 32;

    struct Fixture {
        _dir: tempfile::TempDir,
        scheduler: Arc<Scheduler>,
        engine: Arc<ProceduralEngine>,
        layout: MipLayout,
        backend: StorageBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            LooseFileStorage::new(dir.path()).write_file(DataKind::Model, 0, &[0x5A; 256]).unwrap();
            Self {
                scheduler: Arc::new(Scheduler::with_current_runtime().unwrap()),
                engine: Arc::new(ProceduralEngine::new()),
                layout: MipLayout::full_chain(SIZE, SIZE, 4),
                backend: StorageBackend::bulk(Arc::new(LooseFileStorage::new(dir.path()))),
                _dir: dir,
            }
        }

        fn streamer(&self, config: StreamingConfig) -> ResourceStreamer {
            ResourceStreamer::new(self.scheduler.clone(), self.engine.clone(), config)
        }

        fn texture(&self, id: u64) -> Arc<HostTexture> {
            let mut table = ModelStreamables::default();
            table.model.insert(11, StreamableEntry::new(StreamableBlock::new(0, 0, 0), 64));
            table.model.insert(12, StreamableEntry::new(StreamableBlock::new(0, 0, 64), 64));
            // Bulk file 7 is never written
            table.model.insert(13, StreamableEntry::new(StreamableBlock::new(7, 0, 0), 64));
            let params = Parameters::new().with("size", ParameterValue::Int(SIZE as i32));
            Arc::new(
                HostTexture::new(id, CompiledGraph::new(2, "skin", 1), params, self.layout, self.backend.clone())
                    .with_streamables(table),
            )
        }

        /// One sentinel-filled buffer per mip from `first`
        fn dest(&self, first: u8) -> Vec<SharedBuffer> {
            (first..self.layout.mip_count)
                .map(|mip| SharedBuffer::from_vec(vec![0xFF; self.layout.level_size(mip)]))
                .collect()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resident_mips_copied_missing_generated() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig::default());
        let texture = fx.texture(1);
        for mip in 2..fx.layout.mip_count {
            texture.set_resident_mip(mip, vec![mip; fx.layout.level_size(mip)]);
        }
        let dest = fx.dest(0);

        let outcome = streamer.stream_texture_mips(texture.clone(), 2, 0, dest.clone()).unwrap().wait().await;
        let summary = outcome.summary().cloned().unwrap();
        assert!(summary.degraded_levels.is_empty());
        assert_eq!(summary.levels.len(), fx.layout.mip_count as usize);

        // One engine call, for the chain starting at mip 0
        let calls = fx.engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.lod, 0);

        assert_eq!(dest[3].to_vec(), vec![3; fx.layout.level_size(3)]);
        assert!(dest[0].to_vec().iter().any(|&b| b != 0xFF));
        assert_eq!(dest[1].len(), fx.layout.level_size(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_chain_zero_fills_and_completes() {
        let fx = Fixture::new();
        fx.engine.limit_mips(1);
        let streamer = fx.streamer(StreamingConfig::default());
        let texture = fx.texture(1);
        let dest = fx.dest(0);

        let outcome = streamer
            .stream_texture_mips(texture, fx.layout.mip_count, 0, dest.clone())
            .unwrap()
            .wait()
            .await;
        let summary = outcome.summary().cloned().unwrap();
        let expected: Vec<u8> = (1..fx.layout.mip_count).collect();
        assert_eq!(summary.degraded_levels, expected);
        for buffer in &dest[1..] {
            assert!(buffer.to_vec().iter().all(|&b| b == 0));
        }
        assert!(dest[0].to_vec().iter().any(|&b| b != 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_regenerates_resident_mips_when_configured() {
        let fx = Fixture::new();
        let config = StreamingConfig { skip_generate_resident_mips: false, ..Default::default() };
        let streamer = fx.streamer(config);
        let texture = fx.texture(1);
        texture.set_resident_mip(1, vec![1; fx.layout.level_size(1)]);
        let dest = fx.dest(0);

        streamer.stream_texture_mips(texture, 1, 0, dest.clone()).unwrap().wait().await;
        assert_ne!(dest[1].to_vec(), vec![1; fx.layout.level_size(1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_skips_already_prefetched_blocks() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig::default());
        let texture = fx.texture(1);
        texture.set_prefetch_blocks(vec![11, 12, 99]);
        texture.streamables().model[&12].mark_prefetched();

        let outcome = streamer.stream_texture_mips(texture.clone(), 6, 4, fx.dest(4)).unwrap().wait().await;
        assert!(outcome.is_completed());
        assert_eq!(fx.engine.preloaded(), vec![11]);
        assert!(texture.streamables().model[&11].is_prefetched());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_hands_over_blocks_that_landed() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig::default());
        let texture = fx.texture(1);
        texture.set_prefetch_blocks(vec![11, 13]);

        let outcome = streamer.stream_texture_mips(texture.clone(), 6, 4, fx.dest(4)).unwrap().wait().await;
        let summary = outcome.summary().cloned().unwrap();
        assert_eq!(summary.failed_blocks, 1);
        assert_eq!(fx.engine.preloaded(), vec![11]);
        assert!(texture.streamables().model[&11].is_prefetched());
        assert!(!texture.streamables().model[&13].is_prefetched());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_disabled() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig { enable_mip_prefetch: false, ..Default::default() });
        let texture = fx.texture(1);
        texture.set_prefetch_blocks(vec![11]);

        streamer.stream_texture_mips(texture.clone(), 6, 4, fx.dest(4)).unwrap().wait().await;
        assert!(fx.engine.preloaded().is_empty());
        assert!(!texture.streamables().model[&11].is_prefetched());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_leaves_destination_untouched() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig { enable_mip_prefetch: false, ..Default::default() });
        let texture = fx.texture(1);
        let dest = fx.dest(0);

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        drop(fx.scheduler.compute_lane().submit(move || {
            let _ = rx.recv();
        }));
        let handle = streamer.stream_texture_mips(texture, fx.layout.mip_count, 0, dest.clone()).unwrap();
        assert!(handle.cancel());
        tx.send(()).unwrap();

        assert!(matches!(handle.wait().await, RequestOutcome::Cancelled));
        assert!(fx.engine.calls().is_empty());
        assert!(dest.iter().all(|b| b.to_vec().iter().all(|&x| x == 0xFF)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recompile_mid_session_aborts_without_writes() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig { enable_mip_prefetch: false, ..Default::default() });
        let texture = fx.texture(1);
        let dest = fx.dest(0);

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        drop(fx.scheduler.compute_lane().submit(move || {
            let _ = rx.recv();
        }));
        let handle = streamer.stream_texture_mips(texture.clone(), fx.layout.mip_count, 0, dest.clone()).unwrap();
        while fx.engine.live_instances() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        texture.graph().recompile();
        tx.send(()).unwrap();

        match handle.wait().await {
            RequestOutcome::Aborted(Error::InstanceInvalidated) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fx.engine.calls().is_empty());
        assert!(dest.iter().all(|b| b.to_vec().iter().all(|&x| x == 0xFF)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_distinct_textures_do_not_cross() {
        let fx = Fixture::new();
        let streamer = fx.streamer(StreamingConfig::default());
        let a = fx.texture(1);
        let b = fx.texture(2);
        a.set_resident_mip(5, vec![0xA0; 4]);
        b.set_resident_mip(5, vec![0xB0; 4]);
        let dest_a = fx.dest(5);
        let dest_b = fx.dest(5);

        let ha = streamer.stream_texture_mips(a, 5, 5, dest_a.clone()).unwrap();
        let hb = streamer.stream_texture_mips(b, 5, 5, dest_b.clone()).unwrap();
        assert!(ha.wait().await.is_completed());
        assert!(hb.wait().await.is_completed());
        assert_eq!(dest_a[0].to_vec(), vec![0xA0; 4]);
        assert_eq!(dest_b[0].to_vec(), vec![0xB0; 4]);
    }
}
