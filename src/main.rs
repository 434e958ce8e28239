//! Streaming demo - generates a mesh LOD chain and a texture mip chain.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>   StreamingConfig JSON (default: built-in defaults)
//!   --lods <N>        LOD count of the demo mesh (default: 4)
//!   --size <PIXELS>   Demo texture size at mip 0 (default: 256)
//!
//! Bulk data is written to a temporary directory and removed afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use procgen_stream::core::{logging, Error, Result, StreamedKind, StreamedResourceId, StreamingConfig};
use procgen_stream::generation::{CompiledGraph, ParameterValue, Parameters, ProceduralEngine};
use procgen_stream::scheduler::Scheduler;
use procgen_stream::streaming::{
    load_streamables, save_streamables, HostMesh, HostTexture, LooseFileStorage, MipLayout, ModelStreamables,
    MorphTargetVertex, RequestOutcome, ResourceStreamer, SharedBuffer, StorageBackend, StorageLocation,
    StreamableBlock, StreamableEntry, DataKind,
};

const MORPH_BLOCK_ID: u32 = 1;
const MORPH_VERTICES: u32 = 128;

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_str_arg(&args, "--config") {
        Some(path) => match StreamingConfig::load_sync(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };
    let lods = parse_u8_arg(&args, "--lods").unwrap_or(4).max(1);
    let size = parse_u32_arg(&args, "--size").unwrap_or(256).max(1);

    let root = std::env::temp_dir().join(format!("procgen-stream-demo-{}", std::process::id()));
    let result = run(config, lods, size, &root);
    if let Err(e) = std::fs::remove_dir_all(&root) {
        log::debug!("Could not remove {}: {}", root.display(), e);
    }
    if let Err(e) = result {
        log::error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

/// Bulk data for the demo mesh: one block of morph deltas
fn write_bulk_data(root: &Path) -> Result<ModelStreamables> {
    let deltas: Vec<MorphTargetVertex> = (0..MORPH_VERTICES)
        .map(|i| MorphTargetVertex {
            position_delta: [0.0, (i as f32 * 0.05).sin() * 0.1, 0.0],
            tangent_z_delta: [0.0; 3],
            source_index: i,
        })
        .collect();
    let bytes: &[u8] = bytemuck::cast_slice(&deltas);
    LooseFileStorage::new(root).write_file(DataKind::RealTimeMorph, 0, bytes)?;

    let mut table = ModelStreamables::default();
    table
        .morphs
        .insert(MORPH_BLOCK_ID, StreamableEntry::new(StreamableBlock::new(0, 0, 0), bytes.len() as u32));
    Ok(table)
}

fn run(config: StreamingConfig, lods: u8, size: u32, root: &Path) -> Result<()> {
    let start = Instant::now();
    let scheduler = Arc::new(Scheduler::new(&config)?);

    let table_path: PathBuf = root.join("streamables.pgs");
    let table = scheduler.block_on(async {
        let table = write_bulk_data(root)?;
        save_streamables(&table_path, &table).await?;
        Ok::<_, Error>(load_streamables(&table_path).await?)
    })?;
    log::info!("Descriptor table: {} blocks", table.block_count());

    let engine = Arc::new(ProceduralEngine::new());
    engine.set_streamed_resources(0, vec![StreamedResourceId::new(StreamedKind::RealTimeMorphTarget, MORPH_BLOCK_ID).pack()]);

    let streamer = ResourceStreamer::new(scheduler.clone(), engine, config);
    let token = streamer.events().subscribe(|event| log::info!("{:?}", event));

    let backend = StorageBackend::resolve(&StorageLocation::External(root.to_path_buf()), None)?;
    let params = Parameters::new()
        .with("rings", ParameterValue::Int(64))
        .with("segments", ParameterValue::Int(96))
        .with("size", ParameterValue::Int(size as i32));

    let mesh = Arc::new(
        HostMesh::new(1, CompiledGraph::new(1, "demo_sphere", lods), params.clone(), backend.clone())
            .with_streamables(table),
    );
    let layout = MipLayout::full_chain(size, size, 4);
    let texture = Arc::new(HostTexture::new(2, CompiledGraph::new(2, "demo_noise", 1), params, layout, backend));
    let dest: Vec<SharedBuffer> =
        (0..layout.mip_count).map(|mip| SharedBuffer::zeroed(layout.level_size(mip))).collect();

    let mesh_handle = streamer.stream_mesh_lods(mesh.clone(), lods, 0)?;
    let texture_handle = streamer.stream_texture_mips(texture, layout.mip_count, 0, dest.clone())?;

    let (mesh_outcome, texture_outcome) =
        scheduler.block_on(async { (mesh_handle.wait().await, texture_handle.wait().await) });
    streamer.events().unsubscribe(token);

    report("mesh", &mesh_outcome);
    report("texture", &texture_outcome);
    for buffers in mesh.take_created() {
        for lod in &buffers.lods {
            println!(
                "  LOD {}: {} vertices, {} indices, {} sections",
                lod.lod,
                lod.vertices.len(),
                lod.indices.len(),
                lod.sections.len()
            );
        }
        println!("  morph blocks: {}", buffers.morphs.len());
    }
    let texture_bytes: usize = dest.iter().map(SharedBuffer::len).sum();
    println!("  texture: {} mips, {} bytes", layout.mip_count, texture_bytes);
    println!("Done in {:.1?}", start.elapsed());
    Ok(())
}

fn report(name: &str, outcome: &RequestOutcome) {
    match outcome {
        RequestOutcome::Completed(summary) => println!(
            "{}: levels {:?}, degraded {:?}, failed blocks {}",
            name, summary.levels, summary.degraded_levels, summary.failed_blocks
        ),
        RequestOutcome::Cancelled => println!("{}: cancelled", name),
        RequestOutcome::Aborted(e) => println!("{}: aborted ({})", name, e),
    }
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).cloned()
}

fn parse_u8_arg(args: &[String], flag: &str) -> Option<u8> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).and_then(|s| s.parse().ok())
}
