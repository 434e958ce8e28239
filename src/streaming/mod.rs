//! Asynchronous streaming of generated meshes and textures
//!
//! Bottom up: block descriptors and destination buffers, storage backends,
//! block transfer, then the mesh and mip requests driven by
//! `ResourceStreamer`.

pub mod block;
pub mod buffer;
pub mod storage;
pub mod cache;
pub mod transfer;
pub mod lod;
pub mod convert;
pub mod resource;
pub mod request;
pub mod flight;
pub mod events;
pub mod mesh_request;
pub mod mip_request;
pub mod streamer;

pub use block::{
    ClothingStreamable, ModelStreamables, StreamableBlock, StreamableEntry, FLAG_HIGH_RES,
    compress_streamables, decompress_streamables, load_streamables, save_streamables,
};
pub use buffer::{BufferView, SharedBuffer};
pub use storage::{
    BulkStorage, DataKind, LooseFileStorage, OpenFileRegistry, PackagedArchiveStorage, StorageBackend,
    StorageFile, StorageLocation, bulk_file_path,
};
pub use cache::{CacheKey, ContentCache, MemoryContentCache, ValueId};
pub use transfer::{BlockTransfer, TransferCanceller, TransferReport, TransferTask};
pub use lod::{MipLayout, lods_to_generate, mip_byte_size, mip_extent};
pub use convert::{ClothVertex, IndexBuffer, MorphTargetVertex, RenderLod, RenderSection, RenderVertex, convert_mesh};
pub use resource::{ClothingBuffer, HostMesh, HostTexture, MeshBuffers, MeshResource, TextureResource};
pub use request::{RequestControl, RequestOutcome, StreamingHandle, StreamingSummary};
pub use flight::{FlightGuard, InFlightRegistry};
pub use events::{ObserverToken, RequestKind, StreamingEvent, StreamingEvents};
pub use mesh_request::MeshRequestState;
pub use mip_request::MipRequestState;
pub use streamer::ResourceStreamer;
