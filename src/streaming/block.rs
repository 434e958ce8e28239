//! Streamable block descriptors and the per-model descriptor table
//!
//! A block is a contiguous byte range inside one of the bulk-data files
//! produced at build time. Descriptors are immutable at runtime apart from
//! the one-bit "already prefetched" marker.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rkyv::{Archive, Deserialize, Serialize};

/// Block lives in an optional high-resolution bulk file
pub const FLAG_HIGH_RES: u16 = 1 << 0;

/// Byte range address inside a bulk-data file.
///
/// Wire form is 16 bytes, little-endian:
/// `file_id: u32 | flags: u16 | reserved: u16 (zero) | offset: u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamableBlock {
    pub file_id: u32,
    pub flags: u16,
    pub offset: u64,
}

impl StreamableBlock {
    /// Size of the encoded record
    pub const WIRE_SIZE: usize = 16;

    pub fn new(file_id: u32, flags: u16, offset: u64) -> Self {
        Self { file_id, flags, offset }
    }

    pub fn is_high_res(&self) -> bool {
        self.flags & FLAG_HIGH_RES != 0
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode one record. Returns `None` if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record = bytes.get(..Self::WIRE_SIZE)?;
        Some(Self {
            file_id: u32::from_le_bytes([record[0], record[1], record[2], record[3]]),
            flags: u16::from_le_bytes([record[4], record[5]]),
            offset: u64::from_le_bytes([
                record[8], record[9], record[10], record[11],
                record[12], record[13], record[14], record[15],
            ]),
        })
    }
}

/// One table entry: where the block lives and how large it is
#[derive(Debug)]
pub struct StreamableEntry {
    pub block: StreamableBlock,
    pub size: u32,
    prefetched: AtomicBool,
}

impl StreamableEntry {
    pub fn new(block: StreamableBlock, size: u32) -> Self {
        Self { block, size, prefetched: AtomicBool::new(false) }
    }

    pub fn is_prefetched(&self) -> bool {
        self.prefetched.load(Ordering::Acquire)
    }

    pub fn mark_prefetched(&self) {
        self.prefetched.store(true, Ordering::Release);
    }
}

/// Clothing block plus the clothing asset it belongs to
#[derive(Debug)]
pub struct ClothingStreamable {
    pub entry: StreamableEntry,
    pub asset_index: u32,
    pub asset_lod: u32,
}

/// Block-descriptor table owned by a resource's compiled metadata
#[derive(Debug, Default)]
pub struct ModelStreamables {
    /// Generation engine data blocks, keyed by engine block id
    pub model: HashMap<u64, StreamableEntry>,
    /// Real-time morph target deltas, keyed by block id
    pub morphs: HashMap<u32, StreamableEntry>,
    /// Clothing deltas, keyed by block id
    pub clothing: HashMap<u32, ClothingStreamable>,
}

impl ModelStreamables {
    pub fn block_count(&self) -> usize {
        self.model.len() + self.morphs.len() + self.clothing.len()
    }
}

// --- Persisted form ---

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
struct BlockRecord {
    key: u64,
    file_id: u32,
    flags: u16,
    offset: u64,
    size: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
struct ClothingRecord {
    block: BlockRecord,
    asset_index: u32,
    asset_lod: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
struct StreamablesData {
    model: Vec<BlockRecord>,
    morphs: Vec<BlockRecord>,
    clothing: Vec<ClothingRecord>,
}

impl BlockRecord {
    fn from_entry(key: u64, entry: &StreamableEntry) -> Self {
        Self {
            key,
            file_id: entry.block.file_id,
            flags: entry.block.flags,
            offset: entry.block.offset,
            size: entry.size,
        }
    }

    fn to_entry(&self) -> StreamableEntry {
        StreamableEntry::new(StreamableBlock::new(self.file_id, self.flags, self.offset), self.size)
    }
}

/// Serialize a descriptor table to bytes (uncompressed)
pub fn serialize_streamables(table: &ModelStreamables) -> Result<Vec<u8>, io::Error> {
    let mut data = StreamablesData {
        model: table.model.iter().map(|(k, e)| BlockRecord::from_entry(*k, e)).collect(),
        morphs: table.morphs.iter().map(|(k, e)| BlockRecord::from_entry(*k as u64, e)).collect(),
        clothing: table
            .clothing
            .iter()
            .map(|(k, c)| ClothingRecord {
                block: BlockRecord::from_entry(*k as u64, &c.entry),
                asset_index: c.asset_index,
                asset_lod: c.asset_lod,
            })
            .collect(),
    };
    // Stable output regardless of hash order
    data.model.sort_by_key(|r| r.key);
    data.morphs.sort_by_key(|r| r.key);
    data.clothing.sort_by_key(|r| r.block.key);

    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(bytes.to_vec())
}

/// Deserialize a descriptor table from bytes (uncompressed)
pub fn deserialize_streamables(data: &[u8]) -> Result<ModelStreamables, io::Error> {
    // rkyv needs aligned input
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(data);

    let archived = rkyv::access::<ArchivedStreamablesData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let data: StreamablesData = rkyv::deserialize::<StreamablesData, rkyv::rancor::Error>(archived)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let mut table = ModelStreamables::default();
    for record in &data.model {
        table.model.insert(record.key, record.to_entry());
    }
    for record in &data.morphs {
        table.morphs.insert(record.key as u32, record.to_entry());
    }
    for record in &data.clothing {
        table.clothing.insert(
            record.block.key as u32,
            ClothingStreamable {
                entry: record.block.to_entry(),
                asset_index: record.asset_index,
                asset_lod: record.asset_lod,
            },
        );
    }

    Ok(table)
}

/// Compress a serialized table using LZ4
pub fn compress_streamables(table: &ModelStreamables) -> Result<Vec<u8>, io::Error> {
    let serialized = serialize_streamables(table)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress and deserialize a table
pub fn decompress_streamables(data: &[u8]) -> Result<ModelStreamables, io::Error> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("LZ4 decompression failed: {}", e)))?;
    deserialize_streamables(&decompressed)
}

/// Save a table to disk (compressed)
pub async fn save_streamables(path: &Path, table: &ModelStreamables) -> Result<(), io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let compressed = compress_streamables(table)?;
    tokio::fs::write(path, compressed).await
}

/// Load a table from disk
pub async fn load_streamables(path: &Path) -> Result<ModelStreamables, io::Error> {
    let compressed = tokio::fs::read(path).await?;
    decompress_streamables(&compressed)
}
