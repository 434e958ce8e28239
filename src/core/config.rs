//! Streaming configuration

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;

/// Runtime switches for the streaming pipeline.
///
/// Missing JSON fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Worker threads for the background pool (0 = runtime default)
    pub worker_threads: usize,
    /// Allow generated meshes to stream LODs
    pub stream_mesh_lods: bool,
    /// Stream real-time morph target deltas referenced by generated meshes
    pub enable_realtime_morph_targets: bool,
    /// Stream clothing deltas referenced by generated meshes
    pub enable_clothing: bool,
    /// Prefetch high-value engine blocks before requesting mips
    pub enable_mip_prefetch: bool,
    /// Copy already-resident mips instead of regenerating them
    pub skip_generate_resident_mips: bool,
    /// Entries kept by the in-memory content-addressed cache
    pub cache_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            stream_mesh_lods: true,
            enable_realtime_morph_targets: true,
            enable_clothing: true,
            enable_mip_prefetch: true,
            skip_generate_resident_mips: true,
            cache_capacity: 256,
        }
    }
}

impl StreamingConfig {
    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }
}
