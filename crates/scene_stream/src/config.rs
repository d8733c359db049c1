//! Construction-time configuration. Nothing here can change once an engine exists.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Byte budget and eviction policy of the virtual texture streamer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Upper bound on bytes of tile heaps kept resident.
    ///
    /// When exceeded, unreferenced tiles are evicted in LRU order even if they are
    /// younger than `lru_frame`.
    pub memory_limit: u64,

    /// Images whose whole mip chain is at most this many bytes are "memoryless":
    /// cheap to reload, so their tiles age out after `lru_frame_memoryless`.
    pub memoryless_threshold: u64,

    /// Frames an unreferenced tile may stay resident before it is evicted.
    pub lru_frame: u64,

    /// Same as `lru_frame`, for tiles of memoryless images.
    pub lru_frame_memoryless: u64,

    /// Number of entries in the residency-level table (one per bindless slot).
    pub max_bindless_slots: u32,

    /// Maximum tile requests the background thread folds into one copy submission.
    pub worker_batch: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_limit: 512 * 1024 * 1024,    // 512 MiB
            memoryless_threshold: 256 * 1024, // 256 KiB
            lru_frame: 120,
            lru_frame_memoryless: 16,
            max_bindless_slots: 4096,
            worker_batch: 32,
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub streaming: StreamingConfig,

    /// Size of one host-visible staging chunk; larger uploads get a dedicated chunk.
    pub staging_chunk_size: u64,

    /// Frames the CPU may record ahead of the GPU. One staging allocator per frame.
    pub frames_in_flight: usize,

    /// Initial element capacity of the instance buffers.
    pub initial_instance_capacity: u32,

    /// Initial element capacity of each light type buffer.
    pub initial_light_capacity: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            staging_chunk_size: 4 * 1024 * 1024, // 4 MiB
            frames_in_flight: 2,
            initial_instance_capacity: 256,
            initial_light_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config; missing keys keep their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_json_str(&text)
    }
}
