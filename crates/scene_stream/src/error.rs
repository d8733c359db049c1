//! Error type shared by every engine component.

use crate::residency::TileCoordinate;
use crate::streaming::TexId;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open tile source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tile pack error: {0}")]
    Pack(#[from] std::io::Error),

    #[error("device out of memory (requested {requested} bytes)")]
    OutOfDeviceMemory { requested: u64 },

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("unknown streamed image {0:?}")]
    UnknownImage(TexId),

    #[error("bindless slot {slot} out of range (max {max})")]
    BindlessSlotOutOfRange { slot: u32, max: u32 },

    #[error("tile {0:?} is outside the image mip chain")]
    InvalidTile(TileCoordinate),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
