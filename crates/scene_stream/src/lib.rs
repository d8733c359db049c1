// src/lib.rs
//! GPU scene-resource streaming engine.
//!
//! Manages GPU-resident acceleration structure inputs (ray-tracing instances, light
//! clusters) and sparse virtual texture tiles. Everything is built on one shared
//! pipeline:
//! - `staging`: per-frame bump allocation of host-visible upload memory.
//! - `upload`: coalescing of element writes into batched scatter copies.
//! - `dispose`: fence-gated deferred destruction of GPU resources.
//!
//! The engine records backend-neutral [`device::GpuCommand`]s; a [`device::GpuDevice`]
//! executes them. `SceneEngine` ties the pieces into one per-frame entry point.

pub mod config;
pub mod device;
pub mod dispose;
pub mod engine;
pub mod error;
pub mod instances;
pub mod lights;
pub mod metrics;
pub mod residency;
pub mod staging;
pub mod streaming;
pub mod table;
pub mod upload;

pub use self::config::{EngineConfig, StreamingConfig};
pub use self::engine::SceneEngine;
pub use self::error::{Error, Result};
pub use self::residency::TileCoordinate;
pub use self::streaming::{TexId, VirtualTextureStreamer};
