//! Engine metrics in a private prometheus registry, rendered as text on demand.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus counters and gauges of one engine. Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct StreamMetrics {
    pub registry: Registry,
    pub tiles_loaded_total: IntCounter,
    pub tile_load_failures_total: IntCounter,
    pub tiles_evicted_total: IntCounter,
    pub budget_evictions_total: IntCounter,
    pub upload_bytes_total: IntCounter,
    pub reclaimed_total: IntCounter,
    pub allocated_bytes: IntGauge,
    pub resident_tiles: IntGauge,
    pub instances: IntGauge,
    pub lights: IntGauge,
}

impl StreamMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("scene_stream".into()), None)?;

        macro_rules! reg {
            ($kind:ident, $name:expr, $help:expr) => {{
                let m = $kind::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(m.clone()))?;
                m
            }};
        }

        Ok(Self {
            tiles_loaded_total: reg!(IntCounter, "tiles_loaded_total", "Tiles made resident"),
            tile_load_failures_total: reg!(IntCounter, "tile_load_failures_total", "Tile loads that failed and were reverted"),
            tiles_evicted_total: reg!(IntCounter, "tiles_evicted_total", "Tiles unloaded for any reason"),
            budget_evictions_total: reg!(IntCounter, "budget_evictions_total", "Tiles unloaded to get back under the memory limit"),
            upload_bytes_total: reg!(IntCounter, "upload_bytes_total", "Bytes packed into staging by the upload batcher"),
            reclaimed_total: reg!(IntCounter, "reclaimed_total", "Values destroyed by the deferred reclamation queue"),
            allocated_bytes: reg!(IntGauge, "allocated_bytes", "Bytes of resident tile heaps"),
            resident_tiles: reg!(IntGauge, "resident_tiles", "Resident tiles over all streamed images"),
            instances: reg!(IntGauge, "instances", "Live ray-tracing instances"),
            lights: reg!(IntGauge, "lights", "Live lights over all clusters"),
            registry,
        })
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
