//! `run`: drives a `SceneEngine` with synthetic scene churn and random tile feedback.

use crate::cli::{Backend, RunArgs};
use anyhow::{Context, Result};
use glam::{Affine3A, Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scene_stream::device::{GpuDevice, HostDevice};
use scene_stream::instances::{InstanceId, MeshRef};
use scene_stream::lights::{PointLight, SpotLight};
use scene_stream::streaming::TileSourceDesc;
use scene_stream::{EngineConfig, SceneEngine, TexId, TileCoordinate};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use vtpack::{PackDesc, TexelFormat};
use walkdir::WalkDir;

fn open_device(backend: Backend) -> Result<Arc<dyn GpuDevice>> {
    Ok(match backend {
        Backend::Host => Arc::new(HostDevice::new()),
        Backend::Wgpu => {
            let device = scene_stream::device::WgpuDevice::new_headless()
                .context("failed to create a headless wgpu device")?;
            Arc::new(device)
        }
    })
}

fn find_packs(dir: &Path) -> Vec<PathBuf> {
    let mut packs: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|x| x.eq_ignore_ascii_case("vtpk")))
        .map(|e| e.into_path())
        .collect();
    packs.sort();
    packs
}

/// Procedural 1024x1024 RGBA8 image; texels encode their tile coordinate.
fn synthetic_source(seed: u8) -> TileSourceDesc {
    let desc = PackDesc {
        width: 1024,
        height: 1024,
        mip_levels: PackDesc::full_mip_count(1024, 1024),
        format: TexelFormat::Rgba8,
        tile_width: 128,
        tile_height: 128,
    };
    TileSourceDesc::callback(desc, move |c, out| {
        for px in out.chunks_exact_mut(4) {
            px.copy_from_slice(&[c.x as u8, c.y as u8, c.level as u8 ^ seed, 255]);
        }
        Ok(())
    })
}

fn random_transform(rng: &mut StdRng) -> Affine3A {
    let t = Vec3::new(
        rng.gen_range(-100.0..100.0),
        rng.gen_range(0.0..20.0),
        rng.gen_range(-100.0..100.0),
    );
    Affine3A::from_rotation_translation(Quat::from_rotation_y(rng.gen_range(0.0..std::f32::consts::TAU)), t)
}

fn random_tile(rng: &mut StdRng, desc: &PackDesc) -> TileCoordinate {
    // Bias towards coarse levels, like distance-based feedback would.
    let level = (rng.gen_range(0.0f32..1.0).powi(2) * desc.mip_levels as f32) as u16;
    let level = level.min(desc.mip_levels - 1);
    let (tx, ty) = desc.mip_grid(level);
    TileCoordinate::new(rng.gen_range(0..tx), rng.gen_range(0..ty), level)
}

pub fn run(args: &RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    tracing::info!(config = ?config, backend = ?args.backend, "vt_bench starting");

    let device = open_device(args.backend)?;
    let mut engine = SceneEngine::new(device, config.clone())?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    // --- images ---
    let mut images: Vec<(TexId, PackDesc)> = Vec::new();
    let mut slot = 0u32;
    let sources = find_packs(&args.dir)
        .into_iter()
        .map(|p| (p.display().to_string(), TileSourceDesc::Path(p)))
        .chain((0..args.synthetic_images).map(|i| (format!("synthetic #{i}"), synthetic_source(i as u8))));
    for (name, source) in sources {
        if slot >= config.streaming.max_bindless_slots {
            tracing::warn!(max = config.streaming.max_bindless_slots, "out of bindless slots; remaining images skipped");
            break;
        }
        match engine.load_sparse_image(source, slot, None) {
            Ok(id) => {
                let desc = engine.streamer().desc(id).context("image vanished after load")?;
                images.push((id, desc));
                slot += 1;
            }
            Err(e) => tracing::warn!(image = %name, error = %e, "image skipped"),
        }
    }
    if images.is_empty() {
        tracing::warn!(dir = %args.dir.display(), "no images to stream; only scene churn is measured");
    }

    // --- scene ---
    let mut instances: Vec<InstanceId> = (0..args.instances)
        .map(|i| {
            engine.emplace_mesh_instance(
                MeshRef { blas: 1 + (i % 16) as u64 },
                random_transform(&mut rng),
                0xff,
                i % 3 != 0,
                &[i % 64],
                i,
            )
        })
        .collect::<scene_stream::Result<_>>()?;

    for i in 0..args.lights {
        let position = random_transform(&mut rng).translation.into();
        if i % 4 == 0 {
            engine.emplace_light(
                SpotLight {
                    position,
                    direction: Vec3::NEG_Y,
                    radius: 0.25,
                    angle: 0.6,
                    radiance: Vec3::splat(40.0),
                },
                i,
            )?;
        } else {
            engine.emplace_light(
                PointLight {
                    position,
                    radius: rng.gen_range(0.1..1.0),
                    radiance: Vec3::splat(10.0),
                },
                i,
            )?;
        }
    }

    // --- frames ---
    let mut held: VecDeque<(u64, TexId, TileCoordinate)> = VecDeque::new();
    let mut next_user_id = args.instances;
    let start = Instant::now();

    for frame in 0..args.frames {
        // Move a few percent of the instances; occasionally replace one.
        for _ in 0..(instances.len() / 32).max(1) {
            if instances.is_empty() {
                break;
            }
            let id = instances[rng.gen_range(0..instances.len())];
            engine.set_transform(id, random_transform(&mut rng), false);
        }
        if frame % 10 == 0 && !instances.is_empty() {
            let victim = instances.swap_remove(rng.gen_range(0..instances.len()));
            engine.remove_instance(victim);
            instances.push(engine.emplace_mesh_instance(
                MeshRef { blas: 1 },
                random_transform(&mut rng),
                0xff,
                true,
                &[],
                next_user_id,
            )?);
            next_user_id += 1;
        }

        // Tile feedback: reference new tiles, drop the ones held long enough.
        while held.front().is_some_and(|(f, _, _)| frame >= f + args.hold) {
            if let Some((_, id, coord)) = held.pop_front() {
                engine.release_tiles(id, &[coord])?;
            }
        }
        if !images.is_empty() {
            for _ in 0..args.feedback {
                let (id, desc) = images[rng.gen_range(0..images.len())];
                let coord = random_tile(&mut rng, &desc);
                engine.request_tiles(id, &[coord])?;
                held.push_back((frame, id, coord));
            }
        }

        let list = engine.before_rendering()?;
        engine.submit_frame(list);

        if frame % 100 == 0 {
            tracing::debug!(
                frame,
                allocated = engine.streamer().allocated_size(),
                resident = engine.streamer().resident_tiles(),
                "progress"
            );
        }
    }

    engine.force_sync();
    let elapsed = start.elapsed();

    let m = engine.metrics();
    tracing::info!(
        frames = args.frames,
        elapsed_ms = elapsed.as_millis() as u64,
        fps = args.frames as f64 / elapsed.as_secs_f64().max(1e-9),
        images = images.len(),
        instances = engine.instances().len(),
        lights = engine.lights().len(),
        allocated = engine.streamer().allocated_size(),
        resident = engine.streamer().resident_tiles(),
        loaded = m.tiles_loaded_total.get(),
        failed = m.tile_load_failures_total.get(),
        evicted = m.tiles_evicted_total.get(),
        budget_evictions = m.budget_evictions_total.get(),
        uploaded = m.upload_bytes_total.get(),
        reclaimed = m.reclaimed_total.get(),
        "run finished"
    );

    if args.metrics {
        print!("{}", m.encode_text()?);
    }
    Ok(())
}
