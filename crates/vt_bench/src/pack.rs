//! `pack`: builds a box-filtered mip chain and cuts it into VTPK tiles.

use crate::cli::PackArgs;
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::time::Instant;
use vtpack::{PackDesc, TexelFormat};

const BPT: usize = 4;

struct Level {
    width: u32,
    height: u32,
    texels: Vec<u8>,
}

pub fn pack(args: &PackArgs) -> Result<()> {
    let start = Instant::now();
    if args.width == 0 || args.height == 0 || args.tile == 0 {
        bail!("width, height and tile must be non-zero");
    }

    let base = if args.synthetic {
        synthetic(args.width, args.height)
    } else {
        let input = args.input.as_ref().context("--input is required without --synthetic")?;
        let texels = std::fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
        let expected = args.width as usize * args.height as usize * BPT;
        if texels.len() != expected {
            bail!(
                "{} has {} bytes, expected {} for {}x{} RGBA8",
                input.display(),
                texels.len(),
                expected,
                args.width,
                args.height
            );
        }
        texels
    };

    let full = PackDesc::full_mip_count(args.width, args.height);
    let desc = PackDesc {
        width: args.width,
        height: args.height,
        mip_levels: if args.levels == 0 { full } else { args.levels.min(full) },
        format: TexelFormat::Rgba8,
        tile_width: args.tile,
        tile_height: args.tile,
    };

    let mut chain = vec![Level {
        width: args.width,
        height: args.height,
        texels: base,
    }];
    for level in 1..desc.mip_levels {
        let (w, h) = desc.level_extent(level);
        let next = downsample(&chain[chain.len() - 1], w, h);
        chain.push(next);
    }

    let mut tiles = Vec::with_capacity(desc.tile_count());
    for (level, lvl) in chain.iter().enumerate() {
        let (tx, ty) = desc.mip_grid(level as u16);
        let cut: Vec<Vec<u8>> = (0..tx * ty)
            .into_par_iter()
            .map(|i| vtpack::cut_tile(&desc, &lvl.texels, lvl.width, lvl.height, i % tx, i / tx))
            .collect();
        tiles.extend(cut);
    }

    vtpack::write_file(&args.output, &desc, &tiles, args.compress)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    tracing::info!(
        output = %args.output.display(),
        width = desc.width,
        height = desc.height,
        levels = desc.mip_levels,
        tiles = tiles.len(),
        compress = args.compress,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "pack written"
    );
    Ok(())
}

/// 2x2 box filter into a `width` x `height` level; odd edges clamp.
fn downsample(src: &Level, width: u32, height: u32) -> Level {
    let mut texels = vec![0u8; width as usize * height as usize * BPT];
    let sw = src.width as usize;

    texels
        .par_chunks_mut(width as usize * BPT)
        .enumerate()
        .for_each(|(y, row)| {
            let y0 = (y * 2).min(src.height as usize - 1);
            let y1 = (y * 2 + 1).min(src.height as usize - 1);
            for x in 0..width as usize {
                let x0 = (x * 2).min(sw - 1);
                let x1 = (x * 2 + 1).min(sw - 1);
                for c in 0..BPT {
                    let sum: u32 = [(x0, y0), (x1, y0), (x0, y1), (x1, y1)]
                        .iter()
                        .map(|&(sx, sy)| src.texels[(sy * sw + sx) * BPT + c] as u32)
                        .sum();
                    row[x * BPT + c] = ((sum + 2) / 4) as u8;
                }
            }
        });

    Level { width, height, texels }
}

/// Checkerboard over a colour gradient; alpha is opaque.
fn synthetic(width: u32, height: u32) -> Vec<u8> {
    let mut texels = vec![0u8; width as usize * height as usize * BPT];
    texels
        .par_chunks_mut(width as usize * BPT)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let check = ((x / 32) + (y / 32)) % 2 == 0;
                let px = &mut row[x * BPT..x * BPT + BPT];
                px[0] = (x * 255 / width.max(1) as usize) as u8;
                px[1] = (y * 255 / height.max(1) as usize) as u8;
                px[2] = if check { 224 } else { 32 };
                px[3] = 255;
            }
        });
    texels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_averages_quads() {
        let src = Level {
            width: 2,
            height: 2,
            texels: vec![
                0, 0, 0, 255, 100, 0, 0, 255, //
                0, 200, 0, 255, 0, 0, 40, 255,
            ],
        };
        let out = downsample(&src, 1, 1);
        assert_eq!(out.texels, vec![25, 50, 10, 255]);
    }

    #[test]
    fn odd_edges_clamp() {
        let src = Level {
            width: 3,
            height: 1,
            texels: vec![10, 10, 10, 10, 20, 20, 20, 20, 90, 90, 90, 90],
        };
        let out = downsample(&src, 1, 1);
        assert_eq!(out.texels, vec![15; 4]);
    }

    #[test]
    fn synthetic_pack_round_trips_through_reader() {
        let output = std::env::temp_dir().join(format!("vt_bench_pack_{}.vtpk", std::process::id()));
        let args = PackArgs {
            input: None,
            synthetic: true,
            width: 96,
            height: 64,
            tile: 32,
            levels: 0,
            compress: true,
            output: output.clone(),
        };
        pack(&args).unwrap();

        let pack = vtpack::VtPack::open(&output).unwrap();
        assert_eq!(pack.desc().mip_levels, 7);
        assert_eq!(pack.desc().tile_count(), 6 + 2 + 1 + 1 + 1 + 1 + 1);

        let tile = pack.read_tile(0, 0, 0).unwrap();
        assert_eq!(tile.len(), 32 * 32 * 4);
        assert_eq!(&tile[..4], &synthetic(96, 64)[..4]);

        let _ = std::fs::remove_file(output);
    }
}
