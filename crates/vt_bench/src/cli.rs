use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// `vt_bench` - packs textures into VTPK tile containers and drives the scene
/// streaming engine against them.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a raw RGBA8 image (or a generated one) into a VTPK file.
    Pack(PackArgs),
    /// Stream every VTPK under a directory for a number of frames.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PackArgs {
    /// Raw, tightly packed RGBA8 texels. Ignored with `--synthetic`.
    #[arg(long, required_unless_present = "synthetic")]
    pub input: Option<PathBuf>,

    /// Generate a test pattern instead of reading `--input`.
    #[arg(long, default_value_t = false)]
    pub synthetic: bool,

    #[arg(long)]
    pub width: u32,

    #[arg(long)]
    pub height: u32,

    /// Tile edge in texels.
    #[arg(long, default_value_t = 128)]
    pub tile: u16,

    /// Number of mip levels; 0 builds the full chain.
    #[arg(long, default_value_t = 0)]
    pub levels: u16,

    /// Store tiles zlib-compressed.
    #[arg(long, default_value_t = false)]
    pub compress: bool,

    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-memory backend; no GPU required.
    Host,
    /// Headless wgpu adapter.
    Wgpu,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory searched recursively for `.vtpk` files.
    #[arg(long, env = "VT_BENCH_DIR", default_value = "tiles")]
    pub dir: PathBuf,

    /// Engine configuration (JSON). Missing keys keep their defaults.
    #[arg(long, env = "VT_BENCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Host)]
    pub backend: Backend,

    #[arg(long, default_value_t = 600)]
    pub frames: u64,

    /// Generated images streamed in addition to the packs found in `--dir`.
    #[arg(long, default_value_t = 0)]
    pub synthetic_images: u32,

    #[arg(long, default_value_t = 1024)]
    pub instances: u32,

    #[arg(long, default_value_t = 64)]
    pub lights: u32,

    /// Tile requests issued per frame over all images.
    #[arg(long, default_value_t = 32)]
    pub feedback: u32,

    /// Frames a requested tile stays referenced.
    #[arg(long, default_value_t = 8)]
    pub hold: u64,

    #[arg(long, default_value_t = 0x5eed)]
    pub seed: u64,

    /// Print the Prometheus text exposition after the run.
    #[arg(long, default_value_t = false)]
    pub metrics: bool,
}
