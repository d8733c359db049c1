//! Where tile texels come from.

use crate::error::{Error, Result};
use crate::residency::TileCoordinate;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use vtpack::{PackDesc, VtPack};

/// Reads decoded tiles of one image. Called from the streaming thread.
pub trait TileSource: Send + Sync {
    fn desc(&self) -> &PackDesc;

    /// Fills `out` (exactly `desc().tile_bytes()` long) with the texels of `coord`.
    fn read_tile(&self, coord: TileCoordinate, out: &mut [u8]) -> io::Result<()>;
}

pub type TileCallback = Box<dyn Fn(TileCoordinate, &mut [u8]) -> io::Result<()> + Send + Sync>;

/// How `load_sparse_image` obtains tiles.
pub enum TileSourceDesc {
    /// A VTPK file on disk.
    Path(PathBuf),
    /// Tiles produced at runtime.
    Callback { desc: PackDesc, read: TileCallback },
}

impl TileSourceDesc {
    pub fn callback(
        desc: PackDesc,
        read: impl Fn(TileCoordinate, &mut [u8]) -> io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        TileSourceDesc::Callback {
            desc,
            read: Box::new(read),
        }
    }

    /// Opens the source. Fails before any streaming state exists.
    pub(crate) fn open(self) -> Result<Arc<dyn TileSource>> {
        match self {
            TileSourceDesc::Path(path) => {
                let pack = VtPack::open(&path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(Arc::new(PackSource { pack }))
            }
            TileSourceDesc::Callback { desc, read } => {
                desc.validate()?;
                Ok(Arc::new(CallbackSource { desc, read }))
            }
        }
    }
}

impl std::fmt::Debug for TileSourceDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileSourceDesc::Path(p) => f.debug_tuple("Path").field(p).finish(),
            TileSourceDesc::Callback { desc, .. } => f.debug_struct("Callback").field("desc", desc).finish(),
        }
    }
}

struct PackSource {
    pack: VtPack,
}

impl TileSource for PackSource {
    fn desc(&self) -> &PackDesc {
        self.pack.desc()
    }

    fn read_tile(&self, coord: TileCoordinate, out: &mut [u8]) -> io::Result<()> {
        let bytes = self.pack.read_tile(coord.level, coord.x, coord.y)?;
        if bytes.len() != out.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tile {:?} has {} bytes, expected {}", coord, bytes.len(), out.len()),
            ));
        }
        out.copy_from_slice(&bytes);
        Ok(())
    }
}

struct CallbackSource {
    desc: PackDesc,
    read: TileCallback,
}

impl TileSource for CallbackSource {
    fn desc(&self) -> &PackDesc {
        &self.desc
    }

    fn read_tile(&self, coord: TileCoordinate, out: &mut [u8]) -> io::Result<()> {
        (self.read)(coord, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtpack::TexelFormat;

    #[test]
    fn missing_file_fails_synchronously() {
        let err = TileSourceDesc::Path("/nonexistent/scene_stream/tiles.vtpk".into())
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn degenerate_callback_desc_is_rejected() {
        let good = PackDesc {
            width: 8,
            height: 8,
            mip_levels: 2,
            format: TexelFormat::R8,
            tile_width: 4,
            tile_height: 4,
        };
        for desc in [
            PackDesc { mip_levels: 0, ..good },
            PackDesc { tile_width: 0, ..good },
            PackDesc { height: 0, ..good },
        ] {
            let err = TileSourceDesc::callback(desc, |_, _| Ok(())).open().err().unwrap();
            assert!(matches!(err, Error::Pack(_)), "{desc:?}");
        }
        assert!(TileSourceDesc::callback(good, |_, _| Ok(())).open().is_ok());
    }

    #[test]
    fn pack_source_reads_written_tiles() {
        let desc = PackDesc {
            width: 8,
            height: 8,
            mip_levels: 2,
            format: TexelFormat::R8,
            tile_width: 4,
            tile_height: 4,
        };
        let tiles: Vec<Vec<u8>> = (0..desc.tile_count()).map(|i| vec![i as u8 + 1; 16]).collect();

        let path = std::env::temp_dir().join(format!("scene_stream_source_{}.vtpk", std::process::id()));
        vtpack::write_file(&path, &desc, &tiles, true).unwrap();

        let source = TileSourceDesc::Path(path.clone()).open().unwrap();
        let mut out = vec![0u8; desc.tile_bytes()];
        source.read_tile(TileCoordinate::new(1, 1, 0), &mut out).unwrap();
        assert_eq!(out, vec![4u8; 16]);
        source.read_tile(TileCoordinate::new(0, 0, 1), &mut out).unwrap();
        assert_eq!(out, vec![5u8; 16]);

        let _ = std::fs::remove_file(path);
    }
}
