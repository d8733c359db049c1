//! VTPK: dependency-light container for tiled mip chains streamed into sparse textures.
//!
//! - Every mip level is cut into fixed-size tiles (`tile_width` x `tile_height` texels).
//! - Edge tiles and the mip tail are padded to a full tile, so every tile has the same size.
//! - Tiles are stored raw or zlib-compressed; a tile with `stored_len == 0` is all zeroes
//!   and costs no payload bytes.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"VTPK"
//!   04  : u32     version = 1
//!   08  : u32     flags (bitfield)
//!                 bit 0 => tiles are zlib-compressed
//!   0C  : u32     width  (texels, level 0)
//!   10  : u32     height (texels, level 0)
//!   14  : u16     mip_levels
//!   16  : u16     texel format (see [`TexelFormat`])
//!   18  : u16     tile_width
//!   1A  : u16     tile_height
//!   1C  : u32     tile_count
//!   20  : tile table, tile_count entries of
//!         u64 offset (absolute), u32 stored_len, u32 raw_len
//!   ..  : payload
//!
//! Tiles are ordered mip-major, then row-major inside each level.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

pub const VTPK_MAGIC: [u8; 4] = *b"VTPK";
pub const VTPK_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 0x20;
pub const TABLE_ENTRY_LEN: usize = 16;

const FLAG_ZLIB: u32 = 1 << 0;

/// Texel layout of the stored tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TexelFormat {
    R8 = 0,
    Rg8 = 1,
    Rgba8 = 2,
    Rgba16Float = 3,
    Rgba32Float = 4,
}

impl TexelFormat {
    #[inline]
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TexelFormat::R8 => 1,
            TexelFormat::Rg8 => 2,
            TexelFormat::Rgba8 => 4,
            TexelFormat::Rgba16Float => 8,
            TexelFormat::Rgba32Float => 16,
        }
    }

    pub fn from_u16(v: u16) -> io::Result<Self> {
        Ok(match v {
            0 => TexelFormat::R8,
            1 => TexelFormat::Rg8,
            2 => TexelFormat::Rgba8,
            3 => TexelFormat::Rgba16Float,
            4 => TexelFormat::Rgba32Float,
            x => return Err(bad(&format!("unknown texel format {}", x))),
        })
    }
}

/// Geometry of a tiled mip chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u16,
    pub format: TexelFormat,
    pub tile_width: u16,
    pub tile_height: u16,
}

impl PackDesc {
    /// Number of mip levels of a full chain down to 1x1.
    #[inline]
    pub fn full_mip_count(width: u32, height: u32) -> u16 {
        (32 - width.max(height).max(1).leading_zeros()) as u16
    }

    /// Texel extent of `level`, clamped to 1.
    #[inline]
    pub fn level_extent(&self, level: u16) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Tiles per row and per column of `level`.
    #[inline]
    pub fn mip_grid(&self, level: u16) -> (u32, u32) {
        let (w, h) = self.level_extent(level);
        (
            w.div_ceil(self.tile_width as u32),
            h.div_ceil(self.tile_height as u32),
        )
    }

    /// Index of the first tile of `level` in the tile table.
    pub fn level_offset(&self, level: u16) -> usize {
        (0..level)
            .map(|l| {
                let (tx, ty) = self.mip_grid(l);
                tx as usize * ty as usize
            })
            .sum()
    }

    /// Total number of tiles across the mip chain.
    pub fn tile_count(&self) -> usize {
        self.level_offset(self.mip_levels)
    }

    /// Flat table index of a tile, or `None` if the coordinate is outside the chain.
    pub fn tile_index(&self, level: u16, x: u32, y: u32) -> Option<usize> {
        if level >= self.mip_levels {
            return None;
        }

        let (tx, ty) = self.mip_grid(level);
        if x >= tx || y >= ty {
            return None;
        }

        Some(self.level_offset(level) + (y * tx + x) as usize)
    }

    /// Bytes of one decoded tile.
    #[inline]
    pub fn tile_bytes(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * self.format.bytes_per_texel()
    }

    /// Bytes per tile row.
    #[inline]
    pub fn tile_row_pitch(&self) -> usize {
        self.tile_width as usize * self.format.bytes_per_texel()
    }

    /// Checks that the descriptor spans a non-empty, tileable mip chain.
    pub fn validate(&self) -> io::Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(bad("image extent must be > 0"));
        }

        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(bad("tile extent must be > 0"));
        }

        if self.mip_levels == 0 || self.mip_levels > Self::full_mip_count(self.width, self.height)
        {
            return Err(bad("mip level count out of range"));
        }

        Ok(())
    }
}

/// One tile table record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TileEntry {
    pub offset: u64,
    pub stored_len: u32,
    pub raw_len: u32,
}

enum Backing {
    File { file: Mutex<File>, len: u64 },
    #[cfg(feature = "mmap")]
    Mmap(memmap2::Mmap),
}

/// An open VTPK file. Tiles are read lazily; safe to share between threads.
pub struct VtPack {
    desc: PackDesc,
    compressed: bool,
    table: Vec<TileEntry>,
    backing: Backing,
}

impl std::fmt::Debug for VtPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtPack")
            .field("desc", &self.desc)
            .field("compressed", &self.compressed)
            .field("tiles", &self.table.len())
            .finish()
    }
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated VTPK"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_u64(buf: &mut &[u8]) -> io::Result<u64> {
    let b = take(buf, 8)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Parse the fixed header. Returns the descriptor, the compression flag and the tile count.
pub fn parse_header_bytes(mut p: &[u8]) -> io::Result<(PackDesc, bool, usize)> {
    if take(&mut p, 4)? != b"VTPK" {
        return Err(bad("bad VTPK magic"));
    }

    let version = le_u32(&mut p)?;
    if version != VTPK_VERSION {
        return Err(bad("unsupported VTPK version"));
    }

    let flags = le_u32(&mut p)?;
    let width = le_u32(&mut p)?;
    let height = le_u32(&mut p)?;
    let mip_levels = le_u16(&mut p)?;
    let format = TexelFormat::from_u16(le_u16(&mut p)?)?;
    let tile_width = le_u16(&mut p)?;
    let tile_height = le_u16(&mut p)?;
    let count = le_u32(&mut p)? as usize;

    let desc = PackDesc {
        width,
        height,
        mip_levels,
        format,
        tile_width,
        tile_height,
    };
    desc.validate()?;

    if count != desc.tile_count() {
        return Err(bad("tile count does not match mip chain"));
    }

    Ok((desc, (flags & FLAG_ZLIB) != 0, count))
}

fn parse_table(mut p: &[u8], count: usize, tile_bytes: usize) -> io::Result<Vec<TileEntry>> {
    let mut table = Vec::with_capacity(count);

    for _ in 0..count {
        let entry = TileEntry {
            offset: le_u64(&mut p)?,
            stored_len: le_u32(&mut p)?,
            raw_len: le_u32(&mut p)?,
        };

        if entry.raw_len as usize != tile_bytes {
            return Err(bad("tile raw length does not match tile extent"));
        }

        table.push(entry);
    }

    Ok(table)
}

impl VtPack {
    /// Opens a pack and loads its tile table. Tile payloads stay on disk.
    #[cfg(not(feature = "mmap"))]
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        let (desc, compressed, count) = parse_header_bytes(&header)?;

        let mut table_bytes = vec![0u8; count * TABLE_ENTRY_LEN];
        file.read_exact(&mut table_bytes)?;
        let table = parse_table(&table_bytes, count, desc.tile_bytes())?;

        Ok(Self {
            desc,
            compressed,
            table,
            backing: Backing::File {
                file: Mutex::new(file),
                len,
            },
        })
    }

    /// Fast path: map the whole file; tile reads become slice copies.
    #[cfg(feature = "mmap")]
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { memmap2::MmapOptions::new().map(&file)? };

        let (desc, compressed, count) = parse_header_bytes(&map)?;
        need(&map[HEADER_LEN..], count * TABLE_ENTRY_LEN)?;
        let table = parse_table(&map[HEADER_LEN..], count, desc.tile_bytes())?;

        Ok(Self {
            desc,
            compressed,
            table,
            backing: Backing::Mmap(map),
        })
    }

    #[inline]
    pub fn desc(&self) -> &PackDesc {
        &self.desc
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[inline]
    pub fn entry(&self, index: usize) -> Option<&TileEntry> {
        self.table.get(index)
    }

    /// Reads and decodes one tile. The result is always `tile_bytes()` long.
    pub fn read_tile(&self, level: u16, x: u32, y: u32) -> io::Result<Vec<u8>> {
        let index = self
            .desc
            .tile_index(level, x, y)
            .ok_or_else(|| bad("tile coordinate outside mip chain"))?;
        self.read_tile_at(index)
    }

    pub fn read_tile_at(&self, index: usize) -> io::Result<Vec<u8>> {
        let entry = *self
            .table
            .get(index)
            .ok_or_else(|| bad("tile index out of range"))?;

        if entry.stored_len == 0 {
            return Ok(vec![0u8; entry.raw_len as usize]);
        }

        let stored = self.read_stored(&entry)?;

        let raw = if self.compressed {
            miniz_oxide::inflate::decompress_to_vec_zlib(&stored)
                .map_err(|e| bad(&format!("zlib tile decode failed: {:?}", e.status)))?
        } else {
            stored
        };

        if raw.len() != entry.raw_len as usize {
            return Err(bad("decoded tile has wrong length"));
        }

        Ok(raw)
    }

    fn read_stored(&self, entry: &TileEntry) -> io::Result<Vec<u8>> {
        match &self.backing {
            Backing::File { file, len } => {
                let end = entry
                    .offset
                    .checked_add(entry.stored_len as u64)
                    .ok_or_else(|| bad("tile extent overflow"))?;
                if end > *len {
                    return Err(bad("tile extends past end of file"));
                }

                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::new(ErrorKind::Other, "VTPK file lock poisoned"))?;
                file.seek(SeekFrom::Start(entry.offset))?;

                let mut buf = vec![0u8; entry.stored_len as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
            #[cfg(feature = "mmap")]
            Backing::Mmap(map) => {
                let start = entry.offset as usize;
                let end = start
                    .checked_add(entry.stored_len as usize)
                    .ok_or_else(|| bad("tile extent overflow"))?;
                need(map, end)?;
                Ok(map[start..end].to_vec())
            }
        }
    }
}

/// Writes a pack. `tiles` are raw tiles in table order, each exactly `tile_bytes()` long.
/// All-zero tiles are stored without payload.
pub fn write_file<P: AsRef<Path>>(
    path: P,
    desc: &PackDesc,
    tiles: &[Vec<u8>],
    compress: bool,
) -> io::Result<()> {
    desc.validate()?;

    if tiles.len() != desc.tile_count() {
        return Err(bad("tile list length != tile count"));
    }

    let tile_bytes = desc.tile_bytes();
    if tiles.iter().any(|t| t.len() != tile_bytes) {
        return Err(bad("tile length != tile extent"));
    }

    let stored: Vec<Option<Vec<u8>>> = tiles
        .iter()
        .map(|t| {
            if t.iter().all(|&b| b == 0) {
                None
            } else if compress {
                Some(miniz_oxide::deflate::compress_to_vec_zlib(t, 6))
            } else {
                Some(t.clone())
            }
        })
        .collect();

    let mut flags = 0u32;
    if compress {
        flags |= FLAG_ZLIB;
    }

    let mut file = File::create(path)?;

    file.write_all(&VTPK_MAGIC)?;
    write_u32(&mut file, VTPK_VERSION)?;
    write_u32(&mut file, flags)?;
    write_u32(&mut file, desc.width)?;
    write_u32(&mut file, desc.height)?;
    write_u16(&mut file, desc.mip_levels)?;
    write_u16(&mut file, desc.format as u16)?;
    write_u16(&mut file, desc.tile_width)?;
    write_u16(&mut file, desc.tile_height)?;
    write_u32(&mut file, tiles.len() as u32)?;

    let mut offset = (HEADER_LEN + tiles.len() * TABLE_ENTRY_LEN) as u64;
    for payload in &stored {
        let stored_len = payload.as_ref().map_or(0, |p| p.len());
        write_u64(&mut file, if stored_len == 0 { 0 } else { offset })?;
        write_u32(&mut file, stored_len as u32)?;
        write_u32(&mut file, tile_bytes as u32)?;
        offset += stored_len as u64;
    }

    for payload in stored.iter().flatten() {
        file.write_all(payload)?;
    }

    file.flush()?;

    Ok(())
}

/// Copies a `tile_width` x `tile_height` window of a level image into a padded tile.
/// `level` is row-major with `level_width` texels per row.
pub fn cut_tile(
    desc: &PackDesc,
    level: &[u8],
    level_width: u32,
    level_height: u32,
    x: u32,
    y: u32,
) -> Vec<u8> {
    let bpt = desc.format.bytes_per_texel();
    let tw = desc.tile_width as u32;
    let th = desc.tile_height as u32;
    let mut tile = vec![0u8; desc.tile_bytes()];

    let x0 = x * tw;
    let y0 = y * th;
    let copy_w = tw.min(level_width.saturating_sub(x0)) as usize;

    for row in 0..th {
        let sy = y0 + row;
        if sy >= level_height || copy_w == 0 {
            break;
        }

        let src = (sy as usize * level_width as usize + x0 as usize) * bpt;
        let dst = row as usize * tw as usize * bpt;
        tile[dst..dst + copy_w * bpt].copy_from_slice(&level[src..src + copy_w * bpt]);
    }

    tile
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
