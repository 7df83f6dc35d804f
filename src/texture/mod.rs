//! Texture exports: property block, mip list and the storage backends the
//! mip payloads live in.

pub mod movie;
pub mod properties;

use crate::codec::{compress_chunk, decompress_chunk_bytes, Codec, Codecs};
use crate::config::{GameContext, GameKind};
use crate::error::{Error, Result};
use crate::image::{ImageMip, PixelFormat};
use crate::package::tables::NameTable;
use crate::package::Package;
use crate::stream::{BinaryStream, FileStream, MemoryStream};
use log::warn;
use properties::PropertyBlock;
use std::path::Path;

pub use movie::TextureMovie;

pub const STORAGE_NONE: u32 = 0x0;
pub const STORAGE_EXTERNAL: u32 = 0x1;
pub const STORAGE_ZLIB: u32 = 0x2;
pub const STORAGE_LZO: u32 = 0x10;
pub const STORAGE_UNUSED: u32 = 0x20;
pub const STORAGE_OODLE: u32 = 0x1000;
const STORAGE_KNOWN: u32 =
    STORAGE_EXTERNAL | STORAGE_ZLIB | STORAGE_LZO | STORAGE_UNUSED | STORAGE_OODLE;

/// Mips at or above this size are zlib-compressed when placed in ME1/ME2 packages.
pub const COMPRESS_THRESHOLD: usize = 0x4000;

pub const TEXTURE_CLASSES: [&str; 4] = [
    "Texture2D",
    "LightMapTexture2D",
    "ShadowMapTexture2D",
    "TextureFlipBook",
];
pub const MOVIE_CLASS: &str = "TextureMovie";

pub fn is_texture_class(class: &str) -> bool {
    TEXTURE_CLASSES.contains(&class)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Empty,
    InPackage {
        compressed: Option<Codec>,
    },
    External {
        compressed: Option<Codec>,
        archive: String,
        offset: u32,
    },
}

impl StorageKind {
    fn from_flags(flags: u32, offset: u32, archive: &str) -> Self {
        if flags & STORAGE_UNUSED != 0 {
            return StorageKind::Empty;
        }
        let compressed = if flags & STORAGE_ZLIB != 0 {
            Some(Codec::Zlib)
        } else if flags & STORAGE_LZO != 0 {
            Some(Codec::Lzo)
        } else if flags & STORAGE_OODLE != 0 {
            Some(Codec::Oodle)
        } else {
            None
        };
        if flags & STORAGE_EXTERNAL != 0 {
            StorageKind::External {
                compressed,
                archive: archive.to_string(),
                offset,
            }
        } else {
            StorageKind::InPackage { compressed }
        }
    }

    fn flags(&self) -> u32 {
        let codec_bits = |c: &Option<Codec>| match c {
            Some(Codec::Zlib) => STORAGE_ZLIB,
            Some(Codec::Lzo) => STORAGE_LZO,
            Some(Codec::Oodle) => STORAGE_OODLE,
            Some(Codec::Lzma) | None => STORAGE_NONE,
        };
        match self {
            StorageKind::Empty => STORAGE_UNUSED | STORAGE_EXTERNAL,
            StorageKind::InPackage { compressed } => codec_bits(compressed),
            StorageKind::External { compressed, .. } => STORAGE_EXTERNAL | codec_bits(compressed),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, StorageKind::External { .. })
    }
}

/// One bulk payload record: storage flags, sizes, offset and any inline bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bulk {
    pub storage: StorageKind,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    /// Bytes stored inline in the export (compressed form when compressed).
    pub data: Vec<u8>,
    raw_flags: u32,
    raw_offset: u32,
}

impl Bulk {
    pub fn in_package(data: Vec<u8>, uncompressed_size: u32, compressed: Option<Codec>) -> Self {
        let storage = StorageKind::InPackage { compressed };
        let raw_flags = storage.flags();
        Self {
            storage,
            uncompressed_size,
            compressed_size: data.len() as u32,
            data,
            raw_flags,
            raw_offset: 0,
        }
    }

    fn read(stream: &mut dyn BinaryStream, archive: &str) -> Result<Self> {
        let raw_flags = stream.read_u32()?;
        let uncompressed_size = stream.read_u32()?;
        let compressed_size = stream.read_u32()?;
        let raw_offset = stream.read_u32()?;
        let storage = StorageKind::from_flags(raw_flags, raw_offset, archive);
        let data = match storage {
            StorageKind::InPackage { .. } => stream.read_bytes(compressed_size as usize)?,
            _ => Vec::new(),
        };
        Ok(Self {
            storage,
            uncompressed_size,
            compressed_size,
            data,
            raw_flags,
            raw_offset,
        })
    }

    fn write(&self, out: &mut ExportWriter) -> Result<()> {
        let flags = match self.storage {
            StorageKind::Empty if self.raw_flags & STORAGE_UNUSED != 0 => self.raw_flags,
            _ => self.storage.flags() | (self.raw_flags & !STORAGE_KNOWN),
        };
        out.stream.write_u32(flags)?;
        match &self.storage {
            StorageKind::InPackage { .. } => {
                out.stream.write_u32(self.uncompressed_size)?;
                out.stream.write_u32(self.data.len() as u32)?;
                let at = out.next_field_end()?;
                out.stream.write_u32(at)?;
                out.stream.write_bytes(&self.data)?;
            }
            StorageKind::External { offset, .. } => {
                out.stream.write_u32(self.uncompressed_size)?;
                out.stream.write_u32(self.compressed_size)?;
                out.stream.write_u32(*offset)?;
            }
            StorageKind::Empty => {
                out.stream.write_u32(self.uncompressed_size)?;
                out.stream.write_u32(self.compressed_size)?;
                out.stream.write_u32(self.raw_offset)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.storage == StorageKind::Empty || self.uncompressed_size == 0
    }

    /// Storage-decompressed payload bytes.
    pub fn load(&self, ctx: &GameContext, package: &Path, owner: &str, guid: Option<&[u8]>) -> Result<Vec<u8>> {
        match &self.storage {
            StorageKind::Empty => Err(Error::parse(format!("{}: payload is an empty placeholder", owner))),
            StorageKind::InPackage { compressed: None } => Ok(self.data.clone()),
            StorageKind::InPackage { compressed: Some(codec) } => {
                decompress_chunk_bytes(&ctx.codecs, *codec, &self.data)
            }
            StorageKind::External {
                compressed,
                archive,
                offset,
            } => {
                let path = ctx
                    .tfcs
                    .resolve(&ctx.config, archive, package)
                    .ok_or_else(|| Error::MissingExternalArchive {
                        archive: archive.clone(),
                        texture: owner.to_string(),
                    })?;
                let mut file = FileStream::open(&path)?;
                if let (Some(expected), GameKind::Me2 | GameKind::Me3) = (guid, ctx.game()) {
                    let found = file.read_guid()?;
                    if found[..] != expected[..] {
                        warn!("{:?}: archive GUID does not match {}", path, owner);
                    }
                }
                file.jump_to(*offset as u64)?;
                let raw = file.read_bytes(self.compressed_size as usize)?;
                match compressed {
                    Some(codec) => decompress_chunk_bytes(&ctx.codecs, *codec, &raw),
                    None => Ok(raw),
                }
            }
        }
    }
}

/// Append-only builder for one export's bytes; hands out absolute package
/// offsets for payloads as they are committed.
struct ExportWriter {
    stream: MemoryStream,
    base: u32,
}

impl ExportWriter {
    fn new(base: u32) -> Self {
        Self {
            stream: MemoryStream::new(),
            base,
        }
    }

    /// Absolute offset of the byte following a 4-byte field written next.
    fn next_field_end(&mut self) -> Result<u32> {
        Ok(self.base + self.stream.position()? as u32 + 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipMap {
    pub width: u32,
    pub height: u32,
    pub bulk: Bulk,
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub game: GameKind,
    pub class: String,
    pub name: String,
    net_index: i32,
    pub properties: PropertyBlock,
    /// ME1/ME2 only: leading 12 bytes of the empty bulk record before the mips.
    pre_mip: Option<Vec<u8>>,
    pub mips: Vec<MipMap>,
    pub rest: Vec<u8>,
    streamed: bool,
}

impl Texture {
    pub fn from_export(package: &mut Package, index: usize) -> Result<Self> {
        let class = package.class_name(index)?;
        if !is_texture_class(&class) {
            return Err(Error::parse(format!("export {} is a {}, not a texture", index, class)));
        }
        let data = package.export_data(index)?;
        let fallback = if package.game() == GameKind::Me1 {
            Some(package.outermost_package(index)?)
        } else {
            None
        };
        let mut texture = Self::from_bytes(&data, &package.names, package.game(), &class, fallback)?;
        texture.name = package.full_path(index)?;
        Ok(texture)
    }

    /// `archive_fallback` names the external archive when the texture carries
    /// no `TextureFileCacheName` (ME1 streams from its outermost package).
    pub fn from_bytes(
        data: &[u8],
        names: &NameTable,
        game: GameKind,
        class: &str,
        archive_fallback: Option<String>,
    ) -> Result<Self> {
        let mut s = MemoryStream::from_vec(data.to_vec());
        let net_index = s.read_i32()?;
        let properties = PropertyBlock::read(&mut s, names, game)?;
        let archive = properties
            .get_name("TextureFileCacheName", names)
            .or(archive_fallback)
            .unwrap_or_default();

        let pre_mip = if game != GameKind::Me3 {
            let lead = s.read_bytes(12)?;
            s.skip(4)?;
            Some(lead)
        } else {
            None
        };

        let count = s.read_i32()?;
        if !(0..=32).contains(&count) {
            return Err(Error::parse(format!("implausible mip count {}", count)));
        }
        let mut mips = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let bulk = Bulk::read(&mut s, &archive)?;
            let width = s.read_i32()?.max(0) as u32;
            let height = s.read_i32()?.max(0) as u32;
            mips.push(MipMap { width, height, bulk });
        }
        let pos = s.position()? as usize;
        let rest = data[pos..].to_vec();
        let streamed = properties.exists("TextureFileCacheName")
            || mips.iter().any(|m| m.bulk.storage.is_external());

        Ok(Self {
            game,
            class: class.to_string(),
            name: String::new(),
            net_index,
            properties,
            pre_mip,
            mips,
            rest,
            streamed,
        })
    }

    pub fn serialize(&self, export_offset: u32) -> Result<Vec<u8>> {
        let mut out = ExportWriter::new(export_offset);
        out.stream.write_i32(self.net_index)?;
        self.properties.write(&mut out.stream)?;
        if let Some(lead) = &self.pre_mip {
            out.stream.write_bytes(lead)?;
            let at = out.next_field_end()?;
            out.stream.write_u32(at)?;
        }
        out.stream.write_i32(self.mips.len() as i32)?;
        for mip in &self.mips {
            mip.bulk.write(&mut out)?;
            out.stream.write_u32(mip.width)?;
            out.stream.write_u32(mip.height)?;
        }
        out.stream.write_bytes(&self.rest)?;
        Ok(out.stream.into_inner())
    }

    /// Largest mip that actually carries data.
    pub fn top_mipmap(&self) -> Option<&MipMap> {
        self.mips.iter().find(|m| !m.bulk.is_empty())
    }

    pub fn top_index(&self) -> Option<usize> {
        self.mips.iter().position(|m| !m.bulk.is_empty())
    }

    pub fn format(&self, names: &NameTable) -> Option<PixelFormat> {
        self.properties
            .get_enum("Format", names)
            .and_then(|f| PixelFormat::from_engine_name(&f))
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn is_normal_map(&self, names: &NameTable) -> bool {
        self.properties
            .get_enum("CompressionSettings", names)
            .map_or(false, |c| c.starts_with("TC_Normalmap"))
    }

    fn tfc_guid(&self) -> Option<&[u8]> {
        self.properties.get_struct("TFCFileGuid")
    }

    /// Storage-decompressed bytes of one mip.
    pub fn mip_data(&self, index: usize, ctx: &GameContext, package: &Path) -> Result<Vec<u8>> {
        let mip = self
            .mips
            .get(index)
            .ok_or_else(|| Error::parse(format!("{}: no mip {}", self.name, index)))?;
        mip.bulk.load(ctx, package, &self.name, self.tfc_guid())
    }

    pub fn top_mip_data(&self, ctx: &GameContext, package: &Path) -> Result<Vec<u8>> {
        let index = self
            .top_index()
            .ok_or_else(|| Error::parse(format!("{}: texture has no populated mips", self.name)))?;
        self.mip_data(index, ctx, package)
    }

    /// Drops placeholder mips that carry no bytes and renumbers the mip tail.
    pub fn remove_empty_mips(&mut self, names: &mut NameTable) {
        let before = self.mips.len();
        self.mips.retain(|m| !m.bulk.is_empty());
        if self.mips.len() != before && self.properties.exists("MipTailBaseIdx") {
            let tail = self.mips.len().saturating_sub(1) as i32;
            self.properties.set_int(names, "MipTailBaseIdx", tail);
        }
    }

    /// Installs a new mip chain with the placement policy for this game: ME3
    /// keeps mips uncompressed in the package, ME1/ME2 zlib-compress mips of
    /// `COMPRESS_THRESHOLD` bytes or more.
    pub fn replace_mipmaps(&mut self, new_mips: Vec<ImageMip>, codecs: &Codecs) -> Result<()> {
        if new_mips.is_empty() {
            return Err(Error::parse(format!("{}: replacement has no mips", self.name)));
        }
        let mut mips = Vec::with_capacity(new_mips.len());
        for mip in new_mips {
            let size = mip.data.len();
            let bulk = if self.game != GameKind::Me3 && size >= COMPRESS_THRESHOLD {
                let chunk = compress_chunk(codecs, Codec::Zlib, &mip.data)?;
                Bulk::in_package(chunk, size as u32, Some(Codec::Zlib))
            } else {
                Bulk::in_package(mip.data, size as u32, None)
            };
            mips.push(MipMap {
                width: mip.width,
                height: mip.height,
                bulk,
            });
        }
        self.mips = mips;
        Ok(())
    }

    /// Brings size, tail and streaming properties in line with the current mips.
    pub fn update_properties(&mut self, names: &mut NameTable, format: PixelFormat, converted: bool) {
        let (w, h) = match self.mips.first() {
            Some(m) => (m.width as i32, m.height as i32),
            None => return,
        };
        self.properties.set_int(names, "SizeX", w);
        self.properties.set_int(names, "SizeY", h);
        if self.properties.exists("OriginalSizeX") {
            self.properties.set_int(names, "OriginalSizeX", w);
        }
        if self.properties.exists("OriginalSizeY") {
            self.properties.set_int(names, "OriginalSizeY", h);
        }
        self.properties
            .set_int(names, "MipTailBaseIdx", self.mips.len() as i32 - 1);
        if converted {
            if let Some(engine_name) = format.engine_name() {
                self.properties.set_enum(names, "Format", "EPixelFormat", engine_name);
            }
        }
        if self.streamed {
            self.properties.remove("TextureFileCacheName");
            self.properties.remove("TFCFileGuid");
            self.properties.set_bool(names, "NeverStream", true);
            self.streamed = false;
        }
    }
}

/// Re-serialises a texture or movie export so its in-package payload offsets
/// match `new_offset`; `None` for every other class.
pub fn rebase_export(
    data: &[u8],
    names: &NameTable,
    game: GameKind,
    class: &str,
    new_offset: u32,
) -> Result<Option<Vec<u8>>> {
    if is_texture_class(class) {
        let texture = Texture::from_bytes(data, names, game, class, None)?;
        return texture.serialize(new_offset).map(Some);
    }
    if class == MOVIE_CLASS {
        let movie = TextureMovie::from_bytes(data, names, game)?;
        return movie.serialize(new_offset).map(Some);
    }
    Ok(None)
}
