use crate::codec::{Codec, PACKAGE_TAG};
use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::stream::BinaryStream;

/// Package flag set on packages whose body is stored as compressed chunks.
pub const PACKAGE_FLAG_COMPRESSED: u32 = 0x0200_0000;

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_ZLIB: u32 = 0x1;
pub const COMPRESSION_LZO: u32 = 0x2;
pub const COMPRESSION_OODLE: u32 = 0x100;

/// One entry of the header's compressed chunk table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkEntry {
    pub uncompressed_offset: u32,
    pub uncompressed_size: u32,
    pub compressed_offset: u32,
    pub compressed_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub exports: u32,
    pub names: u32,
    pub net_objects: u32,
}

#[derive(Debug, Clone)]
pub struct PackageHeader {
    pub game: GameKind,
    pub version: u16,
    pub licensee: u16,
    pub header_size: u32,
    pub folder_name: String,
    pub flags: u32,
    pub me3_unknown: u32,
    pub names_count: u32,
    pub names_offset: u32,
    pub exports_count: u32,
    pub exports_offset: u32,
    pub imports_count: u32,
    pub imports_offset: u32,
    pub depends_offset: u32,
    /// ME3 only: guid table offset, two unknowns and the thumbnail table offset.
    pub me3_extra: [u32; 4],
    pub guid: [u8; 16],
    pub generations: Vec<Generation>,
    pub engine_version: u32,
    pub cooker_version: u32,
    pub compression: u32,
    pub chunks: Vec<ChunkEntry>,
    pub package_source: u32,
    pub additional_packages: Vec<String>,
}

impl PackageHeader {
    pub fn read(stream: &mut dyn BinaryStream) -> Result<Self> {
        let tag = stream.read_u32()?;
        if tag != PACKAGE_TAG {
            return Err(Error::corrupt(format!("bad package tag 0x{:08X}", tag)));
        }
        let version = stream.read_u16()?;
        let licensee = stream.read_u16()?;
        let game = GameKind::from_package_version(version).ok_or_else(|| {
            Error::parse(format!("unsupported package version {}/{}", version, licensee))
        })?;

        let header_size = stream.read_u32()?;
        let folder_name = stream.read_fstring()?;
        let flags = stream.read_u32()?;
        let me3_unknown = if game == GameKind::Me3 { stream.read_u32()? } else { 0 };

        let names_count = stream.read_u32()?;
        let names_offset = stream.read_u32()?;
        let exports_count = stream.read_u32()?;
        let exports_offset = stream.read_u32()?;
        let imports_count = stream.read_u32()?;
        let imports_offset = stream.read_u32()?;
        let depends_offset = stream.read_u32()?;

        let mut me3_extra = [0u32; 4];
        if game == GameKind::Me3 {
            for slot in me3_extra.iter_mut() {
                *slot = stream.read_u32()?;
            }
        }

        let guid = stream.read_guid()?;
        let generation_count = stream.read_u32()?;
        if generation_count > 0x1000 {
            return Err(Error::parse(format!("implausible generation count {}", generation_count)));
        }
        let mut generations = Vec::with_capacity(generation_count as usize);
        for _ in 0..generation_count {
            generations.push(Generation {
                exports: stream.read_u32()?,
                names: stream.read_u32()?,
                net_objects: stream.read_u32()?,
            });
        }
        let engine_version = stream.read_u32()?;
        let cooker_version = stream.read_u32()?;

        let compression = stream.read_u32()?;
        let chunk_count = stream.read_u32()?;
        if chunk_count > 0x10000 {
            return Err(Error::parse(format!("implausible chunk count {}", chunk_count)));
        }
        let mut chunks = Vec::with_capacity(chunk_count as usize);
        for _ in 0..chunk_count {
            chunks.push(ChunkEntry {
                uncompressed_offset: stream.read_u32()?,
                uncompressed_size: stream.read_u32()?,
                compressed_offset: stream.read_u32()?,
                compressed_size: stream.read_u32()?,
            });
        }
        let package_source = stream.read_u32()?;

        let mut additional_packages = Vec::new();
        if game != GameKind::Me1 {
            let count = stream.read_u32()?;
            if count > 0x1000 {
                return Err(Error::parse(format!("implausible additional package count {}", count)));
            }
            for _ in 0..count {
                additional_packages.push(stream.read_fstring()?);
            }
        }

        Ok(Self {
            game,
            version,
            licensee,
            header_size,
            folder_name,
            flags,
            me3_unknown,
            names_count,
            names_offset,
            exports_count,
            exports_offset,
            imports_count,
            imports_offset,
            depends_offset,
            me3_extra,
            guid,
            generations,
            engine_version,
            cooker_version,
            compression,
            chunks,
            package_source,
            additional_packages,
        })
    }

    pub fn write(&self, stream: &mut dyn BinaryStream) -> Result<()> {
        stream.write_u32(PACKAGE_TAG)?;
        stream.write_u16(self.version)?;
        stream.write_u16(self.licensee)?;
        stream.write_u32(self.header_size)?;
        stream.write_fstring(&self.folder_name, !self.folder_name.is_ascii())?;
        stream.write_u32(self.flags)?;
        if self.game == GameKind::Me3 {
            stream.write_u32(self.me3_unknown)?;
        }
        stream.write_u32(self.names_count)?;
        stream.write_u32(self.names_offset)?;
        stream.write_u32(self.exports_count)?;
        stream.write_u32(self.exports_offset)?;
        stream.write_u32(self.imports_count)?;
        stream.write_u32(self.imports_offset)?;
        stream.write_u32(self.depends_offset)?;
        if self.game == GameKind::Me3 {
            for &v in &self.me3_extra {
                stream.write_u32(v)?;
            }
        }
        stream.write_bytes(&self.guid)?;
        stream.write_u32(self.generations.len() as u32)?;
        for g in &self.generations {
            stream.write_u32(g.exports)?;
            stream.write_u32(g.names)?;
            stream.write_u32(g.net_objects)?;
        }
        stream.write_u32(self.engine_version)?;
        stream.write_u32(self.cooker_version)?;
        stream.write_u32(self.compression)?;
        stream.write_u32(self.chunks.len() as u32)?;
        for c in &self.chunks {
            stream.write_u32(c.uncompressed_offset)?;
            stream.write_u32(c.uncompressed_size)?;
            stream.write_u32(c.compressed_offset)?;
            stream.write_u32(c.compressed_size)?;
        }
        stream.write_u32(self.package_source)?;
        if self.game != GameKind::Me1 {
            stream.write_u32(self.additional_packages.len() as u32)?;
            for p in &self.additional_packages {
                stream.write_fstring(p, !p.is_ascii())?;
            }
        }
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & PACKAGE_FLAG_COMPRESSED != 0 && !self.chunks.is_empty()
    }

    /// Block codec used by the chunk table.
    pub fn codec(&self) -> Result<Codec> {
        match self.compression {
            COMPRESSION_ZLIB => Ok(Codec::Zlib),
            COMPRESSION_LZO => Ok(Codec::Lzo),
            COMPRESSION_OODLE => Ok(Codec::Oodle),
            other => Err(Error::parse(format!("unknown package compression 0x{:X}", other))),
        }
    }

    /// Drops the chunk table and compression flags; table offsets are already
    /// in uncompressed coordinates.
    pub fn mark_uncompressed(&mut self) {
        self.flags &= !PACKAGE_FLAG_COMPRESSED;
        self.compression = COMPRESSION_NONE;
        self.chunks.clear();
    }
}
