use super::{TextureLocation, TextureMap, TextureMapEntry, TextureType};
use crate::codec::{lzma_compress, lzma_decompress};
use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::image::PixelFormat;
use crate::stream::{BinaryStream, MemoryStream};
use binrw::{binrw, BinReaderExt, BinWriterExt};
use log::info;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

pub const CACHE_VERSION: u32 = 1;
const NO_FORMAT: u8 = 0xFF;

#[binrw]
#[derive(Debug)]
#[brw(little, magic = b"TMAP")]
struct CacheHeader {
    version: u32,
    game: u32,
    decompressed_size: u32,
}

fn corrupt(what: impl std::fmt::Display) -> Error {
    Error::CacheCorrupt(what.to_string())
}

fn write_str(s: &mut MemoryStream, text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| Error::parse(format!("string too long: {}", text)))?;
    s.write_u16(len)?;
    s.write_bytes(bytes)
}

fn read_str(s: &mut MemoryStream) -> Result<String> {
    let len = s.read_u16()? as usize;
    let bytes = s.read_bytes(len)?;
    String::from_utf8(bytes).map_err(|e| Error::parse(format!("bad utf-8 in cache: {}", e)))
}

fn encode(map: &TextureMap) -> Result<Vec<u8>> {
    let mut paths: Vec<&str> = Vec::new();
    let mut path_ids: HashMap<&str, u32> = HashMap::new();
    for entry in map.iter() {
        for loc in &entry.locations {
            if !path_ids.contains_key(loc.path.as_str()) {
                path_ids.insert(&loc.path, paths.len() as u32);
                paths.push(&loc.path);
            }
        }
    }

    let mut s = MemoryStream::new();
    s.write_u32(paths.len() as u32)?;
    for p in &paths {
        write_str(&mut s, p)?;
    }

    s.write_u32(map.len() as u32)?;
    for entry in map.iter() {
        s.write_u32(entry.crc)?;
        write_str(&mut s, &entry.name)?;
        s.write_u32(entry.width)?;
        s.write_u32(entry.height)?;
        s.write_u8(entry.format.map_or(NO_FORMAT, |f| f.to_u8()))?;
        s.write_u8(entry.kind.to_u8())?;
        s.write_u32(entry.locations.len() as u32)?;
        for loc in &entry.locations {
            s.write_u32(path_ids[loc.path.as_str()])?;
            s.write_u32(loc.export)?;
            s.write_u8(loc.mip_crcs.len() as u8)?;
            for &c in &loc.mip_crcs {
                s.write_u32(c)?;
            }
        }
    }
    Ok(s.into_inner())
}

fn decode(game: GameKind, data: Vec<u8>) -> Result<TextureMap> {
    let mut s = MemoryStream::from_vec(data);
    let path_count = s.read_u32()?;
    let mut paths = Vec::with_capacity(path_count.min(0x10_0000) as usize);
    for _ in 0..path_count {
        paths.push(read_str(&mut s)?);
    }

    let mut map = TextureMap::new(game);
    let count = s.read_u32()?;
    for _ in 0..count {
        let crc = s.read_u32()?;
        let name = read_str(&mut s)?;
        let width = s.read_u32()?;
        let height = s.read_u32()?;
        let format = match s.read_u8()? {
            NO_FORMAT => None,
            v => Some(PixelFormat::from_u8(v).ok_or_else(|| corrupt(format!("format id {}", v)))?),
        };
        let kind_id = s.read_u8()?;
        let kind = TextureType::from_u8(kind_id).ok_or_else(|| corrupt(format!("type id {}", kind_id)))?;
        let loc_count = s.read_u32()?;
        let mut locations = Vec::with_capacity(loc_count.min(0x1000) as usize);
        for _ in 0..loc_count {
            let path_id = s.read_u32()?;
            let path = paths
                .get(path_id as usize)
                .ok_or_else(|| corrupt(format!("path index {}", path_id)))?
                .clone();
            let export = s.read_u32()?;
            let mips = s.read_u8()?;
            let mut mip_crcs = Vec::with_capacity(mips as usize);
            for _ in 0..mips {
                mip_crcs.push(s.read_u32()?);
            }
            locations.push(TextureLocation {
                path,
                export,
                mip_crcs,
            });
        }
        map.insert(TextureMapEntry {
            crc,
            name,
            width,
            height,
            format,
            kind,
            locations,
        });
    }
    Ok(map)
}

/// Loads a cached map. Any mismatch with what was stored is `CacheCorrupt`;
/// callers rescan in that case.
pub fn load_cache(path: &Path, game: GameKind) -> Result<TextureMap> {
    let bytes = std::fs::read(path)?;
    let mut cursor = Cursor::new(&bytes);
    let header: CacheHeader = cursor.read_le().map_err(corrupt)?;
    if header.version != CACHE_VERSION {
        return Err(corrupt(format!("cache version {}", header.version)));
    }
    if header.game != game.id() {
        return Err(corrupt(format!("cache built for game {}", header.game)));
    }
    let blob = &bytes[cursor.position() as usize..];
    let data = lzma_decompress(blob, header.decompressed_size as usize).map_err(corrupt)?;
    if data.len() != header.decompressed_size as usize {
        return Err(corrupt(format!(
            "decompressed {} bytes, header says {}",
            data.len(),
            header.decompressed_size
        )));
    }
    let map = decode(game, data).map_err(|e| match e {
        Error::IoFault(_) => e,
        other => corrupt(other),
    })?;
    info!("Loaded texture map cache {:?}: {} entries", path, map.len());
    Ok(map)
}

pub fn save_cache(map: &TextureMap, path: &Path) -> Result<()> {
    let data = encode(map)?;
    let header = CacheHeader {
        version: CACHE_VERSION,
        game: map.game.id(),
        decompressed_size: data.len() as u32,
    };
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_le(&header)?;
    let mut out = cursor.into_inner();
    out.extend_from_slice(&lzma_compress(&data)?);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, out)?;
    info!("Saved texture map cache {:?}: {} entries", path, map.len());
    Ok(())
}
