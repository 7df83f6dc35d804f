//! MEM mod archives: a header, a table of file-mod records, and per-entry
//! payloads holding `{texture flags, target checksum}` plus DDS or Bink bytes.

pub mod writer;

use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::stream::{BinaryStream, FileStream};
use binrw::{binrw, BinReaderExt};
use log::info;
use std::path::{Path, PathBuf};

pub use writer::{create_from_dir, MemWriter};

pub const MEM_VERSION: u32 = 3;
pub const TAG_TEXTURE: u32 = u32::from_le_bytes(*b"TEXT");
pub const TAG_MOVIE: u32 = u32::from_le_bytes(*b"MOVI");

/// Texture flag: the payload's pixel format replaces the game's format.
pub const FLAG_CONVERTED: u32 = 0x1;

#[binrw]
#[derive(Debug, Clone)]
#[brw(little, magic = b"MEMT")]
pub struct MemHeader {
    pub version: u32,
    pub entry_table_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModKind {
    Texture,
    Movie,
}

impl ModKind {
    pub fn tag(self) -> u32 {
        match self {
            ModKind::Texture => TAG_TEXTURE,
            ModKind::Movie => TAG_MOVIE,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            TAG_TEXTURE => Some(ModKind::Texture),
            TAG_MOVIE => Some(ModKind::Movie),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ModKind::Texture => "dds",
            ModKind::Movie => "bik",
        }
    }
}

/// One record of the entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMod {
    pub kind: ModKind,
    pub name: String,
    pub offset: i64,
    pub size: i64,
    pub flags: i64,
}

/// Payload of one entry, read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModPayload {
    pub texture_flags: u32,
    pub target_crc: u32,
    pub data: Vec<u8>,
}

impl ModPayload {
    pub fn is_converted(&self) -> bool {
        self.texture_flags & FLAG_CONVERTED != 0
    }
}

pub struct MemArchive {
    pub path: PathBuf,
    pub header: MemHeader,
    stream: FileStream,
}

impl MemArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = FileStream::open(&path)?;
        let header: MemHeader = stream.read_le()?;
        let mut archive = Self {
            path,
            header,
            stream,
        };
        archive.check_header()?;
        Ok(archive)
    }

    pub fn check_header(&mut self) -> Result<()> {
        if self.header.version != MEM_VERSION {
            return Err(Error::corrupt(format!(
                "{:?}: MEM version {} (expected {})",
                self.path, self.header.version, MEM_VERSION
            )));
        }
        let len = self.stream.length()?;
        if self.header.entry_table_offset < 16 || self.header.entry_table_offset as u64 + 8 > len {
            return Err(Error::corrupt(format!(
                "{:?}: entry table offset 0x{:X} outside the file",
                self.path, self.header.entry_table_offset
            )));
        }
        Ok(())
    }

    pub fn game(&mut self) -> Result<Option<GameKind>> {
        self.stream.jump_to(self.header.entry_table_offset as u64)?;
        Ok(GameKind::from_id(self.stream.read_u32()?))
    }

    pub fn check_game_version(&mut self, expected: GameKind) -> Result<()> {
        match self.game()? {
            Some(g) if g == expected => Ok(()),
            other => Err(Error::parse(format!(
                "{:?} targets {:?}, not {}",
                self.path, other, expected
            ))),
        }
    }

    /// Lazily walks the entry table from its start; call again to restart.
    pub fn entries(&mut self) -> Result<FileModIter<'_>> {
        self.stream.jump_to(self.header.entry_table_offset as u64 + 4)?;
        let remaining = self.stream.read_u32()?;
        let next = self.stream.position()?;
        Ok(FileModIter {
            stream: &mut self.stream,
            remaining,
            next,
        })
    }

    /// Convenience wrapper collecting the whole table.
    pub fn file_mods(&mut self) -> Result<Vec<FileMod>> {
        self.entries()?.collect()
    }

    pub fn read_payload(&mut self, entry: &FileMod) -> Result<ModPayload> {
        let len = self.stream.length()?;
        let end = entry.offset.checked_add(entry.size);
        if entry.offset < 0 || entry.size < 8 || end.map_or(true, |end| end as u64 > len) {
            return Err(Error::corrupt(format!(
                "{}: payload 0x{:X}+0x{:X} outside the archive",
                entry.name, entry.offset, entry.size
            )));
        }
        self.stream.jump_to(entry.offset as u64)?;
        let texture_flags = self.stream.read_u32()?;
        let target_crc = self.stream.read_u32()?;
        let data = self.stream.read_bytes(entry.size as usize - 8)?;
        Ok(ModPayload {
            texture_flags,
            target_crc,
            data,
        })
    }

    /// Dumps every entry to `<name>_0x<CRC>.dds|.bik` under `out_dir`.
    pub fn extract_all(&mut self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)?;
        let mods = self.file_mods()?;
        let mut written = Vec::with_capacity(mods.len());
        for m in &mods {
            let payload = self.read_payload(m)?;
            let stem: String = m
                .name
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
                .collect();
            let file = out_dir.join(format!(
                "{}_0x{:08X}.{}",
                stem,
                payload.target_crc,
                m.kind.extension()
            ));
            std::fs::write(&file, &payload.data)?;
            written.push(file);
        }
        info!("Extracted {} entries from {:?}", written.len(), self.path);
        Ok(written)
    }
}

pub struct FileModIter<'a> {
    stream: &'a mut FileStream,
    remaining: u32,
    next: u64,
}

impl Iterator for FileModIter<'_> {
    type Item = Result<FileMod>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = read_file_mod(self.stream, self.next);
        match &item {
            Ok(_) => self.next = self.stream.position().unwrap_or(self.next),
            Err(_) => self.remaining = 0,
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

fn read_file_mod(stream: &mut FileStream, at: u64) -> Result<FileMod> {
    stream.jump_to(at)?;
    let tag = stream.read_u32()?;
    let kind = ModKind::from_tag(tag)
        .ok_or_else(|| Error::corrupt(format!("unknown MEM entry tag 0x{:08X}", tag)))?;
    let name = stream.read_null_terminated_utf16()?;
    let offset = stream.read_i64()?;
    let size = stream.read_i64()?;
    let flags = stream.read_i64()?;
    Ok(FileMod {
        kind,
        name,
        offset,
        size,
        flags,
    })
}

/// Splits a loose file name carrying `0x<CRC>` into (name, crc).
pub fn parse_crc_name(stem: &str) -> Option<(String, u32)> {
    let lower = stem.to_ascii_lowercase();
    let at = lower.rfind("0x")?;
    let hex: String = lower[at + 2..].chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 8 {
        return None;
    }
    let crc = u32::from_str_radix(&hex, 16).ok()?;
    let name = stem[..at].trim_end_matches(|c| c == '_' || c == '-' || c == ' ');
    let name = if name.is_empty() { stem } else { name };
    Some((name.to_string(), crc))
}
