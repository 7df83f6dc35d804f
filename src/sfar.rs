//! ME3 DLC archives (SFAR): a header, fixed 30-byte file records, a `u16`
//! block-size table and LZMA-compressed 64 KiB blocks.

use crate::codec::{lzma_compress, lzma_decompress};
use crate::error::{Error, Result};
use crate::stream::{BinaryStream, FileStream};
use binrw::{binrw, BinReaderExt, BinWriterExt};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const SFAR_VERSION: u32 = 0x0001_0000;
pub const LZMA_TAG: u32 = u32::from_le_bytes(*b"lzma");
pub const HEADER_SIZE: u32 = 32;
pub const ENTRY_SIZE: u32 = 30;
pub const MAX_BLOCK_SIZE: u32 = 0x10000;
/// Block index of a file stored without blocks.
pub const STORED: u32 = 0xFFFF_FFFF;

/// Name hash of the distinguished file-list entry.
pub const FILE_LIST_HASH: [u8; 16] = [
    0xb5, 0x50, 0x19, 0xcb, 0xf9, 0xd3, 0xda, 0x65, 0xd5, 0x5b, 0x32, 0x1c, 0x00, 0x19, 0x69, 0x7c,
];

#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(little, magic = b"SFAR")]
pub struct SfarHeader {
    pub version: u32,
    pub header_size: u32,
    pub entries_offset: u32,
    pub file_count: u32,
    pub block_table_offset: u32,
    pub max_block_size: u32,
    pub compression_tag: u32,
}

impl SfarHeader {
    /// Header of an archive whose contents have been unpacked.
    pub fn shell() -> Self {
        Self {
            version: SFAR_VERSION,
            header_size: HEADER_SIZE,
            entries_offset: HEADER_SIZE,
            file_count: 0,
            block_table_offset: HEADER_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            compression_tag: LZMA_TAG,
        }
    }
}

#[binrw]
#[derive(Debug, Clone, Copy)]
#[brw(little)]
struct RawEntry {
    hash: [u8; 16],
    block_index: u32,
    size_lo: u32,
    size_hi: u8,
    offset_lo: u32,
    offset_hi: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfarEntry {
    pub hash: [u8; 16],
    pub block_index: u32,
    pub size: u64,
    pub offset: u64,
    pub name: Option<String>,
}

impl SfarEntry {
    pub fn is_file_list(&self) -> bool {
        self.hash == FILE_LIST_HASH
    }

    fn block_count(&self, max_block: u32) -> usize {
        (self.size as usize).div_ceil(max_block as usize)
    }
}

impl From<RawEntry> for SfarEntry {
    fn from(raw: RawEntry) -> Self {
        Self {
            hash: raw.hash,
            block_index: raw.block_index,
            size: raw.size_lo as u64 | (raw.size_hi as u64) << 32,
            offset: raw.offset_lo as u64 | (raw.offset_hi as u64) << 32,
            name: None,
        }
    }
}

impl From<&SfarEntry> for RawEntry {
    fn from(e: &SfarEntry) -> Self {
        Self {
            hash: e.hash,
            block_index: e.block_index,
            size_lo: e.size as u32,
            size_hi: (e.size >> 32) as u8,
            offset_lo: e.offset as u32,
            offset_hi: (e.offset >> 32) as u8,
        }
    }
}

/// MD5 of the lower-cased, `/`-separated path; how records are keyed.
pub fn path_hash(path: &str) -> [u8; 16] {
    ::md5::compute(path.to_ascii_lowercase().as_bytes()).0
}

pub struct Sfar {
    pub path: PathBuf,
    pub header: SfarHeader,
    pub entries: Vec<SfarEntry>,
    block_sizes: Vec<u16>,
    stream: FileStream,
}

impl Sfar {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = FileStream::open(&path)?;
        let header: SfarHeader = stream.read_le()?;
        if header.version != SFAR_VERSION || header.compression_tag != LZMA_TAG {
            return Err(Error::corrupt(format!(
                "{:?}: unsupported SFAR version 0x{:X} / compression 0x{:08X}",
                path, header.version, header.compression_tag
            )));
        }
        if header.max_block_size == 0 || header.max_block_size > MAX_BLOCK_SIZE {
            return Err(Error::corrupt(format!("{:?}: block size {}", path, header.max_block_size)));
        }

        let len = stream.length()?;
        let entries_end = header.entries_offset as u64 + header.file_count as u64 * ENTRY_SIZE as u64;
        if entries_end > len || header.header_size as u64 > len || header.block_table_offset > header.header_size {
            return Err(Error::corrupt(format!(
                "{:?}: tables (records end 0x{:X}, header 0x{:X}) do not fit a {} byte archive",
                path, entries_end, header.header_size, len
            )));
        }

        stream.jump_to(header.entries_offset as u64)?;
        let mut entries = Vec::with_capacity(header.file_count as usize);
        for _ in 0..header.file_count {
            let raw: RawEntry = stream.read_le()?;
            entries.push(SfarEntry::from(raw));
        }

        let table_len = header.header_size.saturating_sub(header.block_table_offset) / 2;
        stream.jump_to(header.block_table_offset as u64)?;
        let mut block_sizes = Vec::with_capacity(table_len as usize);
        for _ in 0..table_len {
            block_sizes.push(stream.read_u16()?);
        }

        let mut sfar = Self {
            path,
            header,
            entries,
            block_sizes,
            stream,
        };
        sfar.resolve_names()?;
        Ok(sfar)
    }

    fn resolve_names(&mut self) -> Result<()> {
        let list = match self.entries.iter().position(|e| e.is_file_list()) {
            Some(i) => i,
            None => {
                if !self.entries.is_empty() {
                    warn!("{:?} has no file list entry", self.path);
                }
                return Ok(());
            }
        };
        let text = self.read_entry(list)?;
        let by_hash: HashMap<[u8; 16], String> = String::from_utf8_lossy(&text)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| (path_hash(l), l.to_string()))
            .collect();
        for entry in &mut self.entries {
            if !entry.is_file_list() {
                entry.name = by_hash.get(&entry.hash).cloned();
            }
        }
        Ok(())
    }

    fn block_len(&self, index: usize) -> Result<usize> {
        let raw = *self
            .block_sizes
            .get(index)
            .ok_or_else(|| Error::corrupt(format!("block {} outside the block table", index)))?;
        Ok(if raw == 0 { self.header.max_block_size as usize } else { raw as usize })
    }

    /// Reads and inflates one record. Blocks are read in order, then inflated
    /// in parallel into disjoint slices of the output.
    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = self.entries[index].clone();
        self.stream.jump_to(entry.offset)?;
        if entry.block_index == STORED {
            return self.stream.read_bytes(entry.size as usize);
        }

        let max_block = self.header.max_block_size;
        let count = entry.block_count(max_block);
        let first = entry.block_index as usize;
        if first.saturating_add(count) > self.block_sizes.len() {
            return Err(Error::corrupt(format!(
                "record {} needs blocks {}..{} of a {} entry table",
                index,
                first,
                first.saturating_add(count),
                self.block_sizes.len()
            )));
        }
        let packed: u64 = (first..first + count)
            .map(|b| self.block_len(b).map(|l| l as u64))
            .sum::<Result<u64>>()?;
        let remaining = self.stream.length()?.saturating_sub(entry.offset);
        if packed > remaining {
            return Err(Error::corrupt(format!(
                "record {} spans {} packed bytes with {} left in the archive",
                index, packed, remaining
            )));
        }
        let mut payloads = Vec::with_capacity(count);
        for n in 0..count {
            let len = self.block_len(first + n)?;
            payloads.push(self.stream.read_bytes(len)?);
        }

        let mut out = vec![0u8; entry.size as usize];
        out.par_chunks_mut(max_block as usize)
            .zip(payloads.par_iter())
            .try_for_each(|(dst, src)| -> Result<()> {
                if src.len() == dst.len() {
                    dst.copy_from_slice(src);
                    return Ok(());
                }
                let inflated = lzma_decompress(src, dst.len())?;
                if inflated.len() != dst.len() {
                    return Err(Error::corrupt(format!(
                        "SFAR block inflated to {} bytes, expected {}",
                        inflated.len(),
                        dst.len()
                    )));
                }
                dst.copy_from_slice(&inflated);
                Ok(())
            })?;
        Ok(out)
    }
}

fn safe_join(root: &Path, archive_path: &str) -> Result<PathBuf> {
    let rel = Path::new(archive_path.trim_start_matches(['/', '\\']));
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(Error::parse(format!("unsafe path in SFAR file list: {}", archive_path)));
    }
    Ok(root.join(rel))
}

/// Unpacks every named record under `output_dir`, then rewrites the archive
/// as a header-only shell.
pub fn extract(path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sfar = Sfar::open(path)?;
    let mut written = Vec::new();
    for index in 0..sfar.entries.len() {
        if sfar.entries[index].is_file_list() {
            continue;
        }
        let name = match &sfar.entries[index].name {
            Some(n) => n.clone(),
            None => {
                warn!("{:?}: record {} has no name in the file list", path, index);
                continue;
            }
        };
        let target = safe_join(output_dir, &name)?;
        let data = sfar.read_entry(index)?;
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&target, &data)?;
        debug!("Unpacked {} ({} bytes)", name, data.len());
        written.push(target);
    }
    drop(sfar);

    let mut shell = FileStream::open_rw(path)?;
    shell.write_le(&SfarHeader::shell())?;
    shell.set_len(HEADER_SIZE as u64)?;
    shell.sync()?;
    info!("Unpacked {} files from {:?}", written.len(), path);
    Ok(written)
}

pub fn is_unpacked(path: &Path) -> Result<bool> {
    Ok(std::fs::metadata(path)?.len() == HEADER_SIZE as u64)
}

struct PackedFile {
    hash: [u8; 16],
    size: u64,
    blocks: Vec<Vec<u8>>,
}

fn pack_file(hash: [u8; 16], data: &[u8]) -> Result<PackedFile> {
    let blocks = data
        .par_chunks(MAX_BLOCK_SIZE as usize)
        .map(|block| {
            let packed = lzma_compress(block)?;
            Ok(if packed.len() < block.len() { packed } else { block.to_vec() })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PackedFile {
        hash,
        size: data.len() as u64,
        blocks,
    })
}

/// Builds an archive from every file under `input_dir`. Record names are
/// `/`-prefixed paths relative to `input_dir`.
pub fn pack(input_dir: &Path, output: &Path) -> Result<usize> {
    let mut files = Vec::new();
    for entry in WalkDir::new(input_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoFault(e.into()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    pack_files(input_dir, &files, output)
}

/// Builds an archive from `paths`, naming each record by its path relative
/// to `root`.
pub fn pack_files(root: &Path, paths: &[PathBuf], output: &Path) -> Result<usize> {
    let mut names = Vec::with_capacity(paths.len());
    for path in paths {
        let rel = path.strip_prefix(root).map_err(|e| Error::parse(e.to_string()))?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        names.push((path.clone(), format!("/{}", parts.join("/"))));
    }

    let mut files = Vec::with_capacity(names.len() + 1);
    for (path, name) in &names {
        files.push(pack_file(path_hash(name), &std::fs::read(path)?)?);
    }
    let list: String = names.iter().map(|(_, n)| format!("{}\r\n", n)).collect();
    files.push(pack_file(FILE_LIST_HASH, list.as_bytes())?);

    let block_total: usize = files.iter().map(|f| f.blocks.len()).sum();
    let block_table_offset = HEADER_SIZE + ENTRY_SIZE * files.len() as u32;
    let header = SfarHeader {
        version: SFAR_VERSION,
        header_size: block_table_offset + 2 * block_total as u32,
        entries_offset: HEADER_SIZE,
        file_count: files.len() as u32,
        block_table_offset,
        max_block_size: MAX_BLOCK_SIZE,
        compression_tag: LZMA_TAG,
    };

    let mut stream = FileStream::create(output)?;
    stream.write_le(&header)?;
    let mut offset = header.header_size as u64;
    let mut block_index = 0u32;
    for f in &files {
        let entry = SfarEntry {
            hash: f.hash,
            block_index,
            size: f.size,
            offset,
            name: None,
        };
        stream.write_le(&RawEntry::from(&entry))?;
        block_index += f.blocks.len() as u32;
        offset += f.blocks.iter().map(|b| b.len() as u64).sum::<u64>();
    }
    for f in &files {
        for b in &f.blocks {
            // a full-size block reads back as 0
            stream.write_u16(if b.len() == MAX_BLOCK_SIZE as usize { 0 } else { b.len() as u16 })?;
        }
    }
    for f in &files {
        for b in &f.blocks {
            stream.write_bytes(b)?;
        }
    }
    stream.sync()?;
    info!("Packed {} files into {:?}", names.len(), output);
    Ok(names.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forty_bit_fields_split() {
        let e = SfarEntry {
            hash: [0; 16],
            block_index: 3,
            size: 0x12_3456_789A,
            offset: 0x01_0000_0000,
            name: None,
        };
        let raw = RawEntry::from(&e);
        assert_eq!(raw.size_hi, 0x12);
        assert_eq!(raw.size_lo, 0x3456_789A);
        assert_eq!(SfarEntry::from(raw), e);
    }
}
