pub mod header;
pub mod tables;

use crate::codec::{decompress_chunk, Codecs};
use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::marker;
use crate::stream::{BinaryStream, FileStream, MemoryStream};
use header::PackageHeader;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tables::{ExportEntry, ImportEntry, NameTable};

/// Trailer appended to every package rewritten by an install.
pub const MEM_END_MARKER: &[u8] = b"ThisIsMEMEndOfFileMarker";

pub struct Package {
    pub path: PathBuf,
    pub header: PackageHeader,
    pub names: NameTable,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    source: Box<dyn BinaryStream + Send>,
    codecs: Codecs,
    /// Length of the uncompressed header as laid out in `source`.
    header_len: u64,
    /// End of package content in `source`, trailers excluded.
    body_len: u64,
    names_end: u64,
    was_compressed: bool,
    has_mem_marker: bool,
    /// Install marker record carried by the sentinel package, kept last on save.
    install_record: Vec<u8>,
    staged: BTreeMap<usize, Vec<u8>>,
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("path", &self.path)
            .field("game", &self.header.game)
            .field("names", &self.names.len())
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl Package {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &Codecs::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, codecs: &Codecs) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = FileStream::open(&path)?;
        let file_len = file.length()?;

        let install_record = marker::trailing_record(&mut file)?;
        let mut content_end = file_len - install_record.len() as u64;
        let has_mem_marker = ends_with_mem_marker(&mut file, content_end)?;
        if has_mem_marker {
            content_end -= MEM_END_MARKER.len() as u64;
        }

        file.jump_to(0)?;
        let mut header = PackageHeader::read(&mut file)?;
        let was_compressed = header.is_compressed();

        let (mut source, header_len, body_len): (Box<dyn BinaryStream + Send>, u64, u64) =
            if was_compressed {
                let (memory, header_len) = inflate_body(&mut file, &mut header, codecs)?;
                let len = memory.as_slice().len() as u64;
                (Box::new(memory), header_len, len)
            } else {
                let header_len = file.position()?;
                (Box::new(file), header_len, content_end)
            };

        if header.exports_count as u64 * ExportEntry::DATA_FIELDS_AT > body_len
            || header.imports_count as u64 * ImportEntry::SIZE > body_len
            || header.names_count as u64 * 5 > body_len
        {
            return Err(Error::parse("table counts too large for package size"));
        }
        for (table, offset, count) in [
            ("names", header.names_offset, header.names_count),
            ("imports", header.imports_offset, header.imports_count),
            ("exports", header.exports_offset, header.exports_count),
        ] {
            if count > 0 && ((offset as u64) < header_len || offset as u64 >= body_len) {
                return Err(Error::parse(format!(
                    "{} table offset 0x{:X} outside the package (0x{:X}..0x{:X})",
                    table, offset, header_len, body_len
                )));
            }
        }

        source.jump_to(header.names_offset as u64)?;
        let names = NameTable::read(source.as_mut(), header.game, header.names_count)?;
        let names_end = source.position()?;

        source.jump_to(header.imports_offset as u64)?;
        let mut imports = Vec::with_capacity(header.imports_count as usize);
        for _ in 0..header.imports_count {
            imports.push(ImportEntry::read(source.as_mut())?);
        }

        source.jump_to(header.exports_offset as u64)?;
        let mut exports = Vec::with_capacity(header.exports_count as usize);
        for _ in 0..header.exports_count {
            exports.push(ExportEntry::read(source.as_mut(), header.game)?);
        }

        for (i, e) in exports.iter().enumerate() {
            if e.data_size > 0 && e.data_offset as u64 + e.data_size as u64 > body_len {
                return Err(Error::parse(format!(
                    "export {} data 0x{:X}+0x{:X} runs past end of package",
                    i, e.data_offset, e.data_size
                )));
            }
        }

        debug!(
            "Opened {:?}: {} names, {} imports, {} exports{}",
            path,
            names.len(),
            imports.len(),
            exports.len(),
            if was_compressed { " (compressed)" } else { "" }
        );

        Ok(Self {
            path,
            header,
            names,
            imports,
            exports,
            source,
            codecs: codecs.clone(),
            header_len,
            body_len,
            names_end,
            was_compressed,
            has_mem_marker,
            install_record,
            staged: BTreeMap::new(),
        })
    }

    pub fn game(&self) -> GameKind {
        self.header.game
    }

    pub fn has_mem_marker(&self) -> bool {
        self.has_mem_marker
    }

    pub fn was_compressed(&self) -> bool {
        self.was_compressed
    }

    pub fn is_staged(&self, index: usize) -> bool {
        self.staged.contains_key(&index)
    }

    /// True once an export has been staged. Names added on their own do not
    /// make the package worth rewriting.
    pub fn has_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    fn export(&self, index: usize) -> Result<&ExportEntry> {
        self.exports
            .get(index)
            .ok_or_else(|| Error::parse(format!("export index {} out of range", index)))
    }

    pub fn export_data(&mut self, index: usize) -> Result<Vec<u8>> {
        if let Some(data) = self.staged.get(&index) {
            return Ok(data.clone());
        }
        let (offset, size) = {
            let e = self.export(index)?;
            (e.data_offset as u64, e.data_size as usize)
        };
        self.source.jump_to(offset)?;
        self.source.read_bytes(size)
    }

    /// Stages new data for one export; nothing is written until `save`.
    pub fn set_export_data(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        self.export(index)?;
        self.staged.insert(index, data);
        Ok(())
    }

    pub fn object_name(&self, index: usize) -> Result<String> {
        self.names.resolve(self.export(index)?.object_name)
    }

    /// Name of the object an import/export reference points at.
    fn reference_name(&self, id: i32) -> Result<String> {
        if id > 0 {
            self.object_name(id as usize - 1)
        } else if id < 0 {
            let import = self
                .imports
                .get((-id - 1) as usize)
                .ok_or_else(|| Error::parse(format!("import reference {} out of range", id)))?;
            self.names.resolve(import.object_name)
        } else {
            Ok("Class".to_string())
        }
    }

    pub fn class_name(&self, index: usize) -> Result<String> {
        self.reference_name(self.export(index)?.class_id)
    }

    /// Dotted path of an export through its outers.
    pub fn full_path(&self, index: usize) -> Result<String> {
        let mut parts = vec![self.object_name(index)?];
        let mut outer = self.export(index)?.outer;
        let mut guard = 0;
        while outer != 0 && guard < 64 {
            parts.push(self.reference_name(outer)?);
            outer = if outer > 0 {
                self.export(outer as usize - 1)?.outer
            } else {
                self.imports
                    .get((-outer - 1) as usize)
                    .map_or(0, |i| i.outer)
            };
            guard += 1;
        }
        parts.reverse();
        Ok(parts.join("."))
    }

    /// Top-level package an export belongs to; the file stem when it has no outer.
    pub fn outermost_package(&self, index: usize) -> Result<String> {
        let path = self.full_path(index)?;
        if self.export(index)?.outer == 0 {
            return Ok(self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default());
        }
        Ok(path.split('.').next().unwrap_or_default().to_string())
    }

    /// Writes the package back to its own path through a temporary file.
    pub fn save(&mut self, append_marker: bool) -> Result<()> {
        let path = self.path.clone();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".memtex-tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = self.write_to(&tmp, append_marker) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        replace_file(&mut self.source, !self.was_compressed, &tmp, &path)?;
        *self = Package::open_with(&path, &self.codecs)?;
        Ok(())
    }

    /// Single bulk pass: copies the table prefix, lays export data out
    /// contiguously in offset order, carries the tail and rewrites every export
    /// record's size and offset.
    pub fn write_to(&mut self, target: &Path, append_marker: bool) -> Result<()> {
        let game = self.header.game;
        let mut order: Vec<usize> = (0..self.exports.len()).collect();
        order.sort_by_key(|&i| (self.exports[i].data_offset, i));

        let populated = || self.exports.iter().filter(|e| e.data_size > 0);
        let data_start = populated()
            .map(|e| e.data_offset as u64)
            .min()
            .unwrap_or(self.body_len);
        let data_end = populated()
            .map(|e| e.data_offset as u64 + e.data_size as u64)
            .max()
            .unwrap_or(data_start);
        if data_start < self.header_len {
            return Err(Error::parse("export data overlaps the package header"));
        }

        // layout: keep gaps between neighbouring exports
        let mut placements: Vec<(usize, u64, u64, u64)> = Vec::with_capacity(order.len());
        let mut prev_old_end = data_start;
        let mut pos = data_start;
        for &i in &order {
            let e = &self.exports[i];
            let old = e.data_offset as u64;
            let gap = if e.data_size > 0 { old.saturating_sub(prev_old_end) } else { 0 };
            let size = match self.staged.get(&i) {
                Some(d) => d.len() as u64,
                None => e.data_size as u64,
            };
            pos += gap;
            placements.push((i, gap, pos, size));
            pos += size;
            if e.data_size > 0 {
                prev_old_end = prev_old_end.max(old + e.data_size as u64);
            }
        }
        let new_data_end = pos;
        let delta = new_data_end as i64 - data_end as i64;
        if new_data_end > u32::MAX as u64 {
            return Err(Error::parse("rewritten package exceeds 4 GiB"));
        }

        let mut tail_end = self.body_len;
        let names_grown = self.names.is_grown();
        if names_grown
            && self.header.names_offset as u64 >= data_end
            && self.names_end == self.body_len
        {
            tail_end = self.header.names_offset as u64;
        }

        let shift = |v: u32| -> u32 {
            if v as u64 >= data_end && v != 0 {
                (v as i64 + delta) as u32
            } else {
                v
            }
        };
        let mut header = self.header.clone();
        header.names_offset = shift(header.names_offset);
        header.imports_offset = shift(header.imports_offset);
        header.exports_offset = shift(header.exports_offset);
        header.depends_offset = shift(header.depends_offset);
        if game == GameKind::Me3 {
            header.me3_extra[0] = shift(header.me3_extra[0]);
            header.me3_extra[3] = shift(header.me3_extra[3]);
        }
        let names_position = new_data_end + tail_end.saturating_sub(data_end);
        if names_grown {
            header.names_offset = names_position as u32;
            header.names_count = self.names.len() as u32;
        }

        let mut out = FileStream::create(target)?;
        header.write(&mut out)?;
        if out.position()? != self.header_len {
            return Err(Error::parse("package header changed size while saving"));
        }
        self.source.jump_to(self.header_len)?;
        out.copy_from(self.source.as_mut(), data_start - self.header_len)?;

        let mut new_offsets = vec![(0u32, 0u32); self.exports.len()];
        let mut prev_old_end = data_start;
        for &(i, gap, new_offset, size) in &placements {
            if gap > 0 {
                self.source.jump_to(prev_old_end)?;
                out.copy_from(self.source.as_mut(), gap)?;
            }
            let e = &self.exports[i];
            let moved = new_offset != e.data_offset as u64;
            let staged = self.staged.contains_key(&i);
            if staged || (moved && e.data_size > 0) {
                let mut data = match self.staged.get(&i) {
                    Some(d) => d.clone(),
                    None => {
                        self.source.jump_to(e.data_offset as u64)?;
                        self.source.read_bytes(e.data_size as usize)?
                    }
                };
                let class = self.class_name(i)?;
                if let Some(rebased) =
                    crate::texture::rebase_export(&data, &self.names, game, &class, new_offset as u32)?
                {
                    if rebased.len() != data.len() {
                        return Err(Error::parse(format!(
                            "export {} changed size while relocating mips",
                            i
                        )));
                    }
                    data = rebased;
                }
                out.write_bytes(&data)?;
            } else if size > 0 {
                self.source.jump_to(e.data_offset as u64)?;
                out.copy_from(self.source.as_mut(), size)?;
            }
            let recorded = if size == 0 && !staged { e.data_offset } else { new_offset as u32 };
            new_offsets[i] = (size as u32, recorded);
            if e.data_size > 0 {
                prev_old_end = prev_old_end.max(e.data_offset as u64 + e.data_size as u64);
            }
        }

        if tail_end > data_end {
            self.source.jump_to(data_end)?;
            out.copy_from(self.source.as_mut(), tail_end - data_end)?;
        }
        if names_grown {
            self.names.write(&mut out, game)?;
        }
        let content_end = out.position()?;

        for (i, e) in self.exports.iter().enumerate() {
            let mut at = e.table_position;
            if at >= data_end {
                at = (at as i64 + delta) as u64;
            }
            out.jump_to(at + ExportEntry::DATA_FIELDS_AT)?;
            out.write_u32(new_offsets[i].0)?;
            out.write_u32(new_offsets[i].1)?;
        }

        out.jump_to(content_end)?;
        if append_marker || self.has_mem_marker {
            out.write_bytes(MEM_END_MARKER)?;
        }
        if !self.install_record.is_empty() {
            out.write_bytes(&self.install_record)?;
        }
        out.sync()?;

        debug!(
            "Wrote {:?}: {} staged exports, data 0x{:X}..0x{:X}",
            target,
            self.staged.len(),
            data_start,
            new_data_end
        );
        Ok(())
    }
}

/// Moves `tmp` over `path`. A file-backed `source` is released first and
/// reattached to `path` if the move fails, so the package stays readable.
fn replace_file(
    source: &mut Box<dyn BinaryStream + Send>,
    file_backed: bool,
    tmp: &Path,
    path: &Path,
) -> Result<()> {
    if file_backed {
        *source = Box::new(MemoryStream::new());
    }
    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        if file_backed {
            *source = Box::new(FileStream::open(path)?);
        }
        return Err(e.into());
    }
    Ok(())
}

fn ends_with_mem_marker(file: &mut FileStream, content_end: u64) -> Result<bool> {
    let len = MEM_END_MARKER.len() as u64;
    if content_end < len {
        return Ok(false);
    }
    file.jump_to(content_end - len)?;
    Ok(file.read_bytes(len as usize)? == MEM_END_MARKER)
}

/// Expands a chunked package into memory. The header is re-emitted without
/// its chunk table and the body keeps its uncompressed offsets.
fn inflate_body(
    file: &mut FileStream,
    header: &mut PackageHeader,
    codecs: &Codecs,
) -> Result<(MemoryStream, u64)> {
    let codec = header.codec()?;
    let chunks = header.chunks.clone();
    header.mark_uncompressed();

    let mut memory = MemoryStream::new();
    header.write(&mut memory)?;
    let header_len = memory.position()?;

    let first = chunks
        .iter()
        .map(|c| c.uncompressed_offset as u64)
        .min()
        .unwrap_or(header_len);
    if first < header_len {
        return Err(Error::parse("compressed chunks overlap the package header"));
    }

    let body_end = chunks
        .iter()
        .fold(first, |end, c| end + c.uncompressed_size as u64);
    for (i, chunk) in chunks.iter().enumerate() {
        file.jump_to(chunk.compressed_offset as u64)?;
        let data = decompress_chunk(codecs, codec, file)?;
        if chunk.uncompressed_offset as u64 + data.len() as u64 > body_end {
            return Err(Error::corrupt(format!(
                "chunk {} lands at 0x{:X}+0x{:X}, past the 0x{:X} byte body",
                i,
                chunk.uncompressed_offset,
                data.len(),
                body_end
            )));
        }
        if data.len() != chunk.uncompressed_size as usize {
            warn!(
                "Chunk {} inflated to {} bytes, table says {}",
                i,
                data.len(),
                chunk.uncompressed_size
            );
        }
        memory.jump_to(chunk.uncompressed_offset as u64)?;
        memory.write_bytes(&data)?;
    }
    Ok((memory, header_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_swap_leaves_the_source_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BioA_Swap.pcc");
        std::fs::write(&path, b"original package bytes").unwrap();
        let mut source: Box<dyn BinaryStream + Send> = Box::new(FileStream::open(&path).unwrap());

        let missing = dir.path().join("BioA_Swap.pcc.memtex-tmp");
        assert!(matches!(
            replace_file(&mut source, true, &missing, &path),
            Err(Error::IoFault(_))
        ));
        source.jump_to(0).unwrap();
        assert_eq!(source.read_bytes(8).unwrap(), b"original");
        assert_eq!(std::fs::read(&path).unwrap(), b"original package bytes");
    }

    #[test]
    fn swap_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BioA_Swap.pcc");
        let tmp = dir.path().join("BioA_Swap.pcc.memtex-tmp");
        std::fs::write(&path, b"old").unwrap();
        std::fs::write(&tmp, b"new").unwrap();
        let mut source: Box<dyn BinaryStream + Send> = Box::new(FileStream::open(&path).unwrap());

        replace_file(&mut source, true, &tmp, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!tmp.exists());
    }
}
