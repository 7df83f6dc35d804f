use super::{parse_crc_name, FileMod, MemHeader, ModKind, MEM_VERSION};
use crate::config::{has_extension, GameKind};
use crate::error::{Error, Result};
use crate::image::dds::{read_dds, write_dds};
use crate::image::Image;
use crate::stream::{BinaryStream, FileStream};
use binrw::BinWriterExt;
use log::{info, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "tga", "bmp"];

/// Streams payloads to disk as they are added; the entry table is written
/// by [`MemWriter::finish`].
pub struct MemWriter {
    path: PathBuf,
    game: GameKind,
    stream: FileStream,
    entries: Vec<FileMod>,
}

impl MemWriter {
    pub fn create<P: AsRef<Path>>(path: P, game: GameKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = FileStream::create(&path)?;
        stream.write_le(&MemHeader {
            version: MEM_VERSION,
            entry_table_offset: 0,
        })?;
        Ok(Self {
            path,
            game,
            stream,
            entries: Vec::new(),
        })
    }

    fn add(&mut self, kind: ModKind, name: &str, texture_flags: u32, target_crc: u32, data: &[u8]) -> Result<()> {
        let offset = self.stream.position()?;
        self.stream.write_u32(texture_flags)?;
        self.stream.write_u32(target_crc)?;
        self.stream.write_bytes(data)?;
        self.entries.push(FileMod {
            kind,
            name: name.to_string(),
            offset: offset as i64,
            size: data.len() as i64 + 8,
            flags: 0,
        });
        Ok(())
    }

    /// `dds` is a complete DDS file image.
    pub fn add_texture(&mut self, name: &str, target_crc: u32, texture_flags: u32, dds: &[u8]) -> Result<()> {
        self.add(ModKind::Texture, name, texture_flags, target_crc, dds)
    }

    pub fn add_movie(&mut self, name: &str, target_crc: u32, bink: &[u8]) -> Result<()> {
        self.add(ModKind::Movie, name, 0, target_crc, bink)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        let table_offset = self.stream.position()?;
        self.stream.write_u32(self.game.id())?;
        self.stream.write_u32(self.entries.len() as u32)?;
        for e in &self.entries {
            self.stream.write_u32(e.kind.tag())?;
            self.stream.write_null_terminated_utf16(&e.name)?;
            self.stream.write_i64(e.offset)?;
            self.stream.write_i64(e.size)?;
            self.stream.write_i64(e.flags)?;
        }
        self.stream.jump_to(8)?;
        self.stream.write_i64(table_offset as i64)?;
        self.stream.sync()?;
        info!("Wrote {:?} with {} entries", self.path, self.entries.len());
        Ok(self.path)
    }
}

/// Packs every loose file under `dir` whose name carries `0x<CRC>` into a
/// new MEM archive. DDS files are stored as they are, PNG/TGA/BMP are
/// converted to an uncompressed DDS and Bink files become movie entries.
/// Returns the number of entries written.
pub fn create_from_dir(dir: &Path, output: &Path, game: GameKind) -> Result<usize> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut writer = MemWriter::create(output, game)?;
    for file in &files {
        let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let (name, crc) = match parse_crc_name(stem) {
            Some(found) => found,
            None => {
                warn!("Skipping {:?}: no 0x<CRC> in the file name", file);
                continue;
            }
        };

        if has_extension(file, &["dds"]) {
            let bytes = std::fs::read(file)?;
            read_dds(&bytes).map_err(|e| Error::parse(format!("{}: {}", file.display(), e)))?;
            writer.add_texture(&name, crc, 0, &bytes)?;
        } else if has_extension(file, &IMAGE_EXTENSIONS) {
            let image = Image::from_image_file(file)?;
            writer.add_texture(&name, crc, 0, &write_dds(&image)?)?;
        } else if has_extension(file, &["bik"]) {
            writer.add_movie(&name, crc, &std::fs::read(file)?)?;
        } else {
            warn!("Skipping {:?}: unsupported file type", file);
        }
    }

    let count = writer.len();
    writer.finish()?;
    Ok(count)
}
