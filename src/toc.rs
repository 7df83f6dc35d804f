//! `PCConsoleTOC.bin`: the ME3 file-size table for the base game and each DLC.
//! Sizes must match the files on disk or the game refuses to load them.

use crate::config::{GameConfig, GameKind};
use crate::error::{Error, Result};
use crate::stream::{BinaryStream, FileStream};
use log::info;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const TOC_TAG: u32 = 0x3AB7_0C13;
pub const TOC_FILE_NAME: &str = "PCConsoleTOC.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// Path relative to the game root, `\`-separated.
    pub name: String,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toc {
    pub entries: Vec<TocEntry>,
}

fn record_len(name: &str) -> usize {
    // size, flags, file size, hash, name + NUL, padded to 4
    (2 + 2 + 4 + 20 + name.len() + 1 + 3) & !3
}

impl Toc {
    pub fn read(path: &Path) -> Result<Self> {
        let mut s = FileStream::open(path)?;
        let tag = s.read_u32()?;
        if tag != TOC_TAG {
            return Err(Error::corrupt(format!("{:?}: bad TOC tag 0x{:08X}", path, tag)));
        }
        s.skip(12)?;
        let count = s.read_i32()?;
        if count < 0 {
            return Err(Error::corrupt(format!("{:?}: negative file count", path)));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start = s.position()?;
            s.skip(4)?;
            let size = s.read_u32()?;
            s.skip(20)?;
            let name = s.read_null_terminated_ascii()?;
            s.jump_to(start + record_len(&name) as u64)?;
            entries.push(TocEntry { name, size });
        }
        Ok(Self { entries })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut s = FileStream::create(path)?;
        s.write_u32(TOC_TAG)?;
        s.write_u32(0)?;
        s.write_u32(1)?;
        s.write_u32(8)?;
        s.write_i32(self.entries.len() as i32)?;
        for (n, e) in self.entries.iter().enumerate() {
            let len = record_len(&e.name);
            // the last record has size 0
            let block = if n + 1 == self.entries.len() { 0 } else { len as u16 };
            s.write_u16(block)?;
            s.write_u16(0)?;
            s.write_u32(e.size)?;
            s.write_zeros(20)?;
            s.write_null_terminated_ascii(&e.name)?;
            s.write_zeros(len - (28 + e.name.len() + 1))?;
        }
        s.sync()
    }

    /// Lists every file under `dir`, named relative to `root`. `skip` prunes
    /// sub-trees that carry their own table.
    pub fn generate(root: &Path, dir: &Path, skip: Option<&Path>) -> Result<Self> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| skip.map_or(true, |s| e.path() != s));
        for entry in walker {
            let entry = entry.map_err(|e| Error::IoFault(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy();
            if file_name.eq_ignore_ascii_case(TOC_FILE_NAME)
                || file_name.to_ascii_lowercase().ends_with(".sfar")
            {
                continue;
            }
            let rel = path.strip_prefix(root).map_err(|e| Error::parse(e.to_string()))?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("\\");
            let size = entry.metadata().map_err(|e| Error::IoFault(e.into()))?.len();
            entries.push(TocEntry {
                name,
                size: size as u32,
            });
        }
        Ok(Self { entries })
    }
}

/// Regenerates the base-game table and one table per DLC folder. ME3 only;
/// returns the files written.
pub fn update_tocs(config: &GameConfig) -> Result<Vec<PathBuf>> {
    if config.game != GameKind::Me3 {
        return Ok(Vec::new());
    }
    let mut written = Vec::new();
    let dlc = config.dlc_path();
    let base = config
        .main_data_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.root.clone());
    if base.is_dir() {
        let toc = Toc::generate(&config.root, &base, Some(&dlc))?;
        let out = base.join(TOC_FILE_NAME);
        toc.write(&out)?;
        written.push(out);
    }
    if dlc.is_dir() {
        let mut folders: Vec<PathBuf> = std::fs::read_dir(&dlc)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        folders.sort();
        for folder in folders {
            let toc = Toc::generate(&config.root, &folder, None)?;
            if toc.entries.is_empty() {
                continue;
            }
            let out = folder.join(TOC_FILE_NAME);
            toc.write(&out)?;
            written.push(out);
        }
    }
    info!("Updated {} TOC files", written.len());
    Ok(written)
}
