//! Reference checksums for game files: vanilla hashes plus known good and
//! known broken third-party replacements.

use crate::config::GameConfig;
use crate::error::{Error, Result};
use crate::progress::{Progress, Ticker};
use crate::stream::{BinaryStream, FileStream, MemoryStream};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

pub const MD5_TABLE_TAG: u32 = u32::from_le_bytes(*b"MD5T");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Vanilla,
    KnownMod,
    BadMod,
}

impl EntryClass {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntryClass::Vanilla),
            1 => Some(EntryClass::KnownMod),
            2 => Some(EntryClass::BadMod),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            EntryClass::Vanilla => 0,
            EntryClass::KnownMod => 1,
            EntryClass::BadMod => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Md5Entry {
    /// Path relative to the game root, `/`-separated.
    pub path: String,
    pub md5: [u8; 16],
    pub size: u32,
    pub class: EntryClass,
    pub mod_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Md5Status {
    Vanilla,
    KnownMod(String),
    BadMod(String),
    Modified,
    Unknown,
}

#[derive(Debug, Default, Clone)]
pub struct Md5Table {
    by_path: HashMap<String, Vec<Md5Entry>>,
}

impl Md5Table {
    pub fn from_entries(entries: Vec<Md5Entry>) -> Self {
        let mut by_path: HashMap<String, Vec<Md5Entry>> = HashMap::new();
        for e in entries {
            by_path.entry(e.path.to_ascii_lowercase()).or_default().push(e);
        }
        Self { by_path }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut s = MemoryStream::from_vec(bytes);
        let tag = s.read_u32()?;
        if tag != MD5_TABLE_TAG {
            return Err(Error::corrupt(format!("bad MD5 table tag 0x{:08X}", tag)));
        }
        let count = s.read_u32()?;
        let mut entries = Vec::with_capacity(count.min(0x10_0000) as usize);
        for _ in 0..count {
            let path = s.read_fstring()?;
            let md5 = s.read_guid()?;
            let size = s.read_u32()?;
            let raw = s.read_u8()?;
            let class = EntryClass::from_u8(raw)
                .ok_or_else(|| Error::corrupt(format!("MD5 entry class {}", raw)))?;
            let mod_name = match class {
                EntryClass::Vanilla => None,
                _ => Some(s.read_fstring()?),
            };
            entries.push(Md5Entry {
                path,
                md5,
                size,
                class,
                mod_name,
            });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut all: Vec<&Md5Entry> = self.by_path.values().flatten().collect();
        all.sort_by(|a, b| (&a.path, a.md5).cmp(&(&b.path, b.md5)));
        let mut s = MemoryStream::new();
        s.write_u32(MD5_TABLE_TAG)?;
        s.write_u32(all.len() as u32)?;
        for e in all {
            s.write_fstring(&e.path, !e.path.is_ascii())?;
            s.write_bytes(&e.md5)?;
            s.write_u32(e.size)?;
            s.write_u8(e.class.to_u8())?;
            if let Some(name) = &e.mod_name {
                s.write_fstring(name, !name.is_ascii())?;
            }
        }
        Ok(s.into_inner())
    }

    pub fn len(&self) -> usize {
        self.by_path.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn classify(&self, path: &str, md5: &[u8; 16]) -> Md5Status {
        let entries = match self.by_path.get(&path.to_ascii_lowercase()) {
            Some(e) => e,
            None => return Md5Status::Unknown,
        };
        match entries.iter().find(|e| &e.md5 == md5) {
            Some(e) => {
                let name = e.mod_name.clone().unwrap_or_default();
                match e.class {
                    EntryClass::Vanilla => Md5Status::Vanilla,
                    EntryClass::KnownMod => Md5Status::KnownMod(name),
                    EntryClass::BadMod => Md5Status::BadMod(name),
                }
            }
            None => Md5Status::Modified,
        }
    }

    fn vanilla_paths(&self) -> Vec<&Md5Entry> {
        let mut v: Vec<&Md5Entry> = self
            .by_path
            .values()
            .filter_map(|list| list.iter().find(|e| e.class == EntryClass::Vanilla))
            .collect();
        v.sort_by(|a, b| a.path.cmp(&b.path));
        v
    }
}

pub fn file_md5(path: &Path) -> Result<[u8; 16]> {
    let mut file = FileStream::open(path)?;
    let mut ctx = ::md5::Context::new();
    let mut buf = vec![0u8; 0x10_0000];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(ctx.compute().0)
}

#[derive(Debug)]
pub struct Md5Mismatch {
    pub path: String,
    pub status: Md5Status,
    /// Set when the file could not be read at all.
    pub error: Option<Error>,
}

/// Hashes every file the table knows as vanilla and reports the ones that
/// are not.
pub fn verify_game(config: &GameConfig, table: &Md5Table, progress: &mut dyn Progress) -> Vec<Md5Mismatch> {
    let targets = table.vanilla_paths();
    let mut ticker = Ticker::new(progress, "Verifying game files", targets.len());
    ticker.tick(0);

    let mut mismatches = Vec::new();
    for (n, batch) in targets.chunks(64).enumerate() {
        let results: Vec<(String, Result<[u8; 16]>)> = batch
            .par_iter()
            .map(|e| (e.path.clone(), file_md5(&config.absolute_path(&e.path))))
            .collect();
        for (path, result) in results {
            match result {
                Ok(md5) => match table.classify(&path, &md5) {
                    Md5Status::Vanilla | Md5Status::KnownMod(_) => {}
                    status => mismatches.push(Md5Mismatch {
                        path,
                        status,
                        error: None,
                    }),
                },
                Err(e) => {
                    warn!("Cannot hash {}: {}", path, e);
                    mismatches.push(Md5Mismatch {
                        path,
                        status: Md5Status::Unknown,
                        error: Some(e),
                    });
                }
            }
        }
        ticker.tick((n * 64 + batch.len()).min(targets.len()));
    }
    info!("Verified {} files, {} mismatches", targets.len(), mismatches.len());
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, md5: u8, class: EntryClass, name: Option<&str>) -> Md5Entry {
        Md5Entry {
            path: path.to_string(),
            md5: [md5; 16],
            size: 10,
            class,
            mod_name: name.map(str::to_string),
        }
    }

    #[test]
    fn classify_covers_every_status() {
        let table = Md5Table::from_entries(vec![
            entry("BIOGame/a.pcc", 1, EntryClass::Vanilla, None),
            entry("BIOGame/a.pcc", 2, EntryClass::KnownMod, Some("Good")),
            entry("BIOGame/a.pcc", 3, EntryClass::BadMod, Some("Broken")),
        ]);
        assert_eq!(table.classify("biogame/A.pcc", &[1; 16]), Md5Status::Vanilla);
        assert_eq!(table.classify("BIOGame/a.pcc", &[2; 16]), Md5Status::KnownMod("Good".into()));
        assert_eq!(table.classify("BIOGame/a.pcc", &[3; 16]), Md5Status::BadMod("Broken".into()));
        assert_eq!(table.classify("BIOGame/a.pcc", &[4; 16]), Md5Status::Modified);
        assert_eq!(table.classify("BIOGame/b.pcc", &[1; 16]), Md5Status::Unknown);

        let reloaded = Md5Table::from_bytes(table.to_bytes().unwrap()).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.classify("BIOGame/a.pcc", &[3; 16]), Md5Status::BadMod("Broken".into()));
    }
}
