//! Content-addressed index of every texture in a game install:
//! checksum -> logical texture -> every package location carrying it.

pub mod cache;

use crate::config::GameContext;
use crate::config::GameKind;
use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::image::{dxt1_has_alpha, PixelFormat};
use crate::package::Package;
use crate::progress::{Progress, Ticker};
use crate::texture::{is_texture_class, StorageKind, Texture, TextureMovie, MOVIE_CLASS};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use cache::{load_cache, save_cache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Diffuse,
    Normal,
    OneBitAlpha,
    Greyscale,
    Movie,
}

impl TextureType {
    pub fn to_u8(self) -> u8 {
        match self {
            TextureType::Diffuse => 0,
            TextureType::Normal => 1,
            TextureType::OneBitAlpha => 2,
            TextureType::Greyscale => 3,
            TextureType::Movie => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TextureType::Diffuse),
            1 => Some(TextureType::Normal),
            2 => Some(TextureType::OneBitAlpha),
            3 => Some(TextureType::Greyscale),
            4 => Some(TextureType::Movie),
            _ => None,
        }
    }
}

/// One place in the install where a logical texture occurs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TextureLocation {
    /// Package path relative to the game root, `/`-separated.
    pub path: String,
    pub export: u32,
    /// Checksum per mip for mips stored in the package; 0 for the others.
    pub mip_crcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureMapEntry {
    pub crc: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: Option<PixelFormat>,
    pub kind: TextureType,
    pub locations: Vec<TextureLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureMap {
    pub game: GameKind,
    entries: BTreeMap<u32, TextureMapEntry>,
}

/// What a scan could not index.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub textures: usize,
    pub failures: Vec<(String, Error)>,
    /// Packages already carrying the per-package install trailer.
    pub marked_packages: Vec<String>,
}

impl TextureMap {
    pub fn new(game: GameKind) -> Self {
        Self {
            game,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, crc: u32) -> Option<&TextureMapEntry> {
        self.entries.get(&crc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextureMapEntry> {
        self.entries.values()
    }

    /// Adds one occurrence; occurrences sharing a checksum merge into one entry.
    pub fn insert(&mut self, mut entry: TextureMapEntry) {
        match self.entries.get_mut(&entry.crc) {
            Some(existing) => {
                // metadata follows the first location so merge order does not matter
                let earlier = match (entry.locations.iter().min(), existing.locations.first()) {
                    (Some(new), Some(old)) => new < old,
                    _ => false,
                };
                if earlier {
                    existing.name = entry.name;
                    existing.width = entry.width;
                    existing.height = entry.height;
                    existing.format = entry.format;
                    existing.kind = entry.kind;
                }
                existing.locations.append(&mut entry.locations);
                existing.locations.sort();
                existing.locations.dedup_by(|a, b| a.path == b.path && a.export == b.export);
            }
            None => {
                entry.locations.sort();
                self.entries.insert(entry.crc, entry);
            }
        }
    }

    /// Full pass over `packages`: every texture export's top mip is decoded
    /// and checksummed. Packages are scanned in parallel batches and merged in
    /// input order. Per-texture failures are collected, not raised.
    pub fn build_from_scan(
        ctx: &GameContext,
        packages: &[PathBuf],
        progress: &mut dyn Progress,
    ) -> (TextureMap, ScanReport) {
        let mut map = TextureMap::new(ctx.game());
        let mut report = ScanReport::default();
        let mut ticker = Ticker::new(progress, "Scanning textures", packages.len());
        ticker.tick(0);

        let batch = rayon::current_num_threads().max(1) * 2;
        let mut done = 0;
        for chunk in packages.chunks(batch) {
            let scanned: Vec<(String, Result<PackageScan>)> = chunk
                .par_iter()
                .map(|path| {
                    let rel = ctx.config.relative_path(path);
                    let result = scan_package(ctx, path, &rel);
                    (rel, result)
                })
                .collect();
            for (rel, result) in scanned {
                match result {
                    Ok(scan) => {
                        report.textures += scan.entries.len();
                        for entry in scan.entries {
                            map.insert(entry);
                        }
                        report.failures.extend(scan.failures);
                        if scan.marked {
                            report.marked_packages.push(rel);
                        }
                    }
                    Err(e) => {
                        warn!("Skipping package {}: {}", rel, e);
                        report.failures.push((rel, e));
                    }
                }
            }
            done += chunk.len();
            ticker.tick(done);
        }

        info!(
            "Scan complete: {} textures in {} unique entries, {} failures",
            report.textures,
            map.len(),
            report.failures.len()
        );
        (map, report)
    }
}

/// What one package contributed to the scan.
struct PackageScan {
    entries: Vec<TextureMapEntry>,
    failures: Vec<(String, Error)>,
    marked: bool,
}

fn classify(texture: &Texture, package: &Package, format: Option<PixelFormat>, top: &[u8]) -> TextureType {
    match format {
        _ if texture.is_normal_map(&package.names) => TextureType::Normal,
        Some(PixelFormat::Ati2) => TextureType::Normal,
        Some(PixelFormat::Dxt1) if dxt1_has_alpha(top) => TextureType::OneBitAlpha,
        Some(PixelFormat::G8) => TextureType::Greyscale,
        _ => TextureType::Diffuse,
    }
}

fn scan_package(ctx: &GameContext, path: &Path, rel: &str) -> Result<PackageScan> {
    let mut package = Package::open_with(path, &ctx.codecs)?;
    let mut scan = PackageScan {
        entries: Vec::new(),
        failures: Vec::new(),
        marked: package.has_mem_marker(),
    };
    for index in 0..package.exports.len() {
        let class = package.class_name(index)?;
        let result = if is_texture_class(&class) {
            scan_texture(ctx, &mut package, path, rel, index)
        } else if class == MOVIE_CLASS {
            scan_movie(ctx, &mut package, path, rel, index)
        } else {
            continue;
        };
        match result {
            Ok(Some(entry)) => scan.entries.push(entry),
            Ok(None) => {}
            Err(e) => {
                let what = format!("{} export {}", rel, index);
                debug!("Texture scan failed for {}: {}", what, e);
                scan.failures.push((what, e));
            }
        }
    }
    Ok(scan)
}

fn scan_texture(
    ctx: &GameContext,
    package: &mut Package,
    path: &Path,
    rel: &str,
    index: usize,
) -> Result<Option<TextureMapEntry>> {
    let texture = Texture::from_export(package, index)?;
    let top_index = match texture.top_index() {
        Some(i) => i,
        None => return Ok(None),
    };
    let top_data = texture.mip_data(top_index, ctx, path)?;
    let crc = crc32(&top_data);

    let mut mip_crcs = Vec::with_capacity(texture.mips.len());
    for (i, mip) in texture.mips.iter().enumerate() {
        let value = match mip.bulk.storage {
            StorageKind::InPackage { .. } if i == top_index => crc,
            StorageKind::InPackage { .. } if !mip.bulk.is_empty() => {
                crc32(&texture.mip_data(i, ctx, path)?)
            }
            _ => 0,
        };
        mip_crcs.push(value);
    }

    let format = texture.format(&package.names);
    let kind = classify(&texture, package, format, &top_data);
    let top = &texture.mips[top_index];
    Ok(Some(TextureMapEntry {
        crc,
        name: package.object_name(index)?,
        width: top.width,
        height: top.height,
        format,
        kind,
        locations: vec![TextureLocation {
            path: rel.to_string(),
            export: index as u32,
            mip_crcs,
        }],
    }))
}

fn scan_movie(
    ctx: &GameContext,
    package: &mut Package,
    path: &Path,
    rel: &str,
    index: usize,
) -> Result<Option<TextureMapEntry>> {
    let movie = TextureMovie::from_export(package, index)?;
    if movie.bulk.is_empty() {
        return Ok(None);
    }
    let data = movie.data(ctx, path)?;
    let width = movie.properties.get_int("SizeX").unwrap_or(0).max(0) as u32;
    let height = movie.properties.get_int("SizeY").unwrap_or(0).max(0) as u32;
    Ok(Some(TextureMapEntry {
        crc: crc32(&data),
        name: package.object_name(index)?,
        width,
        height,
        format: None,
        kind: TextureType::Movie,
        locations: vec![TextureLocation {
            path: rel.to_string(),
            export: index as u32,
            mip_crcs: Vec::new(),
        }],
    }))
}
