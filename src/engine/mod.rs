//! Mod application: one run walks `Scanning -> Resolving -> Patching ->
//! (Verifying) -> MarkingDone`. Per-entry problems are collected in the
//! [`InstallReport`]; only failing to obtain a texture map or to write the
//! install marker ends a run early.

mod patch;
pub mod report;

use crate::config::{has_extension, GameContext, GameKind};
use crate::error::{Error, Result};
use crate::image::dds::{read_dds, write_dds};
use crate::image::{Image, ImageMip};
use crate::marker::{self, InstallMarker};
use crate::mem::{MemArchive, ModKind};
use crate::package::Package;
use crate::progress::{Progress, Ticker};
use crate::sfar;
use crate::texmap::{load_cache, save_cache, ScanReport, TextureMap, TextureType};
use crate::texture::{Texture, TextureMovie};
use crate::toc;
use log::{info, warn};
use patch::{patch_package, verify_package, ModEntry, PackageOutcome, PatchedExport, Replacement};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use report::{InstallReport, Notice, Stage};

const SFAR_NAME: &str = "Default.sfar";

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Re-read every patched location after saving.
    pub verify: bool,
    /// Patch independent packages on the worker pool.
    pub parallel: bool,
    /// ME3: pack DLC folders touched by the run back into their archive.
    pub repack_sfar: bool,
}

fn enter(stage: Stage) {
    info!("Stage: {}", stage.label());
}

/// Finds every packed ME3 DLC archive and unpacks it into the game root.
/// Returns the DLC folders that were unpacked.
pub fn unpack_dlcs(ctx: &mut GameContext, report: &mut InstallReport) -> Vec<PathBuf> {
    if ctx.game() != GameKind::Me3 {
        return Vec::new();
    }
    let mut unpacked = Vec::new();
    for sfar_path in dlc_archives(ctx) {
        match sfar::is_unpacked(&sfar_path) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                report.fail(sfar_path.display().to_string(), e);
                continue;
            }
        }
        match sfar::extract(&sfar_path, &ctx.config.root) {
            Ok(_) => {
                report.notice(Notice::DlcUnpacked(sfar_path.clone()));
                if let Some(folder) = dlc_folder(ctx, &sfar_path) {
                    unpacked.push(folder);
                }
            }
            Err(e) => report.fail(sfar_path.display().to_string(), e),
        }
    }
    if !unpacked.is_empty() {
        ctx.refresh_archives();
    }
    unpacked
}

fn dlc_archives(ctx: &GameContext) -> Vec<PathBuf> {
    let dlc = ctx.config.dlc_path();
    if !dlc.is_dir() {
        return Vec::new();
    }
    let mut found: Vec<PathBuf> = WalkDir::new(&dlc)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(SFAR_NAME))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

/// `<dlc dir>/<DLC_NAME>` holding `path`.
fn dlc_folder(ctx: &GameContext, path: &Path) -> Option<PathBuf> {
    let dlc = ctx.config.dlc_path();
    let first = path.strip_prefix(&dlc).ok()?.components().next()?;
    Some(dlc.join(first.as_os_str()))
}

/// Full scan of the install; the result replaces the context's map and the
/// cache on disk.
pub fn scan(ctx: &mut GameContext, progress: &mut dyn Progress) -> Result<ScanReport> {
    let packages = ctx.config.package_files();
    info!("Scanning {} packages", packages.len());
    let (map, scan) = TextureMap::build_from_scan(ctx, &packages, progress);
    save_cache(&map, &ctx.config.map_cache_path())?;
    ctx.map = Some(map);
    Ok(scan)
}

/// Scanning stage: a cached map is trusted only while the install marker is
/// present; otherwise, or when the cache is unusable, the install is rescanned.
fn load_or_scan(
    ctx: &mut GameContext,
    marker_present: bool,
    report: &mut InstallReport,
    progress: &mut dyn Progress,
) -> Result<()> {
    if ctx.map.is_some() {
        return Ok(());
    }
    let cache = ctx.config.map_cache_path();
    if marker_present {
        if cache.exists() {
            match load_cache(&cache, ctx.game()) {
                Ok(map) => {
                    ctx.map = Some(map);
                    return Ok(());
                }
                Err(Error::IoFault(e)) => return Err(Error::IoFault(e)),
                Err(e) => report.notice(Notice::CacheRebuilt(e.to_string())),
            }
        } else {
            report.notice(Notice::CacheRebuilt("cache file missing".to_string()));
        }
    }

    let packages = ctx.config.package_files();
    info!("Scanning {} packages", packages.len());
    let (map, scan) = TextureMap::build_from_scan(ctx, &packages, progress);
    for (what, e) in scan.failures {
        report.fail(format!("scan {}", what), e);
    }
    if !marker_present {
        for p in scan.marked_packages {
            report.notice(Notice::PreviouslyModified(p));
        }
    }
    if let Err(e) = save_cache(&map, &cache) {
        report.fail("saving texture map cache", e);
    }
    report.scanned = true;
    ctx.map = Some(map);
    Ok(())
}

/// Resolving stage for one archive: every entry is matched against the map.
fn resolve_archive(path: &Path, map: &TextureMap, mods: &mut Vec<ModEntry>, report: &mut InstallReport) -> Result<()> {
    let archive_name = archive_name(path);
    let mut archive = MemArchive::open(path)?;
    archive.check_game_version(map.game)?;
    let entries = archive.file_mods()?;
    for entry in entries {
        let payload = match archive.read_payload(&entry) {
            Ok(p) => p,
            Err(e) => {
                report.fail(format!("{} in {}", entry.name, archive_name), e);
                continue;
            }
        };
        let target = match map.lookup(payload.target_crc) {
            Some(t) => t,
            None => {
                report.notice(Notice::TextureSkipped {
                    archive: archive_name.clone(),
                    name: entry.name.clone(),
                    crc: payload.target_crc,
                });
                continue;
            }
        };
        let is_movie = target.kind == TextureType::Movie;
        if is_movie != (entry.kind == ModKind::Movie) {
            report.notice(Notice::KindMismatch {
                archive: archive_name.clone(),
                name: entry.name.clone(),
                crc: payload.target_crc,
            });
            continue;
        }
        let converted = payload.is_converted();
        let replacement = match entry.kind {
            ModKind::Movie => Replacement::Movie(payload.data),
            ModKind::Texture => match read_dds(&payload.data) {
                Ok(image) => Replacement::Texture { image, converted },
                Err(e) => {
                    report.fail(format!("{} in {}", entry.name, archive_name), e);
                    continue;
                }
            },
        };
        mods.push(ModEntry {
            archive: archive_name.clone(),
            name: entry.name,
            crc: payload.target_crc,
            replacement,
            locations: target.locations.clone(),
        });
    }
    Ok(())
}

fn archive_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Packs DLC folders that hold rewritten packages back into their archive
/// and removes the loose files.
fn repack_dlcs(ctx: &mut GameContext, report: &mut InstallReport) {
    let mut folders = BTreeSet::new();
    for rel in &report.rewritten {
        if let Some(folder) = dlc_folder(ctx, &ctx.config.absolute_path(rel)) {
            folders.insert(folder);
        }
    }
    let mut repacked = false;
    for folder in folders {
        let archive = match dlc_archives(ctx).into_iter().find(|a| a.starts_with(&folder)) {
            Some(a) => a,
            None => continue,
        };
        let files: Vec<PathBuf> = WalkDir::new(&folder)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.path() != archive)
            .map(|e| e.into_path())
            .collect();
        let result = sfar::pack_files(&ctx.config.root, &files, &archive).and_then(|_| {
            for f in &files {
                std::fs::remove_file(f)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                repacked = true;
                report.notice(Notice::DlcRepacked(archive));
            }
            Err(e) => report.fail(format!("repacking {}", folder.display()), e),
        }
    }
    if repacked {
        ctx.refresh_archives();
    }
}

/// Applies `archives` (MEM files) to the install described by `ctx`.
pub fn install(
    ctx: &mut GameContext,
    archives: &[PathBuf],
    options: &InstallOptions,
    progress: &mut dyn Progress,
) -> Result<InstallReport> {
    let mut report = InstallReport::default();

    enter(Stage::Scanning);
    unpack_dlcs(ctx, &mut report);
    let previous = match marker::read_marker(&ctx.config) {
        Ok(m) => m,
        Err(e) if e.is_recoverable() => {
            warn!("Ignoring unreadable install marker: {}", e);
            None
        }
        Err(e) => return Err(e),
    };
    load_or_scan(ctx, previous.is_some(), &mut report, progress)?;

    enter(Stage::Resolving);
    let applied: Vec<String> = previous.as_ref().map(|m| m.mods.clone()).unwrap_or_default();
    let mut mods = Vec::new();
    {
        let map = ctx
            .map
            .as_ref()
            .ok_or_else(|| Error::parse("texture map unavailable"))?;
        let mut ticker = Ticker::new(progress, Stage::Resolving.label(), archives.len());
        ticker.tick(0);
        for (n, path) in archives.iter().enumerate() {
            let name = archive_name(path);
            if applied.iter().any(|a| a.eq_ignore_ascii_case(&name)) {
                report.notice(Notice::ArchiveAlreadyApplied(name.clone()));
                report.skipped_archives.push(name);
            } else {
                match resolve_archive(path, map, &mut mods, &mut report) {
                    Ok(()) => report.applied_archives.push(name),
                    Err(e) => {
                        report.skipped_archives.push(name.clone());
                        report.fail(name, e);
                    }
                }
            }
            ticker.tick(n + 1);
        }
    }

    enter(Stage::Patching);
    let mut groups: BTreeMap<&str, Vec<(usize, u32)>> = BTreeMap::new();
    for (m, entry) in mods.iter().enumerate() {
        for loc in &entry.locations {
            groups.entry(loc.path.as_str()).or_default().push((m, loc.export));
        }
    }
    let groups: Vec<(&str, Vec<(usize, u32)>)> = groups.into_iter().collect();
    let mut patched: Vec<(String, Vec<PatchedExport>)> = Vec::new();
    {
        let shared: &GameContext = ctx;
        let batch = if options.parallel {
            rayon::current_num_threads().max(1) * 2
        } else {
            1
        };
        let mut ticker = Ticker::new(progress, Stage::Patching.label(), groups.len());
        ticker.tick(0);
        let mut done = 0;
        for chunk in groups.chunks(batch) {
            let outcomes: Vec<PackageOutcome> = if options.parallel {
                chunk
                    .par_iter()
                    .map(|(rel, work)| patch_package(shared, rel, work, &mods))
                    .collect()
            } else {
                chunk
                    .iter()
                    .map(|(rel, work)| patch_package(shared, rel, work, &mods))
                    .collect()
            };
            for outcome in outcomes {
                for (what, e) in outcome.failures {
                    report.fail(what, e);
                }
                if outcome.saved {
                    report.rewritten.push(outcome.rel.clone());
                }
                report.patched += outcome.patched.len();
                if !outcome.patched.is_empty() {
                    patched.push((outcome.rel, outcome.patched));
                }
            }
            done += chunk.len();
            ticker.tick(done);
        }
    }
    info!(
        "Patched {} locations in {} packages",
        report.patched,
        report.rewritten.len()
    );

    if options.verify {
        enter(Stage::Verifying);
        let shared: &GameContext = ctx;
        let mut ticker = Ticker::new(progress, Stage::Verifying.label(), patched.len());
        ticker.tick(0);
        for (n, (rel, exports)) in patched.iter().enumerate() {
            for (what, e) in verify_package(shared, rel, exports) {
                report.fail(what, e);
            }
            ticker.tick(n + 1);
        }
    }

    enter(Stage::MarkingDone);
    if ctx.game() == GameKind::Me3 && !report.rewritten.is_empty() {
        if let Err(e) = toc::update_tocs(&ctx.config) {
            report.fail("updating TOC files", e);
        }
        if options.repack_sfar {
            repack_dlcs(ctx, &mut report);
        }
    }
    let mut mods_done = applied;
    for name in &report.applied_archives {
        if !mods_done.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            mods_done.push(name.clone());
        }
    }
    if previous.is_none() || !report.applied_archives.is_empty() {
        marker::write_marker(&ctx.config, &InstallMarker::new(mods_done))?;
    }
    progress.report(100, Stage::MarkingDone.label());

    info!(
        "Install finished: {} archives applied, {} skipped, {} failures",
        report.applied_archives.len(),
        report.skipped_archives.len(),
        report.failures.len()
    );
    Ok(report)
}

/// Writes the game texture with checksum `crc` to `out`: DDS for textures,
/// the raw Bink stream for movies.
pub fn extract_texture(ctx: &GameContext, crc: u32, out: &Path) -> Result<PathBuf> {
    let map = ctx
        .map
        .as_ref()
        .ok_or_else(|| Error::parse("texture map not loaded"))?;
    let entry = map
        .lookup(crc)
        .ok_or_else(|| Error::parse(format!("no game texture with checksum 0x{:08X}", crc)))?;
    let location = entry
        .locations
        .first()
        .ok_or_else(|| Error::parse(format!("0x{:08X} has no locations", crc)))?;
    let path = ctx.config.absolute_path(&location.path);
    let mut package = Package::open_with(&path, &ctx.codecs)?;
    let index = location.export as usize;

    let bytes = if entry.kind == TextureType::Movie {
        TextureMovie::from_export(&mut package, index)?.data(ctx, &path)?
    } else {
        let texture = Texture::from_export(&mut package, index)?;
        let format = texture
            .format(&package.names)
            .ok_or_else(|| Error::parse(format!("{}: unknown pixel format", texture.name)))?;
        let mut mips = Vec::new();
        for (i, mip) in texture.mips.iter().enumerate() {
            if mip.bulk.is_empty() {
                continue;
            }
            mips.push(ImageMip {
                width: mip.width,
                height: mip.height,
                data: texture.mip_data(i, ctx, &path)?,
            });
        }
        write_dds(&Image { format, mips })?
    };

    if let Some(dir) = out.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(out, bytes)?;
    info!("Extracted 0x{:08X} ({}) to {:?}", crc, entry.name, out);
    Ok(out.to_path_buf())
}

/// MEM archives in `dir`, sorted by name.
pub fn find_mem_archives(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && has_extension(p, &["mem"]))
        .collect();
    found.sort();
    found
}
