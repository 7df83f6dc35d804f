//! Per-game constants, install configuration and the run context handed to
//! every engine entry point.

use crate::codec::Codecs;
use crate::image::{BuiltinPixelCodec, PixelCodec};
use crate::texmap::TextureMap;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameKind {
    Me1,
    Me2,
    Me3,
}

impl GameKind {
    pub fn id(self) -> u32 {
        match self {
            GameKind::Me1 => 1,
            GameKind::Me2 => 2,
            GameKind::Me3 => 3,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(GameKind::Me1),
            2 => Some(GameKind::Me2),
            3 => Some(GameKind::Me3),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "1" | "me1" => Some(GameKind::Me1),
            "2" | "me2" => Some(GameKind::Me2),
            "3" | "me3" => Some(GameKind::Me3),
            _ => None,
        }
    }

    /// Package file version written by this game's cooker.
    pub fn package_version(self) -> u16 {
        match self {
            GameKind::Me1 => 491,
            GameKind::Me2 => 512,
            GameKind::Me3 => 684,
        }
    }

    pub fn licensee_version(self) -> u16 {
        match self {
            GameKind::Me1 => 1008,
            GameKind::Me2 => 130,
            GameKind::Me3 => 194,
        }
    }

    pub fn from_package_version(version: u16) -> Option<Self> {
        match version {
            491 => Some(GameKind::Me1),
            512 => Some(GameKind::Me2),
            684 => Some(GameKind::Me3),
            _ => None,
        }
    }

    pub fn package_extensions(self) -> &'static [&'static str] {
        match self {
            GameKind::Me1 => &["upk", "u", "sfm"],
            GameKind::Me2 | GameKind::Me3 => &["pcc"],
        }
    }

    /// Extensions of files that can hold externally stored mip data.
    pub fn external_archive_extensions(self) -> &'static [&'static str] {
        match self {
            // ME1 streams mips out of other packages
            GameKind::Me1 => &["upk", "u", "sfm"],
            GameKind::Me2 | GameKind::Me3 => &["tfc"],
        }
    }

    pub fn main_data_dir(self) -> &'static str {
        match self {
            GameKind::Me1 | GameKind::Me2 => "BioGame/CookedPC",
            GameKind::Me3 => "BIOGame/CookedPCConsole",
        }
    }

    pub fn dlc_dir(self) -> &'static str {
        match self {
            GameKind::Me1 => "DLC",
            GameKind::Me2 => "BioGame/DLC",
            GameKind::Me3 => "BIOGame/DLC",
        }
    }

    /// Package that carries the install marker.
    pub fn sentinel_path(self) -> &'static str {
        match self {
            GameKind::Me1 => "BioGame/CookedPC/testVolumeLight_VFX.upk",
            GameKind::Me2 => "BioGame/CookedPC/BIOC_Materials.pcc",
            GameKind::Me3 => "BIOGame/CookedPCConsole/adv_combat_tutorial_xbox_D_Int.afc",
        }
    }

    pub fn map_cache_name(self) -> &'static str {
        match self {
            GameKind::Me1 => "me1map.bin",
            GameKind::Me2 => "me2map.bin",
            GameKind::Me3 => "me3map.bin",
        }
    }

    /// ME3 bools are one byte and byte properties carry their enum name.
    pub fn compact_properties(self) -> bool {
        self == GameKind::Me3
    }
}

impl std::fmt::Display for GameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ME{}", self.id())
    }
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub game: GameKind,
    pub root: PathBuf,
    pub user_dir: PathBuf,
}

impl GameConfig {
    pub fn new<P: Into<PathBuf>>(game: GameKind, root: P) -> Self {
        let root = root.into();
        let user_dir = root.join(".memtex");
        Self { game, root, user_dir }
    }

    /// Reads `MEMTEX_GAME_ROOT` and `MEMTEX_USER_DIR`; `None` when no root is set.
    pub fn from_env(game: GameKind) -> Option<Self> {
        let root = std::env::var_os("MEMTEX_GAME_ROOT")?;
        let mut config = Self::new(game, PathBuf::from(root));
        if let Some(user_dir) = std::env::var_os("MEMTEX_USER_DIR") {
            config.user_dir = PathBuf::from(user_dir);
        }
        Some(config)
    }

    pub fn debug_mode() -> bool {
        std::env::var("MEMTEX_DEBUG_MODE").map(|v| v == "1").unwrap_or(false)
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.root.join(self.game.sentinel_path())
    }

    pub fn map_cache_path(&self) -> PathBuf {
        self.user_dir.join(self.game.map_cache_name())
    }

    pub fn main_data_path(&self) -> PathBuf {
        self.root.join(self.game.main_data_dir())
    }

    pub fn dlc_path(&self) -> PathBuf {
        self.root.join(self.game.dlc_dir())
    }

    /// Path relative to the game root with `/` separators, as stored in the map.
    pub fn relative_path(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Every package of the install in a stable order.
    pub fn package_files(&self) -> Vec<PathBuf> {
        let extensions = self.game.package_extensions();
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| !p.starts_with(&self.user_dir))
            .filter(|p| has_extension(p, extensions))
            .collect();
        files.sort();
        files
    }
}

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// External texture archives found under the game root, keyed by lower-cased
/// file stem.
#[derive(Debug, Clone, Default)]
pub struct TfcIndex {
    archives: HashMap<String, Vec<PathBuf>>,
}

impl TfcIndex {
    pub fn build(config: &GameConfig) -> Self {
        let extensions = config.game.external_archive_extensions();
        let mut archives: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for entry in WalkDir::new(&config.root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || !has_extension(path, extensions) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                archives
                    .entry(stem.to_ascii_lowercase())
                    .or_default()
                    .push(path.to_path_buf());
            }
        }
        for paths in archives.values_mut() {
            paths.sort();
        }
        debug!("Indexed {} external texture archives", archives.len());
        Self { archives }
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    /// Finds `archive` for a texture owned by `package`: the package's own DLC
    /// folder first, then the main data folder, then anywhere under the root.
    pub fn resolve(&self, config: &GameConfig, archive: &str, package: &Path) -> Option<PathBuf> {
        let candidates = self.archives.get(&archive.to_ascii_lowercase())?;
        if let Some(dlc) = owning_dlc(config, package) {
            if let Some(p) = candidates.iter().find(|p| p.starts_with(&dlc)) {
                return Some(p.clone());
            }
        }
        let main = config.main_data_path();
        if let Some(p) = candidates.iter().find(|p| p.starts_with(&main)) {
            return Some(p.clone());
        }
        candidates.first().cloned()
    }
}

fn owning_dlc(config: &GameConfig, package: &Path) -> Option<PathBuf> {
    let dlc_root = config.dlc_path();
    let rest = package.strip_prefix(&dlc_root).ok()?;
    let first = rest.components().next()?;
    Some(dlc_root.join(first.as_os_str()))
}

/// Everything one engine run needs: paths, codecs, archive index and, once
/// scanned or loaded, the texture map.
#[derive(Clone)]
pub struct GameContext {
    pub config: GameConfig,
    pub codecs: Codecs,
    pub pixels: Arc<dyn PixelCodec>,
    pub tfcs: TfcIndex,
    pub map: Option<TextureMap>,
}

impl GameContext {
    pub fn new(config: GameConfig) -> Self {
        let tfcs = TfcIndex::build(&config);
        Self {
            config,
            codecs: Codecs::default(),
            pixels: Arc::new(BuiltinPixelCodec::default()),
            tfcs,
            map: None,
        }
    }

    pub fn with_pixel_codec(mut self, pixels: Arc<dyn PixelCodec>) -> Self {
        self.pixels = pixels;
        self
    }

    pub fn with_codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn game(&self) -> GameKind {
        self.config.game
    }

    /// Re-reads the archive index; needed after DLC archives were unpacked.
    pub fn refresh_archives(&mut self) {
        self.tfcs = TfcIndex::build(&self.config);
    }
}

impl std::fmt::Debug for GameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameContext")
            .field("config", &self.config)
            .field("codecs", &self.codecs)
            .field("archives", &self.tfcs.len())
            .field("map", &self.map.as_ref().map(|m| m.len()))
            .finish()
    }
}
