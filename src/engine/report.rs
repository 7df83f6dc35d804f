use crate::error::Error;
use log::{info, warn};
use std::fmt;
use std::path::PathBuf;

/// Stages of one install run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scanning,
    Resolving,
    Patching,
    Verifying,
    MarkingDone,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Scanning => "Scanning",
            Stage::Resolving => "Resolving",
            Stage::Patching => "Patching",
            Stage::Verifying => "Verifying",
            Stage::MarkingDone => "MarkingDone",
        }
    }
}

/// Something the caller should tell the user about that is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A mod entry whose checksum matches no texture of the install.
    TextureSkipped { archive: String, name: String, crc: u32 },
    /// A mod entry targeting a texture with a movie payload, or the reverse.
    KindMismatch { archive: String, name: String, crc: u32 },
    /// The archive is already listed in the install marker.
    ArchiveAlreadyApplied(String),
    /// A package carries a rewrite trailer although no install marker exists.
    PreviouslyModified(String),
    /// The cached texture map was unusable and the install was rescanned.
    CacheRebuilt(String),
    DlcUnpacked(PathBuf),
    DlcRepacked(PathBuf),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::TextureSkipped { archive, name, crc } => write!(
                f,
                "texture skipped: {} (0x{:08X}) from {} matches no game texture",
                name, crc, archive
            ),
            Notice::KindMismatch { archive, name, crc } => write!(
                f,
                "{} (0x{:08X}) from {} does not match the kind of the game object",
                name, crc, archive
            ),
            Notice::ArchiveAlreadyApplied(a) => write!(f, "{} was applied by a previous run", a),
            Notice::PreviouslyModified(p) => {
                write!(f, "{} was rewritten by an earlier install without a marker", p)
            }
            Notice::CacheRebuilt(why) => write!(f, "texture map cache rebuilt: {}", why),
            Notice::DlcUnpacked(p) => write!(f, "unpacked {}", p.display()),
            Notice::DlcRepacked(p) => write!(f, "repacked {}", p.display()),
        }
    }
}

/// Outcome of an install run. Per-entry problems land here instead of
/// aborting the run.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub notices: Vec<Notice>,
    pub failures: Vec<(String, Error)>,
    /// Packages rewritten by this run, relative to the game root.
    pub rewritten: Vec<String>,
    pub applied_archives: Vec<String>,
    pub skipped_archives: Vec<String>,
    /// Export locations that received replacement data.
    pub patched: usize,
    /// Set when the texture map came from a full scan rather than the cache.
    pub scanned: bool,
}

impl InstallReport {
    pub fn notice(&mut self, notice: Notice) {
        info!("{}", notice);
        self.notices.push(notice);
    }

    pub fn fail(&mut self, what: impl Into<String>, error: Error) {
        let what = what.into();
        warn!("{}: {}", what, error);
        self.failures.push((what, error));
    }

    pub fn skipped_textures(&self) -> usize {
        self.notices
            .iter()
            .filter(|n| matches!(n, Notice::TextureSkipped { .. }))
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
