//! Install marker appended to the sentinel file of a game install.
//!
//! Layout, read backwards from the end of the file:
//! `[payload][payload_len: u32]["MEMI"]`, where the payload is
//! `{version u32, tool FString, timestamp i64, count u32, names FString...}`.

use crate::config::GameConfig;
use crate::error::{Error, Result};
use crate::stream::{BinaryStream, FileStream, MemoryStream};
use log::info;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MARKER_TAG: u32 = u32::from_le_bytes(*b"MEMI");
pub const MARKER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallMarker {
    pub version: u32,
    pub tool_version: String,
    pub timestamp: i64,
    pub mods: Vec<String>,
}

impl InstallMarker {
    pub fn new(mods: Vec<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            version: MARKER_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
            mods,
        }
    }

    fn to_record(&self) -> Result<Vec<u8>> {
        let mut s = MemoryStream::new();
        s.write_u32(self.version)?;
        s.write_fstring(&self.tool_version, false)?;
        s.write_i64(self.timestamp)?;
        s.write_u32(self.mods.len() as u32)?;
        for m in &self.mods {
            s.write_fstring(m, !m.is_ascii())?;
        }
        let payload_len = s.as_slice().len() as u32;
        s.write_u32(payload_len)?;
        s.write_u32(MARKER_TAG)?;
        Ok(s.into_inner())
    }

    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        let mut s = MemoryStream::from_vec(payload);
        let version = s.read_u32()?;
        let tool_version = s.read_fstring()?;
        let timestamp = s.read_i64()?;
        let count = s.read_u32()?;
        let mut mods = Vec::new();
        for _ in 0..count {
            mods.push(s.read_fstring()?);
        }
        Ok(Self {
            version,
            tool_version,
            timestamp,
            mods,
        })
    }
}

fn has_tag(stream: &mut dyn BinaryStream) -> Result<bool> {
    let len = stream.length()?;
    if len < 8 {
        return Ok(false);
    }
    stream.jump_to(len - 4)?;
    Ok(stream.read_u32()? == MARKER_TAG)
}

/// Raw bytes of a trailing marker record, or empty when the stream has none.
pub fn trailing_record(stream: &mut dyn BinaryStream) -> Result<Vec<u8>> {
    if !has_tag(stream)? {
        return Ok(Vec::new());
    }
    let len = stream.length()?;
    stream.jump_to(len - 8)?;
    let payload_len = stream.read_u32()? as u64;
    if payload_len + 8 > len {
        return Err(Error::corrupt(format!(
            "install marker claims {} bytes in a {} byte file",
            payload_len, len
        )));
    }
    stream.jump_to(len - 8 - payload_len)?;
    stream.read_bytes(payload_len as usize + 8)
}

/// Constant-time check of the last four bytes of the sentinel.
pub fn detect_at(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut file = FileStream::open(path)?;
    has_tag(&mut file)
}

pub fn read_marker_at(path: &Path) -> Result<Option<InstallMarker>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = FileStream::open(path)?;
    let record = trailing_record(&mut file)?;
    if record.is_empty() {
        return Ok(None);
    }
    let payload = record[..record.len() - 8].to_vec();
    InstallMarker::from_payload(payload).map(Some)
}

/// Replaces any existing marker on the file with `marker`.
pub fn write_marker_at(path: &Path, marker: &InstallMarker) -> Result<()> {
    let mut file = FileStream::open_rw(path)?;
    let existing = trailing_record(&mut file)?.len() as u64;
    let len = file.length()?;
    file.set_len(len - existing)?;
    file.jump_to(len - existing)?;
    file.write_bytes(&marker.to_record()?)?;
    file.sync()?;
    info!(
        "Install marker written to {:?} ({} mod archives)",
        path,
        marker.mods.len()
    );
    Ok(())
}

pub fn detect(config: &GameConfig) -> Result<bool> {
    detect_at(&config.sentinel_path())
}

pub fn read_marker(config: &GameConfig) -> Result<Option<InstallMarker>> {
    read_marker_at(&config.sentinel_path())
}

pub fn write_marker(config: &GameConfig, marker: &InstallMarker) -> Result<()> {
    write_marker_at(&config.sentinel_path(), marker)
}
