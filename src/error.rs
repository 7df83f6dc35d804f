use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed container; aborts the single open.
    #[error("parse error: {0}")]
    Parse(String),

    /// Tag or checksum mismatch on a container header.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// The texture map cache does not match what was stored; forces a rescan.
    #[error("texture map cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("external texture archive '{archive}' not found (texture {texture})")]
    MissingExternalArchive { archive: String, texture: String },

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("truncated read: wanted {wanted} bytes, {available} available")]
    TruncatedIo { wanted: u64, available: u64 },

    #[error("io: {0}")]
    IoFault(#[from] io::Error),

    #[error("binary layout: {0}")]
    Binary(binrw::Error),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptContainer(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Per-entry failures that a bulk operation records and steps past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::CorruptContainer(_)
                | Error::MissingExternalArchive { .. }
                | Error::Codec(_)
                | Error::TruncatedIo { .. }
                | Error::Binary(_)
        )
    }
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Error::TruncatedIo {
                wanted: 0,
                available: 0,
            },
            binrw::Error::Io(e) => Error::IoFault(e),
            binrw::Error::BadMagic { pos, .. } => {
                Error::CorruptContainer(format!("bad magic at 0x{:X}", pos))
            }
            other => Error::Binary(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
