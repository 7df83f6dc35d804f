pub mod codec;
pub mod config;
pub mod crc;
pub mod engine;
pub mod error;
pub mod image;
pub mod marker;
pub mod md5;
pub mod mem;
pub mod package;
pub mod progress;
pub mod sfar;
pub mod stream;
pub mod texmap;
pub mod texture;
pub mod toc;

pub use codec::{BlockCodec, Codec, Codecs};
pub use config::{GameConfig, GameContext, GameKind};
pub use engine::{extract_texture, install, InstallOptions, InstallReport, Notice, Stage};
pub use error::{Error, Result};
pub use image::{Image, ImageMip, PixelCodec, PixelFormat};
pub use marker::InstallMarker;
pub use mem::{MemArchive, MemWriter};
pub use package::header::PackageHeader;
pub use package::Package;
pub use progress::Progress;
pub use texmap::{TextureMap, TextureMapEntry};
pub use texture::{StorageKind, Texture, TextureMovie};
