use super::properties::PropertyBlock;
use super::{Bulk, ExportWriter, MOVIE_CLASS};
use crate::config::{GameContext, GameKind};
use crate::error::{Error, Result};
use crate::package::tables::NameTable;
use crate::package::Package;
use crate::stream::{BinaryStream, MemoryStream};
use std::path::Path;

/// `TextureMovie` export: a property block followed by one Bink payload.
#[derive(Debug, Clone)]
pub struct TextureMovie {
    pub game: GameKind,
    pub name: String,
    net_index: i32,
    pub properties: PropertyBlock,
    pub bulk: Bulk,
    pub rest: Vec<u8>,
}

impl TextureMovie {
    pub fn from_export(package: &mut Package, index: usize) -> Result<Self> {
        let class = package.class_name(index)?;
        if class != MOVIE_CLASS {
            return Err(Error::parse(format!("export {} is a {}, not a movie", index, class)));
        }
        let data = package.export_data(index)?;
        let mut movie = Self::from_bytes(&data, &package.names, package.game())?;
        movie.name = package.full_path(index)?;
        Ok(movie)
    }

    pub fn from_bytes(data: &[u8], names: &NameTable, game: GameKind) -> Result<Self> {
        let mut s = MemoryStream::from_vec(data.to_vec());
        let net_index = s.read_i32()?;
        let properties = PropertyBlock::read(&mut s, names, game)?;
        let archive = properties
            .get_name("TextureFileCacheName", names)
            .unwrap_or_default();
        let bulk = Bulk::read(&mut s, &archive)?;
        let pos = s.position()? as usize;
        Ok(Self {
            game,
            name: String::new(),
            net_index,
            properties,
            bulk,
            rest: data[pos..].to_vec(),
        })
    }

    pub fn serialize(&self, export_offset: u32) -> Result<Vec<u8>> {
        let mut out = ExportWriter::new(export_offset);
        out.stream.write_i32(self.net_index)?;
        self.properties.write(&mut out.stream)?;
        self.bulk.write(&mut out)?;
        out.stream.write_bytes(&self.rest)?;
        Ok(out.stream.into_inner())
    }

    /// Bink payload bytes, wherever they are stored.
    pub fn data(&self, ctx: &GameContext, package: &Path) -> Result<Vec<u8>> {
        let guid = self.properties.get_struct("TFCFileGuid");
        self.bulk.load(ctx, package, &self.name, guid)
    }

    /// Moves the payload into the package, uncompressed.
    pub fn replace(&mut self, names: &mut NameTable, data: Vec<u8>) {
        let size = data.len() as u32;
        self.bulk = Bulk::in_package(data, size, None);
        if self.properties.remove("TextureFileCacheName") | self.properties.remove("TFCFileGuid") {
            self.properties.set_bool(names, "NeverStream", true);
        }
    }
}
