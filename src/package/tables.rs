use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::stream::BinaryStream;

/// Reference into the names table: index plus instance number (0 = none).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NameRef {
    pub index: i32,
    pub number: i32,
}

impl NameRef {
    pub fn read(stream: &mut dyn BinaryStream) -> Result<Self> {
        Ok(Self {
            index: stream.read_i32()?,
            number: stream.read_i32()?,
        })
    }

    pub fn write(&self, stream: &mut dyn BinaryStream) -> Result<()> {
        stream.write_i32(self.index)?;
        stream.write_i32(self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    pub unicode: bool,
    /// Object flags stored after each name by ME1/ME2.
    pub flags: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NameTable {
    entries: Vec<NameEntry>,
    grown: bool,
}

impl NameTable {
    pub fn read(stream: &mut dyn BinaryStream, game: GameKind, count: u32) -> Result<Self> {
        let mut entries = Vec::with_capacity(count.min(0x10_0000) as usize);
        for _ in 0..count {
            let len = stream.read_i32()?;
            stream.skip(-4)?;
            let name = stream.read_fstring()?;
            let flags = if game == GameKind::Me3 { 0 } else { stream.read_u64()? };
            entries.push(NameEntry {
                name,
                unicode: len < 0,
                flags,
            });
        }
        Ok(Self {
            entries,
            grown: false,
        })
    }

    pub fn write(&self, stream: &mut dyn BinaryStream, game: GameKind) -> Result<()> {
        for e in &self.entries {
            stream.write_fstring(&e.name, e.unicode)?;
            if game != GameKind::Me3 {
                stream.write_u64(e.flags)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once `index_or_add` appended a name since the package was opened.
    pub fn is_grown(&self) -> bool {
        self.grown
    }

    pub fn get(&self, index: i32) -> Result<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|e| e.name.as_str())
            .ok_or_else(|| Error::parse(format!("name index {} out of range", index)))
    }

    /// Display form of a reference: `Name` or `Name_<number - 1>`.
    pub fn resolve(&self, name: NameRef) -> Result<String> {
        let base = self.get(name.index)?;
        if name.number > 0 {
            Ok(format!("{}_{}", base, name.number - 1))
        } else {
            Ok(base.to_string())
        }
    }

    pub fn find(&self, name: &str) -> Option<i32> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .map(|i| i as i32)
    }

    pub fn index_or_add(&mut self, name: &str) -> i32 {
        if let Some(i) = self.find(name) {
            return i;
        }
        self.entries.push(NameEntry {
            name: name.to_string(),
            unicode: !name.is_ascii(),
            flags: 0x0007_0010_0000_0000,
        });
        self.grown = true;
        (self.entries.len() - 1) as i32
    }

    pub fn name_ref(&mut self, name: &str) -> NameRef {
        NameRef {
            index: self.index_or_add(name),
            number: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub class_package: NameRef,
    pub class_name: NameRef,
    pub outer: i32,
    pub object_name: NameRef,
}

impl ImportEntry {
    pub const SIZE: u64 = 28;

    pub fn read(stream: &mut dyn BinaryStream) -> Result<Self> {
        Ok(Self {
            class_package: NameRef::read(stream)?,
            class_name: NameRef::read(stream)?,
            outer: stream.read_i32()?,
            object_name: NameRef::read(stream)?,
        })
    }
}

/// One export record. `tail` holds the generation-specific trailing fields
/// (component map, export flags, net objects, guid, package flags) verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub class_id: i32,
    pub super_id: i32,
    pub outer: i32,
    pub object_name: NameRef,
    pub archetype: i32,
    pub object_flags: u64,
    pub data_size: u32,
    pub data_offset: u32,
    pub tail: Vec<u8>,
    /// Position of this record in the uncompressed package.
    pub table_position: u64,
}

impl ExportEntry {
    /// Offset of `data_size` inside a record; `data_offset` follows it.
    pub const DATA_FIELDS_AT: u64 = 32;

    pub fn read(stream: &mut dyn BinaryStream, game: GameKind) -> Result<Self> {
        let table_position = stream.position()?;
        let class_id = stream.read_i32()?;
        let super_id = stream.read_i32()?;
        let outer = stream.read_i32()?;
        let object_name = NameRef::read(stream)?;
        let archetype = stream.read_i32()?;
        let object_flags = stream.read_u64()?;
        let data_size = stream.read_u32()?;
        let data_offset = stream.read_u32()?;

        let tail_start = stream.position()?;
        if game != GameKind::Me3 {
            let components = stream.read_u32()?;
            if components > 0x1000 {
                return Err(Error::parse(format!("implausible component count {}", components)));
            }
            stream.skip(components as i64 * 12)?;
        }
        stream.skip(4)?; // export flags
        let net_objects = stream.read_u32()?;
        if net_objects > 0x10000 {
            return Err(Error::parse(format!("implausible net object count {}", net_objects)));
        }
        stream.skip(net_objects as i64 * 4 + 16 + 4)?;
        let tail_len = stream.position()? - tail_start;
        stream.jump_to(tail_start)?;
        let tail = stream.read_bytes(tail_len as usize)?;

        Ok(Self {
            class_id,
            super_id,
            outer,
            object_name,
            archetype,
            object_flags,
            data_size,
            data_offset,
            tail,
            table_position,
        })
    }

    pub fn write(&self, stream: &mut dyn BinaryStream) -> Result<()> {
        stream.write_i32(self.class_id)?;
        stream.write_i32(self.super_id)?;
        stream.write_i32(self.outer)?;
        self.object_name.write(stream)?;
        stream.write_i32(self.archetype)?;
        stream.write_u64(self.object_flags)?;
        stream.write_u32(self.data_size)?;
        stream.write_u32(self.data_offset)?;
        stream.write_bytes(&self.tail)
    }

    pub fn byte_len(&self) -> u64 {
        Self::DATA_FIELDS_AT + 8 + self.tail.len() as u64
    }
}
