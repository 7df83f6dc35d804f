use crate::config::GameKind;
use crate::error::{Error, Result};
use crate::package::tables::{NameRef, NameTable};
use crate::stream::BinaryStream;

#[derive(Debug, Clone, PartialEq)]
pub enum ByteValue {
    Byte(u8),
    Enum(NameRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte {
        /// Only serialised by ME3.
        enum_type: Option<NameRef>,
        value: ByteValue,
    },
    Int(i32),
    Float(f32),
    Name(NameRef),
    Struct { struct_name: NameRef, raw: Vec<u8> },
    Raw(Vec<u8>),
}

impl PropertyValue {
    fn size(&self) -> i32 {
        match self {
            PropertyValue::Bool(_) => 0,
            PropertyValue::Byte { value: ByteValue::Byte(_), .. } => 1,
            PropertyValue::Byte { value: ByteValue::Enum(_), .. } => 8,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 4,
            PropertyValue::Name(_) => 8,
            PropertyValue::Struct { raw, .. } | PropertyValue::Raw(raw) => raw.len() as i32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub name_ref: NameRef,
    pub type_name: String,
    pub type_ref: NameRef,
    pub array_index: i32,
    pub value: PropertyValue,
}

/// Tagged property list of one export, terminated by a `None` name.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyBlock {
    pub game: GameKind,
    pub props: Vec<Property>,
    terminator: NameRef,
}

impl PropertyBlock {
    pub fn read(stream: &mut dyn BinaryStream, names: &NameTable, game: GameKind) -> Result<Self> {
        let mut props = Vec::new();
        loop {
            let name_ref = NameRef::read(stream)?;
            let base = names.get(name_ref.index)?;
            if base == "None" {
                return Ok(Self {
                    game,
                    props,
                    terminator: name_ref,
                });
            }
            let name = names.resolve(name_ref)?;
            let type_ref = NameRef::read(stream)?;
            let type_name = names.get(type_ref.index)?.to_string();
            let size = stream.read_i32()?;
            let array_index = stream.read_i32()?;
            let remaining = stream.length()?.saturating_sub(stream.position()?);
            if size < 0 || size as u64 > remaining {
                return Err(Error::parse(format!(
                    "property {} claims {} bytes, {} left",
                    name, size, remaining
                )));
            }

            let value = match type_name.as_str() {
                "BoolProperty" => {
                    if game.compact_properties() {
                        PropertyValue::Bool(stream.read_u8()? != 0)
                    } else {
                        PropertyValue::Bool(stream.read_u32()? != 0)
                    }
                }
                "ByteProperty" => {
                    let enum_type = if game.compact_properties() {
                        Some(NameRef::read(stream)?)
                    } else {
                        None
                    };
                    let value = match size {
                        1 => ByteValue::Byte(stream.read_u8()?),
                        8 => ByteValue::Enum(NameRef::read(stream)?),
                        n => return Err(Error::parse(format!("byte property {} has size {}", name, n))),
                    };
                    PropertyValue::Byte { enum_type, value }
                }
                "IntProperty" if size == 4 => PropertyValue::Int(stream.read_i32()?),
                "FloatProperty" if size == 4 => PropertyValue::Float(f32::from_bits(stream.read_u32()?)),
                "NameProperty" if size == 8 => PropertyValue::Name(NameRef::read(stream)?),
                "StructProperty" => {
                    let struct_name = NameRef::read(stream)?;
                    PropertyValue::Struct {
                        struct_name,
                        raw: stream.read_bytes(size as usize)?,
                    }
                }
                _ => PropertyValue::Raw(stream.read_bytes(size as usize)?),
            };

            props.push(Property {
                name,
                name_ref,
                type_name,
                type_ref,
                array_index,
                value,
            });
        }
    }

    pub fn write(&self, stream: &mut dyn BinaryStream) -> Result<()> {
        for p in &self.props {
            p.name_ref.write(stream)?;
            p.type_ref.write(stream)?;
            stream.write_i32(p.value.size())?;
            stream.write_i32(p.array_index)?;
            match &p.value {
                PropertyValue::Bool(b) => {
                    if self.game.compact_properties() {
                        stream.write_u8(*b as u8)?;
                    } else {
                        stream.write_u32(*b as u32)?;
                    }
                }
                PropertyValue::Byte { enum_type, value } => {
                    if self.game.compact_properties() {
                        enum_type.unwrap_or_default().write(stream)?;
                    }
                    match value {
                        ByteValue::Byte(v) => stream.write_u8(*v)?,
                        ByteValue::Enum(r) => r.write(stream)?,
                    }
                }
                PropertyValue::Int(v) => stream.write_i32(*v)?,
                PropertyValue::Float(v) => stream.write_u32(v.to_bits())?,
                PropertyValue::Name(r) => r.write(stream)?,
                PropertyValue::Struct { struct_name, raw } => {
                    struct_name.write(stream)?;
                    stream.write_bytes(raw)?;
                }
                PropertyValue::Raw(raw) => stream.write_bytes(raw)?,
            }
        }
        self.terminator.write(stream)
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.props
            .iter()
            .find(|p| p.array_index == 0 && p.name.eq_ignore_ascii_case(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.get(name)?.value {
            PropertyValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)?.value {
            PropertyValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_name(&self, name: &str, names: &NameTable) -> Option<String> {
        match self.get(name)?.value {
            PropertyValue::Name(r) => names.resolve(r).ok(),
            _ => None,
        }
    }

    /// Value name of an enum byte property, e.g. `PF_DXT5` for `Format`.
    pub fn get_enum(&self, name: &str, names: &NameTable) -> Option<String> {
        match self.get(name)?.value {
            PropertyValue::Byte {
                value: ByteValue::Enum(r),
                ..
            } => names.resolve(r).ok(),
            _ => None,
        }
    }

    pub fn get_struct(&self, name: &str) -> Option<&[u8]> {
        match &self.get(name)?.value {
            PropertyValue::Struct { raw, .. } => Some(raw),
            _ => None,
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.props.len();
        self.props.retain(|p| !p.name.eq_ignore_ascii_case(name));
        self.props.len() != before
    }

    fn set(&mut self, names: &mut NameTable, name: &str, type_name: &str, value: PropertyValue) {
        if let Some(p) = self
            .props
            .iter_mut()
            .find(|p| p.array_index == 0 && p.name.eq_ignore_ascii_case(name))
        {
            p.value = value;
            return;
        }
        self.props.push(Property {
            name: name.to_string(),
            name_ref: names.name_ref(name),
            type_name: type_name.to_string(),
            type_ref: names.name_ref(type_name),
            array_index: 0,
            value,
        });
    }

    pub fn set_int(&mut self, names: &mut NameTable, name: &str, value: i32) {
        self.set(names, name, "IntProperty", PropertyValue::Int(value));
    }

    pub fn set_bool(&mut self, names: &mut NameTable, name: &str, value: bool) {
        self.set(names, name, "BoolProperty", PropertyValue::Bool(value));
    }

    pub fn set_enum(&mut self, names: &mut NameTable, name: &str, enum_type: &str, value: &str) {
        let enum_ref = names.name_ref(enum_type);
        let value_ref = names.name_ref(value);
        self.set(
            names,
            name,
            "ByteProperty",
            PropertyValue::Byte {
                enum_type: Some(enum_ref),
                value: ByteValue::Enum(value_ref),
            },
        );
    }
}
