#![allow(dead_code)]

use memtex::config::{GameConfig, GameKind};
use memtex::image::dds::write_dds;
use memtex::image::{Image, ImageMip, PixelFormat};
use memtex::package::header::{Generation, PackageHeader};
use memtex::package::tables::{ExportEntry, NameRef, NameTable};
use memtex::stream::{BinaryStream, MemoryStream};
use memtex::GameContext;
use std::path::{Path, PathBuf};

pub enum Mip {
    Stored { width: u32, height: u32, data: Vec<u8> },
    External { width: u32, height: u32, offset: u32, size: u32 },
    Empty { width: u32, height: u32 },
}

pub enum Body {
    Texture {
        format: &'static str,
        mips: Vec<Mip>,
        tfc: Option<&'static str>,
    },
    Movie(Vec<u8>),
}

pub struct ExportSpec {
    pub name: &'static str,
    pub body: Body,
}

impl ExportSpec {
    pub fn texture(name: &'static str, format: &'static str, mips: Vec<Mip>) -> Self {
        Self {
            name,
            body: Body::Texture { format, mips, tfc: None },
        }
    }

    pub fn streamed(name: &'static str, format: &'static str, tfc: &'static str, mips: Vec<Mip>) -> Self {
        Self {
            name,
            body: Body::Texture {
                format,
                mips,
                tfc: Some(tfc),
            },
        }
    }

    pub fn movie(name: &'static str, data: Vec<u8>) -> Self {
        Self {
            name,
            body: Body::Movie(data),
        }
    }

    fn class(&self) -> &'static str {
        match self.body {
            Body::Texture { .. } => "Texture2D",
            Body::Movie(_) => "TextureMovie",
        }
    }
}

/// Deterministic ARGB pixels; `seed` keeps textures of equal size apart.
pub fn argb_pixels(width: u32, height: u32, seed: u8) -> Vec<u8> {
    (0..width * height * 4)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Stored ARGB mip chain down to 1x1.
pub fn argb_chain(width: u32, height: u32, seed: u8) -> Vec<Mip> {
    let (mut w, mut h) = (width, height);
    let mut mips = Vec::new();
    loop {
        mips.push(Mip::Stored {
            width: w,
            height: h,
            data: argb_pixels(w, h, seed.wrapping_add(mips.len() as u8)),
        });
        if w == 1 && h == 1 {
            break;
        }
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    mips
}

pub fn argb_dds(width: u32, height: u32, seed: u8) -> Vec<u8> {
    write_dds(&Image {
        format: PixelFormat::Argb,
        mips: vec![ImageMip {
            width,
            height,
            data: argb_pixels(width, height, seed),
        }],
    })
    .unwrap()
}

fn name(s: &mut MemoryStream, names: &mut NameTable, value: &str) {
    NameRef {
        index: names.index_or_add(value),
        number: 0,
    }
    .write(s)
    .unwrap();
}

fn int_prop(s: &mut MemoryStream, names: &mut NameTable, prop: &str, value: i32) {
    name(s, names, prop);
    name(s, names, "IntProperty");
    s.write_i32(4).unwrap();
    s.write_i32(0).unwrap();
    s.write_i32(value).unwrap();
}

fn enum_prop(s: &mut MemoryStream, names: &mut NameTable, game: GameKind, prop: &str, enum_type: &str, value: &str) {
    name(s, names, prop);
    name(s, names, "ByteProperty");
    s.write_i32(8).unwrap();
    s.write_i32(0).unwrap();
    if game == GameKind::Me3 {
        name(s, names, enum_type);
    }
    name(s, names, value);
}

fn name_prop(s: &mut MemoryStream, names: &mut NameTable, prop: &str, value: &str) {
    name(s, names, prop);
    name(s, names, "NameProperty");
    s.write_i32(8).unwrap();
    s.write_i32(0).unwrap();
    name(s, names, value);
}

/// Absolute offset of the byte after a 4-byte field written next.
fn field_end(s: &mut MemoryStream, base: u32) -> u32 {
    base + s.position().unwrap() as u32 + 4
}

fn write_stored(s: &mut MemoryStream, base: u32, data: &[u8]) {
    s.write_u32(0).unwrap();
    s.write_u32(data.len() as u32).unwrap();
    s.write_u32(data.len() as u32).unwrap();
    let at = field_end(s, base);
    s.write_u32(at).unwrap();
    s.write_bytes(data).unwrap();
}

fn write_mip(s: &mut MemoryStream, base: u32, mip: &Mip) {
    match mip {
        Mip::Stored { width, height, data } => {
            write_stored(s, base, data);
            s.write_u32(*width).unwrap();
            s.write_u32(*height).unwrap();
        }
        Mip::External {
            width,
            height,
            offset,
            size,
        } => {
            s.write_u32(0x1).unwrap();
            s.write_u32(*size).unwrap();
            s.write_u32(*size).unwrap();
            s.write_u32(*offset).unwrap();
            s.write_u32(*width).unwrap();
            s.write_u32(*height).unwrap();
        }
        Mip::Empty { width, height } => {
            s.write_u32(0x21).unwrap();
            s.write_u32(0).unwrap();
            s.write_u32(0).unwrap();
            s.write_u32(0).unwrap();
            s.write_u32(*width).unwrap();
            s.write_u32(*height).unwrap();
        }
    }
}

fn body_bytes(spec: &ExportSpec, names: &mut NameTable, game: GameKind, base: u32) -> Vec<u8> {
    let mut s = MemoryStream::new();
    s.write_i32(0).unwrap();
    match &spec.body {
        Body::Texture { format, mips, tfc } => {
            let top = mips
                .iter()
                .map(|m| match m {
                    Mip::Stored { width, height, .. }
                    | Mip::External { width, height, .. }
                    | Mip::Empty { width, height } => (*width, *height),
                })
                .next()
                .unwrap_or((0, 0));
            int_prop(&mut s, names, "SizeX", top.0 as i32);
            int_prop(&mut s, names, "SizeY", top.1 as i32);
            enum_prop(&mut s, names, game, "Format", "EPixelFormat", format);
            if let Some(tfc) = tfc {
                name_prop(&mut s, names, "TextureFileCacheName", tfc);
            }
            int_prop(&mut s, names, "MipTailBaseIdx", mips.len() as i32 - 1);
            name(&mut s, names, "None");
            if game != GameKind::Me3 {
                s.write_zeros(12).unwrap();
                let at = field_end(&mut s, base);
                s.write_u32(at).unwrap();
            }
            s.write_i32(mips.len() as i32).unwrap();
            for mip in mips {
                write_mip(&mut s, base, mip);
            }
            // trailing guid
            s.write_zeros(16).unwrap();
        }
        Body::Movie(data) => {
            int_prop(&mut s, names, "SizeX", 640);
            int_prop(&mut s, names, "SizeY", 360);
            name(&mut s, names, "None");
            write_stored(&mut s, base, data);
        }
    }
    s.into_inner()
}

fn export_tail(game: GameKind) -> Vec<u8> {
    let len = if game == GameKind::Me3 { 28 } else { 32 };
    vec![0u8; len]
}

/// Serialises an uncompressed package holding `exports`; every export is a
/// top-level object whose class is an import.
pub fn build_package(game: GameKind, exports: &[ExportSpec]) -> Vec<u8> {
    let mut names = NameTable::default();
    for n in ["None", "Core", "Class", "Texture2D", "TextureMovie"] {
        names.index_or_add(n);
    }
    for e in exports {
        names.index_or_add(e.name);
        body_bytes(e, &mut names, game, 0);
    }
    let sizes: Vec<u32> = exports
        .iter()
        .map(|e| body_bytes(e, &mut names, game, 0).len() as u32)
        .collect();

    let mut header = PackageHeader {
        game,
        version: game.package_version(),
        licensee: game.licensee_version(),
        header_size: 0,
        folder_name: "None".to_string(),
        flags: 0,
        me3_unknown: 0,
        names_count: names.len() as u32,
        names_offset: 0,
        exports_count: exports.len() as u32,
        exports_offset: 0,
        imports_count: 2,
        imports_offset: 0,
        depends_offset: 0,
        me3_extra: [0; 4],
        guid: [7; 16],
        generations: vec![Generation {
            exports: exports.len() as u32,
            names: names.len() as u32,
            net_objects: 0,
        }],
        engine_version: 6383,
        cooker_version: 196_658,
        compression: 0,
        chunks: Vec::new(),
        package_source: 0,
        additional_packages: Vec::new(),
    };

    let mut probe = MemoryStream::new();
    header.write(&mut probe).unwrap();
    let header_len = probe.as_slice().len() as u32;
    let mut table = MemoryStream::new();
    names.write(&mut table, game).unwrap();
    let names_len = table.as_slice().len() as u32;
    let export_len = ExportEntry::DATA_FIELDS_AT as u32 + 8 + export_tail(game).len() as u32;

    header.names_offset = header_len;
    header.imports_offset = header.names_offset + names_len;
    header.exports_offset = header.imports_offset + 2 * 28;
    header.depends_offset = header.exports_offset + exports.len() as u32 * export_len;
    let data_start = header.depends_offset + 4 * exports.len() as u32;
    header.header_size = data_start;

    let mut offsets = Vec::with_capacity(exports.len());
    let mut at = data_start;
    for size in &sizes {
        offsets.push(at);
        at += size;
    }

    let mut s = MemoryStream::new();
    header.write(&mut s).unwrap();
    names.write(&mut s, game).unwrap();
    for class in ["Texture2D", "TextureMovie"] {
        name(&mut s, &mut names, "Core");
        name(&mut s, &mut names, "Class");
        s.write_i32(0).unwrap();
        name(&mut s, &mut names, class);
    }
    for (i, e) in exports.iter().enumerate() {
        let class_id = if e.class() == "Texture2D" { -1 } else { -2 };
        ExportEntry {
            class_id,
            super_id: 0,
            outer: 0,
            object_name: NameRef {
                index: names.index_or_add(e.name),
                number: 0,
            },
            archetype: 0,
            object_flags: 0,
            data_size: sizes[i],
            data_offset: offsets[i],
            tail: export_tail(game),
            table_position: 0,
        }
        .write(&mut s)
        .unwrap();
    }
    s.write_zeros(4 * exports.len()).unwrap();
    for (i, e) in exports.iter().enumerate() {
        let data = body_bytes(e, &mut names, game, offsets[i]);
        assert_eq!(data.len() as u32, sizes[i]);
        s.write_bytes(&data).unwrap();
    }
    assert_eq!(names.len() as u32, header.names_count);
    s.into_inner()
}

/// Scratch install with the main data folder and the sentinel file in place.
pub struct GameDir {
    pub dir: tempfile::TempDir,
    pub config: GameConfig,
}

impl GameDir {
    pub fn new(game: GameKind) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = GameConfig::new(game, dir.path());
        std::fs::create_dir_all(config.main_data_path()).unwrap();
        std::fs::create_dir_all(config.dlc_path()).unwrap();
        let gd = Self { dir, config };
        if game == GameKind::Me3 {
            gd.write(game.sentinel_path(), b"sentinel audio bank");
        } else {
            gd.write(game.sentinel_path(), &build_package(game, &[]));
        }
        gd
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `data` at a root-relative `/` path and returns the full path.
    pub fn write(&self, rel: &str, data: &[u8]) -> PathBuf {
        let path = self.config.absolute_path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    pub fn package(&self, file: &str, exports: &[ExportSpec]) -> PathBuf {
        let rel = format!("{}/{}", self.config.game.main_data_dir(), file);
        self.write(&rel, &build_package(self.config.game, exports))
    }

    pub fn context(&self) -> GameContext {
        GameContext::new(self.config.clone())
    }
}

pub fn ignore_progress(_percent: u32, _stage: &str) {}
