mod common;

use common::{argb_chain, argb_pixels, build_package, ExportSpec, GameDir, Mip};
use memtex::codec::{compress_chunk, Codecs};
use memtex::config::GameKind;
use memtex::image::ImageMip;
use memtex::package::header::{ChunkEntry, PackageHeader, COMPRESSION_ZLIB, PACKAGE_FLAG_COMPRESSED};
use memtex::package::MEM_END_MARKER;
use memtex::stream::{BinaryStream, MemoryStream};
use memtex::texture::StorageKind;
use memtex::{Codec, Error, Package, PixelFormat, Texture};

fn two_textures() -> Vec<ExportSpec> {
    vec![
        ExportSpec::texture("Tex_A", "PF_A8R8G8B8", argb_chain(8, 8, 1)),
        ExportSpec::texture("Tex_B", "PF_A8R8G8B8", argb_chain(4, 4, 9)),
    ]
}

#[test]
fn test_open_reads_tables() {
    let gd = GameDir::new(GameKind::Me3);
    let path = gd.package("Tables.pcc", &two_textures());
    let pkg = Package::open(&path).unwrap();

    assert_eq!(pkg.game(), GameKind::Me3);
    assert_eq!(pkg.exports.len(), 2);
    assert_eq!(pkg.imports.len(), 2);
    assert_eq!(pkg.object_name(0).unwrap(), "Tex_A");
    assert_eq!(pkg.class_name(1).unwrap(), "Texture2D");
    assert_eq!(pkg.full_path(1).unwrap(), "Tex_B");
    assert!(!pkg.was_compressed());
    assert!(!pkg.has_mem_marker());
}

#[test]
fn test_unchanged_save_is_byte_identical() {
    let gd = GameDir::new(GameKind::Me3);
    let path = gd.package("Same.pcc", &two_textures());
    let original = std::fs::read(&path).unwrap();

    let mut pkg = Package::open(&path).unwrap();
    assert!(!pkg.has_changes());
    let copy = gd.root().join("copy.pcc");
    pkg.write_to(&copy, false).unwrap();

    assert_eq!(std::fs::read(&copy).unwrap(), original);
}

#[test]
fn test_new_names_alone_do_not_mark_the_package_changed() {
    let gd = GameDir::new(GameKind::Me3);
    let path = gd.package("Names.pcc", &two_textures());
    let mut pkg = Package::open(&path).unwrap();
    let before = pkg.names.len();
    pkg.names.index_or_add("Brand_New_Name");
    assert_eq!(pkg.names.len(), before + 1);
    assert!(!pkg.has_changes());
}

#[test]
fn test_table_offsets_outside_the_file_are_rejected() {
    let gd = GameDir::new(GameKind::Me3);
    let plain = build_package(GameKind::Me3, &two_textures());
    let mut s = MemoryStream::from_vec(plain.clone());
    let header = PackageHeader::read(&mut s).unwrap();
    let header_len = s.position().unwrap() as usize;

    for (what, patch) in [
        ("names", (|h: &mut PackageHeader| h.names_offset = 0xF0_0000) as fn(&mut PackageHeader)),
        ("exports", |h: &mut PackageHeader| h.exports_offset = 4),
    ] {
        let mut bad = header.clone();
        patch(&mut bad);
        let mut out = MemoryStream::new();
        bad.write(&mut out).unwrap();
        out.write_bytes(&plain[header_len..]).unwrap();
        let path = gd.write(&format!("BIOGame/CookedPCConsole/Bad_{}.pcc", what), &out.into_inner());
        assert!(
            matches!(Package::open(&path), Err(Error::Parse(_) | Error::CorruptContainer(_) | Error::TruncatedIo { .. })),
            "{} offset accepted",
            what
        );
    }
}

#[test]
fn test_texture_fields_parse() {
    let gd = GameDir::new(GameKind::Me3);
    let path = gd.package("Fields.pcc", &two_textures());
    let mut pkg = Package::open(&path).unwrap();
    let tex = Texture::from_export(&mut pkg, 0).unwrap();

    assert_eq!(tex.name, "Tex_A");
    assert_eq!(tex.format(&pkg.names), Some(PixelFormat::Argb));
    assert_eq!(tex.mips.len(), 4);
    assert_eq!((tex.mips[0].width, tex.mips[0].height), (8, 8));
    assert_eq!(tex.mips[0].bulk.storage, StorageKind::InPackage { compressed: None });
    assert_eq!(tex.mips[0].bulk.data, argb_pixels(8, 8, 1));
    assert_eq!(tex.properties.get_int("SizeX"), Some(8));
    assert_eq!(tex.properties.get_int("MipTailBaseIdx"), Some(3));
}

#[test]
fn test_growing_an_export_shifts_the_next_one() {
    let gd = GameDir::new(GameKind::Me3);
    let path = gd.package("Grow.pcc", &two_textures());
    let ctx = gd.context();

    let mut pkg = Package::open(&path).unwrap();
    let old_a = pkg.exports[0].clone();
    let old_b_offset = pkg.exports[1].data_offset;

    let mut tex = Texture::from_export(&mut pkg, 0).unwrap();
    let mips = vec![
        ImageMip { width: 16, height: 16, data: argb_pixels(16, 16, 40) },
        ImageMip { width: 8, height: 8, data: argb_pixels(8, 8, 41) },
    ];
    tex.replace_mipmaps(mips, &Codecs::default()).unwrap();
    tex.update_properties(&mut pkg.names, PixelFormat::Argb, false);
    let data = tex.serialize(old_a.data_offset).unwrap();
    let grown_by = data.len() as u32 - old_a.data_size;
    pkg.set_export_data(0, data).unwrap();
    pkg.save(true).unwrap();

    assert!(pkg.has_mem_marker());
    assert_eq!(pkg.exports[0].data_offset, old_a.data_offset);
    assert_eq!(pkg.exports[1].data_offset, old_b_offset + grown_by);
    assert_eq!(pkg.exports[0].data_offset + pkg.exports[0].data_size, pkg.exports[1].data_offset);

    let a = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(a.properties.get_int("SizeX"), Some(16));
    assert_eq!(a.properties.get_int("MipTailBaseIdx"), Some(1));
    assert_eq!(a.top_mip_data(&ctx, &path).unwrap(), argb_pixels(16, 16, 40));

    // the moved export's inline payload offsets follow it
    let b = Texture::from_export(&mut pkg, 1).unwrap();
    assert_eq!(b.top_mip_data(&ctx, &path).unwrap(), argb_pixels(4, 4, 9));
    let raw = pkg.export_data(1).unwrap();
    assert_eq!(b.serialize(pkg.exports[1].data_offset).unwrap(), raw);

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.ends_with(MEM_END_MARKER));
}

#[test]
fn test_large_mips_are_zlib_stored_outside_me3() {
    let gd = GameDir::new(GameKind::Me2);
    let path = gd.package(
        "BioD_Large.pcc",
        &[ExportSpec::texture("Tex_Big", "PF_A8R8G8B8", argb_chain(4, 4, 3))],
    );
    let ctx = gd.context();

    let mut pkg = Package::open(&path).unwrap();
    let mut tex = Texture::from_export(&mut pkg, 0).unwrap();
    let big = argb_pixels(64, 64, 5);
    let small = argb_pixels(32, 32, 6);
    tex.replace_mipmaps(
        vec![
            ImageMip { width: 64, height: 64, data: big.clone() },
            ImageMip { width: 32, height: 32, data: small.clone() },
        ],
        &Codecs::default(),
    )
    .unwrap();
    tex.update_properties(&mut pkg.names, PixelFormat::Argb, false);
    let offset = pkg.exports[0].data_offset;
    pkg.set_export_data(0, tex.serialize(offset).unwrap()).unwrap();
    pkg.save(true).unwrap();

    let tex = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(tex.mips[0].bulk.storage, StorageKind::InPackage { compressed: Some(Codec::Zlib) });
    assert_eq!(tex.mips[0].bulk.uncompressed_size, 64 * 64 * 4);
    assert_eq!(tex.mips[1].bulk.storage, StorageKind::InPackage { compressed: None });
    assert_eq!(tex.mip_data(0, &ctx, &path).unwrap(), big);
    assert_eq!(tex.mip_data(1, &ctx, &path).unwrap(), small);
}

#[test]
fn test_empty_mips_are_dropped_before_replacement() {
    let gd = GameDir::new(GameKind::Me3);
    let mut mips = vec![Mip::Empty { width: 16, height: 16 }];
    mips.extend(argb_chain(8, 8, 2));
    let path = gd.package("Placeholder.pcc", &[ExportSpec::texture("Tex_P", "PF_A8R8G8B8", mips)]);

    let mut pkg = Package::open(&path).unwrap();
    let mut tex = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(tex.mips.len(), 5);
    assert_eq!(tex.top_index(), Some(1));
    tex.remove_empty_mips(&mut pkg.names);
    assert_eq!(tex.mips.len(), 4);
    assert_eq!(tex.properties.get_int("MipTailBaseIdx"), Some(3));
}

/// Re-encodes an uncompressed package as a single zlib chunk.
fn compress_package(plain: &[u8]) -> Vec<u8> {
    let mut s = MemoryStream::from_vec(plain.to_vec());
    let mut header = PackageHeader::read(&mut s).unwrap();
    let header_len = s.position().unwrap() as usize;
    let chunk = compress_chunk(&Codecs::default(), Codec::Zlib, &plain[header_len..]).unwrap();

    header.flags |= PACKAGE_FLAG_COMPRESSED;
    header.compression = COMPRESSION_ZLIB;
    header.chunks = vec![ChunkEntry {
        uncompressed_offset: header_len as u32,
        uncompressed_size: (plain.len() - header_len) as u32,
        compressed_offset: 0,
        compressed_size: chunk.len() as u32,
    }];
    let mut probe = MemoryStream::new();
    header.write(&mut probe).unwrap();
    header.chunks[0].compressed_offset = probe.as_slice().len() as u32;

    let mut out = MemoryStream::new();
    header.write(&mut out).unwrap();
    out.write_bytes(&chunk).unwrap();
    out.into_inner()
}

#[test]
fn test_compressed_package_is_saved_uncompressed() {
    let gd = GameDir::new(GameKind::Me3);
    let plain = build_package(GameKind::Me3, &two_textures());
    let packed = compress_package(&plain);
    let path = gd.write("BIOGame/CookedPCConsole/Packed.pcc", &packed);

    let mut pkg = Package::open(&path).unwrap();
    assert!(pkg.was_compressed());
    let expected = {
        let plain_path = gd.write("BIOGame/CookedPCConsole/Plain.pcc", &plain);
        let mut p = Package::open(&plain_path).unwrap();
        p.export_data(1).unwrap()
    };
    assert_eq!(pkg.export_data(1).unwrap(), expected);

    let out = gd.root().join("inflated.pcc");
    pkg.write_to(&out, false).unwrap();
    let mut reopened = Package::open(&out).unwrap();
    assert!(!reopened.was_compressed());
    assert!(reopened.header.chunks.is_empty());
    assert_eq!(reopened.export_data(1).unwrap(), expected);
    assert_eq!(std::fs::read(&out).unwrap(), plain);
}

#[test]
fn test_truncated_package_is_rejected() {
    let gd = GameDir::new(GameKind::Me3);
    let plain = build_package(GameKind::Me3, &two_textures());
    let path = gd.write("BIOGame/CookedPCConsole/Short.pcc", &plain[..plain.len() - 40]);
    assert!(Package::open(&path).is_err());
}
