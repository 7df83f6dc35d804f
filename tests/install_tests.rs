mod common;

use common::{argb_chain, argb_dds, argb_pixels, ignore_progress, ExportSpec, GameDir, Mip};
use memtex::config::GameKind;
use memtex::crc::crc32;
use memtex::engine::{self, InstallOptions, Notice};
use memtex::image::dds::read_dds;
use memtex::sfar::{self, Sfar};
use memtex::toc::{Toc, TOC_FILE_NAME};
use memtex::image::BuiltinPixelCodec;
use memtex::{marker, Error, MemWriter, Package, PixelCodec, PixelFormat, Texture, TextureMovie};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WARDS: &str = "BIOGame/CookedPCConsole/BioA_Wards.pcc";

fn wards(gd: &GameDir) -> PathBuf {
    gd.package(
        "BioA_Wards.pcc",
        &[
            ExportSpec::texture("Wall_Diff", "PF_A8R8G8B8", argb_chain(8, 8, 1)),
            ExportSpec::texture("Floor_Diff", "PF_A8R8G8B8", argb_chain(4, 4, 20)),
            ExportSpec::movie("Ward_Screen", b"BIKi original".to_vec()),
        ],
    )
}

fn mem_with_texture(dir: &Path, file: &str, name: &str, crc: u32, dds: &[u8]) -> PathBuf {
    let mut writer = MemWriter::create(dir.join(file), GameKind::Me3).unwrap();
    writer.add_texture(name, crc, 0, dds).unwrap();
    writer.finish().unwrap()
}

fn options() -> InstallOptions {
    InstallOptions {
        verify: true,
        parallel: true,
        repack_sfar: false,
    }
}

#[test]
fn test_install_replaces_texture_and_marks_game() {
    let gd = GameDir::new(GameKind::Me3);
    let path = wards(&gd);
    let mods = tempfile::tempdir().unwrap();
    let wall_crc = crc32(&argb_pixels(8, 8, 1));
    let dds = argb_dds(16, 16, 77);
    let archive = mem_with_texture(mods.path(), "walls.mem", "Wall_Diff", wall_crc, &dds);

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(report.scanned);
    assert_eq!(report.rewritten, vec![WARDS.to_string()]);
    assert_eq!(report.patched, 1);
    assert_eq!(report.applied_archives, vec!["walls.mem".to_string()]);

    let mut pkg = Package::open(&path).unwrap();
    assert!(pkg.has_mem_marker());
    let wall = Texture::from_export(&mut pkg, 0).unwrap();
    let replacement = read_dds(&dds).unwrap();
    assert_eq!(wall.mips.len(), 5);
    assert_eq!((wall.mips[0].width, wall.mips[0].height), (16, 16));
    assert_eq!(wall.mips[4].width, 1);
    assert_eq!(wall.top_mip_data(&ctx, &path).unwrap(), replacement.mips[0].data);
    assert_eq!(wall.properties.get_int("SizeX"), Some(16));
    assert_eq!(wall.properties.get_int("MipTailBaseIdx"), Some(4));
    assert_eq!(wall.format(&pkg.names), Some(PixelFormat::Argb));

    // neighbours are untouched
    let floor = Texture::from_export(&mut pkg, 1).unwrap();
    assert_eq!(floor.top_mip_data(&ctx, &path).unwrap(), argb_pixels(4, 4, 20));

    let recorded = marker::read_marker(&ctx.config).unwrap().unwrap();
    assert_eq!(recorded.mods, vec!["walls.mem".to_string()]);

    let toc = Toc::read(&gd.root().join("BIOGame").join(TOC_FILE_NAME)).unwrap();
    let entry = toc
        .entries
        .iter()
        .find(|e| e.name == "BIOGame\\CookedPCConsole\\BioA_Wards.pcc")
        .unwrap();
    assert_eq!(entry.size as u64, std::fs::metadata(&path).unwrap().len());
}

#[test]
fn test_second_run_skips_applied_archives() {
    let gd = GameDir::new(GameKind::Me3);
    let path = wards(&gd);
    let mods = tempfile::tempdir().unwrap();
    let archive = mem_with_texture(
        mods.path(),
        "walls.mem",
        "Wall_Diff",
        crc32(&argb_pixels(8, 8, 1)),
        &argb_dds(16, 16, 77),
    );

    let mut progress = ignore_progress;
    let mut ctx = gd.context();
    engine::install(&mut ctx, &[archive.clone()], &options(), &mut progress).unwrap();
    let after_first = std::fs::read(&path).unwrap();
    let sentinel_first = std::fs::read(ctx.config.sentinel_path()).unwrap();

    let mut ctx = gd.context();
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();
    assert!(!report.scanned, "the cache should be trusted once the marker exists");
    assert!(report.rewritten.is_empty());
    assert!(report.applied_archives.is_empty());
    assert_eq!(report.skipped_archives, vec!["walls.mem".to_string()]);
    assert!(report
        .notices
        .contains(&Notice::ArchiveAlreadyApplied("walls.mem".to_string())));
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
    assert_eq!(std::fs::read(ctx.config.sentinel_path()).unwrap(), sentinel_first);
}

#[test]
fn test_unknown_checksum_is_reported_not_fatal() {
    let gd = GameDir::new(GameKind::Me3);
    let path = wards(&gd);
    let before = std::fs::read(&path).unwrap();
    let mods = tempfile::tempdir().unwrap();
    let archive = mem_with_texture(mods.path(), "stray.mem", "Nowhere", 0xDEAD_BEEF, &argb_dds(8, 8, 1));

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert_eq!(report.skipped_textures(), 1);
    assert!(report.notices.contains(&Notice::TextureSkipped {
        archive: "stray.mem".to_string(),
        name: "Nowhere".to_string(),
        crc: 0xDEAD_BEEF,
    }));
    assert!(report.rewritten.is_empty());
    assert!(report.is_clean());
    assert_eq!(std::fs::read(&path).unwrap(), before);
    // the run still completed
    assert!(marker::detect(&ctx.config).unwrap());
}

#[test]
fn test_aspect_ratio_mismatch_fails_the_entry_only() {
    let gd = GameDir::new(GameKind::Me3);
    wards(&gd);
    let mods = tempfile::tempdir().unwrap();
    let mut writer = MemWriter::create(mods.path().join("mixed.mem"), GameKind::Me3).unwrap();
    writer
        .add_texture("Wall_Diff", crc32(&argb_pixels(8, 8, 1)), 0, &argb_dds(16, 8, 3))
        .unwrap();
    writer
        .add_texture("Floor_Diff", crc32(&argb_pixels(4, 4, 20)), 0, &argb_dds(8, 8, 4))
        .unwrap();
    let archive = writer.finish().unwrap();

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].0.contains("Wall_Diff"));
    assert_eq!(report.patched, 1);
    assert_eq!(report.rewritten, vec![WARDS.to_string()]);
}

#[test]
fn test_movie_entries_replace_bink_payloads() {
    let gd = GameDir::new(GameKind::Me3);
    let path = wards(&gd);
    let mods = tempfile::tempdir().unwrap();
    let target = crc32(b"BIKi original");
    let new_movie = b"BIKi replacement with a longer stream".to_vec();
    let mut writer = MemWriter::create(mods.path().join("movies.mem"), GameKind::Me3).unwrap();
    writer.add_movie("Ward_Screen", target, &new_movie).unwrap();
    // a texture payload aimed at the movie is refused
    writer.add_texture("Ward_Screen", target, 0, &argb_dds(4, 4, 1)).unwrap();
    let archive = writer.finish().unwrap();

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.patched, 1);
    assert!(report
        .notices
        .iter()
        .any(|n| matches!(n, Notice::KindMismatch { name, .. } if name == "Ward_Screen")));

    let mut pkg = Package::open(&path).unwrap();
    let movie = TextureMovie::from_export(&mut pkg, 2).unwrap();
    assert_eq!(movie.data(&ctx, &path).unwrap(), new_movie);
}

#[test]
fn test_extract_texture_writes_dds() {
    let gd = GameDir::new(GameKind::Me3);
    wards(&gd);
    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    engine::scan(&mut ctx, &mut progress).unwrap();

    let out = gd.root().join("out").join("wall.dds");
    engine::extract_texture(&ctx, crc32(&argb_pixels(8, 8, 1)), &out).unwrap();
    let image = read_dds(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(image.format, PixelFormat::Argb);
    assert_eq!(image.mips.len(), 4);
    assert_eq!(image.mips[0].data, argb_pixels(8, 8, 1));

    assert!(engine::extract_texture(&ctx, 0x0BAD_0BAD, &out).is_err());
}

#[test]
fn test_archives_for_another_game_are_skipped() {
    let gd = GameDir::new(GameKind::Me3);
    wards(&gd);
    let mods = tempfile::tempdir().unwrap();
    let mut writer = MemWriter::create(mods.path().join("me2.mem"), GameKind::Me2).unwrap();
    writer
        .add_texture("Wall_Diff", crc32(&argb_pixels(8, 8, 1)), 0, &argb_dds(8, 8, 2))
        .unwrap();
    let archive = writer.finish().unwrap();

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert_eq!(report.skipped_archives, vec!["me2.mem".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert!(report.rewritten.is_empty());
}

const DLC_PACKAGE: &str = "BIOGame/DLC/DLC_CON_X/CookedPCConsole/BioD_Xeno.pcc";

/// Packs one DLC package into `DLC_CON_X/CookedPCConsole/Default.sfar`.
fn packed_dlc(gd: &GameDir) -> PathBuf {
    let staging = tempfile::tempdir().unwrap();
    let loose = staging.path().join(DLC_PACKAGE);
    std::fs::create_dir_all(loose.parent().unwrap()).unwrap();
    std::fs::write(
        &loose,
        common::build_package(
            GameKind::Me3,
            &[ExportSpec::texture("Xeno_Diff", "PF_A8R8G8B8", argb_chain(8, 8, 50))],
        ),
    )
    .unwrap();
    let archive = gd.write("BIOGame/DLC/DLC_CON_X/CookedPCConsole/Default.sfar", b"");
    sfar::pack_files(staging.path(), &[loose], &archive).unwrap();
    archive
}

#[test]
fn test_dlc_archives_are_unpacked_and_patched() {
    let gd = GameDir::new(GameKind::Me3);
    let archive = packed_dlc(&gd);
    let mods = tempfile::tempdir().unwrap();
    let mem = mem_with_texture(
        mods.path(),
        "xeno.mem",
        "Xeno_Diff",
        crc32(&argb_pixels(8, 8, 50)),
        &argb_dds(8, 8, 60),
    );

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[mem], &options(), &mut progress).unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(report.notices.contains(&Notice::DlcUnpacked(archive.clone())));
    assert_eq!(report.rewritten, vec![DLC_PACKAGE.to_string()]);
    assert!(sfar::is_unpacked(&archive).unwrap());

    let path = ctx.config.absolute_path(DLC_PACKAGE);
    let mut pkg = Package::open(&path).unwrap();
    let tex = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(tex.top_mip_data(&ctx, &path).unwrap(), argb_pixels(8, 8, 60));

    let toc = Toc::read(&gd.root().join("BIOGame/DLC/DLC_CON_X").join(TOC_FILE_NAME)).unwrap();
    let entry = toc
        .entries
        .iter()
        .find(|e| e.name == "BIOGame\\DLC\\DLC_CON_X\\CookedPCConsole\\BioD_Xeno.pcc")
        .unwrap();
    assert_eq!(entry.size as u64, std::fs::metadata(&path).unwrap().len());
}

#[test]
fn test_patched_dlc_can_be_repacked() {
    let gd = GameDir::new(GameKind::Me3);
    let archive = packed_dlc(&gd);
    let mods = tempfile::tempdir().unwrap();
    let mem = mem_with_texture(
        mods.path(),
        "xeno.mem",
        "Xeno_Diff",
        crc32(&argb_pixels(8, 8, 50)),
        &argb_dds(8, 8, 60),
    );

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let opts = InstallOptions {
        repack_sfar: true,
        ..options()
    };
    let report = engine::install(&mut ctx, &[mem], &opts, &mut progress).unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(report.notices.contains(&Notice::DlcRepacked(archive.clone())));
    assert!(!ctx.config.absolute_path(DLC_PACKAGE).exists());
    assert!(!sfar::is_unpacked(&archive).unwrap());

    let sfar = Sfar::open(&archive).unwrap();
    assert!(sfar
        .entries
        .iter()
        .any(|e| e.name.as_deref() == Some("/BIOGame/DLC/DLC_CON_X/CookedPCConsole/BioD_Xeno.pcc")));
}

/// Stand-in block encoder: every DXT1 level is filled with its width.
struct FakeDxt;

impl PixelCodec for FakeDxt {
    fn decode(&self, _format: PixelFormat, width: u32, height: u32, _data: &[u8]) -> memtex::Result<Vec<u8>> {
        Ok(vec![0; (width * height * 4) as usize])
    }

    fn encode(&self, format: PixelFormat, width: u32, height: u32, _rgba: &[u8]) -> memtex::Result<Vec<u8>> {
        Ok(vec![width as u8; format.mip_byte_size(width, height)])
    }
}

fn dxt1_sign(gd: &GameDir) -> PathBuf {
    gd.package(
        "BioA_Signs.pcc",
        &[ExportSpec::texture(
            "Sign_Diff",
            "PF_DXT1",
            vec![
                Mip::Stored { width: 8, height: 8, data: vec![0x11; 32] },
                Mip::Stored { width: 4, height: 4, data: vec![0x22; 8] },
            ],
        )],
    )
}

#[test]
fn test_block_formats_go_through_the_pixel_codec() {
    let gd = GameDir::new(GameKind::Me3);
    let path = dxt1_sign(&gd);
    let mods = tempfile::tempdir().unwrap();
    let archive = mem_with_texture(mods.path(), "signs.mem", "Sign_Diff", crc32(&[0x11; 32]), &argb_dds(16, 16, 5));

    let mut ctx = gd
        .context()
        .with_pixel_codec(Arc::new(BuiltinPixelCodec::with_block_codec(Arc::new(FakeDxt))));
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);

    let mut pkg = Package::open(&path).unwrap();
    let sign = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(sign.format(&pkg.names), Some(PixelFormat::Dxt1));
    let dims: Vec<(u32, u32)> = sign.mips.iter().map(|m| (m.width, m.height)).collect();
    assert_eq!(dims, vec![(16, 16), (8, 8), (4, 4), (4, 4), (4, 4)]);
    assert_eq!(sign.top_mip_data(&ctx, &path).unwrap(), vec![16u8; 128]);
}

#[test]
fn test_missing_block_encoder_fails_the_entry() {
    let gd = GameDir::new(GameKind::Me3);
    let path = dxt1_sign(&gd);
    let before = std::fs::read(&path).unwrap();
    let mods = tempfile::tempdir().unwrap();
    let archive = mem_with_texture(mods.path(), "signs.mem", "Sign_Diff", crc32(&[0x11; 32]), &argb_dds(16, 16, 5));

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].1, Error::Codec(_)));
    assert!(report.rewritten.is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_missing_texture_cache_fails_one_texture_only() {
    let gd = GameDir::new(GameKind::Me3);
    let streamed = argb_pixels(16, 16, 7);
    let mut tfc = vec![0u8; 16];
    let at = tfc.len() as u32;
    tfc.extend_from_slice(&streamed);
    gd.write("BIOGame/CookedPCConsole/Textures_Main.tfc", &tfc);

    let mut present = vec![Mip::External { width: 16, height: 16, offset: at, size: streamed.len() as u32 }];
    present.extend(argb_chain(8, 8, 3));
    let missing = vec![
        Mip::External { width: 16, height: 16, offset: 16, size: 1024 },
        Mip::Stored { width: 8, height: 8, data: argb_pixels(8, 8, 4) },
    ];
    let path = gd.package(
        "BioH_Streamed.pcc",
        &[
            ExportSpec::streamed("Hair_Diff", "PF_A8R8G8B8", "Textures_Main", present),
            ExportSpec::streamed("Eye_Diff", "PF_A8R8G8B8", "Textures_DLC_Gone", missing),
        ],
    );

    let mods = tempfile::tempdir().unwrap();
    let hair_dds = argb_dds(16, 16, 41);
    let mut writer = MemWriter::create(mods.path().join("heads.mem"), GameKind::Me3).unwrap();
    writer.add_texture("Hair_Diff", crc32(&streamed), 0, &hair_dds).unwrap();
    writer.add_texture("Eye_Diff", crc32(&argb_pixels(16, 16, 9)), 0, &argb_dds(16, 16, 42)).unwrap();
    let archive = writer.finish().unwrap();

    let mut ctx = gd.context();
    let mut progress = ignore_progress;
    let report = engine::install(&mut ctx, &[archive], &options(), &mut progress).unwrap();

    let missing: Vec<&(String, Error)> = report
        .failures
        .iter()
        .filter(|(_, e)| matches!(e, Error::MissingExternalArchive { .. }))
        .collect();
    assert_eq!(missing.len(), 1, "{:?}", report.failures);
    assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
    assert!(matches!(&missing[0].1, Error::MissingExternalArchive { archive, .. } if archive == "Textures_DLC_Gone"));
    assert_eq!(report.skipped_textures(), 1);
    assert_eq!(report.patched, 1);
    assert_eq!(report.rewritten, vec!["BIOGame/CookedPCConsole/BioH_Streamed.pcc".to_string()]);

    let mut pkg = Package::open(&path).unwrap();
    let hair = Texture::from_export(&mut pkg, 0).unwrap();
    assert_eq!(hair.top_mip_data(&ctx, &path).unwrap(), read_dds(&hair_dds).unwrap().mips[0].data);
    let eye = Texture::from_export(&mut pkg, 1).unwrap();
    let dims: Vec<(u32, u32)> = eye.mips.iter().map(|m| (m.width, m.height)).collect();
    assert_eq!(dims, vec![(16, 16), (8, 8)]);
    assert!(eye.mips[0].bulk.storage.is_external());
}
