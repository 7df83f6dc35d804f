use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use memtex::config::GameConfig;
use memtex::engine::{self, InstallOptions};
use memtex::md5::{verify_game, Md5Status, Md5Table};
use memtex::mem::{self, MemArchive};
use memtex::texture::{is_texture_class, Texture};
use memtex::{marker, GameContext, GameKind, Package};
use std::path::{Path, PathBuf};

fn is_debug_mode() -> bool {
    GameConfig::debug_mode()
}

/// `--game <1|2|3>` on the command line, else `MEMTEX_GAME`.
fn game_kind(args: &[String]) -> Result<GameKind> {
    let value = args
        .iter()
        .position(|a| a == "--game")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| std::env::var("MEMTEX_GAME").ok())
        .ok_or_else(|| anyhow!("No game selected. Pass --game <1|2|3> or set MEMTEX_GAME."))?;
    GameKind::from_name(&value).ok_or_else(|| anyhow!("Unknown game '{}'", value))
}

fn game_context(args: &[String]) -> Result<GameContext> {
    let game = game_kind(args)?;
    let config = GameConfig::from_env(game)
        .ok_or_else(|| anyhow!("MEMTEX_GAME_ROOT is not set; point it at the {} install", game))?;
    if !config.root.is_dir() {
        return Err(anyhow!("Game root {:?} is not a directory", config.root));
    }
    Ok(GameContext::new(config))
}

/// Positional arguments after the command, flags and their values removed.
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for a in args.iter().skip(2) {
        if skip {
            skip = false;
            continue;
        }
        if a == "--game" {
            skip = true;
            continue;
        }
        if a.starts_with("--") {
            continue;
        }
        out.push(a.as_str());
    }
    out
}

fn log_progress(percent: u32, stage: &str) {
    info!("[{:>3}%] {}", percent, stage);
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let debug = is_debug_mode();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("--help");
    let wants_help = args.iter().skip(2).any(|a| a == "--help");
    let rest = positional(&args);

    match cmd {
        "install" => {
            if wants_help {
                println!("Usage: memtex install [--game N] [--verify] [--serial] [--repack] <mem file or folder>...");
                println!("\nApplies MEM texture mods to the game at MEMTEX_GAME_ROOT.");
                println!("\nExample:");
                println!("  memtex install --game 3 ./mods");
                return Ok(());
            }
            if rest.is_empty() {
                return Err(anyhow!("Usage: memtex install <mem file or folder>...\nTry 'memtex install --help' for more information."));
            }
            let options = InstallOptions {
                verify: args.iter().any(|a| a == "--verify"),
                parallel: !args.iter().any(|a| a == "--serial"),
                repack_sfar: args.iter().any(|a| a == "--repack"),
            };
            run_install(&args, &rest, &options)?;
        }
        "scan" => {
            if wants_help {
                println!("Usage: memtex scan [--game N]");
                println!("\nRebuilds the texture map of the install and its cache.");
                return Ok(());
            }
            run_scan(&args)?;
        }
        "unpack-dlc" => {
            if wants_help {
                println!("Usage: memtex unpack-dlc");
                println!("\nUnpacks every packed ME3 DLC archive in place.");
                return Ok(());
            }
            run_unpack_dlc(&args)?;
        }
        "extract-mem" => {
            if wants_help {
                println!("Usage: memtex extract-mem <mem file> <output folder>");
                println!("\nWrites every entry of a MEM file as <name>_0x<CRC>.dds or .bik.");
                return Ok(());
            }
            if rest.len() < 2 {
                return Err(anyhow!("Usage: memtex extract-mem <mem file> <output folder>"));
            }
            let mut archive = MemArchive::open(rest[0]).with_context(|| format!("Failed to open {}", rest[0]))?;
            let written = archive.extract_all(Path::new(rest[1]))?;
            info!("Extracted {} files to {}", written.len(), rest[1]);
        }
        "create-mem" => {
            if wants_help {
                println!("Usage: memtex create-mem --game N <input folder> <output.mem>");
                println!("\nPacks DDS/PNG/TGA/BMP/BIK files named *_0x<CRC>.* into a MEM file.");
                return Ok(());
            }
            if rest.len() < 2 {
                return Err(anyhow!("Usage: memtex create-mem --game N <input folder> <output.mem>"));
            }
            let game = game_kind(&args)?;
            let count = mem::create_from_dir(Path::new(rest[0]), Path::new(rest[1]), game)
                .context("Failed to create MEM file")?;
            info!("Wrote {} entries to {}", count, rest[1]);
        }
        "extract-texture" => {
            if wants_help {
                println!("Usage: memtex extract-texture [--game N] <crc> <output file>");
                println!("\nWrites the game texture with the given checksum as DDS.");
                return Ok(());
            }
            if rest.len() < 2 {
                return Err(anyhow!("Usage: memtex extract-texture <crc> <output file>"));
            }
            let crc = u32::from_str_radix(rest[0].trim_start_matches("0x").trim_start_matches("0X"), 16)
                .with_context(|| format!("'{}' is not a hex checksum", rest[0]))?;
            run_extract_texture(&args, crc, Path::new(rest[1]))?;
        }
        "detect" => {
            if wants_help {
                println!("Usage: memtex detect [--game N]");
                println!("\nReports whether the install carries an install marker.");
                return Ok(());
            }
            let ctx = game_context(&args)?;
            match marker::read_marker(&ctx.config)? {
                Some(m) => {
                    println!("Marker found (format {}, tool {})", m.version, m.tool_version);
                    for name in &m.mods {
                        println!("  {}", name);
                    }
                }
                None => println!("No install marker: the game has not been modded by memtex."),
            }
        }
        "verify" => {
            if wants_help {
                println!("Usage: memtex verify [--game N] <md5 table>");
                println!("\nHashes the game files listed in a reference table and reports the ones that differ.");
                return Ok(());
            }
            if rest.is_empty() {
                return Err(anyhow!("Usage: memtex verify <md5 table>"));
            }
            run_verify(&args, Path::new(rest[0]))?;
        }
        "diagnostics" if debug => {
            if wants_help {
                println!("Usage: memtex diagnostics <package>");
                println!("\nDumps package header, tables and texture exports.");
                return Ok(());
            }
            if rest.is_empty() {
                return Err(anyhow!("Usage: memtex diagnostics <package>"));
            }
            run_diagnostics(Path::new(rest[0]))?;
        }
        "--help" | "-h" | "help" => {
            println!("memtex: texture mod installer for the Mass Effect trilogy");
            println!("\nUsage: memtex <command> [args]");
            println!("\nAvailable commands:");
            println!("  install          Apply MEM files to the game");
            println!("  scan             Rebuild the texture map");
            println!("  unpack-dlc       Unpack ME3 DLC archives");
            println!("  extract-mem      Dump the contents of a MEM file");
            println!("  create-mem       Build a MEM file from loose images");
            println!("  extract-texture  Write one game texture as DDS");
            println!("  detect           Show the install marker");
            println!("  verify           Check game files against an MD5 table");
            if debug {
                println!("  diagnostics      Dump package metadata (Debug)");
            }
            println!("\nThe game root is read from MEMTEX_GAME_ROOT.");
            println!("Run 'memtex <command> --help' for more information on a specific command.");
        }
        _ => {
            println!("Unknown command: {}", cmd);
            println!("Run 'memtex --help' for usage information.");
        }
    }
    Ok(())
}

fn collect_archives(inputs: &[&str]) -> Vec<PathBuf> {
    let mut archives = Vec::new();
    for input in inputs {
        let path = PathBuf::from(input);
        if path.is_dir() {
            archives.extend(engine::find_mem_archives(&path));
        } else {
            archives.push(path);
        }
    }
    archives
}

fn run_install(args: &[String], inputs: &[&str], options: &InstallOptions) -> Result<()> {
    let mut ctx = game_context(args)?;
    let archives = collect_archives(inputs);
    if archives.is_empty() {
        warn!("No MEM files found.");
        return Ok(());
    }
    info!("Installing {} MEM files into {:?}", archives.len(), ctx.config.root);

    let mut progress = log_progress;
    let report = engine::install(&mut ctx, &archives, options, &mut progress).context("Install aborted")?;

    for notice in &report.notices {
        println!("{}", notice);
    }
    for (what, e) in &report.failures {
        println!("FAILED {}: {}", what, e);
    }
    println!(
        "\n{} archives applied, {} skipped, {} locations patched in {} packages, {} failures.",
        report.applied_archives.len(),
        report.skipped_archives.len(),
        report.patched,
        report.rewritten.len(),
        report.failures.len()
    );
    Ok(())
}

fn run_scan(args: &[String]) -> Result<()> {
    let mut ctx = game_context(args)?;
    let mut report = engine::InstallReport::default();
    engine::unpack_dlcs(&mut ctx, &mut report);
    let mut progress = log_progress;
    let scan = engine::scan(&mut ctx, &mut progress).context("Failed to save the texture map")?;
    for (what, e) in &scan.failures {
        println!("FAILED {}: {}", what, e);
    }
    if !marker::detect(&ctx.config)? {
        for p in &scan.marked_packages {
            println!("{} was modified by an earlier install", p);
        }
    }
    println!(
        "{} textures indexed, {} unique.",
        scan.textures,
        ctx.map.as_ref().map_or(0, |m| m.len())
    );
    Ok(())
}

fn run_unpack_dlc(args: &[String]) -> Result<()> {
    let mut ctx = game_context(args)?;
    if ctx.game() != GameKind::Me3 {
        println!("Only ME3 DLC is packed; nothing to do.");
        return Ok(());
    }
    let mut report = engine::InstallReport::default();
    let unpacked = engine::unpack_dlcs(&mut ctx, &mut report);
    memtex::toc::update_tocs(&ctx.config)?;
    for (what, e) in &report.failures {
        println!("FAILED {}: {}", what, e);
    }
    println!("Unpacked {} DLC folders.", unpacked.len());
    Ok(())
}

fn run_extract_texture(args: &[String], crc: u32, out: &Path) -> Result<()> {
    let mut ctx = game_context(args)?;
    let cache = ctx.config.map_cache_path();
    match memtex::texmap::load_cache(&cache, ctx.game()) {
        Ok(map) => ctx.map = Some(map),
        Err(e) => {
            warn!("Texture map cache unusable ({}); scanning", e);
            let mut progress = log_progress;
            engine::scan(&mut ctx, &mut progress)?;
        }
    }
    engine::extract_texture(&ctx, crc, out)?;
    Ok(())
}

fn run_verify(args: &[String], table: &Path) -> Result<()> {
    let ctx = game_context(args)?;
    let table = Md5Table::load(table).with_context(|| format!("Failed to load {}", table.display()))?;
    let mut progress = log_progress;
    let mismatches = verify_game(&ctx.config, &table, &mut progress);
    for m in &mismatches {
        match (&m.status, &m.error) {
            (_, Some(e)) => println!("{}: unreadable ({})", m.path, e),
            (Md5Status::BadMod(name), None) => println!("{}: broken mod '{}'", m.path, name),
            (status, None) => println!("{}: {:?}", m.path, status),
        }
    }
    println!("{} of {} reference files differ.", mismatches.len(), table.len());
    Ok(())
}

fn run_diagnostics(path: &Path) -> Result<()> {
    info!("Running Diagnostics: {:?}", path);
    let mut pkg = Package::open(path)?;

    println!("Package: {}", path.display());
    println!("Header: {:?}", pkg.header);
    println!("Names: {}, imports: {}, exports: {}", pkg.names.len(), pkg.imports.len(), pkg.exports.len());
    println!("Compressed on disk: {}", pkg.was_compressed());
    println!("Rewrite trailer: {}", pkg.has_mem_marker());

    for index in 0..pkg.exports.len() {
        let class = pkg.class_name(index)?;
        if !is_texture_class(&class) {
            continue;
        }
        let e = &pkg.exports[index];
        println!("\nExport {}: {} ({})", index, pkg.full_path(index)?, class);
        println!("  Offset: 0x{:08X}  Size: {}", e.data_offset, e.data_size);
        match Texture::from_export(&mut pkg, index) {
            Ok(t) => {
                println!("  Format: {:?}", t.format(&pkg.names));
                for (i, mip) in t.mips.iter().enumerate() {
                    println!(
                        "  Mip {}: {}x{} {:?} ({} bytes)",
                        i, mip.width, mip.height, mip.bulk.storage, mip.bulk.uncompressed_size
                    );
                }
            }
            Err(e) => println!("  Unreadable: {}", e),
        }
    }
    Ok(())
}
