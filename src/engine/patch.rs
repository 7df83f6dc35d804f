use crate::config::GameContext;
use crate::crc::crc32;
use crate::error::{Error, Result};
use crate::image::{downscale_rgba, mip_chain_dims, pad_rgba, Image, ImageMip, PixelFormat};
use crate::package::Package;
use crate::texmap::TextureLocation;
use crate::texture::{Texture, TextureMovie};
use log::debug;

/// Decoded replacement payload, shared by every location it targets.
pub(crate) enum Replacement {
    Texture { image: Image, converted: bool },
    Movie(Vec<u8>),
}

pub(crate) struct ModEntry {
    pub archive: String,
    pub name: String,
    pub crc: u32,
    pub replacement: Replacement,
    pub locations: Vec<TextureLocation>,
}

pub(crate) struct PatchedExport {
    pub export: u32,
    pub expected_crc: u32,
    pub movie: bool,
}

pub(crate) struct PackageOutcome {
    pub rel: String,
    pub saved: bool,
    pub patched: Vec<PatchedExport>,
    pub failures: Vec<(String, Error)>,
}

/// Mip chain in `target` format for a replacement image. Levels already
/// present in the right format and size are reused; the rest are rebuilt
/// from the top level through the pixel codec.
pub(crate) fn build_mips(ctx: &GameContext, image: &Image, target: PixelFormat, full_chain: bool) -> Result<Vec<ImageMip>> {
    let top = image
        .mips
        .first()
        .ok_or_else(|| Error::parse("replacement image has no mip levels"))?;
    let mut dims = mip_chain_dims(target, top.width, top.height);
    if !full_chain {
        dims.truncate(1);
    }

    let reusable = |n: usize, w: u32, h: u32| {
        image
            .mips
            .get(n)
            .filter(|m| image.format == target && m.width == w && m.height == h)
    };
    if dims.iter().enumerate().all(|(n, &(w, h))| reusable(n, w, h).is_some()) {
        return Ok(image.mips[..dims.len()].to_vec());
    }

    let mut rgba = ctx.pixels.decode(image.format, top.width, top.height, &top.data)?;
    let (mut w, mut h) = (top.width, top.height);
    let mut out = Vec::with_capacity(dims.len());
    for (n, &(rw, rh)) in dims.iter().enumerate() {
        if n > 0 {
            let (next, nw, nh) = downscale_rgba(&rgba, w, h)?;
            rgba = next;
            w = nw;
            h = nh;
        }
        if let Some(m) = reusable(n, rw, rh) {
            out.push(m.clone());
            continue;
        }
        // block formats record at least 4x4; pad the real level up to that
        let level = pad_rgba(&rgba, w, h, rw, rh)?;
        let data = ctx.pixels.encode(target, rw, rh, &level)?;
        out.push(ImageMip {
            width: rw,
            height: rh,
            data,
        });
    }
    Ok(out)
}

fn patch_texture(
    ctx: &GameContext,
    package: &mut Package,
    export: usize,
    image: &Image,
    converted: bool,
) -> Result<u32> {
    let mut texture = Texture::from_export(package, export)?;
    let game_format = texture
        .format(&package.names)
        .ok_or_else(|| Error::parse(format!("{}: unknown pixel format", texture.name)))?;
    let target = if converted { image.format } else { game_format };
    let (ow, oh) = texture
        .top_mipmap()
        .map(|m| (m.width as u64, m.height as u64))
        .ok_or_else(|| Error::parse(format!("{}: texture has no populated mips", texture.name)))?;
    let (nw, nh) = (image.width() as u64, image.height() as u64);
    if nw * oh != nh * ow {
        return Err(Error::parse(format!(
            "{}: replacement is {}x{}, game texture is {}x{}; aspect ratios differ",
            texture.name, nw, nh, ow, oh
        )));
    }

    let full_chain = texture.mips.iter().filter(|m| !m.bulk.is_empty()).count() > 1;
    let mips = build_mips(ctx, image, target, full_chain)?;
    let expected = crc32(&mips[0].data);

    // names added here only land in the package with the export itself
    let mut names = package.names.clone();
    texture.remove_empty_mips(&mut names);
    texture.replace_mipmaps(mips, &ctx.codecs)?;
    texture.update_properties(&mut names, target, converted);
    let offset = package.exports[export].data_offset;
    package.set_export_data(export, texture.serialize(offset)?)?;
    package.names = names;
    Ok(expected)
}

fn patch_movie(package: &mut Package, export: usize, data: &[u8]) -> Result<u32> {
    let mut movie = TextureMovie::from_export(package, export)?;
    let mut names = package.names.clone();
    movie.replace(&mut names, data.to_vec());
    let offset = package.exports[export].data_offset;
    package.set_export_data(export, movie.serialize(offset)?)?;
    package.names = names;
    Ok(crc32(data))
}

/// Applies every `(mod, export)` pair to one package and saves it once.
/// Nothing outside this package is touched, so calls for different packages
/// may run concurrently.
pub(crate) fn patch_package(ctx: &GameContext, rel: &str, work: &[(usize, u32)], mods: &[ModEntry]) -> PackageOutcome {
    let mut outcome = PackageOutcome {
        rel: rel.to_string(),
        saved: false,
        patched: Vec::new(),
        failures: Vec::new(),
    };
    let path = ctx.config.absolute_path(rel);
    let mut package = match Package::open_with(&path, &ctx.codecs) {
        Ok(p) => p,
        Err(e) => {
            outcome.failures.push((rel.to_string(), e));
            return outcome;
        }
    };

    for &(m, export) in work {
        let entry = &mods[m];
        let index = export as usize;
        let result = match &entry.replacement {
            Replacement::Texture { image, converted } => {
                patch_texture(ctx, &mut package, index, image, *converted)
            }
            Replacement::Movie(data) => patch_movie(&mut package, index, data),
        };
        match result {
            Ok(expected_crc) => {
                debug!("Staged {} (0x{:08X}) into {} export {}", entry.name, entry.crc, rel, export);
                outcome.patched.push(PatchedExport {
                    export,
                    expected_crc,
                    movie: matches!(entry.replacement, Replacement::Movie(_)),
                });
            }
            Err(e) => outcome
                .failures
                .push((format!("{} from {} -> {} export {}", entry.name, entry.archive, rel, export), e)),
        }
    }

    if package.has_changes() {
        match package.save(true) {
            Ok(()) => outcome.saved = true,
            Err(e) => {
                outcome.failures.push((format!("saving {}", rel), e));
                outcome.patched.clear();
            }
        }
    }
    outcome
}

/// Re-reads patched exports and compares their top-level bytes with what
/// was written.
pub(crate) fn verify_package(ctx: &GameContext, rel: &str, patched: &[PatchedExport]) -> Vec<(String, Error)> {
    let path = ctx.config.absolute_path(rel);
    let mut package = match Package::open_with(&path, &ctx.codecs) {
        Ok(p) => p,
        Err(e) => return vec![(rel.to_string(), e)],
    };
    let mut failures = Vec::new();
    for p in patched {
        let index = p.export as usize;
        let found = if p.movie {
            TextureMovie::from_export(&mut package, index).and_then(|m| m.data(ctx, &path))
        } else {
            Texture::from_export(&mut package, index).and_then(|t| t.top_mip_data(ctx, &path))
        };
        let what = format!("verify {} export {}", rel, p.export);
        match found.map(|d| crc32(&d)) {
            Ok(crc) if crc == p.expected_crc => {}
            Ok(crc) => failures.push((
                what,
                Error::corrupt(format!("checksum 0x{:08X}, expected 0x{:08X}", crc, p.expected_crc)),
            )),
            Err(e) => failures.push((what, e)),
        }
    }
    failures
}
