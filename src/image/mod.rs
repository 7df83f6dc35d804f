//! Pixel formats, mip-chain geometry and the narrow pixel-codec contract.
//!
//! Block-compressed encoders and decoders (DXT, ATI2, BC7) live outside this
//! crate; they are reached through [`PixelCodec`]. Only the plain formats are
//! converted here.

pub mod dds;

use crate::error::{Error, Result};
use ::image::imageops::{self, FilterType};
use ::image::RgbaImage;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormat {
    Dxt1,
    Dxt3,
    Dxt5,
    Ati2,
    Bc7,
    Argb,
    Rgb,
    G8,
    V8U8,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Dxt1,
        PixelFormat::Dxt3,
        PixelFormat::Dxt5,
        PixelFormat::Ati2,
        PixelFormat::Bc7,
        PixelFormat::Argb,
        PixelFormat::Rgb,
        PixelFormat::G8,
        PixelFormat::V8U8,
    ];

    /// Name of the `EPixelFormat` enum value stored in the `Format` property.
    pub fn engine_name(self) -> Option<&'static str> {
        match self {
            PixelFormat::Dxt1 => Some("PF_DXT1"),
            PixelFormat::Dxt3 => Some("PF_DXT3"),
            PixelFormat::Dxt5 => Some("PF_DXT5"),
            PixelFormat::Ati2 => Some("PF_NormalMap_HQ"),
            PixelFormat::Bc7 => Some("PF_BC7"),
            PixelFormat::Argb => Some("PF_A8R8G8B8"),
            PixelFormat::G8 => Some("PF_G8"),
            PixelFormat::V8U8 => Some("PF_V8U8"),
            PixelFormat::Rgb => None,
        }
    }

    pub fn from_engine_name(name: &str) -> Option<Self> {
        match name {
            "PF_DXT1" => Some(PixelFormat::Dxt1),
            "PF_DXT3" => Some(PixelFormat::Dxt3),
            "PF_DXT5" => Some(PixelFormat::Dxt5),
            "PF_NormalMap_HQ" | "PF_BC5" | "PF_ATI2" => Some(PixelFormat::Ati2),
            "PF_BC7" => Some(PixelFormat::Bc7),
            "PF_A8R8G8B8" => Some(PixelFormat::Argb),
            "PF_G8" => Some(PixelFormat::G8),
            "PF_V8U8" => Some(PixelFormat::V8U8),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        PixelFormat::ALL.iter().position(|&f| f == self).unwrap_or(0) as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        PixelFormat::ALL.get(v as usize).copied()
    }

    pub fn is_block_compressed(self) -> bool {
        self.block_bytes().is_some()
    }

    /// Bytes per 4x4 block for block-compressed formats.
    pub fn block_bytes(self) -> Option<usize> {
        match self {
            PixelFormat::Dxt1 => Some(8),
            PixelFormat::Dxt3 | PixelFormat::Dxt5 | PixelFormat::Ati2 | PixelFormat::Bc7 => Some(16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Argb => 4,
            PixelFormat::Rgb => 3,
            PixelFormat::V8U8 => 2,
            PixelFormat::G8 => 1,
            _ => 0,
        }
    }

    /// Byte size of one mip level of the given dimensions.
    pub fn mip_byte_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width.max(1) as usize, height.max(1) as usize);
        match self.block_bytes() {
            Some(b) => w.div_ceil(4).max(1) * h.div_ceil(4).max(1) * b,
            None => w * h * self.bytes_per_pixel(),
        }
    }

    /// Smallest dimension a mip of this format is recorded with.
    pub fn min_dimension(self) -> u32 {
        if self.is_block_compressed() {
            4
        } else {
            1
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PixelFormat::Dxt1 => "DXT1",
            PixelFormat::Dxt3 => "DXT3",
            PixelFormat::Dxt5 => "DXT5",
            PixelFormat::Ati2 => "ATI2",
            PixelFormat::Bc7 => "BC7",
            PixelFormat::Argb => "ARGB",
            PixelFormat::Rgb => "RGB",
            PixelFormat::G8 => "G8",
            PixelFormat::V8U8 => "V8U8",
        };
        f.write_str(s)
    }
}

/// Recorded dimensions of a full mip chain for a top level of `width` x `height`.
///
/// Each level halves (floor, minimum 1); block formats never record a dimension
/// below 4. The number of levels follows the real, unclamped halving.
pub fn mip_chain_dims(format: PixelFormat, width: u32, height: u32) -> Vec<(u32, u32)> {
    let min = format.min_dimension();
    let (mut w, mut h) = (width.max(1), height.max(1));
    let mut dims = Vec::new();
    loop {
        dims.push((w.max(min), h.max(min)));
        if w == 1 && h == 1 {
            break;
        }
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    dims
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMip {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A decoded replacement image: one format, one or more mip levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub format: PixelFormat,
    pub mips: Vec<ImageMip>,
}

impl Image {
    pub fn width(&self) -> u32 {
        self.mips.first().map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.mips.first().map_or(0, |m| m.height)
    }

    /// Decodes a loose PNG/TGA/BMP file into a single-level ARGB image.
    pub fn from_image_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let decoded = ::image::load_from_memory(&bytes)
            .map_err(|e| Error::codec(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        let data = rgba_to_bgra(decoded.as_raw());
        Ok(Self {
            format: PixelFormat::Argb,
            mips: vec![ImageMip { width, height, data }],
        })
    }
}

/// Image codec contract: `decode` yields tightly packed RGBA8, `encode` takes it.
pub trait PixelCodec: Send + Sync {
    fn decode(&self, format: PixelFormat, width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>>;
    fn encode(&self, format: PixelFormat, width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>>;
}

/// Converts the plain formats itself and hands block formats to `block`.
#[derive(Clone, Default)]
pub struct BuiltinPixelCodec {
    pub block: Option<Arc<dyn PixelCodec>>,
}

impl fmt::Debug for BuiltinPixelCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinPixelCodec")
            .field("block", &self.block.is_some())
            .finish()
    }
}

impl BuiltinPixelCodec {
    pub fn with_block_codec(block: Arc<dyn PixelCodec>) -> Self {
        Self { block: Some(block) }
    }

    fn block(&self, format: PixelFormat) -> Result<&Arc<dyn PixelCodec>> {
        self.block
            .as_ref()
            .ok_or_else(|| Error::codec(format!("no block codec for {}", format)))
    }
}

impl PixelCodec for BuiltinPixelCodec {
    fn decode(&self, format: PixelFormat, width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
        if format.is_block_compressed() {
            return self.block(format)?.decode(format, width, height, data);
        }
        let pixels = width as usize * height as usize;
        let expected = pixels * format.bytes_per_pixel();
        if data.len() < expected {
            return Err(Error::codec(format!(
                "{} {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            )));
        }
        let mut out = Vec::with_capacity(pixels * 4);
        match format {
            PixelFormat::Argb => out.extend_from_slice(&bgra_to_rgba(&data[..expected])),
            PixelFormat::Rgb => {
                for p in data[..expected].chunks_exact(3) {
                    out.extend_from_slice(&[p[2], p[1], p[0], 255]);
                }
            }
            PixelFormat::G8 => {
                for &g in &data[..expected] {
                    out.extend_from_slice(&[g, g, g, 255]);
                }
            }
            PixelFormat::V8U8 => {
                for p in data[..expected].chunks_exact(2) {
                    let u = (p[0] as i8 as i16 + 128) as u8;
                    let v = (p[1] as i8 as i16 + 128) as u8;
                    out.extend_from_slice(&[u, v, 255, 255]);
                }
            }
            _ => unreachable!("block formats handled above"),
        }
        Ok(out)
    }

    fn encode(&self, format: PixelFormat, width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>> {
        if format.is_block_compressed() {
            return self.block(format)?.encode(format, width, height, rgba);
        }
        let pixels = width as usize * height as usize;
        if rgba.len() < pixels * 4 {
            return Err(Error::codec(format!(
                "RGBA {}x{} needs {} bytes, got {}",
                width,
                height,
                pixels * 4,
                rgba.len()
            )));
        }
        let src = &rgba[..pixels * 4];
        let out = match format {
            PixelFormat::Argb => rgba_to_bgra(src),
            PixelFormat::Rgb => src.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect(),
            PixelFormat::G8 => src
                .chunks_exact(4)
                .map(|p| ((p[0] as u32 * 77 + p[1] as u32 * 150 + p[2] as u32 * 29) >> 8) as u8)
                .collect(),
            PixelFormat::V8U8 => src
                .chunks_exact(4)
                .flat_map(|p| [(p[0] as i16 - 128) as i8 as u8, (p[1] as i16 - 128) as i8 as u8])
                .collect(),
            _ => unreachable!("block formats handled above"),
        };
        Ok(out)
    }
}

fn bgra_to_rgba(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(4)
        .flat_map(|p| [p[2], p[1], p[0], p[3]])
        .collect()
}

fn rgba_to_bgra(data: &[u8]) -> Vec<u8> {
    // the swizzle is its own inverse
    bgra_to_rgba(data)
}

fn rgba_image(rgba: &[u8], width: u32, height: u32) -> Result<RgbaImage> {
    RgbaImage::from_raw(width, height, rgba.to_vec()).ok_or_else(|| {
        Error::codec(format!(
            "RGBA {}x{} needs {} bytes, got {}",
            width,
            height,
            width as usize * height as usize * 4,
            rgba.len()
        ))
    })
}

/// Next mip level: half size (at least 1x1), triangle filtered.
pub fn downscale_rgba(rgba: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32)> {
    let source = rgba_image(rgba, width, height)?;
    let (nw, nh) = ((width / 2).max(1), (height / 2).max(1));
    let scaled = imageops::resize(&source, nw, nh, FilterType::Triangle);
    Ok((scaled.into_raw(), nw, nh))
}

/// Grows an RGBA buffer to `pw` x `ph` by repeating its edge pixels.
pub fn pad_rgba(rgba: &[u8], width: u32, height: u32, pw: u32, ph: u32) -> Result<Vec<u8>> {
    if pw == width && ph == height {
        return Ok(rgba.to_vec());
    }
    let source = rgba_image(rgba, width, height)?;
    let padded = RgbaImage::from_fn(pw, ph, |x, y| *source.get_pixel(x.min(width - 1), y.min(height - 1)));
    Ok(padded.into_raw())
}

/// True when any DXT1 block uses the 3-colour mode with a transparent index.
pub fn dxt1_has_alpha(data: &[u8]) -> bool {
    data.chunks_exact(8).any(|block| {
        let c0 = u16::from_le_bytes([block[0], block[1]]);
        let c1 = u16::from_le_bytes([block[2], block[3]]);
        if c0 > c1 {
            return false;
        }
        let bits = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        (0..16).any(|i| (bits >> (i * 2)) & 3 == 3)
    })
}
