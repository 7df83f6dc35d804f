use crate::error::{Error, Result};
use crate::image::{Image, ImageMip, PixelFormat};
use binrw::{binrw, BinReaderExt, BinWriterExt};
use std::io::{Cursor, Read};

const DDSD_CAPS: u32 = 0x1;
const DDSD_HEIGHT: u32 = 0x2;
const DDSD_WIDTH: u32 = 0x4;
const DDSD_PIXELFORMAT: u32 = 0x1000;
const DDSD_MIPMAPCOUNT: u32 = 0x20000;
const DDSD_LINEARSIZE: u32 = 0x80000;
const DDSD_PITCH: u32 = 0x8;

const DDPF_ALPHAPIXELS: u32 = 0x1;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x20000;
const DDPF_BUMPDUDV: u32 = 0x80000;

const DDSCAPS_COMPLEX: u32 = 0x8;
const DDSCAPS_TEXTURE: u32 = 0x1000;
const DDSCAPS_MIPMAP: u32 = 0x400000;

const DXGI_BC7_UNORM: u32 = 98;
const DXGI_BC7_UNORM_SRGB: u32 = 99;

const fn fourcc(s: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*s)
}

#[binrw]
#[derive(Debug, Clone, Default)]
#[brw(little)]
pub struct DdsPixelFormat {
    pub size: u32,
    pub flags: u32,
    pub four_cc: u32,
    pub rgb_bit_count: u32,
    pub r_mask: u32,
    pub g_mask: u32,
    pub b_mask: u32,
    pub a_mask: u32,
}

#[binrw]
#[derive(Debug, Clone, Default)]
#[brw(little, magic = b"DDS ")]
pub struct DdsHeader {
    pub size: u32,
    pub flags: u32,
    pub height: u32,
    pub width: u32,
    pub pitch_or_linear_size: u32,
    pub depth: u32,
    pub mip_map_count: u32,
    pub reserved1: [u32; 11],
    pub pixel_format: DdsPixelFormat,
    pub caps: u32,
    pub caps2: u32,
    pub caps3: u32,
    pub caps4: u32,
    pub reserved2: u32,
}

#[binrw]
#[derive(Debug, Clone, Default)]
#[brw(little)]
pub struct DdsHeaderDx10 {
    pub dxgi_format: u32,
    pub resource_dimension: u32,
    pub misc_flag: u32,
    pub array_size: u32,
    pub misc_flags2: u32,
}

fn format_of(header: &DdsHeader, dx10: Option<&DdsHeaderDx10>) -> Result<PixelFormat> {
    let pf = &header.pixel_format;
    if pf.flags & DDPF_FOURCC != 0 {
        return match &pf.four_cc.to_le_bytes() {
            b"DXT1" => Ok(PixelFormat::Dxt1),
            b"DXT3" => Ok(PixelFormat::Dxt3),
            b"DXT5" => Ok(PixelFormat::Dxt5),
            b"ATI2" | b"BC5U" => Ok(PixelFormat::Ati2),
            b"DX10" => match dx10.map(|d| d.dxgi_format) {
                Some(DXGI_BC7_UNORM) | Some(DXGI_BC7_UNORM_SRGB) => Ok(PixelFormat::Bc7),
                other => Err(Error::parse(format!("unsupported DXGI format {:?}", other))),
            },
            other => Err(Error::parse(format!(
                "unsupported DDS FourCC {:?}",
                String::from_utf8_lossy(other)
            ))),
        };
    }
    if pf.flags & DDPF_BUMPDUDV != 0 && pf.rgb_bit_count == 16 {
        return Ok(PixelFormat::V8U8);
    }
    if pf.flags & DDPF_LUMINANCE != 0 && pf.rgb_bit_count == 8 {
        return Ok(PixelFormat::G8);
    }
    if pf.flags & DDPF_RGB != 0 {
        return match pf.rgb_bit_count {
            32 => Ok(PixelFormat::Argb),
            24 => Ok(PixelFormat::Rgb),
            n => Err(Error::parse(format!("unsupported {}-bit RGB DDS", n))),
        };
    }
    Err(Error::parse(format!(
        "unsupported DDS pixel format flags 0x{:X}",
        pf.flags
    )))
}

fn pixel_format_for(format: PixelFormat) -> (DdsPixelFormat, Option<DdsHeaderDx10>) {
    let mut pf = DdsPixelFormat {
        size: 32,
        ..Default::default()
    };
    let mut dx10 = None;
    match format {
        PixelFormat::Dxt1 | PixelFormat::Dxt3 | PixelFormat::Dxt5 | PixelFormat::Ati2 => {
            pf.flags = DDPF_FOURCC;
            pf.four_cc = match format {
                PixelFormat::Dxt1 => fourcc(b"DXT1"),
                PixelFormat::Dxt3 => fourcc(b"DXT3"),
                PixelFormat::Dxt5 => fourcc(b"DXT5"),
                _ => fourcc(b"ATI2"),
            };
        }
        PixelFormat::Bc7 => {
            pf.flags = DDPF_FOURCC;
            pf.four_cc = fourcc(b"DX10");
            dx10 = Some(DdsHeaderDx10 {
                dxgi_format: DXGI_BC7_UNORM,
                resource_dimension: 3,
                misc_flag: 0,
                array_size: 1,
                misc_flags2: 0,
            });
        }
        PixelFormat::Argb => {
            pf.flags = DDPF_RGB | DDPF_ALPHAPIXELS;
            pf.rgb_bit_count = 32;
            pf.r_mask = 0x00FF_0000;
            pf.g_mask = 0x0000_FF00;
            pf.b_mask = 0x0000_00FF;
            pf.a_mask = 0xFF00_0000;
        }
        PixelFormat::Rgb => {
            pf.flags = DDPF_RGB;
            pf.rgb_bit_count = 24;
            pf.r_mask = 0x00FF_0000;
            pf.g_mask = 0x0000_FF00;
            pf.b_mask = 0x0000_00FF;
        }
        PixelFormat::G8 => {
            pf.flags = DDPF_LUMINANCE;
            pf.rgb_bit_count = 8;
            pf.r_mask = 0xFF;
        }
        PixelFormat::V8U8 => {
            pf.flags = DDPF_BUMPDUDV;
            pf.rgb_bit_count = 16;
            pf.r_mask = 0x00FF;
            pf.g_mask = 0xFF00;
        }
    }
    (pf, dx10)
}

/// Parses a DDS file image into its mip levels.
pub fn read_dds(data: &[u8]) -> Result<Image> {
    let mut cursor = Cursor::new(data);
    let header: DdsHeader = cursor.read_le()?;
    let dx10 = if header.pixel_format.flags & DDPF_FOURCC != 0
        && header.pixel_format.four_cc == fourcc(b"DX10")
    {
        Some(cursor.read_le::<DdsHeaderDx10>()?)
    } else {
        None
    };
    let format = format_of(&header, dx10.as_ref())?;

    let count = header.mip_map_count.max(1);
    let (mut w, mut h) = (header.width.max(1), header.height.max(1));
    let mut mips = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let size = format.mip_byte_size(w, h);
        let mut buf = vec![0u8; size];
        if cursor.read_exact(&mut buf).is_err() {
            if mips.is_empty() {
                return Err(Error::TruncatedIo {
                    wanted: size as u64,
                    available: data.len() as u64 - cursor.position().min(data.len() as u64),
                });
            }
            // some tools stop writing before the 1x1 level
            break;
        }
        mips.push(ImageMip {
            width: w,
            height: h,
            data: buf,
        });
        if w == 1 && h == 1 {
            break;
        }
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }

    Ok(Image { format, mips })
}

/// Serialises an image as a DDS file.
pub fn write_dds(image: &Image) -> Result<Vec<u8>> {
    let top = image
        .mips
        .first()
        .ok_or_else(|| Error::parse("image has no mip levels"))?;
    let (pixel_format, dx10) = pixel_format_for(image.format);

    let mut flags = DDSD_CAPS | DDSD_HEIGHT | DDSD_WIDTH | DDSD_PIXELFORMAT;
    let mut caps = DDSCAPS_TEXTURE;
    let pitch = if image.format.is_block_compressed() {
        flags |= DDSD_LINEARSIZE;
        top.data.len() as u32
    } else {
        flags |= DDSD_PITCH;
        top.width * image.format.bytes_per_pixel() as u32
    };
    if image.mips.len() > 1 {
        flags |= DDSD_MIPMAPCOUNT;
        caps |= DDSCAPS_COMPLEX | DDSCAPS_MIPMAP;
    }

    let header = DdsHeader {
        size: 124,
        flags,
        height: top.height,
        width: top.width,
        pitch_or_linear_size: pitch,
        depth: 0,
        mip_map_count: image.mips.len() as u32,
        pixel_format,
        caps,
        ..Default::default()
    };

    let mut cursor = Cursor::new(Vec::new());
    cursor.write_le(&header)?;
    if let Some(dx10) = &dx10 {
        cursor.write_le(dx10)?;
    }
    let mut out = cursor.into_inner();
    for mip in &image.mips {
        out.extend_from_slice(&mip.data);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dds_round_trip_keeps_mips() {
        let image = Image {
            format: PixelFormat::Dxt1,
            mips: vec![
                ImageMip { width: 8, height: 8, data: vec![1; 32] },
                ImageMip { width: 4, height: 4, data: vec![2; 8] },
                ImageMip { width: 2, height: 2, data: vec![3; 8] },
                ImageMip { width: 1, height: 1, data: vec![4; 8] },
            ],
        };
        let bytes = write_dds(&image).unwrap();
        assert_eq!(&bytes[..4], b"DDS ");
        assert_eq!(read_dds(&bytes).unwrap(), image);
    }
}
