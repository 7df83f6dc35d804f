//! Call-through adapters for the block compressors and the engine's
//! compressed-chunk container.

use crate::error::{Error, Result};
use crate::stream::{BinaryStream, MemoryStream};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// Tag shared by package headers and compressed chunks.
pub const PACKAGE_TAG: u32 = 0x9E2A_83C1;

/// Uncompressed bytes per block inside a chunk.
pub const MAX_BLOCK_SIZE: usize = 0x20000;

/// Largest block size accepted when reading a chunk header.
const BLOCK_SIZE_LIMIT: u32 = 0x100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Zlib,
    Lzo,
    Oodle,
    Lzma,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Zlib => "zlib",
            Codec::Lzo => "lzo",
            Codec::Oodle => "oodle",
            Codec::Lzma => "lzma",
        };
        f.write_str(name)
    }
}

/// External block compressor (LZO, Oodle) supplied by the host application.
pub trait BlockCodec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// The set of compressors available to one run.
#[derive(Clone, Default)]
pub struct Codecs {
    pub lzo: Option<Arc<dyn BlockCodec>>,
    pub oodle: Option<Arc<dyn BlockCodec>>,
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs")
            .field("lzo", &self.lzo.is_some())
            .field("oodle", &self.oodle.is_some())
            .finish()
    }
}

impl Codecs {
    fn external(&self, codec: Codec) -> Result<&Arc<dyn BlockCodec>> {
        let slot = match codec {
            Codec::Lzo => self.lzo.as_ref(),
            Codec::Oodle => self.oodle.as_ref(),
            _ => None,
        };
        slot.ok_or_else(|| Error::codec(format!("no {} codec available", codec)))
    }

    pub fn compress(&self, codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
        match codec {
            Codec::Zlib => zlib_compress(data),
            Codec::Lzma => lzma_compress(data),
            Codec::Lzo | Codec::Oodle => self.external(codec)?.compress(data),
        }
    }

    pub fn decompress(&self, codec: Codec, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let out = match codec {
            Codec::Zlib => zlib_decompress(data, uncompressed_size)?,
            Codec::Lzma => lzma_decompress(data, uncompressed_size)?,
            Codec::Lzo | Codec::Oodle => self.external(codec)?.decompress(data, uncompressed_size)?,
        };
        if out.len() != uncompressed_size {
            return Err(Error::codec(format!(
                "{} block inflated to {} bytes, expected {}",
                codec,
                out.len(),
                uncompressed_size
            )));
        }
        Ok(out)
    }
}

pub fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::codec(format!("zlib: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::codec(format!("zlib: {}", e)))
}

pub fn zlib_decompress(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::codec(format!("zlib: {}", e)))?;
    Ok(out)
}

/// LZMA "props + stream" layout: the 5-byte property header followed directly by
/// the compressed stream, with the 8-byte size field of the .lzma format removed.
pub fn lzma_decompress(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    if data.len() < 5 {
        return Err(Error::codec("LZMA data too small to contain header"));
    }
    let mut header = Vec::with_capacity(13);
    header.extend_from_slice(&data[..5]);
    header.extend_from_slice(&(uncompressed_size as u64).to_le_bytes());
    let reader = Cursor::new(header).chain(Cursor::new(&data[5..]));
    let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
        .map_err(|e| Error::codec(format!("lzma decoder: {}", e)))?;
    let mut decoder = xz2::read::XzDecoder::new_stream(reader, stream);
    let mut out = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::codec(format!("lzma: {}", e)))?;
    out.truncate(uncompressed_size);
    Ok(out)
}

pub fn lzma_compress(data: &[u8]) -> Result<Vec<u8>> {
    let options = xz2::stream::LzmaOptions::new_preset(6)
        .map_err(|e| Error::codec(format!("lzma options: {}", e)))?;
    let stream = xz2::stream::Stream::new_lzma_encoder(&options)
        .map_err(|e| Error::codec(format!("lzma encoder: {}", e)))?;
    let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    encoder
        .write_all(data)
        .map_err(|e| Error::codec(format!("lzma: {}", e)))?;
    let encoded = encoder
        .finish()
        .map_err(|e| Error::codec(format!("lzma: {}", e)))?;
    if encoded.len() < 13 {
        return Err(Error::codec("LZMA output too small"));
    }
    let mut out = Vec::with_capacity(encoded.len() - 8);
    out.extend_from_slice(&encoded[..5]);
    out.extend_from_slice(&encoded[13..]);
    Ok(out)
}

/// Header of one compressed chunk, as found in compressed packages and in
/// compressed mipmap storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub block_size: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// (compressed, uncompressed) per block.
    pub blocks: Vec<(u32, u32)>,
}

impl ChunkHeader {
    pub fn read(stream: &mut dyn BinaryStream) -> Result<Self> {
        let tag = stream.read_u32()?;
        if tag != PACKAGE_TAG {
            return Err(Error::corrupt(format!("bad chunk tag 0x{:08X}", tag)));
        }
        let mut block_size = stream.read_u32()?;
        if block_size == PACKAGE_TAG {
            block_size = MAX_BLOCK_SIZE as u32;
        }
        let compressed_size = stream.read_u32()?;
        let uncompressed_size = stream.read_u32()?;
        if block_size == 0 || block_size > BLOCK_SIZE_LIMIT {
            return Err(Error::corrupt(format!("chunk block size {}", block_size)));
        }
        let count = (uncompressed_size as u64).div_ceil(block_size as u64);
        let remaining = stream.length()?.saturating_sub(stream.position()?);
        if count * 8 > remaining {
            return Err(Error::corrupt(format!(
                "chunk claims {} blocks with {} bytes left",
                count, remaining
            )));
        }
        let mut blocks = Vec::with_capacity(count as usize);
        let mut total = 0u64;
        for _ in 0..count {
            let c = stream.read_u32()?;
            let u = stream.read_u32()?;
            if u > block_size {
                return Err(Error::corrupt(format!("chunk block of {} bytes exceeds block size {}", u, block_size)));
            }
            total += u as u64;
            blocks.push((c, u));
        }
        if total != uncompressed_size as u64 {
            return Err(Error::corrupt(format!(
                "chunk blocks sum to {} bytes, header says {}",
                total, uncompressed_size
            )));
        }
        Ok(Self {
            block_size,
            compressed_size,
            uncompressed_size,
            blocks,
        })
    }

    pub fn write(&self, stream: &mut dyn BinaryStream) -> Result<()> {
        stream.write_u32(PACKAGE_TAG)?;
        stream.write_u32(self.block_size)?;
        stream.write_u32(self.compressed_size)?;
        stream.write_u32(self.uncompressed_size)?;
        for &(c, u) in &self.blocks {
            stream.write_u32(c)?;
            stream.write_u32(u)?;
        }
        Ok(())
    }

    pub fn byte_len(&self) -> usize {
        16 + self.blocks.len() * 8
    }
}

/// Reads one chunk from the stream's current position and inflates it.
pub fn decompress_chunk(codecs: &Codecs, codec: Codec, stream: &mut dyn BinaryStream) -> Result<Vec<u8>> {
    let header = ChunkHeader::read(stream)?;
    let mut payloads = Vec::with_capacity(header.blocks.len());
    for &(c, _) in &header.blocks {
        payloads.push(stream.read_bytes(c as usize)?);
    }
    let mut out = Vec::new();
    for (payload, &(_, u)) in payloads.iter().zip(&header.blocks) {
        out.extend_from_slice(&codecs.decompress(codec, payload, u as usize)?);
    }
    if out.len() != header.uncompressed_size as usize {
        return Err(Error::corrupt(format!(
            "chunk inflated to {} bytes, header says {}",
            out.len(),
            header.uncompressed_size
        )));
    }
    Ok(out)
}

/// Inflates a whole chunk held in memory.
pub fn decompress_chunk_bytes(codecs: &Codecs, codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    let mut stream = MemoryStream::from_vec(data.to_vec());
    decompress_chunk(codecs, codec, &mut stream)
}

/// Compresses `data` into a single chunk; blocks are compressed in parallel.
pub fn compress_chunk(codecs: &Codecs, codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    let compressed: Vec<Vec<u8>> = data
        .par_chunks(MAX_BLOCK_SIZE)
        .map(|block| codecs.compress(codec, block))
        .collect::<Result<_>>()?;

    let blocks: Vec<(u32, u32)> = compressed
        .iter()
        .zip(data.chunks(MAX_BLOCK_SIZE))
        .map(|(c, u)| (c.len() as u32, u.len() as u32))
        .collect();
    let header = ChunkHeader {
        block_size: MAX_BLOCK_SIZE as u32,
        compressed_size: blocks.iter().map(|b| b.0).sum(),
        uncompressed_size: data.len() as u32,
        blocks,
    };

    let mut out = MemoryStream::with_capacity(header.byte_len() + header.compressed_size as usize);
    header.write(&mut out)?;
    for c in &compressed {
        out.write_bytes(c)?;
    }
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_chunk_round_trip() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 7) as u8).collect();
        let codecs = Codecs::default();
        let chunk = compress_chunk(&codecs, Codec::Zlib, &data).unwrap();
        let back = decompress_chunk_bytes(&codecs, Codec::Zlib, &chunk).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn chunk_header_with_impossible_block_count_is_corrupt() {
        let mut raw = Vec::new();
        for v in [PACKAGE_TAG, 1, 16, u32::MAX] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw.extend_from_slice(&[0u8; 16]);
        let codecs = Codecs::default();
        assert!(matches!(
            decompress_chunk_bytes(&codecs, Codec::Zlib, &raw),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn chunk_blocks_must_add_up() {
        let data = vec![9u8; 1000];
        let codecs = Codecs::default();
        let mut chunk = compress_chunk(&codecs, Codec::Zlib, &data).unwrap();
        // uncompressed size in the header no longer matches the one block
        chunk[12..16].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            decompress_chunk_bytes(&codecs, Codec::Zlib, &chunk),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn missing_external_codec_is_codec_failure() {
        let codecs = Codecs::default();
        assert!(matches!(
            codecs.decompress(Codec::Lzo, &[1, 2, 3], 10),
            Err(Error::Codec(_))
        ));
    }
}
