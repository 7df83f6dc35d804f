//! Seekable binary cursors over files and growable memory buffers.
//!
//! Every accessor is little-endian and fixed-width. A read that cannot be
//! satisfied reports [`Error::TruncatedIo`]; any other device error from the
//! file-backed stream is an [`Error::IoFault`] and is never swallowed.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Spare capacity added whenever a [`MemoryStream`] has to grow.
pub const GROW_MARGIN: usize = 0x10000;

pub trait BinaryStream: Read + Write + Seek {
    fn length(&mut self) -> Result<u64>;

    fn position(&mut self) -> Result<u64> {
        Ok(self.stream_position()?)
    }

    fn jump_to(&mut self, pos: u64) -> Result<u64> {
        Ok(self.seek(SeekFrom::Start(pos))?)
    }

    fn skip(&mut self, count: i64) -> Result<u64> {
        Ok(self.seek(SeekFrom::Current(count))?)
    }

    fn read_exact_checked(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let pos = self.position().unwrap_or(0);
                let len = self.length().unwrap_or(0);
                Err(Error::TruncatedIo {
                    wanted: buf.len() as u64,
                    available: len.saturating_sub(pos),
                })
            }
            Err(e) => Err(Error::IoFault(e)),
        }
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let remaining = self.length()?.saturating_sub(self.position()?);
        if count as u64 > remaining {
            return Err(Error::TruncatedIo {
                wanted: count as u64,
                available: remaining,
            });
        }
        let mut buf = vec![0u8; count];
        self.read_exact_checked(&mut buf)?;
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact_checked(&mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact_checked(&mut b)?;
        Ok(LittleEndian::read_u16(&b))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact_checked(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact_checked(&mut b)?;
        Ok(LittleEndian::read_u64(&b))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    fn read_guid(&mut self) -> Result<[u8; 16]> {
        let mut b = [0u8; 16];
        self.read_exact_checked(&mut b)?;
        Ok(b)
    }

    fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.write_all(&[v])?)
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        Ok(self.write_all(&v.to_le_bytes())?)
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(self.write_all(&v.to_le_bytes())?)
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.write_all(&v.to_le_bytes())?)
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(self.write_all(&v.to_le_bytes())?)
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(self.write_all(&v.to_le_bytes())?)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.write_all(data)?)
    }

    fn write_zeros(&mut self, count: usize) -> Result<()> {
        Ok(self.write_all(&vec![0u8; count])?)
    }

    fn read_string_fixed_ascii(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    fn write_string_fixed_ascii(&mut self, s: &str) -> Result<()> {
        let bytes: Vec<u8> = s.chars().map(|c| c as u8).collect();
        self.write_bytes(&bytes)
    }

    fn read_null_terminated_ascii(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                return Ok(out);
            }
            out.push(b as char);
        }
    }

    fn write_null_terminated_ascii(&mut self, s: &str) -> Result<()> {
        self.write_string_fixed_ascii(s)?;
        self.write_u8(0)
    }

    fn read_null_terminated_utf16(&mut self) -> Result<String> {
        let mut units = Vec::new();
        loop {
            let u = self.read_u16()?;
            if u == 0 {
                return Ok(String::from_utf16_lossy(&units));
            }
            units.push(u);
        }
    }

    fn write_null_terminated_utf16(&mut self, s: &str) -> Result<()> {
        for u in s.encode_utf16() {
            self.write_u16(u)?;
        }
        self.write_u16(0)
    }

    /// Engine string: signed length including the terminator, negative for UTF-16.
    fn read_fstring(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len == 0 {
            return Ok(String::new());
        }
        if len < 0 {
            let count = len.unsigned_abs() as usize;
            let bytes = self.read_bytes(count * 2)?;
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .take_while(|&u| u != 0)
                .collect();
            Ok(String::from_utf16_lossy(&units))
        } else {
            let bytes = self.read_bytes(len as usize)?;
            Ok(bytes
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect())
        }
    }

    fn write_fstring(&mut self, s: &str, unicode: bool) -> Result<()> {
        if s.is_empty() {
            return self.write_i32(0);
        }
        if unicode {
            let units: Vec<u16> = s.encode_utf16().collect();
            self.write_i32(-(units.len() as i32 + 1))?;
            for u in units {
                self.write_u16(u)?;
            }
            self.write_u16(0)
        } else {
            self.write_i32(s.chars().count() as i32 + 1)?;
            self.write_null_terminated_ascii(s)
        }
    }

    /// Copies `count` bytes from the current position of `source`.
    fn copy_from(&mut self, source: &mut dyn BinaryStream, count: u64) -> Result<()> {
        let mut remaining = count;
        let mut buf = vec![0u8; 0x10000.min(count as usize).max(1)];
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            source.read_exact_checked(&mut buf[..n])?;
            self.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// File-backed stream; all device errors surface as [`Error::IoFault`].
pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { file: File::open(path)? })
    }

    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { file: File::create(path)? })
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(self.file.sync_all()?)
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BinaryStream for FileStream {
    fn length(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Growable in-memory stream. Writes past the end extend the buffer, reserving
/// [`GROW_MARGIN`] extra bytes at a time.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.pos = self.pos.min(len);
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.pos + buf.len();
        if end > self.data.capacity() {
            self.data.reserve(end - self.data.len() + GROW_MARGIN);
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => self.data.len() as i64 + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }
}

impl BinaryStream for MemoryStream {
    fn length(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}
