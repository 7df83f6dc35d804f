//! CRC32 (IEEE, reflected) checksums used for texture identity, with the
//! zlib-style combine law.

use crc32fast::Hasher;

/// Incremental hasher; `Crc32::new().update(a).update(b)` equals `crc32(a ++ b)`.
#[derive(Debug, Clone, Default)]
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self
    }

    pub fn finish(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Checksum of `A ++ B` from `crc32(A)`, `crc32(B)` and `B.len()`, without
/// touching the bytes of `A`.
pub fn crc32_combine(crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    let mut joined = Hasher::new_with_initial(crc_a);
    joined.combine(&Hasher::new_with_initial_len(crc_b, len_b));
    joined.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut h = Crc32::new();
        h.update(&data[..13]).update(&data[13..517]).update(&data[517..]);
        assert_eq!(h.finish(), crc32(&data));
    }

    #[test]
    fn combine_matches_concatenation() {
        let a: Vec<u8> = (0..333u32).map(|i| (i * 7 % 256) as u8).collect();
        let b: Vec<u8> = (0..4097u32).map(|i| (i * 13 % 253) as u8).collect();
        let joined = [a.as_slice(), b.as_slice()].concat();
        assert_eq!(crc32_combine(crc32(&a), crc32(&b), b.len() as u64), crc32(&joined));
        assert_eq!(crc32_combine(crc32(&a), crc32(b"x"), 1), crc32(&[a.as_slice(), b"x"].concat()));
        assert_eq!(crc32_combine(0x1234_5678, 0, 0), 0x1234_5678);
    }
}
