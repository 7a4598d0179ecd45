//! Decrypting view over a PAK ciphertext region.
//!
//! The Snow keystream advances in whole 4-byte words, so every read pulls
//! an aligned amount of ciphertext; when a typed read needs fewer bytes
//! than the alignment, the slack is parked in a small remainder buffer and
//! satisfies the start of the next read. A view must be created fresh
//! (re-keying the cipher) whenever the ciphertext region changes.

use std::io::{self, Read};

use byte_slice_cast::AsSliceOf;
use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::snow2::{Snow2, KEY_LEN};

pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

pub struct PakView<'a> {
    cipher: Snow2,
    data: &'a [u8],
    /// Ciphertext bytes consumed so far (always word-aligned).
    pos: usize,
    rem: [u8; 4],
    rem_len: usize,
}

impl<'a> PakView<'a> {
    pub fn new(data: &'a [u8], key: &[u8; KEY_LEN]) -> Self {
        PakView {
            cipher: Snow2::new(key),
            data,
            pos: 0,
            rem: [0; 4],
            rem_len: 0,
        }
    }

    /// Ciphertext bytes consumed, including alignment slack.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        Ok(ReadBytesExt::read_u32::<LittleEndian>(self)?)
    }

    /// Reads a UTF-16LE string of `units` code units.
    pub fn next_utf16(&mut self, units: usize) -> Result<String> {
        let mut bytes = vec![0u8; units * 2];
        self.read_exact(&mut bytes)?;
        let words = bytes
            .as_slice_of::<u16>()
            .map_err(|e| Error::Path(format!("string bytes misaligned: {e:?}")))?;
        String::from_utf16(words).map_err(|e| Error::Path(format!("string is not UTF-16: {e}")))
    }

    /// Reads a 128-bit key stored as four little-endian u32 words.
    pub fn next_key(&mut self) -> Result<[u8; 16]> {
        let mut key = [0u8; 16];
        self.read_exact(&mut key)?;
        Ok(key)
    }
}

impl Read for PakView<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0;

        if self.rem_len > 0 {
            let n = buf.len().min(self.rem_len);
            buf[..n].copy_from_slice(&self.rem[..n]);
            self.rem.copy_within(n..self.rem_len, 0);
            self.rem_len -= n;
            written = n;
            if written == buf.len() {
                return Ok(written);
            }
        }

        let need = buf.len() - written;
        let aligned = align4(need);
        if self.pos + aligned > self.data.len() {
            if written > 0 {
                return Ok(written);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                Error::Truncated {
                    needed: (self.pos + aligned) as u64,
                    available: self.data.len() as u64,
                },
            ));
        }

        let mut block = self.data[self.pos..self.pos + aligned].to_vec();
        self.cipher.decrypt_in_place(&mut block);
        self.pos += aligned;

        buf[written..].copy_from_slice(&block[..need]);
        let slack = aligned - need;
        self.rem[..slack].copy_from_slice(&block[need..]);
        self.rem_len = slack;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn key(tag: u8) -> [u8; KEY_LEN] {
        std::array::from_fn(|i| (i as u8) ^ tag)
    }

    /// Encrypts a plaintext record stream the way a writer would: pad to a
    /// word boundary, one continuous keystream.
    fn seal(plain: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        buf.resize(align4(buf.len()), 0);
        Snow2::new(key).encrypt_in_place(&mut buf);
        buf
    }

    #[test]
    fn typed_reads_cross_word_boundaries() {
        let mut plain = Vec::new();
        plain.write_u32::<LittleEndian>(3).unwrap();
        for u in "abc".encode_utf16() {
            plain.write_u16::<LittleEndian>(u).unwrap();
        }
        plain.write_u32::<LittleEndian>(0xDEAD_BEEF).unwrap();
        plain.extend_from_slice(&[7u8; 16]);

        let sealed = seal(&plain, &key(1));
        let mut view = PakView::new(&sealed, &key(1));

        assert_eq!(view.next_u32().unwrap(), 3);
        // 6-byte string leaves 2 bytes in the remainder buffer.
        assert_eq!(view.next_utf16(3).unwrap(), "abc");
        assert_eq!(view.next_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(view.next_key().unwrap(), [7u8; 16]);
        assert_eq!(view.consumed(), align4(plain.len()));
    }

    #[test]
    fn sequential_reads_match_one_shot() {
        let plain: Vec<u8> = (0u8..64).collect();
        let sealed = seal(&plain, &key(2));

        let mut whole = vec![0u8; 64];
        PakView::new(&sealed, &key(2)).read_exact(&mut whole).unwrap();
        assert_eq!(whole, plain);

        let mut view = PakView::new(&sealed, &key(2));
        let mut parts = Vec::new();
        for chunk in [5usize, 3, 11, 45] {
            let mut buf = vec![0u8; chunk];
            view.read_exact(&mut buf).unwrap();
            parts.extend_from_slice(&buf);
        }
        assert_eq!(parts, plain);
    }

    #[test]
    fn truncated_ciphertext_is_an_error() {
        let sealed = seal(&[1, 2, 3, 4, 5, 6, 7, 8], &key(3));
        let mut view = PakView::new(&sealed[..6], &key(3));
        let mut buf = [0u8; 8];
        let err = view.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
