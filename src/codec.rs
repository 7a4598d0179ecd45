//! Per-entry decoders for NAR payloads: the position-indexed XOR layer and
//! the dictionary-based LZ decompressor. Both are `io::Read` adapters so
//! extraction pipelines compose by wrapping readers.

use std::io::{self, Read, Seek};

use log::trace;

use crate::dict::CircularDictionary;
use crate::error::Error;

/// Python-style string hash: multiply-XOR fold with unsigned 32-bit wrap,
/// then XOR with the input length.
fn python_hash(data: &[u8]) -> u32 {
    let mut h = 0u32;
    for &b in data {
        h = h.wrapping_mul(1_000_003) ^ b as u32;
    }
    h ^ data.len() as u32
}

/// Derives the 16-byte XOR mask for an entry path. The path hash seeds an
/// LCG; each mask byte is the low byte of one LCG step.
pub fn xor_key_for_path(path: &str) -> [u8; 16] {
    let mut seed = python_hash(path.as_bytes());
    std::array::from_fn(|_| {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
        seed as u8
    })
}

/// XORs every byte at stream position `p` with `key[p % 16]`.
///
/// The position is taken from the wrapped stream before each read, so the
/// decoder carries no state of its own and decoding twice from the same
/// start position is the identity.
pub struct XorReader<R> {
    inner: R,
    key: [u8; 16],
}

impl<R: Read + Seek> XorReader<R> {
    pub fn new(inner: R, key: [u8; 16]) -> Self {
        XorReader { inner, key }
    }
}

impl<R: Read + Seek> Read for XorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.inner.stream_position()?;
        let n = self.inner.read(buf)?;
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b ^= self.key[((pos + i as u64) % 16) as usize];
        }
        Ok(n)
    }
}

#[derive(Clone, Copy)]
enum LzState {
    /// Between tokens.
    Idle,
    /// Verbatim literal run, this many bytes left.
    Literal(usize),
    /// Dictionary back-reference, copied one byte at a time so short
    /// distances overlap the bytes they just produced.
    Match { distance: usize, left: usize },
}

/// Decompresses the NAR LZ token stream against an 8 KiB sliding
/// dictionary. Output is bounded by the entry's extracted size; once that
/// many bytes have been produced further reads return 0.
pub struct LzReader<R> {
    inner: R,
    dict: CircularDictionary,
    state: LzState,
    remaining: u64,
}

impl<R: Read> LzReader<R> {
    pub fn new(inner: R, extracted_size: u64) -> Self {
        LzReader {
            inner,
            dict: CircularDictionary::new(),
            state: LzState::Idle,
            remaining: extracted_size,
        }
    }

    /// Reads one token-stream byte; `Ok(None)` only at a clean EOF.
    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        loop {
            match self.inner.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(b[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn begin_token(&mut self) -> io::Result<bool> {
        let token = match self.next_byte()? {
            Some(b) => b,
            None => return Ok(false),
        };
        let op = (token >> 5) as usize;
        let low = (token & 31) as usize;

        if op == 0 {
            self.state = LzState::Literal(low + 1);
            return Ok(true);
        }

        let mut length = op;
        if op == 7 {
            let ext = self.next_byte()?.ok_or_else(|| {
                Error::MalformedTokenStream("length extension byte missing".into()).into_io()
            })?;
            length += ext as usize;
        }
        length += 2;

        let dist_low = self.next_byte()?.ok_or_else(|| {
            Error::MalformedTokenStream("distance byte missing".into()).into_io()
        })?;
        let distance = ((low << 8) | dist_low as usize) + 1;
        if distance > self.dict.count() {
            return Err(Error::MalformedTokenStream(format!(
                "back-reference distance {distance} exceeds {} bytes of history",
                self.dict.count()
            ))
            .into_io());
        }

        trace!("[LZ] match: distance={distance} length={length}");
        self.state = LzState::Match {
            distance,
            left: length,
        };
        Ok(true)
    }
}

impl<R: Read> Read for LzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.remaining > 0 {
            match self.state {
                LzState::Idle => {
                    if !self.begin_token()? {
                        if filled > 0 {
                            break;
                        }
                        return Err(Error::MalformedTokenStream(format!(
                            "token stream ended with {} bytes still expected",
                            self.remaining
                        ))
                        .into_io());
                    }
                }
                LzState::Literal(left) => {
                    let n = left
                        .min(buf.len() - filled)
                        .min(self.remaining.min(usize::MAX as u64) as usize);
                    let dst = &mut buf[filled..filled + n];
                    self.inner.read_exact(dst).map_err(|e| {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            Error::MalformedTokenStream("literal run truncated".into()).into_io()
                        } else {
                            e
                        }
                    })?;
                    self.dict.append(dst);
                    filled += n;
                    self.remaining -= n as u64;
                    self.state = if left == n {
                        LzState::Idle
                    } else {
                        LzState::Literal(left - n)
                    };
                }
                LzState::Match { distance, left } => {
                    let n = left
                        .min(buf.len() - filled)
                        .min(self.remaining.min(usize::MAX as u64) as usize);
                    for _ in 0..n {
                        let mut b = [0u8; 1];
                        self.dict.copy(distance, &mut b);
                        self.dict.append(&b);
                        buf[filled] = b[0];
                        filled += 1;
                    }
                    self.remaining -= n as u64;
                    self.state = if left == n {
                        LzState::Idle
                    } else {
                        LzState::Match {
                            distance,
                            left: left - n,
                        }
                    };
                }
            }
        }
        Ok(filled)
    }
}
