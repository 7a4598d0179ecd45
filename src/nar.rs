//! NAR (Nexon Archive) reader.
//!
//! The directory lives at the tail of the file: the last 8 bytes hold an
//! obfuscated header size and a repeat of the magic, and the header itself
//! is a BZip2 blob under a 16-byte XOR mask. Entry payloads are stored
//! raw, XOR-encoded, or XOR-encoded and LZ-compressed.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use byte_slice_cast::AsSliceOf;
use byteorder::{LittleEndian, ReadBytesExt};
use bzip2::read::BzDecoder;
use crc32fast::Hasher;
use log::{debug, trace};

use crate::codec::{xor_key_for_path, LzReader, XorReader};
use crate::error::{Error, Result};
use crate::stream::BoundedReader;

/// "NAR\0" as a little-endian u32.
pub const NAR_MAGIC: u32 = 0x0052_414E;
pub const NAR_VERSION: u32 = 0x0100_0000;

const HEADER_SIZE_MASK: u32 = 0x4074_659F;
const HEADER_XOR: [u8; 16] = [
    25, 91, 123, 44, 101, 94, 121, 37, 110, 75, 7, 33, 98, 127, 0, 41,
];
const DIRECTORY_VERSION: u32 = 1;

/// How an entry's payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredType {
    Raw,
    Encoded,
    EncodedAndCompressed,
}

impl StoredType {
    fn from_raw(v: u32) -> Result<Self> {
        match v {
            0 => Ok(StoredType::Raw),
            1 => Ok(StoredType::Encoded),
            2 => Ok(StoredType::EncodedAndCompressed),
            other => Err(Error::UnsupportedType(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarEntry {
    pub path: String,
    pub stored_type: StoredType,
    /// Absolute payload offset.
    pub offset: u64,
    pub stored_size: u32,
    pub extracted_size: u32,
    /// Seconds since 1970-01-01 UTC.
    pub last_modified: u32,
    /// CRC-32 of the raw stored bytes.
    pub checksum: u32,
}

/// An opened NAR archive. Immutable after load.
///
/// The underlying stream is stateful, so it sits behind a mutex and each
/// extraction holds the lock across its whole seek+read+decode phase;
/// concurrent extractions serialize but stay independent.
#[derive(Debug)]
pub struct NarArchive<R> {
    src: Mutex<R>,
    len: u64,
    entries: Vec<NarEntry>,
}

impl NarArchive<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> NarArchive<R> {
    pub fn from_reader(mut src: R) -> Result<Self> {
        let len = src.seek(SeekFrom::End(0))?;
        if len < 16 {
            return Err(Error::Truncated {
                needed: 16,
                available: len,
            });
        }

        src.seek(SeekFrom::Start(0))?;
        let magic = src.read_u32::<LittleEndian>()?;
        if magic != NAR_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = src.read_u32::<LittleEndian>()?;
        if version != NAR_VERSION {
            return Err(Error::InvalidVersion(version));
        }

        src.seek(SeekFrom::Start(len - 4))?;
        let tail_magic = src.read_u32::<LittleEndian>()?;
        if tail_magic != NAR_MAGIC {
            return Err(Error::InvalidMagic(tail_magic));
        }

        src.seek(SeekFrom::Start(len - 8))?;
        let header_size = src.read_u32::<LittleEndian>()? ^ HEADER_SIZE_MASK;
        trace!("[NAR] header size {header_size} (file length {len})");
        // The header must fit between the leading magic+version and the
        // trailing 8 bytes.
        if header_size as u64 + 16 > len {
            return Err(Error::Truncated {
                needed: header_size as u64 + 16,
                available: len,
            });
        }

        src.seek(SeekFrom::Start(len - 8 - header_size as u64))?;
        let mut blob = vec![0u8; header_size as usize];
        src.read_exact(&mut blob)?;
        for (i, b) in blob.iter_mut().enumerate() {
            *b ^= HEADER_XOR[i & 15];
        }

        let mut directory = Vec::new();
        BzDecoder::new(Cursor::new(blob)).read_to_end(&mut directory)?;

        let entries = Self::parse_directory(&directory, len)?;
        debug!("[NAR] loaded {} entries", entries.len());
        Ok(NarArchive {
            src: Mutex::new(src),
            len,
            entries,
        })
    }

    fn parse_directory(directory: &[u8], archive_len: u64) -> Result<Vec<NarEntry>> {
        let mut cur = Cursor::new(directory);
        let dir_version = cur.read_u32::<LittleEndian>()?;
        if dir_version != DIRECTORY_VERSION {
            return Err(Error::InvalidVersion(dir_version));
        }
        // 12 reserved bytes, then the entry count.
        cur.seek(SeekFrom::Start(16))?;
        let count = cur.read_u32::<LittleEndian>()?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let units = cur.read_u16::<LittleEndian>()? as usize;
            let mut path_bytes = vec![0u8; units * 2];
            cur.read_exact(&mut path_bytes)?;
            let path = String::from_utf16(
                path_bytes
                    .as_slice_of::<u16>()
                    .map_err(|e| Error::Path(format!("entry path bytes misaligned: {e:?}")))?,
            )
            .map_err(|e| Error::Path(format!("entry path is not UTF-16: {e}")))?;

            let stored_type = StoredType::from_raw(cur.read_u32::<LittleEndian>()?)?;
            let offset = cur.read_u32::<LittleEndian>()? as u64;
            let stored_size = cur.read_u32::<LittleEndian>()?;
            let extracted_size = cur.read_u32::<LittleEndian>()?;
            let last_modified = cur.read_u32::<LittleEndian>()?;
            let checksum = cur.read_u32::<LittleEndian>()?;

            if offset + stored_size as u64 > archive_len {
                return Err(Error::OutOfRange {
                    what: "entry payload",
                    value: offset + stored_size as u64,
                    limit: archive_len,
                });
            }
            if stored_type == StoredType::Raw && extracted_size != stored_size {
                return Err(Error::OutOfRange {
                    what: "raw entry extracted size",
                    value: extracted_size as u64,
                    limit: stored_size as u64,
                });
            }

            trace!(
                "[NAR] entry '{path}': {stored_type:?} offset=0x{offset:X} stored={stored_size} extracted={extracted_size}"
            );
            entries.push(NarEntry {
                path,
                stored_type,
                offset,
                stored_size,
                extracted_size,
                last_modified,
                checksum,
            });
        }
        Ok(entries)
    }

    /// Entries in directory order.
    pub fn entries(&self) -> &[NarEntry] {
        &self.entries
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extracts one entry through the pipeline its stored type selects.
    pub fn extract(&self, entry: &NarEntry) -> Result<Vec<u8>> {
        let mut src = self.src.lock().expect("archive source lock poisoned");
        let bounded = BoundedReader::new(&mut *src, entry.offset, entry.stored_size as u64)?;

        let mut out = Vec::with_capacity(entry.extracted_size as usize);
        match entry.stored_type {
            StoredType::Raw => {
                let mut rd = bounded;
                rd.read_to_end(&mut out)?;
            }
            StoredType::Encoded => {
                let mut rd = XorReader::new(bounded, xor_key_for_path(&entry.path));
                rd.read_to_end(&mut out)?;
            }
            StoredType::EncodedAndCompressed => {
                let decoded = XorReader::new(bounded, xor_key_for_path(&entry.path));
                let mut rd = LzReader::new(decoded, entry.extracted_size as u64);
                rd.read_to_end(&mut out)?;
            }
        }

        if out.len() as u64 != entry.extracted_size as u64 {
            return Err(Error::Truncated {
                needed: entry.extracted_size as u64,
                available: out.len() as u64,
            });
        }
        debug!("[NAR] extracted '{}' ({} bytes)", entry.path, out.len());
        Ok(out)
    }

    /// Streams the raw stored bytes through CRC-32 and compares against the
    /// directory checksum.
    pub fn verify(&self, entry: &NarEntry) -> Result<bool> {
        let mut src = self.src.lock().expect("archive source lock poisoned");
        let mut rd = BoundedReader::new(&mut *src, entry.offset, entry.stored_size as u64)?;

        let mut hasher = Hasher::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = rd.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let computed = hasher.finalize();
        trace!(
            "[NAR] verify '{}': computed 0x{computed:08X}, stored 0x{:08X}",
            entry.path,
            entry.checksum
        );
        Ok(computed == entry.checksum)
    }
}
