//! PAK container reader.
//!
//! Nothing in a PAK is at a fixed place: the header and entry-table
//! offsets are arithmetic on the filename's UTF-16 code units, and every
//! layer (header, entry table, payloads) is Snow-encrypted under a key
//! derived from the filename or the entry path plus a per-entry base key.

use std::fs;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::snow2::KEY_LEN;
use crate::view::{align4, PakView};

/// Key salt appended to the filename for the header and entry-table keys.
const EMBEDDED_KEY: &str = "CqeLFV@*0IfewH";

const PAK_VERSION: u8 = 2;
const MAX_PATH_UNITS: u32 = 0x4000;
/// Size of the head region that `Encrypted` entries cipher.
const HEAD_CRYPT_SIZE: usize = 0x400;
/// Payload offsets count in blocks of this many bytes.
const BLOCK_SIZE: u64 = 1024;

fn key_material(filename: &str) -> Vec<u8> {
    let mut k = filename.as_bytes().to_vec();
    k.extend_from_slice(EMBEDDED_KEY.as_bytes());
    k
}

pub fn header_key(filename: &str) -> [u8; KEY_LEN] {
    let k = key_material(filename);
    std::array::from_fn(|i| (i as u32).wrapping_add(k[i % k.len()] as u32) as u8)
}

/// The entry-table key walks the key material from the end backward with a
/// position-dependent multiplier.
pub fn entries_key(filename: &str) -> [u8; KEY_LEN] {
    let k = key_material(filename);
    let len = k.len();
    std::array::from_fn(|i| {
        let factor = (i % 3 + 2) as u32;
        (i as u32)
            .wrapping_add(factor.wrapping_mul(k[len - 1 - i % len] as u32)) as u8
    })
}

/// Per-entry payload key from the entry path and the 128-bit base key.
pub fn data_key(path: &str, base_key: &[u8; 16]) -> Result<[u8; KEY_LEN]> {
    let units: Vec<u16> = path.encode_utf16().collect();
    if units.is_empty() {
        return Err(Error::Path("entry path is empty".into()));
    }
    Ok(std::array::from_fn(|i| {
        let c = units[i % units.len()] as u32;
        let f = (i as u32)
            .wrapping_add(base_key[i % 16] as u32)
            .wrapping_sub(5 * (i as u32 / 5))
            .wrapping_add(2);
        c.wrapping_mul(f).wrapping_add(i as u32) as u8
    }))
}

fn filename_sum(filename: &str) -> u64 {
    filename.encode_utf16().map(|c| c as u64).sum()
}

pub fn header_offset(filename: &str) -> u64 {
    filename_sum(filename) % 312 + 30
}

pub fn entries_offset(filename: &str) -> u64 {
    header_offset(filename) + 42 + filename_sum(filename) * 3 % 212
}

fn align_block(n: u64) -> u64 {
    (n + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

/// Payload storage scheme of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Uncompressed,
    /// Present in the wire format; its decompression scheme is unknown, so
    /// unpacking one is a typed error.
    Compressed,
    /// Only the first KiB of the payload is ciphered.
    Encrypted,
    /// The whole payload is ciphered.
    EncryptedAgain,
}

impl EntryType {
    fn from_raw(v: u32) -> Result<Self> {
        match v {
            0 => Ok(EntryType::Uncompressed),
            1 => Ok(EntryType::Compressed),
            2 => Ok(EntryType::Encrypted),
            4 => Ok(EntryType::EncryptedAgain),
            other => Err(Error::UnsupportedType(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PakEntry {
    pub path: String,
    pub unknown: u32,
    pub entry_type: EntryType,
    /// Offset past the data origin, in 1024-byte blocks.
    pub block_offset: u32,
    pub original_size: u32,
    pub packed_size: u32,
    pub base_key: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct PakHeader {
    pub checksum: u32,
    pub version: u8,
    pub entry_count: u32,
}

/// A loaded PAK container. The whole file buffer is held in memory.
#[derive(Debug)]
pub struct PakArchive {
    data: Vec<u8>,
    header: PakHeader,
    entries: Vec<PakEntry>,
    data_offset: u64,
}

impl PakArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Path(format!("not a valid file path: {}", path.display())))?
            .to_owned();
        Self::from_bytes(fs::read(path)?, &filename)
    }

    /// Parses a container from an owned buffer. `filename` is the bare
    /// file name the keys and offsets derive from.
    pub fn from_bytes(data: Vec<u8>, filename: &str) -> Result<Self> {
        let header_off = header_offset(filename) as usize;
        debug!("[PAK] '{filename}': header at 0x{header_off:X}");
        if header_off + 12 > data.len() {
            return Err(Error::Truncated {
                needed: (header_off + 12) as u64,
                available: data.len() as u64,
            });
        }

        let mut view = PakView::new(&data[header_off..], &header_key(filename));
        let mut raw = [0u8; 12];
        std::io::Read::read_exact(&mut view, &mut raw)?;
        let mut cur = std::io::Cursor::new(&raw[..]);
        let header = PakHeader {
            checksum: cur.read_u32::<LittleEndian>()?,
            version: cur.read_u8()?,
            entry_count: cur.read_u32::<LittleEndian>()?,
        };
        trace!("[PAK] header {header:?}");
        if header.version != PAK_VERSION {
            return Err(Error::InvalidVersion(header.version as u32));
        }
        let computed = (header.version as u32).wrapping_add(header.entry_count);
        if computed != header.checksum {
            return Err(Error::InvalidChecksum {
                computed,
                stored: header.checksum,
            });
        }

        let entries_off = entries_offset(filename) as usize;
        if entries_off > data.len() {
            return Err(Error::Truncated {
                needed: entries_off as u64,
                available: data.len() as u64,
            });
        }
        let mut view = PakView::new(&data[entries_off..], &entries_key(filename));
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            entries.push(Self::parse_entry(&mut view)?);
        }

        let data_offset = align_block((entries_off + view.consumed()) as u64);
        debug!(
            "[PAK] '{filename}': {} entries, data origin 0x{data_offset:X}",
            entries.len()
        );
        Ok(PakArchive {
            data,
            header,
            entries,
            data_offset,
        })
    }

    fn parse_entry(view: &mut PakView) -> Result<PakEntry> {
        let path_units = view.next_u32()?;
        if path_units > MAX_PATH_UNITS {
            return Err(Error::OutOfRange {
                what: "entry path length",
                value: path_units as u64,
                limit: MAX_PATH_UNITS as u64,
            });
        }
        let path = view.next_utf16(path_units as usize)?;
        let unknown = view.next_u32()?;
        let entry_type = EntryType::from_raw(view.next_u32()?)?;
        let block_offset = view.next_u32()?;
        let original_size = view.next_u32()?;
        let packed_size = view.next_u32()?;
        let base_key = view.next_key()?;

        trace!(
            "[PAK] entry '{path}': {entry_type:?} block={block_offset} original={original_size} packed={packed_size}"
        );
        Ok(PakEntry {
            path,
            unknown,
            entry_type,
            block_offset,
            original_size,
            packed_size,
            base_key,
        })
    }

    pub fn header(&self) -> &PakHeader {
        &self.header
    }

    pub fn entries(&self) -> &[PakEntry] {
        &self.entries
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn payload(&self, entry: &PakEntry, len: usize) -> Result<&[u8]> {
        let start = self.data_offset + (entry.block_offset as u64) * BLOCK_SIZE;
        let end = start + len as u64;
        if end > self.data.len() as u64 {
            return Err(Error::Truncated {
                needed: end,
                available: self.data.len() as u64,
            });
        }
        Ok(&self.data[start as usize..end as usize])
    }

    /// Decodes one entry's payload to its original bytes.
    pub fn unpack(&self, entry: &PakEntry) -> Result<Vec<u8>> {
        let size = entry.original_size as usize;
        match entry.entry_type {
            EntryType::Uncompressed => Ok(self.payload(entry, size)?.to_vec()),
            EntryType::Compressed => Err(Error::UnsupportedType(1)),
            EntryType::Encrypted => {
                let mut out = self.payload(entry, size)?.to_vec();
                // Only the first KiB (word-aligned) was ciphered; the rest
                // of the payload is stored verbatim.
                let head_aligned = align4(size).min(HEAD_CRYPT_SIZE);
                let head_plain = size.min(HEAD_CRYPT_SIZE);
                if head_plain > 0 {
                    let key = data_key(&entry.path, &entry.base_key)?;
                    let ciphered = self.payload(entry, head_aligned)?;
                    let mut view = PakView::new(ciphered, &key);
                    std::io::Read::read_exact(&mut view, &mut out[..head_plain])?;
                }
                Ok(out)
            }
            EntryType::EncryptedAgain => {
                let key = data_key(&entry.path, &entry.base_key)?;
                let ciphered = self.payload(entry, align4(size))?;
                let mut view = PakView::new(ciphered, &key);
                let mut out = vec![0u8; size];
                std::io::Read::read_exact(&mut view, &mut out)?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snow2::Snow2;
    use byteorder::WriteBytesExt;

    const NAME: &str = "x.pak";

    fn seal(plain: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        buf.resize(align4(buf.len()), 0);
        Snow2::new(key).encrypt_in_place(&mut buf);
        buf
    }

    struct Fixture<'a> {
        path: &'a str,
        entry_type: u32,
        plain: &'a [u8],
    }

    /// Synthesizes a full container image for `NAME`.
    fn build_pak(specs: &[Fixture]) -> Vec<u8> {
        let header_off = header_offset(NAME) as usize;
        let entries_off = entries_offset(NAME) as usize;

        // Payload blocks first, so the entry table can carry real block
        // offsets for multi-block payloads.
        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let mut block_offsets: Vec<u32> = Vec::new();
        let mut cursor_blocks = 0u32;
        for (i, spec) in specs.iter().enumerate() {
            let key = data_key(spec.path, &test_base_key(i)).unwrap();
            let mut block = match spec.entry_type {
                4 => seal(spec.plain, &key),
                2 => {
                    let mut buf = spec.plain.to_vec();
                    buf.resize(align4(buf.len()), 0);
                    let head = align4(spec.plain.len()).min(HEAD_CRYPT_SIZE);
                    Snow2::new(&key).encrypt_in_place(&mut buf[..head]);
                    buf
                }
                _ => spec.plain.to_vec(),
            };
            let padded = ((block.len() + 1023) & !1023).max(1024);
            block.resize(padded, 0);
            block_offsets.push(cursor_blocks);
            cursor_blocks += (padded / 1024) as u32;
            blocks.push(block);
        }

        // Header: checksum, version, count, 3 pad bytes.
        let mut header = Vec::new();
        header
            .write_u32::<LittleEndian>(2u32 + specs.len() as u32)
            .unwrap();
        header.write_u8(2).unwrap();
        header
            .write_u32::<LittleEndian>(specs.len() as u32)
            .unwrap();
        header.extend_from_slice(&[0u8; 3]);
        let header_sealed = seal(&header, &header_key(NAME));

        // Entry table, one continuous record stream.
        let mut table = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            let units: Vec<u16> = spec.path.encode_utf16().collect();
            table.write_u32::<LittleEndian>(units.len() as u32).unwrap();
            for u in units {
                table.write_u16::<LittleEndian>(u).unwrap();
            }
            table.write_u32::<LittleEndian>(0).unwrap(); // unknown
            table.write_u32::<LittleEndian>(spec.entry_type).unwrap();
            table.write_u32::<LittleEndian>(block_offsets[i]).unwrap();
            table
                .write_u32::<LittleEndian>(spec.plain.len() as u32)
                .unwrap();
            table
                .write_u32::<LittleEndian>(spec.plain.len() as u32)
                .unwrap();
            table.extend_from_slice(&test_base_key(i));
        }
        let table_sealed = seal(&table, &entries_key(NAME));

        let data_off = ((entries_off + table_sealed.len()) + 1023) & !1023;

        let mut image = vec![0u8; header_off];
        image.extend_from_slice(&header_sealed);
        image.resize(entries_off, 0);
        image.extend_from_slice(&table_sealed);
        image.resize(data_off, 0);
        for block in blocks {
            image.extend_from_slice(&block);
        }
        image
    }

    fn test_base_key(i: usize) -> [u8; 16] {
        std::array::from_fn(|j| (i * 31 + j * 7) as u8)
    }

    #[test]
    fn derived_offsets_match_hand_computation() {
        // "x.pak" code units sum to 482.
        assert_eq!(header_offset(NAME), 482 % 312 + 30);
        assert_eq!(entries_offset(NAME), 200 + 42 + (482 * 3) % 212);
    }

    #[test]
    fn keys_are_position_and_name_dependent() {
        let hk = header_key(NAME);
        let k = key_material(NAME);
        assert_eq!(hk[0], k[0]);
        assert_eq!(hk[1], k[1].wrapping_add(1));
        assert_ne!(header_key(NAME), header_key("y.pak"));
        assert_ne!(entries_key(NAME)[..], header_key(NAME)[..]);

        let base = [3u8; 16];
        assert_ne!(
            data_key("a/b.mdl", &base).unwrap(),
            data_key("a/c.mdl", &base).unwrap()
        );
        assert!(data_key("", &base).is_err());
    }

    #[test]
    fn parses_and_unpacks_every_supported_type() {
        let big: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let image = build_pak(&[
            Fixture {
                path: "sound/hit.wav",
                entry_type: 0,
                plain: b"RIFFxxxxWAVE",
            },
            Fixture {
                path: "models/ak47.mdl",
                entry_type: 2,
                plain: &big,
            },
            Fixture {
                path: "scripts/weapon.txt",
                entry_type: 4,
                plain: b"damage=36\nrpm=600\n",
            },
        ]);

        let archive = PakArchive::from_bytes(image, NAME).unwrap();
        assert_eq!(archive.header().entry_count, 3);
        let entries = archive.entries().to_vec();

        assert_eq!(entries[0].entry_type, EntryType::Uncompressed);
        assert_eq!(archive.unpack(&entries[0]).unwrap(), b"RIFFxxxxWAVE");

        assert_eq!(entries[1].entry_type, EntryType::Encrypted);
        assert_eq!(archive.unpack(&entries[1]).unwrap(), big);

        assert_eq!(entries[2].entry_type, EntryType::EncryptedAgain);
        assert_eq!(
            archive.unpack(&entries[2]).unwrap(),
            b"damage=36\nrpm=600\n"
        );
    }

    #[test]
    fn compressed_entries_are_a_typed_error() {
        let image = build_pak(&[Fixture {
            path: "maps/de_dust.bsp",
            entry_type: 1,
            plain: b"not actually here",
        }]);
        let archive = PakArchive::from_bytes(image, NAME).unwrap();
        let err = archive.unpack(&archive.entries()[0]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(1)));
    }

    #[test]
    fn header_checksum_relation_is_enforced() {
        // version=2, entries=5, checksum=7 parses; checksum=6 is rejected.
        let build_header_image = |checksum: u32| {
            let header_off = header_offset(NAME) as usize;
            let mut header = Vec::new();
            header.write_u32::<LittleEndian>(checksum).unwrap();
            header.write_u8(2).unwrap();
            header.write_u32::<LittleEndian>(5).unwrap();
            header.extend_from_slice(&[0u8; 3]);
            let sealed = seal(&header, &header_key(NAME));
            let mut image = vec![0u8; header_off];
            image.extend_from_slice(&sealed);
            // Room for the entry table region; zero entries get read only
            // when the header validates, so garbage is fine for the bad
            // case.
            image.resize(image.len() + 4096, 0);
            image
        };

        let err = PakArchive::from_bytes(build_header_image(6), NAME).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidChecksum {
                computed: 7,
                stored: 6
            }
        ));

        // checksum=7 passes header validation; whatever the garbage entry
        // table does afterwards, it is not a checksum rejection.
        match PakArchive::from_bytes(build_header_image(7), NAME) {
            Ok(_) => {}
            Err(e) => assert!(!matches!(e, Error::InvalidChecksum { .. })),
        }
    }

    #[test]
    fn oversized_path_length_is_rejected() {
        let header_off = header_offset(NAME) as usize;
        let entries_off = entries_offset(NAME) as usize;

        let mut header = Vec::new();
        header.write_u32::<LittleEndian>(3).unwrap();
        header.write_u8(2).unwrap();
        header.write_u32::<LittleEndian>(1).unwrap();
        header.extend_from_slice(&[0u8; 3]);
        let header_sealed = seal(&header, &header_key(NAME));

        let mut table = Vec::new();
        table.write_u32::<LittleEndian>(0x4001).unwrap();
        table.extend_from_slice(&[0u8; 64]);
        let table_sealed = seal(&table, &entries_key(NAME));

        let mut image = vec![0u8; header_off];
        image.extend_from_slice(&header_sealed);
        image.resize(entries_off, 0);
        image.extend_from_slice(&table_sealed);

        let err = PakArchive::from_bytes(image, NAME).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                what: "entry path length",
                value: 0x4001,
                ..
            }
        ));
    }
}
