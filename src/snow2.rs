//! SNOW 2.0 stream cipher core.
//!
//! The PAK layers key this cipher with 128-byte keys derived from file and
//! entry names. The LFSR/FSM update rules and the alpha multiplication
//! tables follow the published SNOW 2.0 reference; keystream words combine
//! with little-endian data words by wrapping 32-bit addition (encrypt) and
//! subtraction (decrypt).

use std::sync::OnceLock;

pub const KEY_LEN: usize = 128;

/// Batch of keystream words produced per LFSR sweep.
const BATCH: usize = 16;

const AES_SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

/// GF(2^8) doubling modulo x^8 + x^7 + x^5 + x^3 + 1, the LFSR field.
fn mulx(v: u8) -> u8 {
    let shifted = v << 1;
    if v & 0x80 != 0 {
        shifted ^ 0xa9
    } else {
        shifted
    }
}

/// GF(2^8) doubling in the AES field (x^8 + x^4 + x^3 + x + 1). The FSM's
/// S transformation is an AES round and must reduce by 0x1B, not by the
/// LFSR polynomial.
fn mulx_aes(v: u8) -> u8 {
    let shifted = v << 1;
    if v & 0x80 != 0 {
        shifted ^ 0x1b
    } else {
        shifted
    }
}

fn mulx_pow(v: u8, n: u32) -> u8 {
    (0..n).fold(v, |acc, _| mulx(acc))
}

struct AlphaTables {
    mul: [u32; 256],
    div: [u32; 256],
}

fn alpha_tables() -> &'static AlphaTables {
    static TABLES: OnceLock<AlphaTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut t = AlphaTables {
            mul: [0; 256],
            div: [0; 256],
        };
        for c in 0..256usize {
            let b = c as u8;
            t.mul[c] = u32::from_be_bytes([
                mulx_pow(b, 23),
                mulx_pow(b, 245),
                mulx_pow(b, 48),
                mulx_pow(b, 239),
            ]);
            t.div[c] = u32::from_be_bytes([
                mulx_pow(b, 16),
                mulx_pow(b, 39),
                mulx_pow(b, 6),
                mulx_pow(b, 64),
            ]);
        }
        t
    })
}

fn mul_alpha(w: u32) -> u32 {
    (w << 8) ^ alpha_tables().mul[(w >> 24) as usize]
}

fn div_alpha(w: u32) -> u32 {
    (w >> 8) ^ alpha_tables().div[(w & 0xff) as usize]
}

/// The FSM S transformation: AES SubBytes on each byte followed by one
/// MixColumn of the word.
fn fsm_s(w: u32) -> u32 {
    let b = w.to_be_bytes().map(|x| AES_SBOX[x as usize]);
    let x3 = |v: u8| mulx_aes(v) ^ v;
    u32::from_be_bytes([
        mulx_aes(b[0]) ^ b[1] ^ b[2] ^ x3(b[3]),
        x3(b[0]) ^ mulx_aes(b[1]) ^ b[2] ^ b[3],
        b[0] ^ x3(b[1]) ^ mulx_aes(b[2]) ^ b[3],
        b[0] ^ b[1] ^ x3(b[2]) ^ mulx_aes(b[3]),
    ])
}

/// A keyed SNOW 2.0 instance. Stateful: successive calls continue the
/// keystream, so sequential reads through one instance decrypt a
/// contiguous ciphertext region.
pub struct Snow2 {
    lfsr: [u32; 16],
    r1: u32,
    r2: u32,
    keystream: [u32; BATCH],
    cursor: usize,
}

impl Snow2 {
    /// Keys the cipher. The 128-byte key is consumed as 32 little-endian
    /// words: the first 16 seed the LFSR, the remaining 16 fold in
    /// complemented, then the register runs the 32 feedback-mode
    /// initialization clocks of the reference cipher.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([key[i * 4], key[i * 4 + 1], key[i * 4 + 2], key[i * 4 + 3]])
        };

        let mut snow = Snow2 {
            lfsr: [0; 16],
            r1: 0,
            r2: 0,
            keystream: [0; BATCH],
            cursor: 0,
        };
        for i in 0..16 {
            snow.lfsr[i] = word(i) ^ !word(16 + i);
        }

        // Initialization clocks feed the FSM output back into the LFSR and
        // discard the keystream.
        for i in 0..32 {
            let j = i % 16;
            let from_fsm = snow.r1.wrapping_add(snow.lfsr[(j + 15) % 16]) ^ snow.r2;
            let tmp = snow.r2.wrapping_add(snow.lfsr[(j + 5) % 16]);
            snow.r2 = fsm_s(snow.r1);
            snow.r1 = tmp;
            snow.lfsr[j] =
                mul_alpha(snow.lfsr[j]) ^ snow.lfsr[(j + 2) % 16] ^ div_alpha(snow.lfsr[(j + 11) % 16]) ^ from_fsm;
        }

        snow.refill();
        snow
    }

    /// Produces the next batch of 16 keystream words.
    ///
    /// Per clock: the LFSR shifts with `s16 = alpha*s0 ^ s2 ^
    /// alpha^-1*s11`, the FSM updates with `R1' = R2 + s5` and
    /// `R2' = S(R1)` (R1 feeds the next state through S), and the output
    /// word is `(R1 + s15) ^ R2 ^ s0`.
    fn refill(&mut self) {
        for i in 0..BATCH {
            self.lfsr[i] =
                mul_alpha(self.lfsr[i]) ^ self.lfsr[(i + 2) % 16] ^ div_alpha(self.lfsr[(i + 11) % 16]);
            let tmp = self.r2.wrapping_add(self.lfsr[(i + 5) % 16]);
            self.r2 = fsm_s(self.r1);
            self.r1 = tmp;
            self.keystream[i] = self.r1.wrapping_add(self.lfsr[i]) ^ self.r2 ^ self.lfsr[(i + 1) % 16];
        }
    }

    fn next_word(&mut self) -> u32 {
        let w = self.keystream[self.cursor];
        self.cursor += 1;
        if self.cursor == BATCH {
            self.refill();
            self.cursor = 0;
        }
        w
    }

    /// Decrypts a buffer in place, advancing the keystream. The length
    /// must be a multiple of 4; alignment slack is the caller's concern
    /// (see [`crate::view::PakView`]).
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 4, 0, "snow2 operates on whole words");
        for chunk in data.chunks_exact_mut(4) {
            let word = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
            chunk.copy_from_slice(&word.wrapping_sub(self.next_word()).to_le_bytes());
        }
    }

    /// Encrypts a buffer in place, the inverse direction of
    /// [`Snow2::decrypt_in_place`]. The readers never need this; fixture
    /// synthesis does.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 4, 0, "snow2 operates on whole words");
        for chunk in data.chunks_exact_mut(4) {
            let word = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
            chunk.copy_from_slice(&word.wrapping_add(self.next_word()).to_le_bytes());
        }
    }
}
