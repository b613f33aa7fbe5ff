//! HPACK Huffman code (RFC 7541 Appendix B)
//!
//! The code is canonical: codes are assigned in order of (length, symbol),
//! so the whole table is recovered from the per-symbol code lengths below.

use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;

use super::HpackError;

const EOS: u16 = 256;
const MAX_LEN: usize = 30;

/// Symbols grouped by code length: printable ASCII, then other octets
const LENGTHS: &[(u8, &[u8], &[u16])] = &[
    (5, b"012aceiost", &[]),
    (6, b" %-./3456789=A_bdfghlmnpru", &[]),
    (7, b":BCDEFGHIJKLMNOPQRSTUVWYjkqvwxyz", &[]),
    (8, b"&*,;XZ", &[]),
    (10, b"!\"()?", &[]),
    (11, b"'+|", &[]),
    (12, b"#>", &[]),
    (13, b"$@[]~", &[0]),
    (14, b"^}", &[]),
    (15, b"<`{", &[]),
    (19, b"\\", &[195, 208]),
    (20, b"", &[128, 130, 131, 162, 184, 194, 224, 226]),
    (21, b"", &[153, 161, 167, 172, 176, 177, 179, 209, 216, 217, 227, 229, 230]),
    (
        22,
        b"",
        &[
            129, 132, 133, 134, 136, 146, 154, 156, 160, 163, 164, 169, 170, 173, 178, 181, 185,
            186, 187, 189, 190, 196, 198, 228, 232, 233,
        ],
    ),
    (
        23,
        b"",
        &[
            1, 135, 137, 138, 139, 140, 141, 143, 147, 149, 150, 151, 152, 155, 157, 158, 165, 166,
            168, 174, 175, 180, 182, 183, 188, 191, 197, 231, 239,
        ],
    ),
    (24, b"", &[9, 142, 144, 145, 148, 159, 171, 206, 215, 225, 236, 237]),
    (25, b"", &[199, 207, 234, 235]),
    (
        26,
        b"",
        &[192, 193, 200, 201, 202, 205, 210, 213, 218, 219, 238, 240, 242, 243, 255],
    ),
    (
        27,
        b"",
        &[
            203, 204, 211, 212, 214, 221, 222, 223, 241, 244, 245, 246, 247, 248, 250, 251, 252,
            253, 254,
        ],
    ),
    (
        28,
        b"",
        &[
            2, 3, 4, 5, 6, 7, 8, 11, 12, 14, 15, 16, 17, 18, 19, 20, 21, 23, 24, 25, 26, 27, 28, 29,
            30, 31, 127, 220, 249,
        ],
    ),
    (30, b"", &[10, 13, 22, EOS]),
];

struct Codebook {
    /// (code, bit length) per symbol
    codes: [(u32, u8); 257],
    /// First code of each length
    first: [u32; MAX_LEN + 1],
    count: [u32; MAX_LEN + 1],
    /// Index into `sorted` of the first symbol of each length
    offset: [usize; MAX_LEN + 1],
    sorted: Vec<u16>,
}

impl Codebook {
    fn build() -> Self {
        let mut sorted: Vec<(u8, u16)> = LENGTHS
            .iter()
            .flat_map(|(len, ascii, other)| {
                ascii
                    .iter()
                    .map(|&b| (*len, b as u16))
                    .chain(other.iter().map(|&s| (*len, s)))
                    .collect::<Vec<_>>()
            })
            .collect();
        sorted.sort();

        let mut book = Codebook {
            codes: [(0, 0); 257],
            first: [0; MAX_LEN + 1],
            count: [0; MAX_LEN + 1],
            offset: [0; MAX_LEN + 1],
            sorted: sorted.iter().map(|&(_, s)| s).collect(),
        };

        let mut code: u32 = 0;
        let mut prev_len = sorted[0].0;
        for (i, &(len, sym)) in sorted.iter().enumerate() {
            code <<= len - prev_len;
            prev_len = len;
            let l = len as usize;
            if book.count[l] == 0 {
                book.first[l] = code;
                book.offset[l] = i;
            }
            book.count[l] += 1;
            book.codes[sym as usize] = (code, len);
            code += 1;
        }
        book
    }
}

static BOOK: Lazy<Codebook> = Lazy::new(Codebook::build);

/// Encoded size in bytes
pub fn encoded_len(src: &[u8]) -> usize {
    let bits: usize = src.iter().map(|&b| BOOK.codes[b as usize].1 as usize).sum();
    bits.div_ceil(8)
}

/// Huffman-encode `src`, padding the last octet with the EOS prefix
pub fn encode(src: &[u8], dst: &mut BytesMut) {
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;
    for &b in src {
        let (code, len) = BOOK.codes[b as usize];
        acc = (acc << len) | code as u64;
        bits += len as u32;
        while bits >= 8 {
            bits -= 8;
            dst.put_u8((acc >> bits) as u8);
        }
        acc &= (1u64 << bits) - 1;
    }
    if bits > 0 {
        let pad = 8 - bits;
        dst.put_u8(((acc << pad) | ((1 << pad) - 1)) as u8);
    }
}

/// Decode a Huffman string
pub fn decode(src: &[u8]) -> Result<Vec<u8>, HpackError> {
    let book = &*BOOK;
    let mut out = Vec::with_capacity(src.len() * 8 / 5);
    let mut code: u32 = 0;
    let mut len: usize = 0;

    for &byte in src {
        for shift in (0..8).rev() {
            code = (code << 1) | ((byte >> shift) & 1) as u32;
            len += 1;
            if len > MAX_LEN {
                return Err(HpackError::InvalidHuffman);
            }
            let n = book.count[len];
            if n > 0 && code >= book.first[len] && code - book.first[len] < n {
                let sym = book.sorted[book.offset[len] + (code - book.first[len]) as usize];
                if sym == EOS {
                    return Err(HpackError::InvalidHuffman);
                }
                out.push(sym as u8);
                code = 0;
                len = 0;
            }
        }
    }

    // Trailing bits must be a strict EOS prefix: fewer than 8, all ones
    if len > 7 || code != (1u32 << len) - 1 {
        return Err(HpackError::InvalidHuffman);
    }
    Ok(out)
}
