//! # HPACK Header Compression (RFC 7541)
//!
//! One [`Encoder`] and one [`Decoder`] per connection. Each keeps its own
//! dynamic table; the tables stay in sync with the peer's because both sides
//! apply the same insertions in the same order.
//!
//! ```text
//!   0x80  1xxxxxxx  indexed field
//!   0x40  01xxxxxx  literal, incremental indexing
//!   0x20  001xxxxx  dynamic table size update
//!   0x10  0001xxxx  literal, never indexed
//!   0x00  0000xxxx  literal, without indexing
//! ```

pub mod huffman;
pub mod table;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub use table::{DynamicTable, Match};

/// Default SETTINGS_HEADER_TABLE_SIZE
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Headers whose values must never enter a compression table
const SENSITIVE: &[&str] = &["authorization", "cookie", "proxy-authorization"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,

    #[error("integer overflow in header block")]
    IntegerOverflow,

    #[error("invalid table index {0}")]
    InvalidIndex(usize),

    #[error("invalid Huffman string")]
    InvalidHuffman,

    #[error("table size update after first field")]
    SizeUpdateMisplaced,

    #[error("table size update to {requested} exceeds limit {max}")]
    SizeUpdateTooLarge { requested: usize, max: usize },

    #[error("header list exceeds {0} bytes")]
    HeaderListTooLarge(usize),
}

/// Append an HPACK integer with an N-bit prefix (§5.1)
pub fn encode_int(value: usize, prefix_bits: u8, first: u8, dst: &mut BytesMut) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.put_u8(first | value as u8);
        return;
    }
    dst.put_u8(first | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dst.put_u8((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dst.put_u8(rest as u8);
}

/// Read an HPACK integer, advancing `pos`
pub fn decode_int(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *src.get(*pos).ok_or(HpackError::Truncated)?;
    *pos += 1;
    let mut value = first as usize & max_prefix;
    if value < max_prefix {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *src.get(*pos).ok_or(HpackError::Truncated)?;
        *pos += 1;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .filter(|v| *v <= u32::MAX as usize)
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_str(src: &[u8], dst: &mut BytesMut) {
    let packed = huffman::encoded_len(src);
    if packed < src.len() {
        encode_int(packed, 7, 0x80, dst);
        huffman::encode(src, dst);
    } else {
        encode_int(src.len(), 7, 0, dst);
        dst.put_slice(src);
    }
}

fn decode_str(src: &[u8], pos: &mut usize) -> Result<Vec<u8>, HpackError> {
    let huff = src.get(*pos).ok_or(HpackError::Truncated)? & 0x80 != 0;
    let len = decode_int(src, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::Truncated)?;
    let raw = src.get(*pos..end).ok_or(HpackError::Truncated)?;
    *pos = end;
    if huff {
        huffman::decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}

/// Header block encoder
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest size since the last block, then the final size (§4.2)
    pending_update: Option<(usize, usize)>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl Encoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            pending_update: None,
        }
    }

    /// Follow a new peer SETTINGS_HEADER_TABLE_SIZE; our table never grows
    /// past the default
    pub fn set_max_size(&mut self, peer_max: usize) {
        let size = peer_max.min(DEFAULT_TABLE_SIZE);
        if size == self.table.max_size() && self.pending_update.is_none() {
            return;
        }
        let low = match self.pending_update {
            Some((low, _)) => low.min(size),
            None => size.min(self.table.max_size()),
        };
        self.table.set_max_size(size);
        self.pending_update = Some((low, size));
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode a header list (names already lowercase) into one block
    pub fn encode<'a, I>(&mut self, headers: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if let Some((low, last)) = self.pending_update.take() {
            if low < last {
                encode_int(low, 5, 0x20, dst);
            }
            encode_int(last, 5, 0x20, dst);
        }
        for (name, value) in headers {
            self.encode_field(name.as_bytes(), value.as_bytes(), dst);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        let found = self.table.find(name, value);
        let sensitive = SENSITIVE.iter().any(|s| s.as_bytes() == name);

        if let (Match::Full(index), false) = (found, sensitive) {
            encode_int(index, 7, 0x80, dst);
            return;
        }

        let name_index = match found {
            Match::Full(i) | Match::Name(i) => Some(i),
            Match::None => None,
        };
        let indexable = !sensitive && table::entry_size(name, value) <= self.table.max_size();
        let (prefix, first) = if sensitive {
            (4, 0x10)
        } else if indexable {
            (6, 0x40)
        } else {
            (4, 0x00)
        };

        match name_index {
            Some(i) => encode_int(i, prefix, first, dst),
            None => {
                dst.put_u8(first);
                encode_str(name, dst);
            }
        }
        encode_str(value, dst);

        if indexable {
            self.table.insert(name.to_vec(), value.to_vec());
        }
    }
}

/// Header block decoder
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Ceiling we advertised in SETTINGS_HEADER_TABLE_SIZE
    max_allowed: usize,
    max_list_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE, 65_535)
    }
}

impl Decoder {
    pub fn new(max_table_size: usize, max_list_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_allowed: max_table_size,
            max_list_size,
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode one complete header block
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0usize;

        while pos < block.len() {
            let byte = block[pos];
            let (name, value) = if byte & 0x80 != 0 {
                let index = decode_int(block, &mut pos, 7)?;
                let (n, v) = self.lookup(index)?;
                (n.to_vec(), v.to_vec())
            } else if byte & 0x40 != 0 {
                let (n, v) = self.literal(block, &mut pos, 6)?;
                self.table.insert(n.clone(), v.clone());
                (n, v)
            } else if byte & 0x20 != 0 {
                if !fields.is_empty() {
                    return Err(HpackError::SizeUpdateMisplaced);
                }
                let requested = decode_int(block, &mut pos, 5)?;
                if requested > self.max_allowed {
                    return Err(HpackError::SizeUpdateTooLarge {
                        requested,
                        max: self.max_allowed,
                    });
                }
                self.table.set_max_size(requested);
                continue;
            } else {
                self.literal(block, &mut pos, 4)?
            };

            list_size += table::entry_size(&name, &value);
            if list_size > self.max_list_size {
                return Err(HpackError::HeaderListTooLarge(self.max_list_size));
            }
            fields.push((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(fields)
    }

    fn lookup(&self, index: usize) -> Result<(&[u8], &[u8]), HpackError> {
        self.table.get(index).ok_or(HpackError::InvalidIndex(index))
    }

    fn literal(
        &self,
        block: &[u8],
        pos: &mut usize,
        prefix: u8,
    ) -> Result<(Vec<u8>, Vec<u8>), HpackError> {
        let index = decode_int(block, pos, prefix)?;
        let name = if index == 0 {
            decode_str(block, pos)?
        } else {
            self.lookup(index)?.0.to_vec()
        };
        let value = decode_str(block, pos)?;
        Ok((name, value))
    }
}
