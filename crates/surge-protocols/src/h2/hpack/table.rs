//! HPACK static and dynamic tables (RFC 7541 §2.3)
//!
//! ```text
//!   1 ........ 61 | 62 ........................ 61 + len
//!   static table  | dynamic table, newest first
//! ```

use std::collections::VecDeque;

/// Per-entry overhead counted against the table size
pub const ENTRY_OVERHEAD: usize = 32;

pub const STATIC_LEN: usize = 61;

pub static STATIC_TABLE: [(&str, &str); STATIC_LEN] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Size an entry occupies in the dynamic table
pub fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// How a header can be expressed against the tables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    /// Name and value both present at this index
    Full(usize),
    /// Only the name is present
    Name(usize),
    None,
}

/// FIFO dynamic table with size-based eviction
#[derive(Clone, Debug)]
pub struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current occupied size
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the capacity, evicting from the oldest end as needed
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Insert at the front. An entry larger than the table empties it.
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = entry_size(&name, &value);
        if size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - size);
        self.size += size;
        self.entries.push_front((name, value));
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some((name, value)) => self.size -= entry_size(&name, &value),
                None => break,
            }
        }
    }

    /// Resolve a 1-based HPACK index across both tables
    pub fn get(&self, index: usize) -> Option<(&[u8], &[u8])> {
        match index {
            0 => None,
            1..=STATIC_LEN => {
                let (name, value) = STATIC_TABLE[index - 1];
                Some((name.as_bytes(), value.as_bytes()))
            }
            _ => self
                .entries
                .get(index - STATIC_LEN - 1)
                .map(|(n, v)| (n.as_slice(), v.as_slice())),
        }
    }

    /// Best match for a header, preferring full matches then lower indices
    pub fn find(&self, name: &[u8], value: &[u8]) -> Match {
        let mut name_match = None;
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if n.as_bytes() == name {
                if v.as_bytes() == value {
                    return Match::Full(i + 1);
                }
                name_match.get_or_insert(i + 1);
            }
        }
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n.as_slice() == name {
                if v.as_slice() == value {
                    return Match::Full(STATIC_LEN + 1 + i);
                }
                name_match.get_or_insert(STATIC_LEN + 1 + i);
            }
        }
        name_match.map_or(Match::None, Match::Name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lookup() {
        let table = DynamicTable::new(4096);
        assert_eq!(table.get(2), Some((&b":method"[..], &b"GET"[..])));
        assert_eq!(table.get(61).map(|e| e.0), Some(&b"www-authenticate"[..]));
        assert!(table.get(0).is_none());
        assert!(table.get(62).is_none());
        assert_eq!(table.find(b":status", b"404"), Match::Full(13));
        assert_eq!(table.find(b":status", b"418"), Match::Name(8));
        assert_eq!(table.find(b"x-custom", b"1"), Match::None);
    }

    #[test]
    fn test_eviction_order() {
        // Room for two 42-byte entries
        let mut table = DynamicTable::new(90);
        table.insert(b"aaaaa".to_vec(), b"11111".to_vec());
        table.insert(b"bbbbb".to_vec(), b"22222".to_vec());
        assert_eq!(table.get(62).map(|e| e.0), Some(&b"bbbbb"[..]));
        assert_eq!(table.size(), 84);

        table.insert(b"ccccc".to_vec(), b"33333".to_vec());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(63).map(|e| e.0), Some(&b"bbbbb"[..]));

        table.set_max_size(50);
        assert_eq!(table.len(), 1);
        table.insert(vec![b'x'; 100], Vec::new());
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
    }
}
