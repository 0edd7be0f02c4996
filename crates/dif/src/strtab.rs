//! Deduplicating string table.
//!
//! Strings are interned once and addressed by a stable 32-bit byte
//! offset. Offset 0 is always a NUL byte, so the empty string is a
//! distinguished value and an unset reference reads back as "".
//!
//! Storage grows in fixed-size chunks so that interned data never moves;
//! offsets handed out are valid for the lifetime of the table. Strings
//! are stored with a terminating NUL, and [`StrTab::write`] serializes
//! the table as one contiguous stream in first-insertion order, which is
//! the layout the kernel-shared string table map expects.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::io::{self, Write};

type Buckets = FxHashMap<u64, SmallVec<[u32; 2]>>;

/// Default chunk size for string storage.
const DEFAULT_CHUNK: usize = 4096;

#[derive(Clone, Debug)]
struct Entry {
    chunk: u32,
    start: u32,
    len: u32,
    off: u32,
}

/// A deduplicating string table with stable offsets.
#[derive(Clone)]
pub struct StrTab {
    chunks: Vec<Vec<u8>>,
    chunk_size: usize,
    entries: Vec<Entry>,
    buckets: Buckets,
    size: usize,
}

impl Default for StrTab {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK)
    }
}

impl StrTab {
    /// Create a table that grows in `chunk_size`-byte chunks. The empty
    /// string is pre-interned at offset 0.
    pub fn new(chunk_size: usize) -> Self {
        let mut tab = Self {
            chunks: Vec::new(),
            chunk_size: chunk_size.max(1),
            entries: Vec::new(),
            buckets: Buckets::default(),
            size: 0,
        };
        tab.insert(b"");
        tab
    }

    fn hash(s: &[u8]) -> u64 {
        let mut h = BuildHasherDefault::<rustc_hash::FxHasher>::default().build_hasher();
        h.write(s);
        h.finish()
    }

    fn entry_bytes(&self, e: &Entry) -> &[u8] {
        let chunk = &self.chunks[e.chunk as usize];
        &chunk[e.start as usize..e.start as usize + e.len as usize]
    }

    /// Look up `s` without inserting it.
    pub fn index(&self, s: &[u8]) -> Option<u32> {
        let bucket = self.buckets.get(&Self::hash(s))?;
        bucket
            .iter()
            .map(|&i| &self.entries[i as usize])
            .find(|e| self.entry_bytes(e) == s)
            .map(|e| e.off)
    }

    /// Intern `s`, returning its offset. Inserting a string that is
    /// already present returns the prior offset.
    pub fn insert(&mut self, s: &[u8]) -> u32 {
        debug_assert!(!s.contains(&0), "interned strings must not contain NUL");
        if let Some(off) = self.index(s) {
            return off;
        }

        // The string is stored NUL-terminated and never spans chunks.
        let need = s.len() + 1;
        let fits = self
            .chunks
            .last()
            .map(|c| c.capacity() - c.len() >= need)
            .unwrap_or(false);
        if !fits {
            self.chunks
                .push(Vec::with_capacity(self.chunk_size.max(need)));
        }

        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let start = chunk.len();
        chunk.extend_from_slice(s);
        chunk.push(0);

        let off = u32::try_from(self.size).expect("string table exceeds 4 GiB");
        let idx = u32::try_from(self.entries.len()).unwrap();
        self.entries.push(Entry {
            chunk: chunk_idx as u32,
            start: start as u32,
            len: s.len() as u32,
            off,
        });
        self.buckets
            .entry(Self::hash(s))
            .or_default()
            .push(idx);
        self.size += need;
        off
    }

    /// Intern a `&str`.
    pub fn insert_str(&mut self, s: &str) -> u32 {
        self.insert(s.as_bytes())
    }

    /// The string stored at `off`, without its NUL terminator, if `off`
    /// is the offset of an interned string.
    pub fn get(&self, off: u32) -> Option<&[u8]> {
        let idx = self
            .entries
            .binary_search_by_key(&off, |e| e.off)
            .ok()?;
        Some(self.entry_bytes(&self.entries[idx]))
    }

    /// Number of distinct strings, including the empty string.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never empty: offset 0 is always occupied.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Total serialized size in bytes, NUL terminators included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Iterate over interned strings in first-insertion order, with
    /// their offsets.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.entries.iter().map(|e| (e.off, self.entry_bytes(e)))
    }

    /// Serialize the table to `w` in first-insertion order, returning
    /// the number of bytes written.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        for chunk in &self.chunks {
            w.write_all(chunk)?;
        }
        Ok(self.size)
    }

    /// Serialize into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size);
        self.write(&mut buf).unwrap();
        buf
    }
}

impl std::fmt::Debug for StrTab {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "StrTab({} strings, {} bytes)", self.len(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_zero_is_the_empty_string() {
        let tab = StrTab::default();
        assert_eq!(tab.index(b""), Some(0));
        assert_eq!(tab.get(0), Some(&b""[..]));
        assert_eq!(tab.size(), 1);
        assert_eq!(tab.to_vec(), vec![0]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut tab = StrTab::default();
        let a = tab.insert(b"probe");
        let b = tab.insert(b"provider");
        let a2 = tab.insert(b"probe");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(tab.len(), 3);
        assert_eq!(tab.size(), 1 + 6 + 9);
    }

    #[test]
    fn serialization_preserves_insertion_order() {
        let mut tab = StrTab::default();
        tab.insert(b"bb");
        tab.insert(b"a");
        assert_eq!(tab.to_vec(), b"\0bb\0a\0");
    }

    #[test]
    fn offsets_survive_chunk_growth() {
        let mut tab = StrTab::new(8);
        let mut offs = Vec::new();
        for i in 0..64 {
            let s = format!("str-{i}");
            offs.push((tab.insert(s.as_bytes()), s));
        }
        for (off, s) in &offs {
            assert_eq!(tab.get(*off), Some(s.as_bytes()));
        }
        // The serialized stream has each string at its offset.
        let bytes = tab.to_vec();
        for (off, s) in &offs {
            let at = *off as usize;
            assert_eq!(&bytes[at..at + s.len()], s.as_bytes());
            assert_eq!(bytes[at + s.len()], 0);
        }
    }

    #[test]
    fn long_string_gets_its_own_chunk() {
        let mut tab = StrTab::new(4);
        let long = vec![b'x'; 100];
        let off = tab.insert(&long);
        assert_eq!(tab.get(off), Some(&long[..]));
    }

    #[test]
    fn index_does_not_mutate() {
        let tab = StrTab::default();
        assert_eq!(tab.index(b"missing"), None);
        assert_eq!(tab.len(), 1);
    }
}
