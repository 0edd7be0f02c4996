//! Read-only data table.
//!
//! A deduplicating store for fixed-size constants (tuple prototypes,
//! format blobs, padded string constants) keyed by their bytes. Unlike
//! the string table, items may contain NUL bytes; each item is padded to
//! an 8-byte boundary so the kernel program can read it with aligned
//! loads. Offsets are stable and [`RoData::write`] serializes items in
//! first-insertion order.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::io::{self, Write};

/// Alignment applied to every item.
const ITEM_ALIGN: usize = 8;

#[derive(Clone, Debug)]
struct Item {
    start: usize,
    len: usize,
    off: u32,
}

/// A deduplicating table of read-only constants.
#[derive(Clone, Default)]
pub struct RoData {
    bytes: Vec<u8>,
    items: Vec<Item>,
    buckets: FxHashMap<u64, SmallVec<[u32; 2]>>,
    max_item: usize,
}

impl RoData {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn hash(data: &[u8]) -> u64 {
        let mut h = BuildHasherDefault::<rustc_hash::FxHasher>::default().build_hasher();
        h.write(data);
        h.finish()
    }

    fn item_bytes(&self, item: &Item) -> &[u8] {
        &self.bytes[item.start..item.start + item.len]
    }

    /// Look up `data` without inserting it.
    pub fn index(&self, data: &[u8]) -> Option<u32> {
        let bucket = self.buckets.get(&Self::hash(data))?;
        bucket
            .iter()
            .map(|&i| &self.items[i as usize])
            .find(|item| self.item_bytes(item) == data)
            .map(|item| item.off)
    }

    /// Insert `data`, returning its offset. Re-inserting existing bytes
    /// returns the prior offset.
    pub fn insert(&mut self, data: &[u8]) -> u32 {
        if let Some(off) = self.index(data) {
            return off;
        }
        let start = self.bytes.len();
        debug_assert_eq!(start % ITEM_ALIGN, 0);
        let off = u32::try_from(start).expect("rodata exceeds 4 GiB");
        self.bytes.extend_from_slice(data);
        while self.bytes.len() % ITEM_ALIGN != 0 {
            self.bytes.push(0);
        }

        let idx = u32::try_from(self.items.len()).unwrap();
        self.items.push(Item {
            start,
            len: data.len(),
            off,
        });
        self.buckets
            .entry(Self::hash(data))
            .or_default()
            .push(idx);
        self.max_item = self.max_item.max(data.len());
        off
    }

    /// The bytes stored at `off`, without padding, if `off` names an
    /// item.
    pub fn get(&self, off: u32) -> Option<&[u8]> {
        let idx = self.items.binary_search_by_key(&off, |i| i.off).ok()?;
        Some(self.item_bytes(&self.items[idx]))
    }

    /// Number of distinct items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total serialized size, padding included.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Size of the largest item, padding excluded.
    pub fn max_item_size(&self) -> usize {
        self.max_item
    }

    /// Serialize to `w`, returning the number of bytes written.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_all(&self.bytes)?;
        Ok(self.bytes.len())
    }

    /// Serialize into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

impl std::fmt::Debug for RoData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RoData({} items, {} bytes)", self.len(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_aligned_and_deduplicated() {
        let mut tab = RoData::new();
        let a = tab.insert(&[1, 2, 3]);
        let b = tab.insert(&[4; 16]);
        let a2 = tab.insert(&[1, 2, 3]);
        assert_eq!(a, 0);
        assert_eq!(b, 8);
        assert_eq!(a, a2);
        assert_eq!(tab.size(), 24);
        assert_eq!(tab.max_item_size(), 16);
    }

    #[test]
    fn get_strips_padding() {
        let mut tab = RoData::new();
        let off = tab.insert(&[9, 9, 9]);
        assert_eq!(tab.get(off), Some(&[9, 9, 9][..]));
        assert_eq!(tab.get(off + 1), None);
    }

    #[test]
    fn nul_bytes_are_fine() {
        let mut tab = RoData::new();
        let off = tab.insert(&[0, 0, 7, 0]);
        assert_eq!(tab.get(off), Some(&[0, 0, 7, 0][..]));
    }
}
