//! Flyweight strings and the string lookup table
//!
//! Every identifier-like string in lemonscript (function names, variable
//! names, labels, string literals) is interned. The 64-bit Murmur2 hash of
//! the string is its primary identity: once interned, all comparisons and
//! lookups go by hash, never by content.
//!
//! Two pieces live here:
//! - [`FlyweightString`]: a cheap-to-clone string handle carrying its hash.
//! - [`StringLookup`]: the hash-to-string table used by modules and the
//!   runtime, a fixed-size open bucket array with chained overflow entries.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Seed used for all Murmur2 hashing in lemonscript.
pub const MURMUR2_SEED: u64 = 0xe17a_1465;

/// MurmurHash64A over the given bytes with the lemonscript seed.
///
/// This hash is the identity of every interned string; it also keys string
/// values on the VM stack (a string-typed stack cell holds only this hash).
pub fn murmur2_64(data: &[u8]) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h: u64 = MURMUR2_SEED ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u64 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k |= (byte as u64) << (i * 8);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Interned string handle: the text plus its precomputed Murmur2 hash.
///
/// Cloning is cheap (`Arc`). Equality and hashing use only the 64-bit hash;
/// after interning, hash equality is string equality by convention.
#[derive(Clone)]
pub struct FlyweightString {
    hash: u64,
    text: Arc<str>,
}

impl FlyweightString {
    pub fn new(text: &str) -> Self {
        FlyweightString {
            hash: murmur2_64(text.as_bytes()),
            text: Arc::from(text),
        }
    }

    /// Build from already-known hash and text, e.g. when deserializing a
    /// string table that stores both.
    pub fn from_parts(hash: u64, text: &str) -> Self {
        FlyweightString {
            hash,
            text: Arc::from(text),
        }
    }

    pub fn empty() -> Self {
        FlyweightString::new("")
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl PartialEq for FlyweightString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for FlyweightString {}

impl Hash for FlyweightString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for FlyweightString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlyweightString({:?}, {:#018x})", self.as_str(), self.hash)
    }
}

impl fmt::Display for FlyweightString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for FlyweightString {
    fn from(s: &str) -> Self {
        FlyweightString::new(s)
    }
}

/// A string stored inside a [`StringLookup`].
#[derive(Debug)]
pub struct StoredString {
    hash: u64,
    text: Box<str>,
}

impl StoredString {
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

struct TableEntry {
    string: StoredString,
    next: Option<Box<TableEntry>>,
}

/// Hash-to-string table with a fixed bucket array and chained overflow.
///
/// The bucket index is the low bits of the hash. Entries are never removed;
/// adding a string whose hash is already present is a no-op returning the
/// stored entry. This is the table behind the runtime's string resolution
/// and the module's string literal storage.
pub struct StringLookup {
    table: Vec<Option<Box<TableEntry>>>,
    num_entries: usize,
}

impl StringLookup {
    const TABLE_SIZE: usize = 0x800;
    const TABLE_BITMASK: u64 = (Self::TABLE_SIZE as u64) - 1;

    pub fn new() -> Self {
        let mut table = Vec::new();
        table.resize_with(Self::TABLE_SIZE, || None);
        StringLookup {
            table,
            num_entries: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.table {
            *bucket = None;
        }
        self.num_entries = 0;
    }

    pub fn get_by_hash(&self, hash: u64) -> Option<&StoredString> {
        let mut entry = self.table[(hash & Self::TABLE_BITMASK) as usize].as_deref();
        while let Some(e) = entry {
            if e.string.hash == hash {
                return Some(&e.string);
            }
            entry = e.next.as_deref();
        }
        None
    }

    pub fn contains_hash(&self, hash: u64) -> bool {
        self.get_by_hash(hash).is_some()
    }

    /// Intern a string, returning its hash. Idempotent.
    pub fn add(&mut self, text: &str) -> u64 {
        let hash = murmur2_64(text.as_bytes());
        self.add_with_hash(text, hash);
        hash
    }

    /// Intern a string under an externally computed hash.
    pub fn add_with_hash(&mut self, text: &str, hash: u64) -> &StoredString {
        let index = (hash & Self::TABLE_BITMASK) as usize;

        // Walk the chain first; an existing entry wins.
        let mut exists = false;
        {
            let mut entry = self.table[index].as_deref();
            while let Some(e) = entry {
                if e.string.hash == hash {
                    exists = true;
                    break;
                }
                entry = e.next.as_deref();
            }
        }

        if !exists {
            let old_head = self.table[index].take();
            self.table[index] = Some(Box::new(TableEntry {
                string: StoredString {
                    hash,
                    text: Box::from(text),
                },
                next: old_head,
            }));
            self.num_entries += 1;
            return &self.table[index].as_deref().expect("just inserted").string;
        }

        // Re-walk to return the found entry (keeps the borrow checker happy).
        let mut entry = self.table[index].as_deref();
        while let Some(e) = entry {
            if e.string.hash == hash {
                return &e.string;
            }
            entry = e.next.as_deref();
        }
        unreachable!("entry existed a moment ago")
    }

    /// Merge all entries of another lookup into this one.
    pub fn add_from_lookup(&mut self, other: &StringLookup) {
        for string in other.iter() {
            self.add_with_hash(string.as_str(), string.hash());
        }
    }

    /// Iterate over all stored strings, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredString> {
        self.table.iter().flat_map(|bucket| {
            let mut entries = Vec::new();
            let mut entry = bucket.as_deref();
            while let Some(e) = entry {
                entries.push(&e.string);
                entry = e.next.as_deref();
            }
            entries
        })
    }
}

impl Default for StringLookup {
    fn default() -> Self {
        StringLookup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur2_deterministic() {
        let a = murmur2_64(b"setup.objectA");
        let b = murmur2_64(b"setup.objectA");
        let c = murmur2_64(b"setup.objectB");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_murmur2_tail_lengths() {
        // Exercise every tail length of the 8-byte block loop.
        let base = b"abcdefghijklmnop";
        let mut seen = std::collections::HashSet::new();
        for len in 0..=base.len() {
            assert!(seen.insert(murmur2_64(&base[..len])), "collision at len {}", len);
        }
    }

    #[test]
    fn test_flyweight_equality_by_hash() {
        let a = FlyweightString::new("playerSpeed");
        let b = FlyweightString::new("playerSpeed");
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.as_str(), "playerSpeed");
    }

    #[test]
    fn test_lookup_idempotent_intern() {
        let mut lookup = StringLookup::new();
        let h1 = lookup.add("frameCounter");
        let h2 = lookup.add("frameCounter");
        assert_eq!(h1, h2);
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.get_by_hash(h1).unwrap().as_str(), "frameCounter");
    }

    #[test]
    fn test_lookup_chained_buckets() {
        // Force many entries so chains definitely form.
        let mut lookup = StringLookup::new();
        let mut hashes = Vec::new();
        for i in 0..5000 {
            hashes.push(lookup.add(&format!("name_{}", i)));
        }
        assert_eq!(lookup.len(), 5000);
        for (i, hash) in hashes.iter().enumerate() {
            let stored = lookup.get_by_hash(*hash).expect("entry present");
            assert_eq!(stored.as_str(), format!("name_{}", i));
        }
    }

    #[test]
    fn test_lookup_missing_hash() {
        let lookup = StringLookup::new();
        assert!(lookup.get_by_hash(0x1234).is_none());
    }

    #[test]
    fn test_add_from_lookup() {
        let mut a = StringLookup::new();
        a.add("one");
        a.add("two");
        let mut b = StringLookup::new();
        b.add("two");
        b.add("three");
        a.add_from_lookup(&b);
        assert_eq!(a.len(), 3);
        assert!(a.contains_hash(murmur2_64(b"three")));
    }
}
