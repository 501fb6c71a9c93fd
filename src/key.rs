//! `Key`: a pair of byte strings `(k1, k2)` called "row" and "column"
//! (spec §3). Grounded in `kelpie::Key` — wildcard matching, the
//! `pup`/unpup binary packing, and the 255-byte wire limit all mirror
//! `Key.cpp` exactly.
use std::cmp::Ordering;
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Wire limit for either key component (spec §3: "Each string is
/// bounded at 255 bytes when transported").
pub const MAX_KEY_BYTES: usize = 255;

#[derive(Debug, Clone, Default, Eq)]
pub struct Key {
    k1: Vec<u8>,
    k2: Vec<u8>,
}

impl Key {
    pub fn new(k1: impl Into<Vec<u8>>) -> Self {
        Key { k1: k1.into(), k2: Vec::new() }
    }

    pub fn with_column(k1: impl Into<Vec<u8>>, k2: impl Into<Vec<u8>>) -> Self {
        Key { k1: k1.into(), k2: k2.into() }
    }

    pub fn k1(&self) -> &[u8] {
        &self.k1
    }

    pub fn k2(&self) -> &[u8] {
        &self.k2
    }

    pub fn k1_str(&self) -> String {
        String::from_utf8_lossy(&self.k1).into_owned()
    }

    pub fn k2_str(&self) -> String {
        String::from_utf8_lossy(&self.k2).into_owned()
    }

    /// A valid key must at least have a row name.
    pub fn is_valid(&self) -> bool {
        !self.k1.is_empty()
    }

    pub fn is_row_wildcard(&self) -> bool {
        ends_with_star(&self.k1)
    }

    pub fn is_col_wildcard(&self) -> bool {
        ends_with_star(&self.k2)
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_row_wildcard() || self.is_col_wildcard()
    }

    /// Power-user match: caller has already stripped the trailing `*`
    /// and decided which side is a prefix match, mirroring
    /// `Key::matchesPrefixString`.
    pub fn matches_prefix(&self, row_is_prefix: bool, row_match: &[u8], col_is_prefix: bool, col_match: &[u8]) -> bool {
        if row_is_prefix {
            if !row_match.is_empty() && !self.k1.starts_with(row_match) {
                return false;
            }
        } else if self.k1 != row_match {
            return false;
        }

        if col_is_prefix {
            if !col_match.is_empty() && !self.k2.starts_with(col_match) {
                return false;
            }
        } else if self.k2 != col_match {
            return false;
        }
        true
    }

    /// Match against a wildcard pattern key (row/col may each end in `*`).
    pub fn matches(&self, pattern: &Key) -> bool {
        let row_is_wild = ends_with_star(&pattern.k1);
        let col_is_wild = ends_with_star(&pattern.k2);
        let row_prefix = if row_is_wild { &pattern.k1[..pattern.k1.len() - 1] } else { &pattern.k1[..] };
        let col_prefix = if col_is_wild { &pattern.k2[..pattern.k2.len() - 1] } else { &pattern.k2[..] };
        self.matches_prefix(row_is_wild, row_prefix, col_is_wild, col_prefix)
    }

    pub fn k1_size(&self) -> usize {
        self.k1.len()
    }

    pub fn k2_size(&self) -> usize {
        self.k2.len()
    }

    /// Pack into `k1 ‖ k2 ‖ len(k1):u8 ‖ len(k2):u8`, matching
    /// `Key::pup()`. Fails if either string exceeds 255 bytes.
    pub fn pup(&self) -> Result<Vec<u8>> {
        if self.k1.len() > MAX_KEY_BYTES || self.k2.len() > MAX_KEY_BYTES {
            return Err(ProtocolError::KeyTooLong.into());
        }
        let mut out = Vec::with_capacity(self.k1.len() + self.k2.len() + 2);
        out.extend_from_slice(&self.k1);
        out.extend_from_slice(&self.k2);
        out.push(self.k1.len() as u8);
        out.push(self.k2.len() as u8);
        Ok(out)
    }

    /// Reverse of `pup`: read the two trailing length bytes, then slice
    /// the preceding bytes out.
    pub fn unpup(packed: &[u8]) -> Result<Key> {
        if packed.len() < 2 {
            return Err(ProtocolError::BadRpc("packed key shorter than its own length header").into());
        }
        let k2_len = packed[packed.len() - 1] as usize;
        let k1_len = packed[packed.len() - 2] as usize;
        if k1_len + k2_len + 2 > packed.len() {
            return Err(ProtocolError::BadRpc("packed key length header overruns buffer").into());
        }
        Ok(Key {
            k1: packed[..k1_len].to_vec(),
            k2: packed[k1_len..k1_len + k2_len].to_vec(),
        })
    }
}

fn ends_with_star(s: &[u8]) -> bool {
    s.last() == Some(&b'*')
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.k1 == other.k1 && self.k2 == other.k2
    }
}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.k1.hash(state);
        self.k2.hash(state);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    // lexicographic on (k1, k2), per spec §3
    fn cmp(&self, other: &Self) -> Ordering {
        self.k1.cmp(&other.k1).then_with(|| self.k2.cmp(&other.k2))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.k1_str(), self.k2_str())
    }
}

impl From<&str> for Key {
    fn from(k1: &str) -> Self {
        Key::new(k1.as_bytes().to_vec())
    }
}

impl From<(&str, &str)> for Key {
    fn from((k1, k2): (&str, &str)) -> Self {
        Key::with_column(k1.as_bytes().to_vec(), k2.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pup_unpup_roundtrip() {
        let key = Key::with_column("row", "col");
        let packed = key.pup().unwrap();
        let back = Key::unpup(&packed).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn pup_unpup_roundtrip_empty_column() {
        let key = Key::new("row_only");
        let packed = key.pup().unwrap();
        let back = Key::unpup(&packed).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn rejects_oversize_components() {
        let big = vec![b'a'; 256];
        let key = Key::new(big);
        assert!(key.pup().is_err());
    }

    #[test]
    fn sorts_lexicographically() {
        let mut keys = vec![Key::with_column("b", "x"), Key::with_column("a", "z"), Key::with_column("a", "a")];
        keys.sort();
        assert_eq!(keys, vec![Key::with_column("a", "a"), Key::with_column("a", "z"), Key::with_column("b", "x")]);
    }

    #[test]
    fn row_wildcard_matches_prefix() {
        let pattern: Key = ("r*", "").into();
        assert!(Key::with_column("row1", "c").matches(&pattern));
        assert!(!Key::with_column("other", "c").matches(&pattern));
    }

    #[test]
    fn col_wildcard_within_row() {
        let pattern: Key = ("row", "*").into();
        assert!(Key::with_column("row", "c1").matches(&pattern));
        assert!(!Key::with_column("row2", "c1").matches(&pattern));
    }
}
