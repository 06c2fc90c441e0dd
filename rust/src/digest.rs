//! Object identities: checksums and the four object kinds they can name.

use std::fmt;

use crate::error::{PullError, PullResult};

/// Width, in bytes, of a checksum. Rendered as a 64-character lowercase hex
/// string wherever it crosses a text boundary (refs, URIs, summary files).
pub const CHECKSUM_LEN: usize = 32;

/// A fixed-length binary digest identifying an object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// Parses a lowercase (or mixed-case) hex string of exactly
    /// `2 * CHECKSUM_LEN` characters.
    pub fn parse(s: &str) -> PullResult<Self> {
        let s = s.trim();
        if s.len() != CHECKSUM_LEN * 2 {
            return Err(PullError::invalid_checksum(s));
        }
        let mut out = [0u8; CHECKSUM_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| PullError::invalid_checksum(s))?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

/// The four object kinds. `Commit`, `DirTree`, and `DirMeta` are metadata
/// (recursively walked); `File` is a content leaf.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObjectKind {
    Commit,
    DirTree,
    DirMeta,
    File,
}

impl ObjectKind {
    /// `type != FILE`.
    pub fn is_meta(self) -> bool {
        !matches!(self, ObjectKind::File)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::DirTree => "dirtree",
            ObjectKind::DirMeta => "dirmeta",
            ObjectKind::File => "file",
        }
    }
}

/// `(checksum, type)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectName {
    pub csum: Checksum,
    pub kind: ObjectKind,
}

impl ObjectName {
    pub fn new(csum: Checksum, kind: ObjectKind) -> Self {
        Self { csum, kind }
    }

    pub fn commit(csum: Checksum) -> Self {
        Self::new(csum, ObjectKind::Commit)
    }

    pub fn dir_tree(csum: Checksum) -> Self {
        Self::new(csum, ObjectKind::DirTree)
    }

    pub fn dir_meta(csum: Checksum) -> Self {
        Self::new(csum, ObjectKind::DirMeta)
    }

    pub fn file(csum: Checksum) -> Self {
        Self::new(csum, ObjectKind::File)
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.csum, self.kind.as_str())
    }
}

/// Computes the checksum the (out-of-scope) real object store would
/// authoritatively assign to a body of bytes. The real store's hash
/// algorithm and on-disk encoding are external to this engine; this
/// stand-in is only used by the bundled loose-file store and by tests,
/// and is good enough to dedup and round-trip.
pub fn content_checksum(bytes: &[u8]) -> Checksum {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    let lo = hasher.finish();
    hasher.write_u8(0xff);
    bytes.hash(&mut hasher);
    let hi = hasher.finish();

    let mut out = [0u8; CHECKSUM_LEN];
    out[0..8].copy_from_slice(&lo.to_le_bytes());
    out[8..16].copy_from_slice(&hi.to_le_bytes());
    out[16..24].copy_from_slice(&lo.to_be_bytes());
    out[24..32].copy_from_slice(&hi.to_be_bytes());
    Checksum::from_bytes(out)
}

/// Validates a file/dir name per spec: non-empty, no `/` or NUL, not `.`/`..`.
pub fn validate_name(name: &str) -> PullResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(PullError::invalid_filename(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips_through_hex() {
        let bytes = [0x5au8; CHECKSUM_LEN];
        let csum = Checksum::from_bytes(bytes);
        let hex = csum.to_hex();
        assert_eq!(hex.len(), CHECKSUM_LEN * 2);
        let parsed = Checksum::parse(&hex).unwrap();
        assert_eq!(parsed, csum);
    }

    #[test]
    fn checksum_rejects_wrong_length() {
        assert!(Checksum::parse("deadbeef").is_err());
    }

    #[test]
    fn checksum_rejects_non_hex() {
        let bad = "z".repeat(CHECKSUM_LEN * 2);
        assert!(Checksum::parse(&bad).is_err());
    }

    #[test]
    fn names_rejected() {
        for bad in ["", ".", "..", "a/b", "a\0b"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn ordinary_names_accepted() {
        for good in ["a", "file.txt", "..hidden", "a..b"] {
            assert!(validate_name(good).is_ok(), "{good:?} should be accepted");
        }
    }
}
