//! Field-wise parsing of the metadata object bodies the pull engine needs
//! to interpret: commit and dir-tree records. Dir-meta is an opaque leaf
//! and has no fields the engine cares about.
//!
//! Wire format (a small tagged, length-prefixed binary layout; the
//! authoritative on-disk encoding belongs to the store, this is only the
//! subset of fields the pull engine reads off the wire):
//!
//! ```text
//! commit record:
//!   u8       tag (0x01)
//!   [u8; 32] tree_contents_csum
//!   [u8; 32] tree_meta_csum
//!   u32 LE   related_count
//!   related_count * { u16 LE name_len, name bytes (utf8), [u8; 32] csum }
//!
//! dir-tree record:
//!   u8       tag (0x02)
//!   u32 LE   files_count
//!   files_count * { u16 LE name_len, name bytes (utf8), [u8; 32] file_csum }
//!   u32 LE   dirs_count
//!   dirs_count * { u16 LE name_len, name bytes (utf8), [u8; 32] tree_csum, [u8; 32] meta_csum }
//! ```

use crate::digest::{Checksum, CHECKSUM_LEN};
use crate::error::{PullError, PullResult};

pub const COMMIT_TAG: u8 = 0x01;
pub const DIR_TREE_TAG: u8 = 0x02;
pub const DIR_META_TAG: u8 = 0x03;

pub struct CommitRecord {
    pub tree_contents_csum: Checksum,
    pub tree_meta_csum: Checksum,
    pub related: Vec<(String, Checksum)>,
}

pub struct DirTreeRecord {
    pub files: Vec<(String, Checksum)>,
    pub dirs: Vec<(String, Checksum, Checksum)>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> PullResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(PullError::MalformedCommit(format!(
                "truncated while reading {what}"
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> PullResult<u8> {
        Ok(self.take(1, "tag")?[0])
    }

    fn u16(&mut self) -> PullResult<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> PullResult<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn checksum(&mut self) -> PullResult<Checksum> {
        let b = self.take(CHECKSUM_LEN, "checksum")?;
        let mut arr = [0u8; CHECKSUM_LEN];
        arr.copy_from_slice(b);
        Ok(Checksum::from_bytes(arr))
    }

    fn name(&mut self) -> PullResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len, "name")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| PullError::MalformedCommit(format!("non-utf8 name: {e}")))
    }
}

pub fn parse_commit(bytes: &[u8]) -> PullResult<CommitRecord> {
    let mut c = Cursor::new(bytes);
    let tag = c.u8()?;
    if tag != COMMIT_TAG {
        return Err(PullError::MalformedCommit(format!(
            "unexpected tag {tag:#x}, expected commit tag"
        )));
    }
    let tree_contents_csum = c.checksum()?;
    let tree_meta_csum = c.checksum()?;
    let related_count = c.u32()?;
    let mut related = Vec::with_capacity(related_count as usize);
    for _ in 0..related_count {
        let name = c.name()?;
        let csum = c.checksum()?;
        related.push((name, csum));
    }
    Ok(CommitRecord {
        tree_contents_csum,
        tree_meta_csum,
        related,
    })
}

pub fn parse_dir_tree(bytes: &[u8]) -> PullResult<DirTreeRecord> {
    let mut c = Cursor::new(bytes);
    let tag = c.u8()?;
    if tag != DIR_TREE_TAG {
        return Err(PullError::MalformedDirTree(format!(
            "unexpected tag {tag:#x}, expected dir-tree tag"
        )));
    }
    let files_count = c.u32()?;
    let mut files = Vec::with_capacity(files_count as usize);
    for _ in 0..files_count {
        let name = c.name()?;
        let csum = c.checksum()?;
        files.push((name, csum));
    }
    let dirs_count = c.u32()?;
    let mut dirs = Vec::with_capacity(dirs_count as usize);
    for _ in 0..dirs_count {
        let name = c.name()?;
        let tree_csum = c.checksum()?;
        let meta_csum = c.checksum()?;
        dirs.push((name, tree_csum, meta_csum));
    }
    Ok(DirTreeRecord { files, dirs })
}

/// Encodes a commit record. Used by tests and by any in-process fake store
/// that needs to produce fixture objects.
pub fn encode_commit(rec: &CommitRecord) -> Vec<u8> {
    let mut out = vec![COMMIT_TAG];
    out.extend_from_slice(rec.tree_contents_csum.as_bytes());
    out.extend_from_slice(rec.tree_meta_csum.as_bytes());
    out.extend_from_slice(&(rec.related.len() as u32).to_le_bytes());
    for (name, csum) in &rec.related {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(csum.as_bytes());
    }
    out
}

pub fn encode_dir_tree(rec: &DirTreeRecord) -> Vec<u8> {
    let mut out = vec![DIR_TREE_TAG];
    out.extend_from_slice(&(rec.files.len() as u32).to_le_bytes());
    for (name, csum) in &rec.files {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(csum.as_bytes());
    }
    out.extend_from_slice(&(rec.dirs.len() as u32).to_le_bytes());
    for (name, tree_csum, meta_csum) in &rec.dirs {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(tree_csum.as_bytes());
        out.extend_from_slice(meta_csum.as_bytes());
    }
    out
}
