//! Contract for the local content-addressed object store. The store itself
//! (on-disk format, transaction log, hashing) is an external collaborator;
//! the pull engine only needs this narrow surface.

use std::future::Future;

use crate::digest::{Checksum, ObjectKind, ObjectName};
use crate::error::PullResult;

/// A parsed content body ready for staging: the payload plus the sidecar
/// metadata the store records alongside it (spec: "splitting payload,
/// file-info, and extended attributes").
pub struct ContentInput {
    pub payload: Vec<u8>,
    pub file_info: FileInfo,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    pub mode: u32,
    pub mtime: Option<u64>,
}

/// The local object store's contract. Implementations must be safe to call
/// from the Scan Worker's dedicated OS thread (the sync methods) and to
/// drive from the Main Loop's async task (the staging methods).
pub trait Store: Send + Sync + 'static {
    /// Whether `(kind, csum)` is already present locally.
    fn has_object(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<bool>;

    /// Loads and returns the raw bytes of a locally-stored metadata
    /// object, for the Scan Worker to parse.
    fn load_variant(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<Vec<u8>>;

    /// The store's canonical relative path for an object, used to build
    /// the remote fetch URI. The remote must publish objects under this
    /// same layout.
    fn object_relpath(&self, name: &ObjectName) -> String;

    fn resolve_rev(&self, refname: &str) -> PullResult<Option<Checksum>>;

    /// Stages a freshly-fetched metadata object body. Returns the
    /// checksum the store computed over the bytes, which the caller must
    /// verify equals the checksum it expected.
    fn stage_metadata(
        &self,
        kind: ObjectKind,
        bytes: Vec<u8>,
    ) -> impl Future<Output = PullResult<Checksum>> + Send;

    /// Stages a freshly-fetched content object.
    fn stage_content(
        &self,
        input: ContentInput,
    ) -> impl Future<Output = PullResult<Checksum>> + Send;

    fn prepare_transaction(&self) -> PullResult<()>;
    fn commit_transaction(&self) -> PullResult<()>;

    fn write_ref(&self, remote: &str, branch: &str, csum: &Checksum) -> PullResult<()>;
}
