//! In-process fakes for the two external collaborators (store, fetcher),
//! shared by unit and integration tests across the crate. Not part of the
//! public API; compiled only under `#[cfg(test)]`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::digest::{content_checksum as checksum_of, Checksum, ObjectKind, ObjectName};
use crate::error::{PullError, PullResult};
use crate::fetcher::{Fetcher, TempFile};
use crate::records::{encode_commit, encode_dir_tree, CommitRecord, DirTreeRecord};
use crate::store::{ContentInput, FileInfo, Store};

#[derive(Default)]
struct StoreState {
    objects: HashMap<(ObjectKind, Checksum), Vec<u8>>,
    refs: HashMap<String, Checksum>,
    transaction_open: bool,
}

pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn put_metadata(&self, kind: ObjectKind, csum: Checksum, bytes: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind, csum), bytes);
    }

    pub fn ref_value(&self, key: &str) -> Option<Checksum> {
        self.state.lock().unwrap().refs.get(key).copied()
    }

    fn put_empty_dir_tree(&self) -> Checksum {
        let rec = DirTreeRecord {
            files: vec![],
            dirs: vec![],
        };
        let bytes = encode_dir_tree(&rec);
        let csum = checksum_of(&bytes);
        self.put_metadata(ObjectKind::DirTree, csum, bytes);
        csum
    }

    fn put_empty_dir_meta(&self) -> Checksum {
        let bytes = vec![crate::records::DIR_META_TAG];
        let csum = checksum_of(&bytes);
        self.put_metadata(ObjectKind::DirMeta, csum, bytes);
        csum
    }

    /// A commit C0 with tree T0 (one file F) and meta M0; T0 and M0 are
    /// stored, C0 is stored, F is not (so it is the only thing left to
    /// fetch once C0's closure is scanned).
    pub fn seed_commit_with_one_file(&self, filename: &str, content: &[u8]) -> (Checksum, Checksum) {
        let file_csum = checksum_of(content);
        let tree_rec = DirTreeRecord {
            files: vec![(filename.to_string(), file_csum)],
            dirs: vec![],
        };
        let tree_bytes = encode_dir_tree(&tree_rec);
        let tree_csum = checksum_of(&tree_bytes);
        self.put_metadata(ObjectKind::DirTree, tree_csum, tree_bytes);

        let meta_csum = self.put_empty_dir_meta();

        let commit_rec = CommitRecord {
            tree_contents_csum: tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let commit_bytes = encode_commit(&commit_rec);
        let commit_csum = checksum_of(&commit_bytes);
        self.put_metadata(ObjectKind::Commit, commit_csum, commit_bytes);

        (commit_csum, file_csum)
    }

    /// A chain of `depth` nested, fully-stored dir-trees under a single
    /// stored commit, to exercise the recursion ceiling.
    pub fn seed_commit_chain(&self, depth: usize) -> Checksum {
        let mut current_tree = self.put_empty_dir_tree();
        let leaf_meta = self.put_empty_dir_meta();
        for i in 0..depth {
            let rec = DirTreeRecord {
                files: vec![],
                dirs: vec![(format!("lvl{i}"), current_tree, leaf_meta)],
            };
            let bytes = encode_dir_tree(&rec);
            let csum = checksum_of(&bytes);
            self.put_metadata(ObjectKind::DirTree, csum, bytes);
            current_tree = csum;
        }

        let meta_csum = self.put_empty_dir_meta();
        let commit_rec = CommitRecord {
            tree_contents_csum: current_tree,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let commit_bytes = encode_commit(&commit_rec);
        let commit_csum = checksum_of(&commit_bytes);
        self.put_metadata(ObjectKind::Commit, commit_csum, commit_bytes);
        commit_csum
    }

    /// A commit whose tree lists a file with an invalid name.
    pub fn seed_commit_with_bad_filename(&self) -> Checksum {
        let file_csum = checksum_of(b"doesn't matter");
        let tree_rec = DirTreeRecord {
            files: vec![("a/b".to_string(), file_csum)],
            dirs: vec![],
        };
        let tree_bytes = encode_dir_tree(&tree_rec);
        let tree_csum = checksum_of(&tree_bytes);
        self.put_metadata(ObjectKind::DirTree, tree_csum, tree_bytes);

        let meta_csum = self.put_empty_dir_meta();
        let commit_rec = CommitRecord {
            tree_contents_csum: tree_csum,
            tree_meta_csum: meta_csum,
            related: vec![],
        };
        let commit_bytes = encode_commit(&commit_rec);
        let commit_csum = checksum_of(&commit_bytes);
        self.put_metadata(ObjectKind::Commit, commit_csum, commit_bytes);
        commit_csum
    }

    /// A head commit with one `related` commit, both fully stored.
    pub fn seed_commit_with_related(&self) -> (Checksum, Checksum) {
        let related_tree = self.put_empty_dir_tree();
        let related_meta = self.put_empty_dir_meta();
        let related_rec = CommitRecord {
            tree_contents_csum: related_tree,
            tree_meta_csum: related_meta,
            related: vec![],
        };
        let related_bytes = encode_commit(&related_rec);
        let related_csum = checksum_of(&related_bytes);
        self.put_metadata(ObjectKind::Commit, related_csum, related_bytes);

        let head_tree = self.put_empty_dir_tree();
        let head_meta = self.put_empty_dir_meta();
        let head_rec = CommitRecord {
            tree_contents_csum: head_tree,
            tree_meta_csum: head_meta,
            related: vec![("prev".to_string(), related_csum)],
        };
        let head_bytes = encode_commit(&head_rec);
        let head_csum = checksum_of(&head_bytes);
        self.put_metadata(ObjectKind::Commit, head_csum, head_bytes);

        (head_csum, related_csum)
    }
}

impl Store for FakeStore {
    fn has_object(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<bool> {
        Ok(self.state.lock().unwrap().objects.contains_key(&(kind, *csum)))
    }

    fn load_variant(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, *csum))
            .cloned()
            .ok_or_else(|| PullError::store(format!("no such object {:?}/{csum}", kind)))
    }

    fn object_relpath(&self, name: &ObjectName) -> String {
        format!("objects/{}/{}.{}", &name.csum.to_hex()[..2], &name.csum.to_hex()[2..], name.kind.as_str())
    }

    fn resolve_rev(&self, refname: &str) -> PullResult<Option<Checksum>> {
        Ok(self.state.lock().unwrap().refs.get(refname).copied())
    }

    async fn stage_metadata(&self, kind: ObjectKind, bytes: Vec<u8>) -> PullResult<Checksum> {
        let csum = checksum_of(&bytes);
        self.put_metadata(kind, csum, bytes);
        Ok(csum)
    }

    async fn stage_content(&self, input: ContentInput) -> PullResult<Checksum> {
        let csum = checksum_of(&input.payload);
        self.put_metadata(ObjectKind::File, csum, input.payload);
        Ok(csum)
    }

    fn prepare_transaction(&self) -> PullResult<()> {
        self.state.lock().unwrap().transaction_open = true;
        Ok(())
    }

    fn commit_transaction(&self) -> PullResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.transaction_open {
            return Err(PullError::store("commit without an open transaction"));
        }
        state.transaction_open = false;
        Ok(())
    }

    fn write_ref(&self, remote: &str, branch: &str, csum: &Checksum) -> PullResult<()> {
        let key = format!("{remote}/{branch}");
        self.state.lock().unwrap().refs.insert(key, *csum);
        Ok(())
    }
}

/// Scripted fetcher: returns canned bytes for known URIs, or a network
/// error for anything else (or anything marked as poisoned).
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    poisoned: Mutex<std::collections::HashSet<String>>,
    bytes_transferred: AtomicU64,
    spool_dir: std::path::PathBuf,
    next_id: AtomicU64,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeFetcher {
    pub fn new(spool_dir: std::path::PathBuf) -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(std::collections::HashSet::new()),
            bytes_transferred: AtomicU64::new(0),
            spool_dir,
            next_id: AtomicU64::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn serve(&self, uri: impl Into<String>, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(uri.into(), body);
    }

    /// Makes a previously-served URI fail on next fetch (simulates a
    /// corrupted/broken transfer or a network failure).
    pub fn poison(&self, uri: impl Into<String>) {
        self.poisoned.lock().unwrap().insert(uri.into());
    }

    /// Number of times `request_uri` was called for `uri`, for dedup
    /// assertions (a shared file must be fetched exactly once).
    pub fn call_count(&self, uri: &str) -> u32 {
        self.calls.lock().unwrap().get(uri).copied().unwrap_or(0)
    }
}

impl Fetcher for FakeFetcher {
    fn request_uri(
        &self,
        uri: String,
        _cancel: CancellationToken,
    ) -> impl Future<Output = PullResult<TempFile>> + Send {
        *self.calls.lock().unwrap().entry(uri.clone()).or_insert(0) += 1;
        let body = self.bodies.lock().unwrap().get(&uri).cloned();
        let poisoned = self.poisoned.lock().unwrap().contains(&uri);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self.spool_dir.join(format!("fake-{id}.tmp"));
        let len = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        self.bytes_transferred.fetch_add(len, Ordering::Relaxed);
        async move {
            if poisoned {
                return Err(PullError::store(format!("poisoned fetch: {uri}")));
            }
            let Some(body) = body else {
                return Err(PullError::store(format!("no such uri in fake fetcher: {uri}")));
            };
            tokio::fs::write(&path, &body).await?;
            Ok(TempFile::new(path))
        }
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    fn state_summary(&self) -> String {
        "fake fetcher".to_string()
    }
}

pub fn dummy_file_info() -> FileInfo {
    FileInfo {
        mode: 0o644,
        mtime: None,
    }
}
