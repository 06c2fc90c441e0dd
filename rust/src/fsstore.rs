//! A loose-file object store: the bundled, good-enough `Store`
//! implementation this binary actually runs against. The authoritative
//! on-disk object format (compression, fan-out depth, the transaction
//! log) belongs to the real store and is out of scope here; this is
//! only detailed enough to make `pull` do real, verifiable work against
//! a real directory end to end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::content::encode_content_stream;
use crate::digest::{content_checksum, Checksum, ObjectKind, ObjectName};
use crate::error::{PullError, PullResult};
use crate::store::{ContentInput, Store};

pub struct FsStore {
    root: PathBuf,
    transaction_open: AtomicBool,
}

impl FsStore {
    pub fn new(root: PathBuf) -> PullResult<Self> {
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("refs"))?;
        Ok(Self {
            root,
            transaction_open: AtomicBool::new(false),
        })
    }

    fn object_path(&self, kind: ObjectKind, csum: &Checksum) -> PathBuf {
        let hex = csum.to_hex();
        self.root
            .join("objects")
            .join(&hex[..2])
            .join(format!("{}.{}", &hex[2..], kind.as_str()))
    }

    fn ref_path(&self, remote: &str, branch: &str) -> PathBuf {
        self.root.join("refs").join(remote).join(branch)
    }
}

impl Store for FsStore {
    fn has_object(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<bool> {
        Ok(self.object_path(kind, csum).is_file())
    }

    fn load_variant(&self, kind: ObjectKind, csum: &Checksum) -> PullResult<Vec<u8>> {
        std::fs::read(self.object_path(kind, csum)).map_err(PullError::from)
    }

    fn object_relpath(&self, name: &ObjectName) -> String {
        let hex = name.csum.to_hex();
        format!(
            "objects/{}/{}.{}",
            &hex[..2],
            &hex[2..],
            name.kind.as_str()
        )
    }

    fn resolve_rev(&self, refname: &str) -> PullResult<Option<Checksum>> {
        let (remote, branch) = refname
            .split_once('/')
            .ok_or_else(|| PullError::store(format!("malformed ref name {refname:?}")))?;
        let path = self.ref_path(remote, branch);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(Checksum::parse(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stage_metadata(&self, kind: ObjectKind, bytes: Vec<u8>) -> PullResult<Checksum> {
        let csum = content_checksum(&bytes);
        let path = self.object_path(kind, &csum);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        Ok(csum)
    }

    async fn stage_content(&self, input: ContentInput) -> PullResult<Checksum> {
        let csum = content_checksum(&input.payload);
        let path = self.object_path(ObjectKind::File, &csum);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = encode_content_stream(&input);
        tokio::fs::write(&path, &encoded).await?;
        Ok(csum)
    }

    fn prepare_transaction(&self) -> PullResult<()> {
        self.transaction_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn commit_transaction(&self) -> PullResult<()> {
        if !self.transaction_open.swap(false, Ordering::SeqCst) {
            return Err(PullError::store("commit without an open transaction"));
        }
        Ok(())
    }

    fn write_ref(&self, remote: &str, branch: &str, csum: &Checksum) -> PullResult<()> {
        let path = self.ref_path(remote, branch);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, csum.to_hex())?;
        Ok(())
    }
}
